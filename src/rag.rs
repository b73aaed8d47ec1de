//! Chat RAG sobre el historial de detecciones.
//!
//! Flujo de un turno:
//!   1. Se clasifica la consulta (dominio o general) por palabras clave.
//!   2. Si el índice de la sesión está caducado se reconstruye.
//!   3. En modo dominio: búsqueda vectorial + últimas detecciones crudas.
//!   4. El LLM responde con el historial completo de la conversación.
//!   5. Se antepone un emoji a la respuesta (sólo modo dominio).
//!   6. Se añaden a la conversación la pregunta y la respuesta.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::{
    config::RagSettings,
    detection_store::{self, DetectionSource},
    llm::{ChatBackend, Embedder},
    models::ConversationTurn,
    session::Session,
    vector_store::{self, IndexSnapshot, RebuildOutcome},
};

/// Palabras que envían una consulta al modo dominio.
pub const DOMAIN_KEYWORDS: [&str; 7] =
    ["helmet", "accident", "detection", "ride", "crash", "logs", "safety"];

const DOMAIN_SYSTEM_PROMPT: &str = "You are SafeRideAI assistant. Answer queries about helmet/accident detections in a friendly, helpful tone.";
const GENERAL_SYSTEM_PROMPT: &str =
    "You are SafeRideAI assistant. Answer in a friendly, conversational way.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    Domain,
    General,
}

/// Cualquier palabra clave contenida en la consulta (sin distinguir mayúsculas)
/// la clasifica como de dominio, aunque aparezca de pasada.
pub fn classify(query: &str) -> QueryMode {
    let lowered = query.to_lowercase();
    if DOMAIN_KEYWORDS.iter().any(|kw| lowered.contains(kw)) {
        QueryMode::Domain
    } else {
        QueryMode::General
    }
}

pub fn system_prompt(mode: QueryMode) -> &'static str {
    match mode {
        QueryMode::Domain => DOMAIN_SYSTEM_PROMPT,
        QueryMode::General => GENERAL_SYSTEM_PROMPT,
    }
}

/// Antepone un emoji a la respuesta en modo dominio. Gana la primera regla:
/// "accident" → 🚨, "helmet" → 🪖, "no"/"none"/"zero" → ✅.
pub fn annotate(reply: &str, mode: QueryMode) -> String {
    if mode != QueryMode::Domain {
        return reply.to_string();
    }
    let lowered = reply.to_lowercase();
    let prefix = if lowered.contains("accident") {
        Some("🚨")
    } else if lowered.contains("helmet") {
        Some("🪖")
    } else if ["no", "none", "zero"].iter().any(|w| lowered.contains(w)) {
        Some("✅")
    } else {
        None
    };
    match prefix {
        Some(emoji) => format!("{emoji} {reply}"),
        None => reply.to_string(),
    }
}

/// Los dos bloques de contexto de una consulta de dominio.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievedContext {
    /// Frases más cercanas, una por línea, de menor a mayor distancia.
    pub semantic: String,
    /// Últimas detecciones como lista con viñetas.
    pub recent: String,
    pub semantic_hits: usize,
}

impl RetrievedContext {
    /// Contenido del mensaje de usuario que se envía al LLM.
    pub fn user_content(&self, query: &str) -> String {
        format!(
            "{query}\n\nSemantic matches:\n{}\nRecent structured DB logs:\n{}",
            self.semantic, self.recent
        )
    }
}

/// Recupera el contexto de una consulta de dominio.
///
/// La consulta se vectoriza con el mismo embedder que construyó el snapshot;
/// si no coinciden es un error. Las detecciones recientes se leen aparte y
/// pueden solaparse con las coincidencias semánticas.
pub async fn assemble(
    query: &str,
    snapshot: &IndexSnapshot,
    embedder: &dyn Embedder,
    source: &dyn DetectionSource,
    k: usize,
    recent_limit: usize,
    notices: &mut Vec<String>,
) -> Result<RetrievedContext> {
    let mut context = RetrievedContext::default();

    if snapshot.index().is_some() {
        if snapshot.model_key() != embedder.model_key() {
            return Err(anyhow!(
                "El índice se construyó con '{}' y la consulta usaría '{}'",
                snapshot.model_key(),
                embedder.model_key()
            ));
        }
        let vectors = embedder.embed(&[query.to_string()]).await?;
        let query_vec = vectors
            .first()
            .ok_or_else(|| anyhow!("No se pudo generar embedding de la query"))?;
        for (sentence, _distance) in snapshot.nearest(query_vec, k)? {
            context.semantic.push_str(&sentence.text);
            context.semantic.push('\n');
            context.semantic_hits += 1;
        }
    }

    for record in detection_store::fetch_recent_or_empty(source, recent_limit, notices).await {
        context.recent.push_str(&format!("- {}\n", record.to_sentence()));
    }

    Ok(context)
}

/// Último snapshot construido en el proceso; siembra las sesiones nuevas.
/// Se reemplaza entero (gana el último en escribir).
#[derive(Debug)]
pub struct IndexCache {
    latest: RwLock<Arc<IndexSnapshot>>,
}

impl IndexCache {
    pub fn new(initial: IndexSnapshot) -> Self {
        Self { latest: RwLock::new(Arc::new(initial)) }
    }

    pub fn latest(&self) -> Arc<IndexSnapshot> {
        match self.latest.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn publish(&self, snapshot: Arc<IndexSnapshot>) {
        match self.latest.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }
}

/// Resultado de un turno completado.
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub reply: String,
    pub mode: QueryMode,
    pub notices: Vec<String>,
}

/// Servicio RAG: se construye una vez en `main` y se comparte entre peticiones.
pub struct RagPipeline {
    pub store: Arc<dyn DetectionSource>,
    pub embedder: Arc<dyn Embedder>,
    pub chat: Arc<dyn ChatBackend>,
    pub settings: RagSettings,
    pub cache: IndexCache,
}

impl RagPipeline {
    /// Crea el pipeline con un caché vacío que caduca enseguida.
    pub fn new(
        store: Arc<dyn DetectionSource>,
        embedder: Arc<dyn Embedder>,
        chat: Arc<dyn ChatBackend>,
        settings: RagSettings,
    ) -> Self {
        let cache = IndexCache::new(IndexSnapshot::empty(
            embedder.model_key(),
            DateTime::<Utc>::MIN_UTC,
        ));
        Self { store, embedder, chat, settings, cache }
    }

    /// Reconstruye el índice y, si sale bien, lo publica en el caché.
    pub async fn rebuild_index(&self) -> Result<(Arc<IndexSnapshot>, Vec<String>)> {
        let RebuildOutcome { snapshot, notices } = vector_store::rebuild(
            self.store.as_ref(),
            self.embedder.as_ref(),
            self.settings.index_limit,
        )
        .await?;
        let snapshot = Arc::new(snapshot);
        self.cache.publish(snapshot.clone());
        Ok((snapshot, notices))
    }

    /// Reconstruye el índice de la sesión si está caducado. Si la
    /// reconstrucción falla se sigue con el índice anterior y se avisa.
    pub async fn refresh_if_needed(
        &self,
        session: &mut Session,
        now: DateTime<Utc>,
        notices: &mut Vec<String>,
    ) {
        if !vector_store::needs_refresh(session.index.built_at, now, self.settings.refresh_interval) {
            return;
        }
        match self.rebuild_index().await {
            Ok((snapshot, mut rebuild_notices)) => {
                session.index = snapshot;
                notices.append(&mut rebuild_notices);
            }
            Err(e) => {
                warn!("⚠️ Falló la reconstrucción del índice, se mantiene el anterior: {e:#}");
                notices.push(format!("Index rebuild failed: {e}"));
            }
        }
    }

    /// Ejecuta un turno completo. Una consulta vacía no hace nada (`Ok(None)`).
    /// Si el LLM falla no se modifica el historial.
    pub async fn run_turn(
        &self,
        session: &mut Session,
        query: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TurnOutcome>> {
        // La consulta viaja tal cual la escribió el usuario.
        if query.trim().is_empty() {
            return Ok(None);
        }

        let mut notices = Vec::new();
        self.refresh_if_needed(session, now, &mut notices).await;

        let mode = classify(query);
        let user_content = match mode {
            QueryMode::Domain => {
                let snapshot = session.index.clone();
                let context = assemble(
                    query,
                    &snapshot,
                    self.embedder.as_ref(),
                    self.store.as_ref(),
                    self.settings.top_k,
                    self.settings.recent_log_limit,
                    &mut notices,
                )
                .await?;
                info!(
                    "Sesión {}: consulta de dominio, {} coincidencias semánticas sobre {} frases.",
                    session.id,
                    context.semantic_hits,
                    snapshot.len()
                );
                context.user_content(query)
            }
            QueryMode::General => query.to_string(),
        };

        let reply = self
            .chat
            .complete(system_prompt(mode), session.conversation.all(), &user_content)
            .await?;
        let reply = annotate(&reply, mode);

        session.conversation.append(ConversationTurn::user(query));
        session.conversation.append(ConversationTurn::assistant(reply.clone()));

        Ok(Some(TurnOutcome { reply, mode, notices }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection_store::memory::MemoryStore;
    use crate::llm::fakes::{BrokenEmbedder, ScriptedChat};
    use crate::llm::HashEmbedder;
    use crate::models::fixtures::record;
    use crate::models::ChatRole;
    use uuid::Uuid;

    fn pipeline(store: Arc<MemoryStore>, chat: Arc<ScriptedChat>) -> RagPipeline {
        RagPipeline::new(store, Arc::new(HashEmbedder::new(64)), chat, RagSettings::default())
    }

    async fn fresh_session(p: &RagPipeline) -> Session {
        let (snapshot, _) = p.rebuild_index().await.unwrap();
        Session::new(Uuid::new_v4(), snapshot)
    }

    #[test]
    fn clasificacion_sin_distinguir_mayusculas() {
        assert_eq!(classify("Helmet violation?"), QueryMode::Domain);
        assert_eq!(classify("HELMET violation?"), QueryMode::Domain);
        assert_eq!(classify("Show me the crash LOGS"), QueryMode::Domain);
        assert_eq!(classify("tell me a joke"), QueryMode::General);
    }

    #[test]
    fn palabra_clave_de_pasada_tambien_cuenta() {
        // "ride" dentro de "pride"
        assert_eq!(classify("what is pride and prejudice about?"), QueryMode::Domain);
    }

    #[test]
    fn accidente_tiene_prioridad_sobre_casco() {
        let out = annotate("One accident and two helmet violations.", QueryMode::Domain);
        assert!(out.starts_with("🚨 "));
    }

    #[test]
    fn reglas_de_anotacion() {
        assert_eq!(annotate("Helmet missing", QueryMode::Domain), "🪖 Helmet missing");
        assert_eq!(annotate("There were NONE today", QueryMode::Domain), "✅ There were NONE today");
        assert_eq!(annotate("All clear, great day", QueryMode::Domain), "All clear, great day");
        assert_eq!(annotate("accident", QueryMode::General), "accident");
    }

    #[test]
    fn contenido_de_usuario_en_modo_dominio() {
        let ctx = RetrievedContext {
            semantic: "a\n".into(),
            recent: "- b\n".into(),
            semantic_hits: 1,
        };
        assert_eq!(
            ctx.user_content("q"),
            "q\n\nSemantic matches:\na\nRecent structured DB logs:\n- b\n"
        );
    }

    #[tokio::test]
    async fn recuperacion_devuelve_min_k_tamano() {
        let store = MemoryStore::with_rows(vec![
            record(1, "Without Helmet", 0.9, "a.jpg"),
            record(2, "Accident", 0.8, "b.jpg"),
        ]);
        let embedder = HashEmbedder::new(64);
        let out = vector_store::rebuild(&store, &embedder, 500).await.unwrap();
        let mut notices = Vec::new();
        let ctx = assemble("helmet?", &out.snapshot, &embedder, &store, 5, 10, &mut notices)
            .await
            .unwrap();
        assert_eq!(ctx.semantic_hits, 2);
        assert_eq!(ctx.semantic.lines().count(), 2);
        assert_eq!(ctx.recent.lines().count(), 2);
        assert!(ctx.recent.lines().all(|l| l.starts_with("- ")));
    }

    #[tokio::test]
    async fn embedder_distinto_al_del_indice_es_error() {
        let store = MemoryStore::with_rows(vec![record(1, "Accident", 0.8, "b.jpg")]);
        let out = vector_store::rebuild(&store, &HashEmbedder::new(64), 500).await.unwrap();
        let mut notices = Vec::new();
        let res =
            assemble("accident", &out.snapshot, &HashEmbedder::new(32), &store, 5, 10, &mut notices)
                .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn escenario_completo_casco() {
        let store = Arc::new(MemoryStore::with_rows(vec![record(
            0,
            "Without Helmet",
            0.91,
            "bike.jpg",
        )]));
        let chat = Arc::new(ScriptedChat::replying("One rider had no helmet in bike.jpg."));
        let p = pipeline(store, chat.clone());
        let mut session = fresh_session(&p).await;
        let now = session.index.built_at;

        let outcome = p
            .run_turn(&mut session, "any helmet issues?", now)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.mode, QueryMode::Domain);
        assert!(outcome.reply.starts_with("🪖 "));

        let calls = chat.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].system_prompt, DOMAIN_SYSTEM_PROMPT);
        assert!(calls[0].history.is_empty());
        let sentence = "Without Helmet (91.0%) in bike.jpg at 2025-08-30 10:15:00";
        assert!(calls[0].user_content.starts_with("any helmet issues?\n\nSemantic matches:\n"));
        assert!(calls[0].user_content.contains(&format!("Semantic matches:\n{sentence}\n")));
        assert!(calls[0].user_content.contains(&format!("- {sentence}\n")));

        let history = session.conversation.all();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0], ConversationTurn::user("any helmet issues?"));
        assert_eq!(history[1].role, ChatRole::Assistant);
        assert_eq!(history[1].content, outcome.reply);
    }

    #[tokio::test]
    async fn modo_general_sin_contexto_ni_emoji() {
        let store = Arc::new(MemoryStore::default());
        let chat = Arc::new(ScriptedChat::replying("No worries, here's a joke about accidents."));
        let p = pipeline(store, chat.clone());
        let mut session = fresh_session(&p).await;
        let now = session.index.built_at;

        let outcome = p
            .run_turn(&mut session, "tell me a joke", now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.mode, QueryMode::General);
        assert_eq!(outcome.reply, "No worries, here's a joke about accidents.");
        let calls = chat.calls();
        assert_eq!(calls[0].user_content, "tell me a joke");
        assert_eq!(calls[0].system_prompt, GENERAL_SYSTEM_PROMPT);
    }

    #[tokio::test]
    async fn el_historial_previo_viaja_en_la_peticion() {
        let store = Arc::new(MemoryStore::default());
        let chat = Arc::new(ScriptedChat::replying("ok"));
        let p = pipeline(store, chat.clone());
        let mut session = fresh_session(&p).await;
        let now = session.index.built_at;

        p.run_turn(&mut session, "hola", now).await.unwrap();
        p.run_turn(&mut session, "¿qué tal?", now).await.unwrap();

        let calls = chat.calls();
        assert_eq!(calls[1].history.len(), 2);
        assert_eq!(calls[1].history[0].content, "hola");
        assert_eq!(session.conversation.all().len(), 4);
    }

    #[tokio::test]
    async fn consulta_vacia_no_hace_nada() {
        let store = Arc::new(MemoryStore::default());
        let chat = Arc::new(ScriptedChat::replying("nunca"));
        let p = pipeline(store, chat.clone());
        let mut session = fresh_session(&p).await;

        let out = p.run_turn(&mut session, "   ", Utc::now()).await.unwrap();
        assert!(out.is_none());
        assert!(chat.calls().is_empty());
        assert!(session.conversation.all().is_empty());
    }

    #[tokio::test]
    async fn fallo_del_llm_no_toca_el_historial() {
        let store = Arc::new(MemoryStore::default());
        let chat = Arc::new(ScriptedChat::failing("quota exceeded"));
        let p = pipeline(store, chat.clone());
        let mut session = fresh_session(&p).await;
        let now = session.index.built_at;

        let err = p
            .run_turn(&mut session, "any crash today?", now)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
        assert!(session.conversation.all().is_empty());
    }

    #[tokio::test]
    async fn base_de_datos_caida_durante_el_turno_degrada_a_vacio() {
        let store = Arc::new(MemoryStore::with_rows(vec![record(1, "Accident", 0.8, "a.jpg")]));
        let chat = Arc::new(ScriptedChat::replying("One accident in a.jpg."));
        let p = pipeline(store.clone(), chat.clone());
        let mut session = fresh_session(&p).await;
        let now = session.index.built_at;

        store.set_failing(true);
        let outcome = p
            .run_turn(&mut session, "any accident?", now)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.reply, "🚨 One accident in a.jpg.");
        assert!(!outcome.notices.is_empty());
        assert!(outcome.notices[0].starts_with("DB Error"));
        let calls = chat.calls();
        assert!(calls[0].user_content.contains("Semantic matches:\nAccident (80.0%)"));
        assert!(calls[0].user_content.ends_with("Recent structured DB logs:\n"));
        assert_eq!(session.conversation.all().len(), 2);
    }

    #[tokio::test]
    async fn la_consulta_se_guarda_sin_recortar() {
        let store = Arc::new(MemoryStore::default());
        let chat = Arc::new(ScriptedChat::replying("ok"));
        let p = pipeline(store, chat.clone());
        let mut session = fresh_session(&p).await;
        let now = session.index.built_at;

        p.run_turn(&mut session, "  tell me a joke \n", now).await.unwrap();
        assert_eq!(chat.calls()[0].user_content, "  tell me a joke \n");
        assert_eq!(session.conversation.all()[0], ConversationTurn::user("  tell me a joke \n"));
    }

    #[tokio::test]
    async fn refresco_a_los_90_y_150_segundos() {
        let store = Arc::new(MemoryStore::default());
        let chat = Arc::new(ScriptedChat::replying("ok"));
        let p = pipeline(store.clone(), chat.clone());
        let mut session = fresh_session(&p).await;
        let t0 = session.index.built_at;

        store.rows.lock().unwrap().push(record(5, "Accident", 0.88, "late.mp4"));

        p.run_turn(&mut session, "accident?", t0 + chrono::Duration::seconds(90))
            .await
            .unwrap();
        assert!(session.index.is_empty());
        assert!(chat.calls()[0].user_content.contains("Semantic matches:\n\nRecent"));

        p.run_turn(&mut session, "accident?", t0 + chrono::Duration::seconds(150))
            .await
            .unwrap();
        assert_eq!(session.index.len(), 1);
        assert!(chat.calls()[1].user_content.contains("Semantic matches:\nAccident (88.0%)"));
        assert_eq!(p.cache.latest().len(), 1);
    }

    #[tokio::test]
    async fn reconstruccion_fallida_mantiene_el_indice_anterior() {
        let store = Arc::new(MemoryStore::with_rows(vec![record(1, "Accident", 0.8, "a.jpg")]));
        let chat = Arc::new(ScriptedChat::replying("ok"));
        let good = pipeline(store.clone(), chat.clone());
        let mut session = fresh_session(&good).await;
        let previous = session.index.clone();

        let broken = RagPipeline::new(store, Arc::new(BrokenEmbedder), chat, RagSettings::default());
        let mut notices = Vec::new();
        let later = previous.built_at + chrono::Duration::seconds(600);
        broken.refresh_if_needed(&mut session, later, &mut notices).await;

        assert!(Arc::ptr_eq(&session.index, &previous));
        assert_eq!(notices.len(), 1);
    }
}
