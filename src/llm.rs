//! Abstracción sobre Rig para embeddings y chat.
//! Chat: OpenAI o Groq (API compatible con OpenAI). Embeddings: OpenAI o un
//! embedder local por hashing que no necesita red.

use crate::config::{AppConfig, EmbeddingProvider, LlmProvider};
use crate::models::{ChatRole, ConversationTurn};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rig::completion::{Chat, Message};
use rig::embeddings::EmbeddingModel; // <- para .embed_texts
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Función de embedding. La misma instancia debe usarse para construir el
/// índice y para vectorizar las consultas.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Identificador del modelo; dos índices sólo son comparables si coincide.
    fn model_key(&self) -> String;

    /// Un vector por texto, en el mismo orden.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f64>>>;
}

/// Cliente de completado: una petición, una respuesta, sin reintentos.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(
        &self,
        system_prompt: &str,
        history: &[ConversationTurn],
        user_content: &str,
    ) -> Result<String>;
}

/// Construye el embedder configurado.
pub fn embedder_from_config(cfg: &AppConfig) -> Arc<dyn Embedder> {
    match cfg.embedding_provider {
        EmbeddingProvider::OpenAI => Arc::new(OpenAiEmbedder {
            model: cfg.llm_embedding_model.clone(),
        }),
        EmbeddingProvider::Local => Arc::new(HashEmbedder::new(HashEmbedder::DEFAULT_DIM)),
    }
}

// ---------------------------------------------------------------------
// EMBEDDINGS
// ---------------------------------------------------------------------

/// Embeddings de OpenAI vía Rig.
#[derive(Debug, Clone)]
pub struct OpenAiEmbedder {
    pub model: String,
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_key(&self) -> String {
        format!("openai:{}", self.model_name())
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f64>>> {
        use rig::providers::openai;
        // Traits para Client::from_env y client.embedding_model(...)
        use rig::client::{EmbeddingsClient as _, ProviderClient as _};

        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let client = openai::Client::from_env();
        let embedding_model = client.embedding_model(self.model_name());

        let embeddings = embedding_model.embed_texts(texts.to_vec()).await?;

        if embeddings.len() != texts.len() {
            return Err(anyhow!(
                "Número de embeddings ({}) distinto al número de textos ({})",
                embeddings.len(),
                texts.len()
            ));
        }

        Ok(embeddings.into_iter().map(|e| e.vec).collect())
    }
}

impl OpenAiEmbedder {
    fn model_name(&self) -> &str {
        if self.model.is_empty() {
            rig::providers::openai::TEXT_EMBEDDING_3_SMALL
        } else {
            self.model.as_str()
        }
    }
}

/// Embedder determinista por "feature hashing": tokens, bigramas y trigramas
/// de caracteres proyectados con signo sobre `dim` componentes y normalizados.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub const DEFAULT_DIM: usize = 384;

    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f64> {
        let mut vec = vec![0.0f64; self.dim];
        let normalized = text.to_lowercase();
        let tokens: Vec<&str> = normalized
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();

        for token in &tokens {
            self.add_feature(&mut vec, &format!("t:{token}"), 1.0);
        }
        for pair in tokens.windows(2) {
            self.add_feature(&mut vec, &format!("b:{}_{}", pair[0], pair[1]), 0.8);
        }
        let compact: Vec<char> = normalized.chars().filter(|c| !c.is_whitespace()).collect();
        for tri in compact.windows(3) {
            let trigram: String = tri.iter().collect();
            self.add_feature(&mut vec, &format!("c:{trigram}"), 0.15);
        }

        let norm = vec.iter().map(|v| v * v).sum::<f64>().sqrt();
        if norm > 0.0 {
            for v in &mut vec {
                *v /= norm;
            }
        }
        vec
    }

    fn add_feature(&self, vec: &mut [f64], feature: &str, weight: f64) {
        let mut hasher = Sha256::new();
        hasher.update(feature.as_bytes());
        let digest = hasher.finalize();
        let mut first = [0u8; 8];
        first.copy_from_slice(&digest[..8]);
        let idx = (u64::from_le_bytes(first) % self.dim as u64) as usize;
        let sign = if (digest[8] & 1) == 0 { 1.0 } else { -1.0 };
        vec[idx] += sign * weight;
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_key(&self) -> String {
        format!("local-hash-v1:{}", self.dim)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f64>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

// ---------------------------------------------------------------------
// CHAT / COMPLETION
// ---------------------------------------------------------------------

/// Gestor de chat sobre Rig (OpenAI o Groq).
#[derive(Debug, Clone)]
pub struct LlmManager {
    pub provider: LlmProvider,
    pub chat_model: String,
}

impl LlmManager {
    /// Construye el manager a partir de la configuración.
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            provider: cfg.llm_provider.clone(),
            chat_model: cfg.llm_chat_model.clone(),
        }
    }

    fn model_name(&self) -> &str {
        if self.chat_model.is_empty() {
            self.provider.default_chat_model()
        } else {
            self.chat_model.as_str()
        }
    }
}

/// Historial en el formato de mensajes de Rig.
fn to_rig_history(history: &[ConversationTurn]) -> Vec<Message> {
    history
        .iter()
        .map(|turn| match turn.role {
            ChatRole::User => Message::user(turn.content.clone()),
            ChatRole::Assistant => Message::assistant(turn.content.clone()),
        })
        .collect()
}

#[async_trait]
impl ChatBackend for LlmManager {
    async fn complete(
        &self,
        system_prompt: &str,
        history: &[ConversationTurn],
        user_content: &str,
    ) -> Result<String> {
        // Traits para Client::from_env y client.agent(...)
        use rig::client::{CompletionClient as _, ProviderClient as _};

        let chat_history = to_rig_history(history);
        let model_name = self.model_name();

        let answer = match self.provider {
            LlmProvider::OpenAI => {
                let client = rig::providers::openai::Client::from_env();
                let agent = client.agent(model_name).preamble(system_prompt).build();
                agent.chat(user_content, chat_history).await?
            }
            LlmProvider::Groq => {
                let client = rig::providers::groq::Client::from_env();
                let agent = client.agent(model_name).preamble(system_prompt).build();
                agent.chat(user_content, chat_history).await?
            }
        };
        Ok(answer)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_embedder_es_determinista() {
        let e = HashEmbedder::new(64);
        let texts = vec!["Without Helmet in bike.jpg".to_string()];
        let a = e.embed(&texts).await.unwrap();
        let b = e.embed(&texts).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 64);
    }

    #[test]
    fn hash_embedder_usa_sha256_estable() {
        let e = HashEmbedder::new(64);
        let mut v = vec![0.0f64; 64];
        e.add_feature(&mut v, "t:helmet", 1.0);
        e.add_feature(&mut v, "t:accident", 0.5);
        assert_eq!(v[45], -1.0);
        assert_eq!(v[49], -0.5);
        assert_eq!(v.iter().filter(|x| **x != 0.0).count(), 2);
        assert_eq!(e.model_key(), "local-hash-v1:64");
    }

    #[test]
    fn hash_embedder_normaliza() {
        let v = HashEmbedder::new(32).embed_one("accident detected on the highway");
        let norm: f64 = v.iter().map(|x| x * x).sum::<f64>().sqrt();
        assert!((norm - 1.0).abs() < 1e-9);
    }

    #[test]
    fn texto_vacio_da_vector_nulo() {
        let v = HashEmbedder::new(16).embed_one("   ");
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn textos_parecidos_quedan_mas_cerca() {
        let e = HashEmbedder::new(HashEmbedder::DEFAULT_DIM);
        let q = e.embed_one("helmet issues");
        let near = e.embed_one("Without Helmet (91.0%) in bike.jpg");
        let far = e.embed_one("Accident (80.0%) in crash.mp4");
        let dist = |a: &[f64], b: &[f64]| -> f64 {
            a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum::<f64>()
        };
        assert!(dist(&q, &near) < dist(&q, &far));
    }

    #[test]
    fn modelo_de_chat_por_defecto() {
        let m = LlmManager { provider: LlmProvider::Groq, chat_model: String::new() };
        assert_eq!(m.model_name(), "llama-3.1-8b-instant");
        let m = LlmManager { provider: LlmProvider::OpenAI, chat_model: "gpt-4o".into() };
        assert_eq!(m.model_name(), "gpt-4o");
    }

    #[test]
    fn historial_conserva_el_orden() {
        let history = vec![ConversationTurn::user("hola"), ConversationTurn::assistant("buenas")];
        assert_eq!(to_rig_history(&history).len(), 2);
    }
}
