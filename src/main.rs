// Módulos de la aplicación
mod api;
mod app_state;
mod config;
mod detection_store;
mod ingest;
mod llm;
mod models;
mod rag;
mod report;
mod session;
mod vector_store;

use crate::app_state::AppState;
use crate::detection_store::PgDetectionStore;
use crate::rag::RagPipeline;
use crate::session::SessionRegistry;
use anyhow::Context;
use axum::Router;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 2. Cargar configuración
    let cfg = config::AppConfig::from_env().context("Error al cargar la configuración")?;

    // 3. Preparar Postgres y asegurar el esquema
    let store = PgDetectionStore::new(cfg.database_url.clone())?;
    if let Err(e) = store.ensure_schema().await {
        // La base de datos puede no estar disponible aún; las lecturas degradarán a vacío.
        warn!("⚠️ No se pudo asegurar el esquema de Postgres: {e:#}");
    }

    // 4. Inicializar embedder, LLM y pipeline RAG
    let embedder = llm::embedder_from_config(&cfg);
    let chat = Arc::new(llm::LlmManager::from_config(&cfg));
    let pipeline = Arc::new(RagPipeline::new(Arc::new(store), embedder, chat, cfg.rag.clone()));

    // Índice inicial para sembrar las sesiones nuevas.
    match pipeline.rebuild_index().await {
        Ok((snapshot, _)) if snapshot.is_empty() => {
            warn!("⚠️ Índice inicial vacío: no hay detecciones recientes o la base de datos no responde.")
        }
        Ok((snapshot, _)) => info!("Índice inicial con {} frases.", snapshot.len()),
        Err(e) => warn!("⚠️ No se pudo construir el índice inicial: {e:#}"),
    }

    // Crear canal para la señal de apagado.
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    // 5. Crear estado compartido de la aplicación
    let app_state = AppState {
        config: cfg.clone(),
        pipeline,
        sessions: Arc::new(SessionRegistry::new(cfg.session_idle)),
        shutdown_sender: Arc::new(Mutex::new(Some(shutdown_tx))),
    };

    // 6. Configurar el router de la API y el servicio de ficheros estáticos
    let app = Router::new()
        .merge(api::create_router(app_state.clone()))
        .fallback_service(ServeDir::new(&app_state.config.static_dir))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // 7. Iniciar el servidor
    let server_addr = &app_state.config.server_addr;
    let listener = tokio::net::TcpListener::bind(server_addr)
        .await
        .with_context(|| format!("No se pudo escuchar en {server_addr}"))?;
    info!("🚀 Servidor escuchando en http://{}", server_addr);

    // Configurar el apagado ordenado.
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await?;

    if !app_state.sessions.is_empty() {
        info!("Se descartan {} sesiones abiertas.", app_state.sessions.len());
    }
    info!("✅ Servidor cerrado correctamente.");
    Ok(())
}
