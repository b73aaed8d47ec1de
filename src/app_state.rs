use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use crate::{config::AppConfig, rag::RagPipeline, session::SessionRegistry};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub pipeline: Arc<RagPipeline>,
    pub sessions: Arc<SessionRegistry>,
    pub shutdown_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Status {
    pub sessions: usize,
    pub index_size: usize,
    pub index_model: String,
    /// Segundos desde la última reconstrucción del índice cacheado (None si nunca).
    pub index_age_secs: Option<i64>,
}
