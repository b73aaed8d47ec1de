use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    app_state::{AppState, Status},
    ingest::{self, IngestionSummary},
    models::{ConversationTurn, DetectionBatch, DetectionRecord, ReportKind, ReportSummary},
    report,
    session::SharedSession,
};

type ApiError = (StatusCode, Json<serde_json::Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

// --- Payloads y Respuestas de la API ---

#[derive(Deserialize)]
pub struct ChatPayload {
    query: String,
}

#[derive(Serialize)]
pub struct SessionCreated {
    session_id: Uuid,
    index_size: usize,
}

#[derive(Serialize)]
pub struct RefreshResponse {
    index_size: usize,
    notices: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ReportResponse {
    summary: ReportSummary,
    markdown: String,
    detections: Vec<DetectionRecord>,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/sessions", post(create_session_handler))
        .route("/api/sessions/:id", delete(delete_session_handler))
        .route("/api/sessions/:id/chat", post(chat_handler))
        .route(
            "/api/sessions/:id/history",
            get(history_handler).delete(clear_history_handler),
        )
        .route("/api/sessions/:id/transcript", get(transcript_handler))
        .route("/api/sessions/:id/refresh", post(refresh_handler))
        .route("/api/reports/:kind", get(report_handler))
        .route("/api/detections", post(detections_handler))
        .route("/api/status", get(status_handler))
        .route("/api/shutdown", post(shutdown_handler))
        .with_state(app_state)
}

fn find_session(state: &AppState, id: &Uuid) -> Result<SharedSession, ApiError> {
    state
        .sessions
        .get(id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("Sesión {id} no encontrada.")))
}

// --- Handlers de sesión y chat ---

#[axum::debug_handler]
async fn create_session_handler(State(state): State<AppState>) -> (StatusCode, Json<SessionCreated>) {
    let seed = state.pipeline.cache.latest();
    let index_size = seed.len();
    let session_id = state.sessions.create(seed);
    info!("Nueva sesión {session_id} (índice sembrado con {index_size} frases).");
    (StatusCode::CREATED, Json(SessionCreated { session_id, index_size }))
}

#[axum::debug_handler]
async fn delete_session_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if state.sessions.remove(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(api_error(StatusCode::NOT_FOUND, format!("Sesión {id} no encontrada.")))
    }
}

#[axum::debug_handler]
async fn chat_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ChatPayload>,
) -> Result<Response, ApiError> {
    let session = find_session(&state, &id)?;
    let mut session = session.lock().await;

    match state.pipeline.run_turn(&mut session, &payload.query, Utc::now()).await {
        Ok(Some(outcome)) => Ok(Json(outcome).into_response()),
        Ok(None) => Ok(StatusCode::NO_CONTENT.into_response()),
        Err(e) => {
            error!("Error en el turno de chat de la sesión {id}: {e:#}");
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error al procesar la consulta: {e}"),
            ))
        }
    }
}

#[axum::debug_handler]
async fn history_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<ConversationTurn>>, ApiError> {
    let session = find_session(&state, &id)?;
    let session = session.lock().await;
    Ok(Json(session.conversation.all().to_vec()))
}

#[axum::debug_handler]
async fn clear_history_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let session = find_session(&state, &id)?;
    session.lock().await.conversation.clear();
    Ok(StatusCode::NO_CONTENT)
}

#[axum::debug_handler]
async fn transcript_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let session = find_session(&state, &id)?;
    let markdown = {
        let session = session.lock().await;
        report::chat_transcript(session.conversation.all(), Utc::now().naive_local())
    };
    Ok((
        [(axum::http::header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
        markdown,
    )
        .into_response())
}

#[axum::debug_handler]
async fn refresh_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RefreshResponse>, ApiError> {
    let session = find_session(&state, &id)?;
    let mut session = session.lock().await;
    match state.pipeline.rebuild_index().await {
        Ok((snapshot, notices)) => {
            session.index = snapshot;
            Ok(Json(RefreshResponse { index_size: session.index.len(), notices }))
        }
        Err(e) => {
            error!("Error reconstruyendo el índice: {e:#}");
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error al reconstruir el índice: {e}"),
            ))
        }
    }
}

// --- Informes e ingesta ---

#[axum::debug_handler]
async fn report_handler(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> Result<Json<ReportResponse>, ApiError> {
    let kind = ReportKind::parse(&kind).ok_or_else(|| {
        api_error(StatusCode::BAD_REQUEST, format!("Tipo de informe desconocido: {kind}"))
    })?;
    let rows = state.pipeline.store.report_rows(kind).await.map_err(|e| {
        error!("Error leyendo detecciones para el informe: {e:#}");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("DB Error: {e}"))
    })?;
    let summary = report::summarize(kind, &rows);
    let markdown = report::render_summary(&summary);
    Ok(Json(ReportResponse { summary, markdown, detections: rows }))
}

#[axum::debug_handler]
async fn detections_handler(
    State(state): State<AppState>,
    Json(batch): Json<DetectionBatch>,
) -> Result<(StatusCode, Json<IngestionSummary>), ApiError> {
    if let Err(e) = ingest::validate_batch(&batch) {
        return Err(api_error(StatusCode::BAD_REQUEST, e.to_string()));
    }
    match ingest::record_batch(state.pipeline.store.as_ref(), &batch).await {
        Ok(summary) => Ok((StatusCode::CREATED, Json(summary))),
        Err(e) => {
            error!("Error de ingesta: {e:#}");
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("DB Insert Failed: {e}"),
            ))
        }
    }
}

// --- Estado y apagado ---

#[axum::debug_handler]
async fn status_handler(State(state): State<AppState>) -> Json<Status> {
    let snapshot = state.pipeline.cache.latest();
    let age = Utc::now().signed_duration_since(snapshot.built_at).num_seconds();
    Json(Status {
        sessions: state.sessions.len(),
        index_size: snapshot.len(),
        index_model: snapshot.model_key().to_string(),
        // El caché inicial lleva fecha mínima: nunca se ha construido.
        index_age_secs: (snapshot.built_at > chrono::DateTime::<Utc>::MIN_UTC).then_some(age),
    })
}

#[axum::debug_handler]
async fn shutdown_handler(State(state): State<AppState>) -> impl IntoResponse {
    info!("Petición de apagado recibida.");
    let sender = state
        .shutdown_sender
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .take();
    if let Some(sender) = sender {
        let _ = sender.send(());
    }
    StatusCode::OK
}
