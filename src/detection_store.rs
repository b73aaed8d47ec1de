//! Acceso a la tabla `detections` de Postgres.
//!
//! Cada operación abre su propia conexión, la usa y la cierra: no hay pool
//! ni transacciones que abarquen varias sentencias.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::{Connection, PgConnection};
use tracing::{info, warn};
use url::Url;

use crate::models::{DetectionBatch, DetectionRecord, ReportKind};

/// Origen de detecciones. En producción es Postgres; en los tests, memoria.
#[async_trait]
pub trait DetectionSource: Send + Sync {
    /// Hasta `limit` detecciones, de la más reciente a la más antigua.
    async fn recent(&self, limit: usize) -> Result<Vec<DetectionRecord>>;

    /// Filas que alimentan un informe.
    async fn report_rows(&self, kind: ReportKind) -> Result<Vec<DetectionRecord>>;

    /// Registra un lote del detector. Devuelve el número de filas insertadas.
    async fn insert_batch(&self, batch: &DetectionBatch) -> Result<usize>;
}

/// Lee las detecciones recientes degradando a vacío si la base de datos falla.
/// El aviso se registra y se añade a `notices` para mostrarlo al usuario.
pub async fn fetch_recent_or_empty(
    source: &dyn DetectionSource,
    limit: usize,
    notices: &mut Vec<String>,
) -> Vec<DetectionRecord> {
    match source.recent(limit).await {
        Ok(rows) => rows,
        Err(e) => {
            warn!("⚠️ Error de base de datos leyendo detecciones: {e:#}");
            notices.push(format!("DB Error: {e}"));
            Vec::new()
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DetectionRow {
    id: i32,
    class: Option<String>,
    confidence: Option<f64>,
    box_coordinates: Option<String>,
    file_name: Option<String>,
    s3_path: Option<String>,
    created_at: Option<NaiveDateTime>,
}

impl From<DetectionRow> for DetectionRecord {
    fn from(row: DetectionRow) -> Self {
        DetectionRecord {
            id: row.id,
            class_label: row.class.unwrap_or_default(),
            confidence: row.confidence.unwrap_or_default(),
            bbox: row.box_coordinates.as_deref().and_then(parse_box),
            source_file: row.file_name.unwrap_or_default(),
            s3_path: row.s3_path,
            created_at: row.created_at.unwrap_or_default(),
        }
    }
}

/// `box_coordinates` se guarda como texto `"[x1, y1, x2, y2]"`.
fn parse_box(raw: &str) -> Option<[f64; 4]> {
    serde_json::from_str::<[f64; 4]>(raw.trim()).ok()
}

fn format_box(bbox: &[f64; 4]) -> String {
    let parts: Vec<String> = bbox.iter().map(|v| format!("{v:?}")).collect();
    format!("[{}]", parts.join(", "))
}

const SELECT_COLUMNS: &str =
    "SELECT id, class, confidence, box_coordinates, file_name, s3_path, created_at FROM detections";

fn report_query(kind: ReportKind) -> String {
    let filter = match kind {
        ReportKind::Last24h => "WHERE created_at >= NOW() - INTERVAL '24 HOURS'",
        ReportKind::Weekly => "WHERE created_at >= NOW() - INTERVAL '7 DAYS'",
        ReportKind::Monthly => "WHERE created_at >= NOW() - INTERVAL '30 DAYS'",
        ReportKind::Accident => "WHERE class ILIKE '%Accident%'",
        ReportKind::Helmet => "WHERE class ILIKE '%Without Helmet%'",
    };
    format!("{SELECT_COLUMNS} {filter} ORDER BY created_at DESC")
}

/// Almacén de detecciones en Postgres.
#[derive(Debug, Clone)]
pub struct PgDetectionStore {
    database_url: String,
}

impl PgDetectionStore {
    pub fn new(database_url: impl Into<String>) -> Result<Self> {
        let database_url = database_url.into();
        let url = Url::parse(&database_url).context("DATABASE_URL no es una URL válida")?;
        if !matches!(url.scheme(), "postgres" | "postgresql") {
            return Err(anyhow!("Esquema de DATABASE_URL no soportado: {}", url.scheme()));
        }
        Ok(Self { database_url })
    }

    /// `host:puerto` sin credenciales, para los logs.
    pub fn display_addr(&self) -> String {
        match Url::parse(&self.database_url) {
            Ok(url) => format!(
                "{}:{}",
                url.host_str().unwrap_or("localhost"),
                url.port().unwrap_or(5432)
            ),
            Err(_) => "desconocido".to_string(),
        }
    }

    async fn connect(&self) -> Result<PgConnection> {
        PgConnection::connect(&self.database_url)
            .await
            .with_context(|| format!("No se pudo conectar a Postgres en {}", self.display_addr()))
    }

    /// Crea la tabla `detections` si no existe.
    pub async fn ensure_schema(&self) -> Result<()> {
        info!("Conectando a Postgres en {}...", self.display_addr());
        let mut conn = self.connect().await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS detections (
                id SERIAL PRIMARY KEY,
                class TEXT,
                confidence FLOAT,
                box_coordinates TEXT,
                file_name TEXT,
                s3_path TEXT,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )",
        )
        .execute(&mut conn)
        .await?;
        conn.close().await?;
        info!("Esquema de Postgres asegurado (tabla detections).");
        Ok(())
    }
}

#[async_trait]
impl DetectionSource for PgDetectionStore {
    async fn recent(&self, limit: usize) -> Result<Vec<DetectionRecord>> {
        let mut conn = self.connect().await?;
        let sql = format!("{SELECT_COLUMNS} ORDER BY created_at DESC LIMIT $1");
        let rows = sqlx::query_as::<_, DetectionRow>(&sql)
            .bind(limit as i64)
            .fetch_all(&mut conn)
            .await?;
        conn.close().await?;
        Ok(rows.into_iter().map(DetectionRecord::from).collect())
    }

    async fn report_rows(&self, kind: ReportKind) -> Result<Vec<DetectionRecord>> {
        let mut conn = self.connect().await?;
        let sql = report_query(kind);
        let rows = sqlx::query_as::<_, DetectionRow>(&sql)
            .fetch_all(&mut conn)
            .await?;
        conn.close().await?;
        Ok(rows.into_iter().map(DetectionRecord::from).collect())
    }

    async fn insert_batch(&self, batch: &DetectionBatch) -> Result<usize> {
        let mut conn = self.connect().await?;
        let mut inserted = 0;
        for det in &batch.detections {
            sqlx::query(
                "INSERT INTO detections (class, confidence, box_coordinates, file_name, s3_path)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(det.class_label.as_str())
            .bind(det.confidence)
            .bind(det.bbox.as_ref().map(format_box))
            .bind(batch.file_name.as_str())
            .bind(batch.s3_path.as_deref())
            .execute(&mut conn)
            .await?;
            inserted += 1;
        }
        conn.close().await?;
        Ok(inserted)
    }
}
