//! Registro de los resultados del detector externo en la tabla `detections`.

use anyhow::{anyhow, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::{detection_store::DetectionSource, models::DetectionBatch};

/// Resumen de un lote registrado.
#[derive(Debug, Default, Serialize)]
pub struct IngestionSummary {
    pub file_name: String,
    pub detections_recorded: usize,
    pub accidents: usize,
    pub helmet_violations: usize,
}

impl IngestionSummary {
    /// `true` si el lote contiene algo que merezca alerta.
    pub fn is_alert(&self) -> bool {
        self.accidents > 0 || self.helmet_violations > 0
    }
}

/// Implementa cómo se mostrará el resumen como texto.
impl std::fmt::Display for IngestionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} detecciones registradas ({} accidentes, {} sin casco).",
            self.file_name, self.detections_recorded, self.accidents, self.helmet_violations
        )
    }
}

/// Comprueba el lote antes de escribir nada: nombre de fichero y clases no
/// vacíos, confianzas finitas en [0, 1] y cajas con coordenadas finitas.
pub fn validate_batch(batch: &DetectionBatch) -> Result<()> {
    if batch.file_name.trim().is_empty() {
        return Err(anyhow!("El lote no indica file_name"));
    }
    for (i, det) in batch.detections.iter().enumerate() {
        if det.class_label.trim().is_empty() {
            return Err(anyhow!("La detección {i} no tiene clase"));
        }
        if !det.confidence.is_finite() || !(0.0..=1.0).contains(&det.confidence) {
            return Err(anyhow!(
                "La detección {i} tiene una confianza fuera de [0, 1]: {}",
                det.confidence
            ));
        }
        if let Some(bbox) = &det.bbox {
            if bbox.iter().any(|v| !v.is_finite()) {
                return Err(anyhow!("La detección {i} tiene una caja inválida"));
            }
        }
    }
    Ok(())
}

/// Valida y registra un lote. Un lote inválido no escribe ninguna fila.
pub async fn record_batch(
    store: &dyn DetectionSource,
    batch: &DetectionBatch,
) -> Result<IngestionSummary> {
    validate_batch(batch)?;

    let detections_recorded = if batch.detections.is_empty() {
        0
    } else {
        store.insert_batch(batch).await?
    };

    let summary = IngestionSummary {
        file_name: batch.file_name.clone(),
        detections_recorded,
        accidents: batch
            .detections
            .iter()
            .filter(|d| d.class_label.contains("Accident"))
            .count(),
        helmet_violations: batch
            .detections
            .iter()
            .filter(|d| d.class_label.contains("Without Helmet"))
            .count(),
    };
    info!("Ingerido {summary}");
    if summary.is_alert() {
        warn!("🚨 Alerta en {}: revisar accidentes o infracciones de casco.", summary.file_name);
    }
    Ok(summary)
}
