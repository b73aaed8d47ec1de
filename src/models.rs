//! Modelos de dominio (detecciones, frases indexadas, turnos de conversación e informes).

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Una fila de la tabla `detections`.
/// La escribe el detector externo; aquí sólo se lee.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionRecord {
    pub id: i32,
    pub class_label: String,
    /// Confianza en [0, 1].
    pub confidence: f64,
    /// Caja `[x1, y1, x2, y2]` si el detector la registró.
    pub bbox: Option<[f64; 4]>,
    pub source_file: String,
    pub s3_path: Option<String>,
    pub created_at: NaiveDateTime,
}

impl DetectionRecord {
    /// Frase en lenguaje natural que se indexa y se envía como contexto al LLM.
    pub fn to_sentence(&self) -> String {
        format!(
            "{} ({:.1}%) in {} at {}",
            self.class_label,
            self.confidence * 100.0,
            self.source_file,
            self.created_at
        )
    }
}

/// Frase derivada de una detección. Su vector vive en el `SearchIndex`,
/// en la misma posición.
#[derive(Debug, Clone)]
pub struct IndexedSentence {
    pub text: String,
    pub source: DetectionRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into() }
    }
}

/// Una detección tal y como la envía el detector para ser registrada.
#[derive(Debug, Clone, Deserialize)]
pub struct NewDetection {
    #[serde(rename = "class")]
    pub class_label: String,
    pub confidence: f64,
    #[serde(default, rename = "box")]
    pub bbox: Option<[f64; 4]>,
}

/// Lote de detecciones de un mismo fichero subido.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectionBatch {
    pub file_name: String,
    #[serde(default)]
    pub s3_path: Option<String>,
    pub detections: Vec<NewDetection>,
}

/// Tipos de informe soportados.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    #[serde(rename = "last_24h")]
    Last24h,
    Weekly,
    Monthly,
    Accident,
    Helmet,
}

impl ReportKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "last_24h" => Some(Self::Last24h),
            "weekly" => Some(Self::Weekly),
            "monthly" => Some(Self::Monthly),
            "accident" => Some(Self::Accident),
            "helmet" => Some(Self::Helmet),
            _ => None,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::Last24h => "📊 SafeRideAI Report - Last 24 Hours",
            Self::Weekly => "📊 SafeRideAI Report - Weekly Summary",
            Self::Monthly => "📊 SafeRideAI Report - Monthly Summary",
            Self::Accident => "🚨 Accident Report",
            Self::Helmet => "🪖 Helmet Violation Report",
        }
    }
}

/// Resumen agregado de un informe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportSummary {
    pub kind: ReportKind,
    pub title: String,
    pub total: usize,
    pub accident_count: usize,
    pub helmet_count: usize,
    /// (clase, número de detecciones), de mayor a menor.
    pub class_counts: Vec<(String, usize)>,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::DetectionRecord;
    use chrono::NaiveDate;

    /// Detección de prueba con fecha fija; `id` desplaza los minutos para ordenar.
    pub(crate) fn record(id: i32, class: &str, confidence: f64, file: &str) -> DetectionRecord {
        DetectionRecord {
            id,
            class_label: class.to_string(),
            confidence,
            bbox: None,
            source_file: file.to_string(),
            s3_path: None,
            created_at: NaiveDate::from_ymd_opt(2025, 8, 30)
                .unwrap()
                .and_hms_opt(10, 15, 0)
                .unwrap()
                + chrono::Duration::minutes(id as i64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::record;
    use super::*;

    #[test]
    fn frase_con_porcentaje_y_fecha() {
        let r = record(0, "Without Helmet", 0.91, "bike.jpg");
        assert_eq!(r.to_sentence(), "Without Helmet (91.0%) in bike.jpg at 2025-08-30 10:15:00");
    }

    #[test]
    fn porcentaje_redondeado_a_un_decimal() {
        let r = record(2, "Accident", 0.876, "crash.mp4");
        assert!(r.to_sentence().starts_with("Accident (87.6%) in crash.mp4"));
    }

    #[test]
    fn tipo_de_informe_desde_texto() {
        assert_eq!(ReportKind::parse("last_24h"), Some(ReportKind::Last24h));
        assert_eq!(ReportKind::parse("helmet"), Some(ReportKind::Helmet));
        assert_eq!(ReportKind::parse("yearly"), None);
    }

    #[test]
    fn roles_serializados_en_minusculas() {
        let json = serde_json::to_string(&ConversationTurn::assistant("hola")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"hola"}"#);
    }

    #[test]
    fn lote_de_detecciones_desde_json() {
        let batch: DetectionBatch = serde_json::from_str(
            r#"{"file_name":"bike.jpg","detections":[{"class":"Without Helmet","confidence":0.91,"box":[1.0,2.0,3.0,4.0]}]}"#,
        )
        .unwrap();
        assert_eq!(batch.detections.len(), 1);
        assert_eq!(batch.detections[0].bbox, Some([1.0, 2.0, 3.0, 4.0]));
        assert!(batch.s3_path.is_none());
    }
}
