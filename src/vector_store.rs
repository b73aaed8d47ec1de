//! Índice vectorial en memoria sobre las detecciones recientes.
//!
//! API pública:
//!   - `SearchIndex`: índice plano (fuerza bruta) por distancia euclídea.
//!   - `IndexSnapshot`: índice + frases + detecciones, inmutable.
//!   - `rebuild(&dyn DetectionSource, &dyn Embedder, limit)`.
//!   - `needs_refresh(...)`: política de frescura.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{info, warn};

use crate::detection_store::{self, DetectionSource};
use crate::llm::Embedder;
use crate::models::{DetectionRecord, IndexedSentence};

/// Índice plano: cada búsqueda compara contra todos los vectores.
#[derive(Debug, Clone)]
pub struct SearchIndex {
    dim: usize,
    vectors: Vec<Vec<f64>>,
}

/// Un resultado de búsqueda: posición en el snapshot y distancia L2 al cuadrado.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub position: usize,
    pub distance: f64,
}

impl SearchIndex {
    /// Falla si no hay vectores o si sus dimensiones no coinciden.
    pub fn build(vectors: Vec<Vec<f64>>) -> Result<Self> {
        let dim = vectors
            .first()
            .map(|v| v.len())
            .ok_or_else(|| anyhow!("No se puede construir un índice sin vectores"))?;
        if dim == 0 {
            return Err(anyhow!("Embeddings de dimensión 0"));
        }
        if let Some(bad) = vectors.iter().position(|v| v.len() != dim) {
            return Err(anyhow!(
                "Embedding {} con dimensión {} (se esperaba {})",
                bad,
                vectors[bad].len(),
                dim
            ));
        }
        Ok(Self { dim, vectors })
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    /// Los `min(k, len)` vecinos más cercanos, de menor a mayor distancia.
    /// A igual distancia gana la posición más baja.
    pub fn search(&self, query: &[f64], k: usize) -> Result<Vec<Neighbor>> {
        if query.len() != self.dim {
            return Err(anyhow!(
                "La consulta tiene dimensión {} y el índice {}; ¿embedders distintos?",
                query.len(),
                self.dim
            ));
        }
        let mut scored: Vec<Neighbor> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(position, v)| Neighbor { position, distance: squared_l2(query, v) })
            .collect();
        scored.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.position.cmp(&b.position))
        });
        scored.truncate(k.min(self.len()));
        Ok(scored)
    }
}

fn squared_l2(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Resultado completo de una reconstrucción. Se reemplaza entero, nunca se muta:
/// índice, frases y detecciones comparten posición.
#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    index: Option<SearchIndex>,
    sentences: Vec<IndexedSentence>,
    model_key: String,
    pub built_at: DateTime<Utc>,
}

impl IndexSnapshot {
    /// Snapshot vacío (sin índice), p. ej. antes de la primera reconstrucción.
    pub fn empty(model_key: impl Into<String>, built_at: DateTime<Utc>) -> Self {
        Self { index: None, sentences: Vec::new(), model_key: model_key.into(), built_at }
    }

    /// Ensambla un snapshot a partir de detecciones y sus embeddings.
    pub fn assemble(
        records: Vec<DetectionRecord>,
        embeddings: Vec<Vec<f64>>,
        model_key: impl Into<String>,
        built_at: DateTime<Utc>,
    ) -> Result<Self> {
        let model_key = model_key.into();
        if records.is_empty() {
            return Ok(Self::empty(model_key, built_at));
        }
        if embeddings.len() != records.len() {
            return Err(anyhow!(
                "Número de embeddings ({}) distinto al número de frases ({})",
                embeddings.len(),
                records.len()
            ));
        }
        let index = SearchIndex::build(embeddings)?;
        let sentences = records
            .into_iter()
            .map(|source| IndexedSentence { text: source.to_sentence(), source })
            .collect();
        Ok(Self { index: Some(index), sentences, model_key, built_at })
    }

    pub fn index(&self) -> Option<&SearchIndex> {
        self.index.as_ref()
    }

    pub fn len(&self) -> usize {
        self.sentences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sentences.is_empty()
    }

    pub fn model_key(&self) -> &str {
        &self.model_key
    }

    #[cfg(test)]
    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.sentences.iter().map(|s| s.text.as_str())
    }

    #[cfg(test)]
    pub fn records(&self) -> impl Iterator<Item = &DetectionRecord> {
        self.sentences.iter().map(|s| &s.source)
    }

    /// Los `min(k, len)` vecinos de `query` con su frase. Sin índice: vacío.
    pub fn nearest(&self, query: &[f64], k: usize) -> Result<Vec<(&IndexedSentence, f64)>> {
        let Some(index) = &self.index else {
            return Ok(Vec::new());
        };
        Ok(index
            .search(query, k)?
            .into_iter()
            .map(|n| (&self.sentences[n.position], n.distance))
            .collect())
    }
}

/// Resultado de `rebuild`, con los avisos no fatales que haya generado.
#[derive(Debug)]
pub struct RebuildOutcome {
    pub snapshot: IndexSnapshot,
    pub notices: Vec<String>,
}

/// Reconstruye el índice con las `limit` detecciones más recientes.
///
/// Si la base de datos no responde se construye un snapshot vacío con aviso.
/// Un fallo del embedder es un error: el llamador conserva el snapshot anterior.
pub async fn rebuild(
    source: &dyn DetectionSource,
    embedder: &dyn Embedder,
    limit: usize,
) -> Result<RebuildOutcome> {
    let mut notices = Vec::new();
    let records = detection_store::fetch_recent_or_empty(source, limit, &mut notices).await;
    let built_at = Utc::now();

    if records.is_empty() {
        info!("Sin detecciones recientes: índice vacío.");
        return Ok(RebuildOutcome {
            snapshot: IndexSnapshot::empty(embedder.model_key(), built_at),
            notices,
        });
    }

    let texts: Vec<String> = records.iter().map(DetectionRecord::to_sentence).collect();
    let embeddings = embedder.embed(&texts).await?;
    let snapshot = IndexSnapshot::assemble(records, embeddings, embedder.model_key(), built_at)?;

    info!(
        "Índice reconstruido: {} frases (modelo {}).",
        snapshot.len(),
        snapshot.model_key()
    );
    Ok(RebuildOutcome { snapshot, notices })
}

/// `true` si han pasado estrictamente más de `interval` desde `last_built`.
pub fn needs_refresh(last_built: DateTime<Utc>, now: DateTime<Utc>, interval: Duration) -> bool {
    let elapsed = now.signed_duration_since(last_built);
    match chrono::Duration::from_std(interval) {
        Ok(interval) => elapsed > interval,
        Err(_) => {
            warn!("Intervalo de refresco fuera de rango: {:?}", interval);
            false
        }
    }
}
