use crate::index::ImageIndex;
use crate::store::StoreError;

/// Why a frame was reported as anomalous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyReason {
    NoSimilarVectors,
    SimilarityDrop,
}

impl AnomalyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyReason::NoSimilarVectors => "no_similar_vectors",
            AnomalyReason::SimilarityDrop => "similarity_drop",
        }
    }
}

/// Anomaly details handed to the reporting hook.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnomalyReport {
    pub reason: AnomalyReason,
    pub similarity: f32,
    pub anchor_id: Option<u64>,
}

/// Runtime verdict for one accepted frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Classification {
    Ok { similarity: f32 },
    Anomaly(AnomalyReport),
}

/// Compares accepted frames against the frozen anchor set. Read-only: the
/// detector never writes to the image index.
pub struct AnomalyDetector {
    index: ImageIndex,
    anomaly_threshold: f32,
    top_k: usize,
}

impl AnomalyDetector {
    pub fn new(index: ImageIndex, anomaly_threshold: f32, top_k: usize) -> Self {
        Self {
            index,
            anomaly_threshold,
            top_k,
        }
    }

    /// Classify one embedding against the learned anchors of its source.
    pub fn classify(&self, embedding: &[f32], source_id: &str) -> Result<Classification, StoreError> {
        let hits = self
            .index
            .search_similar(embedding, Some(source_id), self.top_k, None)?;

        let Some(best) = hits.first() else {
            return Ok(Classification::Anomaly(AnomalyReport {
                reason: AnomalyReason::NoSimilarVectors,
                similarity: 0.0,
                anchor_id: None,
            }));
        };

        let anchor_id = best.payload.get("anchor_id").and_then(|v| v.as_u64());
        if best.score < self.anomaly_threshold {
            return Ok(Classification::Anomaly(AnomalyReport {
                reason: AnomalyReason::SimilarityDrop,
                similarity: best.score,
                anchor_id,
            }));
        }

        Ok(Classification::Ok {
            similarity: best.score,
        })
    }
}
