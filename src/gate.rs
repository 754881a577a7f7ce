use std::collections::HashMap;

use tracing::warn;

/// Dot product of two embeddings. Both sides are unit-normalized upstream,
/// so this equals cosine similarity. Returns `None` on a length mismatch or
/// empty input.
pub fn dot(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }
    Some(a.iter().zip(b.iter()).map(|(x, y)| x * y).sum())
}

/// Per-source duplicate gate over a rolling reference embedding.
///
/// The reference is updated only when a frame is accepted as changed, so a
/// slowly drifting scene cannot creep past the gate one near-identical frame
/// at a time. Any internal inconsistency fails open: the frame is treated as
/// changed and the reference reseeded.
#[derive(Default)]
pub struct SimilarityGate {
    references: HashMap<String, Vec<f32>>,
}

impl SimilarityGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the embedding is a near-identical repeat of the previous
    /// accepted frame for this source.
    pub fn is_duplicate(&mut self, source_id: &str, embedding: &[f32], threshold: f32) -> bool {
        if embedding.is_empty() {
            return false;
        }

        let Some(previous) = self.references.get(source_id) else {
            self.references
                .insert(source_id.to_string(), embedding.to_vec());
            return false;
        };

        match dot(previous, embedding) {
            Some(similarity) if similarity >= threshold => true,
            Some(_) => {
                self.references
                    .insert(source_id.to_string(), embedding.to_vec());
                false
            }
            None => {
                warn!(source_id, "reference embedding mismatch, reseeding gate");
                self.references
                    .insert(source_id.to_string(), embedding.to_vec());
                false
            }
        }
    }
}
