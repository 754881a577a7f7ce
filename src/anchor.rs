use serde_json::json;
use tracing::{debug, info, warn};

use crate::index::ImageIndex;
use crate::store::{FieldRange, StoreError};

/// Rising match-threshold schedule. The bar starts at `base` and climbs by
/// `step` every `step_size` accepted frames, tightening clusters as data
/// accumulates to counteract gradual visual drift. Never exceeds `max`.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdSchedule {
    pub base: f32,
    pub max: f32,
    pub step: f32,
    pub step_size: u64,
}

impl ThresholdSchedule {
    /// Threshold in effect at the given ingest sequence.
    pub fn at(&self, seq: u64) -> f32 {
        let raised = self.base + (seq / self.step_size.max(1)) as f32 * self.step;
        raised.min(self.max)
    }
}

/// Result of assigning one accepted frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Assignment {
    pub anchor_id: u64,
    pub seq: u64,
    /// True when an existing anchor was reused, false when one was minted.
    pub matched: bool,
    pub similarity: Option<f32>,
}

/// Training-time clustering over the image index. Each accepted frame joins
/// the nearest existing anchor or starts a new one; every frame is persisted
/// with its anchor id and a strictly increasing ingest sequence number.
pub struct AnchorIndex {
    index: ImageIndex,
    schedule: ThresholdSchedule,
    top_k: usize,
    next_anchor_id: u64,
    ingest_seq: u64,
    frozen: bool,
}

impl AnchorIndex {
    pub fn new(index: ImageIndex, schedule: ThresholdSchedule, top_k: usize) -> Self {
        Self {
            index,
            schedule,
            top_k,
            next_anchor_id: 1,
            ingest_seq: 0,
            frozen: false,
        }
    }

    pub fn ingest_seq(&self) -> u64 {
        self.ingest_seq
    }

    /// Restore the counters of an interrupted run by scanning the stored
    /// records. The sequence counter resumes past the highest stored `seq`
    /// and anchor minting past the highest stored `anchor_id`.
    pub fn resume_from_store(&mut self, page_size: usize) -> Result<(), StoreError> {
        let mut max_seq = 0u64;
        let mut max_anchor = 0u64;
        let mut offset: Option<String> = None;

        loop {
            let page = self
                .index
                .store()
                .scroll(self.index.collection(), page_size, offset.as_deref())?;
            for point in &page.points {
                if let Some(seq) = point.payload.get("seq").and_then(|v| v.as_u64()) {
                    max_seq = max_seq.max(seq);
                }
                if let Some(anchor) = point.payload.get("anchor_id").and_then(|v| v.as_u64()) {
                    max_anchor = max_anchor.max(anchor);
                }
            }
            match page.next_offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }

        self.ingest_seq = max_seq;
        self.next_anchor_id = max_anchor + 1;
        info!(
            ingest_seq = self.ingest_seq,
            next_anchor_id = self.next_anchor_id,
            "anchor counters resumed from store"
        );
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Assign the frame to an anchor and persist it. Returns `None` once the
    /// run is frozen. Counters advance only after the write succeeds, so a
    /// failing store call never corrupts them.
    pub fn assign(
        &mut self,
        embedding: &[f32],
        source_id: &str,
        timestamp: f64,
    ) -> Result<Option<Assignment>, StoreError> {
        if self.frozen {
            return Ok(None);
        }

        let threshold = self.schedule.at(self.ingest_seq);
        let hits = self
            .index
            .search_similar(embedding, Some(source_id), self.top_k, None)?;

        let matched = hits.first().and_then(|hit| {
            if hit.score < threshold {
                return None;
            }
            match hit.payload.get("anchor_id").and_then(|v| v.as_u64()) {
                Some(anchor_id) => Some((anchor_id, hit.score)),
                None => {
                    warn!(source_id, point_id = %hit.id, "matched vector has no anchor id");
                    None
                }
            }
        });

        let (anchor_id, similarity) = match matched {
            Some((anchor_id, score)) => (anchor_id, Some(score)),
            None => (self.next_anchor_id, None),
        };
        let seq = self.ingest_seq + 1;

        self.index.add(
            embedding,
            source_id,
            timestamp,
            None,
            json!({
                "anchor_id": anchor_id,
                "seq": seq,
                "pipeline": "cycle_training",
            }),
        )?;

        self.ingest_seq = seq;
        if matched.is_none() {
            self.next_anchor_id += 1;
            info!(source_id, anchor_id, seq, threshold, "new anchor minted");
        } else {
            debug!(source_id, anchor_id, seq, "frame joined anchor");
        }

        Ok(Some(Assignment {
            anchor_id,
            seq,
            matched: matched.is_some(),
            similarity,
        }))
    }

    /// Delete the oldest `percent` of the run by ingest sequence, then
    /// freeze it: the learned set is final and further frames are ignored.
    /// A second call after freezing is a no-op.
    pub fn prune_oldest(&mut self, percent: u32) -> Result<u64, StoreError> {
        if self.frozen {
            return Ok(0);
        }

        let cutoff = self.ingest_seq * u64::from(percent) / 100;
        if cutoff > 0 {
            self.index
                .store()
                .delete_where(self.index.collection(), &FieldRange::lte("seq", cutoff as f64))?;
        }
        self.frozen = true;
        info!(
            cutoff,
            total = self.ingest_seq,
            percent,
            "index pruned, training frozen"
        );
        Ok(cutoff)
    }
}
