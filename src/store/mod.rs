use std::fmt;

use serde::Deserialize;

mod qdrant;

pub use qdrant::QdrantHttp;

/// Errors from the vector store. Every call is allowed to fail on its own;
/// callers drop the affected frame and keep their in-memory counters intact.
#[derive(Debug)]
pub enum StoreError {
    Http(reqwest::Error),
    UnexpectedStatus { status: reqwest::StatusCode, body: String },
    Decode(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Http(err) => write!(f, "vector store http error: {err}"),
            StoreError::UnexpectedStatus { status, body } => {
                write!(f, "vector store unexpected status {status}: {body}")
            }
            StoreError::Decode(msg) => write!(f, "vector store response decode error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<reqwest::Error> for StoreError {
    fn from(value: reqwest::Error) -> Self {
        StoreError::Http(value)
    }
}

/// Similarity metric for a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distance {
    Cosine,
    Dot,
    Euclid,
}

impl Distance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Distance::Cosine => "Cosine",
            Distance::Dot => "Dot",
            Distance::Euclid => "Euclid",
        }
    }
}

/// Exact-match restriction on one payload field.
#[derive(Debug, Clone)]
pub struct FieldMatch {
    pub key: String,
    pub value: serde_json::Value,
}

impl FieldMatch {
    pub fn new(key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Numeric range restriction on one payload field.
#[derive(Debug, Clone)]
pub struct FieldRange {
    pub key: String,
    pub gte: Option<f64>,
    pub lte: Option<f64>,
}

impl FieldRange {
    pub fn lte(key: impl Into<String>, value: f64) -> Self {
        Self {
            key: key.into(),
            gte: None,
            lte: Some(value),
        }
    }
}

/// One ranked similarity hit.
#[derive(Debug, Clone, Deserialize)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f32,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// One stored record as returned by scroll.
#[derive(Debug, Clone, Deserialize)]
pub struct StoredPoint {
    pub id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// One page of a scroll pass.
#[derive(Debug, Clone)]
pub struct ScrollPage {
    pub points: Vec<StoredPoint>,
    pub next_offset: Option<String>,
}

/// External vector database. All storage and search goes through this seam;
/// no module above it touches the wire protocol.
pub trait VectorStore: Send + Sync {
    /// Create the collection if it does not exist. Idempotent.
    fn ensure_collection(
        &self,
        collection: &str,
        vector_size: usize,
        distance: Distance,
    ) -> Result<(), StoreError>;

    /// Insert a vector with its payload; returns the stored point id.
    fn upsert(
        &self,
        collection: &str,
        vector: &[f32],
        payload: serde_json::Value,
    ) -> Result<String, StoreError>;

    /// Ranked nearest-neighbor search, optionally restricted by a payload
    /// field match and a minimum score.
    fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        score_threshold: Option<f32>,
        filter: Option<&FieldMatch>,
    ) -> Result<Vec<ScoredPoint>, StoreError>;

    /// Delete every point whose payload field falls inside the range.
    fn delete_where(&self, collection: &str, range: &FieldRange) -> Result<(), StoreError>;

    /// Page through stored points.
    fn scroll(
        &self,
        collection: &str,
        limit: usize,
        offset: Option<&str>,
    ) -> Result<ScrollPage, StoreError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Clone)]
    pub struct StoredRecord {
        pub id: String,
        pub vector: Vec<f32>,
        pub payload: serde_json::Value,
    }

    /// In-memory stand-in for the vector store, with fault injection and
    /// call counters for pipeline tests.
    #[derive(Default)]
    pub struct MemoryStore {
        collections: Mutex<HashMap<String, Vec<StoredRecord>>>,
        next_id: AtomicUsize,
        pub fail_upsert: AtomicBool,
        pub fail_search: AtomicBool,
        pub search_calls: AtomicUsize,
        pub upsert_calls: AtomicUsize,
        pub delete_calls: AtomicUsize,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn records(&self, collection: &str) -> Vec<StoredRecord> {
            self.collections
                .lock()
                .unwrap()
                .get(collection)
                .cloned()
                .unwrap_or_default()
        }

        fn injected_failure() -> StoreError {
            StoreError::Decode("injected failure".to_string())
        }
    }

    fn dot(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
    }

    impl VectorStore for MemoryStore {
        fn ensure_collection(
            &self,
            collection: &str,
            _vector_size: usize,
            _distance: Distance,
        ) -> Result<(), StoreError> {
            self.collections
                .lock()
                .unwrap()
                .entry(collection.to_string())
                .or_default();
            Ok(())
        }

        fn upsert(
            &self,
            collection: &str,
            vector: &[f32],
            payload: serde_json::Value,
        ) -> Result<String, StoreError> {
            self.upsert_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_upsert.load(Ordering::SeqCst) {
                return Err(Self::injected_failure());
            }
            let id = format!("point-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            self.collections
                .lock()
                .unwrap()
                .entry(collection.to_string())
                .or_default()
                .push(StoredRecord {
                    id: id.clone(),
                    vector: vector.to_vec(),
                    payload,
                });
            Ok(id)
        }

        fn search(
            &self,
            collection: &str,
            vector: &[f32],
            limit: usize,
            score_threshold: Option<f32>,
            filter: Option<&FieldMatch>,
        ) -> Result<Vec<ScoredPoint>, StoreError> {
            self.search_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_search.load(Ordering::SeqCst) {
                return Err(Self::injected_failure());
            }
            let collections = self.collections.lock().unwrap();
            let mut hits: Vec<ScoredPoint> = collections
                .get(collection)
                .map(|records| {
                    records
                        .iter()
                        .filter(|record| match filter {
                            Some(m) => record.payload.get(&m.key) == Some(&m.value),
                            None => true,
                        })
                        .map(|record| ScoredPoint {
                            id: record.id.clone(),
                            score: dot(&record.vector, vector),
                            payload: record.payload.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default();
            hits.sort_by(|a, b| b.score.total_cmp(&a.score));
            if let Some(threshold) = score_threshold {
                hits.retain(|hit| hit.score >= threshold);
            }
            hits.truncate(limit);
            Ok(hits)
        }

        fn delete_where(&self, collection: &str, range: &FieldRange) -> Result<(), StoreError> {
            self.delete_calls.fetch_add(1, Ordering::SeqCst);
            let mut collections = self.collections.lock().unwrap();
            if let Some(records) = collections.get_mut(collection) {
                records.retain(|record| {
                    let Some(value) = record.payload.get(&range.key).and_then(|v| v.as_f64())
                    else {
                        return true;
                    };
                    let below_gte = range.gte.is_some_and(|gte| value < gte);
                    let above_lte = range.lte.is_some_and(|lte| value > lte);
                    below_gte || above_lte
                });
            }
            Ok(())
        }

        fn scroll(
            &self,
            collection: &str,
            limit: usize,
            offset: Option<&str>,
        ) -> Result<ScrollPage, StoreError> {
            let collections = self.collections.lock().unwrap();
            let records = collections.get(collection).cloned().unwrap_or_default();
            let start: usize = offset.and_then(|o| o.parse().ok()).unwrap_or(0);
            let end = (start + limit).min(records.len());
            let points = records[start..end]
                .iter()
                .map(|record| StoredPoint {
                    id: record.id.clone(),
                    payload: record.payload.clone(),
                })
                .collect();
            let next_offset = if end < records.len() {
                Some(end.to_string())
            } else {
                None
            };
            Ok(ScrollPage {
                points,
                next_offset,
            })
        }
    }
}
