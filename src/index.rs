use std::sync::Arc;

use serde_json::json;

use crate::embedder::{IMAGE_EMBEDDING_DIM, TEXT_EMBEDDING_DIM};
use crate::store::{Distance, FieldMatch, ScoredPoint, StoreError, VectorStore};

/// Default collection for image embeddings.
pub const IMAGE_COLLECTION: &str = "image_vectors";
/// Default collection for text embeddings.
pub const TEXT_COLLECTION: &str = "text_vectors";

/// Semantic index for image embeddings. Represents visual memory.
pub struct ImageIndex {
    store: Arc<dyn VectorStore>,
    collection: String,
}

impl ImageIndex {
    pub fn new(store: Arc<dyn VectorStore>, collection: impl Into<String>) -> Result<Self, StoreError> {
        let collection = collection.into();
        store.ensure_collection(&collection, IMAGE_EMBEDDING_DIM, Distance::Cosine)?;
        Ok(Self { store, collection })
    }

    /// Nearest stored images, optionally restricted to one source.
    pub fn search_similar(
        &self,
        embedding: &[f32],
        source_id: Option<&str>,
        top_k: usize,
        score_threshold: Option<f32>,
    ) -> Result<Vec<ScoredPoint>, StoreError> {
        let filter = source_id.map(|id| FieldMatch::new("source_id", id));
        self.store.search(
            &self.collection,
            embedding,
            top_k,
            score_threshold,
            filter.as_ref(),
        )
    }

    /// Store a new image embedding. Extra metadata keys are merged into the
    /// payload alongside the standard fields.
    pub fn add(
        &self,
        embedding: &[f32],
        source_id: &str,
        timestamp: f64,
        frame_description: Option<&str>,
        metadata: serde_json::Value,
    ) -> Result<String, StoreError> {
        let mut payload = json!({
            "source_id": source_id,
            "timestamp": timestamp,
        });
        if let Some(description) = frame_description {
            payload["frame_description"] = json!(description);
        }
        if let (Some(target), Some(extra)) = (payload.as_object_mut(), metadata.as_object()) {
            for (key, value) in extra {
                target.insert(key.clone(), value.clone());
            }
        }
        self.store.upsert(&self.collection, embedding, payload)
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }
}

/// Semantic index for text: analysis output, summaries, and any contextual
/// knowledge worth recalling later.
pub struct TextIndex {
    store: Arc<dyn VectorStore>,
    collection: String,
}

impl TextIndex {
    pub fn new(store: Arc<dyn VectorStore>, collection: impl Into<String>) -> Result<Self, StoreError> {
        let collection = collection.into();
        store.ensure_collection(&collection, TEXT_EMBEDDING_DIM, Distance::Cosine)?;
        Ok(Self { store, collection })
    }

    /// Store a text embedding with its description and rolling context.
    pub fn add(
        &self,
        embedding: &[f32],
        frame_description: &str,
        rolling_context: &str,
        source: &str,
        ref_id: Option<&str>,
        timestamp: f64,
    ) -> Result<String, StoreError> {
        let mut payload = json!({
            "frame_description": frame_description,
            "rolling_context": rolling_context,
            "source": source,
            "timestamp": timestamp,
        });
        if let Some(ref_id) = ref_id {
            payload["ref_id"] = json!(ref_id);
        }
        self.store.upsert(&self.collection, embedding, payload)
    }

    /// Relevant text entries, optionally restricted by origin.
    pub fn search_relevant(
        &self,
        embedding: &[f32],
        source: Option<&str>,
        top_k: usize,
        score_threshold: Option<f32>,
    ) -> Result<Vec<ScoredPoint>, StoreError> {
        let filter = source.map(|s| FieldMatch::new("source", s));
        self.store.search(
            &self.collection,
            embedding,
            top_k,
            score_threshold,
            filter.as_ref(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::MemoryStore;

    #[test]
    fn add_merges_metadata_into_payload() {
        let store = Arc::new(MemoryStore::new());
        let index = ImageIndex::new(store.clone(), IMAGE_COLLECTION).expect("index");

        index
            .add(
                &[1.0, 0.0],
                "cam-1",
                1700000000.5,
                Some("empty counter"),
                json!({ "anchor_id": 4, "seq": 17 }),
            )
            .expect("add");

        let records = store.records(IMAGE_COLLECTION);
        assert_eq!(records.len(), 1);
        let payload = &records[0].payload;
        assert_eq!(payload["source_id"], "cam-1");
        assert_eq!(payload["anchor_id"], 4);
        assert_eq!(payload["seq"], 17);
        assert_eq!(payload["frame_description"], "empty counter");
    }

    #[test]
    fn search_restricts_to_source() {
        let store = Arc::new(MemoryStore::new());
        let index = ImageIndex::new(store, IMAGE_COLLECTION).expect("index");

        index
            .add(&[1.0, 0.0], "cam-1", 1.0, None, json!({}))
            .expect("add");
        index
            .add(&[1.0, 0.0], "cam-2", 2.0, None, json!({}))
            .expect("add");

        let hits = index
            .search_similar(&[1.0, 0.0], Some("cam-2"), 10, None)
            .expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].payload["source_id"], "cam-2");
    }

    #[test]
    fn text_index_stores_context_fields() {
        let store = Arc::new(MemoryStore::new());
        let index = TextIndex::new(store.clone(), TEXT_COLLECTION).expect("index");

        index
            .add(
                &[0.5, 0.5],
                "a customer waits",
                "the queue has been building",
                "vlm",
                Some("cam-1"),
                3.0,
            )
            .expect("add");

        let records = store.records(TEXT_COLLECTION);
        assert_eq!(records[0].payload["source"], "vlm");
        assert_eq!(records[0].payload["ref_id"], "cam-1");
        assert_eq!(records[0].payload["rolling_context"], "the queue has been building");
    }
}
