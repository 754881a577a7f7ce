use std::time::Duration;

use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::store::{
    Distance, FieldMatch, FieldRange, ScoredPoint, ScrollPage, StoreError, StoredPoint, VectorStore,
};

const STORE_TIMEOUT: Duration = Duration::from_secs(10);

/// Blocking client for the Qdrant REST API.
#[derive(Debug, Clone)]
pub struct QdrantHttp {
    base_url: String,
    http: Client,
}

#[derive(Deserialize)]
struct ApiEnvelope<T> {
    result: T,
}

#[derive(Deserialize)]
struct ScrollResult {
    #[serde(default)]
    points: Vec<StoredPoint>,
    #[serde(default)]
    next_page_offset: Option<serde_json::Value>,
}

impl QdrantHttp {
    pub fn new(base_url: impl Into<String>) -> Result<Self, StoreError> {
        let http = Client::builder().timeout(STORE_TIMEOUT).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/collections/{collection}", self.base_url)
    }

    fn check(response: reqwest::blocking::Response) -> Result<reqwest::blocking::Response, StoreError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().unwrap_or_default();
        Err(StoreError::UnexpectedStatus { status, body })
    }

    fn match_clause(filter: &FieldMatch) -> serde_json::Value {
        json!({ "must": [{ "key": filter.key, "match": { "value": filter.value } }] })
    }

    fn range_clause(range: &FieldRange) -> serde_json::Value {
        let mut bounds = serde_json::Map::new();
        if let Some(gte) = range.gte {
            bounds.insert("gte".to_string(), json!(gte));
        }
        if let Some(lte) = range.lte {
            bounds.insert("lte".to_string(), json!(lte));
        }
        json!({ "must": [{ "key": range.key, "range": bounds }] })
    }

    fn search_body(
        vector: &[f32],
        limit: usize,
        score_threshold: Option<f32>,
        filter: Option<&FieldMatch>,
    ) -> serde_json::Value {
        let mut body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
        });
        if let Some(threshold) = score_threshold {
            body["score_threshold"] = json!(threshold);
        }
        if let Some(filter) = filter {
            body["filter"] = Self::match_clause(filter);
        }
        body
    }
}

impl VectorStore for QdrantHttp {
    fn ensure_collection(
        &self,
        collection: &str,
        vector_size: usize,
        distance: Distance,
    ) -> Result<(), StoreError> {
        let url = self.collection_url(collection);
        let existing = self.http.get(&url).send()?;
        if existing.status().is_success() {
            return Ok(());
        }

        let body = json!({
            "vectors": { "size": vector_size, "distance": distance.as_str() }
        });
        Self::check(self.http.put(&url).json(&body).send()?)?;
        info!(collection, vector_size, "vector collection created");
        Ok(())
    }

    fn upsert(
        &self,
        collection: &str,
        vector: &[f32],
        payload: serde_json::Value,
    ) -> Result<String, StoreError> {
        let point_id = Uuid::new_v4().to_string();
        let url = format!("{}/points?wait=true", self.collection_url(collection));
        let body = json!({
            "points": [{ "id": point_id, "vector": vector, "payload": payload }]
        });
        Self::check(self.http.put(url).json(&body).send()?)?;
        Ok(point_id)
    }

    fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        score_threshold: Option<f32>,
        filter: Option<&FieldMatch>,
    ) -> Result<Vec<ScoredPoint>, StoreError> {
        let url = format!("{}/points/search", self.collection_url(collection));
        let body = Self::search_body(vector, limit, score_threshold, filter);
        let response = Self::check(self.http.post(url).json(&body).send()?)?;
        let envelope: ApiEnvelope<Vec<ScoredPoint>> = response
            .json()
            .map_err(|err| StoreError::Decode(err.to_string()))?;
        Ok(envelope.result)
    }

    fn delete_where(&self, collection: &str, range: &FieldRange) -> Result<(), StoreError> {
        let url = format!("{}/points/delete?wait=true", self.collection_url(collection));
        let body = json!({ "filter": Self::range_clause(range) });
        Self::check(self.http.post(url).json(&body).send()?)?;
        Ok(())
    }

    fn scroll(
        &self,
        collection: &str,
        limit: usize,
        offset: Option<&str>,
    ) -> Result<ScrollPage, StoreError> {
        let url = format!("{}/points/scroll", self.collection_url(collection));
        let mut body = json!({ "limit": limit, "with_payload": true });
        if let Some(offset) = offset {
            body["offset"] = json!(offset);
        }
        let response = Self::check(self.http.post(url).json(&body).send()?)?;
        let envelope: ApiEnvelope<ScrollResult> = response
            .json()
            .map_err(|err| StoreError::Decode(err.to_string()))?;
        let next_offset = envelope.result.next_page_offset.map(|value| match value {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        });
        Ok(ScrollPage {
            points: envelope.result.points,
            next_offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_body_includes_filter_and_threshold() {
        let filter = FieldMatch::new("source_id", "cam-1");
        let body = QdrantHttp::search_body(&[0.1, 0.2], 5, Some(0.85), Some(&filter));

        assert_eq!(body["limit"], 5);
        assert_eq!(body["with_payload"], true);
        assert_eq!(body["score_threshold"], 0.85);
        assert_eq!(body["filter"]["must"][0]["key"], "source_id");
        assert_eq!(body["filter"]["must"][0]["match"]["value"], "cam-1");
    }

    #[test]
    fn search_body_omits_optional_fields() {
        let body = QdrantHttp::search_body(&[0.1], 3, None, None);
        assert!(body.get("score_threshold").is_none());
        assert!(body.get("filter").is_none());
    }

    #[test]
    fn range_clause_carries_bounds() {
        let clause = QdrantHttp::range_clause(&FieldRange::lte("seq", 42.0));
        assert_eq!(clause["must"][0]["key"], "seq");
        assert_eq!(clause["must"][0]["range"]["lte"], 42.0);
        assert!(clause["must"][0]["range"].get("gte").is_none());
    }

    #[test]
    fn scored_point_deserializes_from_api_shape() {
        let raw = r#"{"id":"7b2d","score":0.91,"payload":{"source_id":"cam-1","anchor_id":3}}"#;
        let point: ScoredPoint = serde_json::from_str(raw).expect("decode");
        assert_eq!(point.id, "7b2d");
        assert!((point.score - 0.91).abs() < 1e-6);
        assert_eq!(point.payload["anchor_id"], 3);
    }
}
