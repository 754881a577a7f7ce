use std::fmt;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, multipart};
use serde::Deserialize;

/// Image embedding dimension (CLIP ViT-B/16).
pub const IMAGE_EMBEDDING_DIM: usize = 512;
/// Text embedding dimension.
pub const TEXT_EMBEDDING_DIM: usize = 1024;

const EMBED_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from the embedding service.
#[derive(Debug)]
pub enum EmbedError {
    Http(reqwest::Error),
    UnexpectedStatus { status: StatusCode, body: String },
    Empty,
    Dimension { expected: usize, got: usize },
}

impl fmt::Display for EmbedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmbedError::Http(err) => write!(f, "embedding http error: {err}"),
            EmbedError::UnexpectedStatus { status, body } => {
                write!(f, "embedding unexpected status {status}: {body}")
            }
            EmbedError::Empty => write!(f, "embedding service returned an empty vector"),
            EmbedError::Dimension { expected, got } => {
                write!(f, "embedding dimension mismatch: expected {expected}, got {got}")
            }
        }
    }
}

impl std::error::Error for EmbedError {}

impl From<reqwest::Error> for EmbedError {
    fn from(value: reqwest::Error) -> Self {
        EmbedError::Http(value)
    }
}

/// Black-box encoder producing unit-normalized vectors. Implementations must
/// be callable off the sampling threads.
pub trait Embedder: Send + Sync {
    fn embed_image(&self, jpeg: &[u8]) -> Result<Vec<f32>, EmbedError>;

    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbedError>;
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

/// Blocking client for the model server's embedding endpoints.
#[derive(Debug, Clone)]
pub struct HttpEmbedder {
    base_url: String,
    http: Client,
}

impl HttpEmbedder {
    pub fn new(base_url: impl Into<String>) -> Result<Self, EmbedError> {
        let http = Client::builder().timeout(EMBED_TIMEOUT).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    fn validate(vector: Vec<f32>, expected: usize) -> Result<Vec<f32>, EmbedError> {
        if vector.is_empty() {
            return Err(EmbedError::Empty);
        }
        if vector.len() != expected {
            return Err(EmbedError::Dimension {
                expected,
                got: vector.len(),
            });
        }
        Ok(vector)
    }
}

impl Embedder for HttpEmbedder {
    fn embed_image(&self, jpeg: &[u8]) -> Result<Vec<f32>, EmbedError> {
        if jpeg.is_empty() {
            return Err(EmbedError::Empty);
        }

        let url = format!("{}/embeddings/image", self.base_url);
        let part = multipart::Part::bytes(jpeg.to_vec())
            .mime_str("image/jpeg")
            .map_err(EmbedError::Http)?
            .file_name("frame.jpg");
        let form = multipart::Form::new().part("image", part);

        let response = self.http.post(url).multipart(form).send()?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(EmbedError::UnexpectedStatus { status, body });
        }

        let parsed: EmbeddingResponse = response.json()?;
        Self::validate(parsed.embedding, IMAGE_EMBEDDING_DIM)
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let url = format!("{}/embeddings/text", self.base_url);
        let response = self
            .http
            .post(url)
            .json(&serde_json::json!({ "text": text }))
            .send()?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(EmbedError::UnexpectedStatus { status, body });
        }

        let parsed: EmbeddingResponse = response.json()?;
        Self::validate(parsed.embedding, TEXT_EMBEDDING_DIM)
    }
}
