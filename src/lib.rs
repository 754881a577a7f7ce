//! Similarity-gated visual ingestion core: per-source frame producers, the
//! duplicate gate, anchor clustering for training runs, and runtime anomaly
//! detection against the learned anchor set. Embedding and vector storage are
//! consumed as external services.

pub mod anchor;
pub mod config;
pub mod detector;
pub mod embedder;
pub mod frame;
pub mod gate;
pub mod index;
pub mod logging;
pub mod pipeline;
pub mod registry;
pub mod runner;
pub mod source;
pub mod store;
pub mod vlm;
