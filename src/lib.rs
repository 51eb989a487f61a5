//! Offline topic-clustering pipeline for podcast corpora.
//!
//! Per-episode topic records are folded into unique topics, embedded through
//! an external provider (cached on disk), clustered with weighted
//! agglomerative clustering, named, and emitted as a taxonomy artifact.

pub mod cluster;
pub mod config;
pub mod distance;
pub mod embeddings;
pub mod error;
pub mod ingest;
pub mod naming;
pub mod pipeline;
pub mod taxonomy;

pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use pipeline::CancellationToken;
