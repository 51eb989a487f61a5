//! Final taxonomy artifact: stable cluster ordering, statistics, and atomic
//! pretty-printed JSON output.

use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::config::PipelineConfig;
use crate::distance::Linkage;
use crate::embeddings::EmbeddingDatabase;
use crate::error::{PipelineError, Result};
use crate::naming::NamedCluster;

pub const TAXONOMY_FILE: &str = "topic-taxonomy.json";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Taxonomy {
    pub created_at: String,
    pub method: String,
    pub embedding_model: String,
    pub embeddings_created_at: String,
    pub total_topics: usize,
    pub unique_topics: usize,
    pub settings: EffectiveSettings,
    pub statistics: Statistics,
    pub clusters: Vec<TaxonomyCluster>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveSettings {
    pub clusters: usize,
    pub outlier_threshold: f64,
    pub linkage_method: Linkage,
    pub use_relevance_weighting: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    pub cluster_count: usize,
    pub outlier_count: usize,
    pub outlier_percentage: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxonomyCluster {
    pub id: String,
    pub name: String,
    pub description: String,
    pub is_outlier: bool,
    pub topic_count: usize,
    pub episode_count: usize,
    pub sample_topics: Vec<String>,
    pub episodes: Vec<u32>,
}

/// Assemble the taxonomy record. Clusters are sorted by descending episode
/// coverage, ties by ascending slug.
pub fn build_taxonomy(
    mut named: Vec<NamedCluster>,
    db: &EmbeddingDatabase,
    cfg: &PipelineConfig,
) -> Taxonomy {
    named.sort_by(|a, b| {
        b.episode_count
            .cmp(&a.episode_count)
            .then_with(|| a.id.cmp(&b.id))
    });
    let outlier_count = named.iter().filter(|c| c.is_outlier).count();
    let outlier_percentage = if named.is_empty() {
        "0.0%".to_string()
    } else {
        format!(
            "{:.1}%",
            (outlier_count as f64 / named.len() as f64) * 100.0
        )
    };
    Taxonomy {
        created_at: chrono::Utc::now().to_rfc3339(),
        method: "embedding-clustering".to_string(),
        embedding_model: db.embedding_model.clone(),
        embeddings_created_at: db.created_at.clone(),
        total_topics: db.total_topics_raw,
        unique_topics: db.topics.len(),
        settings: EffectiveSettings {
            clusters: cfg.target_clusters,
            outlier_threshold: cfg.outlier_threshold,
            linkage_method: cfg.linkage,
            use_relevance_weighting: cfg.use_relevance_weighting,
        },
        statistics: Statistics {
            cluster_count: named.len(),
            outlier_count,
            outlier_percentage,
        },
        clusters: named
            .into_iter()
            .map(|c| TaxonomyCluster {
                description: format!("{} Topics in {} Episoden", c.topic_count, c.episode_count),
                sample_topics: c.topics.iter().take(5).map(|t| t.topic.clone()).collect(),
                id: c.id,
                name: c.name,
                is_outlier: c.is_outlier,
                topic_count: c.topic_count,
                episode_count: c.episode_count,
                episodes: c.episodes,
            })
            .collect(),
    }
}

/// Write `value` as pretty two-space JSON with a trailing newline, going
/// through a temp file in the same directory so readers never observe a
/// partial artifact.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, format!("{json}\n")).map_err(|source| PipelineError::WriteFailed {
        path: tmp.clone(),
        source,
    })?;
    fs::rename(&tmp, path).map_err(|source| PipelineError::WriteFailed {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}
