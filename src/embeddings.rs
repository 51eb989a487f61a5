//! Embedding database: maps every unique topic to a dense vector, cached on
//! disk and refreshed in batches from the embedding provider.

use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::ingest::{IngestOutput, TopicOccurrence, UniqueTopic};
use crate::pipeline::CancellationToken;
use crate::taxonomy::write_json_atomic;

/// Bumped whenever the database layout or the embedding text contract
/// changes; a mismatch forces a full recompute.
pub const SCHEMA_VERSION: u32 = 1;

pub const DATABASE_FILE: &str = "topic-embeddings.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingDatabase {
    pub schema_version: u32,
    pub created_at: String,
    pub embedding_model: String,
    pub embedding_dimensions: usize,
    pub total_topics_raw: usize,
    pub topics: Vec<EmbeddedTopic>,
}

/// A unique topic plus its stable id (index in the database) and vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedTopic {
    pub id: usize,
    pub topic: String,
    pub keywords: Vec<String>,
    pub count: usize,
    pub episodes: Vec<u32>,
    #[serde(default)]
    pub occurrences: Vec<TopicOccurrence>,
    pub embedding: Vec<f64>,
}

/// The text sent to the provider for one topic. This serialization is part
/// of the cache contract and must stay stable across runs.
pub fn embedding_text(topic: &UniqueTopic) -> String {
    let mut lines = vec![format!("Topic: {}", topic.topic)];
    let subjects = top_subjects(topic, 3);
    if !subjects.is_empty() {
        lines.push(format!("Subject: {}", subjects.join(", ")));
    }
    if !topic.keywords.is_empty() {
        let keywords: Vec<&str> = topic.keywords.iter().take(12).map(String::as_str).collect();
        lines.push(format!("Keywords: {}", keywords.join(", ")));
    }
    lines.join("\n")
}

/// Most frequent subject labels over the topic's occurrences, ties broken by
/// first appearance.
fn top_subjects(topic: &UniqueTopic, limit: usize) -> Vec<String> {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for occurrence in &topic.occurrences {
        let Some(subject) = &occurrence.subject else {
            continue;
        };
        let label = match (subject.coarse.as_deref(), subject.fine.as_deref()) {
            (Some(coarse), Some(fine)) => format!("{coarse} / {fine}"),
            (Some(coarse), None) => coarse.to_string(),
            (None, Some(fine)) => fine.to_string(),
            (None, None) => continue,
        };
        if label.trim().is_empty() {
            continue;
        }
        match counts.iter_mut().find(|(l, _)| *l == label) {
            Some(entry) => entry.1 += 1,
            None => counts.push((label, 1)),
        }
    }
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts.into_iter().take(limit).map(|(l, _)| l).collect()
}

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f64>,
}

pub struct EmbeddingStore<'a> {
    cfg: &'a PipelineConfig,
    client: reqwest::Client,
    db_path: PathBuf,
}

impl<'a> EmbeddingStore<'a> {
    pub fn new(cfg: &'a PipelineConfig) -> Self {
        Self {
            cfg,
            client: reqwest::Client::new(),
            db_path: cfg.output_dir.join(DATABASE_FILE),
        }
    }

    pub fn database_path(&self) -> &Path {
        &self.db_path
    }

    /// Return an up-to-date embedding database for the ingested topics,
    /// reusing the on-disk one when it still matches.
    pub async fn ensure(
        &self,
        ingest: &IngestOutput,
        cancel: &CancellationToken,
    ) -> Result<EmbeddingDatabase> {
        if !self.cfg.force_refresh_embeddings {
            if let Some(db) = self.load_cached() {
                if db.schema_version == SCHEMA_VERSION
                    && db.embedding_model == self.cfg.embedding_model
                    && db.topics.len() == ingest.topics.len()
                {
                    info!(
                        topics = db.topics.len(),
                        model = %db.embedding_model,
                        created_at = %db.created_at,
                        "reusing cached embedding database"
                    );
                    return Ok(db);
                }
                info!(
                    cached = db.topics.len(),
                    current = ingest.topics.len(),
                    "cached embedding database is stale, recomputing"
                );
            }
        }
        self.recompute(ingest, cancel).await
    }

    fn load_cached(&self) -> Option<EmbeddingDatabase> {
        if !self.db_path.exists() {
            return None;
        }
        match std::fs::read_to_string(&self.db_path)
            .map_err(|e| e.to_string())
            .and_then(|s| serde_json::from_str(&s).map_err(|e| e.to_string()))
        {
            Ok(db) => Some(db),
            Err(reason) => {
                warn!(path = %self.db_path.display(), %reason, "ignoring unreadable embedding database");
                None
            }
        }
    }

    async fn recompute(
        &self,
        ingest: &IngestOutput,
        cancel: &CancellationToken,
    ) -> Result<EmbeddingDatabase> {
        let texts: Vec<String> = ingest.topics.iter().map(embedding_text).collect();
        let batch_size = self.cfg.embedding_batch_size.max(1);
        let batch_count = texts.len().div_ceil(batch_size);
        info!(
            topics = texts.len(),
            batches = batch_count,
            model = %self.cfg.embedding_model,
            "fetching embeddings"
        );
        let pb = ProgressBar::new(batch_count as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("   [{bar:40.cyan/blue}] {pos}/{len} Batches")
                .expect("static template")
                .progress_chars("#>-"),
        );

        let mut vectors: Vec<Vec<f64>> = Vec::with_capacity(texts.len());
        for (i, batch) in texts.chunks(batch_size).enumerate() {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            if i > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(
                    self.cfg.inter_batch_delay_ms,
                ))
                .await;
            }
            vectors.extend(self.fetch_batch(batch, cancel).await?);
            pb.inc(1);
        }
        pb.finish_and_clear();

        let dimensions = vectors.first().map(|v| v.len()).unwrap_or(0);
        for v in &vectors {
            if v.len() != dimensions {
                return Err(PipelineError::DimensionMismatch {
                    expected: dimensions,
                    found: v.len(),
                });
            }
        }

        let topics = ingest
            .topics
            .iter()
            .zip(vectors)
            .enumerate()
            .map(|(id, (t, embedding))| EmbeddedTopic {
                id,
                topic: t.topic.clone(),
                keywords: t.keywords.clone(),
                count: t.count,
                episodes: t.episodes.clone(),
                occurrences: t.occurrences.clone(),
                embedding,
            })
            .collect();
        let db = EmbeddingDatabase {
            schema_version: SCHEMA_VERSION,
            created_at: chrono::Utc::now().to_rfc3339(),
            embedding_model: self.cfg.embedding_model.clone(),
            embedding_dimensions: dimensions,
            total_topics_raw: ingest.total_topics_raw,
            topics,
        };
        write_json_atomic(&self.db_path, &db)?;
        info!(path = %self.db_path.display(), "embedding database written");
        Ok(db)
    }

    /// Fetch one batch, retrying rate limits and transient network failures
    /// with exponential backoff.
    async fn fetch_batch(
        &self,
        inputs: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f64>>> {
        let url = format!("{}/embeddings", self.cfg.llm_base_url);
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.cfg.llm_api_key)
                .json(&EmbeddingsRequest {
                    model: &self.cfg.embedding_model,
                    input: inputs,
                })
                .send()
                .await;
            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.as_u16() == 429 {
                        if attempt < self.cfg.max_retries {
                            let backoff_ms = self
                                .cfg
                                .retry_delay_ms
                                .saturating_mul(2u64.saturating_pow(attempt));
                            warn!(
                                attempt = attempt + 1,
                                max = self.cfg.max_retries,
                                backoff_ms,
                                "embedding provider rate limit, backing off"
                            );
                            tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(PipelineError::RateLimitExhausted { attempts: attempt });
                    }
                    if !status.is_success() {
                        let body = resp.text().await.unwrap_or_default();
                        return Err(PipelineError::EmbeddingBackend {
                            status: status.as_u16(),
                            body,
                        });
                    }
                    let parsed: EmbeddingsResponse = resp.json().await.map_err(|e| {
                        PipelineError::EmbeddingBackend {
                            status: status.as_u16(),
                            body: format!("invalid embeddings JSON: {e}"),
                        }
                    })?;
                    if parsed.data.len() != inputs.len() {
                        return Err(PipelineError::EmbeddingBackend {
                            status: status.as_u16(),
                            body: format!(
                                "expected {} vectors, got {}",
                                inputs.len(),
                                parsed.data.len()
                            ),
                        });
                    }
                    return Ok(parsed.data.into_iter().map(|d| d.embedding).collect());
                }
                Err(e) => {
                    if attempt < self.cfg.max_retries {
                        let backoff_ms = self
                            .cfg
                            .retry_delay_ms
                            .saturating_mul(2u64.saturating_pow(attempt));
                        warn!(
                            error = %e,
                            attempt = attempt + 1,
                            max = self.cfg.max_retries,
                            backoff_ms,
                            "embedding request failed, retrying"
                        );
                        tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(PipelineError::NetworkTransient {
                        reason: e.to_string(),
                    });
                }
            }
        }
    }
}
