//! Pipeline driver: composes ingest, embedding, clustering, naming and
//! emission, holds the output-directory lock, and honors cooperative
//! cancellation between phases.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fs2::FileExt;
use tracing::info;

use crate::cluster::{self, ClusterOptions};
use crate::config::PipelineConfig;
use crate::embeddings::EmbeddingStore;
use crate::error::{PipelineError, Result};
use crate::ingest;
use crate::naming;
use crate::taxonomy::{self, Taxonomy, TAXONOMY_FILE};

/// Cooperative cancellation token checked at suspension points and between
/// clustering iterations.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

const LOCK_FILE: &str = ".atlas.lock";

/// Advisory exclusive lock on the output directory. Held for the whole run;
/// released on drop on every exit path.
#[derive(Debug)]
pub struct OutputLock {
    file: File,
    path: PathBuf,
}

impl OutputLock {
    pub fn acquire(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LOCK_FILE);
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)?;
        file.try_lock_exclusive()
            .map_err(|_| PipelineError::LockHeld {
                dir: dir.to_path_buf(),
            })?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for OutputLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(PipelineError::Cancelled)
    } else {
        Ok(())
    }
}

/// Run the full pipeline and return the emitted taxonomy.
///
/// No partial artifact survives a failure or cancellation: the embedding
/// database and the taxonomy are each written atomically, and the taxonomy
/// only after every phase has completed.
pub async fn run(cfg: &PipelineConfig, cancel: &CancellationToken) -> Result<Taxonomy> {
    let _lock = OutputLock::acquire(&cfg.output_dir)?;
    checkpoint(cancel)?;

    info!(dir = %cfg.episodes_dir.display(), "ingesting episode topics");
    let ingested = ingest::ingest_episodes(&cfg.episodes_dir)?;
    info!(
        unique = ingested.topics.len(),
        raw = ingested.total_topics_raw,
        "unique topics collected"
    );
    checkpoint(cancel)?;

    let store = EmbeddingStore::new(cfg);
    let db = store.ensure(&ingested, cancel).await?;
    checkpoint(cancel)?;

    let opts = ClusterOptions {
        linkage: cfg.linkage,
        use_relevance_weighting: cfg.use_relevance_weighting,
        outlier_threshold: cfg.outlier_threshold,
    };
    let clusters = cluster::cluster_topics(&db.topics, cfg.target_clusters, &opts, cancel)?;
    info!(clusters = clusters.len(), "clustering finished");
    checkpoint(cancel)?;

    let named = naming::name_clusters(&clusters, &db.topics, cfg, cancel).await?;
    checkpoint(cancel)?;

    let taxonomy = taxonomy::build_taxonomy(named, &db, cfg);
    let taxonomy_path = cfg.output_dir.join(TAXONOMY_FILE);
    taxonomy::write_json_atomic(&taxonomy_path, &taxonomy)?;
    info!(
        path = %taxonomy_path.display(),
        clusters = taxonomy.statistics.cluster_count,
        outliers = taxonomy.statistics.outlier_count,
        "taxonomy written"
    );
    Ok(taxonomy)
}
