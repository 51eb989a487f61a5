use std::path::PathBuf;

use serde::Deserialize;

use crate::distance::Linkage;
use crate::error::{PipelineError, Result};

/// Words that carry no category information in topic titles. Used as the
/// default for `topicClustering.stopWords`.
const DEFAULT_STOP_WORDS: &[&str] = &[
    "und",
    "der",
    "die",
    "das",
    "in",
    "im",
    "von",
    "für",
    "mit",
    "über",
    "zur",
    "zum",
    "diskussion",
    "thema",
    "themen",
    "aspekte",
    "entwicklung",
    "entwicklungen",
    "nutzung",
    "verwendung",
    "einsatz",
    "einfluss",
    "bedeutung",
    "rolle",
    "allgemein",
    "allgemeine",
    "verschiedene",
    "aktuelle",
    "neue",
    "neuen",
    "technologie",
    "technologien",
    "technik",
    "technisch",
    "technische",
    "zukunft",
    "zukünftige",
    "trends",
    "trend",
];

pub fn default_stop_words() -> Vec<String> {
    DEFAULT_STOP_WORDS.iter().map(|w| w.to_string()).collect()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SettingsFile {
    pub llm: Option<LlmSettings>,
    #[serde(rename = "topicClustering")]
    pub topic_clustering: Option<TopicClusteringSettings>,
    #[serde(rename = "topicExtraction")]
    pub topic_extraction: Option<TopicExtractionSettings>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmSettings {
    #[serde(rename = "baseURL")]
    pub base_url: Option<String>,
    #[serde(rename = "apiKey")]
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TopicClusteringSettings {
    pub clusters: Option<usize>,
    #[serde(rename = "outlierThreshold")]
    pub outlier_threshold: Option<f64>,
    #[serde(rename = "linkageMethod")]
    pub linkage_method: Option<Linkage>,
    #[serde(rename = "useRelevanceWeighting")]
    pub use_relevance_weighting: Option<bool>,
    #[serde(rename = "useLLMNaming")]
    pub use_llm_naming: Option<bool>,
    #[serde(rename = "embeddingModel")]
    pub embedding_model: Option<String>,
    #[serde(rename = "embeddingBatchSize")]
    pub embedding_batch_size: Option<usize>,
    #[serde(rename = "interBatchDelayMs")]
    pub inter_batch_delay_ms: Option<u64>,
    pub model: Option<String>,
    #[serde(rename = "stopWords")]
    pub stop_words: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TopicExtractionSettings {
    #[serde(rename = "requestDelayMs")]
    pub request_delay_ms: Option<u64>,
    #[serde(rename = "maxRetries")]
    pub max_retries: Option<u32>,
    #[serde(rename = "retryDelayMs")]
    pub retry_delay_ms: Option<u64>,
}

/// Fully resolved, immutable pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub episodes_dir: PathBuf,
    pub output_dir: PathBuf,
    pub target_clusters: usize,
    pub outlier_threshold: f64,
    pub linkage: Linkage,
    pub use_relevance_weighting: bool,
    pub use_llm_naming: bool,
    pub embedding_model: String,
    pub embedding_batch_size: usize,
    pub inter_batch_delay_ms: u64,
    pub llm_base_url: String,
    pub llm_api_key: String,
    pub llm_model: String,
    pub temperature: f32,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub request_delay_ms: u64,
    pub stop_words: Vec<String>,
    pub force_refresh_embeddings: bool,
}

fn try_read_json<T: for<'de> Deserialize<'de>>(path: &PathBuf) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read(path)?;
    let parsed: T = serde_json::from_slice(&bytes)
        .map_err(|e| PipelineError::Config(format!("failed to parse {}: {e}", path.display())))?;
    Ok(Some(parsed))
}

fn load_settings() -> Result<(Option<SettingsFile>, String)> {
    // Prefer settings.json, fall back to settings.example.json.
    let settings_path = PathBuf::from("settings.json");
    if let Some(s) = try_read_json::<SettingsFile>(&settings_path)? {
        return Ok((Some(s), "settings.json".to_string()));
    }

    let example_path = PathBuf::from("settings.example.json");
    if let Some(s) = try_read_json::<SettingsFile>(&example_path)? {
        return Ok((Some(s), "settings.example.json".to_string()));
    }

    Ok((None, "env".to_string()))
}

impl PipelineConfig {
    /// Load `settings.json` from the working directory and resolve the
    /// effective configuration. Returns the config together with the name of
    /// the settings source for diagnostics.
    pub fn from_env_and_settings() -> Result<(Self, String)> {
        let (settings, settings_source) = load_settings()?;
        let cfg = Self::resolve(settings.as_ref())?;
        Ok((cfg, settings_source))
    }

    /// Resolve settings against environment overrides and defaults.
    /// Precedence per option: environment variable, settings file, default.
    pub fn resolve(settings: Option<&SettingsFile>) -> Result<Self> {
        let llm = settings.and_then(|s| s.llm.as_ref());
        let clustering = settings.and_then(|s| s.topic_clustering.as_ref());
        let extraction = settings.and_then(|s| s.topic_extraction.as_ref());

        let episodes_dir = PathBuf::from(
            std::env::var("EPISODES_DIR").unwrap_or_else(|_| "episodes".to_string()),
        );
        let output_dir =
            PathBuf::from(std::env::var("OUTPUT_DIR").unwrap_or_else(|_| "db".to_string()));

        let llm_base_url = std::env::var("LLM_BASE_URL")
            .ok()
            .or_else(|| llm.and_then(|l| l.base_url.clone()))
            .ok_or_else(|| {
                PipelineError::Config(
                    "missing LLM base URL (set LLM_BASE_URL or settings.json: llm.baseURL)"
                        .to_string(),
                )
            })?;

        let llm_api_key = std::env::var("LLM_API_KEY")
            .ok()
            .or_else(|| llm.and_then(|l| l.api_key.clone()))
            .ok_or_else(|| {
                PipelineError::Config(
                    "missing LLM API key (set LLM_API_KEY or settings.json: llm.apiKey)"
                        .to_string(),
                )
            })?;

        if llm_api_key.trim().is_empty() || llm_api_key == "YOUR_API_KEY_HERE" {
            return Err(PipelineError::Config(
                "LLM API key is missing/placeholder (set LLM_API_KEY or update settings.json: llm.apiKey)"
                    .to_string(),
            ));
        }

        let base_llm_model = std::env::var("LLM_MODEL")
            .ok()
            .or_else(|| llm.and_then(|l| l.model.clone()))
            .unwrap_or_else(|| "gpt-4o-mini".to_string());

        // topicClustering.model overrides the base chat model for naming.
        let llm_model = clustering
            .and_then(|c| c.model.clone())
            .unwrap_or(base_llm_model);

        let embedding_model = std::env::var("EMBEDDING_MODEL")
            .ok()
            .or_else(|| clustering.and_then(|c| c.embedding_model.clone()))
            .unwrap_or_else(|| "text-embedding-3-small".to_string());

        Ok(Self {
            episodes_dir,
            output_dir,
            target_clusters: clustering.and_then(|c| c.clusters).unwrap_or(256),
            outlier_threshold: clustering.and_then(|c| c.outlier_threshold).unwrap_or(0.7),
            linkage: clustering
                .and_then(|c| c.linkage_method)
                .unwrap_or(Linkage::Weighted),
            use_relevance_weighting: clustering
                .and_then(|c| c.use_relevance_weighting)
                .unwrap_or(true),
            use_llm_naming: clustering.and_then(|c| c.use_llm_naming).unwrap_or(true),
            embedding_model,
            embedding_batch_size: clustering
                .and_then(|c| c.embedding_batch_size)
                .unwrap_or(100),
            inter_batch_delay_ms: clustering
                .and_then(|c| c.inter_batch_delay_ms)
                .unwrap_or(500),
            llm_base_url: llm_base_url.trim_end_matches('/').to_string(),
            llm_api_key,
            llm_model,
            temperature: llm.and_then(|l| l.temperature).unwrap_or(0.3),
            max_retries: extraction.and_then(|e| e.max_retries).unwrap_or(3),
            retry_delay_ms: extraction.and_then(|e| e.retry_delay_ms).unwrap_or(5000),
            request_delay_ms: extraction.and_then(|e| e.request_delay_ms).unwrap_or(1000),
            stop_words: clustering
                .and_then(|c| c.stop_words.clone())
                .unwrap_or_else(default_stop_words),
            force_refresh_embeddings: false,
        })
    }
}
