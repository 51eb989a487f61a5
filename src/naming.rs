//! Cluster naming: outliers get the reserved name, multi-topic clusters are
//! named by the chat model when enabled, everything else falls back to a
//! keyword/word-frequency heuristic over the member topics.

use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::warn;

use crate::cluster::Cluster;
use crate::config::PipelineConfig;
use crate::embeddings::EmbeddedTopic;
use crate::error::{PipelineError, Result};
use crate::pipeline::CancellationToken;

/// Reserved name for outlier clusters.
pub const OUTLIER_NAME: &str = "Sonstige";

#[derive(Debug, Clone, Serialize)]
pub struct NamedCluster {
    pub id: String,
    pub name: String,
    #[serde(rename = "isOutlier")]
    pub is_outlier: bool,
    #[serde(rename = "topicCount")]
    pub topic_count: usize,
    #[serde(rename = "episodeCount")]
    pub episode_count: usize,
    pub topics: Vec<ClusterTopic>,
    pub episodes: Vec<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterTopic {
    pub topic: String,
    pub count: usize,
    pub keywords: Vec<String>,
}

// ----------------------------------------------------------------------------
// Heuristic naming
// ----------------------------------------------------------------------------

/// Frequency table that remembers insertion order so ties stay deterministic.
#[derive(Default)]
struct WeightTable {
    entries: Vec<(String, f64)>,
    index: HashMap<String, usize>,
}

impl WeightTable {
    fn add(&mut self, key: String, weight: f64) {
        match self.index.get(&key) {
            Some(&i) => self.entries[i].1 += weight,
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, weight));
            }
        }
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => {
            let mut s = first.to_uppercase().to_string();
            s.push_str(chars.as_str());
            s
        }
        None => String::new(),
    }
}

/// Name a cluster from the dominant words of its member topics and keywords.
///
/// Keywords count double. The top candidate wins outright when it is more
/// than twice as frequent as the runner-up, otherwise both are joined.
pub fn heuristic_name(
    items: &[usize],
    topics: &[EmbeddedTopic],
    use_relevance_weighting: bool,
    stop_words: &HashSet<&str>,
) -> String {
    let mut topic_words = WeightTable::default();
    let mut keyword_counts = WeightTable::default();
    for &idx in items {
        let topic = &topics[idx];
        let weight = if use_relevance_weighting {
            topic.episodes.len().max(1) as f64
        } else {
            1.0
        };
        let words = topic
            .topic
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphabetic() { c } else { ' ' })
            .collect::<String>();
        for word in words
            .split_whitespace()
            .filter(|w| w.chars().count() > 2 && !stop_words.contains(w))
        {
            topic_words.add(word.to_string(), weight);
        }
        for kw in &topic.keywords {
            keyword_counts.add(kw.to_lowercase(), weight);
        }
    }

    let mut combined = topic_words;
    for (kw, count) in keyword_counts.entries {
        combined.add(kw, count * 2.0);
    }
    // Stable sort keeps insertion order on equal counts.
    let mut candidates = combined.entries;
    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    candidates.truncate(3);

    if candidates.is_empty() {
        // Nothing survived the filters; fall back to the first member's
        // display form.
        return match items.first() {
            Some(&idx) => topics[idx].topic.clone(),
            None => OUTLIER_NAME.to_string(),
        };
    }
    let first = capitalize(&candidates[0].0);
    if candidates.len() > 1 && candidates[0].1 <= candidates[1].1 * 2.0 {
        return format!("{} & {}", first, capitalize(&candidates[1].0));
    }
    first
}

/// Lowercased `name` with everything outside alphanumerics and German
/// letters collapsed to single hyphens.
pub fn slugify(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == 'ä' || c == 'ö' || c == 'ü' || c == 'ß' {
                c
            } else {
                '-'
            }
        })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

fn strip_enclosing_quotes(s: &str) -> &str {
    s.trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .trim()
}

// ----------------------------------------------------------------------------
// LLM naming
// ----------------------------------------------------------------------------

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

const NAMING_SYSTEM_PROMPT: &str = r#"Du bist ein Experte für präzise Kategorisierung. Deine Aufgabe ist es, für eine Gruppe von Podcast-Topics einen kurzen, prägnanten Kategorie-Namen zu finden.

Regeln:
- Der Name sollte 1-3 Wörter lang sein
- Sei spezifisch, nicht generisch (z.B. "iPhone" statt "Mobilgeräte", "Podcasting" statt "Medien")
- Wenn es um ein konkretes Produkt/Thema geht, nenne es beim Namen
- Die Topics sind nach Relevanz sortiert - die ersten sind wichtiger!
- Antworte NUR mit dem Kategorie-Namen, nichts anderes"#;

/// Ask the chat model for a cluster name. Rate limits are retried with
/// exponential backoff; every other failure degrades to the heuristic by
/// returning `None`.
async fn request_llm_name(
    client: &reqwest::Client,
    cfg: &PipelineConfig,
    topics: &[String],
    cancel: &CancellationToken,
) -> Option<String> {
    let user_prompt = format!(
        "Finde einen kurzen, prägnanten Namen für diese Gruppe von Topics (sortiert nach Relevanz, wichtigste zuerst):\n\n{}\n\nKategorie-Name:",
        topics
            .iter()
            .map(|t| format!("- {t}"))
            .collect::<Vec<_>>()
            .join("\n")
    );
    let request = ChatRequest {
        model: &cfg.llm_model,
        messages: vec![
            ChatMessage {
                role: "system",
                content: NAMING_SYSTEM_PROMPT,
            },
            ChatMessage {
                role: "user",
                content: &user_prompt,
            },
        ],
        temperature: cfg.temperature,
        max_tokens: 50,
    };
    let url = format!("{}/chat/completions", cfg.llm_base_url);
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return None;
        }
        let response = client
            .post(&url)
            .bearer_auth(&cfg.llm_api_key)
            .json(&request)
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await;
        match response {
            Ok(resp) => {
                let status = resp.status();
                if status.as_u16() == 429 {
                    if attempt < cfg.max_retries {
                        let backoff_ms = cfg
                            .retry_delay_ms
                            .saturating_mul(2u64.saturating_pow(attempt));
                        warn!(
                            attempt = attempt + 1,
                            max = cfg.max_retries,
                            backoff_ms,
                            "naming rate limit, backing off"
                        );
                        tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                        attempt += 1;
                        continue;
                    }
                    warn!("naming rate limit retries exhausted, using heuristic");
                    return None;
                }
                if !status.is_success() {
                    let body = resp.text().await.unwrap_or_default();
                    let err = PipelineError::NamingBackend {
                        status: status.as_u16(),
                        body,
                    };
                    warn!(%err, "naming request failed, using heuristic");
                    return None;
                }
                return match resp.json::<ChatResponse>().await {
                    Ok(data) => {
                        let content = data.choices.into_iter().next()?.message.content;
                        let cleaned = strip_enclosing_quotes(&content);
                        if cleaned.is_empty() {
                            None
                        } else {
                            Some(cleaned.to_string())
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "naming response was not valid JSON, using heuristic");
                        None
                    }
                };
            }
            Err(e) => {
                warn!(error = %e, "naming request failed, using heuristic");
                return None;
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Driver
// ----------------------------------------------------------------------------

/// Assign a name to every cluster, in merge order.
pub async fn name_clusters(
    clusters: &[Cluster],
    topics: &[EmbeddedTopic],
    cfg: &PipelineConfig,
    cancel: &CancellationToken,
) -> Result<Vec<NamedCluster>> {
    let stop_words: HashSet<&str> = cfg.stop_words.iter().map(String::as_str).collect();
    let client = reqwest::Client::new();
    let pb = ProgressBar::new(clusters.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("   [{bar:40.cyan/blue}] {pos}/{len} - {msg}")
            .expect("static template")
            .progress_chars("#>-"),
    );

    let mut named = Vec::with_capacity(clusters.len());
    let mut llm_calls = 0usize;
    for cluster in clusters {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let is_outlier = cluster.is_outlier || cluster.max_merge_distance > cfg.outlier_threshold;
        let name = if is_outlier {
            pb.set_message(format!("\"{OUTLIER_NAME}\" (Outlier)"));
            OUTLIER_NAME.to_string()
        } else if cfg.use_llm_naming && cluster.items.len() > 1 {
            if llm_calls > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(cfg.request_delay_ms / 2))
                    .await;
            }
            llm_calls += 1;
            let mut by_reach: Vec<&EmbeddedTopic> =
                cluster.items.iter().map(|&idx| &topics[idx]).collect();
            by_reach.sort_by(|a, b| b.episodes.len().cmp(&a.episodes.len()));
            let top_topics: Vec<String> = by_reach
                .iter()
                .take(10)
                .map(|t| t.topic.clone())
                .collect();
            match request_llm_name(&client, cfg, &top_topics, cancel).await {
                Some(llm_name) => {
                    pb.set_message(format!("\"{llm_name}\" (LLM)"));
                    llm_name
                }
                None => {
                    let fallback = heuristic_name(
                        &cluster.items,
                        topics,
                        cfg.use_relevance_weighting,
                        &stop_words,
                    );
                    pb.set_message(format!("\"{fallback}\" (Heuristik)"));
                    fallback
                }
            }
        } else {
            let heuristic = heuristic_name(
                &cluster.items,
                topics,
                cfg.use_relevance_weighting,
                &stop_words,
            );
            pb.set_message(format!("\"{heuristic}\" (Heuristik)"));
            heuristic
        };

        let mut episode_set = HashSet::new();
        for &idx in &cluster.items {
            episode_set.extend(topics[idx].episodes.iter().copied());
        }
        let mut episodes: Vec<u32> = episode_set.into_iter().collect();
        episodes.sort_unstable();

        named.push(NamedCluster {
            id: slugify(&name),
            name,
            is_outlier,
            topic_count: cluster.items.len(),
            episode_count: episodes.len(),
            topics: cluster
                .items
                .iter()
                .map(|&idx| {
                    let t = &topics[idx];
                    ClusterTopic {
                        topic: t.topic.clone(),
                        count: t.count,
                        keywords: t.keywords.iter().take(5).cloned().collect(),
                    }
                })
                .collect(),
            episodes,
        });
        pb.inc(1);
    }
    pb.finish_with_message("Done");
    Ok(named)
}
