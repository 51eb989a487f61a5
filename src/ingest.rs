//! Episode topic ingest: walks per-episode topic records and folds them into
//! the unique-topic list the rest of the pipeline operates on.
//!
//! Two source topics are the same unique topic iff their trimmed, case-folded
//! strings match. The canonical display form is the first-seen casing, and
//! the output order is first-appearance order over files enumerated ascending
//! by episode number.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coarse: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fine: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicOccurrence {
    pub episode_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Subject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_sec: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_sec: Option<u32>,
}

/// A deduplicated topic with everything aggregated across its occurrences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniqueTopic {
    pub topic: String,
    pub keywords: Vec<String>,
    pub count: usize,
    pub episodes: Vec<u32>,
    pub occurrences: Vec<TopicOccurrence>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestOutput {
    pub topics: Vec<UniqueTopic>,
    /// Raw occurrence total before deduplication (sum of all counts).
    pub total_topics_raw: usize,
}

// ----------------------------------------------------------------------------
// Input file shapes
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EpisodeTopicsFile {
    episode_number: u32,
    #[serde(default)]
    #[allow(dead_code)]
    title: Option<String>,
    topics: Vec<RawTopic>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTopic {
    topic: String,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    subject: Option<Subject>,
    #[serde(default, deserialize_with = "lenient_secs")]
    position_sec: Option<u32>,
    #[serde(default, deserialize_with = "lenient_secs")]
    duration_sec: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ExtendedTopicsFile {
    #[serde(default)]
    topics: Vec<ExtendedTopic>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtendedTopic {
    topic: String,
    #[serde(default)]
    summary_meta: Option<SummaryMeta>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SummaryMeta {
    #[serde(default, deserialize_with = "lenient_secs")]
    start_sec: Option<u32>,
    #[serde(default, deserialize_with = "lenient_secs")]
    end_sec: Option<u32>,
}

/// Second fields in the wild are sometimes null, missing or outright garbage.
/// Anything that is not a non-negative finite number deserializes to `None`.
fn lenient_secs<'de, D>(deserializer: D) -> std::result::Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(parse_secs))
}

fn parse_secs(value: &serde_json::Value) -> Option<u32> {
    let n = value.as_f64()?;
    if n.is_finite() && n >= 0.0 {
        Some(n.round() as u32)
    } else {
        None
    }
}

// ----------------------------------------------------------------------------
// Ingest
// ----------------------------------------------------------------------------

/// Case-insensitive map from topic string to sidecar timing.
type SidecarTimings = HashMap<String, (Option<u32>, Option<u32>)>;

fn fold_key(topic: &str) -> String {
    topic.trim().to_lowercase()
}

fn load_sidecar(path: &Path) -> SidecarTimings {
    let mut timings = SidecarTimings::new();
    if !path.exists() {
        return timings;
    }
    let parsed: ExtendedTopicsFile = match fs::read_to_string(path)
        .map_err(|e| e.to_string())
        .and_then(|s| serde_json::from_str(&s).map_err(|e| e.to_string()))
    {
        Ok(parsed) => parsed,
        Err(reason) => {
            warn!(path = %path.display(), %reason, "skipping unreadable extended-topics sidecar");
            return timings;
        }
    };
    for entry in parsed.topics {
        let meta = entry.summary_meta.unwrap_or_default();
        timings
            .entry(fold_key(&entry.topic))
            .or_insert((meta.start_sec, meta.end_sec));
    }
    timings
}

/// Enumerate `<N>-topics.json` files ascending by episode number.
fn episode_files(dir: &Path) -> Result<Vec<(u32, PathBuf)>> {
    let pattern = Regex::new(r"^(\d+)-topics\.json$").expect("static regex");
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(caps) = pattern.captures(name) {
            if let Ok(number) = caps[1].parse::<u32>() {
                files.push((number, entry.path()));
            }
        }
    }
    files.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    Ok(files)
}

/// Walk the episodes directory and produce the unique-topic list.
///
/// A malformed episode file is logged and skipped; a directory without any
/// matching files is an error.
pub fn ingest_episodes(dir: &Path) -> Result<IngestOutput> {
    let files = episode_files(dir)?;
    if files.is_empty() {
        return Err(PipelineError::NoInputs {
            dir: dir.to_path_buf(),
        });
    }

    let mut topics: Vec<UniqueTopic> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut total_topics_raw = 0usize;

    for (file_number, path) in files {
        let episode: EpisodeTopicsFile = match fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|s| serde_json::from_str(&s).map_err(|e| e.to_string()))
        {
            Ok(parsed) => parsed,
            Err(reason) => {
                let err = PipelineError::MalformedRecord {
                    path: path.clone(),
                    reason,
                };
                warn!(%err, "skipping episode file");
                continue;
            }
        };
        if episode.episode_number != file_number {
            warn!(
                path = %path.display(),
                in_file = episode.episode_number,
                in_name = file_number,
                "episode number differs from filename, using the in-file number"
            );
        }
        let sidecar = load_sidecar(&path.with_file_name(format!(
            "{}-extended-topics.json",
            file_number
        )));

        for raw in episode.topics {
            let key = fold_key(&raw.topic);
            if key.is_empty() {
                warn!(path = %path.display(), "skipping entry with empty topic string");
                continue;
            }
            total_topics_raw += 1;

            let (start_sec, end_sec) = sidecar.get(&key).copied().unwrap_or((None, None));
            let position_sec = raw.position_sec.or(start_sec);
            let duration_sec = raw.duration_sec.or_else(|| match (start_sec, end_sec) {
                (Some(start), Some(end)) if end > start => Some(end - start),
                _ => None,
            });
            let occurrence = TopicOccurrence {
                episode_number: episode.episode_number,
                subject: raw.subject.clone(),
                position_sec,
                duration_sec,
            };

            match index.get(&key) {
                Some(&i) => {
                    let existing = &mut topics[i];
                    existing.count += 1;
                    for kw in &raw.keywords {
                        if !existing.keywords.contains(kw) {
                            existing.keywords.push(kw.clone());
                        }
                    }
                    if !existing.episodes.contains(&episode.episode_number) {
                        existing.episodes.push(episode.episode_number);
                    }
                    existing.occurrences.push(occurrence);
                }
                None => {
                    index.insert(key, topics.len());
                    topics.push(UniqueTopic {
                        topic: raw.topic.trim().to_string(),
                        keywords: raw.keywords.clone(),
                        count: 1,
                        episodes: vec![episode.episode_number],
                        occurrences: vec![occurrence],
                    });
                }
            }
        }
    }

    Ok(IngestOutput {
        topics,
        total_topics_raw,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_episode(dir: &Path, number: u32, body: &str) {
        fs::write(dir.join(format!("{number}-topics.json")), body).unwrap();
    }

    #[test]
    fn duplicate_topics_in_one_episode_merge() {
        let dir = TempDir::new().unwrap();
        write_episode(
            dir.path(),
            7,
            r#"{ "episodeNumber": 7, "title": "Ep 7", "topics": [
                { "topic": "X" },
                { "topic": "X" }
            ] }"#,
        );
        let out = ingest_episodes(dir.path()).unwrap();
        assert_eq!(out.topics.len(), 1);
        assert_eq!(out.total_topics_raw, 2);
        let t = &out.topics[0];
        assert_eq!(t.topic, "X");
        assert_eq!(t.count, 2);
        assert_eq!(t.episodes, vec![7]);
        assert_eq!(t.occurrences.len(), 2);
        assert!(t.episodes.len() <= t.count);
    }

    #[test]
    fn identity_is_case_folded_and_trimmed() {
        let dir = TempDir::new().unwrap();
        write_episode(
            dir.path(),
            1,
            r#"{ "episodeNumber": 1, "topics": [ { "topic": "Apple Vision Pro" } ] }"#,
        );
        write_episode(
            dir.path(),
            2,
            r#"{ "episodeNumber": 2, "topics": [ { "topic": "  apple vision pro " } ] }"#,
        );
        let out = ingest_episodes(dir.path()).unwrap();
        assert_eq!(out.topics.len(), 1);
        let t = &out.topics[0];
        // First-seen casing is canonical.
        assert_eq!(t.topic, "Apple Vision Pro");
        assert_eq!(t.count, 2);
        assert_eq!(t.episodes, vec![1, 2]);
    }

    #[test]
    fn keywords_union_preserves_first_seen_order() {
        let dir = TempDir::new().unwrap();
        write_episode(
            dir.path(),
            1,
            r#"{ "episodeNumber": 1, "topics": [
                { "topic": "Mastodon", "keywords": ["fediverse", "social"] }
            ] }"#,
        );
        write_episode(
            dir.path(),
            2,
            r#"{ "episodeNumber": 2, "topics": [
                { "topic": "mastodon", "keywords": ["social", "twitter"] }
            ] }"#,
        );
        let out = ingest_episodes(dir.path()).unwrap();
        assert_eq!(
            out.topics[0].keywords,
            vec!["fediverse", "social", "twitter"]
        );
    }

    #[test]
    fn files_enumerate_ascending_by_episode_number() {
        let dir = TempDir::new().unwrap();
        write_episode(
            dir.path(),
            10,
            r#"{ "episodeNumber": 10, "topics": [ { "topic": "Later" } ] }"#,
        );
        write_episode(
            dir.path(),
            2,
            r#"{ "episodeNumber": 2, "topics": [ { "topic": "Earlier" } ] }"#,
        );
        let out = ingest_episodes(dir.path()).unwrap();
        let names: Vec<_> = out.topics.iter().map(|t| t.topic.as_str()).collect();
        assert_eq!(names, vec!["Earlier", "Later"]);
    }

    #[test]
    fn sidecar_supplies_fallback_timing() {
        let dir = TempDir::new().unwrap();
        write_episode(
            dir.path(),
            3,
            r#"{ "episodeNumber": 3, "topics": [
                { "topic": "Raumfahrt" },
                { "topic": "Kameras", "positionSec": 90, "durationSec": 30 }
            ] }"#,
        );
        fs::write(
            dir.path().join("3-extended-topics.json"),
            r#"{ "topics": [
                { "topic": "raumfahrt", "summaryMeta": { "startSec": 120, "endSec": 300 } },
                { "topic": "KAMERAS", "summaryMeta": { "startSec": 10, "endSec": 20 } }
            ] }"#,
        )
        .unwrap();
        let out = ingest_episodes(dir.path()).unwrap();
        let raumfahrt = &out.topics[0].occurrences[0];
        assert_eq!(raumfahrt.position_sec, Some(120));
        assert_eq!(raumfahrt.duration_sec, Some(180));
        // Explicit record values win over the sidecar.
        let kameras = &out.topics[1].occurrences[0];
        assert_eq!(kameras.position_sec, Some(90));
        assert_eq!(kameras.duration_sec, Some(30));
    }

    #[test]
    fn non_numeric_seconds_are_dropped() {
        let dir = TempDir::new().unwrap();
        write_episode(
            dir.path(),
            4,
            r#"{ "episodeNumber": 4, "topics": [
                { "topic": "Audio", "positionSec": "12:30", "durationSec": null }
            ] }"#,
        );
        let out = ingest_episodes(dir.path()).unwrap();
        let occ = &out.topics[0].occurrences[0];
        assert_eq!(occ.position_sec, None);
        assert_eq!(occ.duration_sec, None);
    }

    #[test]
    fn malformed_file_is_skipped_not_fatal() {
        let dir = TempDir::new().unwrap();
        write_episode(dir.path(), 1, "{ this is not json");
        write_episode(
            dir.path(),
            2,
            r#"{ "episodeNumber": 2, "topics": [ { "topic": "Ok" } ] }"#,
        );
        let out = ingest_episodes(dir.path()).unwrap();
        assert_eq!(out.topics.len(), 1);
        assert_eq!(out.topics[0].topic, "Ok");
    }

    #[test]
    fn empty_directory_is_no_inputs() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            ingest_episodes(dir.path()),
            Err(PipelineError::NoInputs { .. })
        ));
    }

    #[test]
    fn unrelated_files_are_ignored() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("notes.txt"), "hi").unwrap();
        fs::write(dir.path().join("5-extended-topics.json"), "{}").unwrap();
        assert!(matches!(
            ingest_episodes(dir.path()),
            Err(PipelineError::NoInputs { .. })
        ));
    }

    #[test]
    fn ingest_is_idempotent() {
        let dir = TempDir::new().unwrap();
        write_episode(
            dir.path(),
            1,
            r#"{ "episodeNumber": 1, "topics": [
                { "topic": "Linux", "keywords": ["kernel"] },
                { "topic": "linux" }
            ] }"#,
        );
        let first = ingest_episodes(dir.path()).unwrap();
        let second = ingest_episodes(dir.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn episode_set_matches_occurrences() {
        let dir = TempDir::new().unwrap();
        write_episode(
            dir.path(),
            1,
            r#"{ "episodeNumber": 1, "topics": [ { "topic": "A" }, { "topic": "a" } ] }"#,
        );
        write_episode(
            dir.path(),
            2,
            r#"{ "episodeNumber": 2, "topics": [ { "topic": "A" } ] }"#,
        );
        let out = ingest_episodes(dir.path()).unwrap();
        let t = &out.topics[0];
        let mut from_occurrences: Vec<u32> =
            t.occurrences.iter().map(|o| o.episode_number).collect();
        from_occurrences.dedup();
        assert_eq!(t.episodes, from_occurrences);
    }
}
