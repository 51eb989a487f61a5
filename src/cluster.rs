//! Weighted agglomerative clustering over the embedded unique topics.
//!
//! Each topic starts as its own cluster; the loop repeatedly merges the
//! nearest pair under the configured linkage until the target count remains.
//! The nearest-pair scan enumerates pairs ascending by `(i, j)` and breaks
//! distance ties in favor of the earliest pair in that order.

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use tracing::info;

use crate::distance::{cluster_distance, DistanceMatrix, Linkage};
use crate::embeddings::EmbeddedTopic;
use crate::error::{PipelineError, Result};
use crate::pipeline::CancellationToken;

#[derive(Debug, Clone)]
pub struct ClusterOptions {
    pub linkage: Linkage,
    pub use_relevance_weighting: bool,
    pub outlier_threshold: f64,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            linkage: Linkage::Weighted,
            use_relevance_weighting: true,
            outlier_threshold: 0.7,
        }
    }
}

/// A live cluster during the merge loop. `items` are topic ids in merge
/// order; `embedding` is the weighted centroid over them.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub items: Vec<usize>,
    pub embedding: Vec<f64>,
    pub total_weight: f64,
    pub is_outlier: bool,
    pub max_merge_distance: f64,
}

/// Initial per-topic weights: episode reach under relevance weighting
/// (at least 1), otherwise uniform.
pub fn initial_weights(topics: &[EmbeddedTopic], use_relevance_weighting: bool) -> Vec<f64> {
    if use_relevance_weighting {
        topics
            .iter()
            .map(|t| t.episodes.len().max(1) as f64)
            .collect()
    } else {
        vec![1.0; topics.len()]
    }
}

fn weighted_centroid(items: &[usize], embeddings: &[&[f64]], weights: &[f64]) -> (Vec<f64>, f64) {
    let dim = embeddings[items[0]].len();
    let mut centroid = vec![0.0; dim];
    let mut total_weight = 0.0;
    for &idx in items {
        let w = weights[idx];
        total_weight += w;
        for (d, value) in embeddings[idx].iter().enumerate() {
            centroid[d] += value * w;
        }
    }
    for value in &mut centroid {
        *value /= total_weight;
    }
    (centroid, total_weight)
}

fn merge_progress_bar(merges: u64) -> ProgressBar {
    let pb = ProgressBar::new(merges);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("   [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) - {msg}")
            .expect("static template")
            .progress_chars("#>-"),
    );
    pb
}

/// Run the agglomerative merge loop down to `target_clusters`.
///
/// The returned vector is in merge order: clusters that never merged keep
/// their initial position, every merge result is appended at the end.
pub fn cluster_topics(
    topics: &[EmbeddedTopic],
    target_clusters: usize,
    opts: &ClusterOptions,
    cancel: &CancellationToken,
) -> Result<Vec<Cluster>> {
    if target_clusters == 0 {
        return Err(PipelineError::TargetZero);
    }
    if topics.is_empty() {
        return Err(PipelineError::EmptyInput);
    }
    let embeddings: Vec<&[f64]> = topics.iter().map(|t| t.embedding.as_slice()).collect();
    let dim = embeddings[0].len();
    for e in &embeddings {
        if e.len() != dim {
            return Err(PipelineError::DimensionMismatch {
                expected: dim,
                found: e.len(),
            });
        }
    }

    let n = topics.len();
    let weights = initial_weights(topics, opts.use_relevance_weighting);
    let mut clusters: Vec<Cluster> = (0..n)
        .map(|i| Cluster {
            items: vec![i],
            embedding: embeddings[i].to_vec(),
            total_weight: weights[i],
            is_outlier: false,
            max_merge_distance: 0.0,
        })
        .collect();
    if clusters.len() <= target_clusters {
        return Ok(clusters);
    }

    info!(
        topics = n,
        target = target_clusters,
        linkage = %opts.linkage,
        relevance_weighting = opts.use_relevance_weighting,
        "computing distance matrix"
    );
    let distances = DistanceMatrix::compute(&embeddings);

    let pb = merge_progress_bar((n - target_clusters) as u64);
    while clusters.len() > target_clusters {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let n_clusters = clusters.len();
        // Parallel scan over all pairs, ascending (i, j). The reduction keeps
        // the left operand on equal distances, and rayon combines partial
        // results in sequence order, so ties resolve to the earliest pair.
        let (merge_i, merge_j, min_dist): (usize, usize, f64) = (0..n_clusters)
            .into_par_iter()
            .flat_map_iter(|i| ((i + 1)..n_clusters).map(move |j| (i, j)))
            .map(|(i, j)| {
                let dist = cluster_distance(
                    &clusters[i],
                    &clusters[j],
                    &distances,
                    &weights,
                    opts.linkage,
                );
                (i, j, dist)
            })
            .reduce(
                || (0, 1, f64::INFINITY),
                |a, b| if a.2 <= b.2 { a } else { b },
            );

        let mut is_outlier = clusters[merge_i].is_outlier || clusters[merge_j].is_outlier;
        if min_dist > opts.outlier_threshold {
            is_outlier = true;
        }
        let mut items = clusters[merge_i].items.clone();
        items.extend_from_slice(&clusters[merge_j].items);
        // Centroid over initial per-topic weights; with weighting disabled
        // all weights are 1 and this is the plain mean.
        let (embedding, total_weight) = weighted_centroid(&items, &embeddings, &weights);
        let merged = Cluster {
            max_merge_distance: min_dist
                .max(clusters[merge_i].max_merge_distance)
                .max(clusters[merge_j].max_merge_distance),
            items,
            embedding,
            total_weight,
            is_outlier,
        };
        // merge_j > merge_i by construction of the scan.
        clusters.remove(merge_j);
        clusters.remove(merge_i);
        clusters.push(merged);
        pb.set_message(format!("{} Cluster", clusters.len()));
        pb.inc(1);
    }
    pb.finish_with_message("Done");
    Ok(clusters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::EmbeddedTopic;

    fn topic(id: usize, name: &str, episodes: &[u32], embedding: &[f64]) -> EmbeddedTopic {
        EmbeddedTopic {
            id,
            topic: name.to_string(),
            keywords: Vec::new(),
            count: episodes.len().max(1),
            episodes: episodes.to_vec(),
            occurrences: Vec::new(),
            embedding: embedding.to_vec(),
        }
    }

    fn unweighted(linkage: Linkage, outlier_threshold: f64) -> ClusterOptions {
        ClusterOptions {
            linkage,
            use_relevance_weighting: false,
            outlier_threshold,
        }
    }

    fn orthogonal_three() -> Vec<EmbeddedTopic> {
        vec![
            topic(0, "A", &[1], &[1.0, 0.0, 0.0]),
            topic(1, "B", &[2], &[0.0, 1.0, 0.0]),
            topic(2, "C", &[3], &[0.0, 0.0, 1.0]),
        ]
    }

    #[test]
    fn target_zero_is_rejected() {
        let topics = orthogonal_three();
        let result = cluster_topics(
            &topics,
            0,
            &ClusterOptions::default(),
            &CancellationToken::new(),
        );
        assert!(matches!(result, Err(PipelineError::TargetZero)));
    }

    #[test]
    fn empty_input_is_rejected() {
        let result = cluster_topics(
            &[],
            4,
            &ClusterOptions::default(),
            &CancellationToken::new(),
        );
        assert!(matches!(result, Err(PipelineError::EmptyInput)));
    }

    #[test]
    fn mismatched_dimensions_are_rejected() {
        let topics = vec![
            topic(0, "A", &[1], &[1.0, 0.0]),
            topic(1, "B", &[2], &[1.0, 0.0, 0.0]),
        ];
        let result = cluster_topics(
            &topics,
            1,
            &ClusterOptions::default(),
            &CancellationToken::new(),
        );
        assert!(matches!(
            result,
            Err(PipelineError::DimensionMismatch {
                expected: 2,
                found: 3
            })
        ));
    }

    #[test]
    fn target_equal_to_input_means_no_merges() {
        let topics = orthogonal_three();
        let clusters = cluster_topics(
            &topics,
            3,
            &ClusterOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(clusters.len(), 3);
        for (i, c) in clusters.iter().enumerate() {
            assert_eq!(c.items, vec![i]);
            assert!(!c.is_outlier);
            assert_eq!(c.max_merge_distance, 0.0);
        }
    }

    #[test]
    fn target_above_input_returns_immediately() {
        let topics = orthogonal_three();
        let clusters = cluster_topics(
            &topics,
            10,
            &ClusterOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(clusters.len(), 3);
    }

    #[test]
    fn target_one_collects_everything() {
        let topics = orthogonal_three();
        let clusters = cluster_topics(
            &topics,
            1,
            &unweighted(Linkage::Average, 0.7),
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(clusters.len(), 1);
        let mut items = clusters[0].items.clone();
        items.sort_unstable();
        assert_eq!(items, vec![0, 1, 2]);
    }

    #[test]
    fn orthogonal_merges_at_distance_one_flag_outliers() {
        // Both merges happen at distance 1, above the 0.7 threshold.
        let topics = orthogonal_three();
        let clusters = cluster_topics(
            &topics,
            1,
            &unweighted(Linkage::Average, 0.7),
            &CancellationToken::new(),
        )
        .unwrap();
        let c = &clusters[0];
        assert!(c.is_outlier);
        assert!((c.max_merge_distance - 1.0).abs() < 1e-9);
    }

    #[test]
    fn ward_and_average_agree_on_two_obvious_pairs() {
        let topics = vec![
            topic(0, "A", &[1], &[1.0, 0.0]),
            topic(1, "B", &[2], &[0.9, 0.1]),
            topic(2, "C", &[3], &[0.0, 1.0]),
            topic(3, "D", &[4], &[0.1, 0.9]),
        ];
        for linkage in [Linkage::Ward, Linkage::Average] {
            let clusters = cluster_topics(
                &topics,
                2,
                &unweighted(linkage, 0.7),
                &CancellationToken::new(),
            )
            .unwrap();
            let mut groups: Vec<Vec<usize>> = clusters
                .iter()
                .map(|c| {
                    let mut items = c.items.clone();
                    items.sort_unstable();
                    items
                })
                .collect();
            groups.sort();
            assert_eq!(groups, vec![vec![0, 1], vec![2, 3]], "{linkage}");
            assert!(clusters.iter().all(|c| !c.is_outlier));
        }
    }

    #[test]
    fn zero_threshold_flags_every_nontrivial_merge() {
        let topics = vec![
            topic(0, "A", &[1], &[1.0, 0.0]),
            topic(1, "B", &[2], &[0.9, 0.1]),
            topic(2, "C", &[3], &[0.0, 1.0]),
        ];
        let clusters = cluster_topics(
            &topics,
            2,
            &unweighted(Linkage::Average, 0.0),
            &CancellationToken::new(),
        )
        .unwrap();
        let merged = clusters.iter().find(|c| c.items.len() > 1).unwrap();
        assert!(merged.is_outlier);
        let single = clusters.iter().find(|c| c.items.len() == 1).unwrap();
        assert!(!single.is_outlier);
    }

    #[test]
    fn threshold_one_flags_nothing_for_nonnegative_vectors() {
        // Distances between non-negative vectors never exceed 1.
        let topics = vec![
            topic(0, "A", &[1], &[1.0, 0.0]),
            topic(1, "B", &[2], &[0.0, 1.0]),
            topic(2, "C", &[3], &[0.5, 0.5]),
        ];
        let clusters = cluster_topics(
            &topics,
            1,
            &unweighted(Linkage::Average, 1.0),
            &CancellationToken::new(),
        )
        .unwrap();
        assert!(!clusters[0].is_outlier);
    }

    #[test]
    fn cross_group_merge_above_threshold_flags_result() {
        // A and B merge quietly; pulling in the near-orthogonal C exceeds the
        // threshold and the final cluster carries the flag.
        let topics = vec![
            topic(0, "A", &[1], &[1.0, 0.0]),
            topic(1, "B", &[2], &[0.95, 0.05]),
            topic(2, "C", &[3], &[0.0, 1.0]),
        ];
        let clusters = cluster_topics(
            &topics,
            1,
            &unweighted(Linkage::Complete, 0.5),
            &CancellationToken::new(),
        )
        .unwrap();
        assert!(clusters[0].is_outlier);
        assert!(clusters[0].max_merge_distance > 0.5);
    }

    #[test]
    fn equal_weights_yield_same_centroids_as_unweighted() {
        // Every topic appears in exactly two episodes, so relevance weights
        // are uniform and must not change the centroid.
        let topics = vec![
            topic(0, "A", &[1, 2], &[1.0, 0.0]),
            topic(1, "B", &[3, 4], &[0.8, 0.2]),
            topic(2, "C", &[5, 6], &[0.0, 1.0]),
        ];
        let weighted = cluster_topics(
            &topics,
            1,
            &ClusterOptions {
                linkage: Linkage::Average,
                use_relevance_weighting: true,
                outlier_threshold: 1.0,
            },
            &CancellationToken::new(),
        )
        .unwrap();
        let plain = cluster_topics(
            &topics,
            1,
            &unweighted(Linkage::Average, 1.0),
            &CancellationToken::new(),
        )
        .unwrap();
        for (a, b) in weighted[0].embedding.iter().zip(&plain[0].embedding) {
            assert!((a - b).abs() < 1e-12);
        }
        assert_eq!(weighted[0].total_weight, 6.0);
        assert_eq!(plain[0].total_weight, 3.0);
    }

    #[test]
    fn relevance_weighting_pulls_centroid_toward_heavy_topics() {
        let topics = vec![
            topic(0, "A", &[1, 2, 3, 4], &[1.0, 0.0]),
            topic(1, "B", &[5], &[0.0, 1.0]),
        ];
        let clusters = cluster_topics(
            &topics,
            1,
            &ClusterOptions {
                linkage: Linkage::Average,
                use_relevance_weighting: true,
                outlier_threshold: 1.0,
            },
            &CancellationToken::new(),
        )
        .unwrap();
        let centroid = &clusters[0].embedding;
        // (4·(1,0) + 1·(0,1)) / 5
        assert!((centroid[0] - 0.8).abs() < 1e-12);
        assert!((centroid[1] - 0.2).abs() < 1e-12);
        assert_eq!(clusters[0].total_weight, 5.0);
        assert!(clusters[0].total_weight >= clusters[0].items.len() as f64);
    }

    #[test]
    fn identical_embeddings_tie_break_by_scan_order() {
        // All pairs are at distance 0; the (0, 1) pair must merge first.
        let topics = vec![
            topic(0, "A", &[1], &[1.0, 0.0]),
            topic(1, "B", &[2], &[1.0, 0.0]),
            topic(2, "C", &[3], &[1.0, 0.0]),
        ];
        let clusters = cluster_topics(
            &topics,
            2,
            &unweighted(Linkage::Average, 1.0),
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(clusters[0].items, vec![2]);
        assert_eq!(clusters[1].items, vec![0, 1]);
    }

    #[test]
    fn single_dimension_embeddings_still_cluster() {
        let topics = vec![
            topic(0, "A", &[1], &[1.0]),
            topic(1, "B", &[2], &[2.0]),
            topic(2, "C", &[3], &[3.0]),
        ];
        let clusters = cluster_topics(
            &topics,
            1,
            &unweighted(Linkage::Average, 1.0),
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(clusters.len(), 1);
        // Collinear vectors are all at distance 0; no outliers.
        assert!(!clusters[0].is_outlier);
    }

    #[test]
    fn cancellation_aborts_the_merge_loop() {
        let topics = orthogonal_three();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = cluster_topics(&topics, 1, &ClusterOptions::default(), &cancel);
        assert!(matches!(result, Err(PipelineError::Cancelled)));
    }
}
