//! Cosine distance, the pairwise distance matrix and the linkage methods
//! that lift topic distances to cluster distances.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::cluster::Cluster;

/// Linkage method for cluster-to-cluster distances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Linkage {
    Single,
    Complete,
    Average,
    Weighted,
    Ward,
}

impl Linkage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Linkage::Single => "single",
            Linkage::Complete => "complete",
            Linkage::Average => "average",
            Linkage::Weighted => "weighted",
            Linkage::Ward => "ward",
        }
    }
}

impl std::fmt::Display for Linkage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Linkage {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "single" => Ok(Linkage::Single),
            "complete" => Ok(Linkage::Complete),
            "average" => Ok(Linkage::Average),
            "weighted" => Ok(Linkage::Weighted),
            "ward" => Ok(Linkage::Ward),
            other => Err(format!("unknown linkage method '{other}'")),
        }
    }
}

#[inline]
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    let mut dot_product = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    let len = a.len().min(b.len());
    let chunks = len / 4;
    // 4-wide accumulation helps the compiler auto-vectorize.
    for i in 0..chunks {
        let idx = i * 4;
        for j in 0..4 {
            let ai = a[idx + j];
            let bi = b[idx + j];
            dot_product += ai * bi;
            norm_a += ai * ai;
            norm_b += bi * bi;
        }
    }
    for i in (chunks * 4)..len {
        let ai = a[i];
        let bi = b[i];
        dot_product += ai * bi;
        norm_a += ai * ai;
        norm_b += bi * bi;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        // Zero-norm vectors are maximally distant by convention.
        return 0.0;
    }
    dot_product / denom
}

#[inline]
pub fn cosine_distance(a: &[f64], b: &[f64]) -> f64 {
    1.0 - cosine_similarity(a, b)
}

/// Full pairwise distance matrix over the unique topics, stored as a flat
/// symmetric `n × n` array with a zero diagonal. Built once, read-only after.
#[derive(Debug)]
pub struct DistanceMatrix {
    n: usize,
    data: Vec<f64>,
}

impl DistanceMatrix {
    /// Compute the matrix in parallel; every worker writes a disjoint row.
    pub fn compute(embeddings: &[&[f64]]) -> Self {
        let n = embeddings.len();
        let mut data = vec![0.0; n * n];
        data.par_chunks_mut(n.max(1))
            .enumerate()
            .for_each(|(i, row)| {
                for (j, cell) in row.iter_mut().enumerate() {
                    if i != j {
                        *cell = cosine_distance(embeddings[i], embeddings[j]);
                    }
                }
            });
        Self { n, data }
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.n + j]
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }
}

/// Distance between two live clusters under the given linkage.
///
/// `weights` are the initial per-topic weights, indexed by topic id.
pub fn cluster_distance(
    a: &Cluster,
    b: &Cluster,
    distances: &DistanceMatrix,
    weights: &[f64],
    linkage: Linkage,
) -> f64 {
    match linkage {
        Linkage::Single => {
            let mut min_dist = f64::INFINITY;
            for &i in &a.items {
                for &j in &b.items {
                    min_dist = min_dist.min(distances.get(i, j));
                }
            }
            min_dist
        }
        Linkage::Complete => {
            let mut max_dist: f64 = 0.0;
            for &i in &a.items {
                for &j in &b.items {
                    max_dist = max_dist.max(distances.get(i, j));
                }
            }
            max_dist
        }
        Linkage::Average => {
            let mut total = 0.0;
            for &i in &a.items {
                for &j in &b.items {
                    total += distances.get(i, j);
                }
            }
            total / (a.items.len() * b.items.len()) as f64
        }
        Linkage::Weighted => {
            let mut weighted_sum = 0.0;
            let mut total_weight = 0.0;
            for &i in &a.items {
                for &j in &b.items {
                    let w = weights[i] * weights[j];
                    weighted_sum += distances.get(i, j) * w;
                    total_weight += w;
                }
            }
            weighted_sum / total_weight
        }
        Linkage::Ward => {
            let n_a = a.total_weight;
            let n_b = b.total_weight;
            let centroid_dist = cosine_distance(&a.embedding, &b.embedding);
            ((2.0 * n_a * n_b) / (n_a + n_b)).sqrt() * centroid_dist
        }
    }
}
