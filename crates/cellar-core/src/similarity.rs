//! Similarity rankers for brute-force vector search
//!
//! A collection depends only on the [`Ranker`] trait; the metric is a
//! strategy that can be replaced at runtime.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Scoring metric selected by a store's vector options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    #[default]
    Cosine,
    Euclidean,
    #[serde(alias = "dot")]
    DotProduct,
}

impl Metric {
    /// The default ranker for this metric.
    pub fn ranker(self) -> Arc<dyn Ranker> {
        match self {
            Metric::Cosine => Arc::new(CosineRanker),
            Metric::Euclidean => Arc::new(EuclideanRanker),
            Metric::DotProduct => Arc::new(DotProductRanker),
        }
    }
}

/// Position of a candidate in the input and its score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scored {
    pub position: usize,
    pub score: f32,
}

/// Similarity strategy.
pub trait Ranker: Send + Sync + fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Similarity between the query and one candidate; higher is closer.
    fn score(&self, query: &[f32], candidate: &[f32]) -> f32;

    /// Score every candidate and order them by descending score.
    ///
    /// The sort is stable, so equal scores keep their input order. NaN
    /// scores sort last.
    fn rank(&self, query: &[f32], candidates: &[&[f32]]) -> Vec<Scored> {
        let mut scored: Vec<Scored> = candidates
            .iter()
            .enumerate()
            .map(|(position, candidate)| Scored {
                position,
                score: self.score(query, candidate),
            })
            .collect();
        scored.sort_by(|a, b| sort_key(b.score).total_cmp(&sort_key(a.score)));
        scored
    }
}

fn sort_key(score: f32) -> f32 {
    if score.is_nan() {
        f32::NEG_INFINITY
    } else {
        score
    }
}

/// Cosine similarity between two f32 slices.
///
/// Returns 0.0 if either vector has zero magnitude. When lengths differ the
/// missing components of the shorter vector count as zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot = dot_product(a, b);
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    let denom = norm_a * norm_b;
    if denom == 0.0 {
        return 0.0;
    }

    dot / denom
}

/// Dot product over the shared prefix of two slices.
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Euclidean distance, padding the shorter slice with zeros.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| {
            let d = a.get(i).copied().unwrap_or(0.0) - b.get(i).copied().unwrap_or(0.0);
            d * d
        })
        .sum::<f32>()
        .sqrt()
}

/// Default ranker: cosine similarity.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineRanker;

impl Ranker for CosineRanker {
    fn name(&self) -> &'static str {
        "cosine"
    }

    fn score(&self, query: &[f32], candidate: &[f32]) -> f32 {
        cosine_similarity(query, candidate)
    }
}

/// Raw dot product; suited to pre-normalized embeddings.
#[derive(Debug, Clone, Copy, Default)]
pub struct DotProductRanker;

impl Ranker for DotProductRanker {
    fn name(&self) -> &'static str {
        "dot"
    }

    fn score(&self, query: &[f32], candidate: &[f32]) -> f32 {
        dot_product(query, candidate)
    }
}

/// Scores `1 / (1 + distance)`, so identical vectors score 1.0.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanRanker;

impl Ranker for EuclideanRanker {
    fn name(&self) -> &'static str {
        "euclidean"
    }

    fn score(&self, query: &[f32], candidate: &[f32]) -> f32 {
        1.0 / (1.0 + euclidean_distance(query, candidate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_vectors() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!(
            (sim - 1.0).abs() < 1e-6,
            "identical vectors should have similarity ~1.0, got {}",
            sim
        );
    }

    #[test]
    fn orthogonal_vectors() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        let sim = cosine_similarity(&a, &b);
        assert!(
            sim.abs() < 1e-6,
            "orthogonal vectors should have similarity ~0.0, got {}",
            sim
        );
    }

    #[test]
    fn opposite_vectors() {
        let a = vec![1.0, 2.0, 3.0];
        let b = vec![-1.0, -2.0, -3.0];
        let sim = cosine_similarity(&a, &b);
        assert!(
            (sim + 1.0).abs() < 1e-6,
            "opposite vectors should have similarity ~-1.0, got {}",
            sim
        );
    }

    #[test]
    fn zero_vector() {
        let a = vec![1.0, 2.0, 3.0];
        let b = vec![0.0, 0.0, 0.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0, "zero vector should yield 0.0");
        assert_eq!(cosine_similarity(&[], &a), 0.0);
    }

    #[test]
    fn unequal_lengths_pad_with_zero() {
        // [1, 1] against [1, 1, 0] is the same direction
        let sim = cosine_similarity(&[1.0, 1.0], &[1.0, 1.0, 0.0]);
        assert!((sim - 1.0).abs() < 1e-6, "got {}", sim);

        // the extra component still counts towards the longer magnitude
        let sim = cosine_similarity(&[1.0], &[1.0, 1.0]);
        assert!((sim - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-6, "got {}", sim);
    }

    #[test]
    fn rank_orders_descending() {
        let candidates: Vec<&[f32]> = vec![&[1.0, 0.0], &[0.0, 1.0], &[1.0, 1.0]];
        let ranked = CosineRanker.rank(&[1.0, 0.0], &candidates);
        let order: Vec<usize> = ranked.iter().map(|s| s.position).collect();
        assert_eq!(order, vec![0, 2, 1]);
        assert!((ranked[1].score - 0.70710677).abs() < 1e-6);
    }

    #[test]
    fn rank_is_stable_for_ties() {
        let candidates: Vec<&[f32]> = vec![&[2.0, 0.0], &[0.0, 1.0], &[1.0, 0.0]];
        let ranked = CosineRanker.rank(&[1.0, 0.0], &candidates);
        let order: Vec<usize> = ranked.iter().map(|s| s.position).collect();
        assert_eq!(order, vec![0, 2, 1]);
    }

    #[test]
    fn nan_scores_sort_last() {
        let candidates: Vec<&[f32]> = vec![&[f32::NAN], &[1.0]];
        let ranked = DotProductRanker.rank(&[1.0], &candidates);
        assert_eq!(ranked[0].position, 1);
        assert!(ranked[1].score.is_nan());
    }

    #[test]
    fn euclidean_prefers_nearest() {
        let candidates: Vec<&[f32]> = vec![&[3.0, 4.0], &[1.0, 1.0]];
        let ranked = EuclideanRanker.rank(&[0.0, 0.0], &candidates);
        assert_eq!(ranked[0].position, 1);
        assert!((ranked[1].score - 1.0 / 6.0).abs() < 1e-6);
    }

    #[test]
    fn metric_selects_ranker() {
        assert_eq!(Metric::Cosine.ranker().name(), "cosine");
        assert_eq!(Metric::DotProduct.ranker().name(), "dot");
        assert_eq!(Metric::Euclidean.ranker().name(), "euclidean");
    }
}
