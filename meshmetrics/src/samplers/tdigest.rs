//! A merging t-digest: a compact sketch of a value distribution that
//! supports quantile queries and lossless-enough merging of peer digests.

use serde::{Deserialize, Serialize};

use crate::proto;

/// How many buffered points accumulate before an in-place compression pass.
const BUFFER_MULTIPLIER: usize = 5;

/// A weighted point in the digest.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Centroid {
    /// Weighted mean of the samples folded into this centroid.
    pub mean: f64,
    /// Total sample weight folded into this centroid.
    pub weight: f64,
}

/// A t-digest that absorbs weighted samples and merges with peer digests.
///
/// Centroid sizes are bounded by a quantile-dependent limit derived from the
/// compression parameter, so the digest stays small while keeping tail
/// quantiles sharp. Incoming points are buffered and folded in batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergingDigest {
    compression: f64,
    min: f64,
    max: f64,
    // sorted, size-bounded centroids
    centroids: Vec<Centroid>,
    // points not yet folded into `centroids`; serialized too, so a digest
    // is self-contained at any moment
    buffer: Vec<Centroid>,
}

impl MergingDigest {
    /// Create an empty digest. Larger compression values keep more centroids
    /// and give sharper quantiles at the cost of memory.
    pub fn new(compression: f64) -> Self {
        Self {
            compression,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            centroids: Vec::new(),
            buffer: Vec::new(),
        }
    }

    /// Add a weighted sample. Non-finite means and non-positive weights are
    /// ignored.
    pub fn add(&mut self, mean: f64, weight: f64) {
        if !mean.is_finite() || weight <= 0.0 {
            return;
        }
        self.min = self.min.min(mean);
        self.max = self.max.max(mean);
        self.buffer.push(Centroid { mean, weight });
        if self.buffer.len() >= BUFFER_MULTIPLIER * self.compression as usize {
            self.compact();
        }
    }

    /// Fold all of `other` into this digest.
    pub fn merge(&mut self, other: &MergingDigest) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.buffer.extend(other.centroids.iter().copied());
        self.buffer.extend(other.buffer.iter().copied());
        self.compact();
    }

    /// Total weight across all samples.
    pub fn count(&self) -> f64 {
        self.centroids
            .iter()
            .chain(self.buffer.iter())
            .map(|c| c.weight)
            .sum()
    }

    /// Smallest sample seen, or +inf for an empty digest.
    pub fn min(&self) -> f64 {
        self.min
    }

    /// Largest sample seen, or -inf for an empty digest.
    pub fn max(&self) -> f64 {
        self.max
    }

    /// Estimate the value at quantile `q` in [0, 1]. Returns NaN for an
    /// empty digest.
    pub fn quantile(&self, q: f64) -> f64 {
        let centroids = self.merged_centroids();
        if centroids.is_empty() {
            return f64::NAN;
        }
        let total: f64 = centroids.iter().map(|c| c.weight).sum();
        let target = q.clamp(0.0, 1.0) * total;

        // Interpolate between centroid midpoints, anchored at min and max.
        let mut cumulative = 0.0;
        let mut previous_midpoint = 0.0;
        let mut previous_mean = self.min;
        for centroid in &centroids {
            let midpoint = cumulative + centroid.weight / 2.0;
            if target <= midpoint {
                let fraction = if midpoint > previous_midpoint {
                    (target - previous_midpoint) / (midpoint - previous_midpoint)
                } else {
                    0.0
                };
                return previous_mean + fraction * (centroid.mean - previous_mean);
            }
            cumulative += centroid.weight;
            previous_midpoint = midpoint;
            previous_mean = centroid.mean;
        }
        self.max
    }

    /// The wire representation of this digest.
    pub fn to_proto(&self) -> proto::TDigest {
        proto::TDigest {
            centroids: self
                .merged_centroids()
                .into_iter()
                .map(|c| proto::t_digest::Centroid {
                    mean: c.mean,
                    weight: c.weight,
                })
                .collect(),
            min: self.min,
            max: self.max,
        }
    }

    /// Fold a wire-format peer digest into this one.
    pub fn merge_proto(&mut self, other: &proto::TDigest) {
        if other.centroids.is_empty() {
            return;
        }
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.buffer.extend(
            other
                .centroids
                .iter()
                .filter(|c| c.mean.is_finite() && c.weight > 0.0)
                .map(|c| Centroid {
                    mean: c.mean,
                    weight: c.weight,
                }),
        );
        self.compact();
    }

    fn compact(&mut self) {
        let mut all = std::mem::take(&mut self.centroids);
        all.append(&mut self.buffer);
        self.centroids = compress(self.compression, all);
    }

    fn merged_centroids(&self) -> Vec<Centroid> {
        if self.buffer.is_empty() {
            return self.centroids.clone();
        }
        let mut all = self.centroids.clone();
        all.extend(self.buffer.iter().copied());
        compress(self.compression, all)
    }
}

// Sort the points and greedily merge neighbors, capping each centroid's
// weight at 4*total*q*(1-q)/compression for its midpoint quantile q.
fn compress(compression: f64, mut points: Vec<Centroid>) -> Vec<Centroid> {
    if points.is_empty() {
        return points;
    }
    points.sort_by(|a, b| a.mean.total_cmp(&b.mean));
    let total: f64 = points.iter().map(|c| c.weight).sum();

    let mut compressed = Vec::with_capacity(compression as usize * 2);
    let mut drained = points.into_iter();
    let mut current = drained
        .next()
        .unwrap_or(Centroid {
            mean: 0.0,
            weight: 0.0,
        });
    let mut cumulative = 0.0;
    for point in drained {
        let proposed = current.weight + point.weight;
        let q = (cumulative + proposed / 2.0) / total;
        let limit = 4.0 * total * q * (1.0 - q) / compression;
        if proposed <= limit {
            current.mean =
                (current.mean * current.weight + point.mean * point.weight) / proposed;
            current.weight = proposed;
        } else {
            cumulative += current.weight;
            compressed.push(current);
            current = point;
        }
    }
    compressed.push(current);
    compressed
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::MergingDigest;

    #[test]
    fn empty_digest_has_nan_quantiles() {
        let digest = MergingDigest::new(100.0);
        assert!(digest.quantile(0.5).is_nan());
        assert_eq!(0.0, digest.count());
        assert!(digest.min().is_infinite());
    }

    #[test]
    fn two_points_interpolate() {
        let mut digest = MergingDigest::new(100.0);
        digest.add(1.0, 1.0);
        digest.add(2.0, 1.0);
        assert!((digest.quantile(0.5) - 1.5).abs() < 1e-9);
        assert_eq!(1.0, digest.quantile(0.0));
        assert_eq!(2.0, digest.quantile(1.0));
    }

    #[test]
    fn uniform_quantiles_are_close() {
        let mut digest = MergingDigest::new(100.0);
        for i in 1..=10_000 {
            digest.add(i as f64, 1.0);
        }
        let p50 = digest.quantile(0.5);
        let p99 = digest.quantile(0.99);
        assert!((p50 - 5_000.0).abs() < 250.0, "p50 was {p50}");
        assert!((p99 - 9_900.0).abs() < 200.0, "p99 was {p99}");
        assert_eq!(10_000.0, digest.count());
        assert_eq!(1.0, digest.min());
        assert_eq!(10_000.0, digest.max());
    }

    #[test]
    fn merge_matches_direct_accumulation() {
        let mut left = MergingDigest::new(100.0);
        let mut right = MergingDigest::new(100.0);
        let mut direct = MergingDigest::new(100.0);
        for i in 1..=1_000 {
            let v = i as f64;
            if i % 2 == 0 {
                left.add(v, 1.0);
            } else {
                right.add(v, 1.0);
            }
            direct.add(v, 1.0);
        }
        left.merge(&right);
        assert_eq!(direct.count(), left.count());
        for q in [0.1, 0.5, 0.9] {
            let merged = left.quantile(q);
            let expected = direct.quantile(q);
            assert!(
                (merged - expected).abs() < 50.0,
                "quantile {q}: merged {merged}, direct {expected}"
            );
        }
    }

    #[test]
    fn proto_round_trip_preserves_quantiles() {
        let mut digest = MergingDigest::new(100.0);
        for i in 1..=1_000 {
            digest.add(i as f64, 1.0);
        }
        let wire = digest.to_proto();
        let mut restored = MergingDigest::new(100.0);
        restored.merge_proto(&wire);
        assert!((restored.quantile(0.5) - digest.quantile(0.5)).abs() < 25.0);
        assert_eq!(digest.min(), restored.min());
        assert_eq!(digest.max(), restored.max());
    }

    #[test]
    fn centroid_count_stays_bounded() {
        let mut digest = MergingDigest::new(100.0);
        for i in 0..100_000 {
            digest.add((i % 1_000) as f64, 1.0);
        }
        // after a full compaction the centroid count is a small multiple of
        // the compression parameter
        let wire = digest.to_proto();
        assert!(
            wire.centroids.len() < 400,
            "digest kept {} centroids",
            wire.centroids.len()
        );
    }
}
