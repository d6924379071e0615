//! A dense hyperloglog sketch for approximate distinct counting.
//!
//! Values are hashed with XXH3, which is stable across processes and
//! architectures; two instances inserting the same value produce the same
//! register update, so merged sketches deduplicate correctly fleet-wide.

use thiserror::Error;

/// The register count exponent every set sampler uses. 2^14 registers keeps
/// the standard error around 0.8%.
pub const DEFAULT_PRECISION: u8 = 14;

/// Failures constructing, decoding, or merging sketches.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HllError {
    /// Precision must fall in [4, 18].
    #[error("precision {0} is outside the supported range [4, 18]")]
    PrecisionOutOfRange(u8),
    /// Sketches of different precision cannot be merged.
    #[error("precision mismatch: local sketch has {local}, peer has {peer}")]
    PrecisionMismatch {
        /// The receiving sketch's precision.
        local: u8,
        /// The incoming sketch's precision.
        peer: u8,
    },
    /// The serialized state did not hold a full register file.
    #[error("serialized sketch is {got} bytes, expected {expected}")]
    TruncatedState {
        /// Bytes a sketch of the declared precision requires.
        expected: usize,
        /// Bytes actually present.
        got: usize,
    },
}

/// A hyperloglog sketch with 2^precision one-byte registers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HyperLogLog {
    precision: u8,
    registers: Vec<u8>,
}

impl HyperLogLog {
    /// Create an empty sketch. `precision` must be in [4, 18].
    pub fn new(precision: u8) -> Result<Self, HllError> {
        if !(4..=18).contains(&precision) {
            return Err(HllError::PrecisionOutOfRange(precision));
        }
        Ok(Self {
            precision,
            registers: vec![0; 1 << precision],
        })
    }

    /// Observe a value.
    pub fn insert(&mut self, value: &[u8]) {
        let hash = twox_hash::xxh3::hash64(value);
        let index = (hash >> (64 - self.precision)) as usize;
        let rest = hash << self.precision;
        let rank = (rest.leading_zeros() as u8).min(64 - self.precision) + 1;
        if rank > self.registers[index] {
            self.registers[index] = rank;
        }
    }

    /// Estimate the number of distinct values observed.
    pub fn estimate(&self) -> f64 {
        let m = self.registers.len() as f64;
        let harmonic_sum: f64 = self
            .registers
            .iter()
            .map(|&r| 2.0_f64.powi(-i32::from(r)))
            .sum();
        let raw = alpha(self.registers.len()) * m * m / harmonic_sum;

        if raw <= 2.5 * m {
            let zeros = self.registers.iter().filter(|&&r| r == 0).count();
            if zeros > 0 {
                return m * (m / zeros as f64).ln();
            }
        }
        raw
    }

    /// Fold a peer sketch into this one. Fails if the precisions differ.
    pub fn merge(&mut self, other: &HyperLogLog) -> Result<(), HllError> {
        if self.precision != other.precision {
            return Err(HllError::PrecisionMismatch {
                local: self.precision,
                peer: other.precision,
            });
        }
        for (mine, theirs) in self.registers.iter_mut().zip(&other.registers) {
            if *theirs > *mine {
                *mine = *theirs;
            }
        }
        Ok(())
    }

    /// Serialize: one precision byte followed by the raw register file.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + self.registers.len());
        bytes.push(self.precision);
        bytes.extend_from_slice(&self.registers);
        bytes
    }

    /// Reconstruct a sketch serialized by [`HyperLogLog::to_bytes`].
    pub fn from_bytes(data: &[u8]) -> Result<Self, HllError> {
        let (&precision, registers) = data
            .split_first()
            .ok_or(HllError::TruncatedState {
                expected: 1,
                got: 0,
            })?;
        if !(4..=18).contains(&precision) {
            return Err(HllError::PrecisionOutOfRange(precision));
        }
        let expected = 1usize << precision;
        if registers.len() != expected {
            return Err(HllError::TruncatedState {
                expected,
                got: registers.len(),
            });
        }
        Ok(Self {
            precision,
            registers: registers.to_vec(),
        })
    }
}

fn alpha(m: usize) -> f64 {
    match m {
        16 => 0.673,
        32 => 0.697,
        64 => 0.709,
        _ => 0.7213 / (1.0 + 1.079 / m as f64),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::{HllError, HyperLogLog, DEFAULT_PRECISION};

    #[test]
    fn empty_sketch_estimates_zero() {
        let hll = HyperLogLog::new(DEFAULT_PRECISION).unwrap();
        assert_eq!(0.0, hll.estimate());
    }

    #[test]
    fn precision_is_validated() {
        assert_eq!(
            Err(HllError::PrecisionOutOfRange(3)),
            HyperLogLog::new(3).map(|_| ())
        );
        assert_eq!(
            Err(HllError::PrecisionOutOfRange(19)),
            HyperLogLog::new(19).map(|_| ())
        );
    }

    #[test]
    fn estimates_track_distinct_count() {
        let mut hll = HyperLogLog::new(DEFAULT_PRECISION).unwrap();
        for i in 0..5_000 {
            let value = format!("value-{i}");
            hll.insert(value.as_bytes());
            // duplicates should not move the estimate
            hll.insert(value.as_bytes());
        }
        let estimate = hll.estimate();
        assert!(
            (estimate - 5_000.0).abs() < 250.0,
            "estimate was {estimate}"
        );
    }

    #[test]
    fn merge_counts_the_union() {
        let mut left = HyperLogLog::new(DEFAULT_PRECISION).unwrap();
        let mut right = HyperLogLog::new(DEFAULT_PRECISION).unwrap();
        for i in 0..1_000 {
            left.insert(format!("left-{i}").as_bytes());
            right.insert(format!("right-{i}").as_bytes());
        }
        // overlap should only be counted once
        for i in 0..500 {
            right.insert(format!("left-{i}").as_bytes());
        }
        left.merge(&right).unwrap();
        let estimate = left.estimate();
        assert!(
            (estimate - 2_000.0).abs() < 150.0,
            "estimate was {estimate}"
        );
    }

    #[test]
    fn merging_mismatched_precision_fails() {
        let mut narrow = HyperLogLog::new(10).unwrap();
        let wide = HyperLogLog::new(DEFAULT_PRECISION).unwrap();
        assert_eq!(
            Err(HllError::PrecisionMismatch {
                local: 10,
                peer: DEFAULT_PRECISION,
            }),
            narrow.merge(&wide)
        );
    }

    #[test]
    fn serialization_round_trips() {
        let mut hll = HyperLogLog::new(DEFAULT_PRECISION).unwrap();
        for i in 0..100 {
            hll.insert(format!("value-{i}").as_bytes());
        }
        let restored = HyperLogLog::from_bytes(&hll.to_bytes()).unwrap();
        assert_eq!(hll, restored);
    }

    #[test]
    fn truncated_state_is_rejected() {
        let hll = HyperLogLog::new(DEFAULT_PRECISION).unwrap();
        let mut bytes = hll.to_bytes();
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(
            HyperLogLog::from_bytes(&bytes),
            Err(HllError::TruncatedState { .. })
        ));
        assert!(matches!(
            HyperLogLog::from_bytes(&[]),
            Err(HllError::TruncatedState { .. })
        ));
    }
}
