//! Shard routing: the one hash function that decides which worker owns a
//! metric identity.
//!
//! Every path that picks a worker - packet ingest, the import server, and
//! flush-time re-sharding - must agree on this function, or a series would
//! be split across samplers and flush twice.

use crate::samplers::MetricKey;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a.
pub fn fnv1a_32(data: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in data {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// The shard hash of a metric identity.
pub fn key_digest(key: &MetricKey) -> u32 {
    fnv1a_32(key.to_hash_string().as_bytes())
}

/// The worker index a precomputed digest lands on.
pub fn worker_for_digest(digest: u32, worker_count: usize) -> usize {
    (digest % worker_count as u32) as usize
}

/// The worker index a metric identity lands on.
pub fn worker_for_key(key: &MetricKey, worker_count: usize) -> usize {
    worker_for_digest(key_digest(key), worker_count)
}

#[cfg(test)]
mod test {
    use super::{fnv1a_32, worker_for_digest, worker_for_key};
    use crate::samplers::{MetricKey, MetricKind};

    #[test]
    fn fnv1a_reference_vectors() {
        assert_eq!(0x811c_9dc5, fnv1a_32(b""));
        assert_eq!(0xe40c_292c, fnv1a_32(b"a"));
        assert_eq!(0xbf9c_f968, fnv1a_32(b"foobar"));
    }

    #[test]
    fn identical_keys_share_a_worker() {
        let tags = vec!["env:prod".to_string()];
        let first = MetricKey::new("api.latency", MetricKind::Histogram, &tags);
        let second = MetricKey::new("api.latency", MetricKind::Histogram, &tags);
        for workers in 1..16 {
            assert_eq!(
                worker_for_key(&first, workers),
                worker_for_key(&second, workers)
            );
        }
    }

    #[test]
    fn digest_and_key_routing_agree() {
        let key = MetricKey::new("a.b.c", MetricKind::Counter, &[]);
        let digest = super::key_digest(&key);
        assert_eq!(worker_for_digest(digest, 7), worker_for_key(&key, 7));
    }

    #[test]
    fn different_types_are_different_identities() {
        let counter = MetricKey::new("a.b.c", MetricKind::Counter, &[]);
        let gauge = MetricKey::new("a.b.c", MetricKind::Gauge, &[]);
        assert_ne!(super::key_digest(&counter), super::key_digest(&gauge));
    }
}
