//! A consistent-hash ring over forwarding destinations.
//!
//! Every proxy instance that observes the same member set must map a key to
//! the same destination; that convergence is what lets one metric identity
//! land on one global aggregator no matter which proxy received it.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

// Points placed on the ring per member. More points smooth the load split
// between members.
const POINTS_PER_MEMBER: u32 = 160;

/// An immutable consistent-hash ring. Build a new one to change membership.
#[derive(Debug, Default, Clone)]
pub struct Ring {
    points: BTreeMap<u32, String>,
    members: Vec<String>,
}

impl Ring {
    /// Build a ring over the given members. Member order does not affect
    /// the key-to-member mapping.
    pub fn new(members: impl IntoIterator<Item = String>) -> Self {
        let mut ring = Ring::default();
        for member in members {
            for replica in 0..POINTS_PER_MEMBER {
                let point = crc32fast::hash(format!("{member}#{replica}").as_bytes());
                ring.points.insert(point, member.clone());
            }
            ring.members.push(member);
        }
        ring.members.sort();
        ring.members.dedup();
        ring
    }

    /// The member owning `key`: the first ring point clockwise from the
    /// key's hash. None when the ring has no members.
    pub fn get(&self, key: &str) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }
        let hash = crc32fast::hash(key.as_bytes());
        self.points
            .range(hash..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, member)| member.as_str())
    }

    /// The sorted member list.
    pub fn members(&self) -> &[String] {
        &self.members
    }

    /// Whether the ring has no members.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// The shared, copy-on-write published view of a ring. Readers snapshot an
/// immutable handle per request; refreshes publish a whole new ring.
#[derive(Debug, Default)]
pub struct SharedRing {
    current: ArcSwap<Ring>,
}

impl SharedRing {
    /// Publish an initial ring.
    pub fn new(ring: Ring) -> Self {
        Self {
            current: ArcSwap::from_pointee(ring),
        }
    }

    /// The current ring. The snapshot stays valid across later publishes.
    pub fn snapshot(&self) -> Arc<Ring> {
        self.current.load_full()
    }

    /// Atomically replace the ring.
    pub fn publish(&self, ring: Ring) {
        self.current.store(Arc::new(ring));
    }
}
