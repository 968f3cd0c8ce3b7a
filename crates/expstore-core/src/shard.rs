//! Splits a partition's entries into disjoint shards keyed on the digest.
//!
//! Shards are ranges over a 32-bit hash of the digest field, so adding new
//! groupings never moves an existing digest to another shard.

use crate::partition::PartitionKind;
use sha2::{Digest as _, Sha256};

/// Document field the shard hash is computed from.
pub const SHARD_FIELD: &str = "digest";

/// Shards for the production partition (tuned for ~1e5-1e6 entries).
pub const MASTER_PARTITION_SHARDS: usize = 16;
/// Shards for a per-change partition (tuned for ~1e2 entries).
pub const CHANGE_LIST_PARTITION_SHARDS: usize = 2;

const HASH_SPACE: u64 = 1 << 32;

/// Half-open range `[start, end)` of the digest hash space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRange {
    pub index: usize,
    pub start: u64,
    pub end: u64,
}

impl ShardRange {
    pub fn contains(&self, hash: u32) -> bool {
        let h = u64::from(hash);
        h >= self.start && h < self.end
    }

    pub fn contains_digest(&self, digest: &str) -> bool {
        self.contains(digest_hash(digest))
    }
}

/// Stable 32-bit hash of a digest string.
pub fn digest_hash(digest: &str) -> u32 {
    let out = Sha256::digest(digest.as_bytes());
    u32::from_be_bytes([out[0], out[1], out[2], out[3]])
}

pub fn default_shards(kind: PartitionKind) -> usize {
    match kind {
        PartitionKind::Master => MASTER_PARTITION_SHARDS,
        PartitionKind::ChangeList => CHANGE_LIST_PARTITION_SHARDS,
    }
}

/// Returns `num_shards` ranges covering the hash space exactly once.
pub fn plan(num_shards: usize) -> Vec<ShardRange> {
    let n = num_shards.max(1) as u64;
    (0..n)
        .map(|i| ShardRange {
            index: i as usize,
            start: i * HASH_SPACE / n,
            end: (i + 1) * HASH_SPACE / n,
        })
        .collect()
}

/// Index of the shard that owns `digest` for a given shard count.
pub fn shard_for_digest(digest: &str, num_shards: usize) -> usize {
    let hash = digest_hash(digest);
    plan(num_shards)
        .iter()
        .position(|r| r.contains(hash))
        .unwrap_or(0)
}
