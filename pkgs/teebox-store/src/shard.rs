//! Shard router - maps message positions to per-conversation partitions
//!
//! A conversation's messages are split into at most `max_shards` partitions
//! of `shard_size` messages each. The last partition absorbs everything past
//! `shard_size * max_shards`, so the number of partitions a reader has to
//! enumerate stays bounded while the last one grows without limit.

use std::fmt;
use tracing::warn;

pub const DEFAULT_SHARD_SIZE: u64 = 500;
pub const DEFAULT_MAX_SHARDS: u32 = 20;

/// Shard index within one conversation. Shard 0 is the "default" shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShardId(pub u32);

impl ShardId {
    pub const DEFAULT: ShardId = ShardId(0);

    pub fn index(&self) -> u32 {
        self.0
    }

    /// Column value stored with each message
    pub fn as_column(&self) -> i32 {
        self.0 as i32
    }

    pub fn is_default(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_default() {
            f.write_str("default")
        } else {
            write!(f, "shard_{}", self.0)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRouter {
    shard_size: u64,
    max_shards: u32,
}

impl Default for ShardRouter {
    fn default() -> Self {
        Self::new(DEFAULT_SHARD_SIZE, DEFAULT_MAX_SHARDS)
    }
}

impl ShardRouter {
    /// Zero sizes are clamped to 1
    pub fn new(shard_size: u64, max_shards: u32) -> Self {
        Self {
            shard_size: shard_size.max(1),
            max_shards: max_shards.max(1),
        }
    }

    pub fn shard_size(&self) -> u64 {
        self.shard_size
    }

    pub fn max_shards(&self) -> u32 {
        self.max_shards
    }

    /// Shard holding the message at position `message_index`
    pub fn shard_for(&self, message_index: i64) -> ShardId {
        if message_index < 0 {
            warn!(
                "Invalid message index {}, routing to the default shard",
                message_index
            );
            return ShardId::DEFAULT;
        }
        let raw = message_index as u64 / self.shard_size;
        ShardId(raw.min(u64::from(self.max_shards - 1)) as u32)
    }

    /// Shard the next appended message lands in
    pub fn write_shard(&self, message_count: i64) -> ShardId {
        self.shard_for(message_count.max(0))
    }

    /// Number of shards that may hold data, counting the slot of an append
    /// whose metadata update has not landed yet
    pub fn shard_count(&self, message_count: i64) -> u32 {
        self.write_shard(message_count).0 + 1
    }

    /// Shards from the write shard down to the default shard
    pub fn newest_first(&self, message_count: i64) -> impl Iterator<Item = ShardId> {
        self.shards_from(self.write_shard(message_count))
    }

    /// `start` and every older shard, newest first
    pub fn shards_from(&self, start: ShardId) -> impl Iterator<Item = ShardId> {
        let start = start.0.min(self.max_shards - 1);
        (0..=start).rev().map(ShardId)
    }
}
