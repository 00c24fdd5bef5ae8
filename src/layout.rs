use std::ops::Range;

use crate::error::{Result, SeekError};

/// Shard boundaries of a dataset as a prefix sum of shard sizes.
///
/// Fixed-capacity datasets are just the case where every size but the last
/// equals the capacity; index translation is always `offsets[s] + local`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardLayout {
    offsets: Vec<usize>,
}

impl ShardLayout {
    pub fn from_sizes(sizes: &[usize]) -> Self {
        let mut offsets = Vec::with_capacity(sizes.len() + 1);
        offsets.push(0);
        let mut acc = 0;
        for &s in sizes {
            acc += s;
            offsets.push(acc);
        }
        Self { offsets }
    }

    /// `ceil(n_items / capacity)` shards, all full except possibly the last.
    pub fn fixed(n_items: usize, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(SeekError::InvalidArgument("shard capacity must be > 0".into()));
        }
        let n_shards = n_items.div_ceil(capacity);
        let sizes: Vec<usize> = (0..n_shards)
            .map(|s| capacity.min(n_items - s * capacity))
            .collect();
        Ok(Self::from_sizes(&sizes))
    }

    pub fn n_shards(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn shard_len(&self, shard: usize) -> usize {
        self.offsets[shard + 1] - self.offsets[shard]
    }

    /// Global index range covered by `shard`.
    pub fn shard_range(&self, shard: usize) -> Range<usize> {
        self.offsets[shard]..self.offsets[shard + 1]
    }

    pub fn global_index(&self, shard: usize, local: usize) -> usize {
        debug_assert!(local < self.shard_len(shard));
        self.offsets[shard] + local
    }
}
