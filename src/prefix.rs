//! Position-scoped queries with prefix deduplication.
//!
//! At position `t` a causal model's vector only depends on the first `t + 1`
//! characters of a key, so every key sharing that prefix carries the same
//! row. Only one representative per prefix (the first occurrence) is scanned.
//! Representatives are gathered shard by shard into reduced batches, and
//! consecutive shards are grouped until each batch holds at least `k` rows so
//! the two-stage merge stays exact.

use log::info;
use serde::{Deserialize, Serialize};

use crate::dedup::{char_prefix, DedupMap};
use crate::engine::{ShardItems, ShardSource, TopKResult};
use crate::error::{Result, SeekError};
use crate::format::Tensor;
use crate::layout::ShardLayout;
use crate::query::{score_rows, QueryBatch, Searcher};
use crate::store::{Family, KeyMap, Manifest, ShardStore, Variant};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionMatch {
    pub distance: f32,
    /// Global index of the representative item.
    pub index: usize,
    pub key: String,
    pub prefix: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PositionResult {
    pub position: usize,
    /// False when `position` is the last one and every item was scanned.
    pub deduplicated: bool,
    /// Number of items actually scored per query.
    pub candidates: usize,
    pub per_query: Vec<Vec<PositionMatch>>,
}

impl PositionResult {
    pub fn keys(&self, q: usize) -> Vec<&str> {
        self.per_query[q].iter().map(|m| m.key.as_str()).collect()
    }

    pub fn distances(&self, q: usize) -> Vec<f32> {
        self.per_query[q].iter().map(|m| m.distance).collect()
    }
}

/// Local indices of representatives inside one source shard.
#[derive(Debug, Clone, PartialEq)]
struct ShardPick {
    shard: usize,
    locals: Vec<usize>,
}

/// A reduced batch: the picks of one or more consecutive source shards.
#[derive(Debug, Clone, PartialEq)]
struct PickGroup {
    picks: Vec<ShardPick>,
    rows: usize,
}

/// Splits ascending global `reps` by shard.
fn picks_per_shard(layout: &ShardLayout, reps: &[usize]) -> Vec<ShardPick> {
    (0..layout.n_shards())
        .map(|shard| {
            let range = layout.shard_range(shard);
            let lo = reps.partition_point(|&g| g < range.start);
            let hi = reps.partition_point(|&g| g < range.end);
            ShardPick { shard, locals: reps[lo..hi].iter().map(|g| g - range.start).collect() }
        })
        .collect()
}

/// Groups consecutive shards so every group has at least `k` rows. A short
/// trailing group is folded into the one before it.
fn group_picks(picks: Vec<ShardPick>, k: usize) -> Result<Vec<PickGroup>> {
    let total: usize = picks.iter().map(|p| p.locals.len()).sum();
    if total < k {
        return Err(SeekError::InvalidArgument(format!(
            "k = {} exceeds the {} distinct prefixes available",
            k, total
        )));
    }

    let mut groups: Vec<PickGroup> = Vec::new();
    let mut current = PickGroup { picks: Vec::new(), rows: 0 };
    for pick in picks {
        if pick.locals.is_empty() {
            continue;
        }
        current.rows += pick.locals.len();
        current.picks.push(pick);
        if current.rows >= k {
            groups.push(std::mem::replace(&mut current, PickGroup { picks: Vec::new(), rows: 0 }));
        }
    }
    if current.rows > 0 {
        match groups.last_mut() {
            Some(last) => {
                last.rows += current.rows;
                last.picks.extend(current.picks);
            }
            None => groups.push(current),
        }
    }
    Ok(groups)
}

/// Source of reduced batches: representative rows at position `t`.
struct ReducedShards<'a> {
    store: &'a ShardStore,
    family: Family,
    manifest: &'a Manifest,
    groups: Vec<PickGroup>,
    t: usize,
}

impl ShardSource for ReducedShards<'_> {
    type Shard = Tensor;

    fn shard_count(&self) -> usize {
        self.groups.len()
    }

    fn load_shard(&self, idx: usize) -> Result<Tensor> {
        let group = &self.groups[idx];
        let dims = self.manifest.row_dims();
        let mut data = Vec::with_capacity(group.rows * dims);
        for pick in &group.picks {
            let shard = self.store.read_family_shard(&self.family, pick.shard)?;
            let expected = self.manifest.shard_sizes[pick.shard];
            if shard.item_count() != expected {
                return Err(SeekError::ShardSizeMismatch {
                    shard: pick.shard,
                    expected,
                    got: shard.item_count(),
                });
            }
            if shard.positions() != self.manifest.positions() || shard.row_dims() != dims {
                return Err(SeekError::format(shard.path(), "item shape does not match manifest"));
            }
            for &local in &pick.locals {
                data.extend_from_slice(shard.item_at(local, self.t));
            }
        }
        Tensor::new(vec![group.rows, dims], data)
    }

    fn expected_len(&self, idx: usize) -> Option<usize> {
        self.groups.get(idx).map(|g| g.rows)
    }

    fn describe(&self) -> String {
        format!("{} (deduplicated at t={})", self.family, self.t)
    }
}

/// Loads the key map and checks it belongs to the family behind `manifest`.
fn key_map_for(store: &ShardStore, variant: &Variant, manifest: &Manifest) -> Result<KeyMap> {
    let key_map = store.read_key_map()?;
    if key_map.len() != manifest.n_items {
        return Err(SeekError::InvalidArgument(format!(
            "key map has {} keys but {} holds {} items",
            key_map.len(),
            variant,
            manifest.n_items
        )));
    }
    if let Some(expected) = &manifest.keys_fingerprint {
        if *expected != key_map.fingerprint() {
            return Err(SeekError::InvalidArgument(format!(
                "key map does not belong to the generation run of {}",
                variant
            )));
        }
    }
    Ok(key_map)
}

pub(crate) fn topk_deduplicated(
    searcher: &Searcher,
    variant: &Variant,
    manifest: &Manifest,
    t: usize,
    queries: &QueryBatch,
    k: usize,
) -> Result<PositionResult> {
    queries.check_dims(manifest.row_dims())?;
    let key_map = key_map_for(searcher.store(), variant, manifest)?;
    let keys = key_map.keys();
    let last = manifest.positions().map_or(0, |n| n.saturating_sub(1));

    if t == last {
        // every prefix is a whole key, so nothing collapses
        let result = searcher.topk_at_position(variant, t as isize, queries, k)?;
        let per_query = to_matches(&result, |idx| {
            let key = keys
                .get(idx)
                .copied()
                .ok_or(SeekError::UnknownCandidate { index: idx, len: keys.len() })?;
            Ok((idx, key.to_owned(), char_prefix(key, t + 1).unwrap_or(key).to_owned()))
        })?;
        return Ok(PositionResult { position: t, deduplicated: false, candidates: keys.len(), per_query });
    }

    let map = DedupMap::for_position(&keys, t)?;
    let reps = map.global_indices();
    let layout = manifest.layout();
    let groups = group_picks(picks_per_shard(&layout, &reps), k)?;
    info!(
        "Position {} of {}: {} distinct prefixes out of {} items in {} reduced batches",
        t,
        variant,
        reps.len(),
        manifest.n_items,
        groups.len()
    );

    let source = ReducedShards {
        store: searcher.store(),
        family: Family::source(variant),
        manifest,
        groups,
        t,
    };
    let (metric, parallel) = (searcher.metric(), searcher.engine().options().parallel);
    let result = searcher.engine().top_k(&source, k, searcher.direction().order(), |_, batch: &Tensor| {
        Ok(score_rows(metric, queries, batch.rows(), parallel, |i| batch.item(i)))
    })?;

    // reduced index r is the r-th representative
    let per_query = to_matches(&result, |r| representative(&map, &keys, r))?;
    Ok(PositionResult { position: t, deduplicated: true, candidates: reps.len(), per_query })
}

/// Dataset index, key and prefix of the `r`-th representative.
fn representative(map: &DedupMap, keys: &[&str], r: usize) -> Result<(usize, String, String)> {
    let (prefix, global) = map
        .entry(r)
        .ok_or(SeekError::UnknownCandidate { index: r, len: map.len() })?;
    let key = keys
        .get(global)
        .ok_or(SeekError::UnknownCandidate { index: global, len: keys.len() })?;
    Ok((global, key.to_string(), prefix.to_owned()))
}

fn to_matches<F>(result: &TopKResult, resolve: F) -> Result<Vec<Vec<PositionMatch>>>
where
    F: Fn(usize) -> Result<(usize, String, String)>,
{
    result
        .per_query
        .iter()
        .map(|row| {
            row.iter()
                .map(|n| {
                    let (index, key, prefix) = resolve(n.index)?;
                    Ok(PositionMatch { distance: n.distance, index, key, prefix })
                })
                .collect()
        })
        .collect()
}
