//! Out-of-core exact top-k.
//!
//! Shards are scanned one at a time: each is loaded, scored against every
//! query, and reduced to its local top-k. The local winners are pooled with a
//! fixed stride of `k` per shard and a final top-k over the pool picks the
//! global answer. This is exact as long as every shard holds at least `k`
//! items, which is checked for every shard.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info};
use ordered_float::OrderedFloat;
use rayon::prelude::*;

use crate::config::{ScanOptions, MAX_TOP_K};
use crate::error::{Result, SeekError};
use crate::format::{ShardData, Tensor};
use crate::layout::ShardLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    #[default]
    Smallest,
    Largest,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub distance: f32,
    pub index: usize,
}

/// Exactly `k` neighbours per query, best first, no repeated indices.
#[derive(Debug, Clone, PartialEq)]
pub struct TopKResult {
    pub k: usize,
    pub order: Order,
    pub per_query: Vec<Vec<Neighbor>>,
}

impl TopKResult {
    pub fn n_queries(&self) -> usize {
        self.per_query.len()
    }

    pub fn query(&self, q: usize) -> &[Neighbor] {
        &self.per_query[q]
    }

    pub fn indices(&self, q: usize) -> Vec<usize> {
        self.per_query[q].iter().map(|n| n.index).collect()
    }

    pub fn distances(&self, q: usize) -> Vec<f32> {
        self.per_query[q].iter().map(|n| n.distance).collect()
    }
}

/// Per-query scores for one shard, row-major: `values[q * n_items + i]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Scores {
    pub n_queries: usize,
    pub values: Vec<f32>,
}

impl Scores {
    pub fn new(n_queries: usize, values: Vec<f32>) -> Self {
        Self { n_queries, values }
    }

    pub fn from_rows(rows: Vec<Vec<f32>>) -> Self {
        let n_queries = rows.len();
        Self { n_queries, values: rows.into_iter().flatten().collect() }
    }

    fn row(&self, q: usize, n_items: usize) -> &[f32] {
        &self.values[q * n_items..(q + 1) * n_items]
    }
}

/// Anything the engine can count items of.
pub trait ShardItems {
    fn item_count(&self) -> usize;
}

impl ShardItems for ShardData {
    fn item_count(&self) -> usize {
        self.rows()
    }
}

impl ShardItems for Tensor {
    fn item_count(&self) -> usize {
        self.rows()
    }
}

/// Sequence of shards the engine scans, in order.
pub trait ShardSource: Sync {
    type Shard: ShardItems;

    fn shard_count(&self) -> usize;

    fn load_shard(&self, idx: usize) -> Result<Self::Shard>;

    /// Item count the source promises for `idx`, checked after loading.
    fn expected_len(&self, _idx: usize) -> Option<usize> {
        None
    }

    fn describe(&self) -> String {
        "shards".to_string()
    }
}

#[inline]
fn rank_key(order: Order, score: f32) -> OrderedFloat<f32> {
    match order {
        Order::Smallest => OrderedFloat(score),
        Order::Largest => OrderedFloat(-score),
    }
}

#[inline]
fn unrank(order: Order, key: OrderedFloat<f32>) -> f32 {
    match order {
        Order::Smallest => key.0,
        Order::Largest => -key.0,
    }
}

/// Best `k` of `(score, id)` pairs, best first. Ties go to the smaller id and
/// NaN scores rank last.
pub fn select_top_k<I>(items: I, k: usize, order: Order) -> Vec<(f32, usize)>
where
    I: IntoIterator<Item = (f32, usize)>,
{
    if k == 0 {
        return Vec::new();
    }
    // max-heap on (key, id): the root is the current worst survivor
    let mut heap: BinaryHeap<(OrderedFloat<f32>, usize)> = BinaryHeap::with_capacity(k + 1);
    for (score, id) in items {
        let entry = (rank_key(order, score), id);
        if heap.len() < k {
            heap.push(entry);
        } else if let Some(worst) = heap.peek() {
            if entry < *worst {
                heap.pop();
                heap.push(entry);
            }
        }
    }
    heap.into_sorted_vec()
        .into_iter()
        .map(|(key, id)| (unrank(order, key), id))
        .collect()
}

#[derive(Debug, Default)]
pub struct EngineMetrics {
    scans: AtomicUsize,
    shards_scanned: AtomicUsize,
    items_scored: AtomicUsize,
    total_scan_ms: AtomicUsize,
}

impl EngineMetrics {
    fn record_shard(&self, items: usize, n_queries: usize) {
        self.shards_scanned.fetch_add(1, Ordering::Relaxed);
        self.items_scored.fetch_add(items * n_queries, Ordering::Relaxed);
    }

    fn record_scan(&self, duration_ms: u64) {
        self.scans.fetch_add(1, Ordering::Relaxed);
        self.total_scan_ms.fetch_add(duration_ms as usize, Ordering::Relaxed);
    }

    /// `(scans, shards scanned, item-query pairs scored, avg scan ms)`
    pub fn get_stats(&self) -> (usize, usize, usize, f64) {
        let scans = self.scans.load(Ordering::Relaxed);
        let total = self.total_scan_ms.load(Ordering::Relaxed);
        let avg = if scans > 0 { total as f64 / scans as f64 } else { 0.0 };
        (
            scans,
            self.shards_scanned.load(Ordering::Relaxed),
            self.items_scored.load(Ordering::Relaxed),
            avg,
        )
    }
}

struct LocalTopK {
    len: usize,
    n_queries: usize,
    /// `n_queries * k` entries, one k-stride per query.
    scores: Vec<f32>,
    locals: Vec<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct TopKEngine {
    options: ScanOptions,
    metrics: Arc<EngineMetrics>,
}

impl TopKEngine {
    pub fn new(options: ScanOptions) -> Self {
        Self { options, metrics: Arc::new(EngineMetrics::default()) }
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// Exact top-k of `score` over every item of `source`, per query.
    ///
    /// `score` receives the shard index and the loaded shard and must return
    /// one score per item for each query.
    pub fn top_k<S, F>(&self, source: &S, k: usize, order: Order, score: F) -> Result<TopKResult>
    where
        S: ShardSource,
        F: Fn(usize, &S::Shard) -> Result<Scores> + Sync,
    {
        if k == 0 {
            return Err(SeekError::InvalidArgument("k must be > 0".into()));
        }
        if k > MAX_TOP_K {
            return Err(SeekError::InvalidArgument(format!(
                "k too large: {} (max: {})",
                k, MAX_TOP_K
            )));
        }
        let n_shards = source.shard_count();
        if n_shards == 0 {
            return Err(SeekError::NotGenerated(source.describe()));
        }

        let start = Instant::now();
        let done = AtomicUsize::new(0);
        let scan_one = |idx: usize| self.scan_shard(source, idx, k, order, &score, &done);

        let locals: Vec<LocalTopK> = if self.options.parallel {
            (0..n_shards).into_par_iter().map(scan_one).collect::<Result<_>>()?
        } else {
            let mut out = Vec::with_capacity(n_shards);
            for idx in 0..n_shards {
                out.push(scan_one(idx)?);
            }
            out
        };

        let result = merge(&locals, k, order)?;

        let ms = start.elapsed().as_secs_f64() * 1000.0;
        self.metrics.record_scan(ms as u64);
        info!(
            "Top-{} over {} ({} shards, {} queries) in {:.2}ms",
            k,
            source.describe(),
            n_shards,
            result.n_queries(),
            ms
        );
        Ok(result)
    }

    fn scan_shard<S, F>(
        &self,
        source: &S,
        idx: usize,
        k: usize,
        order: Order,
        score: &F,
        done: &AtomicUsize,
    ) -> Result<LocalTopK>
    where
        S: ShardSource,
        F: Fn(usize, &S::Shard) -> Result<Scores> + Sync,
    {
        if self.options.is_cancelled() {
            return Err(SeekError::Cancelled { shards_done: done.load(Ordering::Relaxed) });
        }

        let shard = source.load_shard(idx)?;
        let len = shard.item_count();
        if let Some(expected) = source.expected_len(idx) {
            if expected != len {
                return Err(SeekError::ShardSizeMismatch { shard: idx, expected, got: len });
            }
        }
        if len < k {
            return Err(SeekError::KExceedsShard { k, shard: idx, items: len });
        }

        let scores = score(idx, &shard)?;
        let expected = scores.n_queries * len;
        if scores.n_queries == 0 || scores.values.len() != expected {
            return Err(SeekError::ScoreCountMismatch {
                shard: idx,
                expected: expected.max(len),
                got: scores.values.len(),
            });
        }

        let per_query = |q: usize| select_top_k(scores.row(q, len).iter().copied().zip(0..), k, order);
        let winners: Vec<Vec<(f32, usize)>> = if self.options.parallel {
            (0..scores.n_queries).into_par_iter().map(per_query).collect()
        } else {
            (0..scores.n_queries).map(per_query).collect()
        };

        let mut local = LocalTopK {
            len,
            n_queries: scores.n_queries,
            scores: Vec::with_capacity(scores.n_queries * k),
            locals: Vec::with_capacity(scores.n_queries * k),
        };
        for row in winners {
            for (s, l) in row {
                local.scores.push(s);
                local.locals.push(l);
            }
        }

        self.metrics.record_shard(len, scores.n_queries);
        done.fetch_add(1, Ordering::Relaxed);
        debug!("Shard {} of {}: {} items scored", idx, source.describe(), len);
        Ok(local)
    }
}

/// Pools the per-shard winners with a stride of `k` per shard and takes the
/// final top-k. Pool position `p` came from shard `p / k`.
fn merge(locals: &[LocalTopK], k: usize, order: Order) -> Result<TopKResult> {
    let n_queries = locals.first().map_or(0, |l| l.n_queries);
    if let Some(bad) = locals.iter().find(|l| l.n_queries != n_queries) {
        return Err(SeekError::InvalidArgument(format!(
            "scoring function returned {} query rows for one shard and {} for another",
            n_queries, bad.n_queries
        )));
    }

    let sizes: Vec<usize> = locals.iter().map(|l| l.len).collect();
    let layout = ShardLayout::from_sizes(&sizes);

    let mut per_query = Vec::with_capacity(n_queries);
    for q in 0..n_queries {
        let mut pooled_scores = Vec::with_capacity(locals.len() * k);
        let mut pooled_locals = Vec::with_capacity(locals.len() * k);
        for local in locals {
            pooled_scores.extend_from_slice(&local.scores[q * k..(q + 1) * k]);
            pooled_locals.extend_from_slice(&local.locals[q * k..(q + 1) * k]);
        }

        let candidates = pooled_scores.iter().enumerate().map(|(p, &s)| {
            let shard = p / k;
            (s, layout.global_index(shard, pooled_locals[p]))
        });
        let best = select_top_k(candidates, k, order);
        per_query.push(
            best.into_iter()
                .map(|(distance, index)| Neighbor { distance, index })
                .collect(),
        );
    }

    Ok(TopKResult { k, order, per_query })
}

/// Reference single-pass top-k over an in-memory score matrix
/// (`scores[q][i]`), used to check the sharded path.
pub fn reference_top_k(scores: &[Vec<f32>], k: usize, order: Order) -> TopKResult {
    let per_query = scores
        .iter()
        .map(|row| {
            let mut all: Vec<(f32, usize)> = row.iter().copied().zip(0..).collect();
            all.sort_by_key(|&(s, i)| (rank_key(order, s), i));
            all.truncate(k);
            all.into_iter()
                .map(|(distance, index)| Neighbor { distance, index })
                .collect()
        })
        .collect();
    TopKResult { k, order, per_query }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicBool;

    /// In-memory 1-D "vectors": item `i` of the dataset is `values[i]`.
    struct VecShards {
        shards: Vec<Vec<f32>>,
    }

    impl VecShards {
        fn split(values: &[f32], capacity: usize) -> Self {
            Self { shards: values.chunks(capacity).map(|c| c.to_vec()).collect() }
        }
    }

    impl ShardSource for VecShards {
        type Shard = Tensor;

        fn shard_count(&self) -> usize {
            self.shards.len()
        }

        fn load_shard(&self, idx: usize) -> Result<Tensor> {
            Tensor::new(vec![self.shards[idx].len(), 1], self.shards[idx].clone())
        }
    }

    fn abs_distance(queries: &[f32]) -> impl Fn(usize, &Tensor) -> Result<Scores> + Sync + '_ {
        move |_, shard: &Tensor| {
            Ok(Scores::from_rows(
                queries
                    .iter()
                    .map(|q| shard.data().iter().map(|x| (x - q).abs()).collect())
                    .collect(),
            ))
        }
    }

    #[test]
    fn ten_items_capacity_four_finds_item_seven() {
        let values: Vec<f32> = (0..10).map(|i| i as f32).collect();
        let source = VecShards::split(&values, 4);
        let engine = TopKEngine::default();
        let result = engine.top_k(&source, 2, Order::Smallest, abs_distance(&[7.0])).unwrap();
        assert_eq!(result.query(0)[0], Neighbor { distance: 0.0, index: 7 });
        // 6 and 8 tie at distance 1; the smaller index wins
        assert_eq!(result.query(0)[1], Neighbor { distance: 1.0, index: 6 });
    }

    #[test]
    fn largest_order_and_ties() {
        let values = vec![1.0, 5.0, 5.0, 2.0, 5.0, 0.0];
        let source = VecShards::split(&values, 3);
        let engine = TopKEngine::default();
        let result = engine.top_k(&source, 3, Order::Largest, abs_distance(&[0.0])).unwrap();
        assert_eq!(result.indices(0), vec![1, 2, 4]);
        assert_eq!(result.distances(0), vec![5.0, 5.0, 5.0]);
    }

    #[test]
    fn short_shard_is_a_configuration_error() {
        let values: Vec<f32> = (0..10).map(|i| i as f32).collect();
        let source = VecShards::split(&values, 4);
        let err = TopKEngine::default()
            .top_k(&source, 3, Order::Smallest, abs_distance(&[0.0]))
            .unwrap_err();
        assert!(matches!(err, SeekError::KExceedsShard { k: 3, shard: 2, items: 2 }));
    }

    #[test]
    fn mismatched_score_count_is_surfaced() {
        let source = VecShards::split(&[1.0, 2.0, 3.0], 3);
        let err = TopKEngine::default()
            .top_k(&source, 1, Order::Smallest, |_, _: &Tensor| Ok(Scores::new(1, vec![0.0, 1.0])))
            .unwrap_err();
        assert!(matches!(err, SeekError::ScoreCountMismatch { shard: 0, expected: 3, got: 2 }));
    }

    #[test]
    fn cancelled_scan_stops() {
        let flag = Arc::new(AtomicBool::new(true));
        let engine = TopKEngine::new(ScanOptions::default().with_cancel(flag));
        let source = VecShards::split(&[1.0, 2.0], 1);
        let err = engine.top_k(&source, 1, Order::Smallest, abs_distance(&[0.0])).unwrap_err();
        assert!(matches!(err, SeekError::Cancelled { shards_done: 0 }));
    }

    #[test]
    fn cancellation_reports_completed_shards() {
        let flag = Arc::new(AtomicBool::new(false));
        let engine = TopKEngine::new(ScanOptions::default().with_cancel(flag.clone()));
        let source = VecShards::split(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2);
        let err = engine
            .top_k(&source, 1, Order::Smallest, |idx, shard: &Tensor| {
                if idx == 1 {
                    flag.store(true, Ordering::Relaxed);
                }
                Ok(Scores::new(1, shard.data().to_vec()))
            })
            .unwrap_err();
        assert!(matches!(err, SeekError::Cancelled { shards_done: 2 }));
    }

    #[test]
    fn nan_scores_rank_last() {
        let picked = select_top_k(vec![(f32::NAN, 0), (3.0, 1), (1.0, 2)], 2, Order::Smallest);
        assert_eq!(picked, vec![(1.0, 2), (3.0, 1)]);
        let picked = select_top_k(vec![(f32::NAN, 0), (3.0, 1), (1.0, 2)], 2, Order::Largest);
        assert_eq!(picked, vec![(3.0, 1), (1.0, 2)]);
    }

    #[test]
    fn metrics_accumulate() {
        let source = VecShards::split(&[1.0, 2.0, 3.0, 4.0], 2);
        let engine = TopKEngine::default();
        engine.top_k(&source, 1, Order::Smallest, abs_distance(&[0.0, 1.0])).unwrap();
        let (scans, shards, scored, _) = engine.metrics().get_stats();
        assert_eq!((scans, shards, scored), (1, 2, 8));
    }

    proptest! {
        #[test]
        fn sharded_equals_single_pass(
            values in proptest::collection::vec(-8i32..8, 1..60),
            queries in proptest::collection::vec(-8i32..8, 1..4),
            cap in 1usize..12,
            k_seed in 0usize..100,
            largest in any::<bool>(),
            parallel in any::<bool>(),
        ) {
            // integer-valued data forces plenty of exact ties
            let values: Vec<f32> = values.into_iter().map(|v| v as f32).collect();
            let queries: Vec<f32> = queries.into_iter().map(|v| v as f32 * 0.5).collect();
            let source = VecShards::split(&values, cap);
            let min_len = source.shards.iter().map(|s| s.len()).min().unwrap();
            let k = 1 + k_seed % min_len;
            let order = if largest { Order::Largest } else { Order::Smallest };

            let engine = TopKEngine::new(ScanOptions { parallel, cancel: None });
            let sharded = engine.top_k(&source, k, order, abs_distance(&queries)).unwrap();

            let full: Vec<Vec<f32>> = queries
                .iter()
                .map(|q| values.iter().map(|x| (x - q).abs()).collect())
                .collect();
            let expected = reference_top_k(&full, k, order);
            prop_assert_eq!(sharded, expected);
        }
    }
}
