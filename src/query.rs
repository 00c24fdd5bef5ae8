use std::path::Path;

use log::{debug, warn};
use rayon::prelude::*;

use crate::config::ScanOptions;
use crate::engine::{Order, Scores, ShardSource, TopKEngine, TopKResult};
use crate::error::{Result, SeekError};
use crate::format::ShardData;
use crate::io::read_csv_matrix;
use crate::prefix::{self, PositionResult};
use crate::store::{Family, Manifest, ShardStore, Variant};
use crate::utils::vector::Metric;

/// `Q` query vectors of `dims` values each, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryBatch {
    dims: usize,
    data: Vec<f32>,
}

impl QueryBatch {
    pub fn from_flat(data: Vec<f32>, dims: usize) -> Result<Self> {
        if dims == 0 || data.is_empty() {
            return Err(SeekError::InvalidArgument("query batch is empty".into()));
        }
        if data.len() % dims != 0 {
            return Err(SeekError::InvalidArgument(format!(
                "query buffer of {} values is not a multiple of {} dims",
                data.len(),
                dims
            )));
        }
        if let Some(i) = data.iter().position(|x| !x.is_finite()) {
            warn!("Query batch contains non-finite value at query {}, dim {}", i / dims, i % dims);
        }
        Ok(Self { dims, data })
    }

    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let dims = rows.first().map_or(0, |r| r.len());
        if let Some(bad) = rows.iter().find(|r| r.len() != dims) {
            return Err(SeekError::DimensionMismatch { expected: dims, got: bad.len() });
        }
        Self::from_flat(rows.concat(), dims)
    }

    pub fn from_csv(path: &Path) -> Result<Self> {
        Self::from_rows(&read_csv_matrix(path)?)
    }

    pub fn single(query: &[f32]) -> Result<Self> {
        Self::from_flat(query.to_vec(), query.len())
    }

    /// From a dense array of shape `[D]` or `[Q, D]`.
    pub fn from_shape(shape: &[usize], data: Vec<f32>) -> Result<Self> {
        match *shape {
            [_] => Self::single(&data),
            [_, dims] => Self::from_flat(data, dims),
            _ => Err(SeekError::InvalidArgument(format!(
                "queries must be 1-D or 2-D, got {} dimensions",
                shape.len()
            ))),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len() / self.dims
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn row(&self, q: usize) -> &[f32] {
        &self.data[q * self.dims..(q + 1) * self.dims]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f32]> + '_ {
        self.data.chunks_exact(self.dims)
    }

    pub(crate) fn check_dims(&self, expected: usize) -> Result<()> {
        if self.dims != expected {
            return Err(SeekError::DimensionMismatch { expected, got: self.dims });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Closest,
    Farthest,
}

impl Direction {
    pub fn order(self) -> Order {
        match self {
            Direction::Closest => Order::Smallest,
            Direction::Farthest => Order::Largest,
        }
    }
}

/// Resolves a possibly negative position (`-1` = last) against `len`.
pub fn resolve_position(t: isize, len: usize) -> Result<usize> {
    let resolved = if t < 0 { len as isize + t } else { t };
    if resolved < 0 || resolved as usize >= len {
        return Err(SeekError::PositionOutOfRange { position: t, len });
    }
    Ok(resolved as usize)
}

/// Scores `n_rows` rows against every query. `row(i)` yields the vector of
/// row `i`.
pub(crate) fn score_rows<'a, F>(
    metric: Metric,
    queries: &QueryBatch,
    n_rows: usize,
    parallel: bool,
    row: F,
) -> Scores
where
    F: Fn(usize) -> &'a [f32] + Sync,
{
    let score_query = |q: &[f32]| -> Vec<f32> { (0..n_rows).map(|i| metric.distance(q, row(i))).collect() };
    let rows: Vec<Vec<f32>> = if parallel {
        queries.data.par_chunks_exact(queries.dims).map(score_query).collect()
    } else {
        queries.rows().map(score_query).collect()
    };
    Scores::from_rows(rows)
}

/// The shards of one complete family, checked against its manifest as they load.
pub(crate) struct FamilyShards<'a> {
    store: &'a ShardStore,
    family: Family,
    manifest: Manifest,
}

impl<'a> FamilyShards<'a> {
    pub(crate) fn open(store: &'a ShardStore, family: Family) -> Result<Self> {
        let manifest = store.require_complete(&family)?;
        Ok(Self { store, family, manifest })
    }

    pub(crate) fn manifest(&self) -> &Manifest {
        &self.manifest
    }
}

impl ShardSource for FamilyShards<'_> {
    type Shard = ShardData;

    fn shard_count(&self) -> usize {
        self.manifest.n_shards()
    }

    fn load_shard(&self, idx: usize) -> Result<ShardData> {
        let shard = self.store.read_family_shard(&self.family, idx)?;
        if self.store.config().verify_on_read && shard.shape()[1..] != self.manifest.item_shape[..] {
            return Err(SeekError::format(
                shard.path(),
                format!(
                    "item shape {:?} does not match manifest {:?}",
                    &shard.shape()[1..],
                    self.manifest.item_shape
                ),
            ));
        }
        Ok(shard)
    }

    fn expected_len(&self, idx: usize) -> Option<usize> {
        self.manifest.shard_sizes.get(idx).copied()
    }

    fn describe(&self) -> String {
        self.family.name()
    }
}

/// Nearest-neighbour queries against a shard store.
#[derive(Debug, Clone)]
pub struct Searcher {
    store: ShardStore,
    metric: Metric,
    direction: Direction,
    engine: TopKEngine,
}

impl Searcher {
    pub fn new(store: ShardStore) -> Self {
        Self {
            store,
            metric: Metric::default(),
            direction: Direction::default(),
            engine: TopKEngine::default(),
        }
    }

    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_options(mut self, options: ScanOptions) -> Self {
        self.engine = TopKEngine::new(options);
        self
    }

    pub fn store(&self) -> &ShardStore {
        &self.store
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn engine(&self) -> &TopKEngine {
        &self.engine
    }

    fn parallel(&self) -> bool {
        self.engine.options().parallel
    }

    /// Exact top-k over whole items: every item is flattened and compared to
    /// the queries, which must have the flattened item length.
    pub fn topk_closest(&self, variant: &Variant, queries: &QueryBatch, k: usize) -> Result<TopKResult> {
        let source = FamilyShards::open(&self.store, Family::source(variant))?;
        queries.check_dims(source.manifest().item_len())?;
        let (metric, parallel) = (self.metric, self.parallel());
        self.engine.top_k(&source, k, self.direction.order(), |_, shard: &ShardData| {
            Ok(score_rows(metric, queries, shard.rows(), parallel, |i| shard.item(i)))
        })
    }

    /// Exact top-k of every item's row at position `t`, with no deduplication.
    pub fn topk_at_position(
        &self,
        variant: &Variant,
        t: isize,
        queries: &QueryBatch,
        k: usize,
    ) -> Result<TopKResult> {
        let source = FamilyShards::open(&self.store, Family::source(variant))?;
        let t = position_in(source.manifest(), variant, t)?;
        queries.check_dims(source.manifest().row_dims())?;
        debug!("Direct scan of {} at position {}", variant, t);
        let (metric, parallel) = (self.metric, self.parallel());
        self.engine.top_k(&source, k, self.direction.order(), |_, shard: &ShardData| {
            Ok(score_rows(metric, queries, shard.rows(), parallel, |i| shard.item_at(i, t)))
        })
    }

    /// Top-k at position `t` with one candidate per distinct key prefix of
    /// length `t + 1`. Results carry the representative key and prefix.
    pub fn topk_closest_at_position(
        &self,
        variant: &Variant,
        t: isize,
        queries: &QueryBatch,
        k: usize,
    ) -> Result<PositionResult> {
        let manifest = self.store.require_complete(&Family::source(variant))?;
        let t = position_in(&manifest, variant, t)?;
        prefix::topk_deduplicated(self, variant, &manifest, t, queries, k)
    }

    /// Top-k over the re-sliced family of `variant` at position `t`.
    pub fn topk_closest_sliced(
        &self,
        variant: &Variant,
        t: isize,
        queries: &QueryBatch,
        k: usize,
    ) -> Result<TopKResult> {
        let t = if t < 0 { self.sliced_position(variant, t)? } else { t as usize };
        let source = FamilyShards::open(&self.store, Family::sliced(variant, t))?;
        queries.check_dims(source.manifest().row_dims())?;
        let (metric, parallel) = (self.metric, self.parallel());
        self.engine.top_k(&source, k, self.direction.order(), |_, shard: &ShardData| {
            Ok(score_rows(metric, queries, shard.rows(), parallel, |i| shard.item(i)))
        })
    }

    /// Resolves a negative `t` for the slices of `variant`. Slices written
    /// under another name resolve through the source recorded in their origin.
    fn sliced_position(&self, variant: &Variant, t: isize) -> Result<usize> {
        let own = Family::source(variant);
        if self.store.read_manifest(&own)?.is_some() {
            return position_in(&self.store.require_complete(&own)?, variant, t);
        }
        for p in self.store.sliced_positions(variant)? {
            let origin = self
                .store
                .read_manifest(&Family::sliced(variant, p))?
                .and_then(|m| m.sliced_from);
            if let Some(origin) = origin {
                let src = self.store.require_complete(&Family::source(&origin.source))?;
                return position_in(&src, &origin.source, t);
            }
        }
        Err(SeekError::NotGenerated(format!("slices of {}", variant)))
    }
}

/// Resolves `t` against the position axis of a family's items.
pub(crate) fn position_in(manifest: &Manifest, variant: &Variant, t: isize) -> Result<usize> {
    let len = manifest.positions().ok_or_else(|| {
        SeekError::InvalidArgument(format!("{} has no sequence-position axis", variant))
    })?;
    resolve_position(t, len)
}
