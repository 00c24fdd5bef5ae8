//! Generation pass: run the model over every key and persist its per-stage
//! vectors as shard families.

use std::collections::BTreeMap;

use log::{info, warn};

use crate::error::{Result, SeekError};
use crate::format::{self, Tensor};
use crate::io::remove_if_exists;
use crate::store::{keys_fingerprint, new_generation_id, Family, KeyMap, Manifest, ShardStore, Variant};

/// The model collaborator. Given a batch of keys it returns, per variant, one
/// tensor whose first axis matches the batch. Must be deterministic.
pub trait ActivationModel {
    fn variants(&self) -> Vec<Variant>;

    fn run(&self, batch: &[&str]) -> Result<BTreeMap<Variant, Tensor>>;
}

#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    /// Skip shards that are already on disk with the right row count for
    /// every variant.
    pub resume: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateSummary {
    pub n_items: usize,
    pub n_shards: usize,
    pub shards_skipped: usize,
    pub variants: Vec<Variant>,
}

fn validate_keys<S: AsRef<str>>(keys: &[S]) -> Result<usize> {
    let first = keys
        .first()
        .ok_or_else(|| SeekError::InvalidArgument("no keys to generate".into()))?;
    let len = first.as_ref().chars().count();
    if let Some(bad) = keys.iter().find(|k| k.as_ref().chars().count() != len) {
        return Err(SeekError::InvalidArgument(format!(
            "key {:?} has length {}, expected {}",
            bad.as_ref(),
            bad.as_ref().chars().count(),
            len
        )));
    }
    Ok(len)
}

/// True if shard `idx` of `variant` is already on disk with `rows` rows.
fn shard_present(store: &ShardStore, variant: &Variant, idx: usize, rows: usize) -> bool {
    let path = store.shard_path(&Family::source(variant), idx);
    path.is_file() && format::read_header(&path).map_or(false, |h| h.rows() == rows)
}

/// Runs `model` over `keys` in chunks of the store capacity and writes one
/// shard per chunk per variant. Manifests and the key map are written last,
/// so an interrupted run leaves every family `Partial`. Each run stamps its
/// manifests with a fresh generation id, which invalidates earlier slices.
pub fn generate<S, M>(
    keys: &[S],
    model: &M,
    store: &ShardStore,
    options: &GenerateOptions,
) -> Result<GenerateSummary>
where
    S: AsRef<str>,
    M: ActivationModel + ?Sized,
{
    validate_keys(keys)?;
    let capacity = store.capacity();
    let key_map = KeyMap::from_keys(keys, capacity)?;
    let fingerprint = key_map.fingerprint();
    let variants = model.variants();
    if variants.is_empty() {
        return Err(SeekError::Model("model exposes no variants".into()));
    }

    let mut resume = options.resume;
    for variant in &variants {
        let family = Family::source(variant);
        if let Some(old) = store.read_manifest(&family)? {
            if resume && old.keys_fingerprint.as_deref() != Some(fingerprint.as_str()) {
                warn!("{} was generated from other keys, regenerating from scratch", family);
                resume = false;
            }
            if resume && old.element != store.config().element {
                warn!("{} was stored as {:?}, regenerating from scratch", family, old.element);
                resume = false;
            }
        }
        store.remove_manifest(&family)?;
    }
    remove_if_exists(&store.key_map_path())?;

    let chunks: Vec<Vec<&str>> = keys
        .chunks(capacity)
        .map(|c| c.iter().map(|k| k.as_ref()).collect())
        .collect();
    let mut item_shapes: BTreeMap<Variant, Vec<usize>> = BTreeMap::new();
    let mut skipped = 0;

    for (idx, batch) in chunks.iter().enumerate() {
        if resume && variants.iter().all(|v| shard_present(store, v, idx, batch.len())) {
            skipped += 1;
            continue;
        }

        let mut outputs = model.run(batch)?;
        for variant in &variants {
            let tensor = outputs
                .remove(variant)
                .ok_or_else(|| SeekError::Model(format!("model returned no {} for shard {}", variant, idx)))?;
            if tensor.rows() != batch.len() {
                return Err(SeekError::Model(format!(
                    "model returned {} rows of {} for a batch of {}",
                    tensor.rows(),
                    variant,
                    batch.len()
                )));
            }
            let item_shape = tensor.shape()[1..].to_vec();
            match item_shapes.get(variant) {
                Some(seen) if *seen != item_shape => {
                    return Err(SeekError::Model(format!(
                        "{} changed item shape from {:?} to {:?}",
                        variant, seen, item_shape
                    )));
                }
                Some(_) => {}
                None => {
                    item_shapes.insert(variant.clone(), item_shape);
                }
            }
            store.write_shard(variant, idx, &tensor)?;
        }
    }

    let shard_sizes: Vec<usize> = chunks.iter().map(|c| c.len()).collect();
    let generation_id = new_generation_id(&fingerprint);
    for variant in &variants {
        let family = Family::source(variant);
        store.remove_shards_from(&family, chunks.len())?;
        let item_shape = match item_shapes.remove(variant) {
            Some(shape) => shape,
            None => format::read_header(&store.shard_path(&family, 0))?.shape[1..].to_vec(),
        };
        store.write_manifest(
            &family,
            &Manifest {
                family: family.name(),
                n_items: keys.len(),
                capacity,
                shard_sizes: shard_sizes.clone(),
                item_shape,
                element: store.config().element,
                keys_fingerprint: Some(fingerprint.clone()),
                generation_id: Some(generation_id.clone()),
                sliced_from: None,
            },
        )?;
    }
    store.write_key_map(&key_map)?;

    info!(
        "Generated {} items x {} variants in {} shards ({} reused)",
        keys.len(),
        variants.len(),
        chunks.len(),
        skipped
    );
    Ok(GenerateSummary {
        n_items: keys.len(),
        n_shards: chunks.len(),
        shards_skipped: skipped,
        variants,
    })
}

/// Recomputes the fingerprint a complete generation run of `keys` would carry.
pub fn fingerprint_of<S: AsRef<str>>(keys: &[S]) -> String {
    keys_fingerprint(keys.iter().map(|k| k.as_ref()))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::store::{STAGE_BLOCK_OUTPUT, STAGE_EMBEDDINGS};
    use std::cell::Cell;

    /// Toy causal model: the row at position `t` depends only on the first
    /// `t + 1` characters of the key.
    pub(crate) struct CausalModel {
        dims: usize,
        blocks: u16,
        scale: f32,
        pub(crate) calls: Cell<usize>,
    }

    impl CausalModel {
        pub(crate) fn new(dims: usize, blocks: u16) -> Self {
            Self { dims, blocks, scale: 1.0, calls: Cell::new(0) }
        }

        /// Same keys, different weights.
        pub(crate) fn with_scale(mut self, scale: f32) -> Self {
            self.scale = scale;
            self
        }

        fn embed(&self, c: char, d: usize) -> f32 {
            (((c as u32 % 17) as f32 - 8.0) * 0.25 + d as f32 * 0.1) * self.scale
        }

        /// Row of the last block's output at position `t`.
        pub(crate) fn row(&self, key: &str, t: usize) -> Vec<f32> {
            self.block_row(key, t, self.blocks.saturating_sub(1))
        }

        fn block_row(&self, key: &str, t: usize, block: u16) -> Vec<f32> {
            (0..self.dims)
                .map(|d| {
                    key.chars()
                        .take(t + 1)
                        .enumerate()
                        .map(|(j, c)| self.embed(c, d) * (j + 1 + block as usize) as f32)
                        .sum()
                })
                .collect()
        }
    }

    impl ActivationModel for CausalModel {
        fn variants(&self) -> Vec<Variant> {
            let mut out = vec![Variant::embeddings()];
            for b in 0..self.blocks {
                out.push(Variant::for_block(STAGE_BLOCK_OUTPUT, b).unwrap());
            }
            out
        }

        fn run(&self, batch: &[&str]) -> Result<BTreeMap<Variant, Tensor>> {
            self.calls.set(self.calls.get() + 1);
            let len = batch[0].chars().count();
            let mut out = BTreeMap::new();

            let emb: Vec<f32> = batch
                .iter()
                .flat_map(|k| k.chars().flat_map(|c| (0..self.dims).map(move |d| (c, d))).collect::<Vec<_>>())
                .map(|(c, d)| self.embed(c, d))
                .collect();
            out.insert(
                Variant::new(STAGE_EMBEDDINGS)?,
                Tensor::new(vec![batch.len(), len, self.dims], emb)?,
            );

            for b in 0..self.blocks {
                let data: Vec<f32> = batch
                    .iter()
                    .flat_map(|k| (0..len).flat_map(|t| self.block_row(k, t, b)).collect::<Vec<_>>())
                    .collect();
                out.insert(
                    Variant::for_block(STAGE_BLOCK_OUTPUT, b)?,
                    Tensor::new(vec![batch.len(), len, self.dims], data)?,
                );
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::CausalModel;
    use super::*;
    use crate::config::StoreConfig;
    use crate::store::GenerationStatus;

    fn open(dir: &std::path::Path, capacity: usize) -> ShardStore {
        ShardStore::open(StoreConfig::new(dir).with_capacity(capacity)).unwrap()
    }

    #[test]
    fn writes_shards_manifests_and_key_map() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path(), 4);
        let keys: Vec<String> = (0..10).map(|i| format!("k{}", i)).collect();
        let model = CausalModel::new(2, 2);
        let summary = generate(&keys, &model, &store, &GenerateOptions::default()).unwrap();

        assert_eq!(summary.n_shards, 3);
        assert_eq!(summary.variants.len(), 3);
        for v in &summary.variants {
            assert_eq!(store.shard_count(v).unwrap(), 3);
            match store.status(&Family::source(v)).unwrap() {
                GenerationStatus::Complete(m) => {
                    assert_eq!(m.shard_sizes, vec![4, 4, 2]);
                    assert_eq!(m.item_shape, vec![2, 2]);
                    assert_eq!(m.keys_fingerprint, Some(fingerprint_of(&keys)));
                }
                other => panic!("unexpected status {:?}", other),
            }
        }
        let key_map = store.read_key_map().unwrap();
        assert_eq!(key_map.shard_of("k9"), Some(2));
    }

    #[test]
    fn rejects_duplicate_and_ragged_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path(), 4);
        let model = CausalModel::new(2, 1);
        let opts = GenerateOptions::default();
        assert!(generate(&["ab", "ab"], &model, &store, &opts).is_err());
        assert!(generate(&["ab", "abc"], &model, &store, &opts).is_err());
        assert!(generate::<&str, _>(&[], &model, &store, &opts).is_err());
    }

    #[test]
    fn resume_reuses_complete_shards() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path(), 2);
        let keys = ["aa", "ab", "ba", "bb", "ca"];
        generate(&keys, &CausalModel::new(2, 1), &store, &GenerateOptions::default()).unwrap();

        // lose a manifest and the last shard of one family
        let emb = Family::source(&Variant::embeddings());
        store.remove_manifest(&emb).unwrap();
        std::fs::remove_file(store.shard_path(&emb, 2)).unwrap();
        assert!(matches!(store.status(&emb).unwrap(), GenerationStatus::Partial { present: 2, expected: None }));

        let model = CausalModel::new(2, 1);
        let summary = generate(&keys, &model, &store, &GenerateOptions { resume: true }).unwrap();
        assert_eq!(summary.shards_skipped, 2);
        assert_eq!(model.calls.get(), 1);
        assert!(store.status(&emb).unwrap().is_complete());
    }

    #[test]
    fn every_run_gets_a_new_generation_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path(), 2);
        let keys = ["aa", "ab", "ba"];
        let emb = Family::source(&Variant::embeddings());
        generate(&keys, &CausalModel::new(2, 1), &store, &GenerateOptions::default()).unwrap();
        let first = store.read_manifest(&emb).unwrap().unwrap().generation_id;
        generate(&keys, &CausalModel::new(2, 1), &store, &GenerateOptions::default()).unwrap();
        let second = store.read_manifest(&emb).unwrap().unwrap().generation_id;
        assert!(first.is_some() && second.is_some());
        assert_ne!(first, second);
    }

    #[test]
    fn shrinking_run_removes_stale_shards() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path(), 2);
        let model = CausalModel::new(2, 1);
        generate(&["aa", "ab", "ba", "bb", "ca"], &model, &store, &GenerateOptions::default()).unwrap();
        generate(&["aa", "ab"], &model, &store, &GenerateOptions::default()).unwrap();
        let emb = Family::source(&Variant::embeddings());
        assert_eq!(store.list_shards(&emb).unwrap(), vec![0]);
        assert_eq!(store.read_key_map().unwrap().len(), 2);
    }

    struct ShortModel;

    impl ActivationModel for ShortModel {
        fn variants(&self) -> Vec<Variant> {
            vec![Variant::embeddings()]
        }

        fn run(&self, batch: &[&str]) -> Result<BTreeMap<Variant, Tensor>> {
            let rows = batch.len().saturating_sub(1).max(1);
            let mut out = BTreeMap::new();
            out.insert(Variant::embeddings(), Tensor::new(vec![rows, 1], vec![0.0; rows])?);
            Ok(out)
        }
    }

    #[test]
    fn model_row_mismatch_is_a_model_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path(), 4);
        let err = generate(&["a", "b", "c"], &ShortModel, &store, &GenerateOptions::default()).unwrap_err();
        assert!(matches!(err, SeekError::Model(_)));
    }
}
