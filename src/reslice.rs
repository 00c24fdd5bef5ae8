//! Re-slicing: project a family onto one sequence position and repack it into
//! larger shards for repeated queries at that position.

use log::{info, warn};

use crate::engine::ShardItems;
use crate::error::{Result, SeekError};
use crate::store::{Family, GenerationStatus, Manifest, ShardStore, SliceOrigin, Variant};

/// Extracts the row at position `t` of every item of `source` and writes
/// groups of `combine_factor` consecutive source shards as one shard of the
/// `dest` family at `t`. A short final group is kept. Slices keep the source
/// element type whatever the store is configured to write.
///
/// The previous manifest is removed before anything is written and the new
/// one only after every group is on disk.
pub fn create_slices(
    store: &ShardStore,
    source: &Variant,
    dest: &Variant,
    t: usize,
    combine_factor: usize,
) -> Result<Manifest> {
    if combine_factor == 0 {
        return Err(SeekError::InvalidArgument("combine factor must be > 0".into()));
    }
    let src_family = Family::source(source);
    let src = store.require_complete(&src_family)?;
    let positions = src.positions().ok_or_else(|| {
        SeekError::InvalidArgument(format!("{} has no sequence-position axis", source))
    })?;
    if t >= positions {
        return Err(SeekError::PositionOutOfRange { position: t as isize, len: positions });
    }

    let dest_family = Family::sliced(dest, t);
    store.remove_manifest(&dest_family)?;

    let dims = src.row_dims();
    let shard_ids: Vec<usize> = (0..src.n_shards()).collect();
    let mut group_sizes = Vec::with_capacity(shard_ids.len().div_ceil(combine_factor));

    for (group, members) in shard_ids.chunks(combine_factor).enumerate() {
        let rows: usize = members.iter().map(|&s| src.shard_sizes[s]).sum();
        let mut data = Vec::with_capacity(rows * dims);
        for &s in members {
            let shard = store.read_family_shard(&src_family, s)?;
            if shard.item_count() != src.shard_sizes[s] {
                return Err(SeekError::ShardSizeMismatch {
                    shard: s,
                    expected: src.shard_sizes[s],
                    got: shard.item_count(),
                });
            }
            for i in 0..shard.rows() {
                data.extend_from_slice(shard.item_at(i, t));
            }
        }
        store.write_family_shard(&dest_family, group, &[rows, dims], &data, src.element)?;
        group_sizes.push(rows);
    }
    store.remove_shards_from(&dest_family, group_sizes.len())?;

    let manifest = Manifest {
        family: dest_family.name(),
        n_items: src.n_items,
        capacity: combine_factor * src.capacity,
        shard_sizes: group_sizes,
        item_shape: vec![dims],
        element: src.element,
        keys_fingerprint: src.keys_fingerprint.clone(),
        generation_id: None,
        sliced_from: Some(SliceOrigin {
            source: source.clone(),
            position: t,
            combine_factor,
            source_capacity: src.capacity,
            source_generation: src.generation_id.clone(),
        }),
    };
    store.write_manifest(&dest_family, &manifest)?;
    info!(
        "Re-sliced {} at t={} into {}: {} groups of up to {} shards",
        source,
        t,
        dest_family,
        manifest.n_shards(),
        combine_factor
    );
    Ok(manifest)
}

/// True if `slices` were cut at `t` from the current generation of `src`.
/// Sources without a generation id never match.
fn slices_match(slices: &Manifest, source: &Variant, src: &Manifest, t: usize) -> bool {
    let origin_ok = slices.sliced_from.as_ref().map_or(false, |o| {
        o.source == *source
            && o.position == t
            && o.source_capacity == src.capacity
            && o.source_generation.is_some()
            && o.source_generation == src.generation_id
    });
    origin_ok
        && slices.n_items == src.n_items
        && slices.keys_fingerprint == src.keys_fingerprint
        && slices.element == src.element
        && slices.item_shape == [src.row_dims()]
}

/// Re-slices `source` at `t` unless a complete, matching set of slices is
/// already in place. Existing slices are accepted whatever their combine
/// factor; new ones use the store's configured factor.
pub fn ensure_slices(store: &ShardStore, source: &Variant, dest: &Variant, t: usize) -> Result<Manifest> {
    let src = store.require_complete(&Family::source(source))?;
    let dest_family = Family::sliced(dest, t);
    match store.status(&dest_family)? {
        GenerationStatus::Complete(existing) if slices_match(&existing, source, &src, t) => {
            info!("Slices {} are complete, skipping", dest_family);
            return Ok(existing);
        }
        GenerationStatus::Complete(_) => {
            warn!("Slices {} were built from other data, rebuilding", dest_family);
        }
        GenerationStatus::Partial { present, expected } => {
            warn!(
                "Slices {} are incomplete ({} present, expected {:?}), rebuilding",
                dest_family, present, expected
            );
        }
        GenerationStatus::NotGenerated => {}
    }
    create_slices(store, source, dest, t, store.config().combine_factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::format::{self, ElemType};
    use crate::generate::testing::CausalModel;
    use crate::generate::{generate, GenerateOptions};
    use crate::query::{QueryBatch, Searcher};
    use crate::store::STAGE_BLOCK_OUTPUT;

    fn keys(n: usize) -> Vec<String> {
        let alphabet = ['a', 'b', 'c', 'd', 'e'];
        (0..n)
            .map(|i| [alphabet[i % 5], alphabet[(i / 5) % 5], alphabet[(i / 25) % 5]].iter().collect())
            .collect()
    }

    fn setup(dir: &std::path::Path, n: usize, capacity: usize, combine: usize) -> (ShardStore, Variant) {
        let config = StoreConfig::new(dir)
            .with_capacity(capacity)
            .with_combine_factor(combine);
        let store = ShardStore::open(config).unwrap();
        generate(&keys(n), &CausalModel::new(4, 1), &store, &GenerateOptions::default()).unwrap();
        (store, Variant::for_block(STAGE_BLOCK_OUTPUT, 0).unwrap())
    }

    #[test]
    fn uneven_groups_keep_the_short_tail() {
        let dir = tempfile::tempdir().unwrap();
        // 23 items at capacity 4: shards [4,4,4,4,4,3], groups of 4 shards
        let (store, variant) = setup(dir.path(), 23, 4, 4);
        let manifest = create_slices(&store, &variant, &variant, 1, 4).unwrap();
        assert_eq!(manifest.shard_sizes, vec![16, 7]);
        assert_eq!(manifest.capacity, 16);
        assert_eq!(manifest.item_shape, vec![4]);

        let group = store.read_family_shard(&Family::sliced(&variant, 1), 1).unwrap();
        let src = store.read_shard(&variant, 4).unwrap();
        assert_eq!(group.item(0), src.item_at(0, 1));
    }

    #[test]
    fn sliced_query_matches_direct_scan() {
        let dir = tempfile::tempdir().unwrap();
        for (n, cap, combine) in [(23, 4, 4), (20, 5, 2), (17, 3, 10)] {
            let (store, variant) = setup(dir.path(), n, cap, combine);
            let t = 2;
            ensure_slices(&store, &variant, &variant, t).unwrap();
            let searcher = Searcher::new(store);
            let queries = QueryBatch::from_rows(&[vec![0.5, 0.0, -1.0, 2.0], vec![-3.0, 1.0, 1.0, 0.0]]).unwrap();
            let k = 2;
            let direct = searcher.topk_at_position(&variant, t as isize, &queries, k).unwrap();
            let sliced = searcher.topk_closest_sliced(&variant, t as isize, &queries, k).unwrap();
            assert_eq!(direct, sliced);
        }
    }

    #[test]
    fn interrupted_reslice_is_detected_and_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let (store, variant) = setup(dir.path(), 23, 4, 2);
        let family = Family::sliced(&variant, 0);
        ensure_slices(&store, &variant, &variant, 0).unwrap();
        assert_eq!(store.list_shards(&family).unwrap(), vec![0, 1, 2]);

        // a run that died after the first group and before the manifest
        store.remove_manifest(&family).unwrap();
        std::fs::remove_file(store.shard_path(&family, 2)).unwrap();
        assert!(matches!(
            store.status(&family).unwrap(),
            GenerationStatus::Partial { present: 2, expected: None }
        ));
        let err = Searcher::new(store.clone())
            .topk_closest_sliced(&variant, 0, &QueryBatch::single(&[0.0; 4]).unwrap(), 1)
            .unwrap_err();
        assert!(err.is_missing_data());

        let manifest = ensure_slices(&store, &variant, &variant, 0).unwrap();
        assert_eq!(manifest.shard_sizes, vec![8, 8, 7]);
        assert!(store.status(&family).unwrap().is_complete());
    }

    #[test]
    fn complete_slices_are_reused() {
        let dir = tempfile::tempdir().unwrap();
        let (store, variant) = setup(dir.path(), 10, 4, 2);
        let first = create_slices(&store, &variant, &variant, 0, 3).unwrap();
        let again = ensure_slices(&store, &variant, &variant, 0).unwrap();
        // kept with its own combine factor, not the configured one
        assert_eq!(again, first);
        assert_eq!(again.sliced_from.unwrap().combine_factor, 3);
    }

    #[test]
    fn regenerated_source_invalidates_slices() {
        let dir = tempfile::tempdir().unwrap();
        let (store, variant) = setup(dir.path(), 10, 4, 2);
        ensure_slices(&store, &variant, &variant, 0).unwrap();
        generate(&keys(12), &CausalModel::new(4, 1), &store, &GenerateOptions::default()).unwrap();
        let manifest = ensure_slices(&store, &variant, &variant, 0).unwrap();
        assert_eq!(manifest.n_items, 12);
    }

    #[test]
    fn regenerating_with_the_same_keys_invalidates_slices() {
        let dir = tempfile::tempdir().unwrap();
        let (store, variant) = setup(dir.path(), 12, 4, 2);
        ensure_slices(&store, &variant, &variant, 1).unwrap();

        generate(&keys(12), &CausalModel::new(4, 1).with_scale(-3.0), &store, &GenerateOptions::default())
            .unwrap();
        let manifest = ensure_slices(&store, &variant, &variant, 1).unwrap();
        let src = store.read_manifest(&Family::source(&variant)).unwrap().unwrap();
        assert_eq!(manifest.sliced_from.unwrap().source_generation, src.generation_id);

        let searcher = Searcher::new(store);
        let queries = QueryBatch::from_rows(&[vec![1.0, 0.5, 0.0, -1.0], vec![-6.0, 2.0, 2.0, 4.0]]).unwrap();
        let direct = searcher.topk_at_position(&variant, 1, &queries, 2).unwrap();
        let sliced = searcher.topk_closest_sliced(&variant, 1, &queries, 2).unwrap();
        assert_eq!(direct, sliced);
    }

    #[test]
    fn slices_keep_the_source_precision() {
        let dir = tempfile::tempdir().unwrap();
        let (store, variant) = setup(dir.path(), 12, 4, 2);
        let half = ShardStore::open(store.config().clone().with_element(ElemType::F16)).unwrap();
        let manifest = ensure_slices(&half, &variant, &variant, 1).unwrap();
        assert_eq!(manifest.element, ElemType::F32);
        let header = format::read_header(&half.shard_path(&Family::sliced(&variant, 1), 0)).unwrap();
        assert_eq!(header.elem, ElemType::F32);

        let searcher = Searcher::new(half);
        let queries = QueryBatch::from_rows(&[vec![0.3, -0.7, 1.1, 0.05]]).unwrap();
        let direct = searcher.topk_at_position(&variant, 1, &queries, 3).unwrap();
        let sliced = searcher.topk_closest_sliced(&variant, 1, &queries, 3).unwrap();
        assert_eq!(direct, sliced);
    }

    #[test]
    fn renamed_slices_resolve_negative_positions() {
        let dir = tempfile::tempdir().unwrap();
        let (store, variant) = setup(dir.path(), 12, 4, 2);
        let dest = Variant::new("last_slice").unwrap();
        create_slices(&store, &variant, &dest, 2, 2).unwrap();

        let searcher = Searcher::new(store);
        let queries = QueryBatch::single(&[0.5, 0.5, -0.5, 0.0]).unwrap();
        let direct = searcher.topk_at_position(&variant, 2, &queries, 2).unwrap();
        let sliced = searcher.topk_closest_sliced(&dest, -1, &queries, 2).unwrap();
        assert_eq!(direct, sliced);

        let missing = Variant::new("never_sliced").unwrap();
        assert!(matches!(
            searcher.topk_closest_sliced(&missing, -1, &queries, 2),
            Err(SeekError::NotGenerated(_))
        ));
    }

    #[test]
    fn position_past_the_end_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (store, variant) = setup(dir.path(), 10, 4, 2);
        assert!(matches!(
            create_slices(&store, &variant, &variant, 3, 2),
            Err(SeekError::PositionOutOfRange { position: 3, len: 3 })
        ));
    }
}
