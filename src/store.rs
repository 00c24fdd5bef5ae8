//! Sharded array store.
//!
//! A dataset is stored as one shard family per variant. Each family is a set
//! of shard files plus a JSON manifest that is written only after every shard
//! is in place, so an interrupted generation or re-slice never reads as done.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, create_dir_all};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::StoreConfig;
use crate::error::{Result, SeekError};
use crate::format::{self, ElemType, ShardData, Tensor};
use crate::io::{read_json, remove_if_exists, write_json_atomic};
use crate::layout::ShardLayout;

pub const SHARD_EXT: &str = "shd";
pub const KEY_MAP_FILE: &str = "key_map.json";

// Stages captured from each block of the probed model.
pub const STAGE_EMBEDDINGS: &str = "embeddings";
pub const STAGE_BLOCK_INPUT: &str = "block_input";
pub const STAGE_HEADS_OUTPUT: &str = "heads_output";
pub const STAGE_PROJ_OUTPUT: &str = "proj_output";
pub const STAGE_FFWD_OUTPUT: &str = "ffwd_output";
pub const STAGE_BLOCK_OUTPUT: &str = "block_output";

/// Which processing stage produced a shard's vectors, optionally per block.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Variant {
    stage: String,
    block: Option<u16>,
}

impl Variant {
    pub fn new(stage: &str) -> Result<Self> {
        validate_stage(stage)?;
        Ok(Self { stage: stage.to_owned(), block: None })
    }

    pub fn for_block(stage: &str, block: u16) -> Result<Self> {
        validate_stage(stage)?;
        Ok(Self { stage: stage.to_owned(), block: Some(block) })
    }

    pub fn embeddings() -> Self {
        Self { stage: STAGE_EMBEDDINGS.to_owned(), block: None }
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn block(&self) -> Option<u16> {
        self.block
    }
}

fn validate_stage(stage: &str) -> Result<()> {
    if stage.is_empty()
        || !stage
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
    {
        return Err(SeekError::InvalidArgument(format!(
            "stage name {:?} must be non-empty [a-z0-9_]",
            stage
        )));
    }
    Ok(())
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.block {
            Some(b) => write!(f, "{}.b{:02}", self.stage, b),
            None => f.write_str(&self.stage),
        }
    }
}

impl FromStr for Variant {
    type Err = SeekError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(".b") {
            Some((stage, block)) => {
                let block = block.parse::<u16>().map_err(|_| {
                    SeekError::InvalidArgument(format!("invalid block in variant {:?}", s))
                })?;
                Variant::for_block(stage, block)
            }
            None => Variant::new(s),
        }
    }
}

impl TryFrom<String> for Variant {
    type Error = SeekError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Variant> for String {
    fn from(v: Variant) -> String {
        v.to_string()
    }
}

/// A shard family: a variant's source shards, or its shards re-sliced at a
/// fixed sequence position.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Family {
    pub variant: Variant,
    pub position: Option<usize>,
}

impl Family {
    pub fn source(variant: &Variant) -> Self {
        Self { variant: variant.clone(), position: None }
    }

    pub fn sliced(variant: &Variant, t: usize) -> Self {
        Self { variant: variant.clone(), position: Some(t) }
    }

    pub fn name(&self) -> String {
        match self.position {
            Some(t) => format!("{}@t{:03}", self.variant, t),
            None => self.variant.to_string(),
        }
    }

    fn shard_file_name(&self, idx: usize) -> String {
        format!("{}-{:05}.{}", self.name(), idx, SHARD_EXT)
    }

    fn manifest_file_name(&self) -> String {
        format!("{}.manifest.json", self.name())
    }

    /// Inverse of `shard_file_name` for this family.
    fn parse_shard_index(&self, file_name: &str) -> Option<usize> {
        let stem = file_name.strip_suffix(&format!(".{}", SHARD_EXT))?;
        let (name, idx) = stem.rsplit_once('-')?;
        if name != self.name() || idx.is_empty() || !idx.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        idx.parse().ok()
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Provenance of a re-sliced family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceOrigin {
    pub source: Variant,
    pub position: usize,
    pub combine_factor: usize,
    pub source_capacity: usize,
    /// `generation_id` of the source manifest the slices were cut from.
    #[serde(default)]
    pub source_generation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub family: String,
    pub n_items: usize,
    pub capacity: usize,
    pub shard_sizes: Vec<usize>,
    /// Shape of a single item, e.g. `[T, D]` or `[D]`.
    pub item_shape: Vec<usize>,
    pub element: ElemType,
    pub keys_fingerprint: Option<String>,
    /// Changes on every generation run that rewrites the family's shards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sliced_from: Option<SliceOrigin>,
}

impl Manifest {
    pub fn layout(&self) -> ShardLayout {
        ShardLayout::from_sizes(&self.shard_sizes)
    }

    pub fn n_shards(&self) -> usize {
        self.shard_sizes.len()
    }

    /// Extent of the sequence-position axis, if items keep one.
    pub fn positions(&self) -> Option<usize> {
        (self.item_shape.len() == 2).then(|| self.item_shape[0])
    }

    /// Width of one row (one position of one item).
    pub fn row_dims(&self) -> usize {
        self.item_shape.last().copied().unwrap_or(1)
    }

    pub fn item_len(&self) -> usize {
        self.item_shape.iter().product()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationStatus {
    NotGenerated,
    /// Shards exist but the manifest is missing, or the manifest lists shards
    /// that are missing or do not match it.
    Partial { present: usize, expected: Option<usize> },
    Complete(Manifest),
}

impl GenerationStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, GenerationStatus::Complete(_))
    }
}

/// Ordered `(key, shard)` pairs for one generation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyMap {
    pub capacity: usize,
    entries: Vec<(String, usize)>,
    #[serde(skip)]
    lookup: HashMap<String, usize>,
}

impl KeyMap {
    pub fn from_keys<S: AsRef<str>>(keys: &[S], capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(SeekError::InvalidArgument("shard capacity must be > 0".into()));
        }
        let entries = keys
            .iter()
            .enumerate()
            .map(|(i, k)| (k.as_ref().to_owned(), i / capacity))
            .collect();
        let mut map = Self { capacity, entries, lookup: HashMap::new() };
        map.rebuild_lookup()?;
        Ok(map)
    }

    fn rebuild_lookup(&mut self) -> Result<()> {
        self.lookup = HashMap::with_capacity(self.entries.len());
        for (i, (key, _)) in self.entries.iter().enumerate() {
            if self.lookup.insert(key.clone(), i).is_some() {
                return Err(SeekError::InvalidArgument(format!("duplicate key {:?}", key)));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn key(&self, idx: usize) -> Option<&str> {
        self.entries.get(idx).map(|(k, _)| k.as_str())
    }

    pub fn keys(&self) -> Vec<&str> {
        self.entries.iter().map(|(k, _)| k.as_str()).collect()
    }

    pub fn index_of(&self, key: &str) -> Option<usize> {
        self.lookup.get(key).copied()
    }

    pub fn shard_of(&self, key: &str) -> Option<usize> {
        self.index_of(key).map(|i| self.entries[i].1)
    }

    pub fn fingerprint(&self) -> String {
        keys_fingerprint(self.entries.iter().map(|(k, _)| k.as_str()))
    }
}

/// SHA-256 over the length-prefixed keys, hex encoded.
pub fn keys_fingerprint<'a, I: IntoIterator<Item = &'a str>>(keys: I) -> String {
    let mut hasher = Sha256::new();
    for key in keys {
        hasher.update((key.len() as u64).to_le_bytes());
        hasher.update(key.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

static GENERATION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Fresh identifier for one generation run over `fingerprint`.
pub fn new_generation_id(fingerprint: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());
    let mut hasher = Sha256::new();
    hasher.update(fingerprint.as_bytes());
    hasher.update(nanos.to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(GENERATION_COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    format!("{:x}", hasher.finalize())
}

/// File-backed shard store rooted at an explicitly configured directory.
#[derive(Debug, Clone)]
pub struct ShardStore {
    config: StoreConfig,
}

impl ShardStore {
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        create_dir_all(&config.root).map_err(|e| SeekError::io(&config.root, e))?;
        debug!("Opened shard store at {:?}", config.root);
        Ok(Self { config })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn capacity(&self) -> usize {
        self.config.shard_capacity
    }

    // ========== SHARDS ==========

    pub fn shard_path(&self, family: &Family, idx: usize) -> PathBuf {
        self.config.root.join(family.shard_file_name(idx))
    }

    /// Persists one source shard, replacing any previous one at that address.
    pub fn write_shard(&self, variant: &Variant, shard_idx: usize, array: &Tensor) -> Result<()> {
        if array.rows() > self.config.shard_capacity {
            return Err(SeekError::InvalidArgument(format!(
                "shard {} of {} has {} rows, capacity is {}",
                shard_idx,
                variant,
                array.rows(),
                self.config.shard_capacity
            )));
        }
        self.write_family_shard(
            &Family::source(variant),
            shard_idx,
            array.shape(),
            array.data(),
            self.config.element,
        )
    }

    pub fn read_shard(&self, variant: &Variant, shard_idx: usize) -> Result<ShardData> {
        self.read_family_shard(&Family::source(variant), shard_idx)
    }

    pub fn write_family_shard(
        &self,
        family: &Family,
        idx: usize,
        shape: &[usize],
        data: &[f32],
        element: ElemType,
    ) -> Result<()> {
        let path = self.shard_path(family, idx);
        format::write_shard_file(&path, shape, data, element)?;
        debug!("Wrote shard {:?} shape={:?}", path, shape);
        Ok(())
    }

    pub fn read_family_shard(&self, family: &Family, idx: usize) -> Result<ShardData> {
        format::read_shard_file(&self.shard_path(family, idx))
    }

    /// `ceil(N / C)` for a generated variant.
    pub fn shard_count(&self, variant: &Variant) -> Result<usize> {
        let manifest = self.require_complete(&Family::source(variant))?;
        Ok(ShardLayout::fixed(manifest.n_items, manifest.capacity)?.n_shards())
    }

    /// Indices of the shard files present for `family`, ascending.
    pub fn list_shards(&self, family: &Family) -> Result<Vec<usize>> {
        let entries = match fs::read_dir(&self.config.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SeekError::io(&self.config.root, e)),
        };
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| SeekError::io(&self.config.root, e))?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(idx) = family.parse_shard_index(name) {
                    found.push(idx);
                }
            }
        }
        found.sort_unstable();
        Ok(found)
    }

    /// Deletes shard files of `family` with index >= `start`.
    pub fn remove_shards_from(&self, family: &Family, start: usize) -> Result<usize> {
        let mut removed = 0;
        for idx in self.list_shards(family)?.into_iter().filter(|&i| i >= start) {
            if remove_if_exists(&self.shard_path(family, idx))? {
                removed += 1;
            }
        }
        if removed > 0 {
            warn!("Removed {} stale shard files of {}", removed, family);
        }
        Ok(removed)
    }

    // ========== MANIFESTS ==========

    pub fn manifest_path(&self, family: &Family) -> PathBuf {
        self.config.root.join(family.manifest_file_name())
    }

    pub fn write_manifest(&self, family: &Family, manifest: &Manifest) -> Result<()> {
        if manifest.shard_sizes.iter().sum::<usize>() != manifest.n_items {
            return Err(SeekError::InvalidArgument(format!(
                "manifest for {} lists shard sizes that do not sum to {} items",
                family, manifest.n_items
            )));
        }
        write_json_atomic(&self.manifest_path(family), manifest)?;
        info!(
            "Manifest written for {}: {} items in {} shards",
            family,
            manifest.n_items,
            manifest.n_shards()
        );
        Ok(())
    }

    pub fn read_manifest(&self, family: &Family) -> Result<Option<Manifest>> {
        let path = self.manifest_path(family);
        if !path.is_file() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    /// Positions at which `variant` has a sliced manifest on disk, ascending.
    pub fn sliced_positions(&self, variant: &Variant) -> Result<Vec<usize>> {
        let entries = match fs::read_dir(&self.config.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SeekError::io(&self.config.root, e)),
        };
        let prefix = format!("{}@t", variant);
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| SeekError::io(&self.config.root, e))?;
            let name = entry.file_name();
            let t = name
                .to_str()
                .and_then(|n| n.strip_prefix(&prefix))
                .and_then(|n| n.strip_suffix(".manifest.json"))
                .filter(|d| !d.is_empty() && d.bytes().all(|b| b.is_ascii_digit()))
                .and_then(|d| d.parse().ok());
            if let Some(t) = t {
                found.push(t);
            }
        }
        found.sort_unstable();
        Ok(found)
    }

    pub fn remove_manifest(&self, family: &Family) -> Result<()> {
        remove_if_exists(&self.manifest_path(family)).map(|_| ())
    }

    /// Complete only if the manifest exists and every shard it lists is on
    /// disk with the expected shape.
    pub fn status(&self, family: &Family) -> Result<GenerationStatus> {
        let manifest = match self.read_manifest(family)? {
            Some(m) => m,
            None => {
                let present = self.list_shards(family)?.len();
                return Ok(if present == 0 {
                    GenerationStatus::NotGenerated
                } else {
                    GenerationStatus::Partial { present, expected: None }
                });
            }
        };

        let mut present = 0;
        for (idx, &rows) in manifest.shard_sizes.iter().enumerate() {
            let path = self.shard_path(family, idx);
            if !path.is_file() {
                continue;
            }
            match format::read_header(&path) {
                Ok(h) if h.rows() == rows && h.shape[1..] == manifest.item_shape[..] => present += 1,
                Ok(h) => warn!("Shard {:?} has shape {:?}, manifest expects {} rows", path, h.shape, rows),
                Err(e) => warn!("Shard {:?} unreadable: {}", path, e),
            }
        }

        if present == manifest.n_shards() {
            Ok(GenerationStatus::Complete(manifest))
        } else {
            Ok(GenerationStatus::Partial { present, expected: Some(manifest.n_shards()) })
        }
    }

    /// The family's manifest, or a `NotGenerated` / `PartiallyGenerated` error.
    pub fn require_complete(&self, family: &Family) -> Result<Manifest> {
        match self.status(family)? {
            GenerationStatus::Complete(m) => Ok(m),
            GenerationStatus::NotGenerated => Err(SeekError::NotGenerated(family.name())),
            GenerationStatus::Partial { present, expected } => Err(SeekError::PartiallyGenerated {
                what: family.name(),
                present,
                expected,
            }),
        }
    }

    // ========== KEY MAP ==========

    pub fn key_map_path(&self) -> PathBuf {
        self.config.root.join(KEY_MAP_FILE)
    }

    pub fn write_key_map(&self, map: &KeyMap) -> Result<()> {
        write_json_atomic(&self.key_map_path(), map)?;
        info!("Key map written: {} keys, capacity {}", map.len(), map.capacity);
        Ok(())
    }

    pub fn read_key_map(&self) -> Result<KeyMap> {
        let path = self.key_map_path();
        if !path.is_file() {
            return Err(SeekError::NotGenerated("key map".into()));
        }
        let mut map: KeyMap = read_json(&path)?;
        map.rebuild_lookup()?;
        Ok(map)
    }
}
