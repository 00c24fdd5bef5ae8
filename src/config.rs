use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SeekError};
use crate::format::ElemType;

// ========== LIMITES ==========
pub const MAX_TOP_K: usize = 100_000;
pub const DEFAULT_SHARD_CAPACITY: usize = 10_000;
pub const DEFAULT_COMBINE_FACTOR: usize = 10;

/// Where and how shards are stored. Always passed in explicitly; nothing in the
/// crate guesses a storage root at call time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub root: PathBuf,
    #[serde(default = "default_capacity")]
    pub shard_capacity: usize,
    #[serde(default)]
    pub element: ElemType,
    #[serde(default = "default_combine_factor")]
    pub combine_factor: usize,
    /// Check each shard's header against its manifest entry when reading.
    #[serde(default = "default_true")]
    pub verify_on_read: bool,
}

fn default_capacity() -> usize {
    DEFAULT_SHARD_CAPACITY
}

fn default_combine_factor() -> usize {
    DEFAULT_COMBINE_FACTOR
}

fn default_true() -> bool {
    true
}

impl StoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            shard_capacity: DEFAULT_SHARD_CAPACITY,
            element: ElemType::F32,
            combine_factor: DEFAULT_COMBINE_FACTOR,
            verify_on_read: true,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.shard_capacity = capacity;
        self
    }

    pub fn with_element(mut self, element: ElemType) -> Self {
        self.element = element;
        self
    }

    pub fn with_combine_factor(mut self, combine_factor: usize) -> Self {
        self.combine_factor = combine_factor;
        self
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| SeekError::io(path, e))?;
        let config: StoreConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// `<platform data dir>/shardseek`, falling back to `~/.shardseek`.
    /// Only used when a caller asks for it.
    pub fn default_root() -> Result<PathBuf> {
        if let Some(data) = dirs::data_dir() {
            return Ok(data.join("shardseek"));
        }
        dirs::home_dir()
            .map(|home| home.join(".shardseek"))
            .ok_or_else(|| SeekError::InvalidArgument("no data or home directory available".into()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.root.as_os_str().is_empty() {
            return Err(SeekError::InvalidArgument("store root cannot be empty".into()));
        }
        if self.shard_capacity == 0 {
            return Err(SeekError::InvalidArgument("shard capacity must be > 0".into()));
        }
        if self.combine_factor == 0 {
            return Err(SeekError::InvalidArgument("combine factor must be > 0".into()));
        }
        Ok(())
    }
}

/// Knobs for a single shard scan.
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Score shards on the rayon pool; the merge stays deterministic.
    pub parallel: bool,
    /// Checked between shards. Setting it aborts the scan with `Cancelled`.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl ScanOptions {
    pub fn parallel() -> Self {
        Self { parallel: true, cancel: None }
    }

    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map_or(false, |c| c.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_config_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, r#"{"root": "/tmp/shards", "shard_capacity": 4}"#).unwrap();

        let config = StoreConfig::from_json_file(&path).unwrap();
        assert_eq!(config.root, PathBuf::from("/tmp/shards"));
        assert_eq!(config.shard_capacity, 4);
        assert_eq!(config.combine_factor, DEFAULT_COMBINE_FACTOR);
        assert_eq!(config.element, ElemType::F32);
        assert!(config.verify_on_read);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let config = StoreConfig::new("/tmp/x").with_capacity(0);
        assert!(matches!(config.validate(), Err(SeekError::InvalidArgument(_))));
    }

    #[test]
    fn cancel_flag_is_observed() {
        let flag = Arc::new(AtomicBool::new(false));
        let opts = ScanOptions::default().with_cancel(flag.clone());
        assert!(!opts.is_cancelled());
        flag.store(true, Ordering::Relaxed);
        assert!(opts.is_cancelled());
    }
}
