use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the shard store, the top-k engine and the layers on top.
#[derive(Debug, Error)]
pub enum SeekError {
    // ========== CONFIGURATION ==========
    #[error("k = {k} exceeds the {items} items of shard {shard}")]
    KExceedsShard { k: usize, shard: usize, items: usize },

    #[error("scoring function returned {got} scores for shard {shard}, expected {expected}")]
    ScoreCountMismatch { shard: usize, expected: usize, got: usize },

    #[error("prefix length {prefix_len} exceeds length {key_len} of key {key:?}")]
    PrefixTooLong { key: String, key_len: usize, prefix_len: usize },

    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("position {position} out of range for sample length {len}")]
    PositionOutOfRange { position: isize, len: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // ========== MISSING / PARTIAL DATA ==========
    #[error("{0} has not been generated")]
    NotGenerated(String),

    #[error("{what} is only partially generated: {present} shards present{}", expected_suffix(.expected))]
    PartiallyGenerated { what: String, present: usize, expected: Option<usize> },

    // ========== STORAGE ==========
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid shard file {path}: {reason}")]
    Format { path: PathBuf, reason: String },

    #[error("shard {shard} holds {got} items, layout expects {expected}")]
    ShardSizeMismatch { shard: usize, expected: usize, got: usize },

    #[error("result index {index} has no key among {len} candidates")]
    UnknownCandidate { index: usize, len: usize },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    // ========== RUNTIME ==========
    #[error("scan cancelled after {shards_done} shards")]
    Cancelled { shards_done: usize },

    #[error("model failed: {0}")]
    Model(String),
}

pub type Result<T> = std::result::Result<T, SeekError>;

fn expected_suffix(expected: &Option<usize>) -> String {
    match expected {
        Some(n) => format!(" of {} expected", n),
        None => ", manifest missing".to_string(),
    }
}

impl SeekError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SeekError::Io { path: path.into(), source }
    }

    pub(crate) fn format(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        SeekError::Format { path: path.into(), reason: reason.into() }
    }

    /// True for the "nothing there yet" and "interrupted run" cases, which callers
    /// usually answer by (re)running generation.
    pub fn is_missing_data(&self) -> bool {
        matches!(self, SeekError::NotGenerated(_) | SeekError::PartiallyGenerated { .. })
    }
}
