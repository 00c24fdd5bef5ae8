//! Exact top-k nearest-neighbour search over sharded, memory-mapped vector
//! stores that do not fit in memory.

pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod format;
pub mod generate;
pub mod io;
pub mod layout;
pub mod prefix;
pub mod query;
pub mod report;
pub mod reslice;
pub mod store;
pub mod utils;

#[cfg(feature = "python")]
mod python;

pub use config::{ScanOptions, StoreConfig, MAX_TOP_K};
pub use dedup::{first_occurrence_map, unique_keys, unique_substrings, DedupMap};
pub use engine::{Neighbor, Order, Scores, ShardSource, TopKEngine, TopKResult};
pub use error::{Result, SeekError};
pub use format::{ElemType, ShardData, Tensor};
pub use generate::{generate, ActivationModel, GenerateOptions, GenerateSummary};
pub use layout::ShardLayout;
pub use prefix::{PositionMatch, PositionResult};
pub use query::{Direction, QueryBatch, Searcher};
pub use report::SimilarKeysReport;
pub use reslice::{create_slices, ensure_slices};
pub use store::{Family, GenerationStatus, KeyMap, Manifest, ShardStore, Variant};
pub use utils::vector::Metric;
