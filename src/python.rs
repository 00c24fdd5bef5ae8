use std::path::PathBuf;

use log::{error, info};
use numpy::{PyReadonlyArrayDyn, PyUntypedArrayMethods};
use pyo3::exceptions::{PyFileNotFoundError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::wrap_pyfunction;

use crate::config::{StoreConfig, MAX_TOP_K};
use crate::dedup;
use crate::engine::TopKResult;
use crate::error::SeekError;
use crate::format::{ElemType, Tensor};
use crate::query::{Direction, QueryBatch, Searcher};
use crate::reslice;
use crate::store::{self, Family, GenerationStatus, Variant};
use crate::utils::logger::init_logging;
use crate::utils::vector::Metric;

fn to_py_err(e: SeekError) -> PyErr {
    error!("{}", e);
    match e {
        SeekError::NotGenerated(_) | SeekError::PartiallyGenerated { .. } => {
            PyFileNotFoundError::new_err(e.to_string())
        }
        SeekError::Io { .. }
        | SeekError::Format { .. }
        | SeekError::Json(_)
        | SeekError::Cancelled { .. }
        | SeekError::UnknownCandidate { .. } => PyRuntimeError::new_err(e.to_string()),
        _ => PyValueError::new_err(e.to_string()),
    }
}

fn parse_variant(variant: &str) -> PyResult<Variant> {
    variant.parse().map_err(to_py_err)
}

fn parse_metric(metric: &str) -> PyResult<Metric> {
    metric.parse().map_err(PyValueError::new_err)
}

fn to_vec(array: &PyReadonlyArrayDyn<'_, f32>) -> Vec<f32> {
    match array.as_slice() {
        Ok(s) => s.to_vec(),
        Err(_) => array.as_array().iter().copied().collect(),
    }
}

fn to_batch(queries: &PyReadonlyArrayDyn<'_, f32>) -> PyResult<QueryBatch> {
    QueryBatch::from_shape(queries.shape(), to_vec(queries)).map_err(to_py_err)
}

fn to_pairs(result: TopKResult) -> Vec<Vec<(usize, f32)>> {
    result
        .per_query
        .into_iter()
        .map(|row| row.into_iter().map(|n| (n.index, n.distance)).collect())
        .collect()
}

/// Python handle on a shard store directory.
#[pyclass(name = "ShardStore")]
struct PyShardStore {
    store: store::ShardStore,
}

impl PyShardStore {
    fn searcher(&self, metric: &str, farthest: bool) -> PyResult<Searcher> {
        let direction = if farthest { Direction::Farthest } else { Direction::Closest };
        Ok(Searcher::new(self.store.clone())
            .with_metric(parse_metric(metric)?)
            .with_direction(direction))
    }
}

#[pymethods]
impl PyShardStore {
    #[new]
    #[pyo3(signature = (root, shard_capacity=None, combine_factor=None, element=None))]
    fn new(
        root: PathBuf,
        shard_capacity: Option<usize>,
        combine_factor: Option<usize>,
        element: Option<&str>,
    ) -> PyResult<Self> {
        let mut config = StoreConfig::new(root);
        if let Some(c) = shard_capacity {
            config = config.with_capacity(c);
        }
        if let Some(f) = combine_factor {
            config = config.with_combine_factor(f);
        }
        match element {
            None | Some("f32") => {}
            Some("f16") => config = config.with_element(ElemType::F16),
            Some(other) => {
                return Err(PyValueError::new_err(format!(
                    "Invalid element type '{}'. Use 'f32' or 'f16'.",
                    other
                )))
            }
        }
        let store = store::ShardStore::open(config).map_err(to_py_err)?;
        info!("ShardStore opened at {:?}", store.root());
        Ok(Self { store })
    }

    #[staticmethod]
    fn from_config(path: PathBuf) -> PyResult<Self> {
        let config = StoreConfig::from_json_file(&path).map_err(to_py_err)?;
        let store = store::ShardStore::open(config).map_err(to_py_err)?;
        Ok(Self { store })
    }

    fn root(&self) -> String {
        self.store.root().to_string_lossy().to_string()
    }

    fn capacity(&self) -> usize {
        self.store.capacity()
    }

    fn write_shard(&self, variant: &str, shard_idx: usize, array: PyReadonlyArrayDyn<'_, f32>) -> PyResult<()> {
        let tensor = Tensor::new(array.shape().to_vec(), to_vec(&array)).map_err(to_py_err)?;
        self.store
            .write_shard(&parse_variant(variant)?, shard_idx, &tensor)
            .map_err(to_py_err)
    }

    fn shard_count(&self, variant: &str) -> PyResult<usize> {
        self.store.shard_count(&parse_variant(variant)?).map_err(to_py_err)
    }

    /// `"not_generated"`, `"partial"` or `"complete"`.
    #[pyo3(signature = (variant, position=None))]
    fn status(&self, variant: &str, position: Option<usize>) -> PyResult<&'static str> {
        let variant = parse_variant(variant)?;
        let family = match position {
            Some(t) => Family::sliced(&variant, t),
            None => Family::source(&variant),
        };
        Ok(match self.store.status(&family).map_err(to_py_err)? {
            GenerationStatus::NotGenerated => "not_generated",
            GenerationStatus::Partial { .. } => "partial",
            GenerationStatus::Complete(_) => "complete",
        })
    }

    #[pyo3(signature = (variant, queries, k, metric="euclidean", farthest=false))]
    fn topk_closest(
        &self,
        variant: &str,
        queries: PyReadonlyArrayDyn<'_, f32>,
        k: usize,
        metric: &str,
        farthest: bool,
    ) -> PyResult<Vec<Vec<(usize, f32)>>> {
        let batch = to_batch(&queries)?;
        let result = self
            .searcher(metric, farthest)?
            .topk_closest(&parse_variant(variant)?, &batch, k)
            .map_err(to_py_err)?;
        Ok(to_pairs(result))
    }

    /// Deduplicated query at one position; rows are `(index, key, prefix, distance)`.
    #[pyo3(signature = (variant, position, queries, k, metric="euclidean", farthest=false))]
    fn topk_closest_at_position(
        &self,
        variant: &str,
        position: isize,
        queries: PyReadonlyArrayDyn<'_, f32>,
        k: usize,
        metric: &str,
        farthest: bool,
    ) -> PyResult<Vec<Vec<(usize, String, String, f32)>>> {
        let batch = to_batch(&queries)?;
        let result = self
            .searcher(metric, farthest)?
            .topk_closest_at_position(&parse_variant(variant)?, position, &batch, k)
            .map_err(to_py_err)?;
        Ok(result
            .per_query
            .into_iter()
            .map(|row| row.into_iter().map(|m| (m.index, m.key, m.prefix, m.distance)).collect())
            .collect())
    }

    #[pyo3(signature = (variant, position, queries, k, metric="euclidean", farthest=false))]
    fn topk_closest_sliced(
        &self,
        variant: &str,
        position: isize,
        queries: PyReadonlyArrayDyn<'_, f32>,
        k: usize,
        metric: &str,
        farthest: bool,
    ) -> PyResult<Vec<Vec<(usize, f32)>>> {
        let batch = to_batch(&queries)?;
        let result = self
            .searcher(metric, farthest)?
            .topk_closest_sliced(&parse_variant(variant)?, position, &batch, k)
            .map_err(to_py_err)?;
        Ok(to_pairs(result))
    }

    /// Re-slices `variant` at `position`; returns the number of group shards.
    #[pyo3(signature = (variant, position, combine_factor=None, dest=None))]
    fn reslice(
        &self,
        variant: &str,
        position: usize,
        combine_factor: Option<usize>,
        dest: Option<&str>,
    ) -> PyResult<usize> {
        let source = parse_variant(variant)?;
        let dest = dest.map(parse_variant).transpose()?.unwrap_or_else(|| source.clone());
        let factor = combine_factor.unwrap_or(self.store.config().combine_factor);
        let manifest =
            reslice::create_slices(&self.store, &source, &dest, position, factor).map_err(to_py_err)?;
        Ok(manifest.n_shards())
    }

    #[pyo3(signature = (variant, position, dest=None))]
    fn ensure_slices(&self, variant: &str, position: usize, dest: Option<&str>) -> PyResult<usize> {
        let source = parse_variant(variant)?;
        let dest = dest.map(parse_variant).transpose()?.unwrap_or_else(|| source.clone());
        let manifest = reslice::ensure_slices(&self.store, &source, &dest, position).map_err(to_py_err)?;
        Ok(manifest.n_shards())
    }

    /// Source variants with a manifest on disk.
    fn variants(&self) -> PyResult<Vec<String>> {
        let mut names = Vec::new();
        let entries = std::fs::read_dir(self.store.root())
            .map_err(|e| to_py_err(SeekError::io(self.store.root(), e)))?;
        for entry in entries.flatten() {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(family) = name.strip_suffix(".manifest.json") {
                    if !family.contains('@') {
                        names.push(family.to_string());
                    }
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

#[pyfunction]
#[pyo3(name = "unique_keys")]
fn py_unique_keys(keys: Vec<String>) -> Vec<String> {
    dedup::unique_keys(keys)
}

#[pyfunction]
#[pyo3(name = "unique_substrings")]
fn py_unique_substrings(text: &str, length: usize) -> PyResult<Vec<String>> {
    dedup::unique_substrings(text, length).map_err(to_py_err)
}

#[pymodule]
fn shardseek(m: &Bound<'_, PyModule>) -> PyResult<()> {
    init_logging();
    info!("shardseek module initialized");

    m.add_class::<PyShardStore>()?;
    m.add_function(wrap_pyfunction!(py_unique_keys, m)?)?;
    m.add_function(wrap_pyfunction!(py_unique_substrings, m)?)?;

    m.add("MAX_TOP_K", MAX_TOP_K)?;
    m.add("__version__", env!("CARGO_PKG_VERSION"))?;
    Ok(())
}
