use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::engine::TopKResult;
use crate::error::{Result, SeekError};
use crate::io::{read_json, write_json_atomic};
use crate::prefix::PositionResult;
use crate::store::{KeyMap, Variant};
use crate::utils::vector::Metric;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarKey {
    pub key: String,
    pub index: usize,
    pub distance: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryReport {
    pub query: String,
    pub neighbors: Vec<SimilarKey>,
}

/// Neighbour keys per query key for one variant, as saved next to a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarKeysReport {
    pub variant: Variant,
    pub position: Option<usize>,
    pub metric: String,
    pub k: usize,
    pub queries: Vec<QueryReport>,
    #[serde(skip)]
    lookup: HashMap<String, usize>,
}

impl SimilarKeysReport {
    fn new(
        variant: &Variant,
        position: Option<usize>,
        metric: Metric,
        k: usize,
        queries: Vec<QueryReport>,
    ) -> Self {
        let mut report = Self {
            variant: variant.clone(),
            position,
            metric: metric.name().to_string(),
            k,
            queries,
            lookup: HashMap::new(),
        };
        report.reindex();
        report
    }

    fn reindex(&mut self) {
        self.lookup = self
            .queries
            .iter()
            .enumerate()
            .map(|(i, q)| (q.query.clone(), i))
            .collect();
    }

    fn check_queries<S>(query_keys: &[S], n_queries: usize) -> Result<()> {
        if query_keys.len() != n_queries {
            return Err(SeekError::InvalidArgument(format!(
                "{} query keys for {} result rows",
                query_keys.len(),
                n_queries
            )));
        }
        Ok(())
    }

    /// Labels a whole-item or sliced result with dataset keys.
    pub fn from_topk<S: AsRef<str>>(
        variant: &Variant,
        position: Option<usize>,
        metric: Metric,
        result: &TopKResult,
        key_map: &KeyMap,
        query_keys: &[S],
    ) -> Result<Self> {
        Self::check_queries(query_keys, result.n_queries())?;
        let mut queries = Vec::with_capacity(query_keys.len());
        for (q, query) in query_keys.iter().enumerate() {
            let neighbors = result
                .query(q)
                .iter()
                .map(|n| {
                    let key = key_map.key(n.index).ok_or_else(|| {
                        SeekError::InvalidArgument(format!("index {} is not in the key map", n.index))
                    })?;
                    Ok(SimilarKey { key: key.to_owned(), index: n.index, distance: n.distance })
                })
                .collect::<Result<Vec<_>>>()?;
            queries.push(QueryReport { query: query.as_ref().to_owned(), neighbors });
        }
        Ok(Self::new(variant, position, metric, result.k, queries))
    }

    pub fn from_position<S: AsRef<str>>(
        variant: &Variant,
        metric: Metric,
        result: &PositionResult,
        k: usize,
        query_keys: &[S],
    ) -> Result<Self> {
        Self::check_queries(query_keys, result.per_query.len())?;
        let queries = query_keys
            .iter()
            .zip(&result.per_query)
            .map(|(query, matches)| QueryReport {
                query: query.as_ref().to_owned(),
                neighbors: matches
                    .iter()
                    .map(|m| SimilarKey { key: m.key.clone(), index: m.index, distance: m.distance })
                    .collect(),
            })
            .collect();
        Ok(Self::new(variant, Some(result.position), metric, k, queries))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut report: Self = read_json(path)?;
        report.reindex();
        Ok(report)
    }

    pub fn neighbors_of(&self, query: &str) -> Option<&[SimilarKey]> {
        self.lookup.get(query).map(|&i| self.queries[i].neighbors.as_slice())
    }
}
