//! Cost-based query planning.
//!
//! The planner is a pure function: given the parsed filters, the indexes
//! declared on the collection, and collection statistics, it decides
//! between a full scan and an index scan, and splits the filters into the
//! set pushed down to the index and the set applied afterwards. It
//! performs no I/O.

use crate::index::{IndexDefinition, IndexKind};
use crate::query::{CompareOp, Condition};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Selectivity assumed for an inverted-index text predicate.
pub const INVERTED_SELECTIVITY: f64 = 0.01;

/// Selectivity assumed when nothing better is known.
pub const UNKNOWN_SELECTIVITY: f64 = 0.1;

/// Per-index statistics. Absent values fall back to documented defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexStats {
    /// Number of distinct keys in the index.
    pub cardinality: Option<u64>,
    /// Fraction of documents matched by one predicate on this index.
    pub selectivity: Option<f64>,
    /// Average documents per key bucket.
    pub avg_bucket_size: Option<f64>,
}

/// Statistics for one collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionStats {
    /// Total documents in the collection.
    pub total_documents: u64,
    /// Statistics per index name.
    pub per_index: HashMap<String, IndexStats>,
}

/// How the plan reads the collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanType {
    /// Read every document.
    FullScan,
    /// Read ids from an index, then re-check remaining filters.
    IndexScan,
    /// Read ids from an index; no post-filters remain.
    IndexOnlyScan,
}

/// The chosen execution plan.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub use_index: bool,
    pub index_name: Option<String>,
    pub scan_type: ScanType,
    /// Filters served by the chosen index.
    pub index_filters: Vec<Condition>,
    /// Filters re-checked against fetched documents.
    pub post_filters: Vec<Condition>,
    pub estimated_rows: f64,
    pub estimated_cost: f64,
    pub limit: Option<usize>,
}

/// One index the planner considered viable.
struct Candidate {
    index_name: String,
    index_filters: Vec<usize>,
    estimated_rows: f64,
    estimated_cost: f64,
}

/// Cost of reading the whole collection.
fn full_scan_cost(total: u64) -> f64 {
    1.0 + total as f64
}

fn stats_for<'a>(stats: &'a CollectionStats, name: &str) -> Option<&'a IndexStats> {
    stats.per_index.get(name)
}

fn exact_selectivity(index_stats: Option<&IndexStats>) -> f64 {
    if let Some(s) = index_stats {
        if let Some(sel) = s.selectivity {
            return sel;
        }
        if let Some(card) = s.cardinality {
            if card > 0 {
                return 1.0 / card as f64;
            }
        }
    }
    UNKNOWN_SELECTIVITY
}

fn inverted_selectivity(index_stats: Option<&IndexStats>) -> f64 {
    index_stats
        .and_then(|s| s.selectivity)
        .unwrap_or(INVERTED_SELECTIVITY)
}

fn avg_bucket_size(index_stats: Option<&IndexStats>) -> f64 {
    index_stats.and_then(|s| s.avg_bucket_size).unwrap_or(1.0)
}

/// Evaluate one index against the filter set.
fn consider(
    index: &IndexDefinition,
    filters: &[Condition],
    stats: &CollectionStats,
) -> Option<Candidate> {
    let index_stats = stats_for(stats, &index.name);
    let total = stats.total_documents as f64;

    let (served, per_filter_selectivity): (Vec<usize>, f64) = match index.kind {
        IndexKind::Exact => {
            // Every keyed field needs an equality predicate for a composite
            // key lookup.
            let mut served = Vec::new();
            for field in &index.fields {
                let position = filters
                    .iter()
                    .position(|c| c.op == CompareOp::Eq && &c.field == field)?;
                served.push(position);
            }
            (served, exact_selectivity(index_stats))
        }
        IndexKind::Inverted => {
            let served: Vec<usize> = filters
                .iter()
                .enumerate()
                .filter(|(_, c)| {
                    c.op == CompareOp::Contains
                        && index.fields.contains(&c.field)
                        && c.value.is_string()
                })
                .map(|(i, _)| i)
                .collect();
            if served.is_empty() {
                return None;
            }
            (served, inverted_selectivity(index_stats))
        }
        // ANN indexes are never chosen for scalar filters.
        IndexKind::Ann => return None,
    };

    let combined: f64 = per_filter_selectivity.powi(served.len() as i32);
    let estimated_rows = total * combined;
    let estimated_cost = 1.0 + estimated_rows * avg_bucket_size(index_stats);

    Some(Candidate {
        index_name: index.name.clone(),
        index_filters: served,
        estimated_rows,
        estimated_cost,
    })
}

/// Choose a plan for the given filters.
pub fn plan(
    filters: &[Condition],
    indexes: &[IndexDefinition],
    stats: &CollectionStats,
    limit: Option<usize>,
) -> QueryPlan {
    let total = stats.total_documents;
    let cap = |rows: f64| match limit {
        Some(l) => rows.min(l as f64),
        None => rows,
    };

    if filters.is_empty() {
        return QueryPlan {
            use_index: false,
            index_name: None,
            scan_type: ScanType::FullScan,
            index_filters: Vec::new(),
            post_filters: Vec::new(),
            estimated_rows: cap(total as f64),
            estimated_cost: full_scan_cost(total),
            limit,
        };
    }

    let best = indexes
        .iter()
        .filter_map(|index| consider(index, filters, stats))
        .min_by(|a, b| {
            a.estimated_cost
                .partial_cmp(&b.estimated_cost)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

    match best {
        // An eligible index always serves the query; cost only breaks ties
        // among eligible candidates.
        Some(candidate) => {
            let mut index_filters = Vec::new();
            let mut post_filters = Vec::new();
            for (position, condition) in filters.iter().enumerate() {
                if candidate.index_filters.contains(&position) {
                    index_filters.push(condition.clone());
                } else {
                    post_filters.push(condition.clone());
                }
            }
            let scan_type = if post_filters.is_empty() {
                ScanType::IndexOnlyScan
            } else {
                ScanType::IndexScan
            };
            QueryPlan {
                use_index: true,
                index_name: Some(candidate.index_name),
                scan_type,
                index_filters,
                post_filters,
                estimated_rows: cap(candidate.estimated_rows),
                estimated_cost: candidate.estimated_cost,
                limit,
            }
        }
        None => QueryPlan {
            use_index: false,
            index_name: None,
            scan_type: ScanType::FullScan,
            index_filters: Vec::new(),
            post_filters: filters.to_vec(),
            estimated_rows: cap(total as f64),
            estimated_cost: full_scan_cost(total),
            limit,
        },
    }
}
