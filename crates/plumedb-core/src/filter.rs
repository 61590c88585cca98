//! Filter specification and evaluation against a partition store.
//!
//! Evaluation runs in two phases:
//! 1. OR phase: union of index lookups across every value of every
//!    non-empty OR-group field (parameters, site names, AQS codes), or a
//!    full scan when no OR-group field is supplied.
//! 2. AND phase: every scalar bound that is set must hold, inclusive on
//!    both ends. Unset bounds never exclude.
//!
//! The result is an ascending, deduplicated position list so chunk order
//! is deterministic at every tier.

use crate::store::PartitionStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Filter specification sent with every query.
///
/// List fields are OR-groups: any listed value matches. Scalar bounds are
/// AND-groups: all supplied bounds must hold simultaneously. `None`
/// means unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryFilter {
    pub parameters: Vec<String>,
    pub site_names: Vec<String>,
    pub aqs_codes: Vec<String>,

    pub min_aqi: Option<i32>,
    pub max_aqi: Option<i32>,
    pub min_concentration: Option<f64>,
    pub max_concentration: Option<f64>,
    pub min_latitude: Option<f64>,
    pub max_latitude: Option<f64>,
    pub min_longitude: Option<f64>,
    pub max_longitude: Option<f64>,
    pub start_utc: Option<String>,
    pub end_utc: Option<String>,
}

impl QueryFilter {
    /// True when at least one OR-group field carries values.
    pub fn has_or_terms(&self) -> bool {
        !self.parameters.is_empty() || !self.site_names.is_empty() || !self.aqs_codes.is_empty()
    }
}

/// Evaluate `filter` against `store`, returning surviving positions in
/// ascending order.
pub fn evaluate(store: &PartitionStore, filter: &QueryFilter) -> Vec<u32> {
    if filter.has_or_terms() {
        // Union across ALL values of EVERY non-empty OR-group field. A
        // non-empty field never short-circuits another.
        let mut candidates: BTreeSet<u32> = BTreeSet::new();
        for p in &filter.parameters {
            candidates.extend(store.lookup_by_parameter(p));
        }
        for s in &filter.site_names {
            candidates.extend(store.lookup_by_site(s));
        }
        for c in &filter.aqs_codes {
            candidates.extend(store.lookup_by_aqs_code(c));
        }
        candidates
            .into_iter()
            .filter(|&pos| passes_bounds(store, filter, pos))
            .collect()
    } else {
        store
            .full_scan_indices()
            .filter(|&pos| passes_bounds(store, filter, pos))
            .collect()
    }
}

fn passes_bounds(store: &PartitionStore, filter: &QueryFilter, pos: u32) -> bool {
    if let Some(min) = filter.min_aqi {
        if store.aqi_at(pos) < min {
            return false;
        }
    }
    if let Some(max) = filter.max_aqi {
        if store.aqi_at(pos) > max {
            return false;
        }
    }
    if let Some(min) = filter.min_concentration {
        if store.concentration_at(pos) < min {
            return false;
        }
    }
    if let Some(max) = filter.max_concentration {
        if store.concentration_at(pos) > max {
            return false;
        }
    }
    if let Some(min) = filter.min_latitude {
        if store.latitude_at(pos) < min {
            return false;
        }
    }
    if let Some(max) = filter.max_latitude {
        if store.latitude_at(pos) > max {
            return false;
        }
    }
    if let Some(min) = filter.min_longitude {
        if store.longitude_at(pos) < min {
            return false;
        }
    }
    if let Some(max) = filter.max_longitude {
        if store.longitude_at(pos) > max {
            return false;
        }
    }
    // ISO-8601 strings compare lexically in chronological order.
    if let Some(start) = &filter.start_utc {
        if store.timestamp_at(pos) < start.as_str() {
            return false;
        }
    }
    if let Some(end) = &filter.end_utc {
        if store.timestamp_at(pos) > end.as_str() {
            return false;
        }
    }
    true
}
