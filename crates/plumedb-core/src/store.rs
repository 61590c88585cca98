//! In-memory columnar store for one partition.
//!
//! Records live in parallel column vectors; three inverted indices map
//! site name, parameter, and AQS code to row positions. The store is
//! written once at load time and read-only afterwards, so readers share
//! it without locking.

use crate::types::{GeoTemporalBounds, Measurement};
use std::collections::HashMap;
use std::ops::Range;

static EMPTY_POSITIONS: &[u32] = &[];

/// Column-aligned storage for one partition's measurements.
///
/// Invariant: every column vector has identical length, and position `i`
/// in every column describes the same measurement. Index entries hold
/// positions in insertion order, which is ascending.
#[derive(Debug, Default)]
pub struct PartitionStore {
    site_names: Vec<String>,
    agency_names: Vec<String>,
    aqs_codes: Vec<String>,
    parameters: Vec<String>,
    concentrations: Vec<f64>,
    aqis: Vec<i32>,
    latitudes: Vec<f64>,
    longitudes: Vec<f64>,
    timestamps_utc: Vec<String>,

    by_site: HashMap<String, Vec<u32>>,
    by_parameter: HashMap<String, Vec<u32>>,
    by_aqs_code: HashMap<String, Vec<u32>>,

    bounds: Option<GeoTemporalBounds>,
}

impl PartitionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one measurement, updating columns, the three inverted
    /// indices, and the running bounds as a unit. The only mutator.
    pub fn insert(&mut self, m: Measurement) {
        let pos = self.site_names.len() as u32;

        self.by_site.entry(m.site_name.clone()).or_default().push(pos);
        self.by_parameter
            .entry(m.parameter.clone())
            .or_default()
            .push(pos);
        self.by_aqs_code
            .entry(m.aqs_code.clone())
            .or_default()
            .push(pos);

        self.widen_bounds(&m);

        self.site_names.push(m.site_name);
        self.agency_names.push(m.agency_name);
        self.aqs_codes.push(m.aqs_code);
        self.parameters.push(m.parameter);
        self.concentrations.push(m.concentration);
        self.aqis.push(m.aqi);
        self.latitudes.push(m.latitude);
        self.longitudes.push(m.longitude);
        self.timestamps_utc.push(m.timestamp_utc);
    }

    fn widen_bounds(&mut self, m: &Measurement) {
        match &mut self.bounds {
            None => {
                self.bounds = Some(GeoTemporalBounds {
                    min_latitude: m.latitude,
                    max_latitude: m.latitude,
                    min_longitude: m.longitude,
                    max_longitude: m.longitude,
                    earliest_utc: m.timestamp_utc.clone(),
                    latest_utc: m.timestamp_utc.clone(),
                });
            }
            Some(b) => {
                b.min_latitude = b.min_latitude.min(m.latitude);
                b.max_latitude = b.max_latitude.max(m.latitude);
                b.min_longitude = b.min_longitude.min(m.longitude);
                b.max_longitude = b.max_longitude.max(m.longitude);
                if m.timestamp_utc < b.earliest_utc {
                    b.earliest_utc = m.timestamp_utc.clone();
                }
                if m.timestamp_utc > b.latest_utc {
                    b.latest_utc = m.timestamp_utc.clone();
                }
            }
        }
    }

    /// Positions holding the given site name, empty if absent. Borrowed
    /// view, no copy.
    pub fn lookup_by_site(&self, name: &str) -> &[u32] {
        self.by_site
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or(EMPTY_POSITIONS)
    }

    pub fn lookup_by_parameter(&self, name: &str) -> &[u32] {
        self.by_parameter
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or(EMPTY_POSITIONS)
    }

    pub fn lookup_by_aqs_code(&self, code: &str) -> &[u32] {
        self.by_aqs_code
            .get(code)
            .map(Vec::as_slice)
            .unwrap_or(EMPTY_POSITIONS)
    }

    /// All positions, used when a filter supplies no OR-group terms.
    pub fn full_scan_indices(&self) -> Range<u32> {
        0..self.site_names.len() as u32
    }

    /// Current geographic and temporal extents. None while the store is
    /// empty.
    pub fn bounds_snapshot(&self) -> Option<&GeoTemporalBounds> {
        self.bounds.as_ref()
    }

    pub fn len(&self) -> usize {
        self.site_names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.site_names.is_empty()
    }

    /// Materialize the measurement at `pos` as an owned record.
    pub fn record_at(&self, pos: u32) -> Measurement {
        let i = pos as usize;
        Measurement {
            site_name: self.site_names[i].clone(),
            agency_name: self.agency_names[i].clone(),
            aqs_code: self.aqs_codes[i].clone(),
            parameter: self.parameters[i].clone(),
            concentration: self.concentrations[i],
            aqi: self.aqis[i],
            latitude: self.latitudes[i],
            longitude: self.longitudes[i],
            timestamp_utc: self.timestamps_utc[i].clone(),
        }
    }

    #[inline]
    pub fn aqi_at(&self, pos: u32) -> i32 {
        self.aqis[pos as usize]
    }

    #[inline]
    pub fn concentration_at(&self, pos: u32) -> f64 {
        self.concentrations[pos as usize]
    }

    #[inline]
    pub fn latitude_at(&self, pos: u32) -> f64 {
        self.latitudes[pos as usize]
    }

    #[inline]
    pub fn longitude_at(&self, pos: u32) -> f64 {
        self.longitudes[pos as usize]
    }

    #[inline]
    pub fn timestamp_at(&self, pos: u32) -> &str {
        &self.timestamps_utc[pos as usize]
    }
}
