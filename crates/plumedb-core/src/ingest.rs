//! Partition ingestion from AirNow-style monitoring site files.
//!
//! Each data file is headerless CSV with twelve columns:
//! latitude, longitude, UTC timestamp, parameter, unit, raw concentration,
//! AQI, category, site name, agency name, full AQS code, intl AQS code.
//!
//! Malformed rows are skipped and counted, never fatal. Files are read in
//! name order so repeated loads of the same partition produce identical
//! stores.

use crate::store::PartitionStore;
use crate::types::Measurement;
use chrono::NaiveDateTime;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

const COLUMNS: usize = 12;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io: {0}")]
    Io(String),
}

/// Summary of one partition load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub files_read: usize,
    pub rows_loaded: u64,
    pub rows_skipped: u64,
}

/// Load every `*.csv` / `*.dat` file under `dir` into a fresh store.
/// An empty or missing directory yields an empty store.
pub fn load_partition(dir: &Path) -> Result<(PartitionStore, IngestReport), IngestError> {
    let mut store = PartitionStore::new();
    let mut report = IngestReport::default();

    if !dir.exists() {
        warn!(dir = %dir.display(), "partition directory missing; starting empty");
        return Ok((store, report));
    }

    let mut paths: Vec<_> = fs::read_dir(dir)
        .map_err(|e| IngestError::Io(format!("{}: {e}", dir.display())))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("csv") | Some("dat")
            )
        })
        .collect();
    paths.sort();

    for path in &paths {
        load_file(path, &mut store, &mut report)?;
        report.files_read += 1;
    }

    info!(
        dir = %dir.display(),
        files = report.files_read,
        rows = report.rows_loaded,
        skipped = report.rows_skipped,
        "partition loaded"
    );
    Ok((store, report))
}

fn load_file(
    path: &Path,
    store: &mut PartitionStore,
    report: &mut IngestReport,
) -> Result<(), IngestError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| IngestError::Io(format!("{}: {e}", path.display())))?;

    for row in reader.records() {
        let row = match row {
            Ok(r) => r,
            Err(e) => {
                debug!(file = %path.display(), error = %e, "unreadable row skipped");
                report.rows_skipped += 1;
                continue;
            }
        };
        match parse_row(&row) {
            Some(m) => {
                store.insert(m);
                report.rows_loaded += 1;
            }
            None => report.rows_skipped += 1,
        }
    }
    Ok(())
}

fn parse_row(row: &csv::StringRecord) -> Option<Measurement> {
    if row.len() < COLUMNS {
        return None;
    }
    let latitude: f64 = row.get(0)?.trim().parse().ok()?;
    let longitude: f64 = row.get(1)?.trim().parse().ok()?;
    let timestamp_utc = row.get(2)?.trim().to_string();
    if !valid_timestamp(&timestamp_utc) {
        return None;
    }
    let parameter = row.get(3)?.trim().to_string();
    // Column 4 is the unit label; not stored.
    let concentration: f64 = row.get(5)?.trim().parse().ok()?;
    let aqi: i32 = row.get(6)?.trim().parse().ok()?;
    // Column 7 is the AQI category; not stored.
    let site_name = row.get(8)?.trim().to_string();
    let agency_name = row.get(9)?.trim().to_string();
    let aqs_code = row.get(10)?.trim().to_string();

    if parameter.is_empty() || site_name.is_empty() || aqs_code.is_empty() {
        return None;
    }

    Some(Measurement {
        site_name,
        agency_name,
        aqs_code,
        parameter,
        concentration,
        aqi,
        latitude,
        longitude,
        timestamp_utc,
    })
}

fn valid_timestamp(ts: &str) -> bool {
    NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S").is_ok()
        || NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M").is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const GOOD_ROW: &str = "37.805,-122.273,2023-08-10T14:00:00,PM2.5,UG/M3,12.4,52,Moderate,Oakland West,BAAQMD,060010011,840060010011";

    #[test]
    fn loads_rows_and_counts_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = fs::File::create(dir.path().join("partition.csv")).unwrap();
        writeln!(f, "{GOOD_ROW}").unwrap();
        writeln!(f, "not,a,valid,row").unwrap();
        writeln!(
            f,
            "bad-lat,-122.0,2023-08-10T14:00:00,PM10,UG/M3,30.0,80,Moderate,Site,Agency,060010012,840"
        )
        .unwrap();
        writeln!(
            f,
            "37.9,-122.1,10/08/2023 14:00,PM10,UG/M3,30.0,80,Moderate,Site,Agency,060010012,840"
        )
        .unwrap();
        drop(f);

        let (store, report) = load_partition(dir.path()).unwrap();
        assert_eq!(report.files_read, 1);
        assert_eq!(report.rows_loaded, 1);
        assert_eq!(report.rows_skipped, 3);
        assert_eq!(store.len(), 1);

        let m = store.record_at(0);
        assert_eq!(m.site_name, "Oakland West");
        assert_eq!(m.agency_name, "BAAQMD");
        assert_eq!(m.aqs_code, "060010011");
        assert_eq!(m.aqi, 52);
        assert!((m.concentration - 12.4).abs() < f64::EPSILON);
    }

    #[test]
    fn missing_directory_yields_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let (store, report) = load_partition(&missing).unwrap();
        assert!(store.is_empty());
        assert_eq!(report, IngestReport::default());
    }

    #[test]
    fn files_load_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        let row_b = GOOD_ROW.replace("Oakland West", "Site B");
        fs::write(dir.path().join("b.csv"), format!("{row_b}\n")).unwrap();
        fs::write(dir.path().join("a.csv"), format!("{GOOD_ROW}\n")).unwrap();

        let (store, report) = load_partition(dir.path()).unwrap();
        assert_eq!(report.files_read, 2);
        assert_eq!(store.record_at(0).site_name, "Oakland West");
        assert_eq!(store.record_at(1).site_name, "Site B");
    }

    #[test]
    fn non_data_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("readme.txt"), "hello").unwrap();
        fs::write(dir.path().join("data.csv"), format!("{GOOD_ROW}\n")).unwrap();

        let (_, report) = load_partition(dir.path()).unwrap();
        assert_eq!(report.files_read, 1);
        assert_eq!(report.rows_loaded, 1);
    }
}
