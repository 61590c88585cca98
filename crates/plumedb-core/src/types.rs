//! Shared types exchanged between the store, the node fan-out, and the
//! request lifecycle layers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Client-assigned identifier for one logical query.
pub type RequestId = u64;

/// One air-quality measurement. Immutable once ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub site_name: String,
    pub agency_name: String,
    pub aqs_code: String,
    pub parameter: String,
    pub concentration: f64,
    pub aqi: i32,
    pub latitude: f64,
    pub longitude: f64,
    /// ISO-8601 UTC timestamp. Lexical order equals chronological order.
    pub timestamp_utc: String,
}

/// Geographic and temporal extents of a partition, widened on every insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoTemporalBounds {
    pub min_latitude: f64,
    pub max_latitude: f64,
    pub min_longitude: f64,
    pub max_longitude: f64,
    pub earliest_utc: String,
    pub latest_utc: String,
}

/// Lifecycle status of a client-visible request at the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Cancelled,
    Failed,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Cancelled | RequestStatus::Failed
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Processing => "processing",
            RequestStatus::Completed => "completed",
            RequestStatus::Cancelled => "cancelled",
            RequestStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Reply to an internal query, at any tier. Carries the node's own matches
/// plus everything merged from its children.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeReply {
    pub responding_node_id: String,
    pub records: Vec<Measurement>,
    /// Always true once all reachable children have replied or failed.
    pub is_complete: bool,
}

/// One bounded slice of a query's merged result, streamed to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryChunk {
    pub request_id: RequestId,
    pub chunk_index: u32,
    pub is_last_chunk: bool,
    pub total_chunks: u32,
    pub total_results: u64,
    pub records: Vec<Measurement>,
}
