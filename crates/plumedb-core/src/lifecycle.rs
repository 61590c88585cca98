//! Request lifecycle manager, root tier only.
//!
//! Tracks every client-visible query from admission to eviction: runs the
//! fan-out synchronously, slices the merged result into ordered chunks,
//! and serves status/cancel against a lock-per-entry request map. A
//! terminal request lingers for [`CLEANUP_DELAY`] so status and cancel
//! stay meaningful briefly after the stream ends, then the delay queue
//! evicts it.

use crate::cleanup::CleanupQueue;
use crate::filter::QueryFilter;
use crate::node::{NodeError, QueryExecutor};
use crate::types::{QueryChunk, RequestId, RequestStatus};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const CLEANUP_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("duplicate request id {0}")]
    Duplicate(RequestId),
    #[error("aggregation failed: {0}")]
    Aggregation(#[from] NodeError),
}

/// Root-side tracking record for one in-flight or recently finished
/// query.
#[derive(Debug)]
pub struct ActiveRequest {
    pub status: RequestStatus,
    pub created_at: Instant,
    pub chunks_delivered: u32,
    pub total_chunks: Option<u32>,
    pub cancel_requested: bool,
}

impl ActiveRequest {
    fn new() -> Self {
        Self {
            status: RequestStatus::Pending,
            created_at: Instant::now(),
            chunks_delivered: 0,
            total_chunks: None,
            cancel_requested: false,
        }
    }
}

/// Point-in-time view of a request, safe to hand across the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub status: RequestStatus,
    pub chunks_delivered: u32,
    pub total_chunks: Option<u32>,
}

impl StatusSnapshot {
    fn of(entry: &ActiveRequest) -> Self {
        Self {
            status: entry.status,
            chunks_delivered: entry.chunks_delivered,
            total_chunks: entry.total_chunks,
        }
    }
}

/// Outcome of a cancel call. Unknown ids are a result, never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    AlreadyTerminal(RequestStatus),
    NotFound,
}

/// Where chunks go. The server backs this with its client connection;
/// tests back it with vectors.
pub trait ChunkSink {
    /// Deliver one chunk. Returns false once the downstream transport is
    /// gone; emission stops at that point.
    fn send(&mut self, chunk: &QueryChunk) -> bool;
    /// Cheap connectivity probe checked before each emission.
    fn is_connected(&self) -> bool;
}

// ============================================================================
// Active request map
// ============================================================================

/// Concurrent request table: the map lock guards the key set only, each
/// entry has its own mutex. Operations on different entries never
/// serialize against each other.
#[derive(Default)]
pub struct ActiveRequestMap {
    entries: RwLock<HashMap<RequestId, Arc<Mutex<ActiveRequest>>>>,
}

impl ActiveRequestMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a new request. None if the id is already live.
    fn create(&self, request_id: RequestId) -> Option<Arc<Mutex<ActiveRequest>>> {
        let mut entries = self.entries.write();
        if entries.contains_key(&request_id) {
            return None;
        }
        let entry = Arc::new(Mutex::new(ActiveRequest::new()));
        entries.insert(request_id, entry.clone());
        Some(entry)
    }

    fn get(&self, request_id: RequestId) -> Option<Arc<Mutex<ActiveRequest>>> {
        self.entries.read().get(&request_id).cloned()
    }

    /// Remove an entry; false when it was already gone, which makes a
    /// late scheduled eviction a no-op.
    pub fn evict(&self, request_id: RequestId) -> bool {
        self.entries.write().remove(&request_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

// ============================================================================
// Request manager
// ============================================================================

pub struct RequestManager {
    executor: Arc<dyn QueryExecutor>,
    requests: Arc<ActiveRequestMap>,
    cleanup: CleanupQueue,
    default_chunk_size: usize,
}

impl RequestManager {
    pub fn new(executor: Arc<dyn QueryExecutor>) -> Self {
        let requests = Arc::new(ActiveRequestMap::new());
        let map = requests.clone();
        let cleanup = CleanupQueue::new(move |request_id| {
            if map.evict(request_id) {
                debug!(request_id, "evicted finished request");
            }
        });
        Self {
            executor,
            requests,
            cleanup,
            default_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_default_chunk_size(mut self, size: usize) -> Self {
        if size > 0 {
            self.default_chunk_size = size;
        }
        self
    }

    /// Admit, aggregate, and stream one query. Synchronous: returns once
    /// the request reaches a terminal status. The final snapshot is
    /// returned for logging; clients observe progress via the sink and
    /// `get_status`.
    pub fn submit(
        &self,
        request_id: RequestId,
        filter: &QueryFilter,
        chunk_size_hint: u32,
        sink: &mut dyn ChunkSink,
    ) -> Result<StatusSnapshot, RequestError> {
        let entry = self
            .requests
            .create(request_id)
            .ok_or(RequestError::Duplicate(request_id))?;
        entry.lock().status = RequestStatus::Processing;
        info!(request_id, "request admitted");

        let reply = match self.executor.execute(filter, request_id) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(request_id, error = %e, "aggregation failed");
                self.finish(request_id, &entry, RequestStatus::Failed);
                return Err(e.into());
            }
        };

        let records = reply.records;
        let total_results = records.len() as u64;
        let chunk_size = if chunk_size_hint > 0 {
            chunk_size_hint as usize
        } else {
            self.default_chunk_size
        };
        let total_chunks = records.len().div_ceil(chunk_size) as u32;
        entry.lock().total_chunks = Some(total_chunks);
        debug!(
            request_id,
            total_results, total_chunks, chunk_size, "aggregation complete"
        );

        for (index, slice) in records.chunks(chunk_size).enumerate() {
            // Cancellation and transport checks gate every emission.
            {
                let e = entry.lock();
                if e.cancel_requested {
                    drop(e);
                    info!(request_id, "cancelled before chunk emission");
                    return Ok(self.finish(request_id, &entry, RequestStatus::Cancelled));
                }
            }
            if !sink.is_connected() {
                info!(request_id, "client disconnected; stopping stream");
                return Ok(self.finish(request_id, &entry, RequestStatus::Cancelled));
            }

            let chunk = QueryChunk {
                request_id,
                chunk_index: index as u32,
                is_last_chunk: index as u32 + 1 == total_chunks,
                total_chunks,
                total_results,
                records: slice.to_vec(),
            };
            if !sink.send(&chunk) {
                info!(request_id, "chunk delivery failed; stopping stream");
                return Ok(self.finish(request_id, &entry, RequestStatus::Cancelled));
            }
            entry.lock().chunks_delivered += 1;
        }

        info!(request_id, total_chunks, "request completed");
        Ok(self.finish(request_id, &entry, RequestStatus::Completed))
    }

    /// Set a terminal status unless one is already set, schedule the
    /// entry's eviction, and return the closing snapshot.
    fn finish(
        &self,
        request_id: RequestId,
        entry: &Arc<Mutex<ActiveRequest>>,
        terminal: RequestStatus,
    ) -> StatusSnapshot {
        let mut e = entry.lock();
        if !e.status.is_terminal() {
            e.status = terminal;
        }
        let snapshot = StatusSnapshot::of(&e);
        drop(e);
        self.cleanup.schedule(request_id, CLEANUP_DELAY);
        snapshot
    }

    /// Flag a request for cancellation. Takes effect before the next
    /// chunk emission; in-flight child calls are not interrupted.
    pub fn cancel(&self, request_id: RequestId) -> CancelOutcome {
        let Some(entry) = self.requests.get(request_id) else {
            return CancelOutcome::NotFound;
        };
        let mut e = entry.lock();
        if e.status.is_terminal() {
            return CancelOutcome::AlreadyTerminal(e.status);
        }
        e.cancel_requested = true;
        e.status = RequestStatus::Cancelled;
        drop(e);
        info!(request_id, "cancel requested");
        self.cleanup.schedule(request_id, CLEANUP_DELAY);
        CancelOutcome::Cancelled
    }

    /// Snapshot a request's progress. None for unknown or already
    /// evicted ids.
    pub fn get_status(&self, request_id: RequestId) -> Option<StatusSnapshot> {
        self.requests
            .get(request_id)
            .map(|entry| StatusSnapshot::of(&entry.lock()))
    }

    pub fn active_requests(&self) -> usize {
        self.requests.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Measurement, NodeReply};

    struct FixedExecutor {
        records: Vec<Measurement>,
    }

    impl QueryExecutor for FixedExecutor {
        fn execute(&self, _: &QueryFilter, _: RequestId) -> Result<NodeReply, NodeError> {
            Ok(NodeReply {
                responding_node_id: "root".into(),
                records: self.records.clone(),
                is_complete: true,
            })
        }
    }

    struct FailingExecutor;

    impl QueryExecutor for FailingExecutor {
        fn execute(&self, _: &QueryFilter, _: RequestId) -> Result<NodeReply, NodeError> {
            Err(NodeError::Internal("store unavailable".into()))
        }
    }

    #[derive(Default)]
    struct VecSink {
        chunks: Vec<QueryChunk>,
        /// Deliveries accepted before the sink reports disconnection.
        fail_after: Option<usize>,
    }

    impl ChunkSink for VecSink {
        fn send(&mut self, chunk: &QueryChunk) -> bool {
            if let Some(limit) = self.fail_after {
                if self.chunks.len() >= limit {
                    return false;
                }
            }
            self.chunks.push(chunk.clone());
            true
        }

        fn is_connected(&self) -> bool {
            self.fail_after.map_or(true, |limit| self.chunks.len() < limit)
        }
    }

    fn records(n: usize) -> Vec<Measurement> {
        (0..n)
            .map(|i| Measurement {
                site_name: format!("Site {i}"),
                agency_name: "Agency".into(),
                aqs_code: "060010011".into(),
                parameter: "PM2.5".into(),
                concentration: i as f64,
                aqi: i as i32,
                latitude: 37.0,
                longitude: -122.0,
                timestamp_utc: "2023-08-10T14:00:00".into(),
            })
            .collect()
    }

    fn manager(records_in_reply: usize) -> RequestManager {
        RequestManager::new(Arc::new(FixedExecutor {
            records: records(records_in_reply),
        }))
    }

    #[test]
    fn chunk_concatenation_reproduces_merged_result() {
        let mgr = manager(10);
        let mut sink = VecSink::default();
        let snapshot = mgr.submit(1, &QueryFilter::default(), 3, &mut sink).unwrap();

        assert_eq!(snapshot.status, RequestStatus::Completed);
        assert_eq!(snapshot.chunks_delivered, 4);
        assert_eq!(snapshot.total_chunks, Some(4));

        let rejoined: Vec<_> = sink
            .chunks
            .iter()
            .flat_map(|c| c.records.iter().cloned())
            .collect();
        assert_eq!(rejoined, records(10));
        for (i, chunk) in sink.chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i as u32);
            assert_eq!(chunk.is_last_chunk, i == 3);
            assert_eq!(chunk.total_chunks, 4);
            assert_eq!(chunk.total_results, 10);
        }
    }

    #[test]
    fn chunk_size_hint_of_one_yields_one_record_chunks() {
        let mgr = manager(3);
        let mut sink = VecSink::default();
        mgr.submit(2, &QueryFilter::default(), 1, &mut sink).unwrap();

        assert_eq!(sink.chunks.len(), 3);
        assert!(sink.chunks.iter().take(2).all(|c| !c.is_last_chunk));
        assert!(sink.chunks[2].is_last_chunk);
    }

    #[test]
    fn zero_hint_falls_back_to_default_chunk_size() {
        let mgr = manager(5);
        let mut sink = VecSink::default();
        let snapshot = mgr.submit(3, &QueryFilter::default(), 0, &mut sink).unwrap();
        assert_eq!(snapshot.total_chunks, Some(1));
        assert_eq!(sink.chunks.len(), 1);
        assert_eq!(sink.chunks[0].records.len(), 5);
    }

    #[test]
    fn empty_result_completes_with_zero_chunks() {
        let mgr = manager(0);
        let mut sink = VecSink::default();
        let snapshot = mgr.submit(4, &QueryFilter::default(), 10, &mut sink).unwrap();
        assert_eq!(snapshot.status, RequestStatus::Completed);
        assert_eq!(snapshot.total_chunks, Some(0));
        assert!(sink.chunks.is_empty());
    }

    #[test]
    fn duplicate_live_request_id_is_rejected() {
        let mgr = manager(2);
        let mut sink = VecSink::default();
        mgr.submit(5, &QueryFilter::default(), 1, &mut sink).unwrap();
        // Entry lingers in terminal state until cleanup; resubmission of
        // the same id must signal, not crash.
        let err = mgr
            .submit(5, &QueryFilter::default(), 1, &mut sink)
            .unwrap_err();
        assert!(matches!(err, RequestError::Duplicate(5)));
    }

    #[test]
    fn disconnect_mid_stream_marks_cancelled() {
        let mgr = manager(10);
        let mut sink = VecSink {
            fail_after: Some(2),
            ..Default::default()
        };
        let snapshot = mgr.submit(6, &QueryFilter::default(), 2, &mut sink).unwrap();

        assert_eq!(snapshot.status, RequestStatus::Cancelled);
        assert_eq!(snapshot.chunks_delivered, 2);
        assert_eq!(sink.chunks.len(), 2);
    }

    #[test]
    fn cancel_flag_stops_emission_and_freezes_progress() {
        struct CancellingSink<'a> {
            mgr: &'a RequestManager,
            delivered: Vec<QueryChunk>,
        }
        impl ChunkSink for CancellingSink<'_> {
            fn send(&mut self, chunk: &QueryChunk) -> bool {
                if chunk.chunk_index == 1 {
                    assert_eq!(self.mgr.cancel(chunk.request_id), CancelOutcome::Cancelled);
                }
                self.delivered.push(chunk.clone());
                true
            }
            fn is_connected(&self) -> bool {
                true
            }
        }

        let mgr = manager(10);
        let mut sink = CancellingSink {
            mgr: &mgr,
            delivered: Vec::new(),
        };
        let snapshot = mgr.submit(7, &QueryFilter::default(), 2, &mut sink).unwrap();

        assert_eq!(snapshot.status, RequestStatus::Cancelled);
        // Chunks 0 and 1 went out; the flag was observed before chunk 2.
        assert_eq!(sink.delivered.len(), 2);
        assert_eq!(snapshot.chunks_delivered, 2);
        let status = mgr.get_status(7).unwrap();
        assert_eq!(status.chunks_delivered, 2);
    }

    #[test]
    fn status_mid_stream_reports_processing() {
        struct ProbeSink<'a> {
            mgr: &'a RequestManager,
            observed: Vec<StatusSnapshot>,
        }
        impl ChunkSink for ProbeSink<'_> {
            fn send(&mut self, chunk: &QueryChunk) -> bool {
                self.observed
                    .push(self.mgr.get_status(chunk.request_id).unwrap());
                true
            }
            fn is_connected(&self) -> bool {
                true
            }
        }

        let mgr = manager(4);
        let mut sink = ProbeSink {
            mgr: &mgr,
            observed: Vec::new(),
        };
        mgr.submit(8, &QueryFilter::default(), 2, &mut sink).unwrap();

        assert_eq!(sink.observed.len(), 2);
        // First observation: stream admitted, nothing delivered yet.
        assert_eq!(sink.observed[0].status, RequestStatus::Processing);
        assert_eq!(sink.observed[0].chunks_delivered, 0);
        assert_eq!(sink.observed[1].chunks_delivered, 1);
    }

    #[test]
    fn unknown_id_status_and_cancel_are_not_found() {
        let mgr = manager(1);
        assert!(mgr.get_status(999).is_none());
        assert_eq!(mgr.cancel(999), CancelOutcome::NotFound);
    }

    #[test]
    fn cancel_after_completion_reports_terminal_status() {
        let mgr = manager(1);
        let mut sink = VecSink::default();
        mgr.submit(9, &QueryFilter::default(), 1, &mut sink).unwrap();
        assert_eq!(
            mgr.cancel(9),
            CancelOutcome::AlreadyTerminal(RequestStatus::Completed)
        );
    }

    #[test]
    fn failed_aggregation_surfaces_failed_status() {
        let mgr = RequestManager::new(Arc::new(FailingExecutor));
        let mut sink = VecSink::default();
        let err = mgr
            .submit(10, &QueryFilter::default(), 1, &mut sink)
            .unwrap_err();
        assert!(matches!(err, RequestError::Aggregation(_)));
        assert_eq!(mgr.get_status(10).unwrap().status, RequestStatus::Failed);
        assert!(sink.chunks.is_empty());
    }

    #[test]
    fn eviction_of_missing_entry_is_noop() {
        let map = ActiveRequestMap::new();
        assert!(!map.evict(123));
    }
}
