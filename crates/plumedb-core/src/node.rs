//! Node service: one instance per process at every tier of the query
//! tree.
//!
//! Handling an internal query means evaluating the filter against the
//! local partition, scattering the identical call to each child, and
//! appending whatever comes back. A child that fails or times out is
//! logged and contributes zero records; the reply still goes out with
//! `is_complete = true` so no ancestor ever blocks on a single failure.

use crate::filter::{evaluate, QueryFilter};
use crate::store::PartitionStore;
use crate::types::{Measurement, NodeReply, QueryChunk, RequestId};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("io: {0}")]
    Io(String),
    #[error("encode: {0}")]
    Encode(String),
    #[error("decode: {0}")]
    Decode(String),
    #[error("remote error: {0}")]
    Remote(String),
    #[error("internal: {0}")]
    Internal(String),
}

/// Transport settings for child calls. One attempt per child, no retry;
/// a timeout counts as a failed child.
#[derive(Debug, Clone)]
pub struct FanoutConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub max_frame_len: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(500),
            read_timeout: Duration::from_millis(10_000),
            max_frame_len: 64 * 1024 * 1024,
        }
    }
}

/// Runs one logical query to completion and returns the merged reply.
/// Implemented by [`NodeService`]; test doubles stand in for it when
/// exercising the lifecycle layer.
pub trait QueryExecutor: Send + Sync {
    fn execute(&self, filter: &QueryFilter, request_id: RequestId) -> Result<NodeReply, NodeError>;
}

// ============================================================================
// Wire shapes for the child call
// ============================================================================

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ChildRequest<'a> {
    InternalQuery {
        request_id: RequestId,
        filter: &'a QueryFilter,
    },
}

#[derive(Deserialize)]
struct RawChildReply {
    status: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    responding_node_id: String,
    #[serde(default)]
    records: Vec<Measurement>,
    #[serde(default)]
    is_complete: bool,
}

// ============================================================================
// Node Service
// ============================================================================

/// One node in the fan-out tree. Owns handles to its children, never
/// their processes.
pub struct NodeService {
    node_id: String,
    store: Arc<PartitionStore>,
    children: Vec<SocketAddr>,
    config: FanoutConfig,
}

impl NodeService {
    pub fn new(node_id: String, store: Arc<PartitionStore>, children: Vec<SocketAddr>) -> Self {
        Self {
            node_id,
            store,
            children,
            config: FanoutConfig::default(),
        }
    }

    pub fn with_config(mut self, config: FanoutConfig) -> Self {
        self.config = config;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn store(&self) -> &PartitionStore {
        &self.store
    }

    /// Evaluate the filter locally, fan out to children, merge. Always
    /// replies; unreachable children are partial-result omissions, not
    /// errors.
    pub fn handle_internal_query(&self, filter: &QueryFilter, request_id: RequestId) -> NodeReply {
        let positions = evaluate(&self.store, filter);
        let mut records: Vec<Measurement> = positions
            .iter()
            .map(|&pos| self.store.record_at(pos))
            .collect();
        debug!(
            node_id = %self.node_id,
            request_id,
            local_matches = records.len(),
            children = self.children.len(),
            "internal query evaluated"
        );

        if !self.children.is_empty() {
            let replies: Vec<(SocketAddr, Result<NodeReply, NodeError>)> = self
                .children
                .par_iter()
                .map(|addr| (*addr, self.call_child(*addr, filter, request_id)))
                .collect();

            for (addr, outcome) in replies {
                match outcome {
                    Ok(reply) => {
                        debug!(
                            node_id = %self.node_id,
                            request_id,
                            child = %addr,
                            child_node_id = %reply.responding_node_id,
                            child_records = reply.records.len(),
                            "child reply merged"
                        );
                        records.extend(reply.records);
                    }
                    Err(e) => {
                        warn!(
                            node_id = %self.node_id,
                            request_id,
                            child = %addr,
                            error = %e,
                            "child query failed; omitting its contribution"
                        );
                    }
                }
            }
        }

        NodeReply {
            responding_node_id: self.node_id.clone(),
            records,
            is_complete: true,
        }
    }

    /// Non-root nodes do not serve clients. Defined for protocol
    /// completeness only: an empty, final chunk.
    pub fn handle_direct_client_query(&self, request_id: RequestId) -> QueryChunk {
        QueryChunk {
            request_id,
            chunk_index: 0,
            is_last_chunk: true,
            total_chunks: 0,
            total_results: 0,
            records: Vec::new(),
        }
    }

    fn call_child(
        &self,
        addr: SocketAddr,
        filter: &QueryFilter,
        request_id: RequestId,
    ) -> Result<NodeReply, NodeError> {
        let mut stream = TcpStream::connect_timeout(&addr, self.config.connect_timeout)
            .map_err(|e| NodeError::Io(format!("connect to {addr}: {e}")))?;
        stream.set_read_timeout(Some(self.config.read_timeout)).ok();
        stream.set_write_timeout(Some(Duration::from_secs(5))).ok();

        let req = ChildRequest::InternalQuery { request_id, filter };
        let req_bytes =
            serde_json::to_vec(&req).map_err(|e| NodeError::Encode(format!("request: {e}")))?;

        stream
            .write_all(&(req_bytes.len() as u32).to_be_bytes())
            .map_err(|e| NodeError::Io(format!("write len: {e}")))?;
        stream
            .write_all(&req_bytes)
            .map_err(|e| NodeError::Io(format!("write payload: {e}")))?;

        let mut len_buf = [0u8; 4];
        stream
            .read_exact(&mut len_buf)
            .map_err(|e| NodeError::Io(format!("read len: {e}")))?;
        let resp_len = u32::from_be_bytes(len_buf) as usize;
        if resp_len == 0 || resp_len > self.config.max_frame_len {
            return Err(NodeError::Decode(format!("invalid frame length {resp_len}")));
        }

        let mut resp_buf = vec![0u8; resp_len];
        stream
            .read_exact(&mut resp_buf)
            .map_err(|e| NodeError::Io(format!("read payload: {e}")))?;

        let raw: RawChildReply = serde_json::from_slice(&resp_buf)
            .map_err(|e| NodeError::Decode(format!("reply: {e}")))?;

        if raw.status != "ok" {
            return Err(NodeError::Remote(
                raw.error.unwrap_or_else(|| "unknown remote error".into()),
            ));
        }

        Ok(NodeReply {
            responding_node_id: raw.responding_node_id,
            records: raw.records,
            is_complete: raw.is_complete,
        })
    }
}

impl QueryExecutor for NodeService {
    fn execute(&self, filter: &QueryFilter, request_id: RequestId) -> Result<NodeReply, NodeError> {
        Ok(self.handle_internal_query(filter, request_id))
    }
}
