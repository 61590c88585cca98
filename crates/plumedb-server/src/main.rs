//! plumedb node server.
//!
//! One binary serves every tier of the query tree. Each node loads its
//! partition and answers `internal_query` calls; the node configured as
//! the root also fronts clients with streaming `query` plus `get_status`
//! and `cancel`.
//!
//! Wire protocol: `[u32 BE length][JSON]` frames. A streaming query
//! response is a header frame, one frame per chunk, then an empty frame
//! as end-of-stream sentinel.

use clap::Parser;
use plumedb_core::{
    load_partition, CancelOutcome, ChunkSink, FanoutConfig, NodeService, QueryChunk, QueryFilter,
    RequestError, RequestManager, TopologyConfig,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;
const DEFAULT_IO_TIMEOUT_MILLIS: u64 = 30_000;

#[derive(Parser, Debug)]
#[command(name = "plumedb-server")]
#[command(about = "Air-quality query node (root, aggregator, or leaf)")]
struct Args {
    /// Path to this node's topology descriptor (JSON)
    config: PathBuf,

    /// Maximum concurrent connections
    #[arg(long, default_value_t = 256)]
    max_conns: usize,

    /// Per-frame io timeout in milliseconds
    #[arg(long, default_value_t = DEFAULT_IO_TIMEOUT_MILLIS)]
    io_timeout_ms: u64,

    /// Maximum frame length in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_LEN)]
    max_frame_bytes: usize,

    /// Child connect timeout in milliseconds
    #[arg(long, default_value_t = 500)]
    connect_timeout_ms: u64,

    /// Child read timeout in milliseconds
    #[arg(long, default_value_t = 10_000)]
    read_timeout_ms: u64,

    /// Records per chunk when the client sends no hint
    #[arg(long, default_value_t = 1000)]
    chunk_size: usize,
}

#[derive(Debug, Error)]
enum ServerError {
    #[error("io: {0}")]
    Io(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("encode: {0}")]
    Encode(String),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Query {
        request_id: u64,
        #[serde(default)]
        filter: QueryFilter,
        #[serde(default)]
        max_results_per_chunk: u32,
    },
    GetStatus {
        request_id: u64,
    },
    Cancel {
        request_id: u64,
    },
    InternalQuery {
        request_id: u64,
        #[serde(default)]
        filter: QueryFilter,
    },
    Health,
}

struct ServerContext {
    node: Arc<NodeService>,
    manager: Option<Arc<RequestManager>>,
    io_timeout: Duration,
    max_frame_len: usize,
}

/// Bridges the lifecycle manager's synchronous chunk loop to the async
/// connection writer. A closed channel means the client side is gone.
struct ChannelSink {
    tx: mpsc::UnboundedSender<QueryChunk>,
}

impl ChunkSink for ChannelSink {
    fn send(&mut self, chunk: &QueryChunk) -> bool {
        self.tx.send(chunk.clone()).is_ok()
    }

    fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let log_format = std::env::var("PLUMEDB_LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(tracing::Level::INFO.into()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(tracing::Level::INFO.into()),
            )
            .init();
    }

    let args = Args::parse();
    let topology = TopologyConfig::from_file(&args.config)?;

    let (store, report) = load_partition(&topology.data_dir)?;
    info!(
        node_id = %topology.node_id,
        files = report.files_read,
        rows = report.rows_loaded,
        skipped = report.rows_skipped,
        "partition ready"
    );

    let fanout = FanoutConfig {
        connect_timeout: Duration::from_millis(args.connect_timeout_ms),
        read_timeout: Duration::from_millis(args.read_timeout_ms),
        max_frame_len: args.max_frame_bytes,
    };
    let node = Arc::new(
        NodeService::new(
            topology.node_id.clone(),
            Arc::new(store),
            topology.children.clone(),
        )
        .with_config(fanout),
    );

    let manager = if topology.root {
        Some(Arc::new(
            RequestManager::new(node.clone()).with_default_chunk_size(args.chunk_size),
        ))
    } else {
        None
    };

    let ctx = Arc::new(ServerContext {
        node,
        manager,
        io_timeout: Duration::from_millis(args.io_timeout_ms),
        max_frame_len: args.max_frame_bytes,
    });

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(topology, args.max_conns, ctx))
}

async fn run(
    topology: TopologyConfig,
    max_conns: usize,
    ctx: Arc<ServerContext>,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(&topology.bind_addr)
        .await
        .map_err(|e| format!("bind {} failed: {e}", topology.bind_addr))?;

    info!(
        node_id = %topology.node_id,
        bind_addr = %topology.bind_addr,
        root = topology.root,
        children = topology.children.len(),
        "plumedb-server started"
    );
    println!(
        "plumedb-server {} listening on {} (root={}, children={})",
        topology.node_id,
        topology.bind_addr,
        topology.root,
        topology.children.len()
    );

    let limiter = Arc::new(Semaphore::new(max_conns));
    let shutdown = Arc::new(tokio::sync::Notify::new());
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received SIGINT, shutting down");
            shutdown_signal.notify_one();
        }
    });

    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let Ok(permit) = limiter.clone().acquire_owned().await else {
                    break;
                };
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = handle_conn(stream, ctx).await {
                        debug!(peer = %peer, error = %e, "connection closed with error");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn handle_conn(mut stream: TcpStream, ctx: Arc<ServerContext>) -> Result<(), ServerError> {
    loop {
        let req_bytes = match read_frame(&mut stream, ctx.io_timeout, ctx.max_frame_len).await? {
            Some(bytes) => bytes,
            None => return Ok(()),
        };

        let request: Request = match serde_json::from_slice(&req_bytes) {
            Ok(r) => r,
            Err(e) => {
                let reply = json!({"status": "error", "error": format!("bad request: {e}")});
                write_framed_json(&mut stream, &reply, ctx.io_timeout, ctx.max_frame_len).await?;
                continue;
            }
        };

        match request {
            Request::Health => {
                let reply = json!({
                    "status": "ok",
                    "node_id": ctx.node.node_id(),
                    "record_count": ctx.node.store().len(),
                    "root": ctx.manager.is_some(),
                });
                write_framed_json(&mut stream, &reply, ctx.io_timeout, ctx.max_frame_len).await?;
            }
            Request::GetStatus { request_id } => {
                let reply = match &ctx.manager {
                    None => json!({"status": "error", "error": "not a coordinator"}),
                    Some(manager) => match manager.get_status(request_id) {
                        Some(snap) => json!({
                            "status": snap.status.to_string(),
                            "request_id": request_id,
                            "chunks_delivered": snap.chunks_delivered,
                            "total_chunks": snap.total_chunks,
                        }),
                        None => json!({"status": "not_found", "request_id": request_id}),
                    },
                };
                write_framed_json(&mut stream, &reply, ctx.io_timeout, ctx.max_frame_len).await?;
            }
            Request::Cancel { request_id } => {
                let reply = match &ctx.manager {
                    None => json!({"status": "error", "error": "not a coordinator"}),
                    Some(manager) => match manager.cancel(request_id) {
                        CancelOutcome::Cancelled => {
                            json!({"status": "cancelled", "request_id": request_id})
                        }
                        CancelOutcome::AlreadyTerminal(status) => {
                            json!({"status": status.to_string(), "request_id": request_id})
                        }
                        CancelOutcome::NotFound => {
                            json!({"status": "not_found", "request_id": request_id})
                        }
                    },
                };
                write_framed_json(&mut stream, &reply, ctx.io_timeout, ctx.max_frame_len).await?;
            }
            Request::InternalQuery { request_id, filter } => {
                let node = ctx.node.clone();
                let reply =
                    tokio::task::spawn_blocking(move || node.handle_internal_query(&filter, request_id))
                        .await;
                let frame = match reply {
                    Ok(reply) => json!({
                        "status": "ok",
                        "responding_node_id": reply.responding_node_id,
                        "records": reply.records,
                        "is_complete": reply.is_complete,
                    }),
                    Err(e) => {
                        error!(request_id, error = %e, "internal query worker failed");
                        json!({"status": "error", "error": "internal: query worker failed"})
                    }
                };
                write_framed_json(&mut stream, &frame, ctx.io_timeout, ctx.max_frame_len).await?;
            }
            Request::Query {
                request_id,
                filter,
                max_results_per_chunk,
            } => {
                process_query(&mut stream, &ctx, request_id, filter, max_results_per_chunk)
                    .await?;
            }
        }
    }
}

async fn process_query(
    stream: &mut TcpStream,
    ctx: &ServerContext,
    request_id: u64,
    filter: QueryFilter,
    max_results_per_chunk: u32,
) -> Result<(), ServerError> {
    let Some(manager) = &ctx.manager else {
        // Non-root tiers do not serve clients: an empty, final chunk.
        let header = json!({"status": "ok", "streaming": true});
        write_framed_json(stream, &header, ctx.io_timeout, ctx.max_frame_len).await?;
        let chunk = ctx.node.handle_direct_client_query(request_id);
        write_framed_json(stream, &chunk, ctx.io_timeout, ctx.max_frame_len).await?;
        write_frame_bytes(stream, &[], ctx.io_timeout, ctx.max_frame_len).await?;
        return Ok(());
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<QueryChunk>();
    let manager = manager.clone();
    let join = tokio::task::spawn_blocking(move || {
        let mut sink = ChannelSink { tx };
        manager.submit(request_id, &filter, max_results_per_chunk, &mut sink)
    });

    match rx.recv().await {
        Some(first) => {
            let header = json!({"status": "ok", "streaming": true});
            write_framed_json(stream, &header, ctx.io_timeout, ctx.max_frame_len).await?;
            write_framed_json(stream, &first, ctx.io_timeout, ctx.max_frame_len).await?;
            while let Some(chunk) = rx.recv().await {
                write_framed_json(stream, &chunk, ctx.io_timeout, ctx.max_frame_len).await?;
            }
            match join.await {
                Ok(Ok(snapshot)) => {
                    debug!(request_id, status = %snapshot.status, "query stream finished")
                }
                Ok(Err(e)) => warn!(request_id, error = %e, "query ended abnormally"),
                Err(e) => error!(request_id, error = %e, "query worker failed"),
            }
            write_frame_bytes(stream, &[], ctx.io_timeout, ctx.max_frame_len).await?;
        }
        None => {
            // No chunk ever arrived: empty result, stopped before the
            // first emission, or a pre-stream failure.
            match join.await {
                Ok(Ok(snapshot)) => {
                    let header = json!({"status": "ok", "streaming": true});
                    write_framed_json(stream, &header, ctx.io_timeout, ctx.max_frame_len).await?;
                    write_frame_bytes(stream, &[], ctx.io_timeout, ctx.max_frame_len).await?;
                    debug!(request_id, status = %snapshot.status, "query stream finished empty");
                }
                Ok(Err(e @ RequestError::Duplicate(_))) => {
                    let reply = json!({"status": "error", "error": e.to_string()});
                    write_framed_json(stream, &reply, ctx.io_timeout, ctx.max_frame_len).await?;
                }
                Ok(Err(e)) => {
                    let reply = json!({"status": "failed", "error": e.to_string()});
                    write_framed_json(stream, &reply, ctx.io_timeout, ctx.max_frame_len).await?;
                }
                Err(e) => {
                    error!(request_id, error = %e, "query worker failed");
                    let reply = json!({"status": "error", "error": "internal: query worker failed"});
                    write_framed_json(stream, &reply, ctx.io_timeout, ctx.max_frame_len).await?;
                }
            }
        }
    }
    Ok(())
}

async fn read_frame(
    stream: &mut (impl AsyncRead + Unpin),
    timeout_dur: Duration,
    max_frame_len: usize,
) -> Result<Option<Vec<u8>>, ServerError> {
    let mut len_buf = [0u8; 4];
    match timeout(timeout_dur, stream.read_exact(&mut len_buf)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Ok(Err(e)) => return Err(ServerError::Io(format!("read length failed: {e}"))),
        Err(_) => return Err(ServerError::Timeout("read length timeout".into())),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > max_frame_len {
        return Err(ServerError::BadRequest("invalid frame length".into()));
    }
    let mut buf = vec![0u8; len];
    match timeout(timeout_dur, stream.read_exact(&mut buf)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Ok(Err(e)) => return Err(ServerError::Io(format!("read payload failed: {e}"))),
        Err(_) => return Err(ServerError::Timeout("read payload timeout".into())),
    }
    Ok(Some(buf))
}

async fn write_framed_json(
    stream: &mut (impl AsyncWrite + Unpin),
    value: &impl Serialize,
    timeout_dur: Duration,
    max_frame_len: usize,
) -> Result<(), ServerError> {
    let bytes = serde_json::to_vec(value).map_err(|e| ServerError::Encode(format!("json: {e}")))?;
    if bytes.len() > max_frame_len {
        return Err(ServerError::BadRequest("frame too large".into()));
    }
    timeout(timeout_dur, async {
        stream
            .write_all(&(bytes.len() as u32).to_be_bytes())
            .await?;
        stream.write_all(&bytes).await
    })
    .await
    .map_err(|_| ServerError::Timeout("write timeout".into()))?
    .map_err(|e| ServerError::Io(format!("write failed: {e}")))
}

async fn write_frame_bytes(
    stream: &mut (impl AsyncWrite + Unpin),
    bytes: &[u8],
    timeout_dur: Duration,
    max_frame_len: usize,
) -> Result<(), ServerError> {
    if bytes.len() > max_frame_len {
        return Err(ServerError::BadRequest("frame too large".into()));
    }
    timeout(timeout_dur, async {
        stream
            .write_all(&(bytes.len() as u32).to_be_bytes())
            .await?;
        stream.write_all(bytes).await
    })
    .await
    .map_err(|_| ServerError::Timeout("write timeout".into()))?
    .map_err(|e| ServerError::Io(format!("write failed: {e}")))
}
