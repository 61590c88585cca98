pub mod cleanup;
pub mod filter;
pub mod ingest;
pub mod lifecycle;
pub mod node;
pub mod store;
pub mod topology;
pub mod types;

pub use cleanup::CleanupQueue;
pub use filter::{evaluate, QueryFilter};
pub use ingest::{load_partition, IngestError, IngestReport};
pub use lifecycle::{
    ActiveRequest, ActiveRequestMap, CancelOutcome, ChunkSink, RequestError, RequestManager,
    StatusSnapshot, CLEANUP_DELAY, DEFAULT_CHUNK_SIZE,
};
pub use node::{FanoutConfig, NodeError, NodeService, QueryExecutor};
pub use store::PartitionStore;
pub use topology::{TopologyConfig, TopologyError};
pub use types::{GeoTemporalBounds, Measurement, NodeReply, QueryChunk, RequestId, RequestStatus};
