//! Pool replication: peer connections, command queues and the engine that
//! converges the pool toward the main server.

pub mod connection;
pub mod engine;
pub mod queue;

pub use connection::{ConnectionContainer, ConnectionManager};
pub use engine::{CycleReport, MediaPool, RemoteMediaFile, RemoteMediaInfo, validate_check_input};
pub use queue::{CommandQueues, CycleBatch, QueueKind, ReplicationQueue, ServerMediaPoolCommand};
