pub mod config;
pub mod dispatch;
pub mod error;
pub mod node;
pub mod notify;
pub mod operations;
pub mod pool;
pub mod protocol;
pub mod resource;
pub mod session;
pub mod storage;

pub use config::{
    ApplicationConfig, EncodingConfig, EncodingKey, NodeConfig, PeerSpec, PoolConfig,
    SessionConfig, ShutdownConfig, TransportConfig,
};
pub use error::{ErrorCode, PoolError, Result};
pub use node::{MediaNode, MediaNodeBuilder, RunningNode};
pub use notify::{Notification, Notifier, TracingNotifier};
pub use pool::{MediaPool, QueueKind, ServerMediaPoolCommand};
pub use protocol::{CommandId, KeyPair, RequestContainer, ResponseContainer};
pub use resource::{MediaResourceDescriptor, ResourceCatalog, StaticResourceCatalog};
pub use session::{SessionContainer, SessionRegistry};
pub use storage::{MediaFileRecord, MediaStore, compute_hash};
