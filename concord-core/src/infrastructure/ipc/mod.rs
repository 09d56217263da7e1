//! Inter-Process Coordination
//!
//! Pub/sub messaging between clusters sharing one store:
//! - Scatter-gather broadcasts with a deadline
//! - Per-cluster message pump dispatching to registered handlers
//! - Heartbeat records for liveness

pub mod coordinator;
pub mod handler;
pub mod types;

pub use coordinator::ClusterCoordinator;
pub use handler::{FnHandler, HandlerRegistry, IpcHandler};
pub use types::{ClusterId, CoordinatorConfig, IpcEnvelope, IpcResponse};
