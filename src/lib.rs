//! Concord - Cluster node library
//!
//! Wires the shared store, rate limiter, lock manager and IPC coordinator
//! from concord-core into one running node

mod app;

pub use app::{AppHandle, connect_store, create_app};
pub use concord_core::{Config, init_tracing};

// Re-export for convenience
pub use concord_core;
