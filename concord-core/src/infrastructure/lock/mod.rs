//! Distributed Lock Module
//!
//! Token-owned locks in the shared store with background renewal:
//! - Blocking and non-blocking acquisition with a bounded wait
//! - Compare-and-extend renewal with health reporting
//! - Compare-and-delete release, also on drop and panic
//! - Per-process registry of held locks

pub mod distributed;
pub mod guard;
pub mod manager;
pub mod types;

pub use distributed::DistributedLock;
pub use guard::{LockGuard, LockLease};
pub use manager::{HeldLock, HeldLocks, LockManager};
pub use types::{LockConfig, LockHealth};
