//! Infrastructure Layer - Shared store access and the coordination
//! primitives built on it

pub mod ipc;
pub mod lock;
pub mod rate_limiter;
pub mod store;

pub use ipc::ClusterCoordinator;
pub use lock::{DistributedLock, LockManager};
pub use rate_limiter::RateLimiterService;
pub use store::{InMemoryStore, KeyValueStore, RedisStore};
