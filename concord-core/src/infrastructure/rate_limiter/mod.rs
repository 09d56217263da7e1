//! Rate Limiting Module
//!
//! Fixed-window command throttling shared by every cluster:
//! - Atomic increment-and-expire windows in the shared store
//! - Guild, channel, user and global tiers checked in a fixed order
//! - Leaky-bucket local fallback while the store is failing
//! - Optional global limit growth under sustained load

pub mod fallback;
pub mod service;
pub mod types;
pub mod window;

pub use fallback::{LeakyBucket, LocalFallbackLimiter};
pub use service::RateLimiterService;
pub use types::{RateLimitResult, Scope, ScopeTier, WindowUsage};
pub use window::WindowLimiter;
