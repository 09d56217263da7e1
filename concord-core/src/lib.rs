//! Concord Core - coordination primitives for cooperating bot processes
//!
//! Every process ("cluster") of a sharded bot connects to the same
//! Redis-compatible store; this crate builds rate limiting, locking and
//! request/response messaging on top of it.
//!
//! # Modules
//!
//! - [`config`] - Strongly-typed configuration with file and environment variable support
//! - [`application`] - Error types shared by every component
//! - [`infrastructure`] - Store backends, rate limiter, distributed lock and cluster IPC
//! - [`logging`] - Structured logging with tracing
//!
//! # Architecture
//!
//! ```text
//! concord-core/
//! ├── application/      # Error taxonomy
//! ├── infrastructure/
//! │   ├── store/        # KeyValueStore trait, Redis and in-memory backends
//! │   ├── rate_limiter/ # Fixed windows, tiers, local fallback
//! │   ├── lock/         # Renewable token-owned locks
//! │   └── ipc/          # Scatter-gather broadcasts and heartbeats
//! └── config/           # Configuration management
//! ```
//!
//! # Configuration
//!
//! ```rust,ignore
//! use concord_core::Config;
//!
//! let config = Config::load()?;
//! ```
//!
//! Environment variables use the `CONCORD__` prefix with double underscore separators:
//!
//! ```bash
//! CONCORD__IPC__CLUSTER_ID=2
//! CONCORD__RATE_LIMIT__TIERS__USER__LIMIT=5
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use concord_core::infrastructure::rate_limiter::RateLimiterService;
//! use concord_core::infrastructure::store::{InMemoryStore, KeyValueStore};
//!
//! let store: Arc<dyn KeyValueStore> = Arc::new(InMemoryStore::new());
//! let limiter = RateLimiterService::new(store, config.rate_limit.clone());
//! let result = limiter.check_all(Some(guild_id), channel_id, user_id).await?;
//! if result.is_limited {
//!     reply(result.user_message()).await;
//! }
//! ```

pub mod application;
pub mod config;
pub mod infrastructure;
pub mod logging;

pub use config::Config;
pub use logging::init_tracing;
