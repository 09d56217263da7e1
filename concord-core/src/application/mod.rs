//! Application layer shared types

pub mod errors;

pub use errors::{CoordinatorError, HandlerError, LockError, StoreError};
