//! Error taxonomy for the coordination core

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the shared key-value store
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store could not be reached within the retry budget.
    #[error("Store unreachable after {attempts} attempt(s): {message}")]
    Connectivity { attempts: u32, message: String },

    /// A single command failed (I/O hiccup, server error, wrong type).
    #[error("Store command {command} failed: {message}")]
    Command { command: String, message: String },

    /// An atomic script could not be executed, even after re-registration.
    #[error("Script {script} failed: {message}")]
    Script { script: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn command(command: impl Into<String>, message: impl ToString) -> Self {
        Self::Command {
            command: command.into(),
            message: message.to_string(),
        }
    }

    pub fn script(script: impl Into<String>, message: impl ToString) -> Self {
        Self::Script {
            script: script.into(),
            message: message.to_string(),
        }
    }

    /// Whether the failure is limited to one operation and the store may
    /// still be usable. Connectivity loss is fatal and must reach process
    /// supervision.
    pub fn is_transient(&self) -> bool {
        !matches!(self, StoreError::Connectivity { .. })
    }
}

/// Errors raised by the distributed lock
#[derive(Error, Debug)]
pub enum LockError {
    /// The lock is held by someone else and could not be obtained in time.
    #[error("Could not acquire lock '{name}' within {waited:?}")]
    NotAcquired { name: String, waited: Duration },

    /// Ownership was lost while the critical section was running.
    #[error("Lock '{name}' was lost while held")]
    Lost { name: String },

    #[error("Invalid lock configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LockError {
    /// Message suitable for showing to the end user of an interactive flow
    pub fn user_message(&self) -> &'static str {
        match self {
            LockError::NotAcquired { .. } => "This action is already in progress, try again.",
            LockError::Lost { .. } => "This action was interrupted, please try again.",
            LockError::InvalidConfig(_) | LockError::Store(_) => {
                "Something went wrong, please try again later."
            }
        }
    }
}

/// Errors raised by the cluster coordinator
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to encode IPC message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Coordinator for cluster {0} is already running")]
    AlreadyStarted(u32),
}

/// Error type returned by IPC handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
