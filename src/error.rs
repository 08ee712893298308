//! # Error Taxonomy
//!
//! Every failure the shuffler can surface, grouped by the policy applied to
//! it. Protocol violations, resource-invariant breaks, and store failures are
//! collective-fatal: the caller aborts the process group because the
//! partitioning invariant is global. Transport errors surface to the
//! foreground writer; configuration errors are fatal at init.

use thiserror::Error;

/// Errors produced by the shuffle core.
#[derive(Debug, Error)]
pub enum ShuffleError {
    /// A peer sent a frame the protocol cannot accept. Continuing would
    /// corrupt the partitioning, so the group must abort.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// An out-of-bounds buffer overflowed in a state where the record would
    /// be dropped. The `Blocked` state is supposed to make this unreachable.
    #[error("oob buffer full: {0}")]
    OobFull(String),

    /// Rejected configuration at init.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A record that does not match the run-fixed layout.
    #[error("invalid record: {0}")]
    Record(String),

    /// The transport failed to accept an outbound frame. Surfaced to the
    /// caller; the group keeps running.
    #[error("transport: {0}")]
    Transport(String),

    /// The downstream store rejected a delivered record. Stored-data
    /// integrity can no longer be verified, so the group must abort.
    #[error("store write failed: {0}")]
    Store(String),

    /// The engine is shutting down and can no longer make progress.
    #[error("engine shut down: {0}")]
    Shutdown(String),
}

impl ShuffleError {
    /// Whether this error requires a collective abort of the process group.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ShuffleError::Protocol(_)
                | ShuffleError::OobFull(_)
                | ShuffleError::Config(_)
                | ShuffleError::Store(_)
        )
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        ShuffleError::Protocol(msg.into())
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        ShuffleError::Config(msg.into())
    }
}
