//! Tunnel supervisor error types.

use std::process::ExitStatus;

use super::types::TunnelId;

/// Errors from tunnel operations.
///
/// The first three are returned synchronously by the triggering call. The
/// rest only ever travel on a tunnel's error queue.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("tunnel {id} already running")]
    AlreadyRunning { id: TunnelId },

    #[error("tunnel {id} not running")]
    NotRunning { id: TunnelId },

    #[error("failed to start tunnel: {reason}")]
    SpawnFailure { reason: String },

    #[error("failed to wait for tunnel process: {reason}")]
    WaitFailure { reason: String },

    #[error("tunnel process exited: {status}")]
    ProcessExit { status: ExitStatus },

    #[error("{0}")]
    ClassifiedError(String),
}
