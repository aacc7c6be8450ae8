//! Tunnel types shared by the supervisor and its consumers.

use std::fmt;

use tokio::sync::mpsc;

use super::error::TunnelError;

/// Numeric identity of a tunnel, assigned by the caller.
pub type TunnelId = usize;

/// Everything needed to open one tunnel through the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    /// Name of the bastion relay.
    pub relay_name: String,
    /// Resource group of the bastion relay.
    pub relay_group: String,
    /// Subscription of the bastion relay, if not the CLI default.
    pub relay_subscription: Option<String>,
    /// Resource identity of the target machine.
    pub target_id: String,
    /// Port on the target machine.
    pub remote_port: u16,
    /// Port bound on this machine.
    pub local_port: u16,
}

/// Connection state of a tunnel.
///
/// `Inactive -> Starting -> Connecting -> Active <-> Connecting -> Inactive | Error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelStatus {
    Inactive,
    Starting,
    Connecting,
    Active,
    Error,
}

impl TunnelStatus {
    /// Display label for the presentation layer.
    pub const fn label(self) -> &'static str {
        match self {
            Self::Inactive => "Inactive",
            Self::Starting => "Starting",
            Self::Connecting => "Connecting...",
            Self::Active => "Active",
            Self::Error => "Error",
        }
    }
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Receiving halves of a tunnel's event queues.
///
/// Both queues are bounded and lossy (see [`crate::events`]) and both close
/// once the tunnel process has exited and been removed from the supervisor.
#[derive(Debug)]
pub struct TunnelEvents {
    pub status: mpsc::Receiver<TunnelStatus>,
    pub errors: mpsc::Receiver<TunnelError>,
}
