//! Relay tunnel supervision.
//!
//! Starts and stops relay CLI subprocesses, turns their output into
//! connection-state events and keeps a short log of what they printed.

pub mod classifier;
pub mod error;
pub mod log_buffer;
pub mod port_kill;
pub mod relay;
pub mod supervisor;
pub mod types;

pub use classifier::{Classification, OutputStream, classify};
pub use error::TunnelError;
pub use log_buffer::{LOG_CAPACITY, LogBuffer};
pub use port_kill::{NoopPortKiller, PortKillError, PortKiller, platform_port_killer};
pub use relay::RelayCli;
pub use supervisor::{NOT_RUNNING_PLACEHOLDER, TunnelSupervisor};
pub use types::{TunnelEvents, TunnelId, TunnelSpec, TunnelStatus};
