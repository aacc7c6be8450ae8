//! Best-effort termination of whatever process is bound to a local port.
//!
//! On Windows the relay CLI runs under a launcher, so killing the child we
//! spawned can leave the real tunnel process alive and holding the port.
//! There the supervisor follows up by looking the port up in `netstat` and
//! killing its owner. Elsewhere killing the child is enough and the
//! capability is a no-op.

use std::sync::Arc;

use async_trait::async_trait;

/// Capability to kill the listener on a local port.
#[async_trait]
pub trait PortKiller: Send + Sync {
    /// Kill the process listening on `port`. Finding no listener is success.
    async fn kill_listener(&self, port: u16) -> Result<(), PortKillError>;
}

/// Errors from port-based termination.
#[derive(Debug, thiserror::Error)]
pub enum PortKillError {
    #[error("failed to run {program}: {reason}")]
    Command { program: &'static str, reason: String },

    #[error("failed to kill process {pid}: {reason}")]
    Kill { pid: u32, reason: String },
}

/// Does nothing; used where killing the child process is sufficient.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPortKiller;

#[async_trait]
impl PortKiller for NoopPortKiller {
    async fn kill_listener(&self, _port: u16) -> Result<(), PortKillError> {
        Ok(())
    }
}

/// Finds the listener with `netstat -ano` and kills it with `taskkill /F`.
#[cfg(windows)]
#[derive(Debug, Default, Clone, Copy)]
pub struct NetstatPortKiller;

#[cfg(windows)]
#[async_trait]
impl PortKiller for NetstatPortKiller {
    async fn kill_listener(&self, port: u16) -> Result<(), PortKillError> {
        let output = tokio::process::Command::new("netstat")
            .arg("-ano")
            .output()
            .await
            .map_err(|e| PortKillError::Command {
                program: "netstat",
                reason: e.to_string(),
            })?;

        let table = String::from_utf8_lossy(&output.stdout);
        let Some(pid) = find_listening_pid(&table, port) else {
            // Already gone.
            return Ok(());
        };

        tracing::debug!(port, pid, "Killing process bound to tunnel port");
        let status = tokio::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/F"])
            .status()
            .await
            .map_err(|e| PortKillError::Command {
                program: "taskkill",
                reason: e.to_string(),
            })?;
        if !status.success() {
            return Err(PortKillError::Kill {
                pid,
                reason: status.to_string(),
            });
        }
        Ok(())
    }
}

/// The port killer for the platform this binary was built for.
pub fn platform_port_killer() -> Arc<dyn PortKiller> {
    #[cfg(windows)]
    {
        Arc::new(NetstatPortKiller)
    }
    #[cfg(not(windows))]
    {
        Arc::new(NoopPortKiller)
    }
}

/// Find the PID of the loopback TCP listener on `port` in `netstat -ano` output.
///
/// Rows look like
/// `  TCP    127.0.0.1:2222         0.0.0.0:0              LISTENING       23216`.
#[cfg_attr(not(windows), allow(dead_code))]
fn find_listening_pid(netstat: &str, port: u16) -> Option<u32> {
    let local = format!("127.0.0.1:{port}");
    netstat.lines().find_map(|line| {
        let cols: Vec<&str> = line.split_whitespace().collect();
        match cols.as_slice() {
            ["TCP", addr, _, "LISTENING", pid] if *addr == local => pid.parse().ok(),
            _ => None,
        }
    })
}
