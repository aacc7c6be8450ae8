//! Relay tunnel process supervisor.
//!
//! Owns one relay CLI subprocess per active tunnel. Each start spawns three
//! tasks: a stdout reader, a stderr reader and a waiter that reaps the
//! process. Readers classify lines into status/error events; the waiter
//! removes the tunnel from the active set and then closes its queues.
//!
//! Lock discipline: the tunnel map lock is only held for membership changes
//! and is never held across I/O or while awaiting a task. Each tunnel's log
//! buffer has its own lock.

use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::RwLock;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{self, EventPublisher};

use super::classifier::{Classification, OutputStream, classify, log_entry};
use super::error::TunnelError;
use super::log_buffer::LogBuffer;
use super::port_kill::{PortKiller, platform_port_killer};
use super::relay::RelayCli;
use super::types::{TunnelEvents, TunnelId, TunnelSpec, TunnelStatus};

/// Returned by [`TunnelSupervisor::get_logs`] for tunnels that are not running.
pub const NOT_RUNNING_PLACEHOLDER: &str = "Tunnel not running";

/// How long the waiter lets readers drain output after the process exits.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Supervisor for relay tunnel subprocesses.
pub struct TunnelSupervisor {
    /// Active tunnels keyed by caller-assigned identity.
    tunnels: Arc<RwLock<HashMap<TunnelId, TunnelHandle>>>,
    relay: RelayCli,
    port_killer: Arc<dyn PortKiller>,
    /// How long `stop_tunnel` waits for the process to be reaped.
    terminate_timeout: Duration,
    /// Distinguishes successive tunnels that reuse one identity.
    next_attempt: AtomicU64,
}

struct TunnelHandle {
    attempt: u64,
    pid: Option<u32>,
    cancel: CancellationToken,
    logs: Arc<RwLock<LogBuffer>>,
    local_port: u16,
    waiter: JoinHandle<()>,
}

/// Everything a reader task needs.
struct StreamReader {
    id: TunnelId,
    stream: OutputStream,
    logs: Arc<RwLock<LogBuffer>>,
    status_tx: EventPublisher<TunnelStatus>,
    error_tx: EventPublisher<TunnelError>,
}

/// Everything the waiter task needs.
struct Waiter {
    id: TunnelId,
    attempt: u64,
    child: Child,
    readers: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
    tunnels: Arc<RwLock<HashMap<TunnelId, TunnelHandle>>>,
    logs: Arc<RwLock<LogBuffer>>,
    status_tx: EventPublisher<TunnelStatus>,
    error_tx: EventPublisher<TunnelError>,
}

impl TunnelSupervisor {
    /// Create a supervisor using the platform's port killer.
    pub fn new(relay: RelayCli) -> Self {
        Self::with_options(relay, platform_port_killer(), Duration::from_secs(5))
    }

    /// Create a supervisor with full configuration.
    pub fn with_options(
        relay: RelayCli,
        port_killer: Arc<dyn PortKiller>,
        terminate_timeout: Duration,
    ) -> Self {
        Self {
            tunnels: Arc::new(RwLock::new(HashMap::new())),
            relay,
            port_killer,
            terminate_timeout,
            next_attempt: AtomicU64::new(0),
        }
    }

    /// Spawn the relay CLI for `spec` under identity `id`.
    ///
    /// A `Connecting` status is queued before any output is read. The
    /// returned queues close once the process has exited and `id` has been
    /// released.
    #[allow(clippy::significant_drop_tightening)]
    pub async fn start_tunnel(
        &self,
        id: TunnelId,
        spec: &TunnelSpec,
    ) -> Result<TunnelEvents, TunnelError> {
        // Held until the handle is inserted so two starts cannot race.
        let mut tunnels = self.tunnels.write().await;
        if tunnels.contains_key(&id) {
            return Err(TunnelError::AlreadyRunning { id });
        }

        let mut cmd = self.relay.tunnel_command(spec);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(
            tunnel_id = id,
            relay = %spec.relay_name,
            target = %spec.target_id,
            local_port = spec.local_port,
            remote_port = spec.remote_port,
            "Spawning relay tunnel"
        );
        let mut child = cmd.spawn().map_err(|e| TunnelError::SpawnFailure {
            reason: e.to_string(),
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TunnelError::SpawnFailure {
                reason: "failed to create stdout pipe".to_string(),
            })?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TunnelError::SpawnFailure {
                reason: "failed to create stderr pipe".to_string(),
            })?;

        let (status_tx, status_rx) = events::channel("tunnel-status");
        let (error_tx, error_rx) = events::channel("tunnel-error");
        let logs = Arc::new(RwLock::new(LogBuffer::default()));
        let cancel = CancellationToken::new();
        let attempt = self.next_attempt.fetch_add(1, Ordering::Relaxed);
        let pid = child.id();

        status_tx.publish(TunnelStatus::Connecting);

        let readers = vec![
            tokio::spawn(
                StreamReader {
                    id,
                    stream: OutputStream::Stdout,
                    logs: Arc::clone(&logs),
                    status_tx: status_tx.clone(),
                    error_tx: error_tx.clone(),
                }
                .run(stdout),
            ),
            tokio::spawn(
                StreamReader {
                    id,
                    stream: OutputStream::Stderr,
                    logs: Arc::clone(&logs),
                    status_tx: status_tx.clone(),
                    error_tx: error_tx.clone(),
                }
                .run(stderr),
            ),
        ];

        let waiter = tokio::spawn(
            Waiter {
                id,
                attempt,
                child,
                readers,
                cancel: cancel.clone(),
                tunnels: Arc::clone(&self.tunnels),
                logs: Arc::clone(&logs),
                status_tx,
                error_tx,
            }
            .run(),
        );

        tunnels.insert(
            id,
            TunnelHandle {
                attempt,
                pid,
                cancel,
                logs,
                local_port: spec.local_port,
                waiter,
            },
        );

        Ok(TunnelEvents {
            status: status_rx,
            errors: error_rx,
        })
    }

    /// Stop tunnel `id` and release its identity.
    pub async fn stop_tunnel(&self, id: TunnelId) -> Result<(), TunnelError> {
        let handle = self
            .tunnels
            .write()
            .await
            .remove(&id)
            .ok_or(TunnelError::NotRunning { id })?;
        handle
            .shutdown(id, self.port_killer.as_ref(), self.terminate_timeout)
            .await;
        Ok(())
    }

    /// Snapshot of the tunnel's recent output, or a one-line placeholder if
    /// it is not running.
    pub async fn get_logs(&self, id: TunnelId) -> Vec<String> {
        let logs = self
            .tunnels
            .read()
            .await
            .get(&id)
            .map(|h| Arc::clone(&h.logs));
        match logs {
            Some(logs) => logs.read().await.snapshot(),
            None => vec![NOT_RUNNING_PLACEHOLDER.to_string()],
        }
    }

    /// Stop every active tunnel. Failures are logged, not returned.
    ///
    /// Tunnels are shut down concurrently, so the whole call is bounded by
    /// one `terminate_timeout` plus the slowest port kill.
    pub async fn stop_all(&self) {
        let handles: Vec<(TunnelId, TunnelHandle)> =
            self.tunnels.write().await.drain().collect();

        let mut stopping = JoinSet::new();
        for (id, handle) in handles {
            let port_killer = Arc::clone(&self.port_killer);
            let terminate_timeout = self.terminate_timeout;
            stopping.spawn(async move {
                handle
                    .shutdown(id, port_killer.as_ref(), terminate_timeout)
                    .await;
            });
        }
        while let Some(result) = stopping.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Error stopping tunnel");
            }
        }
    }

    /// Whether a handle exists for `id`.
    pub async fn is_running(&self, id: TunnelId) -> bool {
        self.tunnels.read().await.contains_key(&id)
    }

    /// Number of active tunnels.
    pub async fn active_count(&self) -> usize {
        self.tunnels.read().await.len()
    }
}

impl TunnelHandle {
    /// Cancel the process, free its local port and wait for it to be reaped.
    async fn shutdown(
        self,
        id: TunnelId,
        port_killer: &dyn PortKiller,
        terminate_timeout: Duration,
    ) {
        info!(tunnel_id = id, pid = ?self.pid, "Stopping tunnel");
        self.cancel.cancel();

        if let Err(e) = port_killer.kill_listener(self.local_port).await {
            warn!(tunnel_id = id, port = self.local_port, error = %e, "Port-based kill failed");
            self.logs
                .write()
                .await
                .push(format!("[WARN] Failed to kill process by port: {e}"));
        }

        let mut waiter = self.waiter;
        if tokio::time::timeout(terminate_timeout, &mut waiter)
            .await
            .is_err()
        {
            warn!(tunnel_id = id, "Timeout waiting for tunnel process to exit");
        }
    }
}

impl StreamReader {
    async fn run(self, pipe: impl AsyncRead + Unpin) {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    self.handle_line(line.trim_end_matches(['\n', '\r'])).await;
                }
                Err(e) => {
                    debug!(tunnel_id = self.id, stream = ?self.stream, error = %e, "Read error");
                    break;
                }
            }
        }
        debug!(tunnel_id = self.id, stream = ?self.stream, "Reader finished");
    }

    async fn handle_line(&self, line: &str) {
        debug!(tunnel_id = self.id, stream = ?self.stream, "{}", line);
        self.logs.write().await.push(log_entry(line, self.stream));

        match classify(line, self.stream) {
            Some(Classification::Status(status)) => {
                self.status_tx.publish(status);
            }
            Some(Classification::Error(message)) => {
                self.error_tx.publish(TunnelError::ClassifiedError(message));
            }
            None => {}
        }
    }
}

impl Waiter {
    async fn run(mut self) {
        let (exit, stopped) = tokio::select! {
            exit = self.child.wait() => (exit, false),
            () = self.cancel.cancelled() => {
                if let Err(e) = self.child.start_kill() {
                    debug!(tunnel_id = self.id, error = %e, "Kill failed, process already gone");
                }
                (self.child.wait().await, true)
            }
        };

        for reader in &mut self.readers {
            if tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut *reader)
                .await
                .is_err()
            {
                reader.abort();
            }
        }

        // Release the identity before anything is reported.
        {
            let mut tunnels = self.tunnels.write().await;
            if tunnels.get(&self.id).is_some_and(|h| h.attempt == self.attempt) {
                tunnels.remove(&self.id);
            }
        }

        self.report(exit, stopped).await;
        // Dropping the publishers here closes both queues.
    }

    async fn report(&self, exit: std::io::Result<ExitStatus>, stopped: bool) {
        match exit {
            Ok(status) if status.success() || stopped => {
                info!(tunnel_id = self.id, ?status, stopped, "Tunnel process exited");
                self.status_tx.publish(TunnelStatus::Inactive);
            }
            Ok(status) => {
                warn!(tunnel_id = self.id, ?status, "Tunnel process exited abnormally");
                self.logs
                    .write()
                    .await
                    .push(format!("[ERR] Process exited: {status}"));
                self.error_tx.publish(TunnelError::ProcessExit { status });
                self.status_tx.publish(TunnelStatus::Error);
            }
            Err(e) => {
                warn!(tunnel_id = self.id, error = %e, "Failed to wait for tunnel process");
                self.error_tx.publish(TunnelError::WaitFailure {
                    reason: e.to_string(),
                });
                self.status_tx.publish(TunnelStatus::Error);
            }
        }
    }
}
