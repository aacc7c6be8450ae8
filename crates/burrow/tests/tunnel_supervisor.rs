#![cfg(unix)]
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Integration tests use unwrap for brevity

//! End-to-end tests for the tunnel supervisor against a scripted relay CLI.
//!
//! The relay program is `sh -c <script> relay`, so the tunnel arguments the
//! supervisor appends land in `$1..` and are ignored by the script.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use burrow::tunnel::{
    LOG_CAPACITY, NoopPortKiller, PortKillError, PortKiller, RelayCli, TunnelError, TunnelSpec,
    TunnelStatus, TunnelSupervisor,
};

const WAIT: Duration = Duration::from_secs(10);

fn scripted(script: &str) -> TunnelSupervisor {
    scripted_with_killer(script, Arc::new(NoopPortKiller))
}

fn scripted_with_killer(script: &str, port_killer: Arc<dyn PortKiller>) -> TunnelSupervisor {
    let relay = RelayCli {
        program: "sh".into(),
        base_args: vec!["-c".into(), script.into(), "relay".into()],
    };
    TunnelSupervisor::with_options(relay, port_killer, Duration::from_secs(5))
}

/// Records every port it is asked to free, then fails or sleeps as told.
#[derive(Default)]
struct RecordingKiller {
    ports: Mutex<Vec<u16>>,
    fail: bool,
    delay: Duration,
}

impl RecordingKiller {
    fn ports(&self) -> Vec<u16> {
        self.ports.lock().unwrap().clone()
    }
}

#[async_trait]
impl PortKiller for RecordingKiller {
    async fn kill_listener(&self, port: u16) -> Result<(), PortKillError> {
        self.ports.lock().unwrap().push(port);
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(PortKillError::Kill {
                pid: 4242,
                reason: "access denied".into(),
            });
        }
        Ok(())
    }
}

fn spec(local_port: u16) -> TunnelSpec {
    TunnelSpec {
        relay_name: "hub-bastion".into(),
        relay_group: "HUB-RG".into(),
        relay_subscription: None,
        target_id: "/subscriptions/abc/virtualMachines/web-1".into(),
        remote_port: 22,
        local_port,
    }
}

async fn next<T>(rx: &mut mpsc::Receiver<T>) -> Option<T> {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
}

/// Everything left in the queue, waiting for it to close.
async fn collect_until_closed<T>(rx: &mut mpsc::Receiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Some(item) = next(rx).await {
        out.push(item);
    }
    out
}

const READY_SCRIPT: &str = r#"
echo "Opening tunnel on port 2022"
echo "Tunnel is ready, connect on port 2022"
exec sleep 30
"#;

#[tokio::test]
async fn ready_tunnel_reports_connecting_then_active() {
    let supervisor = scripted(READY_SCRIPT);
    let mut events = supervisor.start_tunnel(1, &spec(2022)).await.unwrap();

    assert_eq!(next(&mut events.status).await, Some(TunnelStatus::Connecting));
    assert_eq!(next(&mut events.status).await, Some(TunnelStatus::Connecting));
    assert_eq!(next(&mut events.status).await, Some(TunnelStatus::Active));
    assert!(supervisor.is_running(1).await);

    let logs = supervisor.get_logs(1).await;
    assert_eq!(
        logs,
        [
            "[OUT] Opening tunnel on port 2022",
            "[OUT] Tunnel is ready, connect on port 2022"
        ]
    );

    supervisor.stop_all().await;
}

#[tokio::test]
async fn second_start_with_same_id_is_rejected_without_side_effects() {
    let supervisor = scripted(READY_SCRIPT);
    let mut events = supervisor.start_tunnel(4, &spec(2022)).await.unwrap();
    assert_eq!(next(&mut events.status).await, Some(TunnelStatus::Connecting));

    let err = supervisor.start_tunnel(4, &spec(2023)).await.unwrap_err();
    assert!(matches!(err, TunnelError::AlreadyRunning { id: 4 }), "got {err:?}");
    assert_eq!(supervisor.active_count().await, 1);

    // The first tunnel keeps going.
    assert_eq!(next(&mut events.status).await, Some(TunnelStatus::Connecting));
    assert_eq!(next(&mut events.status).await, Some(TunnelStatus::Active));

    supervisor.stop_tunnel(4).await.unwrap();
}

#[tokio::test]
async fn stop_releases_id_and_closes_queues() {
    let supervisor = scripted(READY_SCRIPT);
    let mut events = supervisor.start_tunnel(2, &spec(2022)).await.unwrap();
    assert_eq!(next(&mut events.status).await, Some(TunnelStatus::Connecting));

    supervisor.stop_tunnel(2).await.unwrap();
    assert!(!supervisor.is_running(2).await);
    assert_eq!(supervisor.get_logs(2).await, ["Tunnel not running"]);

    let rest = collect_until_closed(&mut events.status).await;
    assert_eq!(rest.last(), Some(&TunnelStatus::Inactive));
    assert!(!rest.contains(&TunnelStatus::Error));
    assert!(collect_until_closed(&mut events.errors).await.is_empty());

    // The id is free again.
    let mut again = supervisor.start_tunnel(2, &spec(2022)).await.unwrap();
    assert_eq!(next(&mut again.status).await, Some(TunnelStatus::Connecting));
    supervisor.stop_tunnel(2).await.unwrap();
    assert!(matches!(
        supervisor.stop_tunnel(2).await,
        Err(TunnelError::NotRunning { id: 2 })
    ));
}

#[tokio::test]
async fn stop_frees_local_port_and_tolerates_killer_failure() {
    let killer = Arc::new(RecordingKiller {
        fail: true,
        ..RecordingKiller::default()
    });
    let supervisor = scripted_with_killer(READY_SCRIPT, Arc::<RecordingKiller>::clone(&killer));
    let mut events = supervisor.start_tunnel(8, &spec(2022)).await.unwrap();
    assert_eq!(next(&mut events.status).await, Some(TunnelStatus::Connecting));

    supervisor.stop_tunnel(8).await.unwrap();
    assert_eq!(killer.ports(), [2022]);
    assert!(!supervisor.is_running(8).await);

    let rest = collect_until_closed(&mut events.status).await;
    assert_eq!(rest.last(), Some(&TunnelStatus::Inactive));
}

#[tokio::test]
async fn stop_all_shuts_tunnels_down_concurrently() {
    let killer = Arc::new(RecordingKiller {
        delay: Duration::from_secs(1),
        ..RecordingKiller::default()
    });
    let supervisor = scripted_with_killer(READY_SCRIPT, Arc::<RecordingKiller>::clone(&killer));
    let mut queues = Vec::new();
    for (id, port) in [(10, 2030), (11, 2031), (12, 2032)] {
        let mut events = supervisor.start_tunnel(id, &spec(port)).await.unwrap();
        assert_eq!(next(&mut events.status).await, Some(TunnelStatus::Connecting));
        queues.push(events);
    }

    let started = tokio::time::Instant::now();
    supervisor.stop_all().await;
    let elapsed = started.elapsed();

    // Three one-second port kills run side by side.
    assert!(elapsed < Duration::from_millis(2500), "took {elapsed:?}");
    assert_eq!(supervisor.active_count().await, 0);
    let mut ports = killer.ports();
    ports.sort_unstable();
    assert_eq!(ports, [2030, 2031, 2032]);

    for mut events in queues {
        let rest = collect_until_closed(&mut events.status).await;
        assert_eq!(rest.last(), Some(&TunnelStatus::Inactive));
    }
}

#[tokio::test]
async fn abnormal_exit_reports_error_and_releases_id() {
    let supervisor = scripted(
        r#"
echo "Opening tunnel on port 2022" >&2
exit 3
"#,
    );
    let mut events = supervisor.start_tunnel(3, &spec(2022)).await.unwrap();

    let statuses = collect_until_closed(&mut events.status).await;
    assert_eq!(statuses.first(), Some(&TunnelStatus::Connecting));
    assert_eq!(statuses.last(), Some(&TunnelStatus::Error));

    let errors = collect_until_closed(&mut events.errors).await;
    assert_eq!(errors.len(), 1);
    match &errors[0] {
        TunnelError::ProcessExit { status } => assert_eq!(status.code(), Some(3)),
        other => panic!("unexpected error: {other:?}"),
    }

    // Released before the queues closed.
    assert!(!supervisor.is_running(3).await);
    assert_eq!(supervisor.active_count().await, 0);
}

#[tokio::test]
async fn error_lines_on_stderr_are_reported_without_stopping() {
    let supervisor = scripted(
        r#"
echo "ERROR: Bastion host not reachable, retrying" >&2
echo "Tunnel is ready, connect on port 2022"
exec sleep 30
"#,
    );
    let mut events = supervisor.start_tunnel(5, &spec(2022)).await.unwrap();

    match next(&mut events.errors).await {
        Some(TunnelError::ClassifiedError(line)) => assert!(line.contains("not reachable")),
        other => panic!("unexpected error event: {other:?}"),
    }
    assert_eq!(next(&mut events.status).await, Some(TunnelStatus::Connecting));
    assert_eq!(next(&mut events.status).await, Some(TunnelStatus::Active));
    assert!(supervisor.is_running(5).await);

    supervisor.stop_tunnel(5).await.unwrap();
}

#[tokio::test]
async fn log_buffer_keeps_only_most_recent_lines() {
    let supervisor = scripted(
        r#"
i=0
while [ $i -lt 150 ]; do echo "line $i"; i=$((i + 1)); done
exec sleep 30
"#,
    );
    let _events = supervisor.start_tunnel(6, &spec(2022)).await.unwrap();

    let deadline = tokio::time::Instant::now() + WAIT;
    let logs = loop {
        let logs = supervisor.get_logs(6).await;
        if logs.last().is_some_and(|l| l == "[OUT] line 149") {
            break logs;
        }
        assert!(tokio::time::Instant::now() < deadline, "output never arrived");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    assert_eq!(logs.len(), LOG_CAPACITY);
    assert_eq!(logs[0], "[OUT] line 50");

    supervisor.stop_tunnel(6).await.unwrap();
}
