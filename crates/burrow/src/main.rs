//! `burrow`
//!
//! Opens bastion tunnels to configured machines and keeps their access
//! certificates renewed until interrupted.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use burrow::cert::paths::PUBLIC_KEY_FILENAME;
use burrow::cert::{
    CertEventKind, CertStatusEvent, CliAuthority, RenewalPolicy, RenewalScheduler,
    format_remaining,
};
use burrow::tunnel::{
    RelayCli, TunnelEvents, TunnelId, TunnelSpec, TunnelSupervisor, platform_port_killer,
};
use burrow_core::config::{self, DEFAULT_CONFIG_FILE};
use burrow_core::{Config, MachineConfig};

#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(version, about = "Bastion tunnel supervisor with access certificate renewal")]
struct Args {
    /// Machine list file (TOML, or JSON with a `.json` extension)
    #[arg(long, default_value = DEFAULT_CONFIG_FILE, env = "BURROW_CONFIG")]
    config: PathBuf,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "BURROW_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON.
    #[arg(long, env = "BURROW_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Track certificates and run tunnels until interrupted
    Run {
        /// Tunnels to open, as `machine:local_port:remote_port`
        #[arg(value_parser = parse_tunnel_arg)]
        tunnels: Vec<TunnelArg>,
    },
    /// Issue a fresh access certificate for one machine
    GenerateCert {
        /// Machine name from the config file
        machine: String,
    },
}

/// One `machine:local_port:remote_port` request.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TunnelArg {
    machine: String,
    local_port: u16,
    remote_port: u16,
}

fn parse_tunnel_arg(s: &str) -> Result<TunnelArg, String> {
    let mut parts = s.rsplitn(3, ':');
    let (Some(remote), Some(local), Some(machine)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(format!("expected machine:local_port:remote_port, got '{s}'"));
    };
    if machine.is_empty() {
        return Err("machine name is empty".to_string());
    }
    let port = |p: &str| {
        p.parse::<u16>()
            .map_err(|e| format!("invalid port '{p}': {e}"))
    };
    Ok(TunnelArg {
        machine: machine.to_string(),
        local_port: port(local)?,
        remote_port: port(remote)?,
    })
}

fn tunnel_spec(machine: &MachineConfig, local_port: u16, remote_port: u16) -> TunnelSpec {
    TunnelSpec {
        relay_name: machine.bastion_name.clone(),
        relay_group: machine.bastion_resource_group.clone(),
        relay_subscription: machine.bastion_subscription.clone(),
        target_id: machine.target_resource_id.clone(),
        remote_port,
        local_port,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    burrow_core::tracing_init::init_tracing(&args.log_level, args.log_json);

    let config = config::load(&args.config)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        machines = config.machines.len(),
        "Starting burrow"
    );

    let authority = Arc::new(CliAuthority::new(
        config.settings.az_bin.clone(),
        config.settings.ssh_keygen_bin.clone(),
        Duration::from_secs(config.settings.command_timeout_secs),
    ));
    let (scheduler, cert_events) = RenewalScheduler::new(authority, RenewalPolicy::default());

    match args.command {
        Commands::GenerateCert { machine } => generate_cert(&config, &scheduler, &machine).await,
        Commands::Run { tunnels } => run(&config, scheduler, cert_events, tunnels).await,
    }
}

async fn generate_cert(
    config: &Config,
    scheduler: &RenewalScheduler,
    name: &str,
) -> anyhow::Result<()> {
    let machine = config
        .machine(name)
        .with_context(|| format!("unknown machine '{name}'"))?;
    let key_dir = machine
        .ssh_config_path
        .as_deref()
        .with_context(|| format!("machine '{name}' has no ssh_config_path"))?;
    let public_key = Path::new(key_dir).join(PUBLIC_KEY_FILENAME);

    let expires_at = scheduler
        .generate_certificate(name, key_dir, &public_key.to_string_lossy())
        .await
        .map_err(|e| anyhow::anyhow!(e.operator_message()))
        .with_context(|| format!("certificate generation failed for '{name}'"))?;
    info!(machine = name, expires_at = %expires_at, "Certificate ready");
    Ok(())
}

async fn run(
    config: &Config,
    scheduler: RenewalScheduler,
    cert_events: tokio::sync::mpsc::Receiver<CertStatusEvent>,
    tunnels: Vec<TunnelArg>,
) -> anyhow::Result<()> {
    let cert_log = tokio::spawn(log_cert_events(cert_events));

    for machine in &config.machines {
        let Some(ref path) = machine.ssh_config_path else {
            continue;
        };
        if let Err(e) = scheduler.register(&machine.name, path).await {
            warn!(machine = %machine.name, error = %e, "Failed to track certificate");
        }
    }
    let monitor = scheduler.spawn_monitor();

    let supervisor = TunnelSupervisor::with_options(
        RelayCli::az(config.settings.az_bin.clone()),
        platform_port_killer(),
        Duration::from_secs(config.settings.terminate_timeout_secs),
    );

    let mut listeners = Vec::new();
    for (id, request) in tunnels.iter().enumerate() {
        let machine = config
            .machine(&request.machine)
            .with_context(|| format!("unknown machine '{}'", request.machine))?;
        let spec = tunnel_spec(machine, request.local_port, request.remote_port);
        match supervisor.start_tunnel(id, &spec).await {
            Ok(events) => {
                info!(
                    tunnel = id,
                    machine = %machine.name,
                    local_port = spec.local_port,
                    remote_port = spec.remote_port,
                    "Tunnel started"
                );
                listeners.extend(watch_tunnel(id, machine.name.clone(), events));
            }
            Err(e) => error!(tunnel = id, machine = %machine.name, error = %e, "Failed to start tunnel"),
        }
    }

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    supervisor.stop_all().await;
    scheduler.stop();
    joined("certificate monitor", monitor.await);
    for listener in listeners {
        joined("tunnel event listener", listener.await);
    }
    // In-flight renewals keep the queue open; give them a moment to report.
    drop(scheduler);
    match tokio::time::timeout(Duration::from_secs(2), cert_log).await {
        Ok(result) => {
            joined("certificate event logger", result);
        }
        Err(_) => debug!("Certificate events still pending at shutdown"),
    }

    info!("Burrow stopped");
    Ok(())
}

/// Log a background task that panicked or was cancelled. Returns whether it
/// finished cleanly.
fn joined(task: &str, result: Result<(), tokio::task::JoinError>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!(task, error = %e, "Background task failed");
            false
        }
    }
}

/// Log a tunnel's status transitions and errors until its queues close.
fn watch_tunnel(id: TunnelId, machine: String, events: TunnelEvents) -> [JoinHandle<()>; 2] {
    let TunnelEvents {
        mut status,
        mut errors,
    } = events;
    let status_machine = machine.clone();
    [
        tokio::spawn(async move {
            while let Some(s) = status.recv().await {
                info!(tunnel = id, machine = %status_machine, status = %s, "Tunnel status");
            }
        }),
        tokio::spawn(async move {
            while let Some(e) = errors.recv().await {
                error!(tunnel = id, machine = %machine, error = %e, "Tunnel error");
            }
        }),
    ]
}

async fn log_cert_events(mut events: tokio::sync::mpsc::Receiver<CertStatusEvent>) {
    while let Some(event) = events.recv().await {
        let remaining = format_remaining(event.expires_in);
        match event.kind {
            CertEventKind::RenewalFailed | CertEventKind::Expired => warn!(
                identity = %event.identity,
                kind = event.kind.as_str(),
                remaining = %remaining,
                "{}", event.message
            ),
            _ => info!(
                identity = %event.identity,
                kind = event.kind.as_str(),
                remaining = %remaining,
                "{}", event.message
            ),
        }
    }
}
