//! Command line of the external relay CLI.

use std::path::PathBuf;

use tokio::process::Command;

use super::types::TunnelSpec;

/// The relay CLI program and the sub-command words that precede `tunnel`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCli {
    pub program: PathBuf,
    pub base_args: Vec<String>,
}

impl Default for RelayCli {
    fn default() -> Self {
        Self::az("az")
    }
}

impl RelayCli {
    /// `<program> network bastion tunnel ...`
    pub fn az(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            base_args: vec!["network".into(), "bastion".into()],
        }
    }

    /// Full argument list for opening `spec`.
    pub fn tunnel_args(&self, spec: &TunnelSpec) -> Vec<String> {
        let mut args = self.base_args.clone();
        args.extend([
            "tunnel".to_string(),
            "--name".to_string(),
            spec.relay_name.clone(),
            "--resource-group".to_string(),
            spec.relay_group.clone(),
            "--target-resource-id".to_string(),
            spec.target_id.clone(),
            "--resource-port".to_string(),
            spec.remote_port.to_string(),
            "--port".to_string(),
            spec.local_port.to_string(),
        ]);
        if let Some(ref subscription) = spec.relay_subscription {
            args.push("--subscription".to_string());
            args.push(subscription.clone());
        }
        args
    }

    /// Command ready to spawn, without any stdio configuration.
    pub fn tunnel_command(&self, spec: &TunnelSpec) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.tunnel_args(spec));
        cmd
    }
}
