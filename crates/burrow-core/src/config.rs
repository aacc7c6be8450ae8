//! Machine list configuration for Burrow.
//!
//! The machine list is read once at startup and treated as read-only input.
//! Resolution order:
//! 1. Built-in defaults
//! 2. Config file (`burrow.toml`, or JSON when the extension is `.json`)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Default config file name, resolved against the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "burrow.toml";

/// Complete Burrow configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub machines: Vec<MachineConfig>,
    #[serde(default)]
    pub settings: Settings,
}

/// A single remote machine reachable through a bastion relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachineConfig {
    /// Display name, also the certificate identity.
    #[serde(default)]
    pub name: String,
    /// Resource group containing the machine.
    #[serde(default)]
    pub resource_group: String,
    /// Full resource identifier of the target machine.
    #[serde(default)]
    pub target_resource_id: String,
    /// Name of the bastion relay.
    #[serde(default)]
    pub bastion_name: String,
    /// Resource group containing the bastion relay.
    #[serde(default)]
    pub bastion_resource_group: String,
    /// Subscription of the bastion relay, when it differs from the default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bastion_subscription: Option<String>,
    /// Directory holding the key pair and access certificate
    /// (e.g. `~/.ssh/az_ssh_config/my-vm`). Enables certificate tracking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_config_path: Option<String>,
}

/// Runtime settings for the external collaborators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    /// Relay / certificate-issuing CLI.
    pub az_bin: PathBuf,
    /// Key generation and certificate inspection tool.
    pub ssh_keygen_bin: PathBuf,
    /// Upper bound for a single external certificate command.
    pub command_timeout_secs: u64,
    /// How long `stop` waits for a tunnel process to be reaped.
    pub terminate_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            az_bin: PathBuf::from("az"),
            ssh_keygen_bin: PathBuf::from("ssh-keygen"),
            command_timeout_secs: 120,
            terminate_timeout_secs: 5,
        }
    }
}

impl Config {
    /// Find a machine by its display name.
    pub fn machine(&self, name: &str) -> Option<&MachineConfig> {
        self.machines.iter().find(|m| m.name == name)
    }
}

/// Load and validate the configuration file, then apply environment overrides.
pub fn load(path: &Path) -> Result<Config> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::ConfigNotFound {
                path: path.display().to_string(),
            });
        }
        Err(e) => {
            return Err(Error::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            )));
        }
    };

    let mut config = parse(path, &content)?;
    validate(&config, path)?;
    apply_env_overrides(&mut config.settings, |key| std::env::var(key).ok());
    Ok(config)
}

fn parse(path: &Path, content: &str) -> Result<Config> {
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        Ok(serde_json::from_str(content)?)
    } else {
        Ok(toml::from_str(content)?)
    }
}

fn validate(config: &Config, path: &Path) -> Result<()> {
    if config.machines.is_empty() {
        return Err(Error::Config(format!(
            "no machines defined in config file {}",
            path.display()
        )));
    }

    for (position, machine) in config.machines.iter().enumerate() {
        let required = [
            ("name", &machine.name),
            ("target_resource_id", &machine.target_resource_id),
            ("bastion_name", &machine.bastion_name),
            ("bastion_resource_group", &machine.bastion_resource_group),
        ];
        if let Some((field, _)) = required.iter().find(|(_, v)| v.trim().is_empty()) {
            return Err(Error::Config(format!(
                "machine #{} is missing required field `{field}`",
                position + 1
            )));
        }
    }

    Ok(())
}

/// Apply `BURROW_*` overrides using the given variable lookup.
pub fn apply_env_overrides(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    if let Some(val) = var("BURROW_AZ_BIN") {
        settings.az_bin = PathBuf::from(val);
    }
    if let Some(val) = var("BURROW_SSH_KEYGEN_BIN") {
        settings.ssh_keygen_bin = PathBuf::from(val);
    }
    if let Some(n) = var("BURROW_COMMAND_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        settings.command_timeout_secs = n;
    }
    if let Some(n) = var("BURROW_TERMINATE_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        settings.terminate_timeout_secs = n;
    }
}
