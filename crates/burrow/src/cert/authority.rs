//! External certificate tooling.
//!
//! Issuance and key generation are delegated to command line tools. The
//! scheduler only sees the [`CertAuthority`] trait so tests can substitute
//! an in-process fake.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error};

use super::error::CertError;

/// Issues, inspects and generates key material for access certificates.
#[async_trait]
pub trait CertAuthority: Send + Sync {
    /// Dump an existing certificate's details (including its validity window).
    async fn inspect(&self, cert: &Path) -> Result<String, CertError>;

    /// Issue a certificate for `public_key` into `cert`. Returns the tool's
    /// combined output, which reports the new expiry.
    async fn issue(&self, cert: &Path, public_key: &Path) -> Result<String, CertError>;

    /// Create a new key pair at `private_key` (public half at `<private_key>.pub`).
    async fn generate_key_pair(&self, private_key: &Path) -> Result<(), CertError>;
}

/// [`CertAuthority`] backed by the `az` and `ssh-keygen` command line tools.
#[derive(Debug, Clone)]
pub struct CliAuthority {
    az_bin: PathBuf,
    ssh_keygen_bin: PathBuf,
    timeout: Duration,
}

impl Default for CliAuthority {
    fn default() -> Self {
        Self::new("az", "ssh-keygen", Duration::from_secs(120))
    }
}

impl CliAuthority {
    pub fn new(
        az_bin: impl Into<PathBuf>,
        ssh_keygen_bin: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            az_bin: az_bin.into(),
            ssh_keygen_bin: ssh_keygen_bin.into(),
            timeout,
        }
    }

    /// Run a command to completion with a timeout. The child is killed if
    /// the timeout fires.
    async fn run(&self, program: &Path, args: &[&OsStr]) -> Result<Output, CertError> {
        let cmd_line = format!(
            "{} {}",
            program.display(),
            args.iter()
                .map(|a| a.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );
        debug!("exec: {cmd_line}");

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CertError::Command {
                program: program.display().to_string(),
                reason: e.to_string(),
            })?;

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(CertError::Command {
                program: program.display().to_string(),
                reason: e.to_string(),
            }),
            Err(_) => {
                error!(timeout = ?self.timeout, "command timed out: {cmd_line}");
                Err(CertError::Command {
                    program: program.display().to_string(),
                    reason: format!("timed out after {}s", self.timeout.as_secs()),
                })
            }
        }
    }
}

/// Stdout followed by stderr, the way a terminal would show them.
fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    text
}

#[async_trait]
impl CertAuthority for CliAuthority {
    async fn inspect(&self, cert: &Path) -> Result<String, CertError> {
        let output = self
            .run(&self.ssh_keygen_bin, &[OsStr::new("-L"), OsStr::new("-f"), cert.as_os_str()])
            .await?;
        let text = combined_output(&output);
        if !output.status.success() {
            return Err(CertError::Inspection {
                reason: format!("{} (exit {})", text.trim(), output.status),
            });
        }
        Ok(text)
    }

    async fn issue(&self, cert: &Path, public_key: &Path) -> Result<String, CertError> {
        let output = self
            .run(
                &self.az_bin,
                &[
                    OsStr::new("ssh"),
                    OsStr::new("cert"),
                    OsStr::new("--file"),
                    cert.as_os_str(),
                    OsStr::new("--public-key-file"),
                    public_key.as_os_str(),
                ],
            )
            .await?;
        let text = combined_output(&output);
        if !output.status.success() {
            let output = if text.trim().is_empty() {
                format!("exit {}", output.status)
            } else {
                text.trim().to_string()
            };
            return Err(CertError::RenewalFailure { output });
        }
        Ok(text)
    }

    async fn generate_key_pair(&self, private_key: &Path) -> Result<(), CertError> {
        let output = self
            .run(
                &self.ssh_keygen_bin,
                &[
                    OsStr::new("-t"),
                    OsStr::new("rsa"),
                    OsStr::new("-b"),
                    OsStr::new("4096"),
                    OsStr::new("-f"),
                    private_key.as_os_str(),
                    OsStr::new("-N"),
                    OsStr::new(""),
                ],
            )
            .await?;
        if !output.status.success() {
            return Err(CertError::KeyGeneration {
                output: format!("{} (exit {})", combined_output(&output).trim(), output.status),
            });
        }
        Ok(())
    }
}
