//! Certificate lifecycle error types.

use std::path::PathBuf;

/// Errors from certificate operations.
///
/// `ParseFailure` never escapes the scheduler: every parse has a fallback
/// estimate. `RenewalFailure` reaches callers of `generate_certificate`
/// directly but only travels as an event for scheduled renewals.
#[derive(Debug, thiserror::Error)]
pub enum CertError {
    #[error("certificate not registered: {identity}")]
    NotRegistered { identity: String },

    #[error("could not parse certificate expiry: {0}")]
    ParseFailure(String),

    #[error("failed to issue certificate: {output}")]
    RenewalFailure { output: String },

    #[error("failed to generate key pair: {output}")]
    KeyGeneration { output: String },

    #[error("failed to inspect certificate: {reason}")]
    Inspection { reason: String },

    #[error("failed to run {program}: {reason}")]
    Command { program: String, reason: String },

    #[error("cannot determine home directory")]
    HomeDirUnavailable,

    #[error("{context} {}: {source}", path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CertError {
    /// Text shown to the operator when a renewal fails: the external
    /// command's captured output where there is one.
    pub fn operator_message(&self) -> String {
        match self {
            Self::RenewalFailure { output } | Self::KeyGeneration { output } => output.clone(),
            other => other.to_string(),
        }
    }
}
