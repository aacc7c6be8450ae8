//! Classification of relay CLI output lines.
//!
//! The relay tool prints unstructured text and, like most of its family,
//! writes ordinary progress messages to stderr. Matching is substring based
//! and anything unrecognised is ignored.

use super::types::TunnelStatus;

const READY_PHRASES: [&str; 2] = ["Tunnel is ready", "connect on port"];
const OPENING_PHRASE: &str = "Opening tunnel";
const ERROR_TOKENS: [&str; 2] = ["error", "failed"];

/// Which subprocess stream a line was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Outcome of classifying one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Status(TunnelStatus),
    Error(String),
}

/// Map a line to at most one status transition or error signal.
///
/// Error tokens are only honoured on stderr; stdout lines can only move the
/// tunnel between `Connecting` and `Active`.
pub fn classify(line: &str, stream: OutputStream) -> Option<Classification> {
    if READY_PHRASES.iter().any(|p| line.contains(p)) {
        return Some(Classification::Status(TunnelStatus::Active));
    }
    if line.contains(OPENING_PHRASE) {
        return Some(Classification::Status(TunnelStatus::Connecting));
    }
    if stream == OutputStream::Stderr {
        let lower = line.to_lowercase();
        if ERROR_TOKENS.iter().any(|t| lower.contains(t)) {
            return Some(Classification::Error(line.to_string()));
        }
    }
    None
}

/// Form of `line` stored in the tunnel's log buffer. Stdout lines are
/// tagged; stderr carries the tool's normal progress output and is kept as is.
pub fn log_entry(line: &str, stream: OutputStream) -> String {
    match stream {
        OutputStream::Stdout => format!("[OUT] {line}"),
        OutputStream::Stderr => line.to_string(),
    }
}
