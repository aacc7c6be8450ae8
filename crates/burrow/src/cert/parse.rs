//! Expiry extraction from external command output.
//!
//! Both tools print local wall-clock times without an offset.

use std::sync::LazyLock;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use regex::Regex;

use super::error::CertError;

/// Issuance output, e.g. `... is valid until 2025-10-15 18:06:23 in local time.`
static ISSUED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"is valid until (\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}) in local time")
        .expect("static regex is valid")
});

/// Inspection output, e.g. `Valid: from 2025-10-15T17:31:23 to 2025-10-15T18:31:23`.
static INSPECTED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Valid: from .+ to (\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2})")
        .expect("static regex is valid")
});

/// Expiry reported by the certificate-issuing command.
pub fn parse_issued_expiry(output: &str) -> Result<DateTime<Utc>, CertError> {
    parse_local(&ISSUED_RE, output, "%Y-%m-%d %H:%M:%S")
}

/// Expiry reported by the certificate inspection command.
pub fn parse_inspected_expiry(output: &str) -> Result<DateTime<Utc>, CertError> {
    parse_local(&INSPECTED_RE, output, "%Y-%m-%dT%H:%M:%S")
}

fn parse_local(re: &Regex, output: &str, format: &str) -> Result<DateTime<Utc>, CertError> {
    let raw = re
        .captures(output)
        .and_then(|c| c.get(1))
        .ok_or_else(|| CertError::ParseFailure("no expiry timestamp in output".to_string()))?
        .as_str();
    let naive = NaiveDateTime::parse_from_str(raw, format)
        .map_err(|e| CertError::ParseFailure(format!("{raw}: {e}")))?;
    // Ambiguous during a DST fold: take the earlier instant so renewal
    // happens sooner rather than later.
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| CertError::ParseFailure(format!("{raw} does not exist in local time")))
}
