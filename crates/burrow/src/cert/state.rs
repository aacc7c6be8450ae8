//! Certificate lifecycle states, thresholds and status events.

use std::fmt;
use std::time::Duration;

use chrono::TimeDelta;

/// Access certificates are issued for one hour.
pub const CERT_LIFETIME: Duration = Duration::from_secs(60 * 60);
/// Renewal is attempted during the last five minutes before expiry.
pub const RENEWAL_WINDOW: Duration = Duration::from_secs(5 * 60);
/// Minimum spacing between renewal attempts for one identity.
pub const RENEWAL_RETRY_DELAY: Duration = Duration::from_secs(30);
/// Interval between scheduler ticks.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Timing policy for the renewal scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewalPolicy {
    pub check_interval: Duration,
    pub renewal_window: Duration,
    pub retry_delay: Duration,
    /// Assumed lifetime when the real expiry cannot be determined.
    pub cert_lifetime: Duration,
}

impl Default for RenewalPolicy {
    fn default() -> Self {
        Self {
            check_interval: CHECK_INTERVAL,
            renewal_window: RENEWAL_WINDOW,
            retry_delay: RENEWAL_RETRY_DELAY,
            cert_lifetime: CERT_LIFETIME,
        }
    }
}

/// Convert a policy duration for arithmetic against wall-clock timestamps.
pub fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

/// Lifecycle state of a tracked certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CertState {
    Valid,
    ExpiringSoon,
    Expired,
    Renewing,
    RenewalFailed,
}

impl CertState {
    /// State implied purely by the time left before expiry.
    pub fn from_remaining(remaining: TimeDelta, window: TimeDelta) -> Self {
        if remaining <= TimeDelta::zero() {
            Self::Expired
        } else if remaining <= window {
            Self::ExpiringSoon
        } else {
            Self::Valid
        }
    }

    /// State after a scheduler tick.
    ///
    /// `Expired` wins from any state. A failed renewal stays visible while
    /// the certificate is still inside the renewal window, until the next
    /// attempt starts.
    pub fn advance(self, remaining: TimeDelta, window: TimeDelta) -> Self {
        match (self, Self::from_remaining(remaining, window)) {
            (_, Self::Expired) => Self::Expired,
            (Self::Renewing, _) => Self::Renewing,
            (Self::RenewalFailed, Self::ExpiringSoon) => Self::RenewalFailed,
            (_, computed) => computed,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::ExpiringSoon => "expiring_soon",
            Self::Expired => "expired",
            Self::Renewing => "renewing",
            Self::RenewalFailed => "renewal_failed",
        }
    }
}

impl fmt::Display for CertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Label carried by a certificate status event. Same as [`CertState`] plus
/// `Renewed`, which marks the `Renewing -> Valid` transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CertEventKind {
    Valid,
    Renewed,
    ExpiringSoon,
    Expired,
    Renewing,
    RenewalFailed,
}

impl CertEventKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Renewed => "renewed",
            Self::ExpiringSoon => "expiring_soon",
            Self::Expired => "expired",
            Self::Renewing => "renewing",
            Self::RenewalFailed => "renewal_failed",
        }
    }
}

impl From<CertState> for CertEventKind {
    fn from(state: CertState) -> Self {
        match state {
            CertState::Valid => Self::Valid,
            CertState::ExpiringSoon => Self::ExpiringSoon,
            CertState::Expired => Self::Expired,
            CertState::Renewing => Self::Renewing,
            CertState::RenewalFailed => Self::RenewalFailed,
        }
    }
}

impl fmt::Display for CertEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry on the shared certificate status queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertStatusEvent {
    pub identity: String,
    pub kind: CertEventKind,
    pub message: String,
    /// Time left before expiry when the event was published; zero when
    /// not meaningful (renewing, failed).
    pub expires_in: TimeDelta,
}

/// Result of a status lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CertStatus {
    pub state: CertState,
    pub expires_in: TimeDelta,
}

/// Human form of a remaining duration: `1h5m`, `4m59s`, `42s` or `expired`.
pub fn format_remaining(remaining: TimeDelta) -> String {
    if remaining < TimeDelta::zero() {
        return "expired".to_string();
    }
    let hours = remaining.num_hours();
    let minutes = remaining.num_minutes() % 60;
    let seconds = remaining.num_seconds() % 60;
    if hours > 0 {
        format!("{hours}h{minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}
