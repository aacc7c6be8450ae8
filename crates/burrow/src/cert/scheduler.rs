//! Access certificate expiry monitoring and renewal.
//!
//! A single ticker task recomputes every record's state, so state changes
//! for one identity are totally ordered. Renewal attempts run as their own
//! tasks: a slow issuance for one identity never delays the tick for the
//! others. Stopping the ticker does not abort renewals already in flight.

use std::fs::Metadata;
use std::sync::Arc;

use chrono::{DateTime, Local, TimeDelta, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{self, EventPublisher};

use super::authority::CertAuthority;
use super::error::CertError;
use super::parse::{parse_inspected_expiry, parse_issued_expiry};
use super::paths::{CertPaths, expand_home};
use super::state::{
    CertEventKind, CertState, CertStatus, CertStatusEvent, RenewalPolicy, to_delta,
};
use super::store::{CertRecord, CertificateStore, SharedRecord};

/// Tracks certificates and renews them before they expire.
#[derive(Clone)]
pub struct RenewalScheduler {
    store: Arc<CertificateStore>,
    authority: Arc<dyn CertAuthority>,
    events: EventPublisher<CertStatusEvent>,
    policy: RenewalPolicy,
    shutdown: CancellationToken,
}

impl RenewalScheduler {
    /// Create a scheduler and the receiving end of its shared status queue.
    ///
    /// The queue is bounded and lossy: status events are dropped while it is
    /// full. Use [`Self::get_status`] for authoritative state.
    pub fn new(
        authority: Arc<dyn CertAuthority>,
        policy: RenewalPolicy,
    ) -> (Self, mpsc::Receiver<CertStatusEvent>) {
        let (events, rx) = events::channel("cert-status");
        let scheduler = Self {
            store: Arc::new(CertificateStore::new()),
            authority,
            events,
            policy,
            shutdown: CancellationToken::new(),
        };
        (scheduler, rx)
    }

    /// Start tracking `identity`, whose key pair and certificate live in
    /// `config_path` (may start with `~`).
    ///
    /// A missing certificate is tracked as already expired so the next
    /// tick generates one.
    pub async fn register(&self, identity: &str, config_path: &str) -> Result<(), CertError> {
        let key_dir = expand_home(config_path)?;
        let paths = CertPaths::in_key_dir(key_dir);
        let now = Utc::now();

        let metadata = match tokio::fs::metadata(&paths.cert).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(identity, cert = %paths.cert.display(), "No certificate yet, scheduling generation");
                self.store
                    .upsert(CertRecord {
                        identity: identity.to_string(),
                        paths,
                        created_at: None,
                        expires_at: now,
                        last_renewal_attempt: None,
                        renewal_in_flight: false,
                        state: CertState::Expired,
                    })
                    .await;
                self.publish(
                    identity,
                    CertEventKind::Expired,
                    "Certificate not found, will generate on next check".to_string(),
                    TimeDelta::zero(),
                );
                return Ok(());
            }
            Err(source) => {
                return Err(CertError::Io {
                    context: "failed to check certificate",
                    path: paths.cert,
                    source,
                });
            }
        };

        let expires_at = self.existing_expiry(identity, &paths, &metadata).await;
        let remaining = expires_at - now;
        let state = CertState::from_remaining(remaining, to_delta(self.policy.renewal_window));
        self.store
            .upsert(CertRecord {
                identity: identity.to_string(),
                paths,
                created_at: Some(now),
                expires_at,
                last_renewal_attempt: None,
                renewal_in_flight: false,
                state,
            })
            .await;

        info!(identity, %state, expires_at = %expires_at, "Tracking certificate");
        self.publish(
            identity,
            state.into(),
            format!("Certificate tracked: expires at {}", clock(expires_at)),
            remaining,
        );
        Ok(())
    }

    /// Create key material if needed and issue a first certificate for
    /// `identity`, then track it as valid.
    ///
    /// On failure the error is returned and any existing record is left
    /// untouched.
    pub async fn generate_certificate(
        &self,
        identity: &str,
        key_dir: &str,
        public_key_path: &str,
    ) -> Result<DateTime<Utc>, CertError> {
        let paths = CertPaths::with_public_key(expand_home(key_dir)?, expand_home(public_key_path)?);

        self.prepare_key_material(&paths).await?;
        let output = self.authority.issue(&paths.cert, &paths.public_key).await?;
        let expires_at = self.issued_expiry(identity, &output);
        let now = Utc::now();

        self.store
            .upsert(CertRecord {
                identity: identity.to_string(),
                paths,
                created_at: Some(now),
                expires_at,
                last_renewal_attempt: None,
                renewal_in_flight: false,
                state: CertState::Valid,
            })
            .await;

        info!(identity, expires_at = %expires_at, "Certificate generated");
        self.publish(
            identity,
            CertEventKind::Valid,
            format!("Certificate generated! Expires at: {}", clock(expires_at)),
            expires_at - now,
        );
        Ok(expires_at)
    }

    /// Current state and time left before expiry.
    pub async fn get_status(&self, identity: &str) -> Result<CertStatus, CertError> {
        self.store.status(identity, Utc::now()).await
    }

    /// Identities currently tracked, sorted.
    pub async fn identities(&self) -> Vec<String> {
        self.store.identities().await
    }

    /// Run one check pass: recompute every record's state and start a
    /// renewal for each record that is due. A record whose renewal is still
    /// running keeps advancing (so it can report `Expired`) but is not
    /// renewed twice. Returns the renewal tasks.
    pub async fn check_now(&self) -> Vec<JoinHandle<()>> {
        let now = Utc::now();
        let window = to_delta(self.policy.renewal_window);
        let retry_delay = to_delta(self.policy.retry_delay);
        let mut spawned = Vec::new();

        for shared in self.store.snapshot().await {
            let mut record = shared.write().await;
            let remaining = record.remaining(now);
            let next = record.state.advance(remaining, window);
            if next != record.state {
                debug!(identity = %record.identity, from = %record.state, to = %next, "Certificate state changed");
                record.state = next;
                self.publish(
                    &record.identity,
                    next.into(),
                    format!("Certificate status changed to: {next}"),
                    remaining,
                );
            }

            let retry_elapsed = record
                .last_renewal_attempt
                .is_none_or(|last| now - last >= retry_delay);
            if !record.renewal_in_flight && remaining <= window && retry_elapsed {
                record.state = CertState::Renewing;
                record.renewal_in_flight = true;
                record.last_renewal_attempt = Some(now);
                drop(record);
                spawned.push(tokio::spawn(self.clone().renew(Arc::clone(&shared))));
            }
        }

        spawned
    }

    /// Spawn the ticker. The first check runs immediately.
    pub fn spawn_monitor(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            info!(
                interval = ?scheduler.policy.check_interval,
                "Certificate monitor started"
            );
            let mut timer = tokio::time::interval(scheduler.policy.check_interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let started = scheduler.check_now().await;
                        if !started.is_empty() {
                            debug!(count = started.len(), "Renewal attempts started");
                        }
                    }
                    () = scheduler.shutdown.cancelled() => {
                        info!("Certificate monitor shutting down");
                        return;
                    }
                }
            }
        })
    }

    /// Stop the ticker. Renewals already running are left to finish.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Renew one record. The caller has already marked it `Renewing`.
    async fn renew(self, shared: SharedRecord) {
        let (identity, paths) = {
            let record = shared.read().await;
            (record.identity.clone(), record.paths.clone())
        };

        info!(identity = %identity, "Renewing certificate");
        self.publish(
            &identity,
            CertEventKind::Renewing,
            "Attempting to renew certificate...".to_string(),
            TimeDelta::zero(),
        );

        let issued = match self.prepare_key_material(&paths).await {
            Ok(()) => self.authority.issue(&paths.cert, &paths.public_key).await,
            Err(e) => Err(e),
        };

        match issued {
            Ok(output) => {
                let expires_at = self.issued_expiry(&identity, &output);
                let now = Utc::now();
                {
                    let mut record = shared.write().await;
                    record.created_at = Some(now);
                    record.expires_at = expires_at;
                    record.renewal_in_flight = false;
                    record.state = CertState::Valid;
                }
                info!(identity = %identity, expires_at = %expires_at, "Certificate renewed");
                self.publish(
                    &identity,
                    CertEventKind::Renewed,
                    format!(
                        "Certificate renewed successfully! Expires at: {}",
                        clock(expires_at)
                    ),
                    expires_at - now,
                );
            }
            Err(e) => {
                {
                    let mut record = shared.write().await;
                    record.renewal_in_flight = false;
                    record.state = CertState::RenewalFailed;
                }
                warn!(identity = %identity, error = %e, "Certificate renewal failed");
                self.publish(
                    &identity,
                    CertEventKind::RenewalFailed,
                    format!("Certificate renewal failed: {}", e.operator_message()),
                    TimeDelta::zero(),
                );
            }
        }
    }

    /// Ensure the key directory and key pair exist.
    async fn prepare_key_material(&self, paths: &CertPaths) -> Result<(), CertError> {
        let mut dirs = vec![paths.key_dir.as_path()];
        if let Some(parent) = paths.public_key.parent()
            && parent != paths.key_dir
            && !parent.as_os_str().is_empty()
        {
            dirs.push(parent);
        }
        for dir in dirs {
            create_private_dir(dir).await.map_err(|source| CertError::Io {
                context: "failed to create key directory",
                path: dir.to_path_buf(),
                source,
            })?;
        }

        if !tokio::fs::try_exists(&paths.public_key)
            .await
            .unwrap_or(false)
        {
            info!(private_key = %paths.private_key.display(), "Generating key pair");
            self.authority.generate_key_pair(&paths.private_key).await?;
        }
        Ok(())
    }

    /// Expiry of an existing certificate: inspected if possible, otherwise
    /// estimated from the file's modification time.
    async fn existing_expiry(
        &self,
        identity: &str,
        paths: &CertPaths,
        metadata: &Metadata,
    ) -> DateTime<Utc> {
        let parsed = match self.authority.inspect(&paths.cert).await {
            Ok(output) => parse_inspected_expiry(&output),
            Err(e) => Err(e),
        };
        parsed.unwrap_or_else(|e| {
            let lifetime = to_delta(self.policy.cert_lifetime);
            let estimate = metadata
                .modified()
                .map_or_else(|_| Utc::now(), DateTime::<Utc>::from)
                + lifetime;
            warn!(identity, error = %e, estimate = %estimate, "Using estimated certificate expiry");
            estimate
        })
    }

    /// Expiry reported by an issuance, or now plus the assumed lifetime.
    fn issued_expiry(&self, identity: &str, output: &str) -> DateTime<Utc> {
        parse_issued_expiry(output).unwrap_or_else(|e| {
            let estimate = Utc::now() + to_delta(self.policy.cert_lifetime);
            warn!(identity, error = %e, estimate = %estimate, "Using estimated certificate expiry");
            estimate
        })
    }

    fn publish(&self, identity: &str, kind: CertEventKind, message: String, expires_in: TimeDelta) {
        self.events.publish(CertStatusEvent {
            identity: identity.to_string(),
            kind,
            message,
            expires_in,
        });
    }
}

/// Local wall-clock time for operator messages.
fn clock(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%H:%M:%S").to_string()
}

#[cfg(unix)]
async fn create_private_dir(dir: &std::path::Path) -> std::io::Result<()> {
    tokio::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .await
}

#[cfg(not(unix))]
async fn create_private_dir(dir: &std::path::Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await
}
