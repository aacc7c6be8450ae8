#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Integration tests use unwrap for brevity

//! Certificate scheduler tests against an in-process authority.
//!
//! The fake writes real key and certificate files into a temp directory and
//! answers in the issuing tool's output format, so the scheduler's path
//! handling and expiry parsing run unchanged.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, TimeDelta, Utc};
use tokio::sync::mpsc;

use burrow::cert::{
    CertAuthority, CertError, CertEventKind, CertState, CertStatusEvent, RenewalPolicy,
    RenewalScheduler,
};

/// Issues one-hour certificates, optionally after a per-directory delay.
#[derive(Default)]
struct FakeAuthority {
    delays: Mutex<HashMap<String, Duration>>,
    issued: Mutex<Vec<String>>,
}

impl FakeAuthority {
    fn slow_for(&self, dir_name: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap()
            .insert(dir_name.to_string(), delay);
    }

    fn issued_count(&self, dir_name: &str) -> usize {
        self.issued
            .lock()
            .unwrap()
            .iter()
            .filter(|d| *d == dir_name)
            .count()
    }
}

fn dir_name(path: &Path) -> String {
    path.parent()
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[async_trait]
impl CertAuthority for FakeAuthority {
    async fn inspect(&self, _cert: &Path) -> Result<String, CertError> {
        Err(CertError::Inspection {
            reason: "inspection not supported".into(),
        })
    }

    async fn issue(&self, cert: &Path, _public_key: &Path) -> Result<String, CertError> {
        let name = dir_name(cert);
        let delay = self.delays.lock().unwrap().get(&name).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.issued.lock().unwrap().push(name);
        std::fs::write(cert, "ssh-rsa-cert-v01@openssh.com AAAA").unwrap();
        let until = (Utc::now() + TimeDelta::hours(1))
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S");
        Ok(format!(
            "Generated SSH certificate {} is valid until {until} in local time.\n",
            cert.display()
        ))
    }

    async fn generate_key_pair(&self, private_key: &Path) -> Result<(), CertError> {
        std::fs::write(private_key, "PRIVATE").unwrap();
        let mut public = private_key.as_os_str().to_os_string();
        public.push(".pub");
        std::fs::write(public, "ssh-rsa AAAA").unwrap();
        Ok(())
    }
}

/// Next event of `kind`, skipping everything else.
async fn next_of_kind(
    rx: &mut mpsc::Receiver<CertStatusEvent>,
    kind: CertEventKind,
) -> CertStatusEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = rx.recv().await.expect("event queue closed");
            if event.kind == kind {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for certificate event")
}

#[tokio::test]
async fn monitor_generates_missing_certificates_on_first_tick() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeAuthority::default());
    let policy = RenewalPolicy {
        check_interval: Duration::from_millis(50),
        ..RenewalPolicy::default()
    };
    let (scheduler, mut rx) = RenewalScheduler::new(fake.clone(), policy);

    for name in ["web-1", "db-1"] {
        let key_dir = dir.path().join(name);
        scheduler
            .register(name, key_dir.to_str().unwrap())
            .await
            .unwrap();
        let status = scheduler.get_status(name).await.unwrap();
        assert_eq!(status.state, CertState::Expired);
    }
    assert_eq!(scheduler.identities().await, ["db-1", "web-1"]);

    let monitor = scheduler.spawn_monitor();
    let mut renewed = Vec::new();
    while renewed.len() < 2 {
        let event = next_of_kind(&mut rx, CertEventKind::Renewed).await;
        assert!(event.message.starts_with("Certificate renewed successfully! Expires at: "));
        assert!(event.expires_in > TimeDelta::minutes(55));
        renewed.push(event.identity);
    }
    renewed.sort();
    assert_eq!(renewed, ["db-1", "web-1"]);

    scheduler.stop();
    monitor.await.unwrap();

    for name in ["web-1", "db-1"] {
        let status = scheduler.get_status(name).await.unwrap();
        assert_eq!(status.state, CertState::Valid);
        assert_eq!(fake.issued_count(name), 1);
        assert!(dir.path().join(name).join("id_rsa").exists());
        assert!(dir.path().join(name).join("id_rsa.pub-aadcert.pub").exists());
    }
}

#[tokio::test]
async fn slow_renewal_does_not_block_others_or_run_twice() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeAuthority::default());
    fake.slow_for("slow", Duration::from_millis(500));
    let (scheduler, mut rx) = RenewalScheduler::new(fake.clone(), RenewalPolicy::default());

    for name in ["slow", "fast"] {
        scheduler
            .register(name, dir.path().join(name).to_str().unwrap())
            .await
            .unwrap();
    }

    let first = scheduler.check_now().await;
    assert_eq!(first.len(), 2);

    let event = next_of_kind(&mut rx, CertEventKind::Renewed).await;
    assert_eq!(event.identity, "fast");
    assert_eq!(
        scheduler.get_status("slow").await.unwrap().state,
        CertState::Renewing
    );

    // A tick while "slow" is in flight starts nothing new for it.
    let second = scheduler.check_now().await;
    assert!(second.is_empty());

    for handle in first {
        handle.await.unwrap();
    }
    assert_eq!(fake.issued_count("slow"), 1);
    assert_eq!(
        scheduler.get_status("slow").await.unwrap().state,
        CertState::Valid
    );
}

#[tokio::test]
async fn certificate_expiring_during_slow_renewal_is_reported_expired() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeAuthority::default());
    fake.slow_for("vm", Duration::from_millis(800));
    let (scheduler, mut rx) = RenewalScheduler::new(fake.clone(), RenewalPolicy::default());

    // Absent, so the record expires the moment it is registered.
    scheduler
        .register("vm", dir.path().join("vm").to_str().unwrap())
        .await
        .unwrap();
    let first = scheduler.check_now().await;
    assert_eq!(first.len(), 1);
    assert_eq!(
        scheduler.get_status("vm").await.unwrap().state,
        CertState::Renewing
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = scheduler.check_now().await;
    assert!(second.is_empty(), "renewal already in flight");

    let status = scheduler.get_status("vm").await.unwrap();
    assert_eq!(status.state, CertState::Expired);
    assert!(status.expires_in <= TimeDelta::zero());
    let registered = next_of_kind(&mut rx, CertEventKind::Expired).await;
    assert!(registered.message.contains("not found"), "{}", registered.message);
    let changed = next_of_kind(&mut rx, CertEventKind::Expired).await;
    assert_eq!(changed.message, "Certificate status changed to: expired");

    for handle in first {
        handle.await.unwrap();
    }
    assert_eq!(fake.issued_count("vm"), 1);
    assert_eq!(
        scheduler.get_status("vm").await.unwrap().state,
        CertState::Valid
    );
}

#[tokio::test]
async fn generate_certificate_tracks_identity_as_valid() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeAuthority::default());
    let (scheduler, mut rx) = RenewalScheduler::new(fake, RenewalPolicy::default());

    let key_dir = dir.path().join("jump");
    let public_key = key_dir.join("id_rsa.pub");
    let expires_at = scheduler
        .generate_certificate(
            "jump",
            key_dir.to_str().unwrap(),
            public_key.to_str().unwrap(),
        )
        .await
        .unwrap();
    assert!(expires_at > Utc::now() + TimeDelta::minutes(55));

    let event = next_of_kind(&mut rx, CertEventKind::Valid).await;
    assert_eq!(event.identity, "jump");
    assert!(event.message.starts_with("Certificate generated! Expires at: "));

    let status = scheduler.get_status("jump").await.unwrap();
    assert_eq!(status.state, CertState::Valid);
    assert!(key_dir.join("id_rsa.pub-aadcert.pub").exists());

    // Nothing is due for an hour-long certificate.
    assert!(scheduler.check_now().await.is_empty());
}

#[tokio::test]
async fn status_of_unregistered_identity_fails() {
    let (scheduler, _rx) =
        RenewalScheduler::new(Arc::new(FakeAuthority::default()), RenewalPolicy::default());
    let err = scheduler.get_status("ghost").await.unwrap_err();
    assert!(matches!(err, CertError::NotRegistered { ref identity } if identity == "ghost"));
}
