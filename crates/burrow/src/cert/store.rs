//! In-memory registry of tracked certificates.
//!
//! The map lock guards membership only. Each record has its own lock so
//! field updates never hold the map lock, and a renewal task can keep a
//! handle to its record while the map changes.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::RwLock;

use super::error::CertError;
use super::paths::CertPaths;
use super::state::{CertState, CertStatus};

/// Metadata for one tracked certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertRecord {
    pub identity: String,
    pub paths: CertPaths,
    /// When the current certificate was issued or first seen.
    pub created_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub last_renewal_attempt: Option<DateTime<Utc>>,
    /// Set while a renewal task for this record is running.
    pub renewal_in_flight: bool,
    pub state: CertState,
}

impl CertRecord {
    /// Time left before expiry; negative once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> TimeDelta {
        self.expires_at - now
    }
}

/// Shared handle to a record.
pub type SharedRecord = Arc<RwLock<CertRecord>>;

/// Registry of certificate records keyed by identity.
#[derive(Debug, Default)]
pub struct CertificateStore {
    records: RwLock<HashMap<String, SharedRecord>>,
}

impl CertificateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, or overwrite the existing one for the same identity
    /// in place so outstanding handles observe the new contents.
    pub async fn upsert(&self, record: CertRecord) -> SharedRecord {
        let shared = {
            let mut records = self.records.write().await;
            Arc::clone(
                records
                    .entry(record.identity.clone())
                    .or_insert_with(|| Arc::new(RwLock::new(record.clone()))),
            )
        };
        *shared.write().await = record;
        shared
    }

    pub async fn get(&self, identity: &str) -> Option<SharedRecord> {
        self.records.read().await.get(identity).cloned()
    }

    /// Handles to every record, in no particular order.
    pub async fn snapshot(&self) -> Vec<SharedRecord> {
        self.records.read().await.values().cloned().collect()
    }

    /// Registered identities, sorted.
    pub async fn identities(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.records.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Current state and time left for `identity`.
    pub async fn status(&self, identity: &str, now: DateTime<Utc>) -> Result<CertStatus, CertError> {
        let shared = self
            .get(identity)
            .await
            .ok_or_else(|| CertError::NotRegistered {
                identity: identity.to_string(),
            })?;
        let record = shared.read().await;
        Ok(CertStatus {
            state: record.state,
            expires_in: record.remaining(now),
        })
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}
