//! Bypass store trait and implementations.
//!
//! The store is the only durable state of the gate: one [`BypassRecord`] per
//! bypassed domain. A domain with no record is blocked.
//!
//! - [`MemoryStore`]: process-local, for tests and ephemeral deployments
//! - [`JsonFileStore`]: survives restarts, writes are atomic renames

mod file;
mod memory;

use std::future::Future;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use file::JsonFileStore;
pub use memory::MemoryStore;

use crate::clock::Timestamp;
use crate::directory::Domain;

/// Error type for bypass store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// I/O error reading or writing the backing file.
    #[error("I/O error on {path:?}: {source}")]
    Io {
        /// Path of the file involved.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Backing file exists but does not hold a valid bypass map.
    #[error("corrupt bypass file {path:?}: {source}")]
    Corrupt {
        /// Path of the file involved.
        path: PathBuf,
        /// Underlying decode error.
        #[source]
        source: serde_json::Error,
    },

    /// Records could not be encoded.
    #[error("failed to encode bypass records: {0}")]
    Encode(#[source] serde_json::Error),

    /// Backend refused the write.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// How a bypass ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BypassKind {
    /// Expires at `end_time`.
    Timed,
    /// Lasts until cancelled or the next restart.
    Emergency,
}

impl BypassKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timed => "timed",
            Self::Emergency => "emergency",
        }
    }
}

/// An active bypass for one domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BypassRecord {
    pub domain: Domain,
    pub kind: BypassKind,
    pub start_time: Timestamp,
    /// Absent for emergency bypasses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<Timestamp>,
    /// Requested length of a timed bypass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<u32>,
    pub original_url: String,
}

impl BypassRecord {
    /// Whether a timed bypass has run out at `now`.
    ///
    /// A timed record without an end time is treated as expired; emergency
    /// records never expire.
    #[must_use]
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        match self.kind {
            BypassKind::Emergency => false,
            BypassKind::Timed => self.end_time.is_none_or(|end| now >= end),
        }
    }
}

/// Trait for durable bypass persistence.
///
/// Implementations must make each write atomic with respect to reads: a
/// concurrent `get` sees either the old record or the new one.
pub trait BypassStore: Send + Sync + 'static {
    /// Get the record for `domain`, if any.
    fn get(
        &self,
        domain: &Domain,
    ) -> impl Future<Output = Result<Option<BypassRecord>, StoreError>> + Send;

    /// Insert or replace the record for `domain`.
    fn put(
        &self,
        domain: Domain,
        record: BypassRecord,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Remove the record for `domain`. Removing a missing record succeeds.
    fn delete(&self, domain: &Domain) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Snapshot of every stored record.
    fn all_entries(
        &self,
    ) -> impl Future<Output = Result<Vec<(Domain, BypassRecord)>, StoreError>> + Send;

    /// The persisted global blocking switch, `None` if it was never set.
    fn blocking_enabled(&self) -> impl Future<Output = Result<Option<bool>, StoreError>> + Send;

    /// Persist the global blocking switch.
    fn set_blocking_enabled(
        &self,
        enabled: bool,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}
