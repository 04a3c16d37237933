//! Error taxonomy for the sync engine.
//!
//! Errors fall into two classes. Per-record and per-batch errors
//! ([`SyncError::SourceMalformed`], [`SyncError::IdentityUnresolved`],
//! [`SyncError::Mapping`], [`SyncError::UploadRejected`]) are counted and
//! logged where they occur and never abort a run. Everything for which
//! [`SyncError::is_fatal`] returns `true` aborts the run and moves the
//! orchestrator to its `Failed` state.

use thiserror::Error;

use crate::models::EntityKind;

/// Errors produced by the sync engine and its collaborators.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("catalog unavailable: {message}")]
    SourceUnavailable { message: String, transient: bool },

    #[error("catalog rejected credentials (HTTP {status})")]
    SourceAuth { status: u16 },

    #[error("malformed {kind} record: {reason}")]
    SourceMalformed { kind: EntityKind, reason: String },

    #[error("identity reference could not be resolved: {reference}")]
    IdentityUnresolved { reference: String },

    #[error("cannot map {entity}: {reason}")]
    Mapping { entity: String, reason: String },

    #[error("index rejected batch of {items} item(s): {message}")]
    UploadRejected { items: usize, message: String },

    #[error("index unavailable: {message}")]
    TargetUnavailable { message: String },

    #[error("index rejected credentials (HTTP {status})")]
    TargetAuth { status: u16 },

    #[error("failed to provision datasource: {message}")]
    DatasourceSetup { message: String },

    #[error("failed to signal generation complete: {message}")]
    FinalizeFailed { message: String },

    #[error("entity sync incomplete for: {}", kinds.join(", "))]
    IncompleteGeneration { kinds: Vec<String> },

    #[error("no entity kinds are enabled for sync")]
    NoKindsEnabled,

    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Whether this error must abort the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::SourceAuth { .. }
                | SyncError::TargetAuth { .. }
                | SyncError::DatasourceSetup { .. }
                | SyncError::FinalizeFailed { .. }
                | SyncError::IncompleteGeneration { .. }
                | SyncError::NoKindsEnabled
                | SyncError::Cancelled
        )
    }

    /// Whether a retry with backoff may succeed.
    ///
    /// Only transient transport failures qualify: connection errors,
    /// timeouts, HTTP 5xx and HTTP 429. Authentication and malformed-record
    /// errors are never retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::SourceUnavailable {
                transient: true,
                ..
            } | SyncError::TargetUnavailable { .. }
        )
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
