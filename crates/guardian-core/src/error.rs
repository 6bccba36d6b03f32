//! Error types for the guardian core.

use thiserror::Error;

/// Top-level error composed from each subsystem's error type.
#[derive(Error, Debug)]
pub enum GuardianError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("inbox error: {0}")]
    Inbox(#[from] InboxError),

    #[error("agent loop error: {0}")]
    Loop(#[from] LoopError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors from the persistent store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to open store: {0}")]
    Open(String),

    #[error("migration failed (version {version}): {reason}")]
    Migration { version: u32, reason: String },

    #[error("stored schema version {found} is newer than the supported version {known}")]
    FutureSchema { found: u32, known: u32 },

    #[error("store integrity check failed: integrity violation detected ({0})")]
    Integrity(String),

    #[error("transaction failed: {0}")]
    Transaction(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Errors the policy engine can legitimately raise. Most rule failures
/// are captured as data (`deny("RULE_ERROR")`) rather than propagated
/// as `Err` here — see `policy::engine` for the fail-closed boundary.
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("invalid schedule expression: {0}")]
    InvalidSchedule(String),
}

#[derive(Error, Debug)]
pub enum InboxError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("message not found: {0}")]
    NotFound(String),
}

#[derive(Error, Debug)]
pub enum LoopError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("inbox error: {0}")]
    Inbox(#[from] InboxError),

    #[error("transient external failure: {0}")]
    Transient(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required configuration: {key}")]
    MissingRequired { key: String },

    #[error("invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}
