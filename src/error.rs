//! Stagehand Error Types

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::hlc::Hlc;

/// Result type alias for stagehand operations
pub type Result<T> = std::result::Result<T, Error>;

/// Stagehand error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Control-flow sentinels
    #[error("no work")]
    NoWork,

    #[error("lease is held by another caller until {expiration}")]
    LeaseBusy { expiration: DateTime<Utc> },

    #[error("singleton requested cancellation")]
    CancelSingleton,

    // Staging errors
    #[error("empty mutation key staged for {table}")]
    EmptyKey { table: String },

    #[error("table {table} has {want} primary key columns, but the key carries {got}")]
    KeyArity { table: String, want: usize, got: usize },

    // Resolver errors
    #[error("no tables known in schema {0}; have they been created?")]
    EmptySchema(String),

    #[error("proposed timestamp {proposed} does not advance past {committed}")]
    StampRegression { committed: Hlc, proposed: Hlc },

    #[error("{0} called in an invalid stamp state")]
    StampState(&'static str),

    // Timing errors
    #[error("apply timed out after {0:?}")]
    ApplyTimeout(std::time::Duration),

    // Chaos (testing only)
    #[error("chaos: {0}")]
    Chaos(&'static str),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this is the no-work sentinel rather than a failure
    pub fn is_no_work(&self) -> bool {
        matches!(self, Error::NoWork)
    }

    /// Check if this is the busy-lease sentinel; returns the expiration
    pub fn lease_busy(&self) -> Option<DateTime<Utc>> {
        match self {
            Error::LeaseBusy { expiration } => Some(*expiration),
            _ => None,
        }
    }

    /// Check if this error is a clean cancellation rather than a failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::ShuttingDown)
    }

    /// Check if the enclosing loop should restart with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Database(_) | Error::ApplyTimeout(_) | Error::Chaos(_)
        )
    }
}
