//! Unified error handling for the cadence crate
//!
//! Domain-specific errors live next to their modules ([`StoreError`],
//! [`TransportError`]); this module defines [`ConfigError`] for synchronous
//! configuration rejection and the unified [`Error`] enum used across module
//! boundaries.
//!
//! Propagation policy: `ConfigError` surfaces synchronously to the caller
//! that submitted the configuration; dispatch-time outcomes are recorded on
//! the job record and surfaced only through queue/telemetry reads.

use thiserror::Error;

pub use crate::dispatch::transport::TransportError;
pub use crate::store::StoreError;

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Invalid configuration, rejected synchronously
    Config,
    /// Storage and I/O errors
    Storage,
    /// Transport (provider) errors
    Transport,
    /// Dispatch control errors (claim races, paused schedules)
    Dispatch,
    /// Other/unknown errors
    Other,
}

/// Invalid configuration submitted through the config surface.
/// Always rejected synchronously, never recorded on a job.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Malformed or empty time-of-day window
    #[error("Invalid window '{window}': {reason}")]
    InvalidWindow { window: String, reason: String },

    /// Unknown IANA timezone name
    #[error("Invalid timezone: {tz}")]
    InvalidTimezone { tz: String },

    /// Throttle or concurrency value out of range
    #[error("Invalid rate config '{field}': {reason}")]
    InvalidRate { field: String, reason: String },

    /// Unknown status string in stored data
    #[error("Invalid status: {status}")]
    InvalidStatus { status: String },

    /// Recipient address without a parsable domain
    #[error("Invalid recipient address: {address}")]
    InvalidRecipient { address: String },

    /// Timing config edited while jobs are mid-processing
    #[error("Schedule {schedule_id} has {processing} job(s) mid-processing; config is frozen")]
    ScheduleBusy {
        schedule_id: String,
        processing: u64,
    },

    /// Control operation rejected in the current state
    #[error("Schedule {schedule_id}: {reason}")]
    InvalidControl {
        schedule_id: String,
        reason: String,
    },
}

impl ConfigError {
    pub fn invalid_window(window: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidWindow {
            window: window.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_timezone(tz: impl Into<String>) -> Self {
        Self::InvalidTimezone { tz: tz.into() }
    }

    pub fn invalid_rate(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRate {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_status(status: impl Into<String>) -> Self {
        Self::InvalidStatus {
            status: status.into(),
        }
    }

    pub fn invalid_recipient(address: impl Into<String>) -> Self {
        Self::InvalidRecipient {
            address: address.into(),
        }
    }

    pub fn schedule_busy(schedule_id: impl Into<String>, processing: u64) -> Self {
        Self::ScheduleBusy {
            schedule_id: schedule_id.into(),
            processing,
        }
    }

    pub fn invalid_control(schedule_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidControl {
            schedule_id: schedule_id.into(),
            reason: reason.into(),
        }
    }
}

/// Unified error type for the cadence crate
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Job/schedule store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Another worker already claimed the job. Not user-visible; the
    /// dispatcher silently moves to the next candidate.
    #[error("Job {job_id} already claimed by another worker")]
    ClaimConflict { job_id: String },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    pub fn claim_conflict(job_id: impl Into<String>) -> Self {
        Self::ClaimConflict {
            job_id: job_id.into(),
        }
    }

    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Check if this error is recoverable (worth retrying)
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Store(e) => e.is_recoverable(),
            Self::Transport(e) => e.is_transient(),
            Self::ClaimConflict { .. } => true,
            Self::Json(_) => false,
            Self::Io(_) => true,
            Self::Other { .. } => false,
        }
    }

    /// Get the error category for handling strategies
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) => ErrorCategory::Config,
            Self::Store(_) | Self::Io(_) => ErrorCategory::Storage,
            Self::Transport(_) => ErrorCategory::Transport,
            Self::ClaimConflict { .. } => ErrorCategory::Dispatch,
            Self::Json(_) => ErrorCategory::Storage,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_not_recoverable() {
        let err: Error = ConfigError::invalid_timezone("Nowhere/Void").into();
        assert_eq!(err.category(), ErrorCategory::Config);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_claim_conflict_is_recoverable() {
        let err = Error::claim_conflict("job-1");
        assert_eq!(err.category(), ErrorCategory::Dispatch);
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_transport_transient_classification() {
        let transient: Error = TransportError::transient("mailbox busy").into();
        assert!(transient.is_recoverable());

        let permanent: Error = TransportError::permanent("invalid recipient").into();
        assert!(!permanent.is_recoverable());
    }
}
