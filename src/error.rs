//! Unified error handling for the route-guard library.
//!
//! Data-integrity failures (store reads/writes, missing records) surface as
//! [`GuardError`]. Expected non-results such as a journey that is too short
//! to analyse or a deviation check without a matched route are modelled as
//! outcomes by their callers, not as errors.

use std::fmt;

use thiserror::Error;

/// Kind of record a lookup failed to find.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Journey,
    Route,
    Deviation,
    Contact,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordKind::Journey => "Journey",
            RecordKind::Route => "Route",
            RecordKind::Deviation => "Deviation",
            RecordKind::Contact => "Contact",
        };
        f.write_str(name)
    }
}

/// Unified error type for route-guard operations.
#[derive(Debug, Error)]
pub enum GuardError {
    /// A referenced record does not exist
    #[error("{kind} {id} not found")]
    NotFound { kind: RecordKind, id: i64 },

    /// The session already has an open journey
    #[error("Session is already tracking journey {journey_id}")]
    AlreadyTracking { journey_id: i64 },

    /// The session has no open journey
    #[error("Session is not tracking a journey")]
    NotTracking,

    /// Persistence/storage error
    #[error("Persistence error: {message}")]
    Persistence { message: String },

    /// A user or contact notification could not be delivered
    #[error("Notification delivery failed: {message}")]
    NotificationDelivery { message: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Generic internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl GuardError {
    pub fn persistence(message: impl Into<String>) -> Self {
        GuardError::Persistence {
            message: message.into(),
        }
    }

    pub fn delivery(message: impl Into<String>) -> Self {
        GuardError::NotificationDelivery {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for GuardError {
    fn from(err: serde_json::Error) -> Self {
        GuardError::Config {
            message: err.to_string(),
        }
    }
}

#[cfg(feature = "persistence")]
impl From<rusqlite::Error> for GuardError {
    fn from(err: rusqlite::Error) -> Self {
        GuardError::Persistence {
            message: err.to_string(),
        }
    }
}

#[cfg(feature = "persistence")]
impl From<rmp_serde::encode::Error> for GuardError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        GuardError::Persistence {
            message: format!("point encoding: {}", err),
        }
    }
}

#[cfg(feature = "persistence")]
impl From<rmp_serde::decode::Error> for GuardError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        GuardError::Persistence {
            message: format!("point decoding: {}", err),
        }
    }
}

/// Result type alias for route-guard operations.
pub type Result<T> = std::result::Result<T, GuardError>;

/// Extension trait for converting Option to GuardError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a not-found error.
    fn ok_or_missing(self, kind: RecordKind, id: i64) -> Result<T>;

    /// Convert Option to Result with generic internal error.
    fn ok_or_internal(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_missing(self, kind: RecordKind, id: i64) -> Result<T> {
        self.ok_or(GuardError::NotFound { kind, id })
    }

    fn ok_or_internal(self, message: &str) -> Result<T> {
        self.ok_or_else(|| GuardError::Internal {
            message: message.to_string(),
        })
    }
}
