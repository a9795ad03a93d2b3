//! # Sync Error Types
//!
//! Error types for the channel and every component built on it.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Pairing      │  │   Transport     │  │     Resolution          │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  Unregistered   │  │  NotConnected   │  │  code not in catalog    │ │
//! │  │  NotApproved    │  │  QueueFull      │  │  (named "not found" ack)│ │
//! │  │  Blocked        │  │  ConnectFailed  │  │                         │ │
//! │  │  UnknownDevice  │  │  Timeout        │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │    Protocol     │  │   Domain / Database     │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  InvalidMessage │  │  Core(CoreError)        │ │
//! │  │  InvalidUrl     │  │  UnknownEvent   │  │  Database(DbError)      │ │
//! │  │  Load/Save      │  │  Serialization  │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A stale `targetCartId` is not an error at all: the router's fallback
//! chain absorbs it and flags the ack.

use thiserror::Error;

use tally_core::{CoreError, ValidationError};
use tally_db::DbError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

// =============================================================================
// Pairing Errors
// =============================================================================

/// Why a device may not scan right now.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PairingError {
    /// No identity yet, or the identity was deleted by the administrator.
    #[error("Device is not registered")]
    Unregistered,

    #[error("Device is waiting for approval")]
    NotApproved,

    #[error("Device is blocked")]
    Blocked,

    /// The registry has no record for this id.
    #[error("Unknown device: {0}")]
    UnknownDevice(String),
}

// =============================================================================
// Transport Errors
// =============================================================================

/// Channel failures. Messages are never queued across a disconnect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// `broadcast` was called while the channel was not `Connected`.
    #[error("Channel is not connected")]
    NotConnected,

    /// The outbound queue is at capacity.
    #[error("Outbound queue is full")]
    QueueFull,

    /// The link dropped the frame.
    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Connection timeout after {0} ms")]
    Timeout(u64),

    /// The driver task has stopped.
    #[error("Channel is shut down")]
    Closed,
}

// =============================================================================
// Sync Error
// =============================================================================

/// Error type covering every failure in this crate.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Pairing error: {0}")]
    Pairing(#[from] PairingError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Scanned code did not resolve against the catalog.
    #[error("Product not found: {code}")]
    Resolution { code: String },

    /// Domain rule violation (invalid transition, missing cart, line limit).
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Payload failed schema or validation checks.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Event name not part of the protocol for this topic.
    #[error("Unknown event '{event}' on topic '{topic}'")]
    UnknownEvent { topic: String, event: String },

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Non-success answer from the hub's HTTP API.
    #[error("Hub API error {code}: {message}")]
    Api { code: String, message: String },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Service is shutting down")]
    ShuttingDown,

    /// The scanner is not in a state that allows the operation.
    #[error("Not allowed while {0}")]
    InvalidState(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<ValidationError> for SyncError {
    fn from(err: ValidationError) -> Self {
        SyncError::Core(CoreError::Validation(err))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                SyncError::Transport(TransportError::NotConnected)
            }
            WsError::Io(io) => SyncError::Transport(TransportError::ConnectFailed(io.to_string())),
            other => SyncError::Transport(TransportError::SendFailed(other.to_string())),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Transport(TransportError::Timeout(0))
        } else if err.is_connect() {
            SyncError::Transport(TransportError::ConnectFailed(err.to_string()))
        } else if err.is_decode() {
            SyncError::SerializationFailed(err.to_string())
        } else {
            SyncError::Internal(err.to_string())
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Returns true if the operation can be retried after a reconnect.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(
                TransportError::NotConnected
                    | TransportError::QueueFull
                    | TransportError::SendFailed(_)
                    | TransportError::ConnectFailed(_)
                    | TransportError::Timeout(_)
            )
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Returns true if this error indicates a malformed or unexpected message.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidMessage(_)
                | SyncError::UnknownEvent { .. }
                | SyncError::SerializationFailed(_)
        )
    }

    /// Returns true if the device record does not exist.
    pub fn is_unknown_device(&self) -> bool {
        matches!(
            self,
            SyncError::Pairing(PairingError::UnknownDevice(_))
        ) || matches!(self, SyncError::Database(db) if db.is_not_found())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::{DeviceAction, DeviceStatus};

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::from(TransportError::NotConnected).is_retryable());
        assert!(SyncError::from(TransportError::Timeout(5000)).is_retryable());
        assert!(SyncError::from(TransportError::ConnectFailed("refused".into())).is_retryable());

        assert!(!SyncError::from(TransportError::Closed).is_retryable());
        assert!(!SyncError::from(PairingError::Blocked).is_retryable());
        assert!(!SyncError::Resolution { code: "1042".into() }.is_retryable());
    }

    #[test]
    fn test_categories() {
        assert!(SyncError::InvalidUrl("nope".into()).is_config_error());
        assert!(SyncError::UnknownEvent {
            topic: "pos-scans".into(),
            event: "bogus".into()
        }
        .is_protocol_error());
        assert!(SyncError::from(PairingError::UnknownDevice("d-1".into())).is_unknown_device());
        assert!(SyncError::from(DbError::not_found("Device", "d-1")).is_unknown_device());
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::from(CoreError::InvalidTransition {
            action: DeviceAction::Approve,
            current: DeviceStatus::Blocked,
        });
        assert_eq!(err.to_string(), "Cannot approve a device that is blocked");

        let err = SyncError::Resolution { code: "9999".into() };
        assert!(err.to_string().contains("9999"));
    }
}
