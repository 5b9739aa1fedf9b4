//! # Bridge Error Types
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Bridge Error Categories                            │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Protocol            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Unavailable    │  │  InvalidKey             │ │
//! │  │                 │  │  SessionFailed  │  │  TopicMismatch          │ │
//! │  │                 │  │  Backpressure   │  │  Serialization          │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Result type alias for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors raised by the broker bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid broker configuration.
    #[error("Invalid broker configuration: {0}")]
    InvalidConfig(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// The broker is not reachable; the message was dropped.
    #[error("Broker unavailable, message dropped")]
    Unavailable,

    /// Opening or using the zenoh session failed.
    #[error("Broker session error: {0}")]
    SessionFailed(String),

    /// Outgoing queue is full; the message was dropped.
    #[error("Outgoing queue full, message dropped")]
    Backpressure,

    /// The transport task has stopped.
    #[error("Bridge is shut down")]
    ShutDown,

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// A key expression did not match `{prefix}/{site}/{up|down}/{topic}`.
    #[error("Invalid key expression: {0}")]
    InvalidKey(String),

    /// The payload's `type` does not match the topic it arrived on.
    #[error("Payload type {actual} arrived on topic {expected}")]
    TopicMismatch { expected: String, actual: String },

    /// JSON encode/decode failed.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<zenoh::Error> for BridgeError {
    fn from(err: zenoh::Error) -> Self {
        BridgeError::SessionFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl BridgeError {
    /// True when the condition is transient and the broker loop should
    /// back off and try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::Unavailable | BridgeError::SessionFailed(_) | BridgeError::Backpressure
        )
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
