//! # Error Types
//!
//! Domain error types for canopy-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  canopy-core (this file)                                               │
//! │  ├── CoreError        - Command and state-machine failures             │
//! │  └── ValidationError  - Names, times, retention windows                │
//! │                                                                         │
//! │  canopy-db      └── DbError       - Storage failures                   │
//! │  canopy-bridge  └── BridgeError   - Broker failures (never fatal)      │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → audit log result_detail           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Command handling errors.
///
/// Every variant ends up as the `result_detail` of a failed command record,
/// so messages are written for an operator reading the audit log.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Command type has no handler.
    #[error("Unknown command type: {0}")]
    UnknownCommand(String),

    /// Command arguments are missing or malformed.
    #[error("Invalid {command} command: {reason}")]
    InvalidCommand { command: String, reason: String },

    /// Command is not allowed in the current operating state.
    ///
    /// ## When This Occurs
    /// - `start` or `manual` while in EMERGENCY
    #[error("Cannot {command} while {state}")]
    InvalidTransition { command: String, state: String },

    /// Actuator channel is not configured on this controller.
    #[error("Unknown actuator channel: {0}")]
    UnknownChannel(String),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Invalid format (e.g., reserved characters, unparsable time).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================
