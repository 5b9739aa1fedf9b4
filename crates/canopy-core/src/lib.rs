//! # canopy-core: Pure Domain Types for Canopy
//!
//! Shared vocabulary of the edge/cloud relay. No I/O lives here.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Canopy Architecture                              │
//! │                                                                         │
//! │   Viewers (WebSocket)                  Edge controller hardware        │
//! │         │                                        ▲                      │
//! │  ┌──────▼──────────────┐   zenoh     ┌───────────┴─────────┐           │
//! │  │   apps/cloud        │◄──────────► │   apps/edge          │           │
//! │  │ registry, liveness  │   broker    │ controller, sync     │           │
//! │  └──────┬──────────────┘             └───────────┬─────────┘           │
//! │         │                                        │                      │
//! │  ┌──────▼────────────────────────────────────────▼──────────────────┐  │
//! │  │            canopy-db  ·  canopy-bridge                            │  │
//! │  └──────┬────────────────────────────────────────┬──────────────────┘  │
//! │  ┌──────▼────────────────────────────────────────▼──────────────────┐  │
//! │  │               ★ canopy-core (THIS CRATE) ★                        │  │
//! │  │   types · control · validation · clock                            │  │
//! │  └───────────────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Site, CommandRecord, AlarmEpisode, DailySummary, ...
//! - [`control`] - Edge operating-state machine (emergency-stop, start, ...)
//! - [`validation`] - Site/channel names and config values
//! - [`clock`] - Injectable time source
//! - [`error`] - Domain error types

// =============================================================================
// Module Declarations
// =============================================================================

pub mod clock;
pub mod control;
pub mod error;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use clock::{Clock, ManualClock, SystemClock};
pub use control::{ControlAction, ControllerState, OperatingState, Transition};
pub use error::{CoreError, ValidationError};
pub use types::*;
