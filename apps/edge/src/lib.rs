//! # Canopy Edge Agent
//!
//! Runs beside one site's irrigation controller.
//!
//! ## Responsibilities
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Edge Agent                                     │
//! │                                                                         │
//! │  controller   every command → one audit record; status on change       │
//! │  telemetry    detail samples always, live snapshots while requested    │
//! │  heartbeat    keeps the cloud's last_contact_at fresh                  │
//! │  inbound      command · config-update · request/start · request/stop   │
//! │  scheduler    daily summary at fire_at, then retention                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration
//! See [`config`] for the `edge.toml` layout and `CANOPY_*` overrides.

pub mod agent;
pub mod config;
pub mod controller;
pub mod error;
pub mod heartbeat;
pub mod inbound;
pub mod scheduler;
pub mod telemetry;

// Re-exports
pub use agent::EdgeAgent;
pub use config::EdgeConfig;
pub use controller::{CommandRequest, Controller};
pub use error::{EdgeError, EdgeResult};
pub use heartbeat::Heartbeat;
pub use inbound::DownlinkHandler;
pub use scheduler::{next_fire_after, DailySync, Firing, Purged, SyncOutcome};
pub use telemetry::{Sensors, SimulatedSensors, Telemetry};
