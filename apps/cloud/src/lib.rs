//! # Canopy Cloud Relay
//!
//! Sits between browser viewers and edge sites.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Cloud Relay                                    │
//! │                                                                         │
//! │  viewers ──► hub (/ws) ──► registry actor ──► request/start|stop ──┐   │
//! │     ▲                            │                                  │   │
//! │     └──── telemetry/status/alarm ┘                                  │   │
//! │                                  ▲                                  ▼   │
//! │  operators ──► /api/sites/{id}/commands ──► CommandForwarder ──► bridge │
//! │                                  │                                  │   │
//! │                         inbound router ◄──── canopy/*/up/** ◄───────┘   │
//! │                                  │                                      │
//! │                                  ▼                                      │
//! │             SQLite: last_contact_at, alarms, commands, summaries        │
//! │                                  ▲                                      │
//! │                         liveness monitor (every 60s)                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration
//! See [`config`] for the `CANOPY_*` environment variables.

pub mod access;
pub mod auth;
pub mod commands;
pub mod config;
pub mod error;
pub mod hub;
pub mod inbound;
pub mod liveness;
pub mod protocol;
pub mod registry;

// Re-exports
pub use access::{AccessError, AccessPolicy, Authorized, DbAccessPolicy};
pub use auth::{Claims, JwtManager};
pub use commands::CommandForwarder;
pub use config::{CloudConfig, ConfigError};
pub use error::{RelayError, RelayResult};
pub use hub::AppState;
pub use inbound::InboundRouter;
pub use liveness::{CheckSummary, LivenessMonitor};
pub use protocol::{ClientMessage, PushKind, ServerMessage};
pub use registry::{ConnId, Registry, RegistryActor, RegistryHandle};
