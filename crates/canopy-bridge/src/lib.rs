//! # canopy-bridge: Broker Bridge for Canopy
//!
//! One bridge per tier. The cloud relay listens on every site's uplink; an
//! edge agent listens on its own downlink. Both publish through the same
//! [`Bridge`] trait.
//!
//! ## Data Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   cloud relay                      broker                 edge agent   │
//! │  ┌───────────┐   down/command       ┌───┐   down/**      ┌───────────┐ │
//! │  │  Bridge   │ ───────────────────► │   │ ─────────────► │  Bridge   │ │
//! │  │  handle   │   up/telemetry ...   │ z │   up/heartbeat │  handle   │ │
//! │  │           │ ◄─────────────────── │   │ ◄───────────── │           │ │
//! │  └─────┬─────┘   */up/**            └───┘                └─────┬─────┘ │
//! │        │ InboundRoutes                                         │       │
//! │        ▼                                                       ▼       │
//! │   registry, liveness                               controller, demand  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`topic`] - Key expressions and the nine topics
//! - [`protocol`] - JSON documents per topic
//! - [`bridge`] - `Bridge` trait and inbound routing
//! - [`transport`] - zenoh session with reconnect and backoff
//! - [`config`] - Broker settings
//! - [`error`] - Bridge error types

// =============================================================================
// Module Declarations
// =============================================================================

pub mod bridge;
pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
pub mod topic;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use bridge::{Bridge, InboundMessage, InboundRoutes};
pub use config::{BrokerConfig, SessionMode};
pub use error::{BridgeError, BridgeResult};
pub use protocol::*;
pub use topic::{Direction, Topic, TopicSpace};
pub use transport::{BridgeHandle, ConnectionState, Listen, Transport};
