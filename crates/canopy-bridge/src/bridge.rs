//! # Bridge Contract
//!
//! What the rest of a tier sees of the broker: a fire-and-forget `publish`,
//! a connectivity flag, and inbound routes keyed by topic.
//!
//! ## Inbound Routing
//! ```text
//!  zenoh sample ──► TopicSpace::parse ──► SiteMessage::decode
//!                                               │
//!                                               ▼
//!                                   InboundRoutes::deliver
//!                                               │
//!           ┌───────────────────┬───────────────┴────┬───────────────────┐
//!           ▼                   ▼                    ▼                   ▼
//!    telemetry/status/     heartbeat            daily-summary       (no route)
//!    alarm receiver        receiver             receiver            dropped, debug log
//! ```
//!
//! A full receiver drops the message with a warning rather than stalling the
//! transport loop.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::BridgeResult;
use crate::protocol::SiteMessage;
use crate::topic::Topic;

// =============================================================================
// Bridge Trait
// =============================================================================

/// Publishing side of a tier's broker connection.
///
/// `publish` never blocks and never surfaces delivery confirmation. While the
/// broker is unreachable it returns [`crate::BridgeError::Unavailable`] and
/// the message is gone; there is no outbound queue to drain later.
pub trait Bridge: Send + Sync {
    /// Publishes `message` on its topic for `site`.
    fn publish(&self, site: &str, message: &SiteMessage) -> BridgeResult<()>;

    /// Whether the broker is currently reachable.
    fn is_connected(&self) -> bool;
}

// =============================================================================
// Inbound Messages
// =============================================================================

/// A decoded message from the broker together with its origin.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub site: String,
    pub topic: Topic,
    pub message: SiteMessage,
    pub received_at: DateTime<Utc>,
}

// =============================================================================
// Inbound Routes
// =============================================================================

/// Handler registrations, built before the transport starts.
#[derive(Debug, Default)]
pub struct InboundRoutes {
    routes: HashMap<Topic, mpsc::Sender<InboundMessage>>,
}

impl InboundRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler queue for one topic.
    pub fn route(&mut self, topic: Topic, capacity: usize) -> mpsc::Receiver<InboundMessage> {
        self.route_many(&[topic], capacity)
    }

    /// Registers one handler queue shared by several topics. A later
    /// registration for the same topic replaces the earlier one.
    pub fn route_many(&mut self, topics: &[Topic], capacity: usize) -> mpsc::Receiver<InboundMessage> {
        let (tx, rx) = mpsc::channel(capacity);
        for topic in topics {
            self.routes.insert(*topic, tx.clone());
        }
        rx
    }

    pub fn is_routed(&self, topic: Topic) -> bool {
        self.routes.contains_key(&topic)
    }

    /// Hands a message to its handler without waiting.
    ///
    /// ## Returns
    /// `true` if a handler accepted it.
    pub fn deliver(&self, inbound: InboundMessage) -> bool {
        let Some(tx) = self.routes.get(&inbound.topic) else {
            debug!(site = %inbound.site, topic = %inbound.topic, "No route for inbound topic");
            return false;
        };

        match tx.try_send(inbound) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!(
                    site = %dropped.site,
                    topic = %dropped.topic,
                    "Inbound handler queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(dropped)) => {
                debug!(site = %dropped.site, topic = %dropped.topic, "Inbound handler gone");
                false
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DemandMessage;

    fn inbound(topic: Topic, message: SiteMessage) -> InboundMessage {
        InboundMessage {
            site: "farm-01".to_string(),
            topic,
            message,
            received_at: Utc::now(),
        }
    }

    fn demand() -> SiteMessage {
        SiteMessage::RequestStart(DemandMessage {
            timestamp: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_routes_by_topic() {
        let mut routes = InboundRoutes::new();
        let mut demand_rx = routes.route_many(&[Topic::RequestStart, Topic::RequestStop], 4);

        assert!(routes.is_routed(Topic::RequestStop));
        assert!(!routes.is_routed(Topic::Command));

        assert!(routes.deliver(inbound(Topic::RequestStart, demand())));
        assert!(!routes.deliver(inbound(Topic::Command, demand())));

        let got = demand_rx.recv().await.unwrap();
        assert_eq!(got.topic, Topic::RequestStart);
        assert_eq!(got.site, "farm-01");
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        let mut routes = InboundRoutes::new();
        let _rx = routes.route(Topic::RequestStart, 1);

        assert!(routes.deliver(inbound(Topic::RequestStart, demand())));
        assert!(!routes.deliver(inbound(Topic::RequestStart, demand())));
    }
}
