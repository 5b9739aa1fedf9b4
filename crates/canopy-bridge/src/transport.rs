//! # Broker Transport
//!
//! zenoh session with automatic reopen and backoff.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Broker Connection States                           │
//! │                                                                         │
//! │  ┌────────────┐  session::open  ┌────────────┐                         │
//! │  │Disconnected│ ──────────────► │ Connecting │                         │
//! │  └────────────┘                 └─────┬──────┘                         │
//! │        ▲                              │                                 │
//! │        │                    success   │   failure                       │
//! │        │                        ┌─────┴─────┐                          │
//! │        │                        ▼           ▼                           │
//! │        │              ┌────────────┐  ┌────────────┐                   │
//! │        │              │ Connected  │  │ Backoff    │ ── timer ──┐      │
//! │        │              └──┬──────▲──┘  └────────────┘            │      │
//! │        │     no routers  │      │ routers back                  │      │
//! │        │     or peers    ▼      │                               │      │
//! │        │              ┌────────────┐                            │      │
//! │        └── shutdown ─ │Reconnecting│       Connecting ◄─────────┘      │
//! │                       └────────────┘                                    │
//! │                                                                         │
//! │  publish() succeeds only in Connected. Everything else returns         │
//! │  Unavailable and the message is dropped.                               │
//! │                                                                         │
//! │  BACKOFF: 500ms, 1s, 2s, ... capped at 60s, never gives up             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Once a session is open zenoh re-establishes router links on its own, so a
//! lost link shows up as `Reconnecting` (found by the periodic connectivity
//! check) rather than as a session teardown.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use zenoh::Session;

use crate::bridge::{Bridge, InboundMessage, InboundRoutes};
use crate::config::BrokerConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::SiteMessage;
use crate::session;
use crate::topic::TopicSpace;

// =============================================================================
// Transport State
// =============================================================================

/// Connection state of the broker transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected (initial, or after shutdown).
    Disconnected,
    /// Opening a session.
    Connecting,
    /// Session open with at least one reachable router or peer.
    Connected,
    /// Waiting before the next open attempt.
    Backoff,
    /// Session open but nothing reachable; zenoh is relinking.
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Backoff => write!(f, "backoff"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

// =============================================================================
// Subscription Scope
// =============================================================================

/// Which half of the namespace a tier listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Listen {
    /// Cloud relay: every site's uplink.
    AllUplinks,
    /// Edge agent: its own site's downlink.
    Downlink { site: String },
}

impl Listen {
    fn key_expr(&self, topics: &TopicSpace) -> String {
        match self {
            Listen::AllUplinks => topics.uplink_all(),
            Listen::Downlink { site } => topics.downlink_for(site),
        }
    }
}

/// An encoded message waiting for the transport task.
#[derive(Debug)]
struct Outgoing {
    key: String,
    payload: Vec<u8>,
}

// =============================================================================
// Bridge Handle
// =============================================================================

/// Cloneable handle to a running transport. Implements [`Bridge`].
#[derive(Clone)]
pub struct BridgeHandle {
    outgoing_tx: mpsc::Sender<Outgoing>,
    state: watch::Receiver<ConnectionState>,
    shutdown_tx: mpsc::Sender<()>,
    topics: TopicSpace,
}

impl BridgeHandle {
    /// Returns the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn topics(&self) -> &TopicSpace {
        &self.topics
    }

    /// Triggers graceful shutdown of the transport task.
    pub async fn shutdown(&self) -> BridgeResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| BridgeError::ShutDown)
    }
}

impl Bridge for BridgeHandle {
    fn publish(&self, site: &str, message: &SiteMessage) -> BridgeResult<()> {
        let topic = message.topic();
        if !self.is_connected() {
            debug!(site = %site, topic = %topic, state = %self.state(), "Broker down, dropping publish");
            return Err(BridgeError::Unavailable);
        }

        let outgoing = Outgoing {
            key: self.topics.key(site, topic),
            payload: message.encode()?,
        };

        self.outgoing_tx.try_send(outgoing).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => BridgeError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => BridgeError::ShutDown,
        })
    }

    fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }
}

// =============================================================================
// Transport
// =============================================================================

/// zenoh transport with automatic reopen.
///
/// ## Usage
/// ```rust,ignore
/// let mut routes = InboundRoutes::new();
/// let mut heartbeats = routes.route(Topic::Heartbeat, 256);
///
/// let bridge = Transport::spawn(config, Listen::AllUplinks, routes);
///
/// bridge.publish("farm-01", &SiteMessage::RequestStart(..))?;
/// while let Some(inbound) = heartbeats.recv().await { .. }
/// ```
pub struct Transport {
    config: BrokerConfig,
    topics: TopicSpace,
    listen: Listen,
    routes: InboundRoutes,
    state: watch::Sender<ConnectionState>,
    outgoing_rx: mpsc::Receiver<Outgoing>,
    shutdown_rx: mpsc::Receiver<()>,
}

/// Why a session loop returned.
enum SessionExit {
    Shutdown,
}

impl Transport {
    /// Spawns the background task and returns a handle to it.
    ///
    /// Never fails on an unreachable broker: the task keeps retrying while
    /// the host process runs without it.
    pub fn spawn(config: BrokerConfig, listen: Listen, routes: InboundRoutes) -> BridgeHandle {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(config.outgoing_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let topics = TopicSpace::new(config.key_prefix.clone());

        let transport = Transport {
            config,
            topics: topics.clone(),
            listen,
            routes,
            state: state_tx,
            outgoing_rx,
            shutdown_rx,
        };

        tokio::spawn(transport.run());

        BridgeHandle {
            outgoing_tx,
            state: state_rx,
            shutdown_tx,
            topics,
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Broker state changed");
        }
    }

    /// Main transport loop.
    async fn run(mut self) {
        let listen_key = self.listen.key_expr(&self.topics);
        info!(listen = %listen_key, "Broker transport starting");

        let mut backoff = self.create_backoff();
        let mut attempt = 0u32;

        loop {
            if self.shutdown_rx.try_recv().is_ok() {
                info!("Transport received shutdown signal");
                break;
            }

            self.set_state(ConnectionState::Connecting);

            match session::open(&self.config).await {
                Ok(session) => {
                    backoff.reset();
                    attempt = 0;

                    let exit = self.session_loop(&session, &listen_key).await;

                    if let Err(e) = session.close().await {
                        warn!(error = %e, "Failed to close broker session");
                    }

                    match exit {
                        Ok(SessionExit::Shutdown) => break,
                        Err(e) => warn!(error = %e, "Broker session ended"),
                    }
                }
                Err(e) if e.is_retryable() => {
                    warn!(error = %e, "Broker connect failed");
                }
                Err(e) => {
                    error!(error = %e, "Broker configuration rejected, bridge disabled");
                    break;
                }
            }

            self.set_state(ConnectionState::Backoff);
            attempt += 1;

            let Some(duration) = backoff.next_backoff() else {
                error!("Backoff exhausted");
                break;
            };
            debug!(?duration, attempt, "Waiting before reconnect");

            tokio::select! {
                _ = tokio::time::sleep(duration) => {}
                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown during backoff");
                    break;
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("Broker transport stopped");
    }

    /// Runs one open session: publishes, receives, and tracks reachability.
    async fn session_loop(&mut self, session: &Session, listen_key: &str) -> BridgeResult<SessionExit> {
        let subscriber = session.declare_subscriber(listen_key).await?;

        let mut check = tokio::time::interval(self.config.connectivity_check_interval());
        check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(out) = self.outgoing_rx.recv() => {
                    if let Err(e) = session.put(out.key.as_str(), out.payload).await {
                        warn!(key = %out.key, error = %e, "Publish failed, message dropped");
                    }
                }

                sample = subscriber.recv_async() => {
                    let sample = sample.map_err(|e| BridgeError::SessionFailed(e.to_string()))?;
                    let payload = sample.payload().to_bytes();
                    self.handle_sample(sample.key_expr().as_str(), &payload);
                }

                _ = check.tick() => {
                    if Self::reachable(session).await {
                        if *self.state.borrow() != ConnectionState::Connected {
                            info!("Broker connected");
                        }
                        self.set_state(ConnectionState::Connected);
                    } else {
                        if *self.state.borrow() == ConnectionState::Connected {
                            warn!("Broker unreachable, publishes will be dropped");
                        }
                        self.set_state(ConnectionState::Reconnecting);
                    }
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown signal received, closing broker session");
                    return Ok(SessionExit::Shutdown);
                }
            }
        }
    }

    /// Decodes a sample and hands it to its route.
    fn handle_sample(&self, key: &str, payload: &[u8]) {
        let (site, topic) = match self.topics.parse(key) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(error = %e, "Ignoring sample on unknown key");
                return;
            }
        };

        match SiteMessage::decode(topic, payload) {
            Ok(message) => {
                self.routes.deliver(InboundMessage {
                    site: site.to_string(),
                    topic,
                    message,
                    received_at: Utc::now(),
                });
            }
            Err(e) => {
                warn!(site = %site, topic = %topic, error = %e, "Dropping undecodable payload");
            }
        }
    }

    async fn reachable(session: &Session) -> bool {
        let info = session.info();
        let routers = info.routers_zid().await.count();
        let peers = info.peers_zid().await.count();
        routers + peers > 0
    }

    /// Creates the exponential backoff configuration.
    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.config.initial_backoff(),
            max_interval: self.config.max_backoff(),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionMode;
    use crate::protocol::DemandMessage;
    use crate::topic::Topic;
    use std::time::Duration;

    fn demand() -> SiteMessage {
        SiteMessage::RequestStart(DemandMessage {
            timestamp: Utc::now(),
        })
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Disconnected.to_string(), "disconnected");
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
    }

    #[test]
    fn test_listen_key_expr() {
        let topics = TopicSpace::default();
        assert_eq!(Listen::AllUplinks.key_expr(&topics), "canopy/*/up/**");
        let edge = Listen::Downlink {
            site: "farm-01".to_string(),
        };
        assert_eq!(edge.key_expr(&topics), "canopy/farm-01/down/**");
    }

    #[test]
    fn test_handle_publish_gated_on_state() {
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel(1);
        let (shutdown_tx, _shutdown_rx) = mpsc::channel(1);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Backoff);
        let handle = BridgeHandle {
            outgoing_tx,
            state: state_rx,
            shutdown_tx,
            topics: TopicSpace::default(),
        };

        let err = handle.publish("farm-01", &demand()).unwrap_err();
        assert!(matches!(err, BridgeError::Unavailable));
        assert!(outgoing_rx.try_recv().is_err());

        state_tx.send_replace(ConnectionState::Connected);
        assert!(handle.is_connected());
        handle.publish("farm-01", &demand()).unwrap();
        let sent = outgoing_rx.try_recv().unwrap();
        assert_eq!(sent.key, "canopy/farm-01/down/request/start");

        // Queue of one is now full.
        handle.publish("farm-01", &demand()).unwrap();
        let err = handle.publish("farm-01", &demand()).unwrap_err();
        assert!(matches!(err, BridgeError::Backpressure));
    }

    #[test]
    fn test_backoff_schedule() {
        let (_, outgoing_rx) = mpsc::channel(1);
        let (_, shutdown_rx) = mpsc::channel(1);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let transport = Transport {
            config: BrokerConfig::default(),
            topics: TopicSpace::default(),
            listen: Listen::AllUplinks,
            routes: InboundRoutes::new(),
            state,
            outgoing_rx,
            shutdown_rx,
        };

        let backoff = transport.create_backoff();
        assert_eq!(backoff.initial_interval, Duration::from_millis(500));
        assert_eq!(backoff.max_interval, Duration::from_secs(60));
        assert!(backoff.max_elapsed_time.is_none());
    }

    #[tokio::test]
    async fn test_handle_sample_routes_and_filters() {
        let mut routes = InboundRoutes::new();
        let mut rx = routes.route(Topic::RequestStart, 4);
        let (_, outgoing_rx) = mpsc::channel(1);
        let (_, shutdown_rx) = mpsc::channel(1);
        let (state, _) = watch::channel(ConnectionState::Connected);
        let transport = Transport {
            config: BrokerConfig {
                mode: SessionMode::Peer,
                ..Default::default()
            },
            topics: TopicSpace::default(),
            listen: Listen::Downlink {
                site: "farm-01".to_string(),
            },
            routes,
            state,
            outgoing_rx,
            shutdown_rx,
        };

        let payload = demand().encode().unwrap();
        transport.handle_sample("canopy/farm-01/down/request/start", &payload);
        // Wrong topic for the payload type, unknown key, and garbage are dropped.
        transport.handle_sample("canopy/farm-01/down/request/stop", &payload);
        transport.handle_sample("elsewhere/farm-01/down/request/start", &payload);
        transport.handle_sample("canopy/farm-01/down/request/start", b"{");

        let got = rx.recv().await.unwrap();
        assert_eq!(got.site, "farm-01");
        assert_eq!(got.topic, Topic::RequestStart);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unreachable_broker_is_not_fatal() {
        let config = BrokerConfig {
            connect: vec!["tcp/127.0.0.1:9".to_string()],
            initial_backoff_ms: 50,
            max_backoff_secs: 1,
            ..Default::default()
        };
        let handle = Transport::spawn(config, Listen::AllUplinks, InboundRoutes::new());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!handle.is_connected());
        assert!(matches!(
            handle.publish("farm-01", &demand()),
            Err(BridgeError::Unavailable)
        ));

        handle.shutdown().await.unwrap();
    }
}
