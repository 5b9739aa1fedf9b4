//! # Subscription Registry & Fan-out
//!
//! Tracks which viewer connection watches which site, drives the edge's
//! telemetry demand, and relays site events to viewers.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Registry Actor                                   │
//! │                                                                         │
//! │  hub (per socket) ──┐                                                   │
//! │  inbound router ────┼──► RegistryCommand ──► ┌──────────────────────┐  │
//! │  liveness monitor ──┘        (mpsc)          │      Registry        │  │
//! │                                              │                      │  │
//! │         ┌──────── AccessResolved ◄────────── │ viewers: conn → seq, │  │
//! │         │         {conn, seq, result}        │          site, sink  │  │
//! │  spawned access check                        │ sites:   name → set  │  │
//! │  (suspends on storage)                       └──────────┬───────────┘  │
//! │                                                         │              │
//! │                          0→1: request/start ◄───────────┤              │
//! │                          1→0: request/stop  ◄───────────┘              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Stale Access Results
//! ```text
//!  subscribe(A)  seq=1 ──► check A ........................ result A (seq 1)
//!  subscribe(B)  seq=2 ──► check B ...... result B (seq 2)        │
//!                                              │                   │
//!                                   seq 2 == 2 ✓ apply   seq 1 != 2 ✗ drop
//! ```
//! Any later subscribe or unsubscribe bumps the sequence, so a slow check can
//! never undo what the viewer asked for afterwards.
//!
//! ## Invariant
//! A site appears in `sites` if and only if its viewer set is non-empty. The
//! 0→1 and 1→0 transitions are the only points that emit demand signals.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, info, warn};

use canopy_bridge::{Bridge, DemandMessage, SiteMessage};
use canopy_core::Site;

use crate::access::{AccessError, AccessPolicy, Authorized};
use crate::error::RelayError;
use crate::protocol::{PushKind, ServerMessage};

/// Identifier of one viewer connection, unique for the process lifetime.
pub type ConnId = u64;

/// Capacity of the actor's command queue.
const COMMAND_QUEUE: usize = 1024;

// =============================================================================
// Registry State
// =============================================================================

/// Per-connection record.
struct Viewer {
    sink: mpsc::Sender<ServerMessage>,
    closer: Arc<Notify>,
    seq: u64,
    /// Broker name of the watched site.
    site: Option<String>,
}

/// Viewers of one site, keyed by the site's broker name.
struct SiteEntry {
    site_id: String,
    viewers: HashSet<ConnId>,
}

/// What became of a resolved access check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Subscribed,
    AlreadySubscribed,
    Rejected,
    /// Superseded by a later subscribe/unsubscribe, or the viewer left.
    Stale,
}

/// Subscription state. Owned by exactly one task; every method runs to
/// completion without suspending.
pub struct Registry {
    bridge: Arc<dyn Bridge>,
    viewers: HashMap<ConnId, Viewer>,
    sites: HashMap<String, SiteEntry>,
}

impl Registry {
    pub fn new(bridge: Arc<dyn Bridge>) -> Self {
        Registry {
            bridge,
            viewers: HashMap::new(),
            sites: HashMap::new(),
        }
    }

    pub fn connect(&mut self, conn: ConnId, sink: mpsc::Sender<ServerMessage>, closer: Arc<Notify>) {
        self.viewers.insert(
            conn,
            Viewer {
                sink,
                closer,
                seq: 0,
                site: None,
            },
        );
    }

    /// Stamps a new access check for `conn`. `None` if the viewer is gone.
    pub fn begin_subscribe(&mut self, conn: ConnId) -> Option<u64> {
        let viewer = self.viewers.get_mut(&conn)?;
        viewer.seq += 1;
        Some(viewer.seq)
    }

    /// Applies the result of the check stamped `seq`.
    pub fn complete_subscribe(
        &mut self,
        conn: ConnId,
        seq: u64,
        result: Result<Site, AccessError>,
    ) -> SubscribeOutcome {
        let Some(viewer) = self.viewers.get(&conn) else {
            return SubscribeOutcome::Stale;
        };

        if viewer.seq != seq {
            debug!(conn, seq, current = viewer.seq, "Discarding stale access result");
            return SubscribeOutcome::Stale;
        }

        let site = match result {
            Ok(site) => site,
            Err(e) => {
                info!(conn, error = %e, "Subscribe rejected");
                self.send(conn, ServerMessage::error(e.to_string()));
                return SubscribeOutcome::Rejected;
            }
        };

        let outcome = if viewer.site.as_deref() == Some(site.name.as_str()) {
            SubscribeOutcome::AlreadySubscribed
        } else {
            self.detach(conn);
            self.attach(conn, &site);
            SubscribeOutcome::Subscribed
        };

        self.send(
            conn,
            ServerMessage::Subscribed {
                site_id: site.id.clone(),
            },
        );
        outcome
    }

    /// Removes `conn` from its site. Idempotent.
    ///
    /// ## Returns
    /// `true` if the connection was subscribed.
    pub fn unsubscribe(&mut self, conn: ConnId) -> bool {
        let Some(viewer) = self.viewers.get_mut(&conn) else {
            return false;
        };
        viewer.seq += 1;
        self.detach(conn)
    }

    /// Drops every trace of `conn`.
    pub fn disconnect(&mut self, conn: ConnId) {
        self.unsubscribe(conn);
        if self.viewers.remove(&conn).is_some() {
            debug!(conn, "Viewer removed");
        }
    }

    /// Sends a site event to every viewer of `site_name`.
    ///
    /// Viewers whose queue is closed or full are unsubscribed and asked to
    /// close; the dispatch itself never fails.
    ///
    /// ## Returns
    /// Number of viewers that accepted the message.
    pub fn dispatch(&mut self, site_name: &str, kind: PushKind, data: serde_json::Value) -> usize {
        let Some(entry) = self.sites.get(site_name) else {
            return 0;
        };

        let message = ServerMessage::push(kind, entry.site_id.clone(), data);
        let mut delivered = 0;
        let mut dead = Vec::new();

        for conn in &entry.viewers {
            let accepted = self
                .viewers
                .get(conn)
                .map(|v| v.sink.try_send(message.clone()).is_ok())
                .unwrap_or(false);

            if accepted {
                delivered += 1;
            } else {
                dead.push(*conn);
            }
        }

        for conn in dead {
            warn!(conn, site = %site_name, "Viewer not keeping up, closing");
            self.close(conn);
        }

        delivered
    }

    pub fn subscriber_count(&self, site_name: &str) -> usize {
        self.sites.get(site_name).map_or(0, |e| e.viewers.len())
    }

    pub fn is_watched(&self, site_name: &str) -> bool {
        self.sites.contains_key(site_name)
    }

    pub fn site_of(&self, conn: ConnId) -> Option<&str> {
        self.viewers.get(&conn).and_then(|v| v.site.as_deref())
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn attach(&mut self, conn: ConnId, site: &Site) {
        let entry = self
            .sites
            .entry(site.name.clone())
            .or_insert_with(|| SiteEntry {
                site_id: site.id.clone(),
                viewers: HashSet::new(),
            });

        let first = entry.viewers.is_empty();
        entry.viewers.insert(conn);

        if let Some(viewer) = self.viewers.get_mut(&conn) {
            viewer.site = Some(site.name.clone());
        }

        info!(conn, site = %site.name, viewers = entry.viewers.len(), "Viewer subscribed");

        if first {
            self.signal(&site.name, true);
        }
    }

    /// Removes `conn` from its current site without touching its sequence.
    fn detach(&mut self, conn: ConnId) -> bool {
        let Some(site_name) = self.viewers.get_mut(&conn).and_then(|v| v.site.take()) else {
            return false;
        };

        let emptied = match self.sites.get_mut(&site_name) {
            Some(entry) => {
                entry.viewers.remove(&conn);
                entry.viewers.is_empty()
            }
            None => false,
        };

        debug!(conn, site = %site_name, "Viewer unsubscribed");

        if emptied {
            self.sites.remove(&site_name);
            self.signal(&site_name, false);
        }
        true
    }

    fn signal(&self, site_name: &str, start: bool) {
        let demand = DemandMessage {
            timestamp: Utc::now(),
        };
        let message = if start {
            SiteMessage::RequestStart(demand)
        } else {
            SiteMessage::RequestStop(demand)
        };

        match self.bridge.publish(site_name, &message) {
            Ok(()) => info!(site = %site_name, topic = %message.topic(), "Demand signal sent"),
            Err(e) => warn!(site = %site_name, topic = %message.topic(), error = %e, "Demand signal dropped"),
        }
    }

    fn send(&mut self, conn: ConnId, message: ServerMessage) {
        let accepted = self
            .viewers
            .get(&conn)
            .map(|v| v.sink.try_send(message).is_ok())
            .unwrap_or(false);

        if !accepted {
            warn!(conn, "Viewer queue unavailable, closing");
            self.close(conn);
        }
    }

    fn close(&mut self, conn: ConnId) {
        if let Some(viewer) = self.viewers.get(&conn) {
            viewer.closer.notify_one();
        }
        self.unsubscribe(conn);
    }
}

// =============================================================================
// Actor
// =============================================================================

/// Commands for the registry actor.
pub enum RegistryCommand {
    Connect {
        conn: ConnId,
        sink: mpsc::Sender<ServerMessage>,
        closer: Arc<Notify>,
    },
    Subscribe {
        conn: ConnId,
        site_id: String,
        token: String,
    },
    AccessResolved {
        conn: ConnId,
        seq: u64,
        result: Result<Authorized, AccessError>,
    },
    Unsubscribe {
        conn: ConnId,
    },
    Disconnect {
        conn: ConnId,
    },
    Dispatch {
        site: String,
        kind: PushKind,
        data: serde_json::Value,
    },
    SubscriberCount {
        site: String,
        reply: oneshot::Sender<usize>,
    },
    Shutdown,
}

/// Handle for talking to the registry actor.
#[derive(Clone)]
pub struct RegistryHandle {
    cmd_tx: mpsc::Sender<RegistryCommand>,
    next_conn: Arc<AtomicU64>,
}

impl RegistryHandle {
    async fn send(&self, cmd: RegistryCommand) -> Result<(), RelayError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| RelayError::ChannelClosed("registry"))
    }

    /// Registers a new viewer and returns its id.
    pub async fn connect(
        &self,
        sink: mpsc::Sender<ServerMessage>,
        closer: Arc<Notify>,
    ) -> Result<ConnId, RelayError> {
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        self.send(RegistryCommand::Connect { conn, sink, closer }).await?;
        Ok(conn)
    }

    pub async fn subscribe(&self, conn: ConnId, site_id: String, token: String) -> Result<(), RelayError> {
        self.send(RegistryCommand::Subscribe { conn, site_id, token }).await
    }

    pub async fn unsubscribe(&self, conn: ConnId) -> Result<(), RelayError> {
        self.send(RegistryCommand::Unsubscribe { conn }).await
    }

    pub async fn disconnect(&self, conn: ConnId) -> Result<(), RelayError> {
        self.send(RegistryCommand::Disconnect { conn }).await
    }

    pub async fn dispatch(&self, site: &str, kind: PushKind, data: serde_json::Value) -> Result<(), RelayError> {
        self.send(RegistryCommand::Dispatch {
            site: site.to_string(),
            kind,
            data,
        })
        .await
    }

    pub async fn subscriber_count(&self, site: &str) -> Result<usize, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(RegistryCommand::SubscriberCount {
            site: site.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| RelayError::ChannelClosed("registry"))
    }

    pub async fn shutdown(&self) -> Result<(), RelayError> {
        self.send(RegistryCommand::Shutdown).await
    }
}

/// Owns the [`Registry`] and serializes every mutation through one queue.
pub struct RegistryActor<P> {
    registry: Registry,
    policy: Arc<P>,
}

impl<P: AccessPolicy> RegistryActor<P> {
    pub fn new(bridge: Arc<dyn Bridge>, policy: Arc<P>) -> Self {
        RegistryActor {
            registry: Registry::new(bridge),
            policy,
        }
    }

    /// Starts the actor and returns a handle.
    pub fn start(self) -> RegistryHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let results_tx = cmd_tx.downgrade();

        tokio::spawn(self.run(cmd_rx, results_tx));

        RegistryHandle {
            cmd_tx,
            next_conn: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Main actor loop. Ends on `Shutdown` or when every handle is dropped.
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<RegistryCommand>,
        results_tx: mpsc::WeakSender<RegistryCommand>,
    ) {
        info!("Subscription registry started");

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                RegistryCommand::Connect { conn, sink, closer } => {
                    self.registry.connect(conn, sink, closer);
                }
                RegistryCommand::Subscribe { conn, site_id, token } => {
                    let Some(seq) = self.registry.begin_subscribe(conn) else {
                        continue;
                    };
                    let policy = self.policy.clone();
                    let results_tx = results_tx.clone();
                    tokio::spawn(async move {
                        let result = policy.check(&site_id, &token).await;
                        if let Some(tx) = results_tx.upgrade() {
                            let _ = tx
                                .send(RegistryCommand::AccessResolved { conn, seq, result })
                                .await;
                        }
                    });
                }
                RegistryCommand::AccessResolved { conn, seq, result } => {
                    self.registry
                        .complete_subscribe(conn, seq, result.map(|a| a.site));
                }
                RegistryCommand::Unsubscribe { conn } => {
                    self.registry.unsubscribe(conn);
                }
                RegistryCommand::Disconnect { conn } => {
                    self.registry.disconnect(conn);
                }
                RegistryCommand::Dispatch { site, kind, data } => {
                    let delivered = self.registry.dispatch(&site, kind, data);
                    debug!(site = %site, ?kind, delivered, "Dispatched site event");
                }
                RegistryCommand::SubscriberCount { site, reply } => {
                    let _ = reply.send(self.registry.subscriber_count(&site));
                }
                RegistryCommand::Shutdown => {
                    info!("Subscription registry shutting down");
                    break;
                }
            }
        }

        info!(viewers = self.registry.viewer_count(), "Subscription registry stopped");
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Claims;
    use canopy_bridge::testing::RecordingBridge;
    use canopy_bridge::Topic;
    use canopy_core::{SiteStatus, UserRole};
    use serde_json::json;
    use std::time::Duration;

    fn site(id: &str) -> Site {
        Site {
            id: id.to_string(),
            name: format!("farm-{id}"),
            tenant_id: "tenant-a".to_string(),
            status: SiteStatus::Active,
            last_contact_at: None,
            created_at: Utc::now(),
        }
    }

    struct Harness {
        bridge: Arc<RecordingBridge>,
        registry: Registry,
    }

    impl Harness {
        fn new() -> Self {
            let bridge = Arc::new(RecordingBridge::connected());
            let registry = Registry::new(bridge.clone());
            Harness { bridge, registry }
        }

        fn viewer(&mut self, conn: ConnId, capacity: usize) -> (mpsc::Receiver<ServerMessage>, Arc<Notify>) {
            let (tx, rx) = mpsc::channel(capacity);
            let closer = Arc::new(Notify::new());
            self.registry.connect(conn, tx, closer.clone());
            (rx, closer)
        }

        fn subscribe(&mut self, conn: ConnId, site_id: &str) -> SubscribeOutcome {
            let seq = self.registry.begin_subscribe(conn).unwrap();
            self.registry.complete_subscribe(conn, seq, Ok(site(site_id)))
        }

        fn starts(&self, site_id: &str) -> usize {
            self.bridge.count(&format!("farm-{site_id}"), Topic::RequestStart)
        }

        fn stops(&self, site_id: &str) -> usize {
            self.bridge.count(&format!("farm-{site_id}"), Topic::RequestStop)
        }
    }

    #[test]
    fn test_two_viewers_one_start_one_stop() {
        let mut h = Harness::new();
        let (mut rx1, _) = h.viewer(1, 8);
        let (_rx2, _) = h.viewer(2, 8);

        assert_eq!(h.subscribe(1, "s1"), SubscribeOutcome::Subscribed);
        assert_eq!(
            rx1.try_recv().unwrap(),
            ServerMessage::Subscribed {
                site_id: "s1".to_string()
            }
        );
        assert_eq!(h.starts("s1"), 1);

        assert_eq!(h.subscribe(2, "s1"), SubscribeOutcome::Subscribed);
        assert_eq!(h.starts("s1"), 1);
        assert_eq!(h.registry.subscriber_count("farm-s1"), 2);

        // First viewer leaves: still watched, no stop.
        assert!(h.registry.unsubscribe(1));
        assert_eq!(h.stops("s1"), 0);
        assert!(h.registry.is_watched("farm-s1"));

        // Second viewer disconnects: exactly one stop, key removed.
        h.registry.disconnect(2);
        assert_eq!(h.stops("s1"), 1);
        assert!(!h.registry.is_watched("farm-s1"));
        assert_eq!(h.registry.subscriber_count("farm-s1"), 0);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let mut h = Harness::new();
        let _v = h.viewer(1, 8);

        assert!(!h.registry.unsubscribe(1));
        assert!(!h.registry.unsubscribe(99));
        h.subscribe(1, "s1");
        assert!(h.registry.unsubscribe(1));
        assert!(!h.registry.unsubscribe(1));
        assert_eq!(h.stops("s1"), 1);
    }

    #[test]
    fn test_resubscribe_moves_viewer() {
        let mut h = Harness::new();
        let _v = h.viewer(1, 8);

        h.subscribe(1, "s1");
        assert_eq!(h.subscribe(1, "s2"), SubscribeOutcome::Subscribed);

        assert_eq!(h.registry.site_of(1), Some("farm-s2"));
        assert_eq!((h.starts("s1"), h.stops("s1")), (1, 1));
        assert_eq!((h.starts("s2"), h.stops("s2")), (1, 0));

        // Same site again: acked, no new demand.
        assert_eq!(h.subscribe(1, "s2"), SubscribeOutcome::AlreadySubscribed);
        assert_eq!(h.starts("s2"), 1);
    }

    #[test]
    fn test_signal_count_matches_transitions() {
        let mut h = Harness::new();
        let viewers: Vec<_> = (1..=5).map(|c| h.viewer(c, 64)).collect();

        // Interleaved subscribe/unsubscribe across two sites.
        let script: &[(ConnId, Option<&str>)] = &[
            (1, Some("a")),
            (2, Some("a")),
            (3, Some("b")),
            (1, None),
            (2, Some("b")),
            (4, Some("a")),
            (3, None),
            (4, None),
            (5, Some("a")),
            (2, None),
            (5, None),
            (1, Some("b")),
        ];

        let mut expected_starts = HashMap::<&str, usize>::new();
        let mut expected_stops = HashMap::<&str, usize>::new();
        for (conn, target) in script {
            let before_a = h.registry.subscriber_count("farm-a");
            let before_b = h.registry.subscriber_count("farm-b");
            match target {
                Some(site_id) => {
                    h.subscribe(*conn, site_id);
                }
                None => {
                    h.registry.unsubscribe(*conn);
                }
            }
            for (name, before) in [("a", before_a), ("b", before_b)] {
                let after = h.registry.subscriber_count(&format!("farm-{name}"));
                if before == 0 && after > 0 {
                    *expected_starts.entry(name).or_default() += 1;
                }
                if before > 0 && after == 0 {
                    *expected_stops.entry(name).or_default() += 1;
                }
                assert_eq!(h.registry.is_watched(&format!("farm-{name}")), after > 0);
            }
        }

        for name in ["a", "b"] {
            assert_eq!(h.starts(name), expected_starts.get(name).copied().unwrap_or(0));
            assert_eq!(h.stops(name), expected_stops.get(name).copied().unwrap_or(0));
        }
        drop(viewers);
    }

    #[test]
    fn test_stale_access_result_is_discarded() {
        let mut h = Harness::new();
        let (mut rx, _) = h.viewer(1, 8);

        let seq_a = h.registry.begin_subscribe(1).unwrap();
        let seq_b = h.registry.begin_subscribe(1).unwrap();

        // B resolves first, then the slow A check.
        assert_eq!(
            h.registry.complete_subscribe(1, seq_b, Ok(site("b"))),
            SubscribeOutcome::Subscribed
        );
        assert_eq!(
            h.registry.complete_subscribe(1, seq_a, Ok(site("a"))),
            SubscribeOutcome::Stale
        );

        assert_eq!(h.registry.site_of(1), Some("farm-b"));
        assert_eq!(h.starts("a"), 0);
        assert_eq!(
            rx.try_recv().unwrap(),
            ServerMessage::Subscribed {
                site_id: "b".to_string()
            }
        );
        assert!(rx.try_recv().is_err());

        // An unsubscribe also invalidates an in-flight check.
        let seq_c = h.registry.begin_subscribe(1).unwrap();
        h.registry.unsubscribe(1);
        assert_eq!(
            h.registry.complete_subscribe(1, seq_c, Ok(site("c"))),
            SubscribeOutcome::Stale
        );
        assert_eq!(h.registry.site_of(1), None);
    }

    #[test]
    fn test_rejection_changes_nothing() {
        let mut h = Harness::new();
        let (mut rx, _) = h.viewer(1, 8);
        h.subscribe(1, "s1");
        let _ = rx.try_recv();

        let seq = h.registry.begin_subscribe(1).unwrap();
        let outcome = h
            .registry
            .complete_subscribe(1, seq, Err(AccessError::Denied("s2".to_string())));

        assert_eq!(outcome, SubscribeOutcome::Rejected);
        assert_eq!(h.registry.site_of(1), Some("farm-s1"));
        assert!(matches!(rx.try_recv().unwrap(), ServerMessage::Error { .. }));
        assert_eq!(h.bridge.published().len(), 1);
    }

    #[test]
    fn test_dispatch_reaches_only_site_viewers() {
        let mut h = Harness::new();
        let (mut rx1, _) = h.viewer(1, 8);
        let (mut rx2, _) = h.viewer(2, 8);
        h.subscribe(1, "s1");
        h.subscribe(2, "s2");
        let _ = (rx1.try_recv(), rx2.try_recv());

        let delivered = h
            .registry
            .dispatch("farm-s1", PushKind::Telemetry, json!({"ec": 1.8}));
        assert_eq!(delivered, 1);
        assert_eq!(
            rx1.try_recv().unwrap(),
            ServerMessage::Telemetry {
                site_id: "s1".to_string(),
                data: json!({"ec": 1.8})
            }
        );
        assert!(rx2.try_recv().is_err());
        assert_eq!(h.registry.dispatch("farm-unwatched", PushKind::Status, json!({})), 0);
    }

    #[tokio::test]
    async fn test_slow_viewer_is_dropped_not_fatal() {
        let mut h = Harness::new();
        let (_rx_slow, closer) = h.viewer(1, 1);
        let (mut rx_ok, _) = h.viewer(2, 8);
        h.subscribe(1, "s1"); // fills the slow viewer's queue with the ack
        h.subscribe(2, "s1");
        let _ = rx_ok.try_recv();

        let delivered = h.registry.dispatch("farm-s1", PushKind::Alarm, json!({}));
        assert_eq!(delivered, 1);
        assert_eq!(h.registry.site_of(1), None);
        assert_eq!(h.registry.subscriber_count("farm-s1"), 1);

        // The slow viewer's socket task is told to close.
        tokio::time::timeout(Duration::from_secs(1), closer.notified())
            .await
            .unwrap();

        // Closed receivers count as disconnected too.
        drop(rx_ok);
        h.registry.dispatch("farm-s1", PushKind::Status, json!({}));
        assert!(!h.registry.is_watched("farm-s1"));
        assert_eq!(h.stops("s1"), 1);
    }

    #[test]
    fn test_bridge_down_does_not_block_subscription() {
        let mut h = Harness::new();
        h.bridge.set_connected(false);
        let (mut rx, _) = h.viewer(1, 8);

        assert_eq!(h.subscribe(1, "s1"), SubscribeOutcome::Subscribed);
        assert!(rx.try_recv().is_ok());
        assert!(h.bridge.published().is_empty());
    }

    // =========================================================================
    // Actor
    // =========================================================================

    /// Resolves "slow" only when released; everything else immediately.
    struct GatedPolicy {
        gate: Notify,
    }

    impl AccessPolicy for GatedPolicy {
        async fn check(&self, site_id: &str, _token: &str) -> Result<Authorized, AccessError> {
            if site_id == "slow" {
                self.gate.notified().await;
            }
            Ok(Authorized {
                site: site(site_id),
                claims: Claims {
                    sub: "u".to_string(),
                    tenant_id: "tenant-a".to_string(),
                    role: UserRole::Admin,
                    iat: 0,
                    exp: 0,
                    jti: "j".to_string(),
                },
            })
        }
    }

    #[tokio::test]
    async fn test_actor_discards_superseded_check() {
        let bridge = Arc::new(RecordingBridge::connected());
        let policy = Arc::new(GatedPolicy { gate: Notify::new() });
        let handle = RegistryActor::new(bridge.clone(), policy.clone()).start();

        let (tx, mut rx) = mpsc::channel(8);
        let conn = handle.connect(tx, Arc::new(Notify::new())).await.unwrap();

        handle.subscribe(conn, "slow".into(), "t".into()).await.unwrap();
        handle.subscribe(conn, "fast".into(), "t".into()).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            first,
            ServerMessage::Subscribed {
                site_id: "fast".to_string()
            }
        );

        policy.gate.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(handle.subscriber_count("farm-fast").await.unwrap(), 1);
        assert_eq!(handle.subscriber_count("farm-slow").await.unwrap(), 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(bridge.count("farm-slow", Topic::RequestStart), 0);

        handle.disconnect(conn).await.unwrap();
        assert_eq!(handle.subscriber_count("farm-fast").await.unwrap(), 0);
        assert_eq!(bridge.count("farm-fast", Topic::RequestStop), 1);
        handle.shutdown().await.unwrap();
    }
}
