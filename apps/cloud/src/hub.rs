//! # Viewer Hub
//!
//! HTTP and WebSocket front door of the relay.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Viewer Hub (Axum)                              │
//! │                                                                         │
//! │  GET  /ws ──► upgrade ──► per-socket task                              │
//! │                              │                                          │
//! │              ┌───────────────┼─────────────────────┐                    │
//! │              ▼               ▼                     ▼                    │
//! │      ┌──────────────┐ ┌──────────────┐   ┌──────────────────┐          │
//! │      │ receive loop │ │ writer task  │   │ RegistryHandle   │          │
//! │      │ subscribe /  │ │ queue → sink │◄──│ dispatch / acks  │          │
//! │      │ unsubscribe  │ │ + ping probe │   │ (bounded queue)  │          │
//! │      └──────────────┘ └──────────────┘   └──────────────────┘          │
//! │                                                                         │
//! │  GET  /health                       database + broker state            │
//! │  POST /api/sites/{id}/commands      see `commands`                     │
//! │  POST /api/sites/{id}/config                                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Probe
//! Every `ping_interval` the writer sends a Ping. Any Pong resets the missed
//! counter; once `max_missed_pongs` probes go unanswered the socket is
//! closed, which unsubscribes the viewer.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{Sink, SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use canopy_bridge::Bridge;
use canopy_db::Database;

use crate::access::DbAccessPolicy;
use crate::commands::{self, CommandForwarder};
use crate::config::CloudConfig;
use crate::error::RelayError;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::registry::{ConnId, RegistryHandle};

/// Maximum inbound frame size (64KB). Viewer messages are tiny.
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

// =============================================================================
// State
// =============================================================================

/// Shared state for every request.
#[derive(Clone)]
pub struct AppState {
    pub registry: RegistryHandle,
    pub db: Database,
    pub bridge: Arc<dyn Bridge>,
    pub forwarder: Arc<CommandForwarder>,
    pub policy: Arc<DbAccessPolicy>,
    pub config: Arc<CloudConfig>,
}

// =============================================================================
// Server
// =============================================================================

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .merge(commands::routes())
        .with_state(state)
}

/// Serves until `shutdown` completes.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<(), RelayError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener
        .local_addr()
        .map_err(|e| RelayError::Internal(e.to_string()))?;
    info!(addr = %addr, "Viewer hub listening");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(|e| RelayError::Internal(e.to_string()))
}

// =============================================================================
// Handlers
// =============================================================================

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let database = state.db.health_check().await;
    let broker = state.bridge.is_connected();

    let status = if database {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if database && broker { "ok" } else { "degraded" },
            "database": database,
            "broker": broker,
        })),
    )
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    debug!(addr = %addr, "Viewer upgrading");
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state, addr))
}

async fn handle_socket(socket: WebSocket, state: AppState, addr: SocketAddr) {
    let (sender, mut receiver) = socket.split();

    let (queue_tx, queue_rx) = mpsc::channel::<ServerMessage>(state.config.viewer_queue);
    let closer = Arc::new(Notify::new());

    let conn = match state.registry.connect(queue_tx.clone(), closer.clone()).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(addr = %addr, error = %e, "Registry unavailable, dropping viewer");
            return;
        }
    };
    info!(conn, addr = %addr, "Viewer connected");

    let probe = Probe {
        period: state.config.ping_interval(),
        max_missed: state.config.max_missed_pongs,
        missed: Arc::new(AtomicU32::new(0)),
    };
    let missed = probe.missed.clone();
    let writer = tokio::spawn(write_loop(sender, queue_rx, probe, closer.clone(), conn));

    loop {
        tokio::select! {
            frame = receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_text(&state, conn, text.as_str(), &queue_tx).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        missed.store(0, Ordering::Relaxed);
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(conn, "Viewer closed");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(conn, error = %e, "Viewer socket error");
                        break;
                    }
                }
            }
            _ = closer.notified() => {
                debug!(conn, "Closing viewer");
                break;
            }
        }
    }

    writer.abort();
    if let Err(e) = state.registry.disconnect(conn).await {
        warn!(conn, error = %e, "Could not deregister viewer");
    }
    info!(conn, addr = %addr, "Viewer disconnected");
}

async fn handle_client_text(state: &AppState, conn: ConnId, text: &str, queue: &mpsc::Sender<ServerMessage>) {
    let result = match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Subscribe { site_id, token }) => state.registry.subscribe(conn, site_id, token).await,
        Ok(ClientMessage::Unsubscribe) => state.registry.unsubscribe(conn).await,
        Err(e) => {
            debug!(conn, error = %e, "Malformed viewer message");
            let _ = queue.try_send(ServerMessage::error(format!("Malformed message: {e}")));
            Ok(())
        }
    };

    if let Err(e) = result {
        warn!(conn, error = %e, "Viewer request dropped");
    }
}

// =============================================================================
// Writer
// =============================================================================

struct Probe {
    period: Duration,
    max_missed: u32,
    missed: Arc<AtomicU32>,
}

/// Drains the viewer's queue into the socket and probes it.
async fn write_loop<S>(
    mut sink: S,
    mut queue: mpsc::Receiver<ServerMessage>,
    probe: Probe,
    closer: Arc<Notify>,
    conn: ConnId,
) where
    S: Sink<Message> + Unpin,
{
    let mut ticker = interval_at(Instant::now() + probe.period, probe.period);

    loop {
        tokio::select! {
            msg = queue.recv() => {
                let Some(msg) = msg else { break };
                let Ok(json) = serde_json::to_string(&msg) else { continue };
                if sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if probe.missed.load(Ordering::Relaxed) >= probe.max_missed {
                    info!(conn, missed = probe.max_missed, "Viewer stopped answering pings");
                    break;
                }
                probe.missed.fetch_add(1, Ordering::Relaxed);
                if sink.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }
        }
    }

    closer.notify_one();
    let _ = sink.close().await;
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::JwtManager;
    use crate::protocol::PushKind;
    use crate::registry::RegistryActor;
    use canopy_bridge::testing::RecordingBridge;
    use canopy_bridge::Topic;
    use canopy_core::{Site, SiteStatus, UserRole};
    use canopy_db::DbConfig;
    use chrono::Utc;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    /// State over an in-memory db holding `site-1` (`farm-01`, tenant-a).
    pub(crate) async fn test_state() -> (AppState, Arc<RecordingBridge>) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.sites()
            .insert(&Site {
                id: "site-1".into(),
                name: "farm-01".into(),
                tenant_id: "tenant-a".into(),
                status: SiteStatus::Active,
                last_contact_at: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let config = CloudConfig {
            jwt_secret: "hub-test-secret".into(),
            ..CloudConfig::default()
        };
        let jwt = Arc::new(JwtManager::new(&config.jwt_secret));
        let policy = Arc::new(DbAccessPolicy::new(db.clone(), jwt));
        let bridge = Arc::new(RecordingBridge::connected());

        let registry = RegistryActor::new(bridge.clone(), policy.clone()).start();
        let state = AppState {
            registry,
            db: db.clone(),
            bridge: bridge.clone(),
            forwarder: Arc::new(CommandForwarder::new(db, bridge.clone())),
            policy,
            config: Arc::new(config),
        };
        (state, bridge)
    }

    async fn next_json<S>(ws: &mut S) -> serde_json::Value
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("socket ended")
                .expect("socket error");
            if let WsMessage::Text(text) = frame {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    async fn wait_for<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..50 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_viewer_session_end_to_end() {
        let (state, bridge) = test_state().await;
        let registry = state.registry.clone();
        let jwt = JwtManager::new(&state.config.jwt_secret);
        let token = jwt
            .issue("admin-1", "tenant-a", UserRole::Admin, chrono::Duration::minutes(5))
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, state, std::future::pending()));

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .unwrap();

        // Malformed input gets an error, not a disconnect.
        ws.send(WsMessage::Text("{\"type\":\"dance\"}".into())).await.unwrap();
        assert_eq!(next_json(&mut ws).await["type"], "error");

        // Wrong credentials.
        let bad = json!({"type": "subscribe", "siteId": "site-1", "token": "nope"});
        ws.send(WsMessage::Text(bad.to_string().into())).await.unwrap();
        assert_eq!(next_json(&mut ws).await["type"], "error");
        assert_eq!(bridge.count("farm-01", Topic::RequestStart), 0);

        // Subscribe.
        let sub = json!({"type": "subscribe", "siteId": "site-1", "token": token});
        ws.send(WsMessage::Text(sub.to_string().into())).await.unwrap();
        assert_eq!(
            next_json(&mut ws).await,
            json!({"type": "subscribed", "siteId": "site-1"})
        );
        assert_eq!(bridge.count("farm-01", Topic::RequestStart), 1);

        // Fan-out reaches the socket.
        registry
            .dispatch("farm-01", PushKind::Telemetry, json!({"ec": 1.7}))
            .await
            .unwrap();
        assert_eq!(
            next_json(&mut ws).await,
            json!({"type": "telemetry", "siteId": "site-1", "data": {"ec": 1.7}})
        );

        // Dropping the socket unsubscribes and stops demand.
        ws.close(None).await.unwrap();
        drop(ws);
        wait_for(|| {
            let registry = registry.clone();
            async move { registry.subscriber_count("farm-01").await.unwrap() == 0 }
        })
        .await;
        assert_eq!(bridge.count("farm-01", Topic::RequestStop), 1);
    }

    #[tokio::test]
    async fn test_health_reports_broker_state() {
        let (state, bridge) = test_state().await;
        bridge.set_connected(false);

        let response = health_handler(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_pings_close_viewer() {
        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<Message>();
        let sink = futures_util::sink::unfold(frames_tx, |tx, frame: Message| async move {
            tx.send(frame).map(|_| tx)
        });
        let sink = Box::pin(sink);

        let (_queue_tx, queue_rx) = mpsc::channel(4);
        let closer = Arc::new(Notify::new());
        let probe = Probe {
            period: Duration::from_secs(30),
            max_missed: 2,
            missed: Arc::new(AtomicU32::new(0)),
        };

        let writer = tokio::spawn(write_loop(sink, queue_rx, probe, closer.clone(), 1));
        writer.await.unwrap();

        let mut pings = 0;
        while let Ok(frame) = frames_rx.try_recv() {
            assert!(matches!(frame, Message::Ping(_)));
            pings += 1;
        }
        assert_eq!(pings, 2);
        tokio::time::timeout(Duration::from_millis(1), closer.notified())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_keeps_viewer_alive() {
        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<Message>();
        let sink = Box::pin(futures_util::sink::unfold(frames_tx, |tx, frame: Message| async move {
            tx.send(frame).map(|_| tx)
        }));

        let (_queue_tx, queue_rx) = mpsc::channel(4);
        let missed = Arc::new(AtomicU32::new(0));
        let probe = Probe {
            period: Duration::from_secs(30),
            max_missed: 2,
            missed: missed.clone(),
        };
        let writer = tokio::spawn(write_loop(sink, queue_rx, probe, Arc::new(Notify::new()), 1));

        // Answer five pings in a row.
        for _ in 0..5 {
            let frame = frames_rx.recv().await.unwrap();
            assert!(matches!(frame, Message::Ping(_)));
            missed.store(0, Ordering::Relaxed);
        }
        assert!(!writer.is_finished());
        writer.abort();
    }
}
