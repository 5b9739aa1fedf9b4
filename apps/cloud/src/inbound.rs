//! # Inbound Router
//!
//! Handles every edge → cloud message the bridge delivers.
//!
//! ```text
//!  InboundMessage ──► sites.get_by_name ──✗──► warn, drop
//!                            │
//!                            ▼
//!                  touch last_contact_at
//!                            │
//!     ┌──────────────┬───────┴──────┬────────────────┬─────────────────┐
//!     ▼              ▼              ▼                ▼                 ▼
//!  telemetry       status         alarm          heartbeat       daily-summary
//!  dispatch        dispatch     persist episode  (contact only)  upsert rows
//!                               + dispatch
//! ```
//!
//! Contact time is the message timestamp, clamped to the receive time so a
//! site with a fast clock cannot push its own `last_contact_at` into the
//! future. Duplicates from the broker's at-least-once delivery are absorbed:
//! contact only moves forward, alarm episodes are deduplicated and summary
//! rows are upserted.

use canopy_bridge::{AlarmMessage, DailySummaryMessage, InboundMessage, SiteMessage};
use canopy_core::{AlarmEpisode, Site};
use canopy_db::Database;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::RelayResult;
use crate::protocol::PushKind;
use crate::registry::RegistryHandle;

pub struct InboundRouter {
    db: Database,
    registry: RegistryHandle,
}

impl InboundRouter {
    pub fn new(db: Database, registry: RegistryHandle) -> Self {
        InboundRouter { db, registry }
    }

    /// Drains `rx` until it closes or `shutdown` flips.
    pub async fn run(self, mut rx: mpsc::Receiver<InboundMessage>, mut shutdown: watch::Receiver<bool>) {
        info!("Inbound router started");
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(inbound) = msg else { break };
                    let (site, topic) = (inbound.site.clone(), inbound.topic);
                    if let Err(e) = self.handle(inbound).await {
                        error!(site = %site, topic = %topic, error = %e, "Inbound message failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Inbound router stopped");
    }

    pub async fn handle(&self, inbound: InboundMessage) -> RelayResult<()> {
        let Some(site) = self.db.sites().get_by_name(&inbound.site).await? else {
            warn!(site = %inbound.site, topic = %inbound.topic, "Message from unknown site");
            return Ok(());
        };

        let contact = inbound.message.timestamp().min(inbound.received_at);
        self.db.sites().touch_last_contact(&site.name, contact).await?;

        match &inbound.message {
            SiteMessage::Telemetry(_) => {
                self.registry
                    .dispatch(&site.name, PushKind::Telemetry, inbound.message.data())
                    .await?;
            }
            SiteMessage::Status(_) => {
                self.registry
                    .dispatch(&site.name, PushKind::Status, inbound.message.data())
                    .await?;
            }
            SiteMessage::Alarm(alarm) => {
                if self.record_alarm(&site, alarm).await? {
                    self.registry
                        .dispatch(&site.name, PushKind::Alarm, inbound.message.data())
                        .await?;
                }
            }
            SiteMessage::Heartbeat(_) => {
                debug!(site = %site.name, "Heartbeat");
            }
            SiteMessage::DailySummary(batch) => {
                self.store_summaries(&site, batch, inbound.received_at).await?;
            }
            other => {
                debug!(site = %site.name, topic = %other.topic(), "Ignoring downlink topic on uplink route");
            }
        }

        Ok(())
    }

    /// Persists or resolves an alarm episode.
    ///
    /// ## Returns
    /// `false` if the message was a redelivery with nothing new to show.
    async fn record_alarm(&self, site: &Site, alarm: &AlarmMessage) -> RelayResult<bool> {
        let alarms = self.db.alarms();
        let open = alarms.find_open(&site.id, &alarm.alarm_type).await?;

        if let Some(resolved_at) = alarm.resolved_at {
            return match open {
                Some(episode) => {
                    alarms.resolve(&episode.id, resolved_at).await?;
                    info!(site = %site.name, alarm = %alarm.alarm_type, "Alarm cleared");
                    Ok(true)
                }
                None => Ok(false),
            };
        }

        if let Some(episode) = open {
            let duplicate = episode.occurred_at == alarm.timestamp;
            debug!(site = %site.name, alarm = %alarm.alarm_type, duplicate, "Alarm already open");
            return Ok(!duplicate);
        }

        alarms
            .insert(&AlarmEpisode {
                id: Uuid::new_v4().to_string(),
                site_id: site.id.clone(),
                alarm_type: alarm.alarm_type.clone(),
                message: alarm.message.clone(),
                occurred_at: alarm.timestamp,
                resolved_at: None,
            })
            .await?;
        warn!(site = %site.name, alarm = %alarm.alarm_type, message = %alarm.message, "Alarm raised");
        Ok(true)
    }

    async fn store_summaries(
        &self,
        site: &Site,
        batch: &DailySummaryMessage,
        received_at: chrono::DateTime<chrono::Utc>,
    ) -> RelayResult<()> {
        let summaries = self.db.summaries();
        for summary in &batch.summaries {
            let mut row = summary.clone();
            row.site_id = site.id.clone();
            summaries.upsert_received(&row, received_at).await?;
        }
        info!(
            site = %site.name,
            date = %batch.summary_date,
            rows = batch.summaries.len(),
            "Daily summary received"
        );
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{AccessError, AccessPolicy, Authorized};
    use crate::auth::Claims;
    use crate::protocol::ServerMessage;
    use crate::registry::RegistryActor;
    use canopy_bridge::testing::RecordingBridge;
    use canopy_bridge::HeartbeatMessage;
    use canopy_core::{ChannelVolume, DailySummary, OperatingState, SiteStatus, UserRole};
    use canopy_db::DbConfig;
    use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
    use std::sync::Arc;
    use tokio::sync::Notify;

    struct AllowAll(Site);

    impl AccessPolicy for AllowAll {
        async fn check(&self, _site_id: &str, _token: &str) -> Result<Authorized, AccessError> {
            Ok(Authorized {
                site: self.0.clone(),
                claims: Claims {
                    sub: "u".into(),
                    tenant_id: "tenant-a".into(),
                    role: UserRole::Owner,
                    iat: 0,
                    exp: 0,
                    jti: "j".into(),
                },
            })
        }
    }

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, h, 0, 0).unwrap()
    }

    fn farm() -> Site {
        Site {
            id: "site-uuid".into(),
            name: "farm-01".into(),
            tenant_id: "tenant-a".into(),
            status: SiteStatus::Active,
            last_contact_at: None,
            created_at: at(0),
        }
    }

    fn inbound(message: SiteMessage, received_at: DateTime<Utc>) -> InboundMessage {
        InboundMessage {
            site: "farm-01".into(),
            topic: message.topic(),
            message,
            received_at,
        }
    }

    fn alarm(ts: DateTime<Utc>, resolved_at: Option<DateTime<Utc>>) -> SiteMessage {
        SiteMessage::Alarm(AlarmMessage {
            timestamp: ts,
            alarm_type: "LOW_PRESSURE".into(),
            message: "Line pressure below 1.2 bar".into(),
            resolved_at,
        })
    }

    /// Router plus a subscribed viewer on farm-01.
    async fn setup() -> (Database, InboundRouter, mpsc::Receiver<ServerMessage>) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.sites().insert(&farm()).await.unwrap();

        let bridge = Arc::new(RecordingBridge::connected());
        let registry = RegistryActor::new(bridge, Arc::new(AllowAll(farm()))).start();

        let (tx, mut rx) = mpsc::channel(16);
        let conn = registry.connect(tx, Arc::new(Notify::new())).await.unwrap();
        registry.subscribe(conn, "site-uuid".into(), "t".into()).await.unwrap();
        assert!(matches!(rx.recv().await, Some(ServerMessage::Subscribed { .. })));

        (db.clone(), InboundRouter::new(db, registry), rx)
    }

    async fn next(rx: &mut mpsc::Receiver<ServerMessage>) -> Option<ServerMessage> {
        tokio::time::timeout(std::time::Duration::from_millis(200), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_heartbeat_touches_contact_clamped() {
        let (db, router, mut rx) = setup().await;

        // Edge clock runs an hour fast.
        let hb = SiteMessage::Heartbeat(HeartbeatMessage {
            timestamp: at(11),
            uptime_secs: 60,
            state: OperatingState::Idle,
        });
        router.handle(inbound(hb, at(10))).await.unwrap();

        let site = db.sites().get_by_name("farm-01").await.unwrap().unwrap();
        assert_eq!(site.last_contact_at, Some(at(10)));
        assert!(next(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn test_alarm_persisted_once_and_pushed() {
        let (db, router, mut rx) = setup().await;

        router.handle(inbound(alarm(at(9), None), at(9))).await.unwrap();
        // Redelivery.
        router.handle(inbound(alarm(at(9), None), at(9))).await.unwrap();

        assert_eq!(db.alarms().count_open("site-uuid", "LOW_PRESSURE").await.unwrap(), 1);
        match next(&mut rx).await {
            Some(ServerMessage::Alarm { site_id, data }) => {
                assert_eq!(site_id, "site-uuid");
                assert_eq!(data["alarmType"], "LOW_PRESSURE");
            }
            other => panic!("expected alarm push, got {other:?}"),
        }
        assert!(next(&mut rx).await.is_none());

        router
            .handle(inbound(alarm(at(9), Some(at(10))), at(10)))
            .await
            .unwrap();
        assert_eq!(db.alarms().count_open("site-uuid", "LOW_PRESSURE").await.unwrap(), 0);
        assert!(matches!(next(&mut rx).await, Some(ServerMessage::Alarm { .. })));
    }

    #[tokio::test]
    async fn test_unknown_site_is_dropped() {
        let (db, router, _rx) = setup().await;
        let mut msg = inbound(alarm(at(9), None), at(9));
        msg.site = "farm-ghost".into();

        router.handle(msg).await.unwrap();
        assert_eq!(db.alarms().list_for_site("farm-ghost").await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_daily_summary_upserted_under_site_id() {
        let (db, router, _rx) = setup().await;
        let date = NaiveDate::from_ymd_opt(2024, 5, 31).unwrap();
        let summary = DailySummary {
            site_id: "farm-01".into(),
            summary_date: date,
            program_id: "p1".into(),
            program_name: "Tomatoes".into(),
            run_count: 3,
            target_ec: 2.0,
            target_ph: 6.0,
            avg_ec: 1.9,
            avg_ph: 6.1,
            total_water_l: 420.0,
            total_fertilizer_l: 4.2,
            channels: vec![ChannelVolume {
                channel: "valve-1".into(),
                volume_l: 420.0,
            }],
            synced_at: None,
        };
        let msg = SiteMessage::DailySummary(DailySummaryMessage {
            timestamp: at(0) + Duration::minutes(5),
            summary_date: date,
            summaries: vec![summary],
        });

        router.handle(inbound(msg.clone(), at(1))).await.unwrap();
        router.handle(inbound(msg, at(1))).await.unwrap();

        let rows = db.summaries().for_date("site-uuid", date).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].run_count, 3);
        assert_eq!(rows[0].channels.len(), 1);
    }
}
