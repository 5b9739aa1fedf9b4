//! # Liveness Monitor
//!
//! The broker gives no reliable "site went away" event, so the relay samples
//! each site's `last_contact_at` on a fixed interval and turns silence into an
//! OFFLINE alarm episode.
//!
//! ## Per-Site State Machine
//! ```text
//!                 now - last_contact > threshold
//!                 (create or adopt open episode)
//!     ┌────────┐ ─────────────────────────────────► ┌─────────┐
//!     │ ONLINE │                                    │ OFFLINE │
//!     └────────┘ ◄───────────────────────────────── └─────────┘
//!                 back within threshold
//!                 (resolve episode, resolved_at = now)
//! ```
//!
//! OFFLINE membership is the `notified` set. On the first cycle the set is
//! primed from the episodes already open in storage, so a restart neither
//! duplicates nor forgets an outage.
//!
//! Sites that have never been heard from, and sites that are not `active`,
//! are not evaluated. A storage error on one site is logged and the cycle
//! moves on to the next.

use std::collections::HashSet;
use std::time::Duration;

use canopy_core::{AlarmEpisode, Clock, Site, ALARM_OFFLINE};
use canopy_db::{Database, DbError, DbResult};
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::protocol::PushKind;
use crate::registry::RegistryHandle;

/// What one pass changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CheckSummary {
    pub evaluated: usize,
    pub went_offline: Vec<String>,
    pub came_online: Vec<String>,
    pub failed: usize,
}

pub struct LivenessMonitor<C> {
    db: Database,
    clock: C,
    threshold: chrono::Duration,
    interval: Duration,
    notified: HashSet<String>,
    primed: bool,
    registry: Option<RegistryHandle>,
}

impl<C: Clock> LivenessMonitor<C> {
    pub fn new(db: Database, clock: C, threshold: chrono::Duration, interval: Duration) -> Self {
        LivenessMonitor {
            db,
            clock,
            threshold,
            interval,
            notified: HashSet::new(),
            primed: false,
            registry: None,
        }
    }

    /// Also pushes offline/online alarms to the site's viewers.
    pub fn with_registry(mut self, registry: RegistryHandle) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sites currently believed offline, by site id.
    pub fn offline_sites(&self) -> &HashSet<String> {
        &self.notified
    }

    /// Runs until `shutdown` flips to `true`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = self.interval.as_secs(),
            threshold_secs = self.threshold.num_seconds(),
            "Liveness monitor started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let summary = self.check_once().await;
                    debug!(?summary, "Liveness pass complete");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Liveness monitor stopped");
    }

    /// One evaluation pass over every active site.
    pub async fn check_once(&mut self) -> CheckSummary {
        let mut summary = CheckSummary::default();
        let now = self.clock.now();

        let sites = match self.db.sites().list_active().await {
            Ok(sites) => sites,
            Err(e) => {
                error!(error = %e, "Liveness pass could not list sites");
                summary.failed += 1;
                return summary;
            }
        };

        if !self.primed {
            self.prime(&sites).await;
        }

        for site in &sites {
            let Some(last_contact) = site.last_contact_at else {
                continue;
            };
            summary.evaluated += 1;

            match self.evaluate(site, last_contact, now).await {
                Ok(Some(true)) => summary.went_offline.push(site.name.clone()),
                Ok(Some(false)) => summary.came_online.push(site.name.clone()),
                Ok(None) => {}
                Err(e) => {
                    error!(site = %site.name, error = %e, "Liveness check failed for site");
                    summary.failed += 1;
                }
            }
        }

        summary
    }

    /// Adopts OFFLINE episodes left open by a previous process.
    async fn prime(&mut self, sites: &[Site]) {
        let mut all_ok = true;
        for site in sites {
            match self.db.alarms().find_open(&site.id, ALARM_OFFLINE).await {
                Ok(Some(_)) => {
                    self.notified.insert(site.id.clone());
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(site = %site.name, error = %e, "Could not read open episode while priming");
                    all_ok = false;
                }
            }
        }
        self.primed = all_ok;
        if all_ok && !self.notified.is_empty() {
            info!(count = self.notified.len(), "Adopted open offline episodes");
        }
    }

    /// `Some(true)` went offline, `Some(false)` came back, `None` unchanged.
    async fn evaluate(
        &mut self,
        site: &Site,
        last_contact: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<Option<bool>> {
        let silent = now - last_contact > self.threshold;
        let notified = self.notified.contains(&site.id);

        match (silent, notified) {
            (true, false) => {
                self.mark_offline(site, last_contact, now).await?;
                self.notified.insert(site.id.clone());
                Ok(Some(true))
            }
            (false, true) => {
                self.mark_online(site, now).await?;
                self.notified.remove(&site.id);
                Ok(Some(false))
            }
            _ => Ok(None),
        }
    }

    async fn mark_offline(&self, site: &Site, last_contact: DateTime<Utc>, now: DateTime<Utc>) -> DbResult<()> {
        let alarms = self.db.alarms();

        if alarms.find_open(&site.id, ALARM_OFFLINE).await?.is_some() {
            debug!(site = %site.name, "Adopting existing offline episode");
            return Ok(());
        }

        let episode = AlarmEpisode {
            id: Uuid::new_v4().to_string(),
            site_id: site.id.clone(),
            alarm_type: ALARM_OFFLINE.to_string(),
            message: format!("No contact since {}", last_contact.to_rfc3339()),
            occurred_at: now,
            resolved_at: None,
        };

        match alarms.insert(&episode).await {
            Ok(()) => {}
            // Another writer opened one between our read and insert.
            Err(DbError::UniqueViolation { .. }) => {
                debug!(site = %site.name, "Offline episode already open");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        warn!(site = %site.name, last_contact = %last_contact, "Site offline");
        self.notify_viewers(site, &episode).await;
        Ok(())
    }

    async fn mark_online(&self, site: &Site, now: DateTime<Utc>) -> DbResult<()> {
        let alarms = self.db.alarms();

        if let Some(mut episode) = alarms.find_open(&site.id, ALARM_OFFLINE).await? {
            alarms.resolve(&episode.id, now).await?;
            episode.resolved_at = Some(now);
            info!(site = %site.name, "Site back online");
            self.notify_viewers(site, &episode).await;
        }
        Ok(())
    }

    async fn notify_viewers(&self, site: &Site, episode: &AlarmEpisode) {
        let Some(registry) = &self.registry else {
            return;
        };
        let data = json!({
            "alarmType": episode.alarm_type,
            "message": episode.message,
            "occurredAt": episode.occurred_at,
            "resolvedAt": episode.resolved_at,
        });
        if let Err(e) = registry.dispatch(&site.name, PushKind::Alarm, data).await {
            warn!(site = %site.name, error = %e, "Could not push liveness alarm");
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
