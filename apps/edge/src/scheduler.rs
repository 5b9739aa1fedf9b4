//! # Daily Sync & Retention
//!
//! Once a day, at `fire_at` local time, the agent rolls up the previous
//! day's program runs and ships them to the cloud.
//!
//! ## Firing
//! ```text
//!  timer fires (date D) ──► next firing armed (D+1, fire_at)
//!        │
//!        ▼
//!  aggregate runs for every day in [D-1-catch_up, D-1]     (idempotent)
//!        │
//!        ▼
//!  pending = unsynced summaries in that window
//!        │
//!        ├── empty ────────────► done, nothing published
//!        │
//!        ├── broker down ──────► warn, rows stay pending
//!        │                       (picked up by a later firing)
//!        ▼
//!  publish daily-summary ──► mark rows synced
//!        │
//!        ▼
//!  retention, on every firing
//!    readings        < detail_days
//!    resolved alarms < alarm_days
//!    runs            < detail_days   (skipped while summaries are deferred)
//! ```
//!
//! Synced rows are frozen: re-aggregation never touches them and they are
//! never published again.

use std::sync::Arc;
use std::time::Duration;

use canopy_bridge::{Bridge, DailySummaryMessage, SiteMessage};
use canopy_core::Clock;
use canopy_db::Database;
use chrono::{DateTime, Days, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::RetentionSection;
use crate::error::EdgeResult;

/// Longest single sleep before the wall clock is read again.
const RECHECK_INTERVAL: Duration = Duration::from_secs(60);

// =============================================================================
// Timer Arithmetic
// =============================================================================

/// Resolves a wall-clock time in `tz`. A time inside a DST gap moves forward
/// by the gap; an ambiguous time takes the earlier instant.
fn resolve_local<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(at) => Some(at),
        LocalResult::Ambiguous(earliest, _) => Some(earliest),
        LocalResult::None => tz
            .from_local_datetime(&(naive + chrono::Duration::hours(1)))
            .earliest(),
    }
}

/// The first `fire_at` strictly after `now`, in `now`'s time zone.
///
/// A `now` already past today's firing time yields tomorrow's.
pub fn next_fire_after<Tz: TimeZone>(now: &DateTime<Tz>, fire_at: NaiveTime) -> DateTime<Tz> {
    let tz = now.timezone();
    let mut date = now.date_naive();

    for _ in 0..3 {
        if let Some(candidate) = resolve_local(&tz, date.and_time(fire_at)) {
            if candidate > *now {
                return candidate;
            }
        }
        match date.succ_opt() {
            Some(next) => date = next,
            None => break,
        }
    }

    now.clone() + chrono::Duration::days(1)
}

// =============================================================================
// Outcome
// =============================================================================

/// Rows removed by one retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Purged {
    pub readings: u64,
    pub runs: u64,
    pub alarms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// No unsynced summaries in the window.
    Empty,
    /// Broker unreachable; rows stay pending.
    Deferred { pending: usize },
    Published { rows: usize },
}

/// What one firing did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Firing {
    pub outcome: SyncOutcome,
    pub purged: Purged,
}

// =============================================================================
// Daily Sync
// =============================================================================

pub struct DailySync<Tz: TimeZone> {
    site_id: String,
    site_name: String,
    db: Database,
    bridge: Arc<dyn Bridge>,
    clock: Arc<dyn Clock>,
    tz: Tz,
    fire_at: NaiveTime,
    catch_up_days: u32,
    retention: RetentionSection,
    recheck: Duration,
}

impl<Tz> DailySync<Tz>
where
    Tz: TimeZone + Send + Sync + 'static,
    Tz::Offset: Send + Sync,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        site_id: impl Into<String>,
        site_name: impl Into<String>,
        db: Database,
        bridge: Arc<dyn Bridge>,
        clock: Arc<dyn Clock>,
        tz: Tz,
        fire_at: NaiveTime,
        catch_up_days: u32,
        retention: RetentionSection,
    ) -> Self {
        DailySync {
            site_id: site_id.into(),
            site_name: site_name.into(),
            db,
            bridge,
            clock,
            tz,
            fire_at,
            catch_up_days,
            retention,
            recheck: RECHECK_INTERVAL,
        }
    }

    /// Caps each sleep so a wall-clock jump is noticed within `every`.
    pub fn with_recheck(mut self, every: Duration) -> Self {
        self.recheck = every;
        self
    }

    fn local_now(&self) -> DateTime<Tz> {
        self.clock.now().with_timezone(&self.tz)
    }

    /// `[start of date, start of next date)` in UTC.
    fn day_bounds(&self, date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        let start_of = |d: NaiveDate| {
            resolve_local(&self.tz, d.and_time(NaiveTime::default()))
                .map(|at| at.with_timezone(&Utc))
                .unwrap_or_else(|| Utc.from_utc_datetime(&d.and_time(NaiveTime::default())))
        };
        let next = date.succ_opt().unwrap_or(date);
        (start_of(date), start_of(next))
    }

    /// Sleeps until each firing and runs it, until `shutdown` flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut next = next_fire_after(&self.local_now(), self.fire_at);
        info!(site = %self.site_name, next = %next.naive_local(), "Daily sync armed");

        loop {
            let due = next.with_timezone(&Utc);
            let wait = (due - self.clock.now()).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = tokio::time::sleep(wait.min(self.recheck)) => {
                    if self.clock.now() < due {
                        continue;
                    }
                    let fired = next.clone();
                    next = next_fire_after(&std::cmp::max(self.local_now(), fired.clone()), self.fire_at);
                    debug!(next = %next.naive_local(), "Daily sync re-armed");

                    match self.fire(fired.date_naive()).await {
                        Ok(firing) => debug!(?firing, "Daily sync finished"),
                        Err(e) => error!(site = %self.site_name, error = %e, "Daily sync failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Daily sync stopped");
    }

    /// One firing on local date `fired_on`; summarizes the day before, then
    /// applies retention whatever the sync outcome.
    pub async fn fire(&self, fired_on: NaiveDate) -> EdgeResult<Firing> {
        let now = self.clock.now();
        let outcome = match fired_on.pred_opt() {
            Some(date) => self.sync_window(date, now).await?,
            None => SyncOutcome::Empty,
        };

        // Runs back summaries that have not reached the cloud yet.
        let runs_unsent = matches!(outcome, SyncOutcome::Deferred { .. });
        let purged = self.purge(now, !runs_unsent).await?;

        if purged != Purged::default() {
            info!(
                site = %self.site_name,
                readings = purged.readings,
                runs = purged.runs,
                alarms = purged.alarms,
                "Retention pass removed old rows"
            );
        }
        Ok(Firing { outcome, purged })
    }

    /// Aggregates `[date - catch_up_days, date]` and publishes what is unsynced.
    async fn sync_window(&self, date: NaiveDate, now: DateTime<Utc>) -> EdgeResult<SyncOutcome> {
        let window_start = date
            .checked_sub_days(Days::new(u64::from(self.catch_up_days)))
            .unwrap_or(NaiveDate::MIN);

        let summaries = self.db.summaries();
        let mut day = window_start;
        while day <= date {
            let (from, to) = self.day_bounds(day);
            summaries.aggregate_day(&self.site_id, day, from, to).await?;
            match day.succ_opt() {
                Some(next) => day = next,
                None => break,
            }
        }

        let pending = summaries.pending_between(&self.site_id, window_start, date).await?;
        if pending.is_empty() {
            debug!(site = %self.site_name, date = %date, "No daily summaries to send");
            return Ok(SyncOutcome::Empty);
        }

        if !self.bridge.is_connected() {
            warn!(
                site = %self.site_name,
                date = %date,
                pending = pending.len(),
                "Broker unreachable, daily summary deferred"
            );
            return Ok(SyncOutcome::Deferred { pending: pending.len() });
        }

        let message = SiteMessage::DailySummary(DailySummaryMessage {
            timestamp: now,
            summary_date: date,
            summaries: pending.clone(),
        });

        if let Err(e) = self.bridge.publish(&self.site_name, &message) {
            warn!(site = %self.site_name, date = %date, error = %e, "Daily summary not published");
            return Ok(SyncOutcome::Deferred { pending: pending.len() });
        }

        summaries.mark_synced(&pending, now).await?;
        info!(site = %self.site_name, date = %date, rows = pending.len(), "Daily summary sent");
        Ok(SyncOutcome::Published { rows: pending.len() })
    }

    /// Deletes detail data and resolved alarms past their retention windows.
    /// Program runs are only touched when `include_runs` is set.
    pub async fn purge(&self, now: DateTime<Utc>, include_runs: bool) -> EdgeResult<Purged> {
        let detail_cutoff = now - chrono::Duration::days(i64::from(self.retention.detail_days));
        let alarm_cutoff = now - chrono::Duration::days(i64::from(self.retention.alarm_days));

        let runs = if include_runs {
            self.db.summaries().delete_runs_before(detail_cutoff).await?
        } else {
            0
        };

        Ok(Purged {
            readings: self.db.readings().delete_before(detail_cutoff).await?,
            runs,
            alarms: self.db.alarms().delete_resolved_before(alarm_cutoff).await?,
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
