//! # Program Run & Daily Summary Repository
//!
//! Edge side: records irrigation runs, rolls them up into one summary per
//! (site, date, program) and tracks which summaries reached the cloud.
//! Cloud side: stores received summaries idempotently.
//!
//! ## Daily Roll-up
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  program_runs (detail)             daily_summaries (aggregate)          │
//! │  ─────────────────────             ────────────────────────────         │
//! │  run 06:00  p1  400 L     ─┐                                            │
//! │  run 18:00  p1  380 L     ─┼──►  (site, 2024-06-01, p1) 2 runs 780 L    │
//! │  run 07:00  p2  120 L     ────►  (site, 2024-06-01, p2) 1 run  120 L    │
//! │                                                                         │
//! │  program_run_channels             daily_channel_flows                   │
//! │  (run, valve-1, 200 L)    ─────►  (site, date, p1, valve-1, Σ volume)   │
//! │                                                                         │
//! │  Re-aggregating is an upsert; rows with synced_at set are frozen.       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;
use canopy_core::{ChannelVolume, DailySummary, ProgramRun};

#[derive(sqlx::FromRow)]
struct SummaryRow {
    site_id: String,
    summary_date: NaiveDate,
    program_id: String,
    program_name: String,
    run_count: i64,
    target_ec: f64,
    target_ph: f64,
    avg_ec: f64,
    avg_ph: f64,
    total_water_l: f64,
    total_fertilizer_l: f64,
    synced_at: Option<DateTime<Utc>>,
}

impl From<SummaryRow> for DailySummary {
    fn from(row: SummaryRow) -> Self {
        DailySummary {
            site_id: row.site_id,
            summary_date: row.summary_date,
            program_id: row.program_id,
            program_name: row.program_name,
            run_count: row.run_count,
            target_ec: row.target_ec,
            target_ph: row.target_ph,
            avg_ec: row.avg_ec,
            avg_ph: row.avg_ph,
            total_water_l: row.total_water_l,
            total_fertilizer_l: row.total_fertilizer_l,
            channels: Vec::new(),
            synced_at: row.synced_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct FlowRow {
    summary_date: NaiveDate,
    program_id: String,
    channel: String,
    volume_l: f64,
}

const SUMMARY_COLUMNS: &str = "site_id, summary_date, program_id, program_name, run_count, \
     target_ec, target_ph, avg_ec, avg_ph, total_water_l, total_fertilizer_l, synced_at";

/// Repository for program runs and daily summaries.
#[derive(Debug, Clone)]
pub struct SummaryRepository {
    pool: SqlitePool,
}

impl SummaryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        SummaryRepository { pool }
    }

    // =========================================================================
    // Detail: program runs
    // =========================================================================

    /// Records a completed run and its per-channel volumes in one transaction.
    pub async fn record_run(&self, run: &ProgramRun) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO program_runs (
                id, site_id, program_id, program_name, started_at, ended_at,
                target_ec, target_ph, avg_ec, avg_ph, water_l, fertilizer_l
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(&run.id)
        .bind(&run.site_id)
        .bind(&run.program_id)
        .bind(&run.program_name)
        .bind(run.started_at)
        .bind(run.ended_at)
        .bind(run.target_ec)
        .bind(run.target_ph)
        .bind(run.avg_ec)
        .bind(run.avg_ph)
        .bind(run.water_l)
        .bind(run.fertilizer_l)
        .execute(&mut *tx)
        .await?;

        for channel in &run.channels {
            sqlx::query(
                "INSERT INTO program_run_channels (run_id, channel, volume_l) VALUES (?1, ?2, ?3)",
            )
            .bind(&run.id)
            .bind(&channel.channel)
            .bind(channel.volume_l)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Retention: deletes runs that started before `cutoff` (channels cascade).
    pub async fn delete_runs_before(&self, cutoff: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM program_runs WHERE started_at < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    // =========================================================================
    // Aggregation
    // =========================================================================

    /// Rolls up runs that started in `[from, to)` into summaries for `date`.
    ///
    /// Idempotent: existing unsynced rows are overwritten with fresh totals;
    /// synced rows are left untouched.
    ///
    /// ## Returns
    /// Number of summary rows inserted or refreshed.
    pub async fn aggregate_day(
        &self,
        site_id: &str,
        date: NaiveDate,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> DbResult<u64> {
        let mut tx = self.pool.begin().await?;

        let summaries = sqlx::query(
            r#"
            INSERT INTO daily_summaries (
                site_id, summary_date, program_id, program_name, run_count,
                target_ec, target_ph, avg_ec, avg_ph, total_water_l, total_fertilizer_l
            )
            SELECT site_id, ?2, program_id, MAX(program_name), COUNT(*),
                   AVG(target_ec), AVG(target_ph), AVG(avg_ec), AVG(avg_ph),
                   SUM(water_l), SUM(fertilizer_l)
              FROM program_runs
             WHERE site_id = ?1 AND started_at >= ?3 AND started_at < ?4
             GROUP BY site_id, program_id
            ON CONFLICT(site_id, summary_date, program_id) DO UPDATE SET
                program_name       = excluded.program_name,
                run_count          = excluded.run_count,
                target_ec          = excluded.target_ec,
                target_ph          = excluded.target_ph,
                avg_ec             = excluded.avg_ec,
                avg_ph             = excluded.avg_ph,
                total_water_l      = excluded.total_water_l,
                total_fertilizer_l = excluded.total_fertilizer_l
            WHERE daily_summaries.synced_at IS NULL
            "#,
        )
        .bind(site_id)
        .bind(date)
        .bind(from)
        .bind(to)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO daily_channel_flows (site_id, summary_date, program_id, channel, volume_l)
            SELECT r.site_id, ?2, r.program_id, c.channel, SUM(c.volume_l)
              FROM program_run_channels c
              JOIN program_runs r ON r.id = c.run_id
             WHERE r.site_id = ?1 AND r.started_at >= ?3 AND r.started_at < ?4
             GROUP BY r.site_id, r.program_id, c.channel
            ON CONFLICT(site_id, summary_date, program_id, channel) DO UPDATE SET
                volume_l = excluded.volume_l
            WHERE NOT EXISTS (
                SELECT 1 FROM daily_summaries s
                 WHERE s.site_id = daily_channel_flows.site_id
                   AND s.summary_date = daily_channel_flows.summary_date
                   AND s.program_id = daily_channel_flows.program_id
                   AND s.synced_at IS NOT NULL
            )
            "#,
        )
        .bind(site_id)
        .bind(date)
        .bind(from)
        .bind(to)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(
            site_id = %site_id,
            date = %date,
            rows = summaries.rows_affected(),
            "Aggregated daily summaries"
        );
        Ok(summaries.rows_affected())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// All summaries for one date, with channel breakdowns.
    pub async fn for_date(&self, site_id: &str, date: NaiveDate) -> DbResult<Vec<DailySummary>> {
        let rows = sqlx::query_as::<_, SummaryRow>(&format!(
            "SELECT {SUMMARY_COLUMNS} FROM daily_summaries \
             WHERE site_id = ?1 AND summary_date = ?2 ORDER BY program_id"
        ))
        .bind(site_id)
        .bind(date)
        .fetch_all(&self.pool)
        .await?;

        self.with_channels(site_id, date, date, rows).await
    }

    /// Unsynced summaries with dates in `[from, to]`, oldest first.
    pub async fn pending_between(
        &self,
        site_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> DbResult<Vec<DailySummary>> {
        let rows = sqlx::query_as::<_, SummaryRow>(&format!(
            "SELECT {SUMMARY_COLUMNS} FROM daily_summaries \
             WHERE site_id = ?1 AND summary_date >= ?2 AND summary_date <= ?3 \
               AND synced_at IS NULL \
             ORDER BY summary_date, program_id"
        ))
        .bind(site_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        self.with_channels(site_id, from, to, rows).await
    }

    async fn with_channels(
        &self,
        site_id: &str,
        from: NaiveDate,
        to: NaiveDate,
        rows: Vec<SummaryRow>,
    ) -> DbResult<Vec<DailySummary>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let flows = sqlx::query_as::<_, FlowRow>(
            r#"
            SELECT summary_date, program_id, channel, volume_l
              FROM daily_channel_flows
             WHERE site_id = ?1 AND summary_date >= ?2 AND summary_date <= ?3
             ORDER BY channel
            "#,
        )
        .bind(site_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        let mut by_key: HashMap<(NaiveDate, String), Vec<ChannelVolume>> = HashMap::new();
        for flow in flows {
            by_key
                .entry((flow.summary_date, flow.program_id))
                .or_default()
                .push(ChannelVolume {
                    channel: flow.channel,
                    volume_l: flow.volume_l,
                });
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let mut summary = DailySummary::from(row);
                summary.channels = by_key
                    .remove(&(summary.summary_date, summary.program_id.clone()))
                    .unwrap_or_default();
                summary
            })
            .collect())
    }

    // =========================================================================
    // Sync bookkeeping
    // =========================================================================

    /// Freezes the given summaries as delivered.
    pub async fn mark_synced(&self, summaries: &[DailySummary], at: DateTime<Utc>) -> DbResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut marked = 0;

        for summary in summaries {
            let result = sqlx::query(
                r#"
                UPDATE daily_summaries SET synced_at = ?4
                 WHERE site_id = ?1 AND summary_date = ?2 AND program_id = ?3
                   AND synced_at IS NULL
                "#,
            )
            .bind(&summary.site_id)
            .bind(summary.summary_date)
            .bind(&summary.program_id)
            .bind(at)
            .execute(&mut *tx)
            .await?;
            marked += result.rows_affected();
        }

        tx.commit().await?;
        Ok(marked)
    }

    /// Cloud side: stores a received summary. Redelivery overwrites the row
    /// with the same values, so duplicates are harmless.
    pub async fn upsert_received(&self, summary: &DailySummary, received_at: DateTime<Utc>) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO daily_summaries (
                site_id, summary_date, program_id, program_name, run_count,
                target_ec, target_ph, avg_ec, avg_ph, total_water_l, total_fertilizer_l,
                synced_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(site_id, summary_date, program_id) DO UPDATE SET
                program_name       = excluded.program_name,
                run_count          = excluded.run_count,
                target_ec          = excluded.target_ec,
                target_ph          = excluded.target_ph,
                avg_ec             = excluded.avg_ec,
                avg_ph             = excluded.avg_ph,
                total_water_l      = excluded.total_water_l,
                total_fertilizer_l = excluded.total_fertilizer_l,
                synced_at          = excluded.synced_at
            "#,
        )
        .bind(&summary.site_id)
        .bind(summary.summary_date)
        .bind(&summary.program_id)
        .bind(&summary.program_name)
        .bind(summary.run_count)
        .bind(summary.target_ec)
        .bind(summary.target_ph)
        .bind(summary.avg_ec)
        .bind(summary.avg_ph)
        .bind(summary.total_water_l)
        .bind(summary.total_fertilizer_l)
        .bind(received_at)
        .execute(&mut *tx)
        .await?;

        for channel in &summary.channels {
            sqlx::query(
                r#"
                INSERT INTO daily_channel_flows (site_id, summary_date, program_id, channel, volume_l)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(site_id, summary_date, program_id, channel) DO UPDATE SET
                    volume_l = excluded.volume_l
                "#,
            )
            .bind(&summary.site_id)
            .bind(summary.summary_date)
            .bind(&summary.program_id)
            .bind(&channel.channel)
            .bind(channel.volume_l)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use chrono::{Duration, TimeZone};

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    fn bounds() -> (DateTime<Utc>, DateTime<Utc>) {
        let from = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        (from, from + Duration::days(1))
    }

    fn run(id: &str, program: &str, hour: u32, water: f64, valve_1: f64) -> ProgramRun {
        let started = Utc.with_ymd_and_hms(2024, 6, 1, hour, 0, 0).unwrap();
        ProgramRun {
            id: id.to_string(),
            site_id: "s1".to_string(),
            program_id: program.to_string(),
            program_name: format!("Program {program}"),
            started_at: started,
            ended_at: started + Duration::minutes(30),
            target_ec: 1.8,
            target_ph: 6.0,
            avg_ec: 1.6,
            avg_ph: 6.2,
            water_l: water,
            fertilizer_l: water / 100.0,
            channels: vec![
                ChannelVolume { channel: "valve-1".into(), volume_l: valve_1 },
                ChannelVolume { channel: "valve-2".into(), volume_l: water - valve_1 },
            ],
        }
    }

    #[tokio::test]
    async fn test_aggregate_day_groups_by_program() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.summaries();
        repo.record_run(&run("r1", "p1", 6, 400.0, 100.0)).await.unwrap();
        repo.record_run(&run("r2", "p1", 18, 380.0, 80.0)).await.unwrap();
        repo.record_run(&run("r3", "p2", 7, 120.0, 20.0)).await.unwrap();
        // Next day: outside the window.
        let mut late = run("r4", "p1", 6, 999.0, 1.0);
        late.started_at += Duration::days(1);
        repo.record_run(&late).await.unwrap();

        let (from, to) = bounds();
        assert_eq!(repo.aggregate_day("s1", day(), from, to).await.unwrap(), 2);

        let summaries = repo.for_date("s1", day()).await.unwrap();
        assert_eq!(summaries.len(), 2);
        let p1 = &summaries[0];
        assert_eq!(p1.program_id, "p1");
        assert_eq!(p1.run_count, 2);
        assert!((p1.total_water_l - 780.0).abs() < 1e-9);
        let valve_1 = p1.channels.iter().find(|c| c.channel == "valve-1").unwrap();
        assert!((valve_1.volume_l - 180.0).abs() < 1e-9);
        assert_eq!(summaries[1].run_count, 1);
    }

    #[tokio::test]
    async fn test_synced_rows_are_frozen() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.summaries();
        let (from, to) = bounds();
        repo.record_run(&run("r1", "p1", 6, 400.0, 100.0)).await.unwrap();
        repo.aggregate_day("s1", day(), from, to).await.unwrap();

        let pending = repo.pending_between("s1", day(), day()).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(repo.mark_synced(&pending, to).await.unwrap(), 1);
        assert!(repo.pending_between("s1", day(), day()).await.unwrap().is_empty());

        // A late run re-aggregated after sync must not alter the synced row.
        repo.record_run(&run("r2", "p1", 20, 50.0, 10.0)).await.unwrap();
        repo.aggregate_day("s1", day(), from, to).await.unwrap();
        let stored = repo.for_date("s1", day()).await.unwrap();
        assert_eq!(stored[0].run_count, 1);
        assert!(stored[0].synced_at.is_some());
    }

    #[tokio::test]
    async fn test_no_runs_produces_no_summaries() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.summaries();
        let (from, to) = bounds();
        assert_eq!(repo.aggregate_day("s1", day(), from, to).await.unwrap(), 0);
        assert!(repo.for_date("s1", day()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_received_is_idempotent() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.summaries();
        let summary = DailySummary {
            site_id: "s1".into(),
            summary_date: day(),
            program_id: "p1".into(),
            program_name: "Morning".into(),
            run_count: 2,
            target_ec: 1.8,
            target_ph: 6.0,
            avg_ec: 1.7,
            avg_ph: 6.1,
            total_water_l: 780.0,
            total_fertilizer_l: 7.8,
            channels: vec![ChannelVolume { channel: "valve-1".into(), volume_l: 180.0 }],
            synced_at: None,
        };
        let (_, at) = bounds();
        repo.upsert_received(&summary, at).await.unwrap();
        repo.upsert_received(&summary, at).await.unwrap();

        let stored = repo.for_date("s1", day()).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].channels.len(), 1);
        assert_eq!(stored[0].synced_at, Some(at));
    }

    #[tokio::test]
    async fn test_delete_runs_cascades_channels() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.summaries();
        repo.record_run(&run("r1", "p1", 6, 400.0, 100.0)).await.unwrap();
        let (_, to) = bounds();
        assert_eq!(repo.delete_runs_before(to).await.unwrap(), 1);

        let channels: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM program_run_channels")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(channels, 0);
    }
}
