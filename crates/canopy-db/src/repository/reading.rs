//! # Sensor Reading Repository
//!
//! Detail-level time series sampled on the edge. Nothing here is synced to
//! the cloud; rows only live until retention removes them.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::error::DbResult;
use canopy_core::SensorReading;

/// Repository for sensor readings.
#[derive(Debug, Clone)]
pub struct ReadingRepository {
    pool: SqlitePool,
}

impl ReadingRepository {
    pub fn new(pool: SqlitePool) -> Self {
        ReadingRepository { pool }
    }

    pub async fn insert(&self, reading: &SensorReading) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sensor_readings (site_id, recorded_at, ec, ph, temperature_c, flow_rate_lpm)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&reading.site_id)
        .bind(reading.recorded_at)
        .bind(reading.ec)
        .bind(reading.ph)
        .bind(reading.temperature_c)
        .bind(reading.flow_rate_lpm)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Newest reading for a site.
    pub async fn latest(&self, site_id: &str) -> DbResult<Option<SensorReading>> {
        let reading = sqlx::query_as::<_, SensorReading>(
            r#"
            SELECT site_id, recorded_at, ec, ph, temperature_c, flow_rate_lpm
              FROM sensor_readings
             WHERE site_id = ?1
             ORDER BY recorded_at DESC
             LIMIT 1
            "#,
        )
        .bind(site_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(reading)
    }

    pub async fn count(&self) -> DbResult<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM sensor_readings")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Retention: deletes readings recorded before `cutoff`.
    pub async fn delete_before(&self, cutoff: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM sensor_readings WHERE recorded_at < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
