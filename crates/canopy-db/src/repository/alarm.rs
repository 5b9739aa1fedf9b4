//! # Alarm Repository
//!
//! Alarm episodes: a create event (`occurred_at`) and at most one resolve
//! event (`resolved_at`).
//!
//! ## Episode Lifecycle
//! ```text
//!  create_open()                    resolve(id, now)
//!  ─────────────► [ OPEN ] ───────────────────────► [ RESOLVED ]
//!                 resolved_at = NULL                resolved_at = now
//!
//!  A partial UNIQUE index rejects a second open OFFLINE episode for the
//!  same site, so the storage layer backs the liveness invariant.
//! ```

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;
use canopy_core::AlarmEpisode;

const ALARM_COLUMNS: &str = "id, site_id, alarm_type, message, occurred_at, resolved_at";

/// Repository for alarm episodes.
#[derive(Debug, Clone)]
pub struct AlarmRepository {
    pool: SqlitePool,
}

impl AlarmRepository {
    pub fn new(pool: SqlitePool) -> Self {
        AlarmRepository { pool }
    }

    /// Inserts an episode as given (open or already resolved).
    ///
    /// Fails with `UniqueViolation` when it would be a second open OFFLINE
    /// episode for the site.
    pub async fn insert(&self, episode: &AlarmEpisode) -> DbResult<()> {
        debug!(
            site_id = %episode.site_id,
            alarm_type = %episode.alarm_type,
            "Recording alarm episode"
        );

        sqlx::query(
            r#"
            INSERT INTO alarms (id, site_id, alarm_type, message, occurred_at, resolved_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&episode.id)
        .bind(&episode.site_id)
        .bind(&episode.alarm_type)
        .bind(&episode.message)
        .bind(episode.occurred_at)
        .bind(episode.resolved_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// The open episode of the given type for a site, if any. When several
    /// non-unique types are open, the most recent one is returned.
    pub async fn find_open(&self, site_id: &str, alarm_type: &str) -> DbResult<Option<AlarmEpisode>> {
        let episode = sqlx::query_as::<_, AlarmEpisode>(&format!(
            r#"
            SELECT {ALARM_COLUMNS}
              FROM alarms
             WHERE site_id = ?1 AND alarm_type = ?2 AND resolved_at IS NULL
             ORDER BY occurred_at DESC
             LIMIT 1
            "#
        ))
        .bind(site_id)
        .bind(alarm_type)
        .fetch_optional(&self.pool)
        .await?;

        Ok(episode)
    }

    /// Resolves an open episode.
    ///
    /// ## Returns
    /// `true` if the episode was open and is now resolved; `false` if it was
    /// already resolved (resolve happens exactly once).
    pub async fn resolve(&self, id: &str, at: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE alarms SET resolved_at = ?2 WHERE id = ?1 AND resolved_at IS NULL",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Number of open episodes of a type for a site.
    pub async fn count_open(&self, site_id: &str, alarm_type: &str) -> DbResult<i64> {
        let count = sqlx::query_scalar(
            "SELECT COUNT(*) FROM alarms WHERE site_id = ?1 AND alarm_type = ?2 AND resolved_at IS NULL",
        )
        .bind(site_id)
        .bind(alarm_type)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// All episodes for a site, oldest first.
    pub async fn list_for_site(&self, site_id: &str) -> DbResult<Vec<AlarmEpisode>> {
        let episodes = sqlx::query_as::<_, AlarmEpisode>(&format!(
            "SELECT {ALARM_COLUMNS} FROM alarms WHERE site_id = ?1 ORDER BY occurred_at"
        ))
        .bind(site_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(episodes)
    }

    /// Retention: deletes resolved episodes that occurred before `cutoff`.
    /// Open episodes are kept regardless of age.
    pub async fn delete_resolved_before(&self, cutoff: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query(
            "DELETE FROM alarms WHERE occurred_at < ?1 AND resolved_at IS NOT NULL",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
