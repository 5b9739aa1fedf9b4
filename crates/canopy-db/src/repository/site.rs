//! # Site Repository
//!
//! Site identity and the two fields the relay writes: `last_contact_at` and
//! `status`. Also per-site view grants.
//!
//! ## Monotonic Contact
//! ```text
//! stored last_contact_at: 10:05
//!
//!   heartbeat @ 10:07 ──► UPDATE ... WHERE last_contact_at < 10:07  → 1 row
//!   heartbeat @ 10:07 ──► (duplicate)                                → 0 rows
//!   heartbeat @ 10:03 ──► (late, reordered)                          → 0 rows
//! ```
//! The comparison happens inside the UPDATE, so concurrent writers can never
//! move the timestamp backwards.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};
use canopy_core::{Site, SiteStatus};

const SITE_COLUMNS: &str = "id, name, tenant_id, status, last_contact_at, created_at";

/// Repository for site operations.
#[derive(Debug, Clone)]
pub struct SiteRepository {
    pool: SqlitePool,
}

impl SiteRepository {
    pub fn new(pool: SqlitePool) -> Self {
        SiteRepository { pool }
    }

    /// Inserts a site. Site management proper lives outside the relay; this
    /// exists for provisioning and tests.
    pub async fn insert(&self, site: &Site) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sites (id, name, tenant_id, status, last_contact_at, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&site.id)
        .bind(&site.name)
        .bind(&site.tenant_id)
        .bind(site.status)
        .bind(site.last_contact_at)
        .bind(site.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<Site>> {
        let site = sqlx::query_as::<_, Site>(&format!(
            "SELECT {SITE_COLUMNS} FROM sites WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(site)
    }

    /// Looks a site up by its broker-addressable name.
    pub async fn get_by_name(&self, name: &str) -> DbResult<Option<Site>> {
        let site = sqlx::query_as::<_, Site>(&format!(
            "SELECT {SITE_COLUMNS} FROM sites WHERE name = ?1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(site)
    }

    /// Sites the liveness monitor evaluates.
    pub async fn list_active(&self) -> DbResult<Vec<Site>> {
        let sites = sqlx::query_as::<_, Site>(&format!(
            "SELECT {SITE_COLUMNS} FROM sites WHERE status = 'active' ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(sites)
    }

    /// Advances `last_contact_at` for the named site.
    ///
    /// ## Returns
    /// * `Ok(true)` - timestamp moved forward
    /// * `Ok(false)` - stored value was the same or later (duplicate/reordered)
    /// * `Err(NotFound)` - no site with that name
    pub async fn touch_last_contact(&self, name: &str, at: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sites
               SET last_contact_at = ?2
             WHERE name = ?1
               AND (last_contact_at IS NULL OR last_contact_at < ?2)
            "#,
        )
        .bind(name)
        .bind(at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM sites WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        match exists {
            Some(_) => {
                debug!(site = %name, at = %at, "Ignoring non-advancing contact time");
                Ok(false)
            }
            None => Err(DbError::not_found("Site", name)),
        }
    }

    pub async fn set_status(&self, id: &str, status: SiteStatus) -> DbResult<()> {
        let result = sqlx::query("UPDATE sites SET status = ?2 WHERE id = ?1")
            .bind(id)
            .bind(status)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Site", id));
        }
        Ok(())
    }
}

// =============================================================================
// Grants
// =============================================================================

/// Repository for explicit per-site view grants.
#[derive(Debug, Clone)]
pub struct GrantRepository {
    pool: SqlitePool,
}

impl GrantRepository {
    pub fn new(pool: SqlitePool) -> Self {
        GrantRepository { pool }
    }

    /// Grants `user_id` view access to `site_id`. Re-granting is a no-op.
    pub async fn grant(&self, user_id: &str, site_id: &str) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO site_grants (user_id, site_id, granted_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(user_id, site_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(site_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn revoke(&self, user_id: &str, site_id: &str) -> DbResult<()> {
        sqlx::query("DELETE FROM site_grants WHERE user_id = ?1 AND site_id = ?2")
            .bind(user_id)
            .bind(site_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn has_grant(&self, user_id: &str, site_id: &str) -> DbResult<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM site_grants WHERE user_id = ?1 AND site_id = ?2")
                .bind(user_id)
                .bind(site_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(found.is_some())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
