//! # Command Audit Repository
//!
//! Append-only log of every command, whatever its origin. There is no update
//! or delete path: a record is written once and kept.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};
use canopy_core::{CommandOrigin, CommandRecord, CommandResult};

/// Raw row; `detail` is stored as JSON text.
#[derive(sqlx::FromRow)]
struct CommandRow {
    id: String,
    site_id: String,
    command_type: String,
    detail: String,
    origin: CommandOrigin,
    issued_by: Option<String>,
    issued_at: DateTime<Utc>,
    result: CommandResult,
    result_detail: Option<String>,
}

impl TryFrom<CommandRow> for CommandRecord {
    type Error = DbError;

    fn try_from(row: CommandRow) -> Result<Self, Self::Error> {
        let detail = serde_json::from_str(&row.detail).map_err(|e| DbError::Corrupt {
            column: "commands.detail".to_string(),
            reason: e.to_string(),
        })?;

        Ok(CommandRecord {
            id: row.id,
            site_id: row.site_id,
            command_type: row.command_type,
            detail,
            origin: row.origin,
            issued_by: row.issued_by,
            issued_at: row.issued_at,
            result: row.result,
            result_detail: row.result_detail,
        })
    }
}

/// Repository for the command audit log.
#[derive(Debug, Clone)]
pub struct CommandRepository {
    pool: SqlitePool,
}

impl CommandRepository {
    pub fn new(pool: SqlitePool) -> Self {
        CommandRepository { pool }
    }

    /// Appends one audit record.
    pub async fn append(&self, record: &CommandRecord) -> DbResult<()> {
        debug!(
            site_id = %record.site_id,
            command = %record.command_type,
            origin = ?record.origin,
            result = ?record.result,
            "Appending command audit record"
        );

        sqlx::query(
            r#"
            INSERT INTO commands (
                id, site_id, command_type, detail, origin,
                issued_by, issued_at, result, result_detail
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&record.id)
        .bind(&record.site_id)
        .bind(&record.command_type)
        .bind(record.detail.to_string())
        .bind(record.origin)
        .bind(&record.issued_by)
        .bind(record.issued_at)
        .bind(record.result)
        .bind(&record.result_detail)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Most recent records for a site, newest first.
    pub async fn list_for_site(&self, site_id: &str, limit: i64) -> DbResult<Vec<CommandRecord>> {
        let rows = sqlx::query_as::<_, CommandRow>(
            r#"
            SELECT id, site_id, command_type, detail, origin,
                   issued_by, issued_at, result, result_detail
              FROM commands
             WHERE site_id = ?1
             ORDER BY issued_at DESC
             LIMIT ?2
            "#,
        )
        .bind(site_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CommandRecord::try_from).collect()
    }

    /// Whether a record with this id was already appended.
    pub async fn exists(&self, id: &str) -> DbResult<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM commands WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(found.is_some())
    }

    pub async fn count_for_site(&self, site_id: &str) -> DbResult<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM commands WHERE site_id = ?1")
            .bind(site_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use serde_json::json;

    #[tokio::test]
    async fn test_append_and_list() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.commands();

        let ok = CommandRecord::new(
            "site-1",
            "start",
            json!({"programId": "p1"}),
            CommandOrigin::Remote,
            Some("user-7".into()),
            Utc::now(),
        );
        let failed = CommandRecord::new(
            "site-1",
            "self-destruct",
            json!({}),
            CommandOrigin::LocalManual,
            None,
            Utc::now(),
        )
        .failed("Unknown command type: self-destruct");

        repo.append(&ok).await.unwrap();
        repo.append(&failed).await.unwrap();

        assert_eq!(repo.count_for_site("site-1").await.unwrap(), 2);
        assert_eq!(repo.count_for_site("site-2").await.unwrap(), 0);

        let records = repo.list_for_site("site-1", 10).await.unwrap();
        assert_eq!(records.len(), 2);
        let stored_ok = records.iter().find(|r| r.id == ok.id).unwrap();
        assert_eq!(stored_ok, &ok);
        let stored_failed = records.iter().find(|r| r.id == failed.id).unwrap();
        assert_eq!(stored_failed.result, CommandResult::Failure);
    }

    #[tokio::test]
    async fn test_record_ids_are_unique() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.commands();
        let record = CommandRecord::new(
            "site-1",
            "stop",
            json!({}),
            CommandOrigin::Scheduled,
            None,
            Utc::now(),
        );
        assert!(!repo.exists(&record.id).await.unwrap());
        repo.append(&record).await.unwrap();
        assert!(repo.exists(&record.id).await.unwrap());

        let err = repo.append(&record).await.unwrap_err();
        assert!(matches!(err, DbError::UniqueViolation { .. }));
    }
}
