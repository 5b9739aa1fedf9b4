//! # Edge Config Repository
//!
//! The edge keeps exactly one program-configuration document, replaced
//! wholesale by `config-update` messages. Versions only move forward, so a
//! redelivered or reordered update is ignored.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::error::{DbError, DbResult};

/// The stored configuration document.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredConfig {
    pub version: i64,
    pub document: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// Repository for the edge configuration document.
#[derive(Debug, Clone)]
pub struct EdgeConfigRepository {
    pool: SqlitePool,
}

impl EdgeConfigRepository {
    pub fn new(pool: SqlitePool) -> Self {
        EdgeConfigRepository { pool }
    }

    pub async fn current(&self) -> DbResult<Option<StoredConfig>> {
        let row: Option<(i64, String, DateTime<Utc>)> =
            sqlx::query_as("SELECT version, document, updated_at FROM edge_config WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(version, document, updated_at)| {
            let document = serde_json::from_str(&document).map_err(|e| DbError::Corrupt {
                column: "edge_config.document".to_string(),
                reason: e.to_string(),
            })?;
            Ok(StoredConfig {
                version,
                document,
                updated_at,
            })
        })
        .transpose()
    }

    /// Replaces the document if `version` is newer than the stored one.
    ///
    /// ## Returns
    /// `true` if the document was replaced.
    pub async fn replace_if_newer(
        &self,
        version: i64,
        document: &serde_json::Value,
        at: DateTime<Utc>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO edge_config (id, version, document, updated_at)
            VALUES (1, ?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET
                version    = excluded.version,
                document   = excluded.document,
                updated_at = excluded.updated_at
            WHERE excluded.version > edge_config.version
            "#,
        )
        .bind(version)
        .bind(document.to_string())
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use serde_json::json;

    #[tokio::test]
    async fn test_versions_only_move_forward() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.edge_config();
        let now = Utc::now();

        assert!(repo.current().await.unwrap().is_none());
        assert!(repo.replace_if_newer(2, &json!({"programs": []}), now).await.unwrap());
        assert!(!repo.replace_if_newer(2, &json!({"programs": [1]}), now).await.unwrap());
        assert!(!repo.replace_if_newer(1, &json!({"programs": [1]}), now).await.unwrap());

        let stored = repo.current().await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.document, json!({"programs": []}));

        assert!(repo.replace_if_newer(3, &json!({"programs": [1]}), now).await.unwrap());
        assert_eq!(repo.current().await.unwrap().unwrap().version, 3);
    }
}
