//! User version rows

use async_trait::async_trait;
use chrono::Utc;

use super::SqliteStore;
use crate::sync::{
    check_transition, EntryId, SyncError, UserLocks, UserVersion, Version, VersionStore,
    INITIAL_VERSION,
};

#[async_trait]
impl VersionStore for SqliteStore {
    fn locks(&self) -> &UserLocks {
        &self.locks
    }

    async fn read(&self, user_id: &str) -> Result<Version, SyncError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT version FROM user_versions WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(v,)| v).unwrap_or(INITIAL_VERSION))
    }

    async fn compare_and_swap(
        &self,
        user_id: &str,
        expected: Version,
        new_value: Version,
        entry_id: EntryId,
    ) -> Result<bool, SyncError> {
        check_transition(expected, new_value)?;

        // The commit ledger row is written by trg_user_versions_commit
        let result = sqlx::query(
            r#"
            UPDATE user_versions
            SET version = ?, head_entry_id = ?, updated_at = ?
            WHERE user_id = ? AND version = ?
              AND EXISTS (
                  SELECT 1 FROM change_log
                  WHERE id = ? AND user_id = ? AND target_version = ?
              )
            "#,
        )
        .bind(new_value)
        .bind(entry_id.0)
        .bind(Utc::now().to_rfc3339())
        .bind(user_id)
        .bind(expected)
        .bind(entry_id.0)
        .bind(user_id)
        .bind(new_value)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn ensure_exists(&self, user_id: &str) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            INSERT INTO user_versions (user_id, version, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(INITIAL_VERSION)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_versions(&self) -> Result<Vec<UserVersion>, SyncError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT user_id, version FROM user_versions ORDER BY version DESC, user_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(user_id, version)| UserVersion { user_id, version })
            .collect())
    }
}
