//! Change log and commit ledger queries

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use sqlx::{QueryBuilder, Sqlite};

use super::SqliteStore;
use crate::sync::{
    ChangeLog, ChangeLogEntry, EntryFilter, EntryId, EntryStatus, InspectedEntry, SyncError,
    Version, INITIAL_VERSION,
};

/// Row of `change_log`
#[derive(Debug, sqlx::FromRow)]
struct EntryRow {
    id: i64,
    user_id: String,
    target_version: i64,
    payload: String,
    device_id: String,
    created_at: String,
}

impl EntryRow {
    fn into_entry(self) -> Result<ChangeLogEntry, SyncError> {
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| {
                SyncError::CorruptRecord(format!(
                    "change log entry {} has bad timestamp {:?}: {}",
                    self.id, self.created_at, e
                ))
            })?
            .with_timezone(&Utc);

        Ok(ChangeLogEntry {
            id: EntryId(self.id),
            user_id: self.user_id,
            target_version: self.target_version,
            payload: self.payload,
            device_id: self.device_id,
            created_at,
        })
    }
}

/// Entry row with its status derived from the commit ledger
#[derive(Debug, sqlx::FromRow)]
struct InspectedRow {
    #[sqlx(flatten)]
    entry: EntryRow,
    status: String,
}

const UNCOMMITTED: &str = "id NOT IN (SELECT entry_id FROM version_commits WHERE user_id = ?)";

#[async_trait]
impl ChangeLog for SqliteStore {
    async fn append(
        &self,
        user_id: &str,
        target_version: Version,
        payload: &str,
        device_id: &str,
    ) -> Result<EntryId, SyncError> {
        let result = sqlx::query(
            r#"
            INSERT INTO change_log (user_id, target_version, payload, device_id, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(target_version)
        .bind(payload)
        .bind(device_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(EntryId(result.last_insert_rowid()))
    }

    fn range_after<'a>(
        &'a self,
        user_id: &'a str,
        since: Version,
        up_to: Version,
    ) -> BoxStream<'a, Result<ChangeLogEntry, SyncError>> {
        sqlx::query_as::<_, EntryRow>(
            r#"
            SELECT c.id, c.user_id, c.target_version, c.payload, c.device_id, c.created_at
            FROM change_log c
            JOIN version_commits vc
              ON vc.user_id = c.user_id
             AND vc.version = c.target_version
             AND vc.entry_id = c.id
            WHERE c.user_id = ? AND c.target_version > ? AND c.target_version <= ?
            ORDER BY c.target_version ASC
            "#,
        )
        .bind(user_id)
        .bind(since)
        .bind(up_to)
        .fetch(&self.pool)
        .map(|row| row.map_err(SyncError::from).and_then(EntryRow::into_entry))
        .boxed()
    }

    async fn count_above(&self, user_id: &str, confirmed: Version) -> Result<u64, SyncError> {
        let query = format!(
            "SELECT COUNT(*) FROM change_log WHERE user_id = ? AND target_version > ? AND {}",
            UNCOMMITTED
        );
        let (count,): (i64,) = sqlx::query_as(&query)
            .bind(user_id)
            .bind(confirmed)
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(count as u64)
    }

    async fn delete_above(&self, user_id: &str, confirmed: Version) -> Result<u64, SyncError> {
        let query = format!(
            "DELETE FROM change_log WHERE user_id = ? AND target_version > ? AND {}",
            UNCOMMITTED
        );
        let result = sqlx::query(&query)
            .bind(user_id)
            .bind(confirmed)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn count_superseded(
        &self,
        user_id: &str,
        confirmed: Version,
    ) -> Result<u64, SyncError> {
        let query = format!(
            "SELECT COUNT(*) FROM change_log WHERE user_id = ? AND target_version <= ? AND {}",
            UNCOMMITTED
        );
        let (count,): (i64,) = sqlx::query_as(&query)
            .bind(user_id)
            .bind(confirmed)
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(count as u64)
    }

    async fn delete_superseded(
        &self,
        user_id: &str,
        confirmed: Version,
    ) -> Result<u64, SyncError> {
        let query = format!(
            "DELETE FROM change_log WHERE user_id = ? AND target_version <= ? AND {}",
            UNCOMMITTED
        );
        let result = sqlx::query(&query)
            .bind(user_id)
            .bind(confirmed)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn discard(&self, user_id: &str, entry_id: EntryId) -> Result<bool, SyncError> {
        let query = format!(
            "DELETE FROM change_log WHERE id = ? AND user_id = ? AND {}",
            UNCOMMITTED
        );
        let result = sqlx::query(&query)
            .bind(entry_id.0)
            .bind(user_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn find(&self, filter: &EntryFilter) -> Result<Vec<InspectedEntry>, SyncError> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            r#"
            SELECT id, user_id, target_version, payload, device_id, created_at, status
            FROM (
                SELECT c.id, c.user_id, c.target_version, c.payload, c.device_id, c.created_at,
                       CASE
                           WHEN vc.entry_id IS NOT NULL THEN 'confirmed'
                           WHEN c.target_version > COALESCE(v.version, "#,
        );
        builder.push_bind(INITIAL_VERSION);
        builder.push(
            r#") THEN 'orphaned'
                           ELSE 'superseded'
                       END AS status
                FROM change_log c
                LEFT JOIN version_commits vc
                  ON vc.user_id = c.user_id
                 AND vc.version = c.target_version
                 AND vc.entry_id = c.id
                LEFT JOIN user_versions v ON v.user_id = c.user_id
            )
            WHERE 1 = 1"#,
        );

        if let Some(user_id) = &filter.user_id {
            builder.push(" AND user_id = ").push_bind(user_id.clone());
        }
        if let Some(device_id) = &filter.device_id {
            builder.push(" AND device_id = ").push_bind(device_id.clone());
        }
        if let Some(min) = filter.min_version {
            builder.push(" AND target_version >= ").push_bind(min);
        }
        if let Some(max) = filter.max_version {
            builder.push(" AND target_version <= ").push_bind(max);
        }
        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        builder.push(" ORDER BY user_id ASC, target_version ASC, id ASC");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ").push_bind(i64::from(limit));
        }

        let rows = builder
            .build_query_as::<InspectedRow>()
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                let status = row.status.parse::<EntryStatus>()?;
                Ok(InspectedEntry {
                    entry: row.entry.into_entry()?,
                    status,
                })
            })
            .collect()
    }
}
