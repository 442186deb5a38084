//! Database schema initialization

use sqlx::SqlitePool;

/// Initialize the database schema
pub async fn initialize_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(SCHEMA_SQL).execute(pool).await?;

    Ok(())
}

const SCHEMA_SQL: &str = r#"
-- Confirmed version per user
CREATE TABLE IF NOT EXISTS user_versions (
    user_id TEXT PRIMARY KEY,
    version INTEGER NOT NULL DEFAULT 0,
    head_entry_id INTEGER,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_user_versions_version ON user_versions(version);

-- Append-only changesets, tagged with the version they try to produce
CREATE TABLE IF NOT EXISTS change_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    target_version INTEGER NOT NULL,
    payload TEXT NOT NULL,
    device_id TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_change_log_user_version ON change_log(user_id, target_version);

-- Entry that produced each confirmed version
CREATE TABLE IF NOT EXISTS version_commits (
    user_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    entry_id INTEGER NOT NULL,
    committed_at TEXT NOT NULL,

    PRIMARY KEY (user_id, version)
);

CREATE INDEX IF NOT EXISTS idx_version_commits_entry ON version_commits(entry_id);

-- A CAS that advances the version records its entry in the same statement
CREATE TRIGGER IF NOT EXISTS trg_user_versions_commit
AFTER UPDATE OF version ON user_versions
WHEN NEW.head_entry_id IS NOT NULL AND NEW.version <> OLD.version
BEGIN
    INSERT INTO version_commits (user_id, version, entry_id, committed_at)
    VALUES (NEW.user_id, NEW.version, NEW.head_entry_id, NEW.updated_at);
END;
"#;
