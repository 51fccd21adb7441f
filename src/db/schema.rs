//! Database schema definitions

use rusqlite::Connection;
use tracing::info;

use crate::error::{CatalystError, Result};

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        conn.execute_batch(DEPLOYMENTS_SCHEMA)
            .map_err(|e| CatalystError::Database(format!("Failed to create deployment tables: {}", e)))?;
        conn.execute_batch(SNAPSHOTS_SCHEMA)
            .map_err(|e| CatalystError::Database(format!("Failed to create snapshot tables: {}", e)))?;
        conn.execute_batch(SYNC_SCHEMA)
            .map_err(|e| CatalystError::Database(format!("Failed to create sync tables: {}", e)))?;
        conn.execute_batch(INDEXES_SCHEMA)
            .map_err(|e| CatalystError::Database(format!("Failed to create indexes: {}", e)))?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version > SCHEMA_VERSION {
        return Err(CatalystError::Database(format!(
            "Database schema v{} is newer than supported v{}",
            current_version, SCHEMA_VERSION
        )));
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

/// Append-only deployment history. `deleter_deployment` is the tombstone.
const DEPLOYMENTS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS deployments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id TEXT NOT NULL UNIQUE,
    entity_type TEXT NOT NULL,
    entity_timestamp INTEGER NOT NULL,
    entity_json TEXT NOT NULL,
    origin_server TEXT NOT NULL,
    local_timestamp INTEGER NOT NULL,
    deleter_deployment INTEGER REFERENCES deployments(id)
);

CREATE TABLE IF NOT EXISTS deployment_pointers (
    deployment_id INTEGER NOT NULL REFERENCES deployments(id),
    entity_type TEXT NOT NULL,
    pointer TEXT NOT NULL,
    PRIMARY KEY (deployment_id, pointer)
);

CREATE TABLE IF NOT EXISTS content_files (
    deployment_id INTEGER NOT NULL REFERENCES deployments(id),
    file_name TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    PRIMARY KEY (deployment_id, file_name)
);
"#;

const SNAPSHOTS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
    hash TEXT PRIMARY KEY,
    init_timestamp INTEGER NOT NULL,
    end_timestamp INTEGER NOT NULL,
    replaced_hashes TEXT NOT NULL DEFAULT '[]',
    number_of_entities INTEGER NOT NULL,
    generation_time INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS processed_snapshots (
    hash TEXT PRIMARY KEY,
    process_time INTEGER NOT NULL
);
"#;

const SYNC_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS failed_deployments (
    entity_id TEXT PRIMARY KEY,
    entity_type TEXT,
    reason TEXT NOT NULL,
    error_description TEXT NOT NULL,
    failure_timestamp INTEGER NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    origin_server TEXT NOT NULL,
    deployment_json TEXT
);

CREATE TABLE IF NOT EXISTS peer_sync_state (
    address TEXT PRIMARY KEY,
    last_local_timestamp INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
"#;

const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_deployments_entity_ts ON deployments(entity_timestamp, entity_id);
CREATE INDEX IF NOT EXISTS idx_deployments_local_ts ON deployments(local_timestamp);
CREATE INDEX IF NOT EXISTS idx_deployments_deleter ON deployments(deleter_deployment);
CREATE INDEX IF NOT EXISTS idx_pointers_lookup ON deployment_pointers(entity_type, pointer);
CREATE INDEX IF NOT EXISTS idx_content_files_hash ON content_files(content_hash);
CREATE INDEX IF NOT EXISTS idx_snapshots_range ON snapshots(init_timestamp, end_timestamp);
CREATE INDEX IF NOT EXISTS idx_failed_timestamp ON failed_deployments(failure_timestamp);
"#;
