//! Failed deployment persistence

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::warn;

use super::sql_ts;
use crate::error::Result;
use crate::types::{FailedDeployment, Timestamp};

const SELECT_FAILED: &str = "SELECT entity_id, entity_type, reason, error_description, failure_timestamp, retry_count, origin_server, deployment_json FROM failed_deployments";

struct RawFailed {
    entity_id: String,
    entity_type: Option<String>,
    reason: String,
    error_description: String,
    failure_timestamp: i64,
    retry_count: i64,
    origin_server: String,
    deployment_json: Option<String>,
}

impl RawFailed {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            entity_id: row.get(0)?,
            entity_type: row.get(1)?,
            reason: row.get(2)?,
            error_description: row.get(3)?,
            failure_timestamp: row.get(4)?,
            retry_count: row.get(5)?,
            origin_server: row.get(6)?,
            deployment_json: row.get(7)?,
        })
    }

    fn into_failed(self) -> Result<FailedDeployment> {
        Ok(FailedDeployment {
            entity_id: self.entity_id,
            entity_type: self.entity_type.map(|t| t.parse()).transpose()?,
            reason: self.reason.parse()?,
            error_description: self.error_description,
            failure_timestamp: self.failure_timestamp.max(0) as Timestamp,
            retry_count: self.retry_count.max(0) as u32,
            origin_server: self.origin_server,
            deployment: self
                .deployment_json
                .map(|json| serde_json::from_str(&json))
                .transpose()?,
        })
    }
}

/// Insert or replace a failure record. A repeated failure keeps counting retries.
pub fn save_failed(conn: &Connection, failed: &FailedDeployment) -> Result<()> {
    conn.execute(
        "INSERT INTO failed_deployments
            (entity_id, entity_type, reason, error_description, failure_timestamp, retry_count, origin_server, deployment_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(entity_id) DO UPDATE SET
            reason = excluded.reason,
            error_description = excluded.error_description,
            failure_timestamp = excluded.failure_timestamp,
            retry_count = excluded.retry_count,
            origin_server = excluded.origin_server,
            entity_type = COALESCE(excluded.entity_type, failed_deployments.entity_type),
            deployment_json = COALESCE(excluded.deployment_json, failed_deployments.deployment_json)",
        params![
            failed.entity_id,
            failed.entity_type.map(|t| t.as_str()),
            failed.reason.as_str(),
            failed.error_description,
            sql_ts(failed.failure_timestamp),
            failed.retry_count as i64,
            failed.origin_server,
            failed
                .deployment
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        ],
    )?;
    Ok(())
}

pub fn get_failed(conn: &Connection, entity_id: &str) -> Result<Option<FailedDeployment>> {
    let raw = conn
        .query_row(
            &format!("{} WHERE entity_id = ?1", SELECT_FAILED),
            params![entity_id],
            RawFailed::from_row,
        )
        .optional()?;
    raw.map(RawFailed::into_failed).transpose()
}

/// All failures, oldest first. Rows that no longer decode are logged and left out.
pub fn list_failed(conn: &Connection) -> Result<Vec<FailedDeployment>> {
    let mut stmt = conn.prepare(&format!("{} ORDER BY failure_timestamp, entity_id", SELECT_FAILED))?;
    let raws = stmt
        .query_map([], RawFailed::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut listed = Vec::with_capacity(raws.len());
    for raw in raws {
        let entity_id = raw.entity_id.clone();
        match raw.into_failed() {
            Ok(failed) => listed.push(failed),
            Err(e) => warn!(entity_id = %entity_id, error = %e, "Skipping unreadable failure record"),
        }
    }
    Ok(listed)
}

pub fn remove_failed(conn: &Connection, entity_id: &str) -> Result<bool> {
    let removed = conn.execute(
        "DELETE FROM failed_deployments WHERE entity_id = ?1",
        params![entity_id],
    )?;
    Ok(removed > 0)
}
