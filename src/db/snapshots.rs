//! Snapshot metadata and processed-snapshot bookkeeping

use std::collections::HashSet;

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::sql_ts;
use crate::error::Result;
use crate::time_range::TimeRange;
use crate::types::{SnapshotMetadata, Timestamp};

const SELECT_SNAPSHOT: &str = "SELECT hash, init_timestamp, end_timestamp, replaced_hashes, number_of_entities, generation_time FROM snapshots";

fn snapshot_from_row(row: &Row) -> rusqlite::Result<(SnapshotMetadata, String)> {
    let init: i64 = row.get(1)?;
    let end: i64 = row.get(2)?;
    let count: i64 = row.get(4)?;
    let generation: i64 = row.get(5)?;
    Ok((
        SnapshotMetadata {
            hash: row.get(0)?,
            time_range: TimeRange::new(init.max(0) as Timestamp, end.max(0) as Timestamp),
            replaced_snapshot_hashes: Vec::new(),
            number_of_entities: count.max(0) as u64,
            generation_timestamp: generation.max(0) as Timestamp,
        },
        row.get(3)?,
    ))
}

fn query_snapshots(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Vec<SnapshotMetadata>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, snapshot_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|(mut snapshot, replaced)| -> Result<SnapshotMetadata> {
            snapshot.replaced_snapshot_hashes = serde_json::from_str(&replaced)?;
            Ok(snapshot)
        })
        .collect()
}

/// Persist snapshot metadata.
///
/// The same manifest can describe a different range after a merge, so saving an
/// existing hash overwrites the whole row.
pub fn save_snapshot(conn: &Connection, snapshot: &SnapshotMetadata) -> Result<()> {
    conn.execute(
        "INSERT INTO snapshots
            (hash, init_timestamp, end_timestamp, replaced_hashes, number_of_entities, generation_time)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(hash) DO UPDATE SET
            init_timestamp = excluded.init_timestamp,
            end_timestamp = excluded.end_timestamp,
            generation_time = excluded.generation_time,
            number_of_entities = excluded.number_of_entities,
            replaced_hashes = excluded.replaced_hashes",
        params![
            snapshot.hash,
            sql_ts(snapshot.time_range.init_timestamp),
            sql_ts(snapshot.time_range.end_timestamp),
            serde_json::to_string(&snapshot.replaced_snapshot_hashes)?,
            snapshot.number_of_entities as i64,
            sql_ts(snapshot.generation_timestamp),
        ],
    )?;
    Ok(())
}

pub fn get_snapshot(conn: &Connection, hash: &str) -> Result<Option<SnapshotMetadata>> {
    let row = conn
        .query_row(
            &format!("{} WHERE hash = ?1", SELECT_SNAPSHOT),
            params![hash],
            snapshot_from_row,
        )
        .optional()?;
    row.map(|(mut snapshot, replaced)| -> Result<SnapshotMetadata> {
        snapshot.replaced_snapshot_hashes = serde_json::from_str(&replaced)?;
        Ok(snapshot)
    })
    .transpose()
}

/// Whether this node generated (and still holds) the snapshot
pub fn is_own_snapshot(conn: &Connection, hash: &str) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM snapshots WHERE hash = ?1)",
        params![hash],
        |row| row.get(0),
    )?)
}

pub fn all_snapshots(conn: &Connection) -> Result<Vec<SnapshotMetadata>> {
    query_snapshots(
        conn,
        &format!("{} ORDER BY init_timestamp, end_timestamp", SELECT_SNAPSHOT),
        [],
    )
}

/// Snapshots whose range lies entirely inside `range`
pub fn snapshots_contained_in(conn: &Connection, range: &TimeRange) -> Result<Vec<SnapshotMetadata>> {
    query_snapshots(
        conn,
        &format!(
            "{} WHERE init_timestamp >= ?1 AND end_timestamp <= ?2 ORDER BY init_timestamp, end_timestamp",
            SELECT_SNAPSHOT
        ),
        params![sql_ts(range.init_timestamp), sql_ts(range.end_timestamp)],
    )
}

/// Snapshots whose range intersects `range`
pub fn snapshots_intersecting(conn: &Connection, range: &TimeRange) -> Result<Vec<SnapshotMetadata>> {
    query_snapshots(
        conn,
        &format!(
            "{} WHERE init_timestamp < ?2 AND end_timestamp > ?1 ORDER BY init_timestamp, end_timestamp",
            SELECT_SNAPSHOT
        ),
        params![sql_ts(range.init_timestamp), sql_ts(range.end_timestamp)],
    )
}

/// Delete the given snapshots. Returns how many rows were removed.
pub fn delete_snapshots(conn: &Connection, hashes: &[String]) -> Result<usize> {
    let mut stmt = conn.prepare("DELETE FROM snapshots WHERE hash = ?1")?;
    let mut deleted = 0;
    for hash in hashes {
        deleted += stmt.execute(params![hash])?;
    }
    Ok(deleted)
}

/// Hashes of every stored snapshot
pub fn current_snapshot_hashes(conn: &Connection) -> Result<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT hash FROM snapshots")?;
    let hashes = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<HashSet<_>>>()?;
    Ok(hashes)
}

pub fn save_processed_snapshot(conn: &Connection, hash: &str, process_time: Timestamp) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO processed_snapshots (hash, process_time) VALUES (?1, ?2)",
        params![hash, sql_ts(process_time)],
    )?;
    Ok(())
}

pub fn is_processed_snapshot(conn: &Connection, hash: &str) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM processed_snapshots WHERE hash = ?1)",
        params![hash],
        |row| row.get(0),
    )?)
}

/// Of `hashes`, the ones already processed
pub fn processed_snapshots(conn: &Connection, hashes: &[String]) -> Result<HashSet<String>> {
    let mut processed = HashSet::new();
    for hash in hashes {
        if is_processed_snapshot(conn, hash)? {
            processed.insert(hash.clone());
        }
    }
    Ok(processed)
}
