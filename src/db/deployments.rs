//! Deployment history operations
//!
//! [`save_deployment`] is the only writer: it records the entity, assigns its
//! local timestamp and applies pointer resolution in one transaction, so there
//! is never a moment where two deployments are active for the same pointer.

use std::collections::{BTreeMap, HashSet};

use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::debug;

use super::sql_ts;
use crate::error::Result;
use crate::pointers::{resolve, EntityOrderKey, PointerCandidate};
use crate::time_range::TimeRange;
use crate::types::{DeletionState, Deployment, DeploymentId, Entity, EntityId, EntityType, Timestamp};

const SELECT_DEPLOYMENT: &str =
    "SELECT d.id, d.entity_json, d.origin_server, d.local_timestamp, d.deleter_deployment FROM deployments d";

/// Result of [`save_deployment`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The entity is already in history; nothing changed
    AlreadyPresent,
    Saved(SavedDeployment),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedDeployment {
    pub deployment_id: DeploymentId,
    pub local_timestamp: Timestamp,
    /// Set when the deployment lost to an existing one on arrival
    pub superseded_by: Option<DeploymentId>,
    /// Deployments this one tombstoned
    pub tombstoned: Vec<DeploymentId>,
}

impl SavedDeployment {
    pub fn is_active(&self) -> bool {
        self.superseded_by.is_none()
    }
}

struct RawDeployment {
    id: DeploymentId,
    entity_json: String,
    origin_server: String,
    local_timestamp: i64,
    deleter: Option<DeploymentId>,
}

impl RawDeployment {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            entity_json: row.get(1)?,
            origin_server: row.get(2)?,
            local_timestamp: row.get(3)?,
            deleter: row.get(4)?,
        })
    }

    fn into_deployment(self) -> Result<Deployment> {
        Ok(Deployment {
            id: self.id,
            entity: serde_json::from_str(&self.entity_json)?,
            origin_server: self.origin_server,
            local_timestamp: self.local_timestamp.max(0) as Timestamp,
            deletion: DeletionState::from_deleter(self.deleter),
        })
    }
}

fn collect_deployments(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Deployment>> {
    let mut stmt = conn.prepare(sql)?;
    let raws = stmt
        .query_map(params, RawDeployment::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    raws.into_iter().map(RawDeployment::into_deployment).collect()
}

/// Every stored deployment of `entity_type` sharing a pointer with `pointers`
fn overlapping_candidates(
    conn: &Connection,
    entity_type: EntityType,
    pointers: &[String],
) -> Result<Vec<PointerCandidate>> {
    let mut stmt = conn.prepare(
        "SELECT d.id, d.entity_timestamp, d.entity_id, d.deleter_deployment IS NULL
         FROM deployment_pointers p
         JOIN deployments d ON d.id = p.deployment_id
         WHERE p.entity_type = ?1 AND p.pointer = ?2",
    )?;

    let mut by_id = BTreeMap::new();
    for pointer in pointers {
        let rows = stmt.query_map(params![entity_type.as_str(), pointer], |row| {
            let timestamp: i64 = row.get(1)?;
            Ok(PointerCandidate {
                deployment_id: row.get(0)?,
                key: EntityOrderKey::new(timestamp.max(0) as Timestamp, row.get::<_, String>(2)?),
                active: row.get(3)?,
            })
        })?;
        for candidate in rows {
            let candidate = candidate?;
            by_id.insert(candidate.deployment_id, candidate);
        }
    }
    Ok(by_id.into_values().collect())
}

/// Record `entity` and resolve its pointers atomically.
///
/// `now` is the node clock reading; the stored local timestamp is strictly
/// greater than every previously assigned one.
pub fn save_deployment(
    conn: &mut Connection,
    entity: &Entity,
    origin_server: &str,
    now: Timestamp,
) -> Result<SaveOutcome> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let exists: bool = tx.query_row(
        "SELECT EXISTS(SELECT 1 FROM deployments WHERE entity_id = ?1)",
        params![entity.id],
        |row| row.get(0),
    )?;
    if exists {
        return Ok(SaveOutcome::AlreadyPresent);
    }

    let pointers = entity.normalized_pointers();
    let overlapping = overlapping_candidates(&tx, entity.entity_type, &pointers)?;
    let resolution = resolve(&EntityOrderKey::of(entity), &overlapping);

    let last: i64 = tx.query_row(
        "SELECT COALESCE(MAX(local_timestamp), 0) FROM deployments",
        [],
        |row| row.get(0),
    )?;
    let local_timestamp = sql_ts(now).max(last + 1);

    tx.execute(
        "INSERT INTO deployments
            (entity_id, entity_type, entity_timestamp, entity_json, origin_server, local_timestamp, deleter_deployment)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            entity.id,
            entity.entity_type.as_str(),
            sql_ts(entity.timestamp),
            serde_json::to_string(entity)?,
            origin_server,
            local_timestamp,
            resolution.superseded_by,
        ],
    )?;
    let deployment_id = tx.last_insert_rowid();

    for pointer in &pointers {
        tx.execute(
            "INSERT INTO deployment_pointers (deployment_id, entity_type, pointer) VALUES (?1, ?2, ?3)",
            params![deployment_id, entity.entity_type.as_str(), pointer],
        )?;
    }
    for content in &entity.content {
        tx.execute(
            "INSERT OR IGNORE INTO content_files (deployment_id, file_name, content_hash) VALUES (?1, ?2, ?3)",
            params![deployment_id, content.file, content.hash],
        )?;
    }
    for loser in &resolution.tombstone {
        tx.execute(
            "UPDATE deployments SET deleter_deployment = ?1 WHERE id = ?2 AND deleter_deployment IS NULL",
            params![deployment_id, loser],
        )?;
    }

    tx.commit()?;

    debug!(
        entity_id = %entity.id,
        deployment_id,
        local_timestamp,
        active = resolution.candidate_is_active(),
        tombstoned = resolution.tombstone.len(),
        "Saved deployment"
    );

    Ok(SaveOutcome::Saved(SavedDeployment {
        deployment_id,
        local_timestamp: local_timestamp as Timestamp,
        superseded_by: resolution.superseded_by,
        tombstoned: resolution.tombstone,
    }))
}

pub fn deployment_exists(conn: &Connection, entity_id: &str) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM deployments WHERE entity_id = ?1)",
        params![entity_id],
        |row| row.get(0),
    )?)
}

pub fn get_deployment(conn: &Connection, entity_id: &str) -> Result<Option<Deployment>> {
    let raw = conn
        .query_row(
            &format!("{} WHERE d.entity_id = ?1", SELECT_DEPLOYMENT),
            params![entity_id],
            RawDeployment::from_row,
        )
        .optional()?;
    raw.map(RawDeployment::into_deployment).transpose()
}

/// Whether a stored deployment would win over `entity` on some pointer
pub fn is_superseded(conn: &Connection, entity: &Entity) -> Result<bool> {
    let overlapping = overlapping_candidates(conn, entity.entity_type, &entity.normalized_pointers())?;
    Ok(resolve(&EntityOrderKey::of(entity), &overlapping)
        .superseded_by
        .is_some())
}

/// Active deployments of `entity_type` on any of `pointers`
pub fn active_by_pointers(
    conn: &Connection,
    entity_type: EntityType,
    pointers: &[String],
) -> Result<Vec<Deployment>> {
    let mut found = BTreeMap::new();
    for pointer in pointers {
        let rows = collect_deployments(
            conn,
            &format!(
                "{} JOIN deployment_pointers p ON p.deployment_id = d.id
                 WHERE p.entity_type = ?1 AND p.pointer = ?2 AND d.deleter_deployment IS NULL",
                SELECT_DEPLOYMENT
            ),
            params![entity_type.as_str(), pointer.to_lowercase()],
        )?;
        for deployment in rows {
            found.insert(deployment.id, deployment);
        }
    }
    Ok(found.into_values().collect())
}

/// Full history for one pointer, oldest first
pub fn history_by_pointer(
    conn: &Connection,
    entity_type: EntityType,
    pointer: &str,
) -> Result<Vec<Deployment>> {
    collect_deployments(
        conn,
        &format!(
            "{} JOIN deployment_pointers p ON p.deployment_id = d.id
             WHERE p.entity_type = ?1 AND p.pointer = ?2 ORDER BY d.id",
            SELECT_DEPLOYMENT
        ),
        params![entity_type.as_str(), pointer.to_lowercase()],
    )
}

/// One page of active deployments in `range`, in `(entity_timestamp, entity_id)` order,
/// starting strictly after `after`.
///
/// This ordering is what makes snapshot manifests reproducible. Do not change it.
pub fn active_in_range_page(
    conn: &Connection,
    range: &TimeRange,
    after: Option<&(Timestamp, EntityId)>,
    limit: usize,
) -> Result<Vec<Deployment>> {
    let (after_ts, after_id) = match after {
        Some((ts, id)) => (sql_ts(*ts), id.as_str()),
        None => (-1, ""),
    };
    collect_deployments(
        conn,
        &format!(
            "{} WHERE d.deleter_deployment IS NULL
               AND d.entity_timestamp >= ?1 AND d.entity_timestamp < ?2
               AND (d.entity_timestamp > ?3 OR (d.entity_timestamp = ?3 AND d.entity_id > ?4))
             ORDER BY d.entity_timestamp, d.entity_id
             LIMIT ?5",
            SELECT_DEPLOYMENT
        ),
        params![
            sql_ts(range.init_timestamp),
            sql_ts(range.end_timestamp),
            after_ts,
            after_id,
            limit as i64
        ],
    )
}

pub fn count_active_in_range(conn: &Connection, range: &TimeRange) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM deployments
         WHERE deleter_deployment IS NULL AND entity_timestamp >= ?1 AND entity_timestamp < ?2",
        params![sql_ts(range.init_timestamp), sql_ts(range.end_timestamp)],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Whether an active deployment with entity timestamp in `range` arrived after `generation`
pub fn has_active_arrivals_after(conn: &Connection, range: &TimeRange, generation: Timestamp) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(
            SELECT 1 FROM deployments
            WHERE deleter_deployment IS NULL
              AND entity_timestamp >= ?1 AND entity_timestamp < ?2
              AND local_timestamp > ?3)",
        params![
            sql_ts(range.init_timestamp),
            sql_ts(range.end_timestamp),
            sql_ts(generation)
        ],
        |row| row.get(0),
    )?)
}

/// Greatest local timestamp assigned so far (0 when empty)
pub fn last_local_timestamp(conn: &Connection) -> Result<Timestamp> {
    let last: i64 = conn.query_row(
        "SELECT COALESCE(MAX(local_timestamp), 0) FROM deployments",
        [],
        |row| row.get(0),
    )?;
    Ok(last.max(0) as Timestamp)
}

/// Content hashes and entity ids referenced by active deployments, read in one statement
pub fn referenced_hashes(conn: &Connection) -> Result<HashSet<String>> {
    let mut stmt = conn.prepare(
        "SELECT c.content_hash FROM content_files c
         JOIN deployments d ON d.id = c.deployment_id
         WHERE d.deleter_deployment IS NULL
         UNION
         SELECT entity_id FROM deployments WHERE deleter_deployment IS NULL",
    )?;
    let hashes = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<HashSet<_>>>()?;
    Ok(hashes)
}

/// Visit every entity id in history
pub fn for_each_entity_id<F>(conn: &Connection, mut f: F) -> Result<u64>
where
    F: FnMut(&str),
{
    let mut stmt = conn.prepare("SELECT entity_id FROM deployments")?;
    let mut rows = stmt.query([])?;
    let mut count = 0;
    while let Some(row) = rows.next()? {
        let id: String = row.get(0)?;
        f(&id);
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ContentDb;
    use crate::types::ContentMapping;

    fn entity(id: &str, ts: Timestamp, pointers: &[&str]) -> Entity {
        Entity {
            id: id.to_string(),
            entity_type: EntityType::Scene,
            pointers: pointers.iter().map(|p| p.to_string()).collect(),
            timestamp: ts,
            content: vec![ContentMapping {
                file: "scene.json".into(),
                hash: format!("content-{}", id),
            }],
            metadata: None,
            auth_chain: vec![],
        }
    }

    fn save(db: &ContentDb, e: &Entity, now: Timestamp) -> SaveOutcome {
        db.with_conn_mut(|conn| save_deployment(conn, e, "peer-a", now)).unwrap()
    }

    #[test]
    fn test_newer_deployment_tombstones_older() {
        let db = ContentDb::open_in_memory().unwrap();
        save(&db, &entity("e1", 10, &["0,0"]), 1000);
        save(&db, &entity("e2", 20, &["0,0"]), 1001);

        db.with_conn(|conn| {
            let active = active_by_pointers(conn, EntityType::Scene, &["0,0".to_string()])?;
            assert_eq!(active.len(), 1);
            assert_eq!(active[0].entity.id, "e2");

            let history = history_by_pointer(conn, EntityType::Scene, "0,0")?;
            assert_eq!(history.len(), 2);
            assert_eq!(history[0].deletion, DeletionState::SupersededBy(history[1].id));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_older_arrival_is_recorded_but_inactive() {
        let db = ContentDb::open_in_memory().unwrap();
        save(&db, &entity("e2", 20, &["0,0"]), 1000);
        let outcome = save(&db, &entity("e1", 10, &["0,0"]), 1001);

        match outcome {
            SaveOutcome::Saved(saved) => assert!(!saved.is_active()),
            other => panic!("unexpected outcome {:?}", other),
        }
        let e1 = db.with_conn(|conn| get_deployment(conn, "e1")).unwrap().unwrap();
        assert!(!e1.is_active());
    }

    #[test]
    fn test_replay_is_noop() {
        let db = ContentDb::open_in_memory().unwrap();
        let e = entity("e1", 10, &["0,0"]);
        save(&db, &e, 1000);
        assert_eq!(save(&db, &e, 2000), SaveOutcome::AlreadyPresent);
        let d = db.with_conn(|conn| get_deployment(conn, "e1")).unwrap().unwrap();
        assert_eq!(d.local_timestamp, 1000);
    }

    #[test]
    fn test_local_timestamps_strictly_increase_under_clock_regression() {
        let db = ContentDb::open_in_memory().unwrap();
        save(&db, &entity("e1", 10, &["a"]), 5000);
        save(&db, &entity("e2", 10, &["b"]), 4000);
        save(&db, &entity("e3", 10, &["c"]), 4000);

        db.with_conn(|conn| {
            let e2 = get_deployment(conn, "e2")?.unwrap();
            let e3 = get_deployment(conn, "e3")?.unwrap();
            assert_eq!(e2.local_timestamp, 5001);
            assert_eq!(e3.local_timestamp, 5002);
            assert_eq!(last_local_timestamp(conn)?, 5002);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_range_paging_is_ordered() {
        let db = ContentDb::open_in_memory().unwrap();
        save(&db, &entity("b", 5, &["1"]), 1);
        save(&db, &entity("a", 5, &["2"]), 2);
        save(&db, &entity("c", 1, &["3"]), 3);
        save(&db, &entity("d", 50, &["4"]), 4);

        let range = TimeRange::new(0, 50);
        db.with_conn(|conn| {
            let first = active_in_range_page(conn, &range, None, 2)?;
            let ids: Vec<_> = first.iter().map(|d| d.entity.id.as_str()).collect();
            assert_eq!(ids, vec!["c", "a"]);

            let cursor = (first[1].entity.timestamp, first[1].entity.id.clone());
            let second = active_in_range_page(conn, &range, Some(&cursor), 2)?;
            let ids: Vec<_> = second.iter().map(|d| d.entity.id.as_str()).collect();
            assert_eq!(ids, vec!["b"]);

            assert_eq!(count_active_in_range(conn, &range)?, 3);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_referenced_hashes_only_cover_active() {
        let db = ContentDb::open_in_memory().unwrap();
        save(&db, &entity("e1", 10, &["0,0"]), 1);
        save(&db, &entity("e2", 20, &["0,0"]), 2);

        let referenced = db.with_conn(referenced_hashes).unwrap();
        assert!(referenced.contains("content-e2"));
        assert!(referenced.contains("e2"));
        assert!(!referenced.contains("content-e1"));
        assert!(!referenced.contains("e1"));
    }

    #[test]
    fn test_is_superseded() {
        let db = ContentDb::open_in_memory().unwrap();
        save(&db, &entity("e2", 20, &["0,0"]), 1);
        db.with_conn(|conn| {
            assert!(is_superseded(conn, &entity("e1", 10, &["0,0"]))?);
            assert!(!is_superseded(conn, &entity("e3", 30, &["0,0"]))?);
            assert!(!is_superseded(conn, &entity("e4", 5, &["9,9"]))?);
            Ok(())
        })
        .unwrap();
    }
}
