//! SQLite store for deployment history and snapshot bookkeeping
//!
//! ## Tables
//!
//! - `deployments` - append-only history, tombstoned via `deleter_deployment`
//! - `deployment_pointers` - `(type, pointer)` index over deployments
//! - `content_files` - content hashes referenced by each deployment
//! - `snapshots` / `processed_snapshots` - snapshot metadata and bootstrap bookkeeping
//! - `failed_deployments` - retry queue
//! - `peer_sync_state` - per-peer high-water marks
//!
//! Query functions live in the sub-modules and take a `&Connection`; callers go
//! through [`ContentDb::with_conn`] / [`ContentDb::with_conn_mut`].

pub mod deployments;
pub mod failed;
pub mod schema;
pub mod snapshots;
pub mod sync_state;

use std::path::Path;
use std::sync::{Arc, Mutex};

use futures::stream::{self, BoxStream, StreamExt};
use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{CatalystError, Result};
use crate::time_range::TimeRange;
use crate::types::{Deployment, EntityId, Timestamp};

/// Rows fetched per round trip by streaming cursors
pub const STREAM_BATCH_SIZE: usize = 1000;

/// Convert a timestamp to its SQLite representation, saturating at `i64::MAX`
pub(crate) fn sql_ts(ts: Timestamp) -> i64 {
    ts.min(i64::MAX as u64) as i64
}

pub struct ContentDb {
    conn: Mutex<Connection>,
}

impl ContentDb {
    /// Open or create the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        info!("Opening SQLite database at {:?}", path);

        let conn = Connection::open(path)
            .map_err(|e| CatalystError::Database(format!("Failed to open SQLite: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| CatalystError::Database(format!("Failed to set PRAGMA: {}", e)))?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.with_conn(schema::init_schema)?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        debug!("Opening in-memory SQLite database");

        let conn = Connection::open_in_memory()
            .map_err(|e| CatalystError::Database(format!("Failed to open in-memory SQLite: {}", e)))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.with_conn(schema::init_schema)?;
        Ok(db)
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| CatalystError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Exclusive access, for transactions
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| CatalystError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&mut conn)
    }

    /// Stream active deployments with `entity_timestamp` in `range`, ordered by
    /// `(entity_timestamp, entity_id)`.
    ///
    /// Pages are fetched lazily with a keyset cursor so the connection lock is
    /// only held for one batch at a time.
    pub fn stream_active_in_range(
        self: &Arc<Self>,
        range: TimeRange,
    ) -> BoxStream<'static, Result<Deployment>> {
        let db = Arc::clone(self);
        let pages = stream::unfold(
            Some(None::<(Timestamp, EntityId)>),
            move |cursor| {
                let db = Arc::clone(&db);
                async move {
                    let after = match cursor {
                        Some(after) => after,
                        None => return None,
                    };
                    let page = db.with_conn(|conn| {
                        deployments::active_in_range_page(conn, &range, after.as_ref(), STREAM_BATCH_SIZE)
                    });
                    match page {
                        Ok(rows) => {
                            let next = if rows.len() < STREAM_BATCH_SIZE {
                                None
                            } else {
                                rows.last()
                                    .map(|d| Some((d.entity.timestamp, d.entity.id.clone())))
                            };
                            Some((Ok(rows), next))
                        }
                        Err(e) => Some((Err(e), None)),
                    }
                }
            },
        );

        pages
            .flat_map(|page| match page {
                Ok(rows) => stream::iter(rows.into_iter().map(Ok).collect::<Vec<_>>()),
                Err(e) => stream::iter(vec![Err(e)]),
            })
            .boxed()
    }

    /// Stream every active deployment
    pub fn stream_all_active(self: &Arc<Self>) -> BoxStream<'static, Result<Deployment>> {
        self.stream_active_in_range(TimeRange::new(0, Timestamp::MAX))
    }

    pub fn stats(&self) -> Result<DbStats> {
        self.with_conn(|conn| {
            let deployments: i64 =
                conn.query_row("SELECT COUNT(*) FROM deployments", [], |row| row.get(0))?;
            let active: i64 = conn.query_row(
                "SELECT COUNT(*) FROM deployments WHERE deleter_deployment IS NULL",
                [],
                |row| row.get(0),
            )?;
            let snapshots: i64 =
                conn.query_row("SELECT COUNT(*) FROM snapshots", [], |row| row.get(0))?;
            let failed: i64 =
                conn.query_row("SELECT COUNT(*) FROM failed_deployments", [], |row| row.get(0))?;

            Ok(DbStats {
                deployments: deployments as u64,
                active_deployments: active as u64,
                snapshots: snapshots as u64,
                failed_deployments: failed as u64,
            })
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DbStats {
    pub deployments: u64,
    pub active_deployments: u64,
    pub snapshots: u64,
    pub failed_deployments: u64,
}
