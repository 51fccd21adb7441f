//! Garbage collection of unreferenced blobs
//!
//! A blob is kept when an active deployment references it (as a content file
//! or as its entity file), when it is the manifest of a current snapshot, or
//! when it was written or reused within the grace period. Everything else is
//! deleted.
//!
//! The reference set is read before the blobs are listed. A deployment that
//! reuses an unreferenced blob after that read refreshes the blob's
//! `stored_at`, and deletion re-checks it against the cutoff, so the sweep
//! never removes content a newer deployment relies on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::blob_store::ContentStorage;
use crate::clock::Clock;
use crate::db::{deployments, snapshots, ContentDb};
use crate::error::{CatalystError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub examined: usize,
    pub referenced: usize,
    /// Unreferenced, but written or reused inside the grace period
    pub recent: usize,
    pub deleted: Vec<String>,
}

pub struct GarbageCollector {
    db: Arc<ContentDb>,
    storage: Arc<dyn ContentStorage>,
    clock: Arc<dyn Clock>,
    grace_period: Duration,
    running: AtomicBool,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl GarbageCollector {
    pub fn new(
        db: Arc<ContentDb>,
        storage: Arc<dyn ContentStorage>,
        clock: Arc<dyn Clock>,
        grace_period: Duration,
    ) -> Self {
        Self {
            db,
            storage,
            clock,
            grace_period,
            running: AtomicBool::new(false),
        }
    }

    /// One sweep. Refuses to start while another sweep is running.
    pub async fn collect(&self) -> Result<GcReport> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(CatalystError::Internal("Garbage collection already running".into()));
        }
        let _running = RunningGuard(&self.running);

        // One consistent read of what is live
        let referenced = self.db.with_conn(|conn| {
            let mut hashes = deployments::referenced_hashes(conn)?;
            hashes.extend(snapshots::current_snapshot_hashes(conn)?);
            Ok(hashes)
        })?;

        let now = self.clock.now();
        let cutoff = now.saturating_sub(self.grace_period.as_millis() as u64);
        let mut report = GcReport::default();

        for blob in self.storage.list().await? {
            report.examined += 1;
            if referenced.contains(&blob.hash) {
                report.referenced += 1;
                continue;
            }
            if blob.stored_at > cutoff {
                report.recent += 1;
                continue;
            }
            match self.storage.delete_unless_newer(&blob.hash, cutoff).await {
                Ok(true) => {
                    debug!(hash = %blob.hash, "Collected blob");
                    report.deleted.push(blob.hash);
                }
                Ok(false) => report.recent += 1,
                Err(e) => warn!(hash = %blob.hash, error = %e, "Failed to delete blob"),
            }
        }

        info!(
            examined = report.examined,
            referenced = report.referenced,
            recent = report.recent,
            deleted = report.deleted.len(),
            "Garbage collection complete"
        );
        Ok(report)
    }
}
