//! Snapshot manager
//!
//! History is cut into top-level ranges of fixed width starting at genesis.
//! Each top-level range is a tree: a range holding more active entities than
//! the split threshold is halved, down to a minimum width. A range that is
//! already split only merges back once it drops below the merge threshold.
//!
//! Every leaf gets a manifest: a header line followed by one JSON line per
//! active deployment in the range, in `(entity_timestamp, entity_id)` order.
//! The manifest is stored as a blob under its hash.
//!
//! A snapshot is outdated when an active deployment in its range arrived after
//! it was generated, or when the number of active entities in its range no
//! longer matches. Outdated snapshots are regenerated; the old ones are deleted
//! only after every replacement covering them was written.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::blob_store::{BlobStore, ContentStorage};
use crate::clock::Clock;
use crate::db::{deployments, snapshots, ContentDb};
use crate::error::{CatalystError, Result};
use crate::time_range::TimeRange;
use crate::types::{Deployment, SnapshotEntry, SnapshotMetadata, Timestamp};

pub const MANIFEST_HEADER: &str = "### Decentraland json snapshot";

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotSettings {
    /// Start of the snapshot timeline
    pub genesis_timestamp: Timestamp,
    /// Width of top-level ranges
    pub range_ms: u64,
    /// Leaves are never narrower than this
    pub min_range_ms: u64,
    pub split_threshold: u64,
    pub merge_threshold: u64,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            genesis_timestamp: 1_577_836_800_000,
            range_ms: 28 * 24 * 60 * 60 * 1000,
            min_range_ms: 24 * 60 * 60 * 1000,
            split_threshold: 10_000,
            merge_threshold: 2_500,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotCycleReport {
    pub generated: Vec<SnapshotMetadata>,
    /// Leaves whose existing snapshot was still current
    pub unchanged: usize,
    pub deleted: Vec<String>,
    pub failed: usize,
}

fn entry_of(deployment: Deployment) -> SnapshotEntry {
    let entity = deployment.entity;
    SnapshotEntry {
        entity_id: entity.id,
        entity_type: entity.entity_type,
        pointers: entity.pointers,
        auth_chain: entity.auth_chain,
        entity_timestamp: entity.timestamp,
    }
}

pub fn render_manifest_line(entry: &SnapshotEntry, out: &mut Vec<u8>) -> Result<()> {
    serde_json::to_writer(&mut *out, entry)?;
    out.push(b'\n');
    Ok(())
}

pub fn render_manifest(entries: &[SnapshotEntry]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.extend_from_slice(MANIFEST_HEADER.as_bytes());
    out.push(b'\n');
    for entry in entries {
        render_manifest_line(entry, &mut out)?;
    }
    Ok(out)
}

pub fn parse_manifest(data: &[u8]) -> Result<Vec<SnapshotEntry>> {
    let text = std::str::from_utf8(data)
        .map_err(|e| CatalystError::Snapshot(format!("Manifest is not UTF-8: {}", e)))?;
    let mut lines = text.lines();
    match lines.next() {
        Some(header) if header.trim() == MANIFEST_HEADER => {}
        _ => return Err(CatalystError::Snapshot("Missing manifest header".into())),
    }
    lines
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str::<SnapshotEntry>(line)
                .map_err(|e| CatalystError::Snapshot(format!("Bad manifest line: {}", e)))
        })
        .collect()
}

/// Removes a range from the in-progress set when dropped
struct GenerationGuard<'a> {
    in_progress: &'a Mutex<HashSet<TimeRange>>,
    range: TimeRange,
}

impl Drop for GenerationGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.in_progress.lock() {
            set.remove(&self.range);
        }
    }
}

pub struct SnapshotManager {
    db: Arc<ContentDb>,
    storage: Arc<dyn ContentStorage>,
    clock: Arc<dyn Clock>,
    settings: SnapshotSettings,
    in_progress: Mutex<HashSet<TimeRange>>,
}

impl SnapshotManager {
    pub fn new(
        db: Arc<ContentDb>,
        storage: Arc<dyn ContentStorage>,
        clock: Arc<dyn Clock>,
        settings: SnapshotSettings,
    ) -> Self {
        Self {
            db,
            storage,
            clock,
            settings,
            in_progress: Mutex::new(HashSet::new()),
        }
    }

    pub fn settings(&self) -> &SnapshotSettings {
        &self.settings
    }

    fn begin(&self, range: TimeRange) -> Result<GenerationGuard<'_>> {
        let mut set = self
            .in_progress
            .lock()
            .map_err(|e| CatalystError::Internal(format!("Lock poisoned: {}", e)))?;
        if !set.insert(range) {
            return Err(CatalystError::Snapshot(format!(
                "Generation already in progress for {}",
                range
            )));
        }
        Ok(GenerationGuard {
            in_progress: &self.in_progress,
            range,
        })
    }

    /// Completed top-level ranges up to now. Everything before genesis is one
    /// leading range, so backdated entities are covered too.
    pub fn timeline(&self) -> Vec<TimeRange> {
        let now = self.clock.now();
        let width = self.settings.range_ms.max(1);
        let mut ranges = Vec::new();
        let mut init = self.settings.genesis_timestamp;
        if init > 0 && init <= now {
            ranges.push(TimeRange::new(0, init));
        }
        while let Some(end) = init.checked_add(width) {
            if end > now {
                break;
            }
            ranges.push(TimeRange::new(init, end));
            init = end;
        }
        ranges
    }

    /// Decide the leaves of `top`, given the snapshots currently inside it.
    /// Each leaf comes with its number of active entities.
    pub fn plan_leaves(&self, top: TimeRange, existing: &[SnapshotMetadata]) -> Result<Vec<(TimeRange, u64)>> {
        let mut leaves = Vec::new();
        let mut pending = vec![top];

        while let Some(range) = pending.pop() {
            let count = self
                .db
                .with_conn(|conn| deployments::count_active_in_range(conn, &range))?;
            let already_split = existing.iter().any(|s| {
                range.contains_range(&s.time_range) && s.time_range != range
            });
            let splittable = range.duration() >= 2 * self.settings.min_range_ms.max(1);
            let split = splittable
                && (count > self.settings.split_threshold
                    || (already_split && count >= self.settings.merge_threshold));

            if split {
                // Reverse so leaves come out in timeline order
                pending.extend(range.split(2).into_iter().rev());
            } else {
                leaves.push((range, count));
            }
        }
        Ok(leaves)
    }

    /// Whether `snapshot` no longer reflects its range
    pub fn is_outdated(&self, snapshot: &SnapshotMetadata) -> Result<bool> {
        self.db.with_conn(|conn| {
            if deployments::has_active_arrivals_after(
                conn,
                &snapshot.time_range,
                snapshot.generation_timestamp,
            )? {
                return Ok(true);
            }
            let count = deployments::count_active_in_range(conn, &snapshot.time_range)?;
            Ok(count != snapshot.number_of_entities)
        })
    }

    /// Compute and persist the manifest for `range`, recording `replacing` as
    /// replaced. Does not delete anything.
    async fn write_snapshot(&self, range: TimeRange, replacing: &[String]) -> Result<SnapshotMetadata> {
        let _guard = self.begin(range)?;

        // Read before the manifest query: anything arriving later is newer than this
        let generation_timestamp = self.db.with_conn(deployments::last_local_timestamp)?;

        let mut body = Vec::new();
        body.extend_from_slice(MANIFEST_HEADER.as_bytes());
        body.push(b'\n');
        let mut number_of_entities = 0u64;

        let mut rows = self.db.stream_active_in_range(range);
        while let Some(deployment) = rows.next().await {
            render_manifest_line(&entry_of(deployment?), &mut body)?;
            number_of_entities += 1;
        }

        let hash = BlobStore::compute_hash(&body);
        self.storage.store(&hash, &body).await?;

        let metadata = SnapshotMetadata {
            hash: hash.clone(),
            time_range: range,
            replaced_snapshot_hashes: replacing.iter().filter(|h| **h != hash).cloned().collect(),
            number_of_entities,
            generation_timestamp,
        };
        self.db.with_conn(|conn| snapshots::save_snapshot(conn, &metadata))?;

        debug!(
            hash = %metadata.hash,
            range = %range,
            entities = number_of_entities,
            replaced = metadata.replaced_snapshot_hashes.len(),
            "Wrote snapshot"
        );
        Ok(metadata)
    }

    /// Generate a snapshot for exactly `range`, replacing every stored snapshot
    /// that intersects it.
    pub async fn generate_snapshot(&self, range: TimeRange) -> Result<SnapshotMetadata> {
        let existing = self
            .db
            .with_conn(|conn| snapshots::snapshots_intersecting(conn, &range))?;
        let replacing: Vec<String> = existing.into_iter().map(|s| s.hash).collect();

        let metadata = self.write_snapshot(range, &replacing).await?;
        if !metadata.replaced_snapshot_hashes.is_empty() {
            self.db
                .with_conn(|conn| snapshots::delete_snapshots(conn, &metadata.replaced_snapshot_hashes))?;
        }
        Ok(metadata)
    }

    /// Bring every completed range of the timeline up to date
    pub async fn run_cycle(&self) -> Result<SnapshotCycleReport> {
        let mut report = SnapshotCycleReport::default();

        for top in self.timeline() {
            let existing = self
                .db
                .with_conn(|conn| snapshots::snapshots_intersecting(conn, &top))?;
            let leaves = self.plan_leaves(top, &existing)?;

            let mut kept: HashSet<String> = HashSet::new();
            let mut failed_leaves: Vec<TimeRange> = Vec::new();

            for (leaf, count) in &leaves {
                // Identical empty manifests would collide on their hash
                if *count == 0 {
                    continue;
                }
                if let Some(current) = existing.iter().find(|s| s.time_range == *leaf) {
                    match self.is_outdated(current) {
                        Ok(false) => {
                            kept.insert(current.hash.clone());
                            report.unchanged += 1;
                            continue;
                        }
                        Ok(true) => {
                            info!(hash = %current.hash, range = %leaf, "Snapshot is outdated");
                        }
                        Err(e) => {
                            error!(range = %leaf, error = %e, "Failed to check snapshot");
                            failed_leaves.push(*leaf);
                            continue;
                        }
                    }
                }

                let replacing: Vec<String> = existing
                    .iter()
                    .filter(|s| s.time_range.intersects(leaf))
                    .map(|s| s.hash.clone())
                    .collect();

                match self.write_snapshot(*leaf, &replacing).await {
                    Ok(metadata) => {
                        kept.insert(metadata.hash.clone());
                        report.generated.push(metadata);
                    }
                    Err(e) => {
                        error!(range = %leaf, error = %e, "Failed to generate snapshot");
                        failed_leaves.push(*leaf);
                    }
                }
            }

            report.failed += failed_leaves.len();

            // Delete only what every covering replacement was written for
            let obsolete: Vec<String> = existing
                .iter()
                .filter(|s| !kept.contains(&s.hash))
                .filter(|s| !failed_leaves.iter().any(|leaf| leaf.intersects(&s.time_range)))
                .map(|s| s.hash.clone())
                .collect();
            if !obsolete.is_empty() {
                self.db
                    .with_conn(|conn| snapshots::delete_snapshots(conn, &obsolete))?;
                report.deleted.extend(obsolete);
            }
        }

        if !report.generated.is_empty() || !report.deleted.is_empty() {
            info!(
                generated = report.generated.len(),
                unchanged = report.unchanged,
                deleted = report.deleted.len(),
                failed = report.failed,
                "Snapshot cycle complete"
            );
        }
        Ok(report)
    }

    pub fn get_snapshot(&self, hash: &str) -> Result<Option<SnapshotMetadata>> {
        self.db.with_conn(|conn| snapshots::get_snapshot(conn, hash))
    }

    pub fn all_snapshots(&self) -> Result<Vec<SnapshotMetadata>> {
        self.db.with_conn(snapshots::all_snapshots)
    }

    pub fn snapshots_contained_in(&self, range: &TimeRange) -> Result<Vec<SnapshotMetadata>> {
        self.db.with_conn(|conn| snapshots::snapshots_contained_in(conn, range))
    }

    /// Manifest bytes of a stored snapshot
    pub async fn manifest(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        self.storage.get(hash).await
    }
}
