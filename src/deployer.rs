//! Deployment ingestion
//!
//! One path for every way an entity enters the node: pulled from a peer,
//! retried after a failure, restored from a snapshot or deployed locally.
//! Each deployment holds the lanes of its `(type, pointer)` pairs for the whole
//! check-fetch-commit sequence, so conflicting deployments apply one at a time.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use crate::blob_store::{BlobStore, ContentStorage};
use crate::bloom::BloomFilter;
use crate::client::download_with_retries;
use crate::clock::Clock;
use crate::db::deployments::{self, SaveOutcome, SavedDeployment};
use crate::db::ContentDb;
use crate::error::{CatalystError, Result};
use crate::job_queue::PointerLocks;
use crate::transport::ContentDownloader;
use crate::types::{Entity, RemoteDeployment, LOCAL_ORIGIN};
use crate::validator::EntityValidator;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployOutcome {
    Deployed(SavedDeployment),
    /// The entity was already in history
    AlreadyDeployed,
}

impl DeployOutcome {
    pub fn is_new(&self) -> bool {
        matches!(self, DeployOutcome::Deployed(_))
    }
}

pub struct Deployer {
    db: Arc<ContentDb>,
    storage: Arc<dyn ContentStorage>,
    downloader: Arc<dyn ContentDownloader>,
    validator: Arc<dyn EntityValidator>,
    clock: Arc<dyn Clock>,
    locks: PointerLocks,
    seen: RwLock<BloomFilter>,
}

const DEFAULT_SEEN_CAPACITY: usize = 100_000;
const DEFAULT_SEEN_FALSE_POSITIVE_RATE: f64 = 0.001;

/// Lane key for one pointer of an entity
fn lane_keys(entity: &Entity) -> Vec<String> {
    entity
        .normalized_pointers()
        .into_iter()
        .map(|pointer| format!("{}:{}", entity.entity_type, pointer))
        .collect()
}

impl Deployer {
    pub fn new(
        db: Arc<ContentDb>,
        storage: Arc<dyn ContentStorage>,
        downloader: Arc<dyn ContentDownloader>,
        validator: Arc<dyn EntityValidator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            storage,
            downloader,
            validator,
            clock,
            locks: PointerLocks::new(),
            seen: RwLock::new(BloomFilter::new(
                DEFAULT_SEEN_CAPACITY,
                DEFAULT_SEEN_FALSE_POSITIVE_RATE,
            )),
        }
    }

    /// Size the seen-set for the expected number of entities
    pub fn with_seen_capacity(self, expected_items: usize, false_positive_rate: f64) -> Self {
        Self {
            seen: RwLock::new(BloomFilter::new(expected_items, false_positive_rate)),
            ..self
        }
    }

    /// Whether the entity is already in history.
    ///
    /// A filter miss answers without touching the database; a hit is confirmed
    /// against it.
    pub fn was_seen(&self, entity_id: &str) -> Result<bool> {
        let maybe = self
            .seen
            .read()
            .map(|filter| filter.check(entity_id))
            .map_err(|e| CatalystError::Internal(format!("Lock poisoned: {}", e)))?;
        if !maybe {
            return Ok(false);
        }
        self.db.with_conn(|conn| deployments::deployment_exists(conn, entity_id))
    }

    fn mark_seen(&self, entity_id: &str) {
        if let Ok(mut filter) = self.seen.write() {
            filter.add(entity_id);
        }
    }

    /// Refill the seen-set from history
    pub fn rebuild_seen_set(&self) -> Result<u64> {
        let mut filter = self
            .seen
            .write()
            .map_err(|e| CatalystError::Internal(format!("Lock poisoned: {}", e)))?;
        filter.clear();
        let count = self
            .db
            .with_conn(|conn| deployments::for_each_entity_id(conn, |id| filter.add(id)))?;
        debug!(entities = count, "Rebuilt seen-set from history");
        Ok(count)
    }

    pub fn db(&self) -> &Arc<ContentDb> {
        &self.db
    }

    pub fn storage(&self) -> &Arc<dyn ContentStorage> {
        &self.storage
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Ingest a deployment reported by `origin`, fetching missing content from it
    pub async fn deploy_remote(&self, deployment: &RemoteDeployment, origin: &str) -> Result<DeployOutcome> {
        let entity = &deployment.entity;
        self.validator.validate(deployment).await?;

        let _lanes = self.locks.lock(lane_keys(entity)).await;

        if self.db.with_conn(|conn| deployments::deployment_exists(conn, &entity.id))? {
            debug!(entity_id = %entity.id, "Entity already deployed");
            self.mark_seen(&entity.id);
            return Ok(DeployOutcome::AlreadyDeployed);
        }

        let superseded = self.db.with_conn(|conn| deployments::is_superseded(conn, entity))?;
        if superseded {
            debug!(entity_id = %entity.id, "Entity superseded on arrival, skipping content download");
        } else {
            for hash in entity.content_hashes() {
                // Reuse refreshes the blob so a running sweep keeps it
                if self.storage.touch(hash).await? {
                    continue;
                }
                let data = download_with_retries(self.downloader.as_ref(), origin, hash).await?;
                BlobStore::verify(hash, &data)?;
                self.storage.store(hash, &data).await?;
            }
        }

        self.commit(entity, origin).await
    }

    /// Ingest a deployment authored on this node. `files` maps content hash to bytes.
    pub async fn deploy_local(&self, entity: Entity, files: HashMap<String, Vec<u8>>) -> Result<DeployOutcome> {
        let deployment = RemoteDeployment {
            entity,
            local_timestamp: 0,
        };
        self.validator.validate(&deployment).await?;
        let entity = &deployment.entity;

        let _lanes = self.locks.lock(lane_keys(entity)).await;

        if self.db.with_conn(|conn| deployments::deployment_exists(conn, &entity.id))? {
            return Ok(DeployOutcome::AlreadyDeployed);
        }

        let mut missing = Vec::new();
        for hash in entity.content_hashes() {
            match files.get(hash) {
                Some(data) => {
                    BlobStore::verify(hash, data)?;
                    self.storage.store(hash, data).await?;
                }
                None => {
                    if !self.storage.touch(hash).await? {
                        missing.push(format!("content {} was not uploaded", hash));
                    }
                }
            }
        }
        if !missing.is_empty() {
            return Err(CatalystError::Validation(missing));
        }

        let outcome = self.commit(entity, LOCAL_ORIGIN).await?;
        info!(entity_id = %entity.id, entity_type = %entity.entity_type, "Local deployment accepted");
        Ok(outcome)
    }

    /// Store the entity file, then record the deployment
    async fn commit(&self, entity: &Entity, origin: &str) -> Result<DeployOutcome> {
        self.storage.store(&entity.id, &entity.to_bytes()?).await?;

        let now = self.clock.now();
        let outcome = self
            .db
            .with_conn_mut(|conn| deployments::save_deployment(conn, entity, origin, now))?;

        self.mark_seen(&entity.id);

        Ok(match outcome {
            SaveOutcome::AlreadyPresent => DeployOutcome::AlreadyDeployed,
            SaveOutcome::Saved(saved) => {
                debug!(
                    entity_id = %entity.id,
                    origin = %origin,
                    active = saved.is_active(),
                    tombstoned = saved.tombstoned.len(),
                    "Deployment committed"
                );
                DeployOutcome::Deployed(saved)
            }
        })
    }
}
