//! Synchronizer
//!
//! Drives one pull per tracked peer, concurrently. Each pulled deployment that
//! is not ignored and not already seen becomes a job on the bounded queue. The
//! peer's mark is committed only once every job of the batch has finished, and
//! never past an item that failed for a reason other than validation.
//!
//! A record the peer serves but that cannot be read is logged as a validation
//! failure and the pull continues past it.
//!
//! A peer whose mark is still 0 is first bootstrapped from its snapshots.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use futures::future::join_all;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::blob_store::BlobStore;
use crate::client::ContentServerClient;
use crate::cluster::ContentCluster;
use crate::db::{snapshots, sync_state, ContentDb};
use crate::deployer::{DeployOutcome, Deployer};
use crate::error::{CatalystError, Result};
use crate::job_queue::JobQueue;
use crate::node::stopped;
use crate::retry::RetryManager;
use crate::snapshots::parse_manifest;
use crate::transport::DeploymentFetcher;
use crate::types::{Entity, EntityType, FailureReason, RemoteDeployment, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SynchronizationState {
    Bootstrapping,
    Syncing,
    Synced,
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub job_queue_concurrency: usize,
    pub ignored_entity_types: HashSet<EntityType>,
    pub bootstrap_from_snapshots: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            job_queue_concurrency: 10,
            ignored_entity_types: HashSet::new(),
            bootstrap_from_snapshots: true,
        }
    }
}

/// Result of one pull from one peer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PeerSyncReport {
    pub address: String,
    pub deployed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub bootstrapped: usize,
    /// Mark after the commit
    pub mark: Timestamp,
    /// The pull ended on a transport error
    pub interrupted: bool,
}

enum JobResult {
    Applied(DeployOutcome),
    /// Recorded as failed; the mark may move past it
    Recorded,
    /// Must be pulled again; the mark stays below it
    Withheld,
}

pub struct Synchronizer {
    cluster: Arc<ContentCluster>,
    deployer: Arc<Deployer>,
    retry: Arc<RetryManager>,
    fetcher: Arc<dyn DeploymentFetcher>,
    db: Arc<ContentDb>,
    queue: JobQueue,
    settings: SyncSettings,
    state: RwLock<SynchronizationState>,
}

impl Synchronizer {
    pub fn new(
        cluster: Arc<ContentCluster>,
        deployer: Arc<Deployer>,
        retry: Arc<RetryManager>,
        fetcher: Arc<dyn DeploymentFetcher>,
        settings: SyncSettings,
    ) -> Self {
        let db = Arc::clone(deployer.db());
        Self {
            cluster,
            deployer,
            retry,
            fetcher,
            db,
            queue: JobQueue::new(settings.job_queue_concurrency),
            settings,
            state: RwLock::new(SynchronizationState::Bootstrapping),
        }
    }

    pub fn state(&self) -> SynchronizationState {
        self.state
            .read()
            .map(|s| *s)
            .unwrap_or(SynchronizationState::Bootstrapping)
    }

    fn set_state(&self, next: SynchronizationState) {
        if let Ok(mut state) = self.state.write() {
            if *state != next {
                debug!(from = ?*state, to = ?next, "Synchronization state changed");
                *state = next;
            }
        }
    }

    /// Pull once from every tracked peer
    pub async fn sync_with_peers(&self, shutdown: &watch::Receiver<bool>) -> Vec<PeerSyncReport> {
        if self.state() != SynchronizationState::Bootstrapping {
            self.set_state(SynchronizationState::Syncing);
        }

        let clients = self.cluster.clients();
        let reports = join_all(
            clients
                .iter()
                .map(|client| self.sync_peer(Arc::clone(client), shutdown.clone())),
        )
        .await;

        let reports: Vec<PeerSyncReport> = reports
            .into_iter()
            .zip(clients.iter())
            .filter_map(|(report, client)| match report {
                Ok(report) => Some(report),
                Err(e) => {
                    error!(peer = %client.address(), error = %e, "Sync with peer failed");
                    None
                }
            })
            .collect();

        let deployed: usize = reports.iter().map(|r| r.deployed).sum();
        if deployed > 0 {
            info!(peers = reports.len(), deployed, "Sync cycle complete");
        }
        self.set_state(SynchronizationState::Synced);
        reports
    }

    /// Pull everything new from one peer and commit its mark
    pub async fn sync_peer(
        &self,
        client: Arc<ContentServerClient>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<PeerSyncReport> {
        let address = client.address().to_string();
        let mut report = PeerSyncReport {
            address: address.clone(),
            ..Default::default()
        };

        if self.settings.bootstrap_from_snapshots && client.last_local_deployment_timestamp() == 0 {
            match self.bootstrap_from_snapshots(&address).await {
                Ok(count) => report.bootstrapped = count,
                Err(e) => warn!(peer = %address, error = %e, "Snapshot bootstrap failed"),
            }
        }

        let mut stream = client.get_new_deployments();
        let mut handles = Vec::new();
        let mut ceiling = Timestamp::MAX;

        loop {
            let item = tokio::select! {
                item = stream.next() => item,
                _ = stopped(&mut shutdown) => {
                    debug!(peer = %address, "Pull cancelled");
                    report.interrupted = true;
                    break;
                }
            };

            let deployment = match item {
                Some(Ok(deployment)) => deployment,
                Some(Err(CatalystError::MalformedRecord(record))) => {
                    report.failed += 1;
                    if let Err(e) = self.retry.report_malformed(&record, &address) {
                        error!(peer = %address, record = %record.record_key, error = %e, "Could not record malformed record");
                        if let Some(local_timestamp) = record.local_timestamp {
                            ceiling = ceiling.min(local_timestamp.saturating_sub(1));
                        }
                    }
                    continue;
                }
                Some(Err(_)) => {
                    report.interrupted = true;
                    break;
                }
                None => break,
            };

            if self
                .settings
                .ignored_entity_types
                .contains(&deployment.entity.entity_type)
            {
                report.skipped += 1;
                continue;
            }
            match self.deployer.was_seen(&deployment.entity.id) {
                Ok(true) => {
                    report.skipped += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => warn!(entity_id = %deployment.entity.id, error = %e, "Seen-set check failed"),
            }

            let local_timestamp = deployment.local_timestamp;
            match self.schedule(deployment, &address).await {
                Ok(handle) => handles.push((local_timestamp, handle)),
                Err(e) => {
                    // Queue is closing
                    warn!(peer = %address, error = %e, "Could not schedule deployment");
                    ceiling = ceiling.min(local_timestamp.saturating_sub(1));
                    break;
                }
            }
        }
        drop(stream);

        for (local_timestamp, handle) in handles {
            match handle.await {
                Ok(JobResult::Applied(outcome)) => {
                    if outcome.is_new() {
                        report.deployed += 1;
                    } else {
                        report.skipped += 1;
                    }
                }
                Ok(JobResult::Recorded) => report.failed += 1,
                Ok(JobResult::Withheld) => {
                    report.failed += 1;
                    ceiling = ceiling.min(local_timestamp.saturating_sub(1));
                }
                Err(e) => {
                    error!(peer = %address, error = %e, "Deployment job panicked");
                    report.failed += 1;
                    ceiling = ceiling.min(local_timestamp.saturating_sub(1));
                }
            }
        }

        let before = client.last_local_deployment_timestamp();
        report.mark = if ceiling == Timestamp::MAX {
            client.all_deployments_were_successful()
        } else {
            client.deployments_successful_up_to(ceiling)
        };
        if report.mark > before {
            let now = self.deployer.clock().now();
            self.db
                .with_conn(|conn| sync_state::save_peer_mark(conn, &address, report.mark, now))?;
        }

        debug!(
            peer = %address,
            deployed = report.deployed,
            skipped = report.skipped,
            failed = report.failed,
            mark = report.mark,
            "Pulled from peer"
        );
        Ok(report)
    }

    async fn schedule(
        &self,
        deployment: RemoteDeployment,
        origin: &str,
    ) -> Result<tokio::task::JoinHandle<JobResult>> {
        let deployer = Arc::clone(&self.deployer);
        let retry = Arc::clone(&self.retry);
        let origin = origin.to_string();

        self.queue
            .schedule(async move {
                match deployer.deploy_remote(&deployment, &origin).await {
                    Ok(outcome) => {
                        if let Err(e) = retry.resolve(&deployment.entity.id) {
                            warn!(entity_id = %deployment.entity.id, error = %e, "Could not clear failure record");
                        }
                        JobResult::Applied(outcome)
                    }
                    Err(e) => {
                        let recorded = match retry.report_failure(&deployment, &origin, &e) {
                            Ok(record) => record.reason == FailureReason::Validation,
                            Err(db_error) => {
                                error!(
                                    entity_id = %deployment.entity.id,
                                    error = %db_error,
                                    "Could not record failed deployment"
                                );
                                false
                            }
                        };
                        if recorded {
                            JobResult::Recorded
                        } else {
                            JobResult::Withheld
                        }
                    }
                }
            })
            .await
    }

    /// Deploy the content of every unprocessed snapshot the peer offers.
    ///
    /// Returns the number of entities newly deployed. A snapshot is recorded as
    /// processed only when every entry in it was handled.
    pub async fn bootstrap_from_snapshots(&self, address: &str) -> Result<usize> {
        let offered = self.fetcher.list_snapshots(address).await?;
        let mut deployed = 0;

        for snapshot in offered {
            let known = self.db.with_conn(|conn| {
                Ok(snapshots::is_own_snapshot(conn, &snapshot.hash)?
                    || snapshots::is_processed_snapshot(conn, &snapshot.hash)?)
            })?;
            if known {
                continue;
            }

            let manifest = self.download_from_peer(address, &snapshot.hash).await?;
            let entries = parse_manifest(&manifest)?;
            let mut complete = true;

            for entry in entries {
                if self
                    .settings
                    .ignored_entity_types
                    .contains(&entry.entity_type)
                    || self.deployer.was_seen(&entry.entity_id)?
                {
                    continue;
                }

                let result = async {
                    let bytes = self.download_from_peer(address, &entry.entity_id).await?;
                    let entity = Entity::from_bytes(&bytes)?;
                    if entity.id != entry.entity_id {
                        return Err(CatalystError::Validation(vec![format!(
                            "Entity file {} holds entity {}",
                            entry.entity_id, entity.id
                        )]));
                    }
                    let remote = RemoteDeployment {
                        entity,
                        local_timestamp: 0,
                    };
                    let outcome = self.deployer.deploy_remote(&remote, address).await;
                    if let Err(e) = &outcome {
                        self.retry.report_failure(&remote, address, e)?;
                    }
                    outcome
                }
                .await;

                match result {
                    Ok(outcome) => {
                        if outcome.is_new() {
                            deployed += 1;
                        }
                    }
                    Err(e) => {
                        warn!(
                            peer = %address,
                            snapshot = %snapshot.hash,
                            entity_id = %entry.entity_id,
                            error = %e,
                            "Could not deploy snapshot entity"
                        );
                        complete = false;
                    }
                }
            }

            if complete {
                let now = self.deployer.clock().now();
                self.db
                    .with_conn(|conn| snapshots::save_processed_snapshot(conn, &snapshot.hash, now))?;
                info!(peer = %address, snapshot = %snapshot.hash, range = %snapshot.time_range, "Processed snapshot");
            }
        }
        Ok(deployed)
    }

    async fn download_from_peer(&self, address: &str, hash: &str) -> Result<Vec<u8>> {
        let client = self
            .cluster
            .client(address)
            .ok_or_else(|| CatalystError::NotFound(format!("Untracked peer {}", address)))?;
        let data = client.download_content(hash).await?;
        BlobStore::verify(hash, &data)?;
        Ok(data)
    }

    /// Stop accepting jobs and wait for in-flight ones
    pub async fn drain(&self) {
        self.queue.drain().await;
    }
}
