//! Node wiring
//!
//! Builds every component from a [`Config`] and a set of collaborators, runs
//! the periodic tasks and exposes the query surface the API layer consumes.
//!
//! Periodic tasks: membership refresh with a seen-set rebuild, sync pull,
//! snapshot rebuild, retry sweep and (when enabled) garbage collection. Each
//! tick runs to completion; errors are logged and the task waits for the next
//! tick. Shutdown stops every loop, lets in-flight pulls end at their next
//! await point and drains the job queue.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::blob_store::{BlobStore, ContentStorage};
use crate::client::ClientStatus;
use crate::clock::{Clock, SystemClock};
use crate::cluster::{ContentCluster, RefreshReport};
use crate::config::Config;
use crate::db::{deployments, snapshots, ContentDb, DbStats};
use crate::deployer::{DeployOutcome, Deployer};
use crate::error::Result;
use crate::gc::{GarbageCollector, GcReport};
use crate::retry::{RetryManager, RetryReport};
use crate::snapshots::{SnapshotCycleReport, SnapshotManager};
use crate::synchronizer::{PeerSyncReport, SynchronizationState, Synchronizer};
use crate::time_range::TimeRange;
use crate::transport::{
    ChallengeTransport, ContentDownloader, DeploymentFetcher, HttpTransport, PeerDirectory, StaticPeerDirectory,
};
use crate::types::{Deployment, Entity, EntityType, FailedDeployment, SnapshotMetadata};
use crate::validator::{EntityValidator, StructuralValidator};

/// The seen-set is rebuilt from history so that entities stored by any writer
/// to the shared database are recognized without a download.
async fn refresh_directory(cluster: &ContentCluster, deployer: &Deployer) -> Result<RefreshReport> {
    deployer.rebuild_seen_set()?;
    cluster.refresh().await
}

/// Resolves once shutdown was requested. Never resolves if the sender is gone
/// without having requested it.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        futures::future::pending::<()>().await;
    }
}

/// Everything the node talks to outside its own database
pub struct Collaborators {
    pub storage: Arc<dyn ContentStorage>,
    pub directory: Arc<dyn PeerDirectory>,
    pub fetcher: Arc<dyn DeploymentFetcher>,
    pub downloader: Arc<dyn ContentDownloader>,
    pub challenge: Arc<dyn ChallengeTransport>,
    pub validator: Arc<dyn EntityValidator>,
    pub clock: Arc<dyn Clock>,
}

pub struct CatalystNode {
    config: Config,
    db: Arc<ContentDb>,
    deployer: Arc<Deployer>,
    cluster: Arc<ContentCluster>,
    synchronizer: Arc<Synchronizer>,
    snapshots: Arc<SnapshotManager>,
    retry: Arc<RetryManager>,
    gc: Arc<GarbageCollector>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CatalystNode {
    /// Open the on-disk stores and talk to peers over HTTP
    pub async fn open(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.storage_dir)?;
        let storage = Arc::new(BlobStore::new(&config.storage_dir).await?);
        let db = Arc::new(ContentDb::open(&config.database_path())?);
        let http = Arc::new(HttpTransport::new(
            config.fetch_request_timeout(),
            config.sync_stream_timeout(),
        )?);

        let collaborators = Collaborators {
            storage,
            directory: Arc::new(StaticPeerDirectory::new(config.peers.iter().cloned())),
            fetcher: http.clone(),
            downloader: http.clone(),
            challenge: http,
            validator: Arc::new(StructuralValidator),
            clock: Arc::new(SystemClock),
        };
        Self::with_collaborators(config, db, collaborators)
    }

    pub fn with_collaborators(config: Config, db: Arc<ContentDb>, c: Collaborators) -> Result<Self> {
        let deployer = Arc::new(
            Deployer::new(
                Arc::clone(&db),
                Arc::clone(&c.storage),
                Arc::clone(&c.downloader),
                c.validator,
                Arc::clone(&c.clock),
            )
            .with_seen_capacity(config.bloom_expected_items, config.bloom_false_positive_rate),
        );
        let cluster = Arc::new(ContentCluster::new(
            &config.server_address,
            c.directory,
            c.challenge,
            Arc::clone(&c.fetcher),
            c.downloader,
            Arc::clone(&db),
        ));
        let retry = Arc::new(RetryManager::new(
            Arc::clone(&db),
            Arc::clone(&deployer),
            config.retry_delay(),
            config.retry_validation_failures,
        ));
        let synchronizer = Arc::new(Synchronizer::new(
            Arc::clone(&cluster),
            Arc::clone(&deployer),
            Arc::clone(&retry),
            c.fetcher,
            config.sync_settings()?,
        ));
        let snapshots = Arc::new(SnapshotManager::new(
            Arc::clone(&db),
            Arc::clone(&c.storage),
            Arc::clone(&c.clock),
            config.snapshot_settings(),
        ));
        let gc = Arc::new(GarbageCollector::new(
            Arc::clone(&db),
            c.storage,
            c.clock,
            config.garbage_collection_grace_period(),
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            db,
            deployer,
            cluster,
            synchronizer,
            snapshots,
            retry,
            gc,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Rebuild the seen-set, join the cluster and start the periodic tasks
    pub async fn start(&self) -> Result<()> {
        self.deployer.rebuild_seen_set()?;
        if let Err(e) = self.cluster.refresh().await {
            warn!(error = %e, "Initial membership refresh failed");
        }

        let mut tasks = self.tasks.lock().await;

        let cluster = Arc::clone(&self.cluster);
        let deployer = Arc::clone(&self.deployer);
        tasks.push(self.spawn_periodic("directory refresh", self.config.directory_refresh_interval(), move || {
            let cluster = Arc::clone(&cluster);
            let deployer = Arc::clone(&deployer);
            async move {
                if let Err(e) = refresh_directory(&cluster, &deployer).await {
                    error!(error = %e, "Directory refresh failed");
                }
            }
        }));

        if self.config.disable_synchronization {
            info!("Synchronization disabled");
        } else {
            let synchronizer = Arc::clone(&self.synchronizer);
            let shutdown = self.shutdown_tx.subscribe();
            tasks.push(self.spawn_periodic("sync", self.config.sync_interval(), move || {
                let synchronizer = Arc::clone(&synchronizer);
                let shutdown = shutdown.clone();
                async move {
                    synchronizer.sync_with_peers(&shutdown).await;
                }
            }));
        }

        let snapshots = Arc::clone(&self.snapshots);
        tasks.push(self.spawn_periodic("snapshots", self.config.snapshot_frequency(), move || {
            let snapshots = Arc::clone(&snapshots);
            async move {
                if let Err(e) = snapshots.run_cycle().await {
                    error!(error = %e, "Snapshot cycle failed");
                }
            }
        }));

        let retry = Arc::clone(&self.retry);
        tasks.push(self.spawn_periodic("retry", self.config.retry_delay(), move || {
            let retry = Arc::clone(&retry);
            async move {
                if let Err(e) = retry.retry_failed_deployments().await {
                    error!(error = %e, "Retry sweep failed");
                }
            }
        }));

        if self.config.garbage_collection {
            let gc = Arc::clone(&self.gc);
            tasks.push(self.spawn_periodic(
                "garbage collection",
                self.config.garbage_collection_interval(),
                move || {
                    let gc = Arc::clone(&gc);
                    async move {
                        if let Err(e) = gc.collect().await {
                            error!(error = %e, "Garbage collection failed");
                        }
                    }
                },
            ));
        }

        info!(
            address = %self.cluster.own_address(),
            peers = self.cluster.len(),
            tasks = tasks.len(),
            "Content node started"
        );
        Ok(())
    }

    fn spawn_periodic<F, Fut>(&self, name: &'static str, period: Duration, mut tick: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tick().await;
                tokio::select! {
                    _ = tokio::time::sleep(period) => {}
                    _ = stopped(&mut shutdown) => {
                        info!(task = name, "Periodic task shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Stop the periodic tasks and drain in-flight deployment jobs
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Periodic task ended abnormally");
            }
        }
        self.synchronizer.drain().await;
        info!("Content node stopped");
    }

    // Single runs of each periodic task

    pub async fn refresh_cluster(&self) -> Result<RefreshReport> {
        self.cluster.refresh().await
    }

    /// Membership refresh plus a seen-set rebuild, as the periodic task runs it
    pub async fn refresh_directory(&self) -> Result<RefreshReport> {
        refresh_directory(&self.cluster, &self.deployer).await
    }

    pub async fn sync_once(&self) -> Vec<PeerSyncReport> {
        let shutdown = self.shutdown_tx.subscribe();
        self.synchronizer.sync_with_peers(&shutdown).await
    }

    pub async fn run_snapshot_cycle(&self) -> Result<SnapshotCycleReport> {
        self.snapshots.run_cycle().await
    }

    pub async fn collect_garbage(&self) -> Result<GcReport> {
        self.gc.collect().await
    }

    pub async fn retry_failed_deployments(&self) -> Result<RetryReport> {
        self.retry.retry_failed_deployments().await
    }

    // Query surface

    /// Active deployments with entity timestamp in `range`, by `(entity_timestamp, entity_id)`
    pub fn active_deployments_in_range(&self, range: TimeRange) -> BoxStream<'static, Result<Deployment>> {
        self.db.stream_active_in_range(range)
    }

    /// Every active deployment, same order as above
    pub fn all_active_deployments(&self) -> BoxStream<'static, Result<Deployment>> {
        self.db.stream_all_active()
    }

    pub fn count_active_in_range(&self, range: &TimeRange) -> Result<u64> {
        self.db.with_conn(|conn| deployments::count_active_in_range(conn, range))
    }

    pub fn active_entities(&self, entity_type: EntityType, pointers: &[String]) -> Result<Vec<Deployment>> {
        self.db
            .with_conn(|conn| deployments::active_by_pointers(conn, entity_type, pointers))
    }

    /// Every deployment that ever claimed `pointer`, active or not, in arrival order
    pub fn pointer_history(&self, entity_type: EntityType, pointer: &str) -> Result<Vec<Deployment>> {
        self.db
            .with_conn(|conn| deployments::history_by_pointer(conn, entity_type, pointer))
    }

    pub fn deployment(&self, entity_id: &str) -> Result<Option<Deployment>> {
        self.db.with_conn(|conn| deployments::get_deployment(conn, entity_id))
    }

    pub fn snapshot_by_hash(&self, hash: &str) -> Result<Option<SnapshotMetadata>> {
        self.snapshots.get_snapshot(hash)
    }

    pub fn snapshots(&self) -> Result<Vec<SnapshotMetadata>> {
        self.snapshots.all_snapshots()
    }

    pub fn snapshots_in_range(&self, range: &TimeRange) -> Result<Vec<SnapshotMetadata>> {
        self.snapshots.snapshots_contained_in(range)
    }

    pub fn is_snapshot_processed(&self, hash: &str) -> Result<bool> {
        self.db.with_conn(|conn| snapshots::is_processed_snapshot(conn, hash))
    }

    pub async fn snapshot_manifest(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        self.snapshots.manifest(hash).await
    }

    /// Accept a locally authored deployment
    pub async fn deploy_local(&self, entity: Entity, files: HashMap<String, Vec<u8>>) -> Result<DeployOutcome> {
        self.deployer.deploy_local(entity, files).await
    }

    pub fn synchronization_state(&self) -> SynchronizationState {
        self.synchronizer.state()
    }

    pub fn peer_statuses(&self) -> Vec<ClientStatus> {
        self.cluster.statuses()
    }

    /// Whether `entity_id` is already in this node's history
    pub fn was_seen(&self, entity_id: &str) -> Result<bool> {
        self.deployer.was_seen(entity_id)
    }

    pub fn failed_deployments(&self) -> Result<Vec<FailedDeployment>> {
        self.retry.list_failed()
    }

    pub fn remove_failed_deployment(&self, entity_id: &str) -> Result<bool> {
        self.retry.remove_failed(entity_id)
    }

    pub fn stats(&self) -> Result<DbStats> {
        self.db.stats()
    }
}
