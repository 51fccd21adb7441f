//! Shared fakes for integration tests
//!
//! `FakeNetwork` plays every remote content server: it serves each peer's
//! history stream, its content files, its snapshots and the echo challenge.
//! `MemoryStorage` is an in-memory blob store stamped with a manual clock so
//! tests control blob age.

#![allow(dead_code)]

use async_trait::async_trait;
use catalyst_content::blob_store::{BlobStore, ContentStorage, StoredBlob};
use catalyst_content::clock::ManualClock;
use catalyst_content::config::Config;
use catalyst_content::db::ContentDb;
use catalyst_content::error::{CatalystError, Result};
use catalyst_content::node::{CatalystNode, Collaborators};
use catalyst_content::transport::{
    parse_record, ChallengeTransport, ContentDownloader, DeploymentFetcher, StaticPeerDirectory,
};
use catalyst_content::types::{
    AuthLink, ContentMapping, Entity, EntityType, RemoteDeployment, SnapshotMetadata, Timestamp,
};
use catalyst_content::validator::StructuralValidator;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

pub const OWN_ADDRESS: &str = "http://self";

// =============================================================================
// Entities
// =============================================================================

/// Bytes of a content file that `entity` references
pub fn file_bytes(entity_id: &str) -> Vec<u8> {
    format!("content of {}", entity_id).into_bytes()
}

pub fn entity(id: &str, entity_type: EntityType, pointers: &[&str], timestamp: Timestamp) -> Entity {
    Entity {
        id: id.to_string(),
        entity_type,
        pointers: pointers.iter().map(|p| p.to_string()).collect(),
        timestamp,
        content: vec![ContentMapping {
            file: "main.json".into(),
            hash: BlobStore::compute_hash(&file_bytes(id)),
        }],
        metadata: None,
        auth_chain: vec![AuthLink {
            kind: "SIGNER".into(),
            payload: "0x1234".into(),
            signature: String::new(),
        }],
    }
}

pub fn scene(id: &str, pointers: &[&str], timestamp: Timestamp) -> Entity {
    entity(id, EntityType::Scene, pointers, timestamp)
}

// =============================================================================
// Fake peers
// =============================================================================

#[derive(Default)]
pub struct FakePeer {
    pub history: Vec<RemoteDeployment>,
    /// Raw history lines served at the given local timestamp, e.g. unreadable ones
    pub raw_lines: Vec<(Timestamp, String)>,
    pub files: HashMap<String, Vec<u8>>,
    pub snapshots: Vec<SnapshotMetadata>,
    /// Stream yields this many items, then a network error
    pub fail_after: Option<usize>,
    /// Answers the challenge with a wrong token
    pub impostor: bool,
    /// Refuses to serve these content hashes
    pub withheld: HashSet<String>,
}

#[derive(Default)]
pub struct FakeNetwork {
    peers: Mutex<HashMap<String, FakePeer>>,
    pulls: Mutex<Vec<(String, Timestamp)>>,
}

impl FakeNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_peer(&self, address: &str) {
        self.peers
            .lock()
            .unwrap()
            .entry(address.to_string())
            .or_default();
    }

    pub fn with_peer<R>(&self, address: &str, f: impl FnOnce(&mut FakePeer) -> R) -> R {
        let mut peers = self.peers.lock().unwrap();
        f(peers.entry(address.to_string()).or_default())
    }

    /// Serve `line` verbatim in the peer's history at `local_timestamp`
    pub fn publish_raw(&self, address: &str, line: &str, local_timestamp: Timestamp) {
        self.with_peer(address, |peer| peer.raw_lines.push((local_timestamp, line.to_string())));
    }

    /// Record `entity` in the peer's history at the peer's `local_timestamp`,
    /// serving its content and entity files.
    pub fn publish(&self, address: &str, entity: Entity, local_timestamp: Timestamp) {
        self.with_peer(address, |peer| {
            peer.files.insert(entity.content[0].hash.clone(), file_bytes(&entity.id));
            peer.files.insert(entity.id.clone(), entity.to_bytes().unwrap());
            peer.history.push(RemoteDeployment {
                entity,
                local_timestamp,
            });
        });
    }

    /// `from` values each pull started at
    pub fn pulls(&self) -> Vec<(String, Timestamp)> {
        self.pulls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeploymentFetcher for FakeNetwork {
    async fn stream_deployments(
        &self,
        address: &str,
        from: Timestamp,
    ) -> Result<BoxStream<'static, Result<RemoteDeployment>>> {
        self.pulls.lock().unwrap().push((address.to_string(), from));
        let peers = self.peers.lock().unwrap();
        let peer = peers
            .get(address)
            .ok_or_else(|| CatalystError::Network(format!("{} unreachable", address)))?;

        let mut items: Vec<(Timestamp, Result<RemoteDeployment>)> = peer
            .history
            .iter()
            .filter(|d| d.local_timestamp >= from)
            .map(|d| (d.local_timestamp, Ok(d.clone())))
            .collect();
        items.extend(
            peer.raw_lines
                .iter()
                .filter(|(lt, _)| *lt >= from)
                .map(|(lt, line)| (*lt, parse_record(line.as_bytes(), address))),
        );
        items.sort_by_key(|(lt, _)| *lt);

        let mut results: Vec<Result<RemoteDeployment>> = items.into_iter().map(|(_, r)| r).collect();
        if let Some(n) = peer.fail_after {
            results.truncate(n);
            results.push(Err(CatalystError::Network(format!("{} dropped the stream", address))));
        }
        Ok(stream::iter(results).boxed())
    }

    async fn list_snapshots(&self, address: &str) -> Result<Vec<SnapshotMetadata>> {
        let peers = self.peers.lock().unwrap();
        Ok(peers.get(address).map(|p| p.snapshots.clone()).unwrap_or_default())
    }
}

#[async_trait]
impl ContentDownloader for FakeNetwork {
    async fn download(&self, address: &str, hash: &str) -> Result<Vec<u8>> {
        let peers = self.peers.lock().unwrap();
        let peer = peers
            .get(address)
            .ok_or_else(|| CatalystError::Network(format!("{} unreachable", address)))?;
        if peer.withheld.contains(hash) {
            return Err(CatalystError::ContentUnavailable(hash.to_string()));
        }
        peer.files
            .get(hash)
            .cloned()
            .ok_or_else(|| CatalystError::ContentUnavailable(hash.to_string()))
    }
}

#[async_trait]
impl ChallengeTransport for FakeNetwork {
    async fn echo(&self, address: &str, token: &str) -> Result<String> {
        let peers = self.peers.lock().unwrap();
        match peers.get(address) {
            Some(peer) if peer.impostor => Ok("not-the-token".into()),
            Some(_) => Ok(token.to_string()),
            None => Err(CatalystError::Network(format!("{} unreachable", address))),
        }
    }
}

// =============================================================================
// In-memory blob storage
// =============================================================================

pub struct MemoryStorage {
    clock: Arc<ManualClock>,
    blobs: Mutex<HashMap<String, (Vec<u8>, Timestamp)>>,
    fail_writes: AtomicBool,
    /// Signals `list` was reached, then holds it until released
    list_gate: Mutex<Option<(oneshot::Sender<()>, oneshot::Receiver<()>)>>,
}

impl MemoryStorage {
    pub fn new(clock: Arc<ManualClock>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            blobs: Mutex::new(HashMap::new()),
            fail_writes: AtomicBool::new(false),
            list_gate: Mutex::new(None),
        })
    }

    /// Hold the next `list` after it has read the blobs. The receiver fires
    /// once it is held; sending on the sender lets it return.
    pub fn pause_next_list(&self) -> (oneshot::Receiver<()>, oneshot::Sender<()>) {
        let (reached_tx, reached_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        *self.list_gate.lock().unwrap() = Some((reached_tx, release_rx));
        (reached_rx, release_tx)
    }

    fn now(&self) -> Timestamp {
        catalyst_content::clock::Clock::now(self.clock.as_ref())
    }

    /// Make every following `store` fail until switched back
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.blobs.lock().unwrap().contains_key(hash)
    }
}

#[async_trait]
impl ContentStorage for MemoryStorage {
    async fn store(&self, hash: &str, data: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CatalystError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        let now = self.now();
        self.blobs
            .lock()
            .unwrap()
            .entry(hash.to_string())
            .and_modify(|(_, stored_at)| *stored_at = now)
            .or_insert_with(|| (data.to_vec(), now));
        Ok(())
    }

    async fn touch(&self, hash: &str) -> Result<bool> {
        let now = self.now();
        Ok(match self.blobs.lock().unwrap().get_mut(hash) {
            Some((_, stored_at)) => {
                *stored_at = now;
                true
            }
            None => false,
        })
    }

    async fn get(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.lock().unwrap().get(hash).map(|(data, _)| data.clone()))
    }

    async fn exists(&self, hash: &str) -> Result<bool> {
        Ok(self.contains(hash))
    }

    async fn delete(&self, hash: &str) -> Result<bool> {
        Ok(self.blobs.lock().unwrap().remove(hash).is_some())
    }

    async fn delete_unless_newer(&self, hash: &str, cutoff: Timestamp) -> Result<bool> {
        let mut blobs = self.blobs.lock().unwrap();
        let expired = blobs.get(hash).map_or(false, |(_, stored_at)| *stored_at <= cutoff);
        if expired {
            blobs.remove(hash);
        }
        Ok(expired)
    }

    async fn list(&self) -> Result<Vec<StoredBlob>> {
        let listed: Vec<StoredBlob> = self
            .blobs
            .lock()
            .unwrap()
            .iter()
            .map(|(hash, (_, stored_at))| StoredBlob {
                hash: hash.clone(),
                stored_at: *stored_at,
            })
            .collect();

        let gate = self.list_gate.lock().unwrap().take();
        if let Some((reached, release)) = gate {
            let _ = reached.send(());
            let _ = release.await;
        }
        Ok(listed)
    }
}

// =============================================================================
// Nodes
// =============================================================================

pub struct TestNode {
    pub node: CatalystNode,
    pub db: Arc<ContentDb>,
    pub storage: Arc<MemoryStorage>,
    pub clock: Arc<ManualClock>,
    pub directory: Arc<StaticPeerDirectory>,
}

/// Snapshot timeline of 100ms ranges from 0, leaves split above 4 entities
pub fn test_config() -> Config {
    Config {
        server_address: OWN_ADDRESS.into(),
        snapshot_genesis_timestamp: 0,
        snapshot_range_ms: 100,
        snapshot_min_range_ms: 10,
        snapshot_split_threshold: 4,
        snapshot_merge_threshold: 2,
        retry_failed_deployments_delay_secs: 60,
        garbage_collection_grace_period_secs: 60,
        bloom_expected_items: 1_000,
        ..Config::default()
    }
}

pub fn test_node(network: &Arc<FakeNetwork>, peers: &[&str], config: Config, now: Timestamp) -> TestNode {
    let db = Arc::new(ContentDb::open_in_memory().unwrap());
    test_node_on(db, network, peers, config, now)
}

/// A node over an existing database, as after a restart
pub fn test_node_on(
    db: Arc<ContentDb>,
    network: &Arc<FakeNetwork>,
    peers: &[&str],
    config: Config,
    now: Timestamp,
) -> TestNode {
    let clock = Arc::new(ManualClock::new(now));
    let storage = MemoryStorage::new(clock.clone());
    let directory = Arc::new(StaticPeerDirectory::new(peers.iter().copied()));

    let node = CatalystNode::with_collaborators(
        config,
        db.clone(),
        Collaborators {
            storage: storage.clone(),
            directory: directory.clone(),
            fetcher: network.clone(),
            downloader: network.clone(),
            challenge: network.clone(),
            validator: Arc::new(StructuralValidator),
            clock: clock.clone(),
        },
    )
    .unwrap();

    TestNode {
        node,
        db,
        storage,
        clock,
        directory,
    }
}

/// Entity ids of the active deployments for `pointer`
pub fn active_ids(node: &CatalystNode, entity_type: EntityType, pointer: &str) -> Vec<String> {
    node.active_entities(entity_type, &[pointer.to_string()])
        .unwrap()
        .into_iter()
        .map(|d| d.entity.id)
        .collect()
}
