//! Cluster membership
//!
//! Peers come from an external directory. Before a newly listed peer is pulled
//! from, it must pass an identity challenge: it is sent a random token and has
//! to echo it back verbatim. Peers that fail are skipped until a later refresh.
//!
//! Peers that disappear from the directory keep their client. A node that left
//! the directory may still hold valid history, so syncing from it continues.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::client::{ClientStatus, ContentServerClient};
use crate::db::{sync_state, ContentDb};
use crate::error::{CatalystError, Result};
use crate::transport::{normalize_address, ChallengeTransport, ContentDownloader, DeploymentFetcher, PeerDirectory};

const CHALLENGE_TOKEN_LEN: usize = 32;

/// Runs the identity challenge against candidate peers
pub struct ChallengeSupervisor {
    transport: Arc<dyn ChallengeTransport>,
}

impl ChallengeSupervisor {
    pub fn new(transport: Arc<dyn ChallengeTransport>) -> Self {
        Self { transport }
    }

    pub fn new_token() -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(CHALLENGE_TOKEN_LEN)
            .map(char::from)
            .collect()
    }

    /// Ok when the peer echoes a fresh token back unchanged
    pub async fn verify(&self, address: &str) -> Result<()> {
        let token = Self::new_token();
        let answer = self.transport.echo(address, &token).await?;
        if answer.trim() != token {
            return Err(CatalystError::Challenge(format!(
                "{} answered with a different token",
                address
            )));
        }
        Ok(())
    }
}

/// Outcome of one membership refresh
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    /// Newly tracked peers
    pub added: Vec<String>,
    /// Listed peers that failed the challenge
    pub rejected: Vec<String>,
    /// Peers tracked after the refresh, listed or not
    pub tracked: usize,
}

pub struct ContentCluster {
    own_address: String,
    directory: Arc<dyn PeerDirectory>,
    supervisor: ChallengeSupervisor,
    fetcher: Arc<dyn DeploymentFetcher>,
    downloader: Arc<dyn ContentDownloader>,
    db: Arc<ContentDb>,
    clients: RwLock<HashMap<String, Arc<ContentServerClient>>>,
}

impl ContentCluster {
    pub fn new(
        own_address: &str,
        directory: Arc<dyn PeerDirectory>,
        challenge: Arc<dyn ChallengeTransport>,
        fetcher: Arc<dyn DeploymentFetcher>,
        downloader: Arc<dyn ContentDownloader>,
        db: Arc<ContentDb>,
    ) -> Self {
        Self {
            own_address: normalize_address(own_address),
            directory,
            supervisor: ChallengeSupervisor::new(challenge),
            fetcher,
            downloader,
            db,
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub fn own_address(&self) -> &str {
        &self.own_address
    }

    /// Pull the directory and start tracking every new peer that passes the challenge
    pub async fn refresh(&self) -> Result<RefreshReport> {
        let listed = self.directory.list_peers().await?;
        let persisted_marks = self.db.with_conn(sync_state::load_peer_marks)?;

        let mut report = RefreshReport::default();
        let mut seen = HashSet::new();

        for address in listed {
            let key = normalize_address(&address);
            if key.is_empty() || key == self.own_address || !seen.insert(key.clone()) {
                continue;
            }
            if self.is_tracked(&key) {
                continue;
            }

            match self.supervisor.verify(&address).await {
                Ok(()) => {
                    let mark = persisted_marks.get(&key).copied().unwrap_or(0);
                    let client = Arc::new(ContentServerClient::new(
                        address.trim().trim_end_matches('/'),
                        mark,
                        Arc::clone(&self.fetcher),
                        Arc::clone(&self.downloader),
                    ));
                    if let Ok(mut clients) = self.clients.write() {
                        clients.entry(key.clone()).or_insert(client);
                    }
                    info!(peer = %address, mark, "Tracking content server");
                    report.added.push(key);
                }
                Err(e) => {
                    warn!(peer = %address, error = %e, "Peer failed identity challenge");
                    report.rejected.push(key);
                }
            }
        }

        report.tracked = self.len();
        debug!(
            added = report.added.len(),
            rejected = report.rejected.len(),
            tracked = report.tracked,
            "Cluster membership refreshed"
        );
        Ok(report)
    }

    fn is_tracked(&self, key: &str) -> bool {
        self.clients
            .read()
            .map(|clients| clients.contains_key(key))
            .unwrap_or(false)
    }

    /// Every tracked peer client, including peers no longer listed
    pub fn clients(&self) -> Vec<Arc<ContentServerClient>> {
        let mut clients: Vec<_> = self
            .clients
            .read()
            .map(|clients| clients.values().cloned().collect())
            .unwrap_or_default();
        clients.sort_by(|a, b| a.address().cmp(b.address()));
        clients
    }

    pub fn client(&self, address: &str) -> Option<Arc<ContentServerClient>> {
        self.clients
            .read()
            .ok()
            .and_then(|clients| clients.get(&normalize_address(address)).cloned())
    }

    pub fn len(&self) -> usize {
        self.clients.read().map(|clients| clients.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn statuses(&self) -> Vec<ClientStatus> {
        self.clients().iter().map(|client| client.status()).collect()
    }
}
