//! Per-peer content server client
//!
//! Tracks the high-water mark for one peer and pulls the deployments recorded
//! after it. The mark only moves when the caller confirms the pulled batch was
//! durably applied, so a crash or failure mid-batch causes a re-pull, never a gap.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::{CatalystError, Result};
use crate::transport::{ContentDownloader, DeploymentFetcher};
use crate::types::{RemoteDeployment, Timestamp};

/// Content downloads are attempted this many times before giving up
pub const DOWNLOAD_ATTEMPTS: u32 = 3;
const DOWNLOAD_RETRY_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    NeverReached,
    Connected,
    ConnectionLost,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::NeverReached => "Could never be reached",
            ConnectionState::Connected => "Connected",
            ConnectionState::ConnectionLost => "Connection lost",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct ClientState {
    last_local_timestamp: Timestamp,
    potential_local_timestamp: Option<Timestamp>,
    connection_state: ConnectionState,
}

/// Observable state of a peer client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStatus {
    pub address: String,
    pub last_local_deployment_timestamp: Timestamp,
    pub connection_state: ConnectionState,
}

pub struct ContentServerClient {
    address: String,
    fetcher: Arc<dyn DeploymentFetcher>,
    downloader: Arc<dyn ContentDownloader>,
    state: Arc<Mutex<ClientState>>,
}

fn lock(state: &Mutex<ClientState>) -> MutexGuard<'_, ClientState> {
    // State is plain data; a poisoned lock still holds a consistent value
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum PullState {
    Pending,
    Open(BoxStream<'static, Result<RemoteDeployment>>),
    Done,
}

impl ContentServerClient {
    pub fn new(
        address: impl Into<String>,
        last_local_timestamp: Timestamp,
        fetcher: Arc<dyn DeploymentFetcher>,
        downloader: Arc<dyn ContentDownloader>,
    ) -> Self {
        Self {
            address: address.into(),
            fetcher,
            downloader,
            state: Arc::new(Mutex::new(ClientState {
                last_local_timestamp,
                potential_local_timestamp: None,
                connection_state: ConnectionState::NeverReached,
            })),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn connection_state(&self) -> ConnectionState {
        lock(&self.state).connection_state
    }

    pub fn last_local_deployment_timestamp(&self) -> Timestamp {
        lock(&self.state).last_local_timestamp
    }

    pub fn status(&self) -> ClientStatus {
        let state = lock(&self.state);
        ClientStatus {
            address: self.address.clone(),
            last_local_deployment_timestamp: state.last_local_timestamp,
            connection_state: state.connection_state,
        }
    }

    /// Pull everything the peer recorded after the current mark.
    ///
    /// The stream is lazy and finite. A malformed record is yielded as an error
    /// and the pull goes on past it. Any other error ends the stream: it is
    /// yielded as the last item and discards the potential mark.
    pub fn get_new_deployments(&self) -> BoxStream<'static, Result<RemoteDeployment>> {
        let from = {
            let mut state = lock(&self.state);
            state.potential_local_timestamp = None;
            state.last_local_timestamp.saturating_add(1)
        };
        let address = self.address.clone();
        let fetcher = Arc::clone(&self.fetcher);
        let state = Arc::clone(&self.state);

        stream::unfold(PullState::Pending, move |pull| {
            let address = address.clone();
            let fetcher = Arc::clone(&fetcher);
            let state = Arc::clone(&state);
            async move {
                let mut inner = match pull {
                    PullState::Done => return None,
                    PullState::Open(inner) => inner,
                    PullState::Pending => match fetcher.stream_deployments(&address, from).await {
                        Ok(inner) => inner,
                        Err(e) => {
                            mark_failed(&state, &address, &e);
                            return Some((Err(e), PullState::Done));
                        }
                    },
                };

                match inner.next().await {
                    Some(Ok(deployment)) => {
                        advance_potential(&state, deployment.local_timestamp);
                        Some((Ok(deployment), PullState::Open(inner)))
                    }
                    // One unreadable record; the connection is still good
                    Some(Err(CatalystError::MalformedRecord(record))) => {
                        if let Some(local_timestamp) = record.local_timestamp {
                            advance_potential(&state, local_timestamp);
                        }
                        Some((Err(CatalystError::MalformedRecord(record)), PullState::Open(inner)))
                    }
                    Some(Err(e)) => {
                        mark_failed(&state, &address, &e);
                        Some((Err(e), PullState::Done))
                    }
                    None => {
                        let mut s = lock(&state);
                        if s.connection_state != ConnectionState::Connected {
                            info!(peer = %address, "Could connect to content server");
                        }
                        s.connection_state = ConnectionState::Connected;
                        None
                    }
                }
            }
        })
        .boxed()
    }

    /// Commit the potential mark after the whole batch was applied
    pub fn all_deployments_were_successful(&self) -> Timestamp {
        let mut state = lock(&self.state);
        let potential = state.potential_local_timestamp.take().unwrap_or(0);
        state.last_local_timestamp = state.last_local_timestamp.max(potential);
        state.last_local_timestamp
    }

    /// Commit the potential mark, but never beyond `ceiling`.
    ///
    /// Used when an item of the batch could not be applied: the mark stays
    /// below it so the next pull starts over from the failing item.
    pub fn deployments_successful_up_to(&self, ceiling: Timestamp) -> Timestamp {
        let mut state = lock(&self.state);
        let potential = state.potential_local_timestamp.take().unwrap_or(0);
        state.last_local_timestamp = state.last_local_timestamp.max(potential.min(ceiling));
        state.last_local_timestamp
    }

    /// Download a content file from this peer
    pub async fn download_content(&self, hash: &str) -> Result<Vec<u8>> {
        download_with_retries(self.downloader.as_ref(), &self.address, hash).await
    }
}

fn advance_potential(state: &Mutex<ClientState>, local_timestamp: Timestamp) {
    let mut s = lock(state);
    s.potential_local_timestamp = Some(s.potential_local_timestamp.unwrap_or(0).max(local_timestamp));
}

fn mark_failed(state: &Mutex<ClientState>, address: &str, e: &CatalystError) {
    error!(peer = %address, error = %e, "Failed to get new entities from content server");
    let mut s = lock(state);
    if s.connection_state == ConnectionState::Connected {
        s.connection_state = ConnectionState::ConnectionLost;
    }
    s.potential_local_timestamp = None;
}

/// Download with a few quick retries on transient errors
pub async fn download_with_retries(
    downloader: &dyn ContentDownloader,
    address: &str,
    hash: &str,
) -> Result<Vec<u8>> {
    let mut attempt = 1;
    loop {
        match downloader.download(address, hash).await {
            Ok(bytes) => return Ok(bytes),
            Err(e @ (CatalystError::Network(_) | CatalystError::Timeout(_))) if attempt < DOWNLOAD_ATTEMPTS => {
                warn!(peer = %address, hash = %hash, attempt, error = %e, "Content download failed, retrying");
                tokio::time::sleep(DOWNLOAD_RETRY_WAIT).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Entity, EntityType, SnapshotMetadata};
    use async_trait::async_trait;

    struct ScriptedFetcher {
        items: Vec<Result<RemoteDeployment>>,
    }

    fn remote(id: &str, local_timestamp: Timestamp) -> RemoteDeployment {
        RemoteDeployment {
            entity: Entity {
                id: id.into(),
                entity_type: EntityType::Scene,
                pointers: vec!["0,0".into()],
                timestamp: 1,
                content: vec![],
                metadata: None,
                auth_chain: vec![],
            },
            local_timestamp,
        }
    }

    #[async_trait]
    impl DeploymentFetcher for ScriptedFetcher {
        async fn stream_deployments(
            &self,
            _address: &str,
            from: Timestamp,
        ) -> Result<BoxStream<'static, Result<RemoteDeployment>>> {
            let items: Vec<Result<RemoteDeployment>> = self
                .items
                .iter()
                .filter(|item| match item {
                    Ok(d) => d.local_timestamp >= from,
                    Err(_) => true,
                })
                .map(|item| match item {
                    Ok(d) => Ok(d.clone()),
                    Err(CatalystError::MalformedRecord(record)) => {
                        Err(CatalystError::MalformedRecord(record.clone()))
                    }
                    Err(e) => Err(CatalystError::Network(e.to_string())),
                })
                .collect();
            Ok(stream::iter(items).boxed())
        }

        async fn list_snapshots(&self, _address: &str) -> Result<Vec<SnapshotMetadata>> {
            Ok(vec![])
        }
    }

    #[async_trait]
    impl ContentDownloader for ScriptedFetcher {
        async fn download(&self, _address: &str, hash: &str) -> Result<Vec<u8>> {
            Err(CatalystError::ContentUnavailable(hash.to_string()))
        }
    }

    fn client(items: Vec<Result<RemoteDeployment>>, mark: Timestamp) -> ContentServerClient {
        let fetcher = Arc::new(ScriptedFetcher { items });
        ContentServerClient::new("http://peer", mark, fetcher.clone(), fetcher)
    }

    #[tokio::test]
    async fn test_mark_moves_only_on_confirmation() {
        let client = client(vec![Ok(remote("a", 5)), Ok(remote("b", 9))], 0);
        assert_eq!(client.connection_state(), ConnectionState::NeverReached);

        let pulled: Vec<_> = client.get_new_deployments().collect().await;
        assert_eq!(pulled.len(), 2);
        assert_eq!(client.last_local_deployment_timestamp(), 0);
        assert_eq!(client.connection_state(), ConnectionState::Connected);

        assert_eq!(client.all_deployments_were_successful(), 9);
        assert_eq!(client.all_deployments_were_successful(), 9);
    }

    #[tokio::test]
    async fn test_pull_starts_after_mark() {
        let client = client(vec![Ok(remote("a", 5)), Ok(remote("b", 9))], 5);
        let pulled: Vec<_> = client.get_new_deployments().collect().await;
        assert_eq!(pulled.len(), 1);
        assert_eq!(pulled[0].as_ref().unwrap().entity.id, "b");
    }

    #[tokio::test]
    async fn test_error_ends_stream_and_discards_potential() {
        let client = client(
            vec![
                Ok(remote("a", 5)),
                Err(CatalystError::Network("reset".into())),
                Ok(remote("b", 9)),
            ],
            0,
        );
        let pulled: Vec<_> = client.get_new_deployments().collect().await;
        assert_eq!(pulled.len(), 2);
        assert!(pulled[1].is_err());
        // never connected, so the state does not become "lost"
        assert_eq!(client.connection_state(), ConnectionState::NeverReached);
        assert_eq!(client.all_deployments_were_successful(), 0);
    }

    #[tokio::test]
    async fn test_malformed_record_does_not_end_the_pull() {
        let malformed = CatalystError::MalformedRecord(Box::new(crate::types::MalformedRecord {
            record_key: "bad".into(),
            entity_type: None,
            local_timestamp: Some(7),
            reason: "unknown type".into(),
        }));
        let client = client(vec![Ok(remote("a", 5)), Err(malformed), Ok(remote("c", 9))], 0);

        let pulled: Vec<_> = client.get_new_deployments().collect().await;
        assert_eq!(pulled.len(), 3);
        assert!(matches!(pulled[1], Err(CatalystError::MalformedRecord(_))));
        assert_eq!(pulled[2].as_ref().unwrap().entity.id, "c");
        assert_eq!(client.connection_state(), ConnectionState::Connected);
        assert_eq!(client.all_deployments_were_successful(), 9);
    }

    #[tokio::test]
    async fn test_connection_lost_after_connected() {
        let ok = client(vec![Ok(remote("a", 5))], 0);
        let _: Vec<_> = ok.get_new_deployments().collect().await;
        assert_eq!(ok.connection_state(), ConnectionState::Connected);

        let failing = ContentServerClient {
            address: ok.address.clone(),
            fetcher: Arc::new(ScriptedFetcher {
                items: vec![Err(CatalystError::Network("down".into()))],
            }),
            downloader: ok.downloader.clone(),
            state: ok.state.clone(),
        };
        let _: Vec<_> = failing.get_new_deployments().collect().await;
        assert_eq!(ok.connection_state(), ConnectionState::ConnectionLost);
    }

    #[tokio::test]
    async fn test_partial_commit_respects_ceiling() {
        let client = client(vec![Ok(remote("a", 5)), Ok(remote("b", 9))], 0);
        let _: Vec<_> = client.get_new_deployments().collect().await;
        assert_eq!(client.deployments_successful_up_to(8), 8);
        assert_eq!(client.last_local_deployment_timestamp(), 8);
    }

    #[tokio::test]
    async fn test_download_gives_up_on_permanent_errors() {
        let client = client(vec![], 0);
        let err = client.download_content("sha256-x").await.unwrap_err();
        assert!(matches!(err, CatalystError::ContentUnavailable(_)));
    }
}
