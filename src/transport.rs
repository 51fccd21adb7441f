//! Collaborator ports for talking to other content servers
//!
//! Everything the node needs from the outside world goes through these traits:
//! peer discovery, the deployment history stream, content downloads and the
//! identity challenge. [`HttpTransport`] implements the network-facing ones
//! over HTTP; tests substitute in-memory fakes.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::blob_store::BlobStore;
use crate::error::{CatalystError, Result};
use crate::types::{EntityType, MalformedRecord, RemoteDeployment, SnapshotMetadata, Timestamp};

/// Directory of known content servers
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    async fn list_peers(&self) -> Result<Vec<String>>;
}

/// Pulls deployment history and snapshot listings from a peer
#[async_trait]
pub trait DeploymentFetcher: Send + Sync {
    /// Lazily stream every deployment the peer recorded with local timestamp
    /// `>= from_local_timestamp`, in the peer's local timestamp order.
    async fn stream_deployments(
        &self,
        address: &str,
        from_local_timestamp: Timestamp,
    ) -> Result<BoxStream<'static, Result<RemoteDeployment>>>;

    async fn list_snapshots(&self, address: &str) -> Result<Vec<SnapshotMetadata>>;
}

/// Fetches content-addressed files from a peer
#[async_trait]
pub trait ContentDownloader: Send + Sync {
    async fn download(&self, address: &str, hash: &str) -> Result<Vec<u8>>;
}

/// Request/response primitive for the identity challenge
#[async_trait]
pub trait ChallengeTransport: Send + Sync {
    /// Send `token` to the peer and return what it answers
    async fn echo(&self, address: &str, token: &str) -> Result<String>;
}

/// Directory backed by a fixed list, editable at runtime
#[derive(Debug, Default)]
pub struct StaticPeerDirectory {
    peers: RwLock<Vec<String>>,
}

impl StaticPeerDirectory {
    pub fn new<I, S>(peers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            peers: RwLock::new(peers.into_iter().map(Into::into).collect()),
        }
    }

    pub fn add(&self, address: impl Into<String>) {
        let address = address.into();
        if let Ok(mut peers) = self.peers.write() {
            if !peers.contains(&address) {
                peers.push(address);
            }
        }
    }

    pub fn remove(&self, address: &str) {
        if let Ok(mut peers) = self.peers.write() {
            peers.retain(|p| p != address);
        }
    }
}

#[async_trait]
impl PeerDirectory for StaticPeerDirectory {
    async fn list_peers(&self) -> Result<Vec<String>> {
        self.peers
            .read()
            .map(|peers| peers.clone())
            .map_err(|e| CatalystError::Internal(format!("Lock poisoned: {}", e)))
    }
}

/// Normalise a peer address for comparison: no trailing slash, lower-case
pub fn normalize_address(address: &str) -> String {
    address.trim().trim_end_matches('/').to_lowercase()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChallengeResponse {
    challenge_text: String,
}

/// HTTP implementation of the peer-facing ports
///
/// Endpoints, relative to the peer address:
/// - `GET /pointer-changes?from=<ts>` newline-delimited JSON deployments
/// - `GET /snapshots` JSON array of snapshot metadata
/// - `GET /contents/<hash>` raw bytes
/// - `GET /challenge?token=<t>` `{"challengeText": "<t>"}`
pub struct HttpTransport {
    client: Client,
    stream_timeout: Duration,
}

impl HttpTransport {
    pub fn new(request_timeout: Duration, stream_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("catalyst-content/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CatalystError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            stream_timeout,
        })
    }

    fn endpoint(address: &str, path: &str) -> Result<Url> {
        Url::parse(&format!("{}/{}", address.trim_end_matches('/'), path))
            .map_err(|e| CatalystError::Parse(format!("Invalid peer address {}: {}", address, e)))
    }

    fn request_error(address: &str, e: reqwest::Error) -> CatalystError {
        if e.is_timeout() {
            CatalystError::Timeout(format!("{}: {}", address, e))
        } else {
            CatalystError::Network(format!("{}: {}", address, e))
        }
    }

    async fn get(&self, url: Url, timeout: Option<Duration>) -> Result<reqwest::Response> {
        let address = url.origin().ascii_serialization();
        let mut request = self.client.get(url);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Self::request_error(&address, e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(CatalystError::NotFound(response.url().to_string()));
        }
        if !response.status().is_success() {
            return Err(CatalystError::Network(format!(
                "{} returned HTTP {}",
                response.url(),
                response.status()
            )));
        }
        Ok(response)
    }
}

/// Read one history line as a deployment.
///
/// A line that does not parse becomes [`CatalystError::MalformedRecord`],
/// carrying whatever of its entity id, type and local timestamp is readable.
pub fn parse_record(line: &[u8], address: &str) -> Result<RemoteDeployment> {
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    let line = &line[..end];

    let error = match serde_json::from_slice::<RemoteDeployment>(line) {
        Ok(deployment) => return Ok(deployment),
        Err(e) => e,
    };

    let value = serde_json::from_slice::<serde_json::Value>(line).ok();
    let field = |path: &[&str]| {
        let mut current = value.as_ref()?;
        for key in path {
            current = current.get(*key)?;
        }
        Some(current.clone())
    };

    let record_key = field(&["entity", "id"])
        .and_then(|v| v.as_str().map(str::to_string))
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| BlobStore::compute_hash(line));
    let entity_type = field(&["entity", "type"])
        .and_then(|v| v.as_str().and_then(|t| t.parse::<EntityType>().ok()));
    let local_timestamp = field(&["localTimestamp"]).and_then(|v| v.as_u64());

    Err(CatalystError::MalformedRecord(Box::new(MalformedRecord {
        record_key,
        entity_type,
        local_timestamp,
        reason: format!("Bad record from {}: {}", address, error),
    })))
}

/// Split a byte stream into newline-delimited JSON records
fn ndjson_records(
    response: reqwest::Response,
    address: String,
) -> BoxStream<'static, Result<RemoteDeployment>> {
    let bytes = response.bytes_stream().boxed();

    stream::unfold(
        (bytes, Vec::<u8>::new(), false),
        move |(mut bytes, mut buffer, finished)| {
            let address = address.clone();
            async move {
                if finished {
                    return None;
                }
                loop {
                    if let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                        let line: Vec<u8> = buffer.drain(..=pos).collect();
                        if line.iter().all(u8::is_ascii_whitespace) {
                            continue;
                        }
                        let record = parse_record(&line, &address);
                        return Some((record, (bytes, buffer, false)));
                    }

                    match bytes.next().await {
                        Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                        Some(Err(e)) => {
                            let error = HttpTransport::request_error(&address, e);
                            return Some((Err(error), (bytes, Vec::new(), true)));
                        }
                        None => {
                            if buffer.iter().all(u8::is_ascii_whitespace) {
                                return None;
                            }
                            let record = parse_record(&buffer, &address);
                            return Some((record, (bytes, Vec::new(), true)));
                        }
                    }
                }
            }
        },
    )
    .boxed()
}

#[async_trait]
impl DeploymentFetcher for HttpTransport {
    async fn stream_deployments(
        &self,
        address: &str,
        from_local_timestamp: Timestamp,
    ) -> Result<BoxStream<'static, Result<RemoteDeployment>>> {
        let mut url = Self::endpoint(address, "pointer-changes")?;
        url.query_pairs_mut()
            .append_pair("from", &from_local_timestamp.to_string());

        debug!(peer = %address, from = from_local_timestamp, "Opening deployment stream");
        let response = self.get(url, Some(self.stream_timeout)).await?;
        Ok(ndjson_records(response, address.to_string()))
    }

    async fn list_snapshots(&self, address: &str) -> Result<Vec<SnapshotMetadata>> {
        let url = Self::endpoint(address, "snapshots")?;
        let response = self.get(url, None).await?;
        response
            .json()
            .await
            .map_err(|e| Self::request_error(address, e))
    }
}

#[async_trait]
impl ContentDownloader for HttpTransport {
    async fn download(&self, address: &str, hash: &str) -> Result<Vec<u8>> {
        let url = Self::endpoint(address, &format!("contents/{}", hash))?;
        let response = match self.get(url, None).await {
            Err(CatalystError::NotFound(_)) => {
                return Err(CatalystError::ContentUnavailable(format!("{} not on {}", hash, address)))
            }
            other => other?,
        };
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Self::request_error(address, e))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl ChallengeTransport for HttpTransport {
    async fn echo(&self, address: &str, token: &str) -> Result<String> {
        let mut url = Self::endpoint(address, "challenge")?;
        url.query_pairs_mut().append_pair("token", token);
        let response = self
            .get(url, None)
            .await
            .map_err(|e| CatalystError::Challenge(format!("{}: {}", address, e)))?;
        let body: ChallengeResponse = response
            .json()
            .await
            .map_err(|e| CatalystError::Challenge(format!("{}: {}", address, e)))?;
        Ok(body.challenge_text)
    }
}
