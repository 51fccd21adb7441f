//! Core data model: entities, deployments, snapshots
//!
//! Entities are immutable and identified by their content hash. A deployment is
//! the record of one entity being accepted by this node; history is append-only
//! and supersession is expressed through [`DeletionState`], never by removing rows.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CatalystError;
use crate::time_range::TimeRange;

/// Milliseconds since the unix epoch
pub type Timestamp = u64;

/// Row id of a deployment in the local store
pub type DeploymentId = i64;

/// Content hash identifying an entity
pub type EntityId = String;

/// Origin recorded for deployments authored on this node
pub const LOCAL_ORIGIN: &str = "local";

/// Kind of entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Scene,
    Profile,
    Wearable,
    Store,
    Emote,
    Outfits,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Scene => "scene",
            EntityType::Profile => "profile",
            EntityType::Wearable => "wearable",
            EntityType::Store => "store",
            EntityType::Emote => "emote",
            EntityType::Outfits => "outfits",
        }
    }

    fn from_exact(s: &str) -> Option<Self> {
        match s {
            "scene" => Some(EntityType::Scene),
            "profile" => Some(EntityType::Profile),
            "wearable" => Some(EntityType::Wearable),
            "store" => Some(EntityType::Store),
            "emote" => Some(EntityType::Emote),
            "outfits" | "outfit" => Some(EntityType::Outfits),
            _ => None,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = CatalystError;

    /// Accepts any case and a trailing plural `s` ("Scenes" -> Scene)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        Self::from_exact(&normalized)
            .or_else(|| normalized.strip_suffix('s').and_then(Self::from_exact))
            .ok_or_else(|| CatalystError::Parse(format!("Unknown entity type: {}", s)))
    }
}

/// A file of an entity, by name and content hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentMapping {
    pub file: String,
    pub hash: String,
}

/// One link of an ownership proof. Verified externally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthLink {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: String,
    #[serde(default)]
    pub signature: String,
}

/// Immutable entity as deployed by its author
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: EntityId,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub pointers: Vec<String>,
    /// Author-asserted logical time
    pub timestamp: Timestamp,
    #[serde(default)]
    pub content: Vec<ContentMapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub auth_chain: Vec<AuthLink>,
}

impl Entity {
    /// Pointers lower-cased, duplicates removed, original order kept
    pub fn normalized_pointers(&self) -> Vec<String> {
        let mut seen = Vec::with_capacity(self.pointers.len());
        for pointer in &self.pointers {
            let pointer = pointer.trim().to_lowercase();
            if !seen.contains(&pointer) {
                seen.push(pointer);
            }
        }
        seen
    }

    /// Hashes of all content files
    pub fn content_hashes(&self) -> impl Iterator<Item = &str> {
        self.content.iter().map(|c| c.hash.as_str())
    }

    /// Canonical bytes stored in blob storage under the entity id
    pub fn to_bytes(&self) -> Result<Vec<u8>, CatalystError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CatalystError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Whether a deployment is the active one for its pointers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletionState {
    Active,
    SupersededBy(DeploymentId),
}

impl DeletionState {
    pub fn from_deleter(deleter: Option<DeploymentId>) -> Self {
        match deleter {
            Some(id) => DeletionState::SupersededBy(id),
            None => DeletionState::Active,
        }
    }

    pub fn deleter(&self) -> Option<DeploymentId> {
        match self {
            DeletionState::Active => None,
            DeletionState::SupersededBy(id) => Some(*id),
        }
    }
}

/// An entity accepted by this node
#[derive(Debug, Clone, PartialEq)]
pub struct Deployment {
    pub id: DeploymentId,
    pub entity: Entity,
    /// Peer that told us about it, or [`LOCAL_ORIGIN`]
    pub origin_server: String,
    /// When this node first durably recorded it. Assigned once.
    pub local_timestamp: Timestamp,
    pub deletion: DeletionState,
}

impl Deployment {
    pub fn is_active(&self) -> bool {
        self.deletion == DeletionState::Active
    }
}

/// A deployment record as served by a peer's history stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDeployment {
    pub entity: Entity,
    /// The peer's own local timestamp for this deployment
    pub local_timestamp: Timestamp,
}

/// A history record that could not be read as a deployment.
///
/// Whatever could still be recovered from the raw line is kept so the record
/// can be logged as failed and the pull can move past it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedRecord {
    /// Entity id when present, otherwise the hash of the raw line
    pub record_key: String,
    pub entity_type: Option<EntityType>,
    pub local_timestamp: Option<Timestamp>,
    pub reason: String,
}

impl fmt::Display for MalformedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.record_key, self.reason)
    }
}

/// Metadata of a persisted snapshot manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub hash: String,
    pub time_range: TimeRange,
    #[serde(default)]
    pub replaced_snapshot_hashes: Vec<String>,
    pub number_of_entities: u64,
    /// Local-timestamp cursor at which the manifest was computed
    pub generation_timestamp: Timestamp,
}

/// One line of a snapshot manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    pub entity_id: EntityId,
    pub entity_type: EntityType,
    pub pointers: Vec<String>,
    pub auth_chain: Vec<AuthLink>,
    pub entity_timestamp: Timestamp,
}

/// Why a deployment could not be ingested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Rejected by the validator
    Validation,
    /// A content file could not be fetched from the origin peer
    ContentUnavailable,
    /// Blob store or database write failed
    Storage,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Validation => "validation",
            FailureReason::ContentUnavailable => "content_unavailable",
            FailureReason::Storage => "storage",
        }
    }

    pub fn classify(error: &CatalystError) -> Self {
        match error {
            CatalystError::Validation(_)
            | CatalystError::Parse(_)
            | CatalystError::MalformedRecord(_) => FailureReason::Validation,
            CatalystError::ContentUnavailable(_)
            | CatalystError::Network(_)
            | CatalystError::Timeout(_)
            | CatalystError::Http(_)
            | CatalystError::HashMismatch { .. } => FailureReason::ContentUnavailable,
            _ => FailureReason::Storage,
        }
    }
}

impl FromStr for FailureReason {
    type Err = CatalystError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "validation" => Ok(FailureReason::Validation),
            "content_unavailable" => Ok(FailureReason::ContentUnavailable),
            "storage" => Ok(FailureReason::Storage),
            other => Err(CatalystError::Parse(format!("Unknown failure reason: {}", other))),
        }
    }
}

/// A deployment that failed ingestion and waits for a retry
#[derive(Debug, Clone, PartialEq)]
pub struct FailedDeployment {
    /// Entity id, or the record key of a record that could not be read
    pub entity_id: EntityId,
    pub entity_type: Option<EntityType>,
    pub reason: FailureReason,
    pub error_description: String,
    pub failure_timestamp: Timestamp,
    pub retry_count: u32,
    pub origin_server: String,
    /// `None` for records that never parsed; those cannot be re-driven
    pub deployment: Option<RemoteDeployment>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_type_parsing() {
        assert_eq!("scene".parse::<EntityType>().unwrap(), EntityType::Scene);
        assert_eq!("Scenes".parse::<EntityType>().unwrap(), EntityType::Scene);
        assert_eq!(" PROFILE ".parse::<EntityType>().unwrap(), EntityType::Profile);
        assert_eq!("outfits".parse::<EntityType>().unwrap(), EntityType::Outfits);
        assert!("planet".parse::<EntityType>().is_err());
    }

    #[test]
    fn test_normalized_pointers() {
        let entity = Entity {
            id: "bafy1".into(),
            entity_type: EntityType::Scene,
            pointers: vec!["0,0".into(), "0,1".into(), " 0,0".into(), "ABC".into()],
            timestamp: 1,
            content: vec![],
            metadata: None,
            auth_chain: vec![],
        };
        assert_eq!(entity.normalized_pointers(), vec!["0,0", "0,1", "abc"]);
    }

    #[test]
    fn test_failure_classification() {
        assert_eq!(
            FailureReason::classify(&CatalystError::Validation(vec!["bad".into()])),
            FailureReason::Validation
        );
        assert_eq!(
            FailureReason::classify(&CatalystError::ContentUnavailable("h".into())),
            FailureReason::ContentUnavailable
        );
        assert_eq!(
            FailureReason::classify(&CatalystError::Database("locked".into())),
            FailureReason::Storage
        );
    }
}
