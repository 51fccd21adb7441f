//! Active-pointer resolution
//!
//! At most one deployment is active per `(type, pointer)`. Between two deployments
//! sharing a pointer, the one with the greater `(timestamp, entity_id)` wins.
//! Because the order is total, every node reaches the same active set no matter
//! in which order peers deliver deployments.
//!
//! Resolution is evaluated against every deployment in history that shares a
//! pointer with the candidate, not only live ones. A candidate that lost to a
//! newer entity still supersedes older live entities on its other pointers,
//! which keeps the outcome independent of arrival order for multi-pointer
//! entities.

use std::cmp::Ordering;

use crate::types::{DeploymentId, Entity, EntityId, Timestamp};

/// Total order over entities competing for a pointer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityOrderKey {
    pub timestamp: Timestamp,
    pub entity_id: EntityId,
}

impl EntityOrderKey {
    pub fn new(timestamp: Timestamp, entity_id: impl Into<EntityId>) -> Self {
        Self {
            timestamp,
            entity_id: entity_id.into(),
        }
    }

    pub fn of(entity: &Entity) -> Self {
        Self::new(entity.timestamp, entity.id.clone())
    }
}

/// A stored deployment sharing at least one pointer with the candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointerCandidate {
    pub deployment_id: DeploymentId,
    pub key: EntityOrderKey,
    pub active: bool,
}

/// Outcome of accepting a candidate deployment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Set when the candidate is born superseded
    pub superseded_by: Option<DeploymentId>,
    /// Live deployments the candidate supersedes
    pub tombstone: Vec<DeploymentId>,
}

impl Resolution {
    pub fn candidate_is_active(&self) -> bool {
        self.superseded_by.is_none()
    }
}

/// Compute which deployments change state when `candidate` is accepted.
///
/// Entries with the candidate's own key are ignored.
pub fn resolve(candidate: &EntityOrderKey, overlapping: &[PointerCandidate]) -> Resolution {
    let superseded_by = overlapping
        .iter()
        .filter(|other| other.key.cmp(candidate) == Ordering::Greater)
        .max_by(|a, b| a.key.cmp(&b.key))
        .map(|winner| winner.deployment_id);

    let mut tombstone: Vec<DeploymentId> = overlapping
        .iter()
        .filter(|other| other.active && other.key.cmp(candidate) == Ordering::Less)
        .map(|other| other.deployment_id)
        .collect();
    tombstone.sort_unstable();
    tombstone.dedup();

    Resolution {
        superseded_by,
        tombstone,
    }
}
