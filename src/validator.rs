//! Deployment validation port
//!
//! Signature and auth-chain verification happen outside this crate; the
//! default [`StructuralValidator`] only rejects entities that cannot be stored
//! meaningfully.

use async_trait::async_trait;

use crate::error::{CatalystError, Result};
use crate::types::RemoteDeployment;

#[async_trait]
pub trait EntityValidator: Send + Sync {
    /// `Err(CatalystError::Validation)` when the deployment must be rejected
    async fn validate(&self, deployment: &RemoteDeployment) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StructuralValidator;

#[async_trait]
impl EntityValidator for StructuralValidator {
    async fn validate(&self, deployment: &RemoteDeployment) -> Result<()> {
        let entity = &deployment.entity;
        let mut errors = Vec::new();

        if entity.id.trim().is_empty() {
            errors.push("entity id is empty".to_string());
        }
        if entity.pointers.is_empty() {
            errors.push("entity has no pointers".to_string());
        }
        if entity.pointers.iter().any(|p| p.trim().is_empty()) {
            errors.push("entity has an empty pointer".to_string());
        }
        if entity.normalized_pointers().len() != entity.pointers.len() {
            errors.push("entity has duplicate pointers".to_string());
        }
        if entity.auth_chain.is_empty() {
            errors.push("auth chain is empty".to_string());
        }
        for content in &entity.content {
            if content.hash.trim().is_empty() {
                errors.push(format!("content file {} has no hash", content.file));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CatalystError::Validation(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AuthLink, ContentMapping, Entity, EntityType};

    fn deployment(pointers: &[&str], auth: bool) -> RemoteDeployment {
        RemoteDeployment {
            entity: Entity {
                id: "bafy1".into(),
                entity_type: EntityType::Wearable,
                pointers: pointers.iter().map(|p| p.to_string()).collect(),
                timestamp: 1,
                content: vec![ContentMapping {
                    file: "model.glb".into(),
                    hash: "sha256-00".into(),
                }],
                metadata: None,
                auth_chain: if auth {
                    vec![AuthLink {
                        kind: "SIGNER".into(),
                        payload: "0xabc".into(),
                        signature: String::new(),
                    }]
                } else {
                    vec![]
                },
            },
            local_timestamp: 1,
        }
    }

    #[tokio::test]
    async fn test_accepts_well_formed() {
        assert!(StructuralValidator.validate(&deployment(&["urn:a"], true)).await.is_ok());
    }

    #[tokio::test]
    async fn test_rejects_with_all_reasons() {
        let err = StructuralValidator
            .validate(&deployment(&["urn:a", "URN:A"], false))
            .await
            .unwrap_err();
        match err {
            CatalystError::Validation(reasons) => {
                assert_eq!(reasons.len(), 2);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
