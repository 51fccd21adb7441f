//! Failed deployment retries
//!
//! Any deployment that cannot be ingested is persisted with a classified
//! reason. A periodic sweep re-drives entries older than the retry delay
//! through the normal ingestion path. Validation failures are only retried
//! when configured as retryable.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::{failed, ContentDb};
use crate::deployer::Deployer;
use crate::error::{CatalystError, Result};
use crate::types::{FailedDeployment, FailureReason, MalformedRecord, RemoteDeployment};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryReport {
    pub succeeded: usize,
    pub still_failing: usize,
    /// Entries not yet due or not retryable
    pub skipped: usize,
}

pub struct RetryManager {
    db: Arc<ContentDb>,
    deployer: Arc<Deployer>,
    retry_delay: Duration,
    retry_validation_failures: bool,
}

impl RetryManager {
    pub fn new(
        db: Arc<ContentDb>,
        deployer: Arc<Deployer>,
        retry_delay: Duration,
        retry_validation_failures: bool,
    ) -> Self {
        Self {
            db,
            deployer,
            retry_delay,
            retry_validation_failures,
        }
    }

    pub fn is_retryable(&self, reason: FailureReason) -> bool {
        reason != FailureReason::Validation || self.retry_validation_failures
    }

    /// Persist a failure. Repeated failures of the same entity bump its retry count.
    pub fn report_failure(
        &self,
        deployment: &RemoteDeployment,
        origin: &str,
        error: &CatalystError,
    ) -> Result<FailedDeployment> {
        let entity = &deployment.entity;
        let previous = self.db.with_conn(|conn| failed::get_failed(conn, &entity.id))?;

        let record = FailedDeployment {
            entity_id: entity.id.clone(),
            entity_type: Some(entity.entity_type),
            reason: FailureReason::classify(error),
            error_description: error.to_string(),
            failure_timestamp: self.deployer.clock().now(),
            retry_count: previous.map(|p| p.retry_count + 1).unwrap_or(0),
            origin_server: origin.to_string(),
            deployment: Some(deployment.clone()),
        };
        self.db.with_conn(|conn| failed::save_failed(conn, &record))?;

        warn!(
            entity_id = %record.entity_id,
            origin = %origin,
            reason = record.reason.as_str(),
            retry_count = record.retry_count,
            error = %error,
            "Deployment failed"
        );
        Ok(record)
    }

    /// Persist a history record that could not be read. It is kept for
    /// inspection and never re-driven.
    pub fn report_malformed(&self, malformed: &MalformedRecord, origin: &str) -> Result<FailedDeployment> {
        let previous = self
            .db
            .with_conn(|conn| failed::get_failed(conn, &malformed.record_key))?;

        let record = FailedDeployment {
            entity_id: malformed.record_key.clone(),
            entity_type: malformed.entity_type,
            reason: FailureReason::Validation,
            error_description: malformed.reason.clone(),
            failure_timestamp: self.deployer.clock().now(),
            retry_count: previous.map(|p| p.retry_count + 1).unwrap_or(0),
            origin_server: origin.to_string(),
            deployment: None,
        };
        self.db.with_conn(|conn| failed::save_failed(conn, &record))?;

        warn!(
            record = %record.entity_id,
            origin = %origin,
            local_timestamp = ?malformed.local_timestamp,
            reason = %malformed.reason,
            "Malformed record"
        );
        Ok(record)
    }

    /// Drop the failure record once the entity made it in by any path
    pub fn resolve(&self, entity_id: &str) -> Result<bool> {
        self.db.with_conn(|conn| failed::remove_failed(conn, entity_id))
    }

    pub fn list_failed(&self) -> Result<Vec<FailedDeployment>> {
        self.db.with_conn(failed::list_failed)
    }

    pub fn get_failed(&self, entity_id: &str) -> Result<Option<FailedDeployment>> {
        self.db.with_conn(|conn| failed::get_failed(conn, entity_id))
    }

    /// Manual removal, e.g. for an entity known to be permanently broken
    pub fn remove_failed(&self, entity_id: &str) -> Result<bool> {
        let removed = self.resolve(entity_id)?;
        if removed {
            info!(entity_id = %entity_id, "Removed failed deployment");
        }
        Ok(removed)
    }

    /// Retry every due, retryable failure once
    pub async fn retry_failed_deployments(&self) -> Result<RetryReport> {
        let now = self.deployer.clock().now();
        let delay = self.retry_delay.as_millis() as u64;
        let mut report = RetryReport::default();

        for entry in self.list_failed()? {
            let deployment = match &entry.deployment {
                Some(deployment) if self.is_retryable(entry.reason) => deployment,
                _ => {
                    report.skipped += 1;
                    continue;
                }
            };
            if now.saturating_sub(entry.failure_timestamp) < delay {
                report.skipped += 1;
                continue;
            }

            match self.deployer.deploy_remote(deployment, &entry.origin_server).await {
                Ok(_) => {
                    if let Err(e) = self.resolve(&entry.entity_id) {
                        warn!(entity_id = %entry.entity_id, error = %e, "Could not clear failure record");
                    }
                    debug!(entity_id = %entry.entity_id, "Retried deployment succeeded");
                    report.succeeded += 1;
                }
                Err(e) => {
                    if let Err(db_error) = self.report_failure(deployment, &entry.origin_server, &e) {
                        warn!(entity_id = %entry.entity_id, error = %db_error, "Could not update failure record");
                    }
                    report.still_failing += 1;
                }
            }
        }

        if report.succeeded + report.still_failing > 0 {
            info!(
                succeeded = report.succeeded,
                still_failing = report.still_failing,
                skipped = report.skipped,
                "Retried failed deployments"
            );
        }
        Ok(report)
    }
}
