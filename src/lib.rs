//! Catalyst Content - sync, snapshot and garbage collection engine for a
//! content server node
//!
//! Each node accepts signed entity deployments, pulls the deployment history
//! of its peers and converges with them on which entity is active at each
//! pointer. History is periodically compressed into content-hashed snapshots
//! that late joiners bootstrap from.
//!
//! ## Flow
//!
//! - **Cluster**: peers come from a directory and must pass an echo challenge
//! - **Synchronizer**: one streaming pull per peer, from that peer's mark
//! - **Deployer**: validates, downloads content, resolves pointers, persists
//! - **Snapshots**: time-ranged manifests, rebuilt when late data lands in range
//! - **GC**: deletes blobs no active entity or current snapshot references
//! - **Retry**: failed deployments are persisted and re-driven on a timer
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/catalyst-content/
//! ├── blobs/                 # Content files, entity files, snapshot manifests
//! │   └── sha2/sha256-...    # First 4 chars of hash as subdirs
//! ├── content.db             # SQLite: deployments, pointers, snapshots, failures
//! └── config.toml            # Configuration
//! ```

// Data model
pub mod types;
pub mod time_range;
pub mod error;
pub mod clock;

// Storage
pub mod blob_store;
pub mod bloom;
pub mod db;

// Ingestion
pub mod pointers;
pub mod job_queue;
pub mod validator;
pub mod deployer;
pub mod retry;

// Peers
pub mod transport;
pub mod client;
pub mod cluster;
pub mod synchronizer;

// Maintenance
pub mod snapshots;
pub mod gc;

pub mod config;
pub mod node;

// Re-exports
pub use blob_store::{BlobStore, ContentStorage, StoredBlob};
pub use client::{ConnectionState, ContentServerClient};
pub use clock::{Clock, ManualClock, SystemClock};
pub use cluster::ContentCluster;
pub use config::Config;
pub use db::ContentDb;
pub use deployer::{DeployOutcome, Deployer};
pub use error::{CatalystError, Result};
pub use gc::{GarbageCollector, GcReport};
pub use node::{CatalystNode, Collaborators};
pub use retry::RetryManager;
pub use snapshots::{SnapshotManager, SnapshotSettings};
pub use synchronizer::{SynchronizationState, Synchronizer};
pub use time_range::TimeRange;
pub use types::{
    Deployment, Entity, EntityType, FailedDeployment, FailureReason, RemoteDeployment, SnapshotEntry,
    SnapshotMetadata, Timestamp,
};
