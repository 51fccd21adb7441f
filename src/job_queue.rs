//! Bounded-concurrency job queue and pointer-keyed execution lanes
//!
//! The queue caps how many deployment jobs run at once across the node.
//! [`PointerLocks`] serializes jobs that touch a common `(type, pointer)` so
//! tombstoning is single-writer per pointer; unrelated pointers run in parallel.

use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{CatalystError, Result};

pub struct JobQueue {
    semaphore: Arc<Semaphore>,
    concurrency: u32,
    closed: AtomicBool,
}

impl JobQueue {
    pub fn new(concurrency: usize) -> Self {
        let concurrency = concurrency.clamp(1, u16::MAX as usize) as u32;
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency as usize)),
            concurrency,
            closed: AtomicBool::new(false),
        }
    }

    /// Schedule a job, waiting for a free slot when the queue is full.
    ///
    /// The slot is held until the job finishes.
    pub async fn schedule<F, T>(&self, job: F) -> Result<JoinHandle<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CatalystError::Internal("Job queue closed".into()));
        }

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CatalystError::Internal("Job queue semaphore closed".into()))?;

        Ok(tokio::spawn(async move {
            let output = job.await;
            drop(permit);
            output
        }))
    }

    /// Jobs currently running
    pub fn in_flight(&self) -> usize {
        self.concurrency as usize - self.semaphore.available_permits()
    }

    /// Stop accepting jobs and wait for in-flight ones to finish
    pub async fn drain(&self) {
        self.closed.store(true, Ordering::SeqCst);
        debug!(in_flight = self.in_flight(), "Draining job queue");
        if let Ok(all) = self.semaphore.acquire_many(self.concurrency).await {
            drop(all);
        }
        self.semaphore.close();
    }
}

const LOCK_STRIPES: usize = 256;

/// Striped per-pointer mutexes
pub struct PointerLocks {
    stripes: Vec<Arc<Mutex<()>>>,
}

/// Held while a job owns its pointers
pub struct PointerGuard {
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl Default for PointerLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl PointerLocks {
    pub fn new() -> Self {
        Self {
            stripes: (0..LOCK_STRIPES).map(|_| Arc::new(Mutex::new(()))).collect(),
        }
    }

    fn stripe(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.stripes.len() as u64) as usize
    }

    /// Lock every stripe covering `keys`.
    ///
    /// Stripes are taken in ascending order so two jobs with overlapping
    /// pointer sets cannot deadlock.
    pub async fn lock<I, S>(&self, keys: I) -> PointerGuard
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut indexes: Vec<usize> = keys.into_iter().map(|k| self.stripe(k.as_ref())).collect();
        indexes.sort_unstable();
        indexes.dedup();

        let mut guards = Vec::with_capacity(indexes.len());
        for index in indexes {
            guards.push(self.stripes[index].clone().lock_owned().await);
        }
        PointerGuard { _guards: guards }
    }
}
