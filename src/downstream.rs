//! Downstream execution system collaborator.
//!
//! When a queue hands out work with `PopulateFilesets` enabled it creates a
//! subscription for the element in the downstream system, fills it with the
//! input block's files and commits it. Subscriptions created during a
//! `get_work` that ends up failing are discarded again.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkQueueError};

pub type SubscriptionId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub workload: String,
    pub spec_url: String,
    pub owner: String,
    pub task: String,
    /// Input block, `None` for production work.
    pub input: Option<String>,
    pub site_whitelist: BTreeSet<String>,
    pub site_blacklist: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownstreamFile {
    pub lfn: String,
    pub size: u64,
    pub events: u64,
    /// Checksum type -> value (`cksum`, `adler32`).
    pub checksums: BTreeMap<String, String>,
    pub parents: Vec<String>,
    pub locations: BTreeSet<String>,
}

pub trait Downstream: Send + Sync {
    fn create_subscription(&self, request: &SubscriptionRequest) -> Result<SubscriptionId>;

    fn add_files(&self, subscription: SubscriptionId, files: Vec<DownstreamFile>) -> Result<()>;

    fn commit(&self, subscription: SubscriptionId) -> Result<()>;

    /// Drop an uncommitted or rolled-back subscription.
    fn discard(&self, subscription: SubscriptionId);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRecord {
    pub id: SubscriptionId,
    pub request: SubscriptionRequest,
    pub files: Vec<DownstreamFile>,
    pub committed: bool,
}

#[derive(Debug, Default)]
struct DownstreamState {
    next_id: SubscriptionId,
    subscriptions: BTreeMap<SubscriptionId, SubscriptionRecord>,
    fail_creates_for: BTreeSet<String>,
}

/// Downstream system kept in memory. Creation can be made to fail for a given
/// workload to exercise rollback.
#[derive(Debug, Default)]
pub struct InMemoryDownstream {
    state: Mutex<DownstreamState>,
}

impl InMemoryDownstream {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, DownstreamState>> {
        self.state
            .lock()
            .map_err(|_| WorkQueueError::Internal("downstream lock poisoned".to_string()))
    }

    pub fn fail_creates_for(&self, workload: &str) {
        if let Ok(mut state) = self.lock() {
            state.fail_creates_for.insert(workload.to_string());
        }
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionRecord> {
        self.lock()
            .map(|s| s.subscriptions.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, id: SubscriptionId) -> Option<SubscriptionRecord> {
        self.lock().ok()?.subscriptions.get(&id).cloned()
    }
}

impl Downstream for InMemoryDownstream {
    fn create_subscription(&self, request: &SubscriptionRequest) -> Result<SubscriptionId> {
        let mut state = self.lock()?;
        if state.fail_creates_for.contains(&request.workload) {
            return Err(WorkQueueError::DownstreamPreparation(format!(
                "cannot create subscription for {}",
                request.workload
            )));
        }
        state.next_id += 1;
        let id = state.next_id;
        state.subscriptions.insert(
            id,
            SubscriptionRecord {
                id,
                request: request.clone(),
                files: Vec::new(),
                committed: false,
            },
        );
        tracing::debug!(
            subscription = id,
            workload = %request.workload,
            task = %request.task,
            "Subscription created"
        );
        Ok(id)
    }

    fn add_files(&self, subscription: SubscriptionId, files: Vec<DownstreamFile>) -> Result<()> {
        let mut state = self.lock()?;
        let record = state.subscriptions.get_mut(&subscription).ok_or_else(|| {
            WorkQueueError::DownstreamPreparation(format!("no subscription {}", subscription))
        })?;
        record.files.extend(files);
        Ok(())
    }

    fn commit(&self, subscription: SubscriptionId) -> Result<()> {
        let mut state = self.lock()?;
        let record = state.subscriptions.get_mut(&subscription).ok_or_else(|| {
            WorkQueueError::DownstreamPreparation(format!("no subscription {}", subscription))
        })?;
        record.committed = true;
        Ok(())
    }

    fn discard(&self, subscription: SubscriptionId) {
        if let Ok(mut state) = self.lock() {
            state.subscriptions.remove(&subscription);
        }
    }
}
