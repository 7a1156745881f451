//! The parent/child seam between queues.
//!
//! A child only ever talks to its parent through [`RemoteQueue`]. Two
//! implementations exist and are picked at construction: a [`WorkQueue`]
//! in the same process, or an [`HttpQueueClient`] for a queue served by
//! [`crate::api`].
//!
//! [`WorkQueue`]: crate::queue::WorkQueue

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::policy::ElementReport;
use crate::scheduler::{ElementId, ElementSelector, ElementStatus, ForcedStatus, SiteCapacity};
use crate::workload::Workload;

pub use http::HttpQueueClient;

/// One element handed out by `get_work`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedWork {
    /// Id in the queue that handed the work out; a child stores it as the
    /// element's parent queue id.
    pub element_id: ElementId,
    pub workload_name: String,
    pub task_name: String,
    pub owner: String,
    pub spec_url: String,
    pub site: String,
    /// The split spec itself, so the receiver does not need the sender's disk.
    #[serde(default)]
    pub workload: Option<Workload>,
    pub subscription_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetWorkRequest {
    pub site_capacity: SiteCapacity,
    #[serde(default)]
    pub caller_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynchronizeRequest {
    pub child_url: String,
    pub reports: Vec<ElementReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueWorkRequest {
    pub url: String,
    #[serde(default)]
    pub parent_queue_id: Option<ElementId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueWorkResponse {
    pub units: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetStatusRequest {
    pub status: ElementStatus,
    pub selector: ElementSelector,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetPriorityRequest {
    pub priority: u32,
    pub workflows: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatedResponse {
    pub updated: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Operations a child calls on its parent.
#[async_trait]
pub trait RemoteQueue: Send + Sync {
    /// Ask for work for `resources`; `caller_url` identifies the child.
    async fn get_work(
        &self,
        resources: &SiteCapacity,
        caller_url: &str,
    ) -> Result<Vec<MatchedWork>>;

    /// Report child status; returns statuses the child must force locally.
    async fn synchronize(
        &self,
        child_url: &str,
        reports: &[ElementReport],
    ) -> Result<ForcedStatus>;
}
