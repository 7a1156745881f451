use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, WorkQueueError};
use crate::policy::ElementReport;
use crate::remote::{
    ErrorBody, GetWorkRequest, MatchedWork, QueueWorkRequest, QueueWorkResponse, RemoteQueue,
    SetPriorityRequest, SetStatusRequest, SynchronizeRequest, UpdatedResponse,
};
use crate::scheduler::{
    ElementSelector, ElementStatus, ForcedStatus, SiteCapacity, WorkQueueElement,
};

pub mod endpoints {
    pub const GET_WORK: &str = "/workqueue/getwork";
    pub const SYNCHRONIZE: &str = "/workqueue/synchronize";
    pub const QUEUE_WORK: &str = "/workqueue/queuework";
    pub const STATUS: &str = "/workqueue/status";
    pub const PRIORITY: &str = "/workqueue/priority";
    pub const ELEMENTS: &str = "/workqueue/elements";
}

/// Client for a queue served over HTTP. Every call is bounded by the
/// configured timeout.
#[derive(Debug, Clone)]
pub struct HttpQueueClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpQueueClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WorkQueueError::Configuration(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => "request failed".to_string(),
        };
        Err(match status {
            reqwest::StatusCode::NOT_FOUND => WorkQueueError::NoMatch { action: "Remote" },
            s if s.is_server_error() => {
                WorkQueueError::RemoteUnavailable(format!("HTTP {}: {}", s, message))
            }
            s => WorkQueueError::Internal(format!("HTTP {}: {}", s, message)),
        })
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let response = self.client.post(self.url(path)).json(body).send().await?;
        Self::decode(response).await
    }

    pub async fn queue_work(&self, url: &str, parent_queue_id: Option<u64>) -> Result<usize> {
        let response: QueueWorkResponse = self
            .post(
                endpoints::QUEUE_WORK,
                &QueueWorkRequest {
                    url: url.to_string(),
                    parent_queue_id,
                },
            )
            .await?;
        Ok(response.units)
    }

    pub async fn set_status(
        &self,
        status: ElementStatus,
        selector: ElementSelector,
    ) -> Result<usize> {
        let response: UpdatedResponse = self
            .post(
                endpoints::STATUS,
                &SetStatusRequest {
                    status,
                    selector,
                    source: None,
                },
            )
            .await?;
        Ok(response.updated)
    }

    pub async fn set_priority(&self, priority: u32, workflows: Vec<String>) -> Result<usize> {
        let response: UpdatedResponse = self
            .post(
                endpoints::PRIORITY,
                &SetPriorityRequest {
                    priority,
                    workflows,
                },
            )
            .await?;
        Ok(response.updated)
    }

    pub async fn elements(&self, status: Option<ElementStatus>) -> Result<Vec<WorkQueueElement>> {
        let mut request = self.client.get(self.url(endpoints::ELEMENTS));
        if let Some(status) = status {
            request = request.query(&[("status", status.to_string())]);
        }
        Self::decode(request.send().await?).await
    }
}

/// Anything short of a decoded answer from the parent counts as unreachable.
fn unreachable(e: WorkQueueError) -> WorkQueueError {
    match e {
        WorkQueueError::RemoteUnavailable(_) => e,
        other => WorkQueueError::RemoteUnavailable(other.to_string()),
    }
}

#[async_trait]
impl RemoteQueue for HttpQueueClient {
    async fn get_work(
        &self,
        resources: &SiteCapacity,
        caller_url: &str,
    ) -> Result<Vec<MatchedWork>> {
        self.post(
            endpoints::GET_WORK,
            &GetWorkRequest {
                site_capacity: resources.clone(),
                caller_url: Some(caller_url.to_string()),
            },
        )
        .await
        .map_err(unreachable)
    }

    async fn synchronize(
        &self,
        child_url: &str,
        reports: &[ElementReport],
    ) -> Result<ForcedStatus> {
        self.post(
            endpoints::SYNCHRONIZE,
            &SynchronizeRequest {
                child_url: child_url.to_string(),
                reports: reports.to_vec(),
            },
        )
        .await
        .map_err(unreachable)
    }
}
