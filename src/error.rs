use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkQueueError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{action} not changed: no matching elements")]
    NoMatch { action: &'static str },

    #[error("Remote unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Downstream preparation failed: {0}")]
    DownstreamPreparation(String),

    #[error("Data catalog error: {0}")]
    Catalog(String),

    #[error("Workload spec error: {0}")]
    Spec(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WorkQueueError {
    pub fn no_status_match() -> Self {
        WorkQueueError::NoMatch { action: "Status" }
    }

    pub fn no_priority_match() -> Self {
        WorkQueueError::NoMatch { action: "Priority" }
    }

    /// Soft failures degrade to local-only operation instead of aborting a cycle.
    pub fn is_remote(&self) -> bool {
        matches!(self, WorkQueueError::RemoteUnavailable(_))
    }
}

impl From<reqwest::Error> for WorkQueueError {
    fn from(e: reqwest::Error) -> Self {
        WorkQueueError::RemoteUnavailable(e.to_string())
    }
}

impl From<std::io::Error> for WorkQueueError {
    fn from(e: std::io::Error) -> Self {
        WorkQueueError::Spec(e.to_string())
    }
}

impl From<serde_json::Error> for WorkQueueError {
    fn from(e: serde_json::Error) -> Self {
        WorkQueueError::Spec(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WorkQueueError>;
