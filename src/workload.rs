//! Workload descriptions as far as the queue needs to understand them.
//!
//! A workload is a named set of top-level tasks plus the start policy that
//! decides how it is cut into elements. Specs are persisted as JSON; every
//! split gets its own smaller spec in the queue's cache directory so a child
//! queue (or a later re-acquisition) reads a stable copy of just its part.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, WorkQueueError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputDataset {
    pub dataset: String,
    /// Restrict processing to these blocks; empty means every block.
    #[serde(default)]
    pub blocks: Vec<String>,
    /// Carry parent-block provenance into the elements.
    #[serde(default)]
    pub include_parents: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    /// Data catalog holding this task's input.
    #[serde(default)]
    pub catalog_url: Option<String>,
    #[serde(default)]
    pub input: Option<InputDataset>,
    #[serde(default)]
    pub site_whitelist: BTreeSet<String>,
    #[serde(default)]
    pub site_blacklist: BTreeSet<String>,
    #[serde(default)]
    pub files_per_job: Option<u64>,
    #[serde(default)]
    pub events_per_job: Option<u64>,
    /// Events to generate, for input-less work.
    #[serde(default)]
    pub total_events: Option<u64>,
}

impl Task {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            catalog_url: None,
            input: None,
            site_whitelist: BTreeSet::new(),
            site_blacklist: BTreeSet::new(),
            files_per_job: None,
            events_per_job: None,
            total_events: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    pub name: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub priority: Option<u32>,
    /// Name looked up in the queue's splitting mapping.
    pub start_policy: String,
    #[serde(default)]
    pub spec_url: Option<String>,
    pub tasks: Vec<Task>,
}

impl Workload {
    pub fn new(name: impl Into<String>, start_policy: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: None,
            priority: None,
            start_policy: start_policy.into(),
            spec_url: None,
            tasks: Vec::new(),
        }
    }

    pub fn with_task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Priority inherited by elements; unset or zero means 1.
    pub fn effective_priority(&self) -> u32 {
        self.priority.filter(|&p| p > 0).unwrap_or(1)
    }

    /// A copy of this workload reduced to a single task.
    pub fn for_task(&self, task: Task) -> Workload {
        Workload {
            tasks: vec![task],
            spec_url: None,
            ..self.clone()
        }
    }
}

/// Reads workload specs and writes one uniquely named spec per split.
#[derive(Debug, Clone)]
pub struct SpecCache {
    dir: PathBuf,
}

impl SpecCache {
    /// Open the cache, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            WorkQueueError::Configuration(format!(
                "cannot create cache dir {}: {}",
                dir.display(),
                e
            ))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(url: &str) -> &Path {
        Path::new(url.strip_prefix("file://").unwrap_or(url))
    }

    pub async fn load(&self, url: &str) -> Result<Workload> {
        let raw = tokio::fs::read_to_string(Self::path_of(url))
            .await
            .map_err(|e| WorkQueueError::Spec(format!("cannot read spec {}: {}", url, e)))?;
        let mut workload: Workload = serde_json::from_str(&raw)?;
        workload.spec_url = Some(url.to_string());
        Ok(workload)
    }

    /// Persist `workload` under a fresh name and point its spec URL there.
    pub async fn save_split(&self, workload: &mut Workload) -> Result<String> {
        let unique = Uuid::new_v4().simple().to_string();
        let path = self.dir.join(format!("{}.spec", &unique[..10]));
        if tokio::fs::try_exists(&path).await? {
            return Err(WorkQueueError::Spec(format!(
                "spec file {} exists",
                path.display()
            )));
        }
        let url = path.to_string_lossy().into_owned();
        workload.spec_url = Some(url.clone());
        tokio::fs::write(&path, serde_json::to_vec_pretty(workload)?).await?;
        Ok(url)
    }
}
