use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Local primary key of an element. Parent-visible ids use the same type.
pub type ElementId = u64;

/// Requested or leftover capacity, site name -> job slots.
pub type SiteCapacity = BTreeMap<String, u64>;

/// Statuses the parent asks a child to force locally, status -> parent ids.
pub type ForcedStatus = BTreeMap<ElementStatus, BTreeSet<ElementId>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ElementStatus {
    Available,
    Negotiating,
    Acquired,
    Done,
    Failed,
    Canceled,
}

impl ElementStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ElementStatus::Done | ElementStatus::Failed | ElementStatus::Canceled
        )
    }

    /// Edges of the element state machine. Re-applying the current status of a
    /// live element is allowed so repeated confirmations stay harmless.
    pub fn can_transition_to(self, next: ElementStatus) -> bool {
        use ElementStatus::*;
        if self.is_terminal() {
            return false;
        }
        if self == next || next.is_terminal() {
            return true;
        }
        matches!(
            (self, next),
            (Available, Negotiating) | (Available, Acquired) | (Negotiating, Acquired)
                | (Negotiating, Available)
        )
    }
}

impl std::fmt::Display for ElementStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElementStatus::Available => write!(f, "Available"),
            ElementStatus::Negotiating => write!(f, "Negotiating"),
            ElementStatus::Acquired => write!(f, "Acquired"),
            ElementStatus::Done => write!(f, "Done"),
            ElementStatus::Failed => write!(f, "Failed"),
            ElementStatus::Canceled => write!(f, "Canceled"),
        }
    }
}

impl std::str::FromStr for ElementStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "available" => Ok(ElementStatus::Available),
            "negotiating" => Ok(ElementStatus::Negotiating),
            "acquired" => Ok(ElementStatus::Acquired),
            "done" => Ok(ElementStatus::Done),
            "failed" => Ok(ElementStatus::Failed),
            "canceled" | "cancelled" => Ok(ElementStatus::Canceled),
            other => Err(format!("unknown element status '{}'", other)),
        }
    }
}

/// Which column a bulk update selects on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "values", rename_all = "snake_case")]
pub enum ElementSelector {
    Ids(Vec<ElementId>),
    ParentQueueIds(Vec<ElementId>),
    Workflows(Vec<String>),
}

impl ElementSelector {
    pub fn id(id: ElementId) -> Self {
        ElementSelector::Ids(vec![id])
    }

    pub fn matches(&self, element: &WorkQueueElement) -> bool {
        match self {
            ElementSelector::Ids(ids) => ids.contains(&element.id),
            ElementSelector::ParentQueueIds(ids) => element
                .parent_queue_id
                .map(|pid| ids.contains(&pid))
                .unwrap_or(false),
            ElementSelector::Workflows(names) => names.contains(&element.workload_name),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            ElementSelector::Ids(ids) | ElementSelector::ParentQueueIds(ids) => ids.is_empty(),
            ElementSelector::Workflows(names) => names.is_empty(),
        }
    }
}

/// Everything needed to insert a new element; the store assigns id and timestamps.
#[derive(Debug, Clone, Default)]
pub struct NewElement {
    pub workload_name: String,
    pub task_name: String,
    pub spec_url: String,
    pub input: Option<String>,
    pub parent_data: Vec<String>,
    /// Downstream files are populated with their parents.
    pub parent_flag: bool,
    pub jobs: u64,
    pub priority: u32,
    pub parent_queue_id: Option<ElementId>,
    pub site_whitelist: BTreeSet<String>,
    pub site_blacklist: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkQueueElement {
    pub id: ElementId,
    pub parent_queue_id: Option<ElementId>,
    pub workload_name: String,
    pub task_name: String,
    /// Spec written for this split; re-read when the work is re-acquired.
    pub spec_url: String,
    /// Primary input block or dataset, `None` for Monte-Carlo work.
    pub input: Option<String>,
    pub parent_data: Vec<String>,
    pub jobs: u64,
    pub priority: u32,
    pub site_whitelist: BTreeSet<String>,
    pub site_blacklist: BTreeSet<String>,
    pub child_queue_url: Option<String>,
    pub status: ElementStatus,
    pub parent_flag: bool,
    pub subscription_id: Option<u64>,
    /// Queue that caused the last update, so it is not echoed back there.
    pub update_source: Option<String>,
    pub inserted_at: DateTime<Utc>,
    pub status_changed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkQueueElement {
    pub fn from_new(id: ElementId, new: NewElement, now: DateTime<Utc>) -> Self {
        Self {
            id,
            parent_queue_id: new.parent_queue_id,
            workload_name: new.workload_name,
            task_name: new.task_name,
            spec_url: new.spec_url,
            input: new.input,
            parent_flag: new.parent_flag,
            parent_data: new.parent_data,
            jobs: new.jobs,
            priority: new.priority.max(1),
            site_whitelist: new.site_whitelist,
            site_blacklist: new.site_blacklist,
            child_queue_url: None,
            status: ElementStatus::Available,
            subscription_id: None,
            update_source: None,
            inserted_at: now,
            status_changed_at: now,
            updated_at: now,
        }
    }

    /// Site-level placement constraints; location is checked by the store.
    pub fn allows_site(&self, site: &str) -> bool {
        (self.site_whitelist.is_empty() || self.site_whitelist.contains(site))
            && !self.site_blacklist.contains(site)
    }

    /// Priority plus the weight accrued while waiting since insertion.
    pub fn effective_priority(&self, item_weight: f64, now: DateTime<Utc>) -> f64 {
        let waited = (now - self.inserted_at).num_milliseconds().max(0) as f64 / 1000.0;
        self.priority as f64 + item_weight * waited
    }
}
