use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkQueueError};
use crate::scheduler::element::{
    ElementId, ElementSelector, ElementStatus, NewElement, WorkQueueElement,
};

/// Workload metadata row, inserted once per workload name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadRecord {
    pub name: String,
    pub spec_url: String,
    pub owner: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataRecord {
    pub parents: BTreeSet<String>,
    pub locations: BTreeSet<String>,
}

/// Query over the element table. Unset fields do not constrain.
#[derive(Debug, Clone, Default)]
pub struct ElementFilter {
    pub status: Option<ElementStatus>,
    /// Only elements updated strictly after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Only elements updated at or before this instant.
    pub before: Option<DateTime<Utc>>,
    pub parent_ids: Option<BTreeSet<ElementId>>,
    /// Skip elements whose last update came from this queue.
    pub exclude_source: Option<String>,
}

impl ElementFilter {
    pub fn with_status(status: ElementStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    fn accepts(&self, element: &WorkQueueElement) -> bool {
        if let Some(status) = self.status {
            if element.status != status {
                return false;
            }
        }
        if let Some(since) = self.since {
            if element.updated_at <= since {
                return false;
            }
        }
        if let Some(before) = self.before {
            if element.updated_at > before {
                return false;
            }
        }
        if let Some(ref ids) = self.parent_ids {
            match element.parent_queue_id {
                Some(pid) if ids.contains(&pid) => {}
                _ => return false,
            }
        }
        if let (Some(excluded), Some(source)) = (&self.exclude_source, &element.update_source) {
            if excluded == source {
                return false;
            }
        }
        true
    }
}

/// Transactional element table plus the workload, task, site and data rows
/// that hang off it.
///
/// Cloning the store is how a transaction is staged: mutate the clone, then
/// swap it in on success or drop it to roll back.
#[derive(Debug, Clone, Default)]
pub struct ElementStore {
    elements: BTreeMap<ElementId, WorkQueueElement>,
    next_id: ElementId,
    workloads: HashMap<String, WorkloadRecord>,
    /// (workload, task) -> data catalog URL of the task
    tasks: HashMap<(String, String), Option<String>>,
    sites: BTreeSet<String>,
    data: HashMap<String, DataRecord>,
}

impl ElementStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ---------------------------------------------------------------------
    // Metadata rows
    // ---------------------------------------------------------------------

    pub fn workload_exists(&self, name: &str) -> bool {
        self.workloads.contains_key(name)
    }

    /// Insert a workload row unless one with the same name already exists.
    /// Returns true if a row was created.
    pub fn insert_workload(&mut self, record: WorkloadRecord) -> bool {
        if self.workload_exists(&record.name) {
            return false;
        }
        self.workloads.insert(record.name.clone(), record);
        true
    }

    pub fn workload(&self, name: &str) -> Option<&WorkloadRecord> {
        self.workloads.get(name)
    }

    pub fn add_task(&mut self, workload: &str, task: &str, catalog_url: Option<String>) {
        self.tasks
            .entry((workload.to_string(), task.to_string()))
            .or_insert(catalog_url);
    }

    pub fn task_catalog_url(&self, workload: &str, task: &str) -> Option<&str> {
        self.tasks
            .get(&(workload.to_string(), task.to_string()))
            .and_then(|url| url.as_deref())
    }

    /// Sites are created lazily the first time anything references them.
    pub fn insert_sites<I, S>(&mut self, sites: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sites.extend(sites.into_iter().map(Into::into));
    }

    pub fn sites(&self) -> &BTreeSet<String> {
        &self.sites
    }

    /// Record a primary input and its parentage.
    pub fn insert_inputs(&mut self, primary: &str, parents: &[String]) {
        for parent in parents {
            self.data.entry(parent.clone()).or_default();
        }
        let record = self.data.entry(primary.to_string()).or_default();
        record.parents.extend(parents.iter().cloned());
    }

    pub fn data(&self, name: &str) -> Option<&DataRecord> {
        self.data.get(name)
    }

    pub fn data_locations(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.data.get(name).map(|d| &d.locations)
    }

    /// Input data of elements that can still be matched or are being negotiated.
    pub fn active_data(&self) -> Vec<String> {
        let names: BTreeSet<&String> = self
            .elements
            .values()
            .filter(|e| {
                matches!(
                    e.status,
                    ElementStatus::Available | ElementStatus::Negotiating
                )
            })
            .filter_map(|e| e.input.as_ref())
            .collect();
        names.into_iter().cloned().collect()
    }

    /// Apply resolved locations. A full refresh replaces the locations of every
    /// known datum; an incremental one only touches the returned entries.
    pub fn update_data_site_mapping(
        &mut self,
        mapping: &HashMap<String, Vec<String>>,
        full_refresh: bool,
    ) {
        if full_refresh {
            for record in self.data.values_mut() {
                record.locations.clear();
            }
        }
        for (name, sites) in mapping {
            let record = self.data.entry(name.clone()).or_default();
            if !full_refresh {
                record.locations.clear();
            }
            record.locations.extend(sites.iter().cloned());
        }
    }

    // ---------------------------------------------------------------------
    // Elements
    // ---------------------------------------------------------------------

    pub fn insert_element(&mut self, new: NewElement, now: DateTime<Utc>) -> ElementId {
        self.next_id += 1;
        let id = self.next_id;

        if let Some(ref input) = new.input {
            self.insert_inputs(input, &new.parent_data);
        }
        self.insert_sites(new.site_whitelist.iter().cloned());
        self.insert_sites(new.site_blacklist.iter().cloned());

        let element = WorkQueueElement::from_new(id, new, now);
        tracing::debug!(
            element_id = id,
            workload = %element.workload_name,
            task = %element.task_name,
            input = ?element.input,
            jobs = element.jobs,
            "Element inserted"
        );
        self.elements.insert(id, element);
        id
    }

    pub fn get(&self, id: ElementId) -> Option<&WorkQueueElement> {
        self.elements.get(&id)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn count(&self, status: ElementStatus) -> usize {
        self.elements
            .values()
            .filter(|e| e.status == status)
            .count()
    }

    pub fn available(&self) -> impl Iterator<Item = &WorkQueueElement> {
        self.elements
            .values()
            .filter(|e| e.status == ElementStatus::Available)
    }

    pub fn elements(&self, filter: &ElementFilter) -> Vec<&WorkQueueElement> {
        self.elements.values().filter(|e| filter.accepts(e)).collect()
    }

    /// Elements accepted by `filter` keyed by the id the parent knows them by.
    /// Elements with no parent are left out.
    pub fn grouped_by_parent(
        &self,
        filter: &ElementFilter,
    ) -> BTreeMap<ElementId, Vec<&WorkQueueElement>> {
        let mut groups: BTreeMap<ElementId, Vec<&WorkQueueElement>> = BTreeMap::new();
        for element in self.elements(filter) {
            if let Some(pid) = element.parent_queue_id {
                groups.entry(pid).or_default().push(element);
            }
        }
        groups
    }

    /// Elements sitting in `status` for longer than `interval`.
    pub fn expired(
        &self,
        status: ElementStatus,
        interval: Duration,
        now: DateTime<Utc>,
    ) -> Vec<ElementId> {
        self.elements
            .values()
            .filter(|e| e.status == status && now - e.status_changed_at > interval)
            .map(|e| e.id)
            .collect()
    }

    /// Move every selected element that may legally take `status`.
    ///
    /// Returns the number of affected elements; zero is an error because a
    /// caller always expects at least one element to change.
    pub fn set_status(
        &mut self,
        status: ElementStatus,
        selector: &ElementSelector,
        source: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let eligible: Vec<ElementId> = self
            .elements
            .values()
            .filter(|e| selector.matches(e) && e.status.can_transition_to(status))
            .map(|e| e.id)
            .collect();
        if eligible.is_empty() {
            return Err(WorkQueueError::no_status_match());
        }
        for id in &eligible {
            if let Some(element) = self.elements.get_mut(id) {
                Self::apply_status(element, status, source, now);
            }
        }
        Ok(eligible.len())
    }

    /// Administrative override: set `status` regardless of the state machine.
    pub fn force_status(
        &mut self,
        status: ElementStatus,
        selector: &ElementSelector,
        source: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut affected = 0;
        for element in self.elements.values_mut().filter(|e| selector.matches(e)) {
            Self::apply_status(element, status, source, now);
            affected += 1;
        }
        if affected == 0 {
            return Err(WorkQueueError::no_status_match());
        }
        Ok(affected)
    }

    fn apply_status(
        element: &mut WorkQueueElement,
        status: ElementStatus,
        source: Option<&str>,
        now: DateTime<Utc>,
    ) {
        let previous = element.status;
        let previous_owner = element.child_queue_url.clone();

        if status == ElementStatus::Available {
            // released, any queue may claim it again
            element.child_queue_url = None;
        } else if let Some(src) = source {
            if element.child_queue_url.is_none()
                && matches!(status, ElementStatus::Negotiating | ElementStatus::Acquired)
            {
                element.child_queue_url = Some(src.to_string());
            }
        }

        if previous != status || previous_owner != element.child_queue_url {
            element.status = status;
            if previous != status {
                element.status_changed_at = now;
            }
            element.updated_at = now;
            element.update_source = source.map(str::to_string);
            tracing::debug!(
                element_id = element.id,
                from = %previous,
                to = %status,
                source = ?source,
                "Element status changed"
            );
        }
    }

    /// Bulk priority update for the named workflows' live elements.
    pub fn set_priority(
        &mut self,
        priority: u32,
        workflows: &[String],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut affected = 0;
        for element in self
            .elements
            .values_mut()
            .filter(|e| !e.status.is_terminal() && workflows.contains(&e.workload_name))
        {
            element.priority = priority;
            element.updated_at = now;
            affected += 1;
        }
        if affected == 0 {
            return Err(WorkQueueError::no_priority_match());
        }
        Ok(affected)
    }

    /// Bind the downstream subscription created for an element.
    pub fn bind_subscription(&mut self, id: ElementId, subscription_id: u64) -> Result<()> {
        let element = self
            .elements
            .get_mut(&id)
            .ok_or_else(|| WorkQueueError::Internal(format!("element {} not found", id)))?;
        element.subscription_id = Some(subscription_id);
        Ok(())
    }
}
