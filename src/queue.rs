use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::catalog::{is_block_name, CatalogRegistry, DataCatalog, FileBlock};
use crate::config::QueueConfig;
use crate::downstream::{
    Downstream, DownstreamFile, InMemoryDownstream, SubscriptionId, SubscriptionRequest,
};
use crate::error::{Result, WorkQueueError};
use crate::location::{HttpReplicaCatalog, LocationResolver, ReplicaCatalog};
use crate::policy::{ElementReport, EndPolicy, PolicyRegistry};
use crate::remote::{HttpQueueClient, MatchedWork, RemoteQueue};
use crate::scheduler::{
    ElementFilter, ElementId, ElementSelector, ElementStatus, ElementStore, ForcedStatus, Match,
    Matcher, NewElement, SiteCapacity, WorkQueueElement, WorkloadRecord,
};
use crate::workload::{SpecCache, Workload};

const UNKNOWN_OWNER: &str = "unknown";

/// When this queue last reported to its parent.
#[derive(Debug, Default)]
struct ReportTimers {
    last_report: Option<DateTime<Utc>>,
    last_full_report: Option<DateTime<Utc>>,
}

impl ReportTimers {
    fn full_due(&self, now: DateTime<Utc>, interval: chrono::Duration) -> bool {
        match self.last_full_report {
            None => true,
            Some(at) => now - at > interval,
        }
    }

    fn advance(&mut self, now: DateTime<Utc>, full: bool) {
        self.last_report = Some(now);
        if full {
            self.last_full_report = Some(now);
        }
    }
}

/// A work queue: splits workloads into elements, matches them to site
/// capacity, pulls from and reports to an optional parent queue.
///
/// The element store sits behind one lock. Every operation that matches and
/// then changes status holds the write lock for the whole sequence, which is
/// what guarantees an element is never handed to two requesters.
pub struct WorkQueue {
    config: QueueConfig,
    store: RwLock<ElementStore>,
    matcher: Matcher,
    policies: PolicyRegistry,
    end_policy: EndPolicy,
    catalogs: CatalogRegistry,
    locations: Option<Mutex<LocationResolver>>,
    downstream: Arc<dyn Downstream>,
    parent: Option<Arc<dyn RemoteQueue>>,
    spec_cache: SpecCache,
    reports: Mutex<ReportTimers>,
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("queue_url", &self.config.queue_url)
            .field("parent_queue", &self.config.parent_queue)
            .field("has_parent", &self.parent.is_some())
            .field("tracks_locations", &self.locations.is_some())
            .finish()
    }
}

/// Assembles a [`WorkQueue`] from its config and collaborators.
///
/// Collaborators left unset are derived from the config: an HTTP parent
/// client when `ParentQueue` is set, an HTTP replica catalog when
/// `PhEDExEndpoint` is set, and an in-memory downstream system.
pub struct WorkQueueBuilder {
    config: QueueConfig,
    catalogs: CatalogRegistry,
    replica_catalog: Option<Arc<dyn ReplicaCatalog>>,
    downstream: Option<Arc<dyn Downstream>>,
    parent: Option<Arc<dyn RemoteQueue>>,
}

impl WorkQueueBuilder {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            catalogs: CatalogRegistry::new(),
            replica_catalog: None,
            downstream: None,
            parent: None,
        }
    }

    pub fn catalogs(mut self, catalogs: CatalogRegistry) -> Self {
        self.catalogs = catalogs;
        self
    }

    pub fn data_catalog(mut self, url: impl Into<String>, catalog: Arc<dyn DataCatalog>) -> Self {
        self.catalogs.insert(url, catalog);
        self
    }

    pub fn default_catalog(mut self, catalog: Arc<dyn DataCatalog>) -> Self {
        self.catalogs.set_default(catalog);
        self
    }

    pub fn replica_catalog(mut self, catalog: Arc<dyn ReplicaCatalog>) -> Self {
        self.replica_catalog = Some(catalog);
        self
    }

    pub fn downstream(mut self, downstream: Arc<dyn Downstream>) -> Self {
        self.downstream = Some(downstream);
        self
    }

    /// Use `parent` instead of an HTTP client for `ParentQueue`.
    pub fn parent(mut self, parent: Arc<dyn RemoteQueue>) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn build(self) -> Result<WorkQueue> {
        let config = self.config;
        config.validate()?;

        let parent = match (self.parent, config.parent_queue.as_deref()) {
            (Some(parent), _) => Some(parent),
            (None, Some(url)) => Some(Arc::new(HttpQueueClient::new(url, config.remote_timeout())?)
                as Arc<dyn RemoteQueue>),
            (None, None) => None,
        };
        if parent.is_some() && config.queue_url.is_none() {
            return Err(WorkQueueError::Configuration(
                "a queue with a parent needs QueueURL so the parent can address it".to_string(),
            ));
        }

        let replica_catalog = match (self.replica_catalog, config.phedex_endpoint.as_deref()) {
            (Some(catalog), _) => Some(catalog),
            (None, Some(url)) => Some(Arc::new(HttpReplicaCatalog::new(
                url,
                config.remote_timeout(),
            )?) as Arc<dyn ReplicaCatalog>),
            (None, None) => None,
        };
        let locations =
            replica_catalog.map(|catalog| Mutex::new(LocationResolver::new(&config, catalog)));

        let downstream = self
            .downstream
            .unwrap_or_else(|| Arc::new(InMemoryDownstream::new()));

        let policies = PolicyRegistry::from_mapping(&config.effective_splitting_mapping())?;
        let spec_cache = SpecCache::open(config.cache_dir.clone())?;

        tracing::info!(
            queue_url = ?config.queue_url,
            parent_queue = ?config.parent_queue,
            tracking = %config.track_location_or_subscription,
            policies = ?policies.names().collect::<Vec<_>>(),
            cache_dir = %spec_cache.dir().display(),
            "Work queue created"
        );

        Ok(WorkQueue {
            matcher: Matcher::new(config.item_weight),
            end_policy: EndPolicy::new(config.end_policy_settings.clone()),
            store: RwLock::new(ElementStore::new()),
            catalogs: self.catalogs,
            locations,
            downstream,
            parent,
            spec_cache,
            policies,
            reports: Mutex::new(ReportTimers::default()),
            config,
        })
    }
}

impl WorkQueue {
    pub fn builder(config: QueueConfig) -> WorkQueueBuilder {
        WorkQueueBuilder::new(config)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn has_parent(&self) -> bool {
        self.parent.is_some()
    }

    // ---------------------------------------------------------------------
    // Ingestion
    // ---------------------------------------------------------------------

    /// Load the workload spec at `url` and queue it. Returns the number of
    /// elements created.
    pub async fn queue_work(&self, url: &str, parent_queue_id: Option<ElementId>) -> Result<usize> {
        let workload = self.spec_cache.load(url).await?;
        self.queue_workload(workload, parent_queue_id).await
    }

    /// Split `workload` with its start policy and insert one element per unit,
    /// all in one transaction.
    pub async fn queue_workload(
        &self,
        workload: Workload,
        parent_queue_id: Option<ElementId>,
    ) -> Result<usize> {
        let policy = self.policies.get(&workload.start_policy)?;

        let mut units = Vec::new();
        for task in &workload.tasks {
            units.extend(policy.split(&workload, task, &self.catalogs)?);
        }

        // Split specs are written before the transaction; an aborted insert
        // only leaves unreferenced files behind.
        let mut split_urls = Vec::with_capacity(units.len());
        for unit in &mut units {
            split_urls.push(self.spec_cache.save_split(&mut unit.workload).await?);
        }

        let owner = workload
            .owner
            .clone()
            .or_else(|| self.config.owner.clone())
            .unwrap_or_else(|| UNKNOWN_OWNER.to_string());
        let priority = workload.effective_priority();
        let now = Utc::now();

        let mut store = self.store.write().await;
        let mut staged = store.clone();
        if !staged.insert_workload(WorkloadRecord {
            name: workload.name.clone(),
            spec_url: workload.spec_url.clone().unwrap_or_default(),
            owner,
        }) {
            tracing::debug!(workload = %workload.name, "Workload already known");
        }
        for task in &workload.tasks {
            staged.add_task(&workload.name, &task.name, task.catalog_url.clone());
        }
        for (unit, spec_url) in units.iter().zip(split_urls) {
            let task = unit.task();
            staged.insert_element(
                NewElement {
                    workload_name: workload.name.clone(),
                    task_name: task.name.clone(),
                    spec_url,
                    input: unit.data.clone(),
                    parent_data: unit.parent_data.clone(),
                    parent_flag: unit.parent_flag,
                    jobs: unit.jobs,
                    priority,
                    parent_queue_id,
                    site_whitelist: task.site_whitelist.clone(),
                    site_blacklist: task.site_blacklist.clone(),
                },
                now,
            );
        }
        *store = staged;

        tracing::info!(
            workload = %workload.name,
            policy = policy.name(),
            units = units.len(),
            parent_queue_id = ?parent_queue_id,
            "Workload queued"
        );
        Ok(units.len())
    }

    // ---------------------------------------------------------------------
    // Matching
    // ---------------------------------------------------------------------

    /// Hand out work for `capacity`.
    ///
    /// `pulling_url` is set when a child queue is asking: matched elements then
    /// go to Negotiating and are owned by that child, and unmatched capacity
    /// is first topped up from this queue's own parent. A direct caller gets
    /// its elements Acquired.
    ///
    /// A downstream failure rolls the whole call back: no element changes
    /// status and subscriptions created so far are discarded.
    pub async fn get_work(
        &self,
        capacity: &SiteCapacity,
        pulling_url: Option<&str>,
    ) -> Result<Vec<MatchedWork>> {
        if pulling_url.is_some() && self.parent.is_some() {
            let unmatched = {
                let store = self.store.read().await;
                self.matcher.match_work(&store, capacity, Utc::now()).unmatched
            };
            if !unmatched.is_empty() {
                if let Err(e) = self.pull_work(&unmatched).await {
                    tracing::warn!(
                        error = %e,
                        "Top-up from parent failed, matching local work only"
                    );
                }
            }
        }

        let now = Utc::now();
        let mut store = self.store.write().await;
        let outcome = self.matcher.match_work(&store, capacity, now);
        if outcome.matches.is_empty() {
            tracing::debug!(capacity = ?capacity, "No work matched");
            return Ok(Vec::new());
        }

        let status = if pulling_url.is_some() {
            ElementStatus::Negotiating
        } else {
            ElementStatus::Acquired
        };

        let mut staged = store.clone();
        let mut created = Vec::new();
        match self
            .hand_out(&mut staged, &outcome.matches, status, pulling_url, now, &mut created)
            .await
        {
            Ok(work) => {
                *store = staged;
                tracing::info!(
                    elements = work.len(),
                    status = %status,
                    child = ?pulling_url,
                    unmatched = ?outcome.unmatched,
                    "Work handed out"
                );
                Ok(work)
            }
            Err(e) => {
                for subscription in created {
                    self.downstream.discard(subscription);
                }
                tracing::warn!(error = %e, "Handing out work failed, rolled back");
                Err(e)
            }
        }
    }

    async fn hand_out(
        &self,
        staged: &mut ElementStore,
        matches: &[Match],
        status: ElementStatus,
        pulling_url: Option<&str>,
        now: DateTime<Utc>,
        created: &mut Vec<SubscriptionId>,
    ) -> Result<Vec<MatchedWork>> {
        let mut work = Vec::with_capacity(matches.len());
        for m in matches {
            let element = staged
                .get(m.element_id)
                .cloned()
                .ok_or_else(|| {
                    WorkQueueError::Internal(format!("element {} vanished", m.element_id))
                })?;
            let owner = staged
                .workload(&element.workload_name)
                .map(|w| w.owner.clone())
                .unwrap_or_else(|| UNKNOWN_OWNER.to_string());

            let mut subscription_id = element.subscription_id;
            if self.config.populate_filesets && subscription_id.is_none() {
                let id = self.prepare_downstream(staged, &element, &owner, created)?;
                staged.bind_subscription(element.id, id)?;
                subscription_id = Some(id);
            }

            let workload = self.spec_cache.load(&element.spec_url).await?;
            work.push(MatchedWork {
                element_id: element.id,
                workload_name: element.workload_name,
                task_name: element.task_name,
                owner,
                spec_url: element.spec_url,
                site: m.site.clone(),
                workload: Some(workload),
                subscription_id,
            });
        }

        let ids = matches.iter().map(|m| m.element_id).collect();
        staged.set_status(status, &ElementSelector::Ids(ids), pulling_url, now)?;
        Ok(work)
    }

    /// Create, fill and commit the downstream subscription for one element.
    fn prepare_downstream(
        &self,
        staged: &ElementStore,
        element: &WorkQueueElement,
        owner: &str,
        created: &mut Vec<SubscriptionId>,
    ) -> Result<SubscriptionId> {
        let request = SubscriptionRequest {
            workload: element.workload_name.clone(),
            spec_url: element.spec_url.clone(),
            owner: owner.to_string(),
            task: element.task_name.clone(),
            input: element.input.clone(),
            site_whitelist: element.site_whitelist.clone(),
            site_blacklist: element.site_blacklist.clone(),
        };
        let subscription = self.downstream.create_subscription(&request)?;
        created.push(subscription);

        if let Some(ref input) = element.input {
            let preparation =
                |e: WorkQueueError| WorkQueueError::DownstreamPreparation(e.to_string());
            let catalog = self
                .catalogs
                .get(staged.task_catalog_url(&element.workload_name, &element.task_name))
                .map_err(preparation)?;
            let blocks = if is_block_name(input) {
                vec![catalog.file_block(input, element.parent_flag).map_err(preparation)?]
            } else {
                catalog.list_blocks(input).map_err(preparation)?
            };
            let files: Vec<DownstreamFile> = blocks.iter().flat_map(downstream_files).collect();
            tracing::debug!(
                subscription,
                input = %input,
                files = files.len(),
                "Populating subscription"
            );
            self.downstream.add_files(subscription, files)?;
        }

        self.downstream.commit(subscription)?;
        Ok(subscription)
    }

    /// Ask the parent for work and queue whatever comes back locally.
    ///
    /// Empty `resources` means "whatever room this queue has": `QueueDepth`
    /// times the tracked slots per site, less what local Available work would
    /// already fill. Returns the number of local elements created. An
    /// unreachable parent is logged and yields 0.
    pub async fn pull_work(&self, resources: &SiteCapacity) -> Result<usize> {
        let Some(parent) = self.parent.as_ref() else {
            return Ok(0);
        };
        let queue_url = self.queue_url()?;

        let resources = if resources.is_empty() {
            self.spare_capacity(Utc::now()).await
        } else {
            resources.clone()
        };
        if resources.is_empty() {
            tracing::debug!("No spare capacity, not pulling");
            return Ok(0);
        }

        let work = match parent.get_work(&resources, queue_url).await {
            Ok(work) => work,
            Err(e) if e.is_remote() => {
                tracing::warn!(error = %e, "Parent unreachable, continuing with local work");
                return Ok(0);
            }
            Err(e) => return Err(e),
        };

        let mut created = 0;
        for item in work {
            let workload = match item.workload {
                Some(workload) => workload,
                None => match self.spec_cache.load(&item.spec_url).await {
                    Ok(workload) => workload,
                    Err(e) => {
                        tracing::error!(
                            parent_element = item.element_id,
                            error = %e,
                            "Cannot read pulled spec"
                        );
                        continue;
                    }
                },
            };
            match self.queue_workload(workload, Some(item.element_id)).await {
                Ok(units) => created += units,
                // Left Negotiating at the parent until its timeout releases it
                Err(e) => {
                    tracing::error!(
                        parent_element = item.element_id,
                        error = %e,
                        "Cannot queue pulled work"
                    )
                }
            }
        }
        tracing::info!(elements = created, resources = ?resources, "Pulled work from parent");
        Ok(created)
    }

    async fn spare_capacity(&self, now: DateTime<Utc>) -> SiteCapacity {
        let wanted: SiteCapacity = self
            .config
            .resources
            .iter()
            .map(|(site, &slots)| (site.clone(), slots.saturating_mul(self.config.queue_depth)))
            .filter(|(_, slots)| *slots > 0)
            .collect();
        let store = self.store.read().await;
        self.matcher.match_work(&store, &wanted, now).unmatched
    }

    /// Release elements stuck in Negotiating for longer than
    /// `NegotiationTimeout` back to Available.
    pub async fn flush_negotiation_failures(&self) -> Result<usize> {
        self.flush_negotiation_failures_at(Utc::now()).await
    }

    pub async fn flush_negotiation_failures_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut store = self.store.write().await;
        let expired = store.expired(
            ElementStatus::Negotiating,
            self.config.negotiation_timeout(),
            now,
        );
        if expired.is_empty() {
            return Ok(0);
        }
        let released = store.set_status(
            ElementStatus::Available,
            &ElementSelector::Ids(expired.clone()),
            None,
            now,
        )?;
        tracing::info!(elements = ?expired, "Negotiation timed out, elements released");
        Ok(released)
    }

    // ---------------------------------------------------------------------
    // Status updates
    // ---------------------------------------------------------------------

    pub async fn set_status(
        &self,
        status: ElementStatus,
        selector: &ElementSelector,
        source: Option<&str>,
    ) -> Result<usize> {
        let mut store = self.store.write().await;
        let updated = store.set_status(status, selector, source, Utc::now())?;
        tracing::info!(status = %status, selector = ?selector, updated, "Element status set");
        Ok(updated)
    }

    /// Set `status` ignoring the state machine, for manual intervention.
    pub async fn force_status(
        &self,
        status: ElementStatus,
        selector: &ElementSelector,
        source: Option<&str>,
    ) -> Result<usize> {
        let mut store = self.store.write().await;
        let updated = store.force_status(status, selector, source, Utc::now())?;
        tracing::warn!(status = %status, selector = ?selector, updated, "Element status forced");
        Ok(updated)
    }

    pub async fn done_work(&self, selector: &ElementSelector) -> Result<usize> {
        self.set_status(ElementStatus::Done, selector, None).await
    }

    pub async fn success_work(&self, selector: &ElementSelector) -> Result<usize> {
        self.done_work(selector).await
    }

    pub async fn fail_work(&self, selector: &ElementSelector) -> Result<usize> {
        self.set_status(ElementStatus::Failed, selector, None).await
    }

    pub async fn cancel_work(&self, selector: &ElementSelector) -> Result<usize> {
        self.set_status(ElementStatus::Canceled, selector, None).await
    }

    /// Confirm that handed-out work has been picked up.
    pub async fn got_work(&self, selector: &ElementSelector) -> Result<usize> {
        self.set_status(ElementStatus::Acquired, selector, None).await
    }

    pub async fn set_priority(&self, priority: u32, workflows: &[String]) -> Result<usize> {
        let mut store = self.store.write().await;
        let updated = store.set_priority(priority, workflows, Utc::now())?;
        tracing::info!(priority, workflows = ?workflows, updated, "Priority set");
        Ok(updated)
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub async fn get(&self, id: ElementId) -> Option<WorkQueueElement> {
        self.store.read().await.get(id).cloned()
    }

    pub async fn status(&self, filter: &ElementFilter) -> Vec<WorkQueueElement> {
        self.store
            .read()
            .await
            .elements(filter)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn status_grouped_by_parent(
        &self,
        filter: &ElementFilter,
    ) -> BTreeMap<ElementId, Vec<WorkQueueElement>> {
        self.store
            .read()
            .await
            .grouped_by_parent(filter)
            .into_iter()
            .map(|(pid, group)| (pid, group.into_iter().cloned().collect()))
            .collect()
    }

    /// Number of Available elements.
    pub async fn len(&self) -> usize {
        self.store.read().await.count(ElementStatus::Available)
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn sites(&self) -> BTreeSet<String> {
        self.store.read().await.sites().clone()
    }

    pub async fn data_locations(&self, name: &str) -> BTreeSet<String> {
        self.store
            .read()
            .await
            .data_locations(name)
            .cloned()
            .unwrap_or_default()
    }

    // ---------------------------------------------------------------------
    // Parent / child synchronization
    // ---------------------------------------------------------------------

    /// Apply a child's reports. Returns the statuses the child must force on
    /// its own elements: Canceled for elements another child owns, and the
    /// parent's status for elements that are already terminal here.
    pub async fn synchronize(
        &self,
        child_url: &str,
        reports: &[ElementReport],
    ) -> Result<ForcedStatus> {
        let now = Utc::now();
        let mut store = self.store.write().await;
        let mut forced = ForcedStatus::new();

        for report in reports {
            let id = report.parent_queue_id;
            let Some(element) = store.get(id) else {
                tracing::debug!(
                    element_id = id,
                    child = %child_url,
                    "Report for unknown element ignored"
                );
                continue;
            };
            let current = element.status;

            // A child working on an element still means it is claimed here
            let reported = match report.status {
                ElementStatus::Available => ElementStatus::Acquired,
                other => other,
            };

            if let Some(owner) = element.child_queue_url.as_deref() {
                if owner != child_url {
                    tracing::warn!(
                        element_id = id,
                        owner = %owner,
                        child = %child_url,
                        "Element owned by another child, cancelling"
                    );
                    forced.entry(ElementStatus::Canceled).or_default().insert(id);
                    continue;
                }
            }

            if current == reported {
                continue;
            }

            if current.is_terminal() {
                forced.entry(current).or_default().insert(id);
                continue;
            }

            let selector = ElementSelector::id(id);
            if let Err(e) = store.set_status(reported, &selector, Some(child_url), now) {
                tracing::warn!(
                    element_id = id,
                    from = %current,
                    to = %reported,
                    error = %e,
                    "Child status not applied"
                );
            }
        }

        if !forced.is_empty() {
            tracing::info!(child = %child_url, forced = ?forced, "Child told to force status");
        }
        Ok(forced)
    }

    /// Report element progress to the parent and apply what it forces back.
    ///
    /// Only parent elements with a local change since the last report are
    /// sent, unless a full report is due; each one is aggregated over all its
    /// local elements. Returns the number of reports sent. An unreachable
    /// parent is logged, yields 0 and the changes are sent next time.
    pub async fn update_parent(&self) -> Result<usize> {
        let Some(parent) = self.parent.as_ref() else {
            return Ok(0);
        };
        let child_url = self.queue_url()?;
        let parent_url = self.config.parent_queue.as_deref();

        let mut timers = self.reports.lock().await;
        let now = Utc::now();
        let full = timers.full_due(now, self.config.full_report_interval());

        let reports = self.collect_reports(&timers, full, now).await;
        if reports.is_empty() {
            timers.advance(now, full);
            return Ok(0);
        }

        let forced = match parent.synchronize(child_url, &reports).await {
            Ok(forced) => forced,
            Err(e) if e.is_remote() => {
                tracing::warn!(
                    error = %e,
                    reports = reports.len(),
                    "Parent unreachable, report deferred"
                );
                return Ok(0);
            }
            Err(e) => return Err(e),
        };

        {
            let mut store = self.store.write().await;
            for (status, ids) in forced {
                let selector = ElementSelector::ParentQueueIds(ids.into_iter().collect());
                match store.force_status(status, &selector, parent_url, now) {
                    Ok(updated) => tracing::info!(
                        status = %status,
                        selector = ?selector,
                        updated,
                        "Applied status forced by parent"
                    ),
                    Err(e) => tracing::warn!(
                        status = %status,
                        error = %e,
                        "Forced status matched nothing"
                    ),
                }
            }
        }

        timers.advance(now, full);
        tracing::info!(reports = reports.len(), full, "Reported to parent");
        Ok(reports.len())
    }

    async fn collect_reports(
        &self,
        timers: &ReportTimers,
        full: bool,
        now: DateTime<Utc>,
    ) -> Vec<ElementReport> {
        let store = self.store.read().await;
        let changed = ElementFilter {
            since: if full { None } else { timers.last_report },
            before: Some(now),
            exclude_source: self.config.parent_queue.clone(),
            ..Default::default()
        };
        let parent_ids: BTreeSet<ElementId> =
            store.grouped_by_parent(&changed).into_keys().collect();
        if parent_ids.is_empty() {
            return Vec::new();
        }

        let everything = ElementFilter {
            parent_ids: Some(parent_ids),
            ..Default::default()
        };
        store
            .grouped_by_parent(&everything)
            .iter()
            .filter_map(|(pid, group)| self.end_policy.aggregate(*pid, group))
            .collect()
    }

    // ---------------------------------------------------------------------
    // Locations
    // ---------------------------------------------------------------------

    /// Refresh the sites holding the input of matchable elements. Returns the
    /// number of data names resolved. A failing replica catalog is logged and
    /// the previous mapping is kept.
    pub async fn update_location_info(&self) -> Result<usize> {
        let Some(ref resolver) = self.locations else {
            return Ok(0);
        };
        let names = self.store.read().await.active_data();
        if names.is_empty() {
            return Ok(0);
        }

        let mut resolver = resolver.lock().await;
        let now = Utc::now();
        let full = resolver.full_refresh_due(now);
        let mapping = match resolver.locations(&names, full).await {
            Ok(mapping) => mapping,
            Err(e) if e.is_remote() => {
                tracing::warn!(error = %e, "Replica catalog unreachable, keeping known locations");
                return Ok(0);
            }
            Err(e) => return Err(e),
        };
        if full {
            resolver.mark_full_refresh(now);
        }

        let mut store = self.store.write().await;
        store.insert_sites(mapping.values().flatten().cloned());
        store.update_data_site_mapping(&mapping, full);
        tracing::info!(
            data = mapping.len(),
            full,
            mode = %resolver.mode(),
            "Data locations updated"
        );
        Ok(mapping.len())
    }

    fn queue_url(&self) -> Result<&str> {
        self.config.queue_url.as_deref().ok_or_else(|| {
            WorkQueueError::Configuration("QueueURL is required to talk to a parent".to_string())
        })
    }
}

fn downstream_files(block: &FileBlock) -> Vec<DownstreamFile> {
    let locations: BTreeSet<String> = block.storage_elements.iter().cloned().collect();
    block
        .files
        .iter()
        .map(|file| {
            let mut checksums = BTreeMap::new();
            if let Some(ref cksum) = file.checksum {
                checksums.insert("cksum".to_string(), cksum.clone());
            }
            if let Some(ref adler32) = file.adler32 {
                checksums.insert("adler32".to_string(), adler32.clone());
            }
            DownstreamFile {
                lfn: file.lfn.clone(),
                size: file.size,
                events: file.events,
                checksums,
                parents: file.parents.clone(),
                locations: locations.clone(),
            }
        })
        .collect()
}

#[async_trait]
impl RemoteQueue for WorkQueue {
    async fn get_work(
        &self,
        resources: &SiteCapacity,
        caller_url: &str,
    ) -> Result<Vec<MatchedWork>> {
        WorkQueue::get_work(self, resources, Some(caller_url)).await
    }

    async fn synchronize(
        &self,
        child_url: &str,
        reports: &[ElementReport],
    ) -> Result<ForcedStatus> {
        WorkQueue::synchronize(self, child_url, reports).await
    }
}
