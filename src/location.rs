//! Data location tracking.
//!
//! The [`LocationResolver`] turns block and dataset names into the sites that
//! can run work on them, asking a [`ReplicaCatalog`] either for physical
//! replicas (`location` mode) or for declared subscriptions
//! (`subscription` mode). Refreshes are incremental from a watermark returned
//! by the catalog, with a full refresh forced every
//! `FullLocationRefreshInterval` seconds.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::is_block_name;
use crate::config::{QueueConfig, TrackingMode};
use crate::error::{Result, WorkQueueError};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplicaQuery {
    pub blocks: Vec<String>,
    pub complete_only: bool,
    pub subscribed_only: bool,
    pub update_since: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionQuery {
    pub blocks: Vec<String>,
    pub datasets: Vec<String>,
    pub update_since: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Replica {
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub se: Option<String>,
}

impl Replica {
    /// Storage element name, or the node when the catalog gives none.
    pub fn site(&self) -> &str {
        self.se.as_deref().unwrap_or(&self.node)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockReplicas {
    pub name: String,
    #[serde(rename = "replica", default)]
    pub replicas: Vec<Replica>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicaResponse {
    pub request_timestamp: f64,
    #[serde(rename = "block", default)]
    pub blocks: Vec<BlockReplicas>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub node: String,
    #[serde(default)]
    pub suspended: Option<String>,
}

impl Subscription {
    pub fn active(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            suspended: Some("n".to_string()),
        }
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self.suspended.as_deref(), Some("y") | Some("Y"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockSubscriptions {
    pub name: String,
    #[serde(rename = "subscription", default)]
    pub subscriptions: Vec<Subscription>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetSubscriptions {
    pub name: String,
    #[serde(rename = "subscription", default)]
    pub subscriptions: Vec<Subscription>,
    #[serde(rename = "block", default)]
    pub blocks: Vec<BlockSubscriptions>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionResponse {
    pub request_timestamp: f64,
    #[serde(rename = "dataset", default)]
    pub datasets: Vec<DatasetSubscriptions>,
}

/// Replica catalog service.
#[async_trait]
pub trait ReplicaCatalog: Send + Sync {
    async fn get_replicas(&self, query: &ReplicaQuery) -> Result<ReplicaResponse>;

    /// Only active (non-suspended) subscriptions are requested.
    async fn get_subscriptions(&self, query: &SubscriptionQuery) -> Result<SubscriptionResponse>;
}

#[derive(Deserialize)]
struct Envelope<T> {
    phedex: T,
}

/// Replica catalog spoken to over its JSON HTTP API.
#[derive(Debug, Clone)]
pub struct HttpReplicaCatalog {
    client: reqwest::Client,
    base_url: String,
}

impl HttpReplicaCatalog {
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

    async fn fetch<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self.client.get(&url).query(params).send().await?;
        if !response.status().is_success() {
            return Err(WorkQueueError::RemoteUnavailable(format!(
                "{} returned HTTP {}",
                url,
                response.status()
            )));
        }
        let envelope: Envelope<T> = response.json().await?;
        Ok(envelope.phedex)
    }
}

#[async_trait]
impl ReplicaCatalog for HttpReplicaCatalog {
    async fn get_replicas(&self, query: &ReplicaQuery) -> Result<ReplicaResponse> {
        let mut params: Vec<(&str, String)> =
            query.blocks.iter().map(|b| ("block", b.clone())).collect();
        if query.complete_only {
            params.push(("complete", "y".to_string()));
        }
        if query.subscribed_only {
            params.push(("subscribed", "y".to_string()));
        }
        if let Some(since) = query.update_since {
            params.push(("update_since", since.to_string()));
        }
        self.fetch("blockreplicas", &params).await
    }

    async fn get_subscriptions(&self, query: &SubscriptionQuery) -> Result<SubscriptionResponse> {
        let mut params: Vec<(&str, String)> = vec![("suspended", "n".to_string())];
        params.extend(query.blocks.iter().map(|b| ("block", b.clone())));
        params.extend(query.datasets.iter().map(|d| ("dataset", d.clone())));
        if let Some(since) = query.update_since {
            params.push(("update_since", since.to_string()));
        }
        self.fetch("subscriptions", &params).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticReplica {
    pub site: String,
    pub complete: bool,
    pub subscribed: bool,
}

#[derive(Debug, Default)]
struct StaticState {
    replicas: BTreeMap<String, Vec<StaticReplica>>,
    subscriptions: BTreeMap<String, DatasetSubscriptions>,
    clock: f64,
    replica_queries: Vec<ReplicaQuery>,
    subscription_queries: Vec<SubscriptionQuery>,
}

/// Replica catalog held in memory, for tests and single-host setups.
#[derive(Debug, Default)]
pub struct StaticReplicaCatalog {
    state: Mutex<StaticState>,
}

impl StaticReplicaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, StaticState>> {
        self.state
            .lock()
            .map_err(|_| WorkQueueError::Internal("replica catalog lock poisoned".to_string()))
    }

    pub fn add_replica(&self, block: &str, site: &str, complete: bool, subscribed: bool) {
        if let Ok(mut state) = self.lock() {
            state
                .replicas
                .entry(block.to_string())
                .or_default()
                .push(StaticReplica {
                    site: site.to_string(),
                    complete,
                    subscribed,
                });
        }
    }

    pub fn set_dataset_subscriptions(&self, subscriptions: DatasetSubscriptions) {
        if let Ok(mut state) = self.lock() {
            state
                .subscriptions
                .insert(subscriptions.name.clone(), subscriptions);
        }
    }

    pub fn replica_queries(&self) -> Vec<ReplicaQuery> {
        self.lock()
            .map(|s| s.replica_queries.clone())
            .unwrap_or_default()
    }

    pub fn subscription_queries(&self) -> Vec<SubscriptionQuery> {
        self.lock()
            .map(|s| s.subscription_queries.clone())
            .unwrap_or_default()
    }
}

fn dataset_of(block: &str) -> &str {
    block.split('#').next().unwrap_or(block)
}

#[async_trait]
impl ReplicaCatalog for StaticReplicaCatalog {
    async fn get_replicas(&self, query: &ReplicaQuery) -> Result<ReplicaResponse> {
        let mut state = self.lock()?;
        state.clock += 1.0;
        state.replica_queries.push(query.clone());

        let blocks = query
            .blocks
            .iter()
            .filter_map(|name| {
                let replicas = state.replicas.get(name)?;
                Some(BlockReplicas {
                    name: name.clone(),
                    replicas: replicas
                        .iter()
                        .filter(|r| !query.complete_only || r.complete)
                        .filter(|r| !query.subscribed_only || r.subscribed)
                        .map(|r| Replica {
                            node: r.site.clone(),
                            se: Some(r.site.clone()),
                        })
                        .collect(),
                })
            })
            .collect();

        Ok(ReplicaResponse {
            request_timestamp: state.clock,
            blocks,
        })
    }

    async fn get_subscriptions(&self, query: &SubscriptionQuery) -> Result<SubscriptionResponse> {
        let mut state = self.lock()?;
        state.clock += 1.0;
        state.subscription_queries.push(query.clone());

        let wanted: BTreeSet<&str> = query
            .datasets
            .iter()
            .map(String::as_str)
            .chain(query.blocks.iter().map(|b| dataset_of(b)))
            .collect();

        let active = |subs: &[Subscription]| -> Vec<Subscription> {
            subs.iter().filter(|s| !s.is_suspended()).cloned().collect()
        };
        let datasets = wanted
            .into_iter()
            .filter_map(|name| state.subscriptions.get(name))
            .map(|d| DatasetSubscriptions {
                name: d.name.clone(),
                subscriptions: active(&d.subscriptions),
                blocks: d
                    .blocks
                    .iter()
                    .map(|b| BlockSubscriptions {
                        name: b.name.clone(),
                        subscriptions: active(&b.subscriptions),
                    })
                    .collect(),
            })
            .collect();

        Ok(SubscriptionResponse {
            request_timestamp: state.clock,
            datasets,
        })
    }
}

/// Resolves data names to sites and owns the refresh watermarks of one queue.
pub struct LocationResolver {
    mode: TrackingMode,
    release_incomplete_blocks: bool,
    release_require_subscribed: bool,
    full_refresh_interval: chrono::Duration,
    catalog: Arc<dyn ReplicaCatalog>,
    /// Catalog timestamp of the last answer; next incremental query starts here.
    last_update: Option<f64>,
    last_full_refresh: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for LocationResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocationResolver")
            .field("mode", &self.mode)
            .field("last_update", &self.last_update)
            .field("last_full_refresh", &self.last_full_refresh)
            .finish()
    }
}

impl LocationResolver {
    pub fn new(config: &QueueConfig, catalog: Arc<dyn ReplicaCatalog>) -> Self {
        Self {
            mode: config.track_location_or_subscription,
            release_incomplete_blocks: config.release_incomplete_blocks,
            release_require_subscribed: config.release_require_subscribed,
            full_refresh_interval: config.full_location_refresh_interval(),
            catalog,
            last_update: None,
            last_full_refresh: None,
        }
    }

    pub fn mode(&self) -> TrackingMode {
        self.mode
    }

    pub fn last_update(&self) -> Option<f64> {
        self.last_update
    }

    /// A full refresh is due when none happened yet or the interval elapsed.
    pub fn full_refresh_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_full_refresh {
            None => true,
            Some(at) => now - at > self.full_refresh_interval,
        }
    }

    pub fn mark_full_refresh(&mut self, now: DateTime<Utc>) {
        self.last_full_refresh = Some(now);
    }

    /// Sites for each requested name. Names the catalog knows nothing about
    /// are absent from the result.
    pub async fn locations(
        &mut self,
        names: &[String],
        full_refresh: bool,
    ) -> Result<HashMap<String, Vec<String>>> {
        let since = if full_refresh { None } else { self.last_update };
        match self.mode {
            TrackingMode::Location => self.replica_locations(names, since).await,
            TrackingMode::Subscription => self.subscription_locations(names, since).await,
        }
    }

    async fn replica_locations(
        &mut self,
        names: &[String],
        since: Option<f64>,
    ) -> Result<HashMap<String, Vec<String>>> {
        let query = ReplicaQuery {
            blocks: names.to_vec(),
            complete_only: !self.release_incomplete_blocks,
            subscribed_only: self.release_require_subscribed,
            update_since: since,
        };
        let response = self.catalog.get_replicas(&query).await?;
        self.last_update = Some(response.request_timestamp);

        let mut result: HashMap<String, Vec<String>> = HashMap::new();
        for block in response.blocks {
            let sites = result.entry(block.name).or_default();
            sites.extend(block.replicas.iter().map(|r| r.site().to_string()));
        }
        Ok(result)
    }

    async fn subscription_locations(
        &mut self,
        names: &[String],
        since: Option<f64>,
    ) -> Result<HashMap<String, Vec<String>>> {
        let (blocks, datasets): (Vec<String>, Vec<String>) =
            names.iter().cloned().partition(|n| is_block_name(n));
        let query = SubscriptionQuery {
            blocks: blocks.clone(),
            datasets: datasets.clone(),
            update_since: since,
        };
        let response = self.catalog.get_subscriptions(&query).await?;
        self.last_update = Some(response.request_timestamp);

        let nodes = |subs: &[Subscription]| -> BTreeSet<String> {
            subs.iter()
                .filter(|s| !s.is_suspended())
                .map(|s| s.node.clone())
                .collect()
        };

        let mut result = HashMap::new();
        for dataset in response.datasets {
            let dataset_nodes = nodes(&dataset.subscriptions);

            if datasets.contains(&dataset.name) {
                let sites = if !dataset_nodes.is_empty() {
                    dataset_nodes.clone()
                } else {
                    // No dataset subscription: only sites subscribed to every block
                    let mut common: Option<BTreeSet<String>> = None;
                    for block in &dataset.blocks {
                        let block_nodes = nodes(&block.subscriptions);
                        common = Some(match common {
                            None => block_nodes,
                            Some(acc) => acc.intersection(&block_nodes).cloned().collect(),
                        });
                    }
                    common.unwrap_or_default()
                };
                result.insert(dataset.name.clone(), sites.into_iter().collect());
            }

            // A block is wherever it or its whole dataset is subscribed
            for name in blocks.iter().filter(|b| dataset_of(b) == dataset.name) {
                let mut sites = dataset_nodes.clone();
                if let Some(block) = dataset.blocks.iter().find(|b| &b.name == name) {
                    sites.extend(nodes(&block.subscriptions));
                }
                result.insert(name.clone(), sites.into_iter().collect());
            }
        }
        Ok(result)
    }
}
