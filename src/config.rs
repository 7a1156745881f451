use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkQueueError};
use crate::policy::StartPolicy;
use crate::scheduler::SiteCapacity;

/// Upper bound for the second-valued interval options (ten years).
pub const MAX_INTERVAL_SECS: u64 = 10 * 365 * 24 * 3600;

/// How data locations are tracked for matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackingMode {
    /// Declared intent to replicate (replica catalog subscriptions).
    #[default]
    Subscription,
    /// Physical replica presence. Requires block-level splitting.
    Location,
}

impl std::fmt::Display for TrackingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackingMode::Subscription => write!(f, "subscription"),
            TrackingMode::Location => write!(f, "location"),
        }
    }
}

/// Parameters handed to a start policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct SplitParams {
    /// Files per job for data-driven policies, events per job for Monte-Carlo.
    /// Falls back to the task's own setting when unset.
    pub slice_size: Option<u64>,
    /// Upper bound on jobs in a single Monte-Carlo element.
    pub max_jobs_per_element: Option<u64>,
}

/// One `SplittingMapping` entry: workload policy name -> implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyChoice {
    pub implementation: String,
    #[serde(default)]
    pub params: SplitParams,
}

impl PolicyChoice {
    pub fn new(implementation: impl Into<String>) -> Self {
        Self {
            implementation: implementation.into(),
            params: SplitParams::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct EndPolicySettings {
    /// Fraction of finished child elements that must be Done for the
    /// aggregate to report Done rather than Failed.
    pub success_threshold: f64,
}

impl Default for EndPolicySettings {
    fn default() -> Self {
        Self {
            success_threshold: 0.9,
        }
    }
}

/// Every option a queue recognises. Key names in a JSON config file are the
/// PascalCase option names (`QueueDepth`, `NegotiationTimeout`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct QueueConfig {
    /// URL of the queue to pull work from. `None` at the root.
    pub parent_queue: Option<String>,
    /// URL this queue is reachable on. Required when `parent_queue` is set.
    #[serde(rename = "QueueURL")]
    pub queue_url: Option<String>,
    /// Multiplier on tracked site slots when pulling work proactively.
    pub queue_depth: u64,
    pub split_by_block: bool,
    /// Priority units accrued per second an element waits.
    pub item_weight: f64,
    /// Seconds between forced full location refreshes.
    pub full_location_refresh_interval: u64,
    pub track_location_or_subscription: TrackingMode,
    pub release_incomplete_blocks: bool,
    pub release_require_subscribed: bool,
    /// Create and populate downstream subscriptions when work is handed out.
    pub populate_filesets: bool,
    /// Seconds an element may stay Negotiating before it is released.
    pub negotiation_timeout: u64,
    pub full_report_interval: u64,
    pub report_interval: u64,
    pub splitting_mapping: BTreeMap<String, PolicyChoice>,
    pub end_policy_settings: EndPolicySettings,
    /// Directory holding the per-split workload specs.
    pub cache_dir: PathBuf,
    /// Base URL of the replica catalog service.
    #[serde(rename = "PhEDExEndpoint")]
    pub phedex_endpoint: Option<String>,
    /// Seconds any single remote call may take.
    pub remote_timeout: u64,
    /// Locally tracked job slots per site.
    pub resources: SiteCapacity,
    /// Owner recorded for workloads that do not name one.
    pub owner: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            parent_queue: None,
            queue_url: None,
            queue_depth: 2,
            split_by_block: true,
            item_weight: 0.01,
            full_location_refresh_interval: 3600,
            track_location_or_subscription: TrackingMode::Subscription,
            release_incomplete_blocks: false,
            release_require_subscribed: true,
            populate_filesets: true,
            negotiation_timeout: 3600,
            full_report_interval: 3600,
            report_interval: 300,
            splitting_mapping: BTreeMap::new(),
            end_policy_settings: EndPolicySettings::default(),
            cache_dir: PathBuf::from("wf_cache"),
            phedex_endpoint: None,
            remote_timeout: 30,
            resources: SiteCapacity::new(),
            owner: None,
        }
    }
}

impl QueueConfig {
    /// Settings for a queue that holds whole workloads at the top of the tree.
    pub fn global() -> Self {
        let mut config = Self {
            split_by_block: false,
            populate_filesets: false,
            ..Default::default()
        };
        config
            .splitting_mapping
            .insert("DatasetBlock".to_string(), PolicyChoice::new("Dataset"));
        config
    }

    /// Settings for a queue close to the resources, releasing on block location.
    pub fn local() -> Self {
        Self {
            track_location_or_subscription: TrackingMode::Location,
            ..Default::default()
        }
    }

    pub fn with_parent(
        mut self,
        parent_queue: impl Into<String>,
        queue_url: impl Into<String>,
    ) -> Self {
        self.parent_queue = Some(parent_queue.into());
        self.queue_url = Some(queue_url.into());
        self
    }

    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = cache_dir.into();
        self
    }

    pub fn with_resource(mut self, site: impl Into<String>, slots: u64) -> Self {
        self.resources.insert(site.into(), slots);
        self
    }

    /// Load a config from a JSON file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            WorkQueueError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            WorkQueueError::Configuration(format!("invalid config {}: {}", path.display(), e))
        })
    }

    /// The configured mapping with the built-in entries filled in.
    pub fn effective_splitting_mapping(&self) -> BTreeMap<String, PolicyChoice> {
        let mut mapping = self.splitting_mapping.clone();
        let block_policy = if self.split_by_block { "Block" } else { "Dataset" };
        mapping
            .entry("DatasetBlock".to_string())
            .or_insert_with(|| PolicyChoice::new(block_policy));
        mapping
            .entry("MonteCarlo".to_string())
            .or_insert_with(|| PolicyChoice::new("MonteCarlo"));
        mapping
    }

    pub fn negotiation_timeout(&self) -> chrono::Duration {
        interval(self.negotiation_timeout)
    }

    pub fn full_report_interval(&self) -> chrono::Duration {
        interval(self.full_report_interval)
    }

    pub fn full_location_refresh_interval(&self) -> chrono::Duration {
        interval(self.full_location_refresh_interval)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval.max(1))
    }

    /// Reject option combinations the queue cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.track_location_or_subscription == TrackingMode::Location && !self.split_by_block {
            return Err(WorkQueueError::Configuration(
                "Only blocks can be released on location".to_string(),
            ));
        }
        if self.parent_queue.is_some() && self.queue_url.as_deref().unwrap_or("").is_empty() {
            return Err(WorkQueueError::Configuration(
                "ParentQueue defined but not QueueURL".to_string(),
            ));
        }
        for (name, choice) in &self.splitting_mapping {
            if !StartPolicy::is_known(&choice.implementation) {
                return Err(WorkQueueError::Configuration(format!(
                    "SplittingMapping '{}' names unknown policy '{}'",
                    name, choice.implementation
                )));
            }
        }
        let intervals = [
            ("NegotiationTimeout", self.negotiation_timeout),
            ("FullReportInterval", self.full_report_interval),
            ("FullLocationRefreshInterval", self.full_location_refresh_interval),
            ("ReportInterval", self.report_interval),
            ("RemoteTimeout", self.remote_timeout),
        ];
        for (name, secs) in intervals {
            if secs > MAX_INTERVAL_SECS {
                return Err(WorkQueueError::Configuration(format!(
                    "{} {}s exceeds the {}s limit",
                    name, secs, MAX_INTERVAL_SECS
                )));
            }
        }
        if !self.item_weight.is_finite() || self.item_weight < 0.0 {
            return Err(WorkQueueError::Configuration(format!(
                "ItemWeight {} must be a finite, non-negative number",
                self.item_weight
            )));
        }
        let threshold = self.end_policy_settings.success_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(WorkQueueError::Configuration(format!(
                "SuccessThreshold {} outside [0, 1]",
                threshold
            )));
        }
        Ok(())
    }
}

// Clamped so an unvalidated config cannot overflow chrono's range.
fn interval(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_INTERVAL_SECS) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_config_default() {
        let cfg = QueueConfig::default();
        assert!(cfg.parent_queue.is_none());
        assert!(cfg.queue_url.is_none());
        assert_eq!(cfg.queue_depth, 2);
        assert!(cfg.split_by_block);
        assert_eq!(cfg.item_weight, 0.01);
        assert_eq!(cfg.full_location_refresh_interval, 3600);
        assert_eq!(cfg.track_location_or_subscription, TrackingMode::Subscription);
        assert!(!cfg.release_incomplete_blocks);
        assert!(cfg.release_require_subscribed);
        assert!(cfg.populate_filesets);
        assert_eq!(cfg.negotiation_timeout, 3600);
        assert_eq!(cfg.full_report_interval, 3600);
        assert_eq!(cfg.report_interval, 300);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn global_preset_splits_by_dataset() {
        let cfg = QueueConfig::global();
        assert!(!cfg.split_by_block);
        assert!(!cfg.populate_filesets);
        let mapping = cfg.effective_splitting_mapping();
        assert_eq!(mapping["DatasetBlock"].implementation, "Dataset");
        assert_eq!(mapping["MonteCarlo"].implementation, "MonteCarlo");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn local_preset_tracks_location() {
        let cfg = QueueConfig::local();
        assert_eq!(cfg.track_location_or_subscription, TrackingMode::Location);
        assert_eq!(
            cfg.effective_splitting_mapping()["DatasetBlock"].implementation,
            "Block"
        );
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn location_tracking_requires_block_split() {
        let cfg = QueueConfig {
            split_by_block: false,
            ..QueueConfig::local()
        };
        assert!(matches!(
            cfg.validate(),
            Err(WorkQueueError::Configuration(_))
        ));
    }

    #[test]
    fn parent_without_queue_url_is_rejected() {
        let cfg = QueueConfig {
            parent_queue: Some("http://global:8080".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(WorkQueueError::Configuration(_))
        ));

        let cfg = cfg.with_parent("http://global:8080", "http://local:8081");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn unknown_policy_is_rejected() {
        let mut cfg = QueueConfig::default();
        cfg.splitting_mapping
            .insert("DatasetBlock".to_string(), PolicyChoice::new("ByRunNumber"));
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("ByRunNumber"));
    }

    #[test]
    fn success_threshold_out_of_range_is_rejected() {
        let cfg = QueueConfig {
            end_policy_settings: EndPolicySettings {
                success_threshold: 1.5,
            },
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn oversized_intervals_are_rejected() {
        let huge = 10_000_000_000_000_000;
        let negotiation = QueueConfig {
            negotiation_timeout: huge,
            ..Default::default()
        };
        let report = QueueConfig {
            full_report_interval: huge,
            ..Default::default()
        };
        let location = QueueConfig {
            full_location_refresh_interval: huge,
            ..Default::default()
        };
        for cfg in [&negotiation, &report, &location] {
            let err = cfg.validate().unwrap_err();
            assert!(matches!(err, WorkQueueError::Configuration(_)));
        }
        assert!(negotiation.validate().unwrap_err().to_string().contains("NegotiationTimeout"));
        assert!(report.validate().unwrap_err().to_string().contains("FullReportInterval"));
        assert!(location
            .validate()
            .unwrap_err()
            .to_string()
            .contains("FullLocationRefreshInterval"));

        let at_limit = QueueConfig {
            negotiation_timeout: MAX_INTERVAL_SECS,
            ..Default::default()
        };
        assert!(at_limit.validate().is_ok());
    }

    #[test]
    fn interval_conversion_never_overflows() {
        let cfg = QueueConfig {
            negotiation_timeout: u64::MAX,
            full_report_interval: u64::MAX,
            full_location_refresh_interval: u64::MAX,
            ..Default::default()
        };
        let limit = chrono::Duration::seconds(MAX_INTERVAL_SECS as i64);
        assert_eq!(cfg.negotiation_timeout(), limit);
        assert_eq!(cfg.full_report_interval(), limit);
        assert_eq!(cfg.full_location_refresh_interval(), limit);
        assert_eq!(
            QueueConfig::default().negotiation_timeout(),
            chrono::Duration::seconds(3600)
        );
    }

    #[test]
    fn invalid_item_weight_is_rejected() {
        for weight in [f64::NAN, f64::INFINITY, -0.5] {
            let cfg = QueueConfig {
                item_weight: weight,
                ..Default::default()
            };
            let err = cfg.validate().unwrap_err();
            assert!(err.to_string().contains("ItemWeight"));
        }
        let zero = QueueConfig {
            item_weight: 0.0,
            ..Default::default()
        };
        assert!(zero.validate().is_ok());
    }

    #[test]
    fn config_from_json_uses_option_names() {
        let raw = r#"{
            "ParentQueue": "http://global:8080",
            "QueueURL": "http://local:8081",
            "QueueDepth": 4,
            "TrackLocationOrSubscription": "location",
            "NegotiationTimeout": 60,
            "SplittingMapping": {"DatasetBlock": {"Implementation": "Block", "Params": {"SliceSize": 5}}},
            "Resources": {"T2_CH_CERN": 100}
        }"#;
        let cfg: QueueConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.parent_queue.as_deref(), Some("http://global:8080"));
        assert_eq!(cfg.queue_url.as_deref(), Some("http://local:8081"));
        assert_eq!(cfg.queue_depth, 4);
        assert_eq!(cfg.track_location_or_subscription, TrackingMode::Location);
        assert_eq!(cfg.negotiation_timeout, 60);
        assert_eq!(
            cfg.splitting_mapping["DatasetBlock"].params.slice_size,
            Some(5)
        );
        assert_eq!(cfg.resources["T2_CH_CERN"], 100);
        // untouched keys keep defaults
        assert_eq!(cfg.report_interval, 300);
        assert!(cfg.validate().is_ok());
    }
}
