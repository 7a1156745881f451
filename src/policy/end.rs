use serde::{Deserialize, Serialize};

use crate::config::EndPolicySettings;
use crate::scheduler::{ElementId, ElementStatus, WorkQueueElement};

/// What a child tells its parent about one parent-visible element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementReport {
    pub parent_queue_id: ElementId,
    pub status: ElementStatus,
    /// Child elements that made up the report.
    #[serde(default)]
    pub elements: usize,
    #[serde(default)]
    pub done: usize,
    #[serde(default)]
    pub failed: usize,
}

impl ElementReport {
    pub fn new(parent_queue_id: ElementId, status: ElementStatus) -> Self {
        Self {
            parent_queue_id,
            status,
            elements: 0,
            done: 0,
            failed: 0,
        }
    }
}

/// Reduces the child elements created for one parent element to a single report.
#[derive(Debug, Clone, Default)]
pub struct EndPolicy {
    settings: EndPolicySettings,
}

impl EndPolicy {
    pub fn new(settings: EndPolicySettings) -> Self {
        Self { settings }
    }

    /// Aggregate status of a group:
    /// - nothing started yet: Available
    /// - anything still live: Acquired
    /// - everything canceled: Canceled
    /// - otherwise Done if the done share of finished work reaches the
    ///   success threshold, else Failed
    pub fn aggregate(
        &self,
        parent_queue_id: ElementId,
        group: &[&WorkQueueElement],
    ) -> Option<ElementReport> {
        if group.is_empty() {
            return None;
        }

        let count = |status: ElementStatus| group.iter().filter(|e| e.status == status).count();
        let available = count(ElementStatus::Available);
        let done = count(ElementStatus::Done);
        let failed = count(ElementStatus::Failed);
        let canceled = count(ElementStatus::Canceled);
        let live = group.iter().filter(|e| !e.status.is_terminal()).count();

        let status = if available == group.len() {
            ElementStatus::Available
        } else if live > 0 {
            ElementStatus::Acquired
        } else if canceled == group.len() {
            ElementStatus::Canceled
        } else {
            let finished = done + failed;
            let share = if finished == 0 {
                0.0
            } else {
                done as f64 / finished as f64
            };
            if share >= self.settings.success_threshold {
                ElementStatus::Done
            } else {
                ElementStatus::Failed
            }
        };

        Some(ElementReport {
            parent_queue_id,
            status,
            elements: group.len(),
            done,
            failed,
        })
    }
}
