use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scheduler::element::{ElementId, SiteCapacity, WorkQueueElement};
use crate::scheduler::store::ElementStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    pub element_id: ElementId,
    pub site: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchOutcome {
    pub matches: Vec<Match>,
    /// Leftover slots per site; sites with nothing left are omitted.
    pub unmatched: SiteCapacity,
}

/// Matches Available elements to declared site capacity.
///
/// Elements are visited by effective priority (priority plus `item_weight`
/// per second waited), each is placed whole on the eligible site with the
/// most remaining slots, consuming up to its estimated job count. The matcher
/// only reads the store; the caller applies the status transition while still
/// holding the same store lock.
#[derive(Debug, Clone, Copy)]
pub struct Matcher {
    item_weight: f64,
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new(0.01)
    }
}

impl Matcher {
    pub fn new(item_weight: f64) -> Self {
        Self { item_weight }
    }

    pub fn item_weight(&self) -> f64 {
        self.item_weight
    }

    /// True if `element` may run at `site`: whitelist, blacklist and, for
    /// elements with input data, a known replica at the site.
    pub fn is_eligible(store: &ElementStore, element: &WorkQueueElement, site: &str) -> bool {
        if !element.allows_site(site) {
            return false;
        }
        match element.input {
            None => true,
            Some(ref input) => store
                .data_locations(input)
                .map(|sites| sites.contains(site))
                .unwrap_or(false),
        }
    }

    pub fn match_work(
        &self,
        store: &ElementStore,
        capacity: &SiteCapacity,
        now: DateTime<Utc>,
    ) -> MatchOutcome {
        let mut remaining: SiteCapacity = capacity
            .iter()
            .filter(|(_, &slots)| slots > 0)
            .map(|(site, &slots)| (site.clone(), slots))
            .collect();

        let mut candidates: Vec<(f64, &WorkQueueElement)> = store
            .available()
            .map(|e| (e.effective_priority(self.item_weight, now), e))
            .collect();
        candidates.sort_by(|(pa, a), (pb, b)| {
            pb.partial_cmp(pa)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.inserted_at.cmp(&b.inserted_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut matches = Vec::new();
        for (_, element) in candidates {
            if remaining.is_empty() {
                break;
            }

            // Most free slots first, ties broken by site name
            let site = remaining
                .iter()
                .filter(|(site, _)| Self::is_eligible(store, element, site))
                .max_by(|(sa, a), (sb, b)| a.cmp(b).then_with(|| sb.cmp(sa)))
                .map(|(site, _)| site.clone());

            let Some(site) = site else {
                continue;
            };

            if let Some(slots) = remaining.get_mut(&site) {
                *slots = slots.saturating_sub(element.jobs);
                if *slots == 0 {
                    remaining.remove(&site);
                }
            }
            tracing::debug!(
                element_id = element.id,
                site = %site,
                jobs = element.jobs,
                "Element matched"
            );
            matches.push(Match {
                element_id: element.id,
                site,
            });
        }

        MatchOutcome {
            matches,
            unmatched: remaining,
        }
    }
}
