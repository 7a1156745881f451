pub mod element;
pub mod matcher;
pub mod store;

pub use element::{
    ElementId, ElementSelector, ElementStatus, ForcedStatus, NewElement, SiteCapacity,
    WorkQueueElement,
};
pub use matcher::{Match, MatchOutcome, Matcher};
pub use store::{ElementFilter, ElementStore, WorkloadRecord};
