//! Pluggable policies.
//!
//! - Start policies split a workload into [`WorkUnit`]s. A queue resolves its
//!   `SplittingMapping` into a [`PolicyRegistry`] once, at construction.
//! - The [`EndPolicy`] folds the elements a child created for one parent
//!   element into the single [`ElementReport`] sent upward.

pub mod end;
pub mod start;

pub use end::{ElementReport, EndPolicy};
pub use start::{PolicyRegistry, StartPolicy, WorkUnit};
