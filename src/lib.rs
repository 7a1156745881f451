pub mod api;
pub mod catalog;
pub mod config;
pub mod downstream;
pub mod error;
pub mod location;
pub mod policy;
pub mod queue;
pub mod remote;
pub mod scheduler;
pub mod service;
pub mod shutdown;
pub mod workload;

pub use config::QueueConfig;
pub use error::{Result, WorkQueueError};
pub use queue::{WorkQueue, WorkQueueBuilder};
