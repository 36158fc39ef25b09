//! `jobmanager` crate: executes enhancement chains over content items.
//!
//! [`EventJobManager`] is the entry point. It creates an [`EnhancementJob`]
//! per content item, hands it to the event-driven [`EnhancementJobHandler`]
//! and waits on the job's [`EnhancementJobObserver`].

pub mod error;
pub mod handler;
pub mod job;
pub mod manager;
pub mod observer;
pub mod registry;

pub use error::ChainError;
pub use handler::EnhancementJobHandler;
pub use job::{EnhancementJob, JobFailure, JobWriteGuard};
pub use manager::{EventJobManager, JobManagerConfig};
pub use observer::EnhancementJobObserver;
pub use registry::{ChainManager, EngineManager};

#[cfg(test)]
mod handler_tests;
