//! `enhancer` crate: the services API shared by engines and the job manager.
//!
//! Every engine, built-in or external, must implement
//! [`EnhancementEngine`]. The job manager dispatches content items to engines
//! through this trait object, following a validated [`ExecutionPlan`].

pub mod builtin;
pub mod chain;
pub mod content_item;
pub mod dag;
pub mod error;
pub mod execution;
pub mod mock;
pub mod plan;
pub mod traits;

pub use chain::{Chain, ChainDefinition};
pub use content_item::{ContentItem, Enhancement, EnhancementKind, ItemParts, Metadata};
pub use dag::validate_plan;
pub use error::{EngineError, PlanError};
pub use execution::{ExecutionMetadata, ExecutionStatus};
pub use plan::{ExecutionNode, ExecutionPlan};
pub use traits::{EnhanceMode, EnhancementEngine};
