//! Job-manager-level error types.

use std::time::Duration;

use thiserror::Error;

use enhancer::{EngineError, PlanError};

/// Errors produced by the job manager (job state, scheduling, waiting).
#[derive(Debug, Error)]
pub enum ChainError {
    // ------ Configuration errors ------

    /// The chain's execution plan is invalid.
    #[error(transparent)]
    Plan(#[from] PlanError),

    /// `enhance_content` without a chain, but no default chain is registered.
    #[error("unable to enhance content item '{0}': no enhancement chain is active")]
    NoDefaultChain(String),

    /// A chain name that is not registered with the chain manager.
    #[error("unknown enhancement chain '{0}'")]
    UnknownChain(String),

    // ------ Job state errors ------

    /// A state transition that would violate the execution plan. Indicates a
    /// bug in the scheduler, not a runtime condition.
    #[error("illegal state transition for engine '{engine}' (chain '{chain}', content item '{item}'): {reason}")]
    IllegalState {
        engine: String,
        chain: String,
        item: String,
        reason: String,
    },

    /// An engine name that is not part of the job's execution plan.
    #[error("engine '{engine}' is not part of the execution plan of chain '{chain}'")]
    UnknownNode { engine: String, chain: String },

    /// A new job for an item that is already (or was) being enhanced.
    #[error("content item '{0}' already carries execution metadata")]
    ExecutionMetadataPresent(String),

    /// Resuming a job for an item that was never enhanced.
    #[error("content item '{0}' carries no execution metadata to resume from")]
    MissingExecutionMetadata(String),

    // ------ Execution errors ------

    /// A required engine failed; the chain was aborted.
    #[error("{message}")]
    EngineFailed {
        engine: String,
        message: String,
        #[source]
        source: Option<EngineError>,
    },

    /// The job did not finish within the configured wait time.
    #[error(
        "execution timeout after {:.3}sec (timeout: {}sec) for content item {item}\n{status}",
        .elapsed.as_secs_f64(),
        .timeout.as_secs()
    )]
    Timeout {
        item: String,
        elapsed: Duration,
        timeout: Duration,
        /// Per-engine status snapshot.
        status: String,
    },

    /// The job handler was closed while (or before) the job ran.
    #[error("the enhancement job manager was deactivated while enhancing content item {0}")]
    Deactivated(String),
}
