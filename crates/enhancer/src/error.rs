//! Engine- and plan-level error types.

use thiserror::Error;

/// Errors returned by an engine's `can_enhance` / `compute_enhancements*`
/// methods.
///
/// The job manager does not retry: any variant fails the execution node. Only
/// the node's `optional` flag decides whether the chain survives it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The engine ran but could not produce its enhancements.
    #[error("engine '{engine}' failed: {message}")]
    Enhancement { engine: String, message: String },

    /// The content item is malformed for this engine (wrong encoding, …).
    #[error("engine '{engine}' rejected the content: {message}")]
    InvalidContent { engine: String, message: String },

    /// The engine task panicked; carries the panic payload if it was a string.
    #[error("engine '{engine}' panicked: {message}")]
    Panicked { engine: String, message: String },
}

impl EngineError {
    pub fn enhancement(engine: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Enhancement {
            engine: engine.into(),
            message: message.into(),
        }
    }

    pub fn invalid_content(engine: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidContent {
            engine: engine.into(),
            message: message.into(),
        }
    }

    /// The bare message, without the engine prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Enhancement { message, .. }
            | Self::InvalidContent { message, .. }
            | Self::Panicked { message, .. } => message,
        }
    }
}

/// Errors produced while building or validating an execution plan.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// Chains must be named; the name ends up in the execution metadata.
    #[error("chain name must not be empty")]
    EmptyChainName,

    /// An execution node without an engine name.
    #[error("execution node #{0} of the plan does not define an engine name")]
    EmptyEngineName(usize),

    /// Two nodes reference the same engine.
    #[error("engine '{0}' is used by more than one execution node")]
    DuplicateEngine(String),

    /// A `depends_on` entry names an engine that is not part of the plan.
    #[error("execution node '{engine}' depends on unknown node '{dependency}'")]
    UnknownDependency { engine: String, dependency: String },

    /// Topological sort detected a cycle.
    #[error("execution plan '{0}' contains a dependency cycle")]
    CycleDetected(String),

    /// A chain definition without any engine.
    #[error("chain '{0}' does not define any engine")]
    NoEngines(String),

    /// A graph chain line that could not be parsed.
    #[error("invalid chain configuration line '{line}': {reason}")]
    InvalidConfigLine { line: String, reason: String },
}
