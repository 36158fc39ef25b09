//! Execution metadata: the per-item record of how a chain was executed.
//!
//! Stored as a part of the [`ContentItem`](crate::ContentItem) so it is
//! guarded by the same lock as the enhancement metadata.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ExecutionPlan;

/// Lifecycle of a chain or engine execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Scheduled,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl ExecutionStatus {
    /// Completed, failed and skipped executions are all done.
    pub fn is_done(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Scheduled => "scheduled",
            Self::InProgress => "in-progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Timing and status shared by chain and engine executions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub status: ExecutionStatus,
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

impl ExecutionRecord {
    fn scheduled() -> Self {
        Self {
            status: ExecutionStatus::Scheduled,
            started: None,
            completed: None,
            message: None,
        }
    }

    pub fn set_in_progress(&mut self) {
        self.status = ExecutionStatus::InProgress;
        self.started = Some(Utc::now());
    }

    pub fn set_completed(&mut self, message: Option<String>) {
        self.status = ExecutionStatus::Completed;
        self.completed = Some(Utc::now());
        if message.is_some() {
            self.message = message;
        }
    }

    /// Failed executions always carry a message.
    pub fn set_failed(&mut self, message: String) {
        self.status = ExecutionStatus::Failed;
        self.completed = Some(Utc::now());
        self.message = Some(message);
    }

    /// Skipped executions get identical start and completion times.
    pub fn set_skipped(&mut self, message: Option<String>) {
        let now = Utc::now();
        self.status = ExecutionStatus::Skipped;
        self.started = Some(now);
        self.completed = Some(now);
        self.message = message;
    }

    /// Back to scheduled, forgetting any timestamps.
    pub fn set_scheduled(&mut self) {
        self.status = ExecutionStatus::Scheduled;
        self.started = None;
        self.completed = None;
    }

    /// Wall-clock duration in milliseconds, if both timestamps are known.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started, self.completed) {
            (Some(s), Some(c)) => Some((c - s).num_milliseconds()),
            _ => None,
        }
    }
}

/// The execution of the whole chain for one content item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainExecution {
    pub chain: String,
    pub default_chain: bool,
    #[serde(flatten)]
    pub record: ExecutionRecord,
}

/// The execution of one engine (one plan node).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineExecution {
    pub engine: String,
    pub optional: bool,
    #[serde(flatten)]
    pub record: ExecutionRecord,
}

/// Execution metadata of a content item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub chain_execution: ChainExecution,
    /// Keyed by engine name (the node identity).
    pub executions: BTreeMap<String, EngineExecution>,
    /// The plan the item is enhanced with.
    pub plan: Arc<ExecutionPlan>,
}

impl ExecutionMetadata {
    /// Fresh metadata with every execution scheduled.
    pub fn new(plan: Arc<ExecutionPlan>, default_chain: bool) -> Self {
        let executions = plan
            .nodes
            .iter()
            .map(|n| {
                (
                    n.engine.clone(),
                    EngineExecution {
                        engine: n.engine.clone(),
                        optional: n.optional,
                        record: ExecutionRecord::scheduled(),
                    },
                )
            })
            .collect();
        Self {
            chain_execution: ChainExecution {
                chain: plan.chain.clone(),
                default_chain,
                record: ExecutionRecord::scheduled(),
            },
            executions,
            plan,
        }
    }

    pub fn execution(&self, engine: &str) -> Option<&EngineExecution> {
        self.executions.get(engine)
    }

    pub fn execution_mut(&mut self, engine: &str) -> Option<&mut EngineExecution> {
        self.executions.get_mut(engine)
    }

    pub fn is_chain_failed(&self) -> bool {
        self.chain_execution.record.status == ExecutionStatus::Failed
    }

    /// Engine executions ordered by start time (unstarted ones last).
    pub fn executions_by_start(&self) -> Vec<&EngineExecution> {
        let mut executions: Vec<&EngineExecution> = self.executions.values().collect();
        executions.sort_by_key(|e| (e.record.started.is_none(), e.record.started));
        executions
    }

    /// One line per engine: `  -<engine>: <status>`.
    pub fn status_report(&self) -> String {
        let mut report = String::from("Status:\n");
        for (engine, exec) in &self.executions {
            report.push_str(&format!("  -{engine}: {}\n", exec.record.status));
        }
        report
    }

    /// A human readable summary of chain and engine durations.
    ///
    /// `concurrency` is the sum of engine durations over the chain duration;
    /// values above 1.0 mean engines overlapped.
    pub fn timing_summary(&self) -> String {
        let chain_ms = self.chain_execution.record.duration_ms().unwrap_or(0);
        let mut engines_ms = 0i64;
        let parts: Vec<String> = self
            .executions_by_start()
            .into_iter()
            .map(|e| {
                let ms = e.record.duration_ms().unwrap_or(0);
                engines_ms += ms;
                let pct = if chain_ms > 0 { ms * 100 / chain_ms } else { 0 };
                format!("{}: {ms}ms ({pct}%)", e.engine)
            })
            .collect();
        let concurrency = if chain_ms > 0 {
            engines_ms as f64 / chain_ms as f64
        } else {
            0.0
        };
        format!(
            "chain '{}' in {chain_ms}ms | chain:[{}], concurrency: {concurrency:.2}",
            self.chain_execution.chain,
            parts.join(", ")
        )
    }
}
