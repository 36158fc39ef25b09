//! `EnhancementJob` tracks the enhancement of one content item by one chain.
//!
//! The job owns the `completed`, `running` and `executable` node sets and
//! mirrors every transition into the item's [`ExecutionMetadata`]. All
//! mutations happen while holding the item's write lock, all reads while
//! holding its read lock, so a job's state is always consistent with what
//! engines see in the metadata.
//!
//! Lock order: item lock first, then the job's own state mutex. The mutex is
//! never taken without the item lock.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLockWriteGuard};

use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use enhancer::{
    ContentItem, EngineError, EnhancementEngine, ExecutionMetadata, ExecutionNode, ExecutionPlan,
    ExecutionStatus, ItemParts, Metadata, validate_plan,
};

use crate::ChainError;

// ---------------------------------------------------------------------------
// Job state
// ---------------------------------------------------------------------------

/// The first failure of a required engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub engine: String,
    pub message: String,
    /// `None` when the engine was not available at all.
    pub source: Option<EngineError>,
}

#[derive(Debug, Default)]
struct JobState {
    completed: BTreeSet<String>,
    running: BTreeSet<String>,
    executable: BTreeSet<String>,
    failed: bool,
    error: Option<JobFailure>,
    error_messages: Vec<String>,
}

impl JobState {
    fn is_finished(&self) -> bool {
        self.running.is_empty() && self.executable.is_empty()
    }
}

// ---------------------------------------------------------------------------
// EnhancementJob
// ---------------------------------------------------------------------------

/// The enhancement of a [`ContentItem`] following an [`ExecutionPlan`].
pub struct EnhancementJob {
    id: Uuid,
    item: Arc<ContentItem>,
    chain: String,
    plan: Arc<ExecutionPlan>,
    state: Mutex<JobState>,
}

impl EnhancementJob {
    /// Create a job and initialise the item's execution metadata with every
    /// node scheduled.
    ///
    /// # Errors
    /// - [`ChainError::Plan`] if the plan does not validate.
    /// - [`ChainError::ExecutionMetadataPresent`] if the item already carries
    ///   execution metadata; use [`EnhancementJob::resume`] for those.
    pub fn new(
        item: Arc<ContentItem>,
        plan: Arc<ExecutionPlan>,
        default_chain: bool,
    ) -> Result<Self, ChainError> {
        validate_plan(&plan)?;
        let job = Self {
            id: Uuid::new_v4(),
            chain: plan.chain.clone(),
            plan: Arc::clone(&plan),
            state: Mutex::new(JobState::default()),
            item,
        };
        {
            let mut guard = job.write();
            if guard.parts.execution.is_some() {
                return Err(ChainError::ExecutionMetadataPresent(job.item.uri().to_owned()));
            }
            guard.parts.execution = Some(ExecutionMetadata::new(plan, default_chain));
            guard.check_executable();
        }
        Ok(job)
    }

    /// Re-create a job from the execution metadata already stored on `item`.
    ///
    /// Executions that were in progress are re-scheduled; completed, failed
    /// and skipped ones count as completed.
    pub fn resume(item: Arc<ContentItem>) -> Result<Self, ChainError> {
        let (plan, completed, failed) = {
            let mut parts = item.write();
            let em = parts
                .execution
                .as_mut()
                .ok_or_else(|| ChainError::MissingExecutionMetadata(item.uri().to_owned()))?;
            let mut completed = BTreeSet::new();
            for (engine, execution) in em.executions.iter_mut() {
                match execution.record.status {
                    ExecutionStatus::InProgress => execution.record.set_scheduled(),
                    status if status.is_done() => {
                        completed.insert(engine.clone());
                    }
                    _ => {}
                }
            }
            (Arc::clone(&em.plan), completed, em.is_chain_failed())
        };
        validate_plan(&plan)?;

        let job = Self {
            id: Uuid::new_v4(),
            chain: plan.chain.clone(),
            plan,
            state: Mutex::new(JobState {
                completed,
                failed,
                ..JobState::default()
            }),
            item,
        };
        job.write().check_executable();
        debug!("resumed {job} (chain '{}')", job.chain);
        Ok(job)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn content_item(&self) -> &Arc<ContentItem> {
        &self.item
    }

    /// Name of the chain the plan was built for. The chain itself may have
    /// changed since; the job keeps using its own plan.
    pub fn chain_name(&self) -> &str {
        &self.chain
    }

    pub fn execution_plan(&self) -> &Arc<ExecutionPlan> {
        &self.plan
    }

    /// Acquire the item's write lock for a sequence of state transitions.
    pub fn write(&self) -> JobWriteGuard<'_> {
        let parts = self.item.write();
        JobWriteGuard {
            state: self.lock_state(),
            parts,
            job: self,
        }
    }

    /// Read-locked access to the job state.
    fn read<R>(&self, f: impl FnOnce(&JobState, &ItemParts) -> R) -> R {
        let parts = self.item.read();
        let state = self.lock_state();
        f(&state, &parts)
    }

    fn lock_state(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn node(&self, engine: &str) -> Result<&ExecutionNode, ChainError> {
        self.plan.node(engine).ok_or_else(|| ChainError::UnknownNode {
            engine: engine.to_owned(),
            chain: self.chain.clone(),
        })
    }

    // ------------------------------------------------------------------
    // Write-locked convenience operations
    // ------------------------------------------------------------------

    /// See [`JobWriteGuard::set_running`].
    pub fn set_running(&self, engine: &str) -> Result<(), ChainError> {
        self.write().set_running(engine)
    }

    /// See [`JobWriteGuard::set_completed`].
    pub fn set_completed(&self, engine: &str) -> Result<(), ChainError> {
        self.write().set_completed(engine)
    }

    /// See [`JobWriteGuard::set_failed`].
    pub fn set_failed(
        &self,
        engine: &str,
        instance: Option<&dyn EnhancementEngine>,
        error: Option<EngineError>,
    ) -> Result<(), ChainError> {
        self.write().set_failed(engine, instance, error)
    }

    /// Mark the chain execution as in progress.
    pub fn start_processing(&self) {
        let mut guard = self.write();
        if let Some(em) = guard.parts.execution.as_mut() {
            em.chain_execution.record.set_in_progress();
        }
    }

    // ------------------------------------------------------------------
    // Read-locked snapshots
    // ------------------------------------------------------------------

    /// Nodes that may be started next.
    pub fn executable(&self) -> BTreeSet<String> {
        self.read(|s, _| s.executable.clone())
    }

    pub fn running(&self) -> BTreeSet<String> {
        self.read(|s, _| s.running.clone())
    }

    pub fn completed(&self) -> BTreeSet<String> {
        self.read(|s, _| s.completed.clone())
    }

    /// Nothing running and nothing left to start.
    pub fn is_finished(&self) -> bool {
        self.read(|s, _| s.is_finished())
    }

    /// A required engine failed. The job may still have running engines.
    pub fn is_failed(&self) -> bool {
        self.read(|s, _| s.failed)
    }

    /// The first failure of a required engine.
    pub fn error(&self) -> Option<JobFailure> {
        self.read(|s, _| s.error.clone())
    }

    /// Messages of all required-engine failures, in order.
    pub fn error_messages(&self) -> Vec<String> {
        self.read(|s, _| s.error_messages.clone())
    }

    /// The chain execution's status message (set when the chain failed).
    pub fn error_message(&self) -> Option<String> {
        self.read(|_, p| {
            p.execution
                .as_ref()
                .and_then(|em| em.chain_execution.record.message.clone())
        })
    }

    /// Snapshot of the execution metadata.
    pub fn execution_metadata(&self) -> Option<ExecutionMetadata> {
        self.read(|_, p| p.execution.clone())
    }

    /// `  -<engine>: <status>` lines for diagnostics.
    pub fn status_report(&self) -> String {
        self.read(|_, p| {
            p.execution
                .as_ref()
                .map(ExecutionMetadata::status_report)
                .unwrap_or_default()
        })
    }

    /// Like [`status_report`](Self::status_report), but `None` instead of
    /// waiting while an engine holds the item's write lock.
    pub fn try_status_report(&self) -> Option<String> {
        let parts = self.item.try_read()?;
        Some(
            parts
                .execution
                .as_ref()
                .map(ExecutionMetadata::status_report)
                .unwrap_or_default(),
        )
    }

    /// Log the job state at info level, including per-node state if
    /// `with_executions` is set.
    pub fn log_info(&self, header: Option<&str>, with_executions: bool) {
        self.read(|s, p| log_state(self, s, p, header, with_executions));
    }
}

fn log_state(
    job: &EnhancementJob,
    state: &JobState,
    parts: &ItemParts,
    header: Option<&str>,
    with_executions: bool,
) {
    if let Some(header) = header {
        info!("{header}");
    }
    info!("   finished:     {}", state.is_finished());
    info!("   state:        {}", if state.failed { "failed" } else { "processing" });
    info!("   chain:        {}", job.chain);
    info!("   content-item: {}", job.item.uri());
    if with_executions {
        info!("  executions:");
        for engine in &state.completed {
            info!("    - {engine} completed");
        }
        for engine in &state.running {
            info!("    - {engine} running");
        }
        for engine in &state.executable {
            info!("    - {engine} executable");
        }
    }
    if let Some(message) = parts
        .execution
        .as_ref()
        .and_then(|em| em.chain_execution.record.message.as_deref())
    {
        info!("Error Message: {message}");
    }
    if let Some(error) = state.error.as_ref().and_then(|e| e.source.as_ref()) {
        info!("Reported Error: {error}");
    }
}

impl fmt::Display for EnhancementJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnhancementJob for ContentItem {}", self.item.uri())
    }
}

impl fmt::Debug for EnhancementJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnhancementJob")
            .field("id", &self.id)
            .field("item", &self.item.uri())
            .field("chain", &self.chain)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// JobWriteGuard
// ---------------------------------------------------------------------------

/// Holds the item's write lock (and the job state) for as long as it lives.
///
/// The job manager runs synchronous engines through
/// [`metadata`](Self::metadata) and records their outcome before releasing the
/// guard, so the engine run and the state transition form one critical
/// section.
pub struct JobWriteGuard<'a> {
    // Field order is drop order: state mutex before the item lock.
    state: MutexGuard<'a, JobState>,
    parts: RwLockWriteGuard<'a, ItemParts>,
    job: &'a EnhancementJob,
}

impl JobWriteGuard<'_> {
    /// The item's enhancement metadata, for synchronous engines.
    pub fn metadata(&mut self) -> &mut Metadata {
        &mut self.parts.metadata
    }

    pub fn executable(&self) -> BTreeSet<String> {
        self.state.executable.clone()
    }

    pub fn running(&self) -> BTreeSet<String> {
        self.state.running.clone()
    }

    pub fn completed(&self) -> BTreeSet<String> {
        self.state.completed.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    pub fn is_failed(&self) -> bool {
        self.state.failed
    }

    /// Like [`EnhancementJob::log_info`], for callers already holding the lock.
    pub fn log_info(&self, header: Option<&str>, with_executions: bool) {
        log_state(self.job, &self.state, &self.parts, header, with_executions);
    }

    fn illegal_state(&self, engine: &str, reason: String) -> ChainError {
        let err = ChainError::IllegalState {
            engine: engine.to_owned(),
            chain: self.job.chain.clone(),
            item: self.job.item.uri().to_owned(),
            reason: format!(
                "{reason} (completed: {:?} | running: {:?})",
                self.state.completed, self.state.running
            ),
        };
        error!("{err}");
        err
    }

    fn dependencies_completed(&self, node: &ExecutionNode) -> bool {
        node.depends_on.iter().all(|d| self.state.completed.contains(d))
    }

    /// Mark `engine` as running.
    ///
    /// Calling this for a node that is already running only logs a warning.
    ///
    /// # Errors
    /// [`ChainError::IllegalState`] if the node is already completed or one
    /// of its dependencies is not.
    pub fn set_running(&mut self, engine: &str) -> Result<(), ChainError> {
        let job = self.job;
        let node = job.node(engine)?;
        if self.state.completed.contains(engine) {
            return Err(self.illegal_state(
                engine,
                "cannot set to running, it is already completed".into(),
            ));
        }
        if !self.dependencies_completed(node) {
            return Err(self.illegal_state(
                engine,
                format!(
                    "cannot set to running, dependencies {:?} are not all completed",
                    node.depends_on
                ),
            ));
        }
        if !self.state.running.insert(engine.to_owned()) {
            warn!(
                "execution of engine '{engine}' for {} already marked as running (chain: {}, optional: {}) -> call ignored",
                self.job.item.uri(),
                self.job.chain,
                node.optional
            );
            return Ok(());
        }
        trace!(engine, item = self.job.item.uri(), "started execution");
        if let Some(exec) = self
            .parts
            .execution
            .as_mut()
            .and_then(|em| em.execution_mut(engine))
        {
            exec.record.set_in_progress();
        }
        self.check_executable();
        Ok(())
    }

    /// Mark `engine` as completed.
    ///
    /// Calling this for a node that is already completed only logs a warning.
    ///
    /// # Errors
    /// [`ChainError::IllegalState`] if a dependency is not completed.
    pub fn set_completed(&mut self, engine: &str) -> Result<(), ChainError> {
        if self.complete_node(engine)? {
            if let Some(exec) = self
                .parts
                .execution
                .as_mut()
                .and_then(|em| em.execution_mut(engine))
            {
                exec.record.set_completed(None);
            }
        }
        Ok(())
    }

    /// Mark `engine` as failed.
    ///
    /// `instance` is `None` when no engine with that name was available. The
    /// node always ends up completed so dependents (or the end of the job) are
    /// not blocked. For required nodes the first failure also fails the
    /// chain; failures of optional nodes are only logged.
    pub fn set_failed(
        &mut self,
        engine: &str,
        instance: Option<&dyn EnhancementEngine>,
        error: Option<EngineError>,
    ) -> Result<(), ChainError> {
        let optional = self.job.node(engine)?.optional;

        let mut message = format!(
            "Unable to process content item '{}' with enhancement engine '{engine}' because the engine ",
            self.job.item.uri()
        );
        match instance {
            None => message.push_str("is currently not active"),
            Some(_) => message.push_str("was unable to process the content"),
        }
        if let Some(err) = &error {
            message.push_str(&format!(" (reason: {})", err.message()));
        }
        message.push('!');

        self.complete_node(engine)?;
        if let Some(exec) = self
            .parts
            .execution
            .as_mut()
            .and_then(|em| em.execution_mut(engine))
        {
            exec.record.set_failed(message.clone());
        }

        if optional {
            warn!("optional {message}");
            return Ok(());
        }

        warn!("{message}");
        self.state.error_messages.push(message.clone());
        if !self.state.failed {
            self.state.failed = true;
            if let Some(em) = self.parts.execution.as_mut() {
                em.chain_execution.record.set_failed(format!(
                    "Enhancement chain failed because required engine '{engine}' failed with message: {message}"
                ));
            }
            self.state.error = Some(JobFailure {
                engine: engine.to_owned(),
                message,
                source: error,
            });
            self.check_executable();
        }
        Ok(())
    }

    /// Move `engine` from running to completed. Returns `false` if it already
    /// was completed.
    fn complete_node(&mut self, engine: &str) -> Result<bool, ChainError> {
        let job = self.job;
        let node = job.node(engine)?;
        if self.state.completed.contains(engine) {
            warn!(
                "execution of engine '{engine}' for {} already marked as completed (chain: {}, optional: {}) -> call ignored",
                self.job.item.uri(),
                self.job.chain,
                node.optional
            );
            return Ok(false);
        }
        if !self.dependencies_completed(node) {
            return Err(self.illegal_state(
                engine,
                format!(
                    "cannot set to completed, dependencies {:?} are not all completed",
                    node.depends_on
                ),
            ));
        }
        if self.state.running.remove(engine) {
            trace!(engine, item = self.job.item.uri(), "completed execution");
        }
        self.state.completed.insert(engine.to_owned());
        self.check_executable();
        Ok(true)
    }

    /// Recompute `executable`. Once finished, mark the chain execution
    /// completed, or the nodes that never ran skipped if the chain failed.
    fn check_executable(&mut self) {
        let state = &mut *self.state;
        if state.failed {
            state.executable.clear();
        } else {
            let mut executable = self.job.plan.executable(&state.completed);
            executable.retain(|e| !state.running.contains(e));
            trace!(?executable, "executable nodes");
            state.executable = executable;
        }

        if !state.is_finished() {
            return;
        }
        let Some(em) = self.parts.execution.as_mut() else {
            return;
        };
        if state.failed {
            // Nodes that never got to run.
            for execution in em.executions.values_mut() {
                if execution.record.status == ExecutionStatus::Scheduled {
                    execution
                        .record
                        .set_skipped(Some("skipped because the enhancement chain failed".into()));
                }
            }
        } else if em.chain_execution.record.status != ExecutionStatus::Completed {
            em.chain_execution.record.set_completed(None);
        }
    }
}
