//! Event-driven execution of enhancement jobs.
//!
//! `EnhancementJobHandler` is the scheduler:
//! 1. [`register`](EnhancementJobHandler::register) marks the job's first
//!    executable nodes as running and posts one event per node.
//! 2. A dispatcher task hands every event to its own Tokio task, which runs
//!    the node's engine and records the outcome on the job.
//! 3. Still holding the item's write lock, the same task either finishes the
//!    job (waking its observer) or starts the nodes that became executable.
//!
//! Synchronous engines run on the blocking pool with the item write-locked
//! for the whole run. Asynchronous engines run unlocked. Runtime workers never
//! wait on an item lock: every lock taken on behalf of async code is taken on
//! the blocking pool. Each event is processed in its own task, so a panic
//! anywhere in an engine (including `can_enhance`) is recorded as a failure.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{Level, debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use enhancer::{EngineError, EnhanceMode, EnhancementEngine};

use crate::job::JobWriteGuard;
use crate::{ChainError, EngineManager, EnhancementJob, EnhancementJobObserver};

/// Default interval of the daemon logging active jobs.
pub const DEFAULT_OBSERVER_INTERVAL: Duration = Duration::from_secs(10);
const MIN_OBSERVER_INTERVAL: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// "Execute `engine` for `job`". Posted after the node was marked running.
struct JobEvent {
    job: Arc<EnhancementJob>,
    engine: String,
}

/// What happened to a node that still needs to be recorded on the job.
enum Outcome {
    /// Recorded together with the engine run (synchronous engines).
    Recorded,
    Completed,
    Failed {
        instance: Option<Arc<dyn EnhancementEngine>>,
        error: Option<EngineError>,
    },
}

// ---------------------------------------------------------------------------
// EnhancementJobHandler
// ---------------------------------------------------------------------------

type ObserverMap = HashMap<Uuid, Arc<EnhancementJobObserver>>;

pub struct EnhancementJobHandler {
    engines: Arc<EngineManager>,
    events: mpsc::UnboundedSender<JobEvent>,
    /// `None` once closed.
    jobs: Mutex<Option<ObserverMap>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EnhancementJobHandler {
    /// Create a handler and spawn its dispatcher and observer daemon.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(engines: Arc<EngineManager>, observer_interval: Duration) -> Arc<Self> {
        let (events, rx) = mpsc::unbounded_channel();
        let handler = Arc::new(Self {
            engines,
            events,
            jobs: Mutex::new(Some(HashMap::new())),
            tasks: Mutex::new(Vec::new()),
        });
        let dispatcher = tokio::spawn(Self::dispatch(Arc::downgrade(&handler), rx));
        let daemon = tokio::spawn(Self::observe(Arc::downgrade(&handler), observer_interval));
        handler.lock_tasks().extend([dispatcher, daemon]);
        handler
    }

    fn lock_jobs(&self) -> MutexGuard<'_, Option<ObserverMap>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn engines(&self) -> &Arc<EngineManager> {
        &self.engines
    }

    pub fn is_closed(&self) -> bool {
        self.lock_jobs().is_none()
    }

    /// Jobs registered and not yet finished.
    pub fn active_jobs(&self) -> Vec<Arc<EnhancementJob>> {
        self.lock_jobs()
            .as_ref()
            .map(|jobs| jobs.values().map(|o| Arc::clone(o.job())).collect())
            .unwrap_or_default()
    }

    /// Register `job` and start executing it.
    ///
    /// Registering a job twice returns the observer of the first registration
    /// without starting anything.
    ///
    /// # Errors
    /// [`ChainError::Deactivated`] if the handler was closed.
    #[instrument(skip_all, fields(item = %job.content_item().uri(), chain = %job.chain_name()))]
    pub async fn register(
        self: &Arc<Self>,
        job: Arc<EnhancementJob>,
    ) -> Result<Arc<EnhancementJobObserver>, ChainError> {
        let observer = {
            let mut jobs = self.lock_jobs();
            let Some(jobs) = jobs.as_mut() else {
                return Err(ChainError::Deactivated(job.content_item().uri().to_owned()));
            };
            if let Some(existing) = jobs.get(&job.id()) {
                warn!("{job} is already registered");
                return Ok(Arc::clone(existing));
            }
            let observer = Arc::new(EnhancementJobObserver::new(Arc::clone(&job)));
            jobs.insert(job.id(), Arc::clone(&observer));
            observer
        };

        let handler = Arc::clone(self);
        let uri = job.content_item().uri().to_owned();
        run_blocking(&uri, move || handler.start(&job)).await?;
        Ok(observer)
    }

    /// Mark the chain in progress and start its first nodes.
    fn start(&self, job: &Arc<EnhancementJob>) {
        if tracing::enabled!(Level::DEBUG) {
            job.log_info(Some("Add EnhancementJob:"), tracing::enabled!(Level::TRACE));
        }
        job.start_processing();
        let mut guard = job.write();
        if !self.execute_next_nodes(job, &mut guard) {
            warn!("unable to start execution of {}", job.content_item().uri());
            guard.log_info(None, true);
            warn!("finishing job ...");
            self.finish(job, &guard);
        }
    }

    /// Stop accepting jobs, wake every waiting observer and stop the
    /// background tasks. Engines already running are not interrupted.
    pub fn close(&self) {
        info!("deactivate EnhancementJobHandler");
        if let Some(jobs) = self.lock_jobs().take() {
            for observer in jobs.values() {
                observer.notify_closed();
            }
        }
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
    }

    // -----------------------------------------------------------------------
    // Background tasks
    // -----------------------------------------------------------------------

    async fn dispatch(handler: Weak<Self>, mut rx: mpsc::UnboundedReceiver<JobEvent>) {
        while let Some(event) = rx.recv().await {
            let Some(handler) = handler.upgrade() else {
                break;
            };
            tokio::spawn(handler.handle_event(event));
        }
        debug!("event dispatcher stopped");
    }

    async fn observe(handler: Weak<Self>, interval: Duration) {
        debug!(" ... init EnhancementJobObserver daemon");
        let mut ticker = tokio::time::interval(interval.max(MIN_OBSERVER_INTERVAL));
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(handler) = handler.upgrade() else {
                break;
            };
            if handler.is_closed() {
                break;
            }
            let jobs = handler.active_jobs();
            drop(handler);
            if jobs.is_empty() {
                debug!(" -- no active enhancement jobs");
                continue;
            }
            debug!(" -- {} active enhancement jobs", jobs.len());
            if tracing::enabled!(Level::DEBUG) {
                let logged = tokio::task::spawn_blocking(move || {
                    for job in jobs {
                        job.log_info(None, true);
                    }
                })
                .await;
                if let Err(err) = logged {
                    warn!("unable to log active enhancement jobs: {err}");
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Event processing
    // -----------------------------------------------------------------------

    async fn handle_event(self: Arc<Self>, event: JobEvent) {
        let JobEvent { job, engine } = event;
        let processing = tokio::spawn(Arc::clone(&self).process_event(Arc::clone(&job), engine.clone()));
        let outcome = match processing.await {
            Ok(outcome) => outcome,
            Err(err) => Outcome::Failed {
                error: Some(panicked(&engine, err)),
                instance: self.engines.get(&engine),
            },
        };

        let handler = Arc::clone(&self);
        let uri = job.content_item().uri().to_owned();
        let scheduled = tokio::task::spawn_blocking(move || {
            let mut guard = job.write();
            handler.record(&job, &mut guard, &engine, outcome);
            handler.schedule_next(&job, &mut guard);
        })
        .await;
        if let Err(err) = scheduled {
            error!("unexpected error while scheduling content item {uri}: {err}");
        }
    }

    /// Run `name` for `job`. Synchronous runs record their outcome while
    /// still holding the write lock.
    async fn process_event(self: Arc<Self>, job: Arc<EnhancementJob>, name: String) -> Outcome {
        let Some(engine) = self.engines.get(&name) else {
            return Outcome::Failed {
                instance: None,
                error: None,
            };
        };

        let check_engine = Arc::clone(&engine);
        let check_item = Arc::clone(job.content_item());
        let checked = tokio::task::spawn_blocking(move || check_engine.can_enhance(&check_item)).await;
        let mode = match checked {
            Ok(Ok(mode)) => mode,
            Ok(Err(err)) => {
                warn!(
                    "unable to check if engine '{name}' can enhance content item '{}': {err}",
                    job.content_item().uri()
                );
                return Outcome::Failed {
                    instance: Some(engine),
                    error: Some(err),
                };
            }
            Err(err) => {
                return Outcome::Failed {
                    error: Some(panicked(&name, err)),
                    instance: Some(engine),
                };
            }
        };

        match mode {
            EnhanceMode::Synchronous => {
                let run_job = Arc::clone(&job);
                let run_engine = Arc::clone(&engine);
                let run_name = name.clone();
                let joined = tokio::task::spawn_blocking(move || {
                    trace!(engine = %run_name, "start sync execution");
                    let mut guard = run_job.write();
                    let result = run_engine.compute_enhancements(run_job.content_item(), guard.metadata());
                    let recorded = match result {
                        Ok(()) => guard.set_completed(&run_name),
                        Err(err) => {
                            warn!("{err}");
                            guard.set_failed(&run_name, Some(run_engine.as_ref()), Some(err))
                        }
                    };
                    if let Err(err) = recorded {
                        error!("unable to record execution of engine '{run_name}': {err}");
                    }
                    trace!(engine = %run_name, "finished sync execution");
                })
                .await;
                match joined {
                    Ok(()) => Outcome::Recorded,
                    Err(err) => Outcome::Failed {
                        error: Some(panicked(&name, err)),
                        instance: Some(engine),
                    },
                }
            }
            EnhanceMode::Asynchronous => {
                let run_job = Arc::clone(&job);
                let run_engine = Arc::clone(&engine);
                trace!(engine = %name, "start async execution");
                let joined = tokio::spawn(async move {
                    run_engine
                        .compute_enhancements_async(run_job.content_item())
                        .await
                })
                .await;
                trace!(engine = %name, "finished async execution");
                match joined {
                    Ok(Ok(())) => Outcome::Completed,
                    Ok(Err(err)) => {
                        warn!("{err}");
                        Outcome::Failed {
                            instance: Some(engine),
                            error: Some(err),
                        }
                    }
                    Err(err) => Outcome::Failed {
                        error: Some(panicked(&name, err)),
                        instance: Some(engine),
                    },
                }
            }
            EnhanceMode::CannotEnhance => {
                debug!(
                    "engine '{name}' cannot enhance content item {}",
                    job.content_item().uri()
                );
                Outcome::Completed
            }
        }
    }

    fn record(&self, job: &EnhancementJob, guard: &mut JobWriteGuard<'_>, engine: &str, outcome: Outcome) {
        let recorded = match outcome {
            Outcome::Recorded => Ok(()),
            Outcome::Completed => guard.set_completed(engine),
            Outcome::Failed { instance, error } => {
                guard.set_failed(engine, instance.as_deref(), error)
            }
        };
        if let Err(err) = recorded {
            error!(
                "unexpected error while processing content item {} with engine '{engine}': {err}",
                job.content_item().uri()
            );
        }
    }

    /// Finish the job or start whatever became executable.
    fn schedule_next(&self, job: &Arc<EnhancementJob>, guard: &mut JobWriteGuard<'_>) {
        if guard.is_finished() {
            self.finish(job, guard);
        } else if !guard.is_failed() {
            if !self.execute_next_nodes(job, guard) && guard.running().is_empty() {
                warn!(
                    "unexpected state in the execution of content item {}: job is not finished, \
                     nothing is running and nothing could be started -> finishing this job",
                    job.content_item().uri()
                );
                self.finish(job, guard);
            }
        } else {
            info!(
                "job {} failed, but {:?} still running",
                job.content_item().uri(),
                guard.running()
            );
        }
    }

    /// Mark every executable node as running and post an event for it.
    /// Returns whether anything was started.
    fn execute_next_nodes(&self, job: &Arc<EnhancementJob>, guard: &mut JobWriteGuard<'_>) -> bool {
        let mut started = false;
        for engine in guard.executable() {
            trace!(engine = %engine, "prepare execution");
            if let Err(err) = guard.set_running(&engine) {
                error!("unable to start engine '{engine}': {err}");
                continue;
            }
            let event = JobEvent {
                job: Arc::clone(job),
                engine,
            };
            if let Err(mpsc::error::SendError(event)) = self.events.send(event) {
                warn!(
                    "event dispatcher is gone, engine '{}' for {} will not run",
                    event.engine,
                    job.content_item().uri()
                );
                continue;
            }
            started = true;
        }
        started
    }

    /// Unregister `job` and wake its observer.
    fn finish(&self, job: &EnhancementJob, guard: &JobWriteGuard<'_>) {
        let observer = self
            .lock_jobs()
            .as_mut()
            .and_then(|jobs| jobs.remove(&job.id()));
        match observer {
            Some(observer) => {
                if tracing::enabled!(Level::DEBUG) {
                    guard.log_info(Some("Finished EnhancementJob:"), tracing::enabled!(Level::TRACE));
                }
                trace!(
                    "finished processing content item {} with chain {}",
                    job.content_item().uri(),
                    job.chain_name()
                );
                observer.notify_finished(guard.is_finished());
            }
            None => warn!(
                "{job} is not registered with the EnhancementJobHandler, will not send notification"
            ),
        }
    }
}

impl Drop for EnhancementJobHandler {
    fn drop(&mut self) {
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
    }
}

/// Run lock-taking work for `item` on the blocking pool. Panics are resumed
/// on the caller; a task cancelled by runtime shutdown reads as deactivation.
pub(crate) async fn run_blocking<T, F>(item: &str, f: F) -> Result<T, ChainError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => Ok(value),
        Err(err) => match err.try_into_panic() {
            Ok(payload) => std::panic::resume_unwind(payload),
            Err(_) => Err(ChainError::Deactivated(item.to_owned())),
        },
    }
}

fn panicked(engine: &str, err: JoinError) -> EngineError {
    let message = if err.is_panic() {
        panic_message(err.into_panic())
    } else {
        "engine task was cancelled".to_owned()
    };
    error!("engine '{engine}' panicked: {message}");
    EngineError::Panicked {
        engine: engine.to_owned(),
        message,
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .unwrap_or_else(|| "unknown panic".to_owned()),
    }
}
