//! End-to-end tests for the job manager.
//!
//! All tests use `MockEngine` so the scheduling can be observed without any
//! real enhancement engine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use enhancer::mock::MockEngine;
use enhancer::{
    Chain, ContentItem, EngineError, EnhanceMode, Enhancement, EnhancementEngine, EnhancementKind,
    ExecutionNode, ExecutionPlan, ExecutionStatus, Metadata,
};

use crate::{
    ChainError, ChainManager, EngineManager, EnhancementJob, EnhancementJobHandler,
    EventJobManager, JobManagerConfig,
};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct Fixture {
    manager: Arc<EventJobManager>,
    mocks: HashMap<String, Arc<MockEngine>>,
}

impl Fixture {
    fn calls(&self, engine: &str) -> usize {
        self.mocks[engine].call_count()
    }
}

/// Registers `mocks` and `plan` (as the default chain).
fn fixture(mocks: Vec<MockEngine>, plan: ExecutionPlan, max_wait_time_ms: u64) -> Fixture {
    let engines = Arc::new(EngineManager::new());
    let mut registered = HashMap::new();
    for mock in mocks {
        let mock = Arc::new(mock);
        engines.register(mock.clone());
        registered.insert(mock.name.clone(), mock);
    }
    let chains = Arc::new(ChainManager::new(Some(plan.chain.clone())));
    chains.register(Chain::new(plan).expect("valid test chain"));

    let config = JobManagerConfig {
        max_wait_time_ms,
        ..JobManagerConfig::default()
    };
    Fixture {
        manager: Arc::new(EventJobManager::activate(engines, chains, config)),
        mocks: registered,
    }
}

fn linear(chain: &str, engines: &[&str]) -> ExecutionPlan {
    let nodes = engines
        .iter()
        .enumerate()
        .map(|(i, engine)| match i {
            0 => ExecutionNode::new(*engine),
            _ => ExecutionNode::new(*engine).depends_on([engines[i - 1]]),
        })
        .collect();
    ExecutionPlan::new(chain, nodes)
}

/// a → {b, c}, d → c
fn fan_out(b_optional: bool) -> ExecutionPlan {
    let mut b = ExecutionNode::new("b").depends_on(["a"]);
    b.optional = b_optional;
    ExecutionPlan::new(
        "fan-out",
        vec![
            ExecutionNode::new("a"),
            b,
            ExecutionNode::new("c").depends_on(["a"]),
            ExecutionNode::new("d").depends_on(["c"]),
        ],
    )
}

/// Asynchronous engine relying on the trait's default async implementation.
struct DefaultAsyncEngine;

impl EnhancementEngine for DefaultAsyncEngine {
    fn name(&self) -> &str {
        "default-async"
    }

    fn can_enhance(&self, _item: &ContentItem) -> Result<EnhanceMode, EngineError> {
        Ok(EnhanceMode::Asynchronous)
    }

    fn compute_enhancements(
        &self,
        _item: &ContentItem,
        metadata: &mut Metadata,
    ) -> Result<(), EngineError> {
        metadata.add(Enhancement::new(self.name(), EnhancementKind::TextAnnotation));
        Ok(())
    }
}

fn item() -> Arc<ContentItem> {
    Arc::new(ContentItem::from_text("The Eiffel Tower is in Paris."))
}

fn status(item: &ContentItem, engine: &str) -> ExecutionStatus {
    item.execution_metadata()
        .expect("execution metadata")
        .execution(engine)
        .expect("engine execution")
        .record
        .status
}

fn chain_status(item: &ContentItem) -> ExecutionStatus {
    item.execution_metadata()
        .expect("execution metadata")
        .chain_execution
        .record
        .status
}

// ============================================================
// Successful chains
// ============================================================

#[tokio::test]
async fn linear_chain_runs_in_dependency_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let f = fixture(
        vec![
            MockEngine::synchronous("a").with_call_log(log.clone()),
            MockEngine::asynchronous("b").with_call_log(log.clone()),
            MockEngine::synchronous("c").with_call_log(log.clone()),
        ],
        linear("linear", &["a", "b", "c"]),
        5_000,
    );
    let item = item();

    f.manager.enhance_content(item.clone()).await.unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    assert_eq!(item.metadata().len(), 3);
    for engine in ["a", "b", "c"] {
        assert_eq!(status(&item, engine), ExecutionStatus::Completed);
    }
    let em = item.execution_metadata().unwrap();
    assert_eq!(em.chain_execution.record.status, ExecutionStatus::Completed);
    assert!(em.chain_execution.default_chain);
}

#[tokio::test]
async fn cannot_enhance_completes_without_enhancements() {
    let f = fixture(
        vec![MockEngine::cannot_enhance("a"), MockEngine::synchronous("b")],
        linear("skip", &["a", "b"]),
        5_000,
    );
    let item = item();

    f.manager.enhance_content(item.clone()).await.unwrap();

    assert_eq!(f.calls("a"), 0);
    assert_eq!(f.calls("b"), 1);
    assert_eq!(item.metadata().created_by("a").count(), 0);
    assert_eq!(status(&item, "a"), ExecutionStatus::Completed);
}

#[tokio::test]
async fn explicit_chain_is_not_flagged_as_default() {
    let f = fixture(vec![MockEngine::synchronous("a")], linear("default", &["a"]), 5_000);
    let other = Chain::new(linear("other", &["a"])).unwrap();
    let item = item();

    f.manager.enhance_content_with(item.clone(), &other).await.unwrap();

    let em = item.execution_metadata().unwrap();
    assert_eq!(em.chain_execution.chain, "other");
    assert!(!em.chain_execution.default_chain);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn items_are_enhanced_concurrently() {
    let f = fixture(
        vec![
            MockEngine::synchronous("a"),
            MockEngine::asynchronous("b").with_delay(Duration::from_millis(20)),
            MockEngine::asynchronous("c").with_delay(Duration::from_millis(20)),
            MockEngine::synchronous("d"),
        ],
        fan_out(false),
        10_000,
    );

    let items: Vec<Arc<ContentItem>> = (0..10).map(|_| item()).collect();
    let handles: Vec<_> = items
        .iter()
        .map(|item| {
            let manager = Arc::clone(&f.manager);
            let item = Arc::clone(item);
            tokio::spawn(async move { manager.enhance_content(item).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    for engine in ["a", "b", "c", "d"] {
        assert_eq!(f.calls(engine), 10);
    }
    assert!(items.iter().all(|i| i.metadata().len() == 4));
}

// ============================================================
// Failures
// ============================================================

#[tokio::test]
async fn required_failure_aborts_but_running_engines_complete() {
    let f = fixture(
        vec![
            MockEngine::synchronous("a"),
            MockEngine::failing_async("b", "boom"),
            MockEngine::asynchronous("c").with_delay(Duration::from_millis(50)),
            MockEngine::synchronous("d"),
        ],
        fan_out(false),
        5_000,
    );
    let item = item();

    let err = f.manager.enhance_content(item.clone()).await.unwrap_err();

    match err {
        ChainError::EngineFailed {
            engine,
            message,
            source,
        } => {
            assert_eq!(engine, "b");
            assert!(message.contains("required engine 'b'"), "{message}");
            assert_eq!(source.unwrap().message(), "boom");
        }
        other => panic!("unexpected error: {other}"),
    }
    // c was already running when b failed.
    assert_eq!(f.calls("c"), 1);
    assert_eq!(status(&item, "c"), ExecutionStatus::Completed);
    // d only became executable after the failure.
    assert_eq!(f.calls("d"), 0);
    assert_eq!(status(&item, "d"), ExecutionStatus::Skipped);
    assert_eq!(status(&item, "b"), ExecutionStatus::Failed);
    assert_eq!(chain_status(&item), ExecutionStatus::Failed);
}

#[tokio::test]
async fn optional_failure_does_not_abort_the_chain() {
    let f = fixture(
        vec![
            MockEngine::synchronous("a"),
            MockEngine::failing("b", "optional boom"),
            MockEngine::synchronous("c"),
            MockEngine::synchronous("d"),
        ],
        fan_out(true),
        5_000,
    );
    let item = item();

    f.manager.enhance_content(item.clone()).await.unwrap();

    assert_eq!(status(&item, "b"), ExecutionStatus::Failed);
    assert_eq!(status(&item, "d"), ExecutionStatus::Completed);
    assert_eq!(chain_status(&item), ExecutionStatus::Completed);
    let message = item.execution_metadata().unwrap().execution("b").unwrap().record.message.clone();
    assert!(message.unwrap().contains("optional boom"));
}

#[tokio::test]
async fn missing_required_engine_fails_the_chain() {
    let f = fixture(
        vec![MockEngine::synchronous("a")],
        linear("missing", &["a", "ghost"]),
        5_000,
    );
    let item = item();

    let err = f.manager.enhance_content(item.clone()).await.unwrap_err();

    match err {
        ChainError::EngineFailed { engine, message, source } => {
            assert_eq!(engine, "ghost");
            assert!(message.contains("is currently not active"), "{message}");
            assert!(source.is_none());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(status(&item, "ghost"), ExecutionStatus::Failed);
}

#[tokio::test]
async fn missing_optional_engine_is_skipped() {
    let plan = ExecutionPlan::new(
        "missing-optional",
        vec![
            ExecutionNode::new("ghost").optional(),
            ExecutionNode::new("a").depends_on(["ghost"]),
        ],
    );
    let f = fixture(vec![MockEngine::synchronous("a")], plan, 5_000);
    let item = item();

    f.manager.enhance_content(item.clone()).await.unwrap();

    assert_eq!(f.calls("a"), 1);
    assert_eq!(status(&item, "ghost"), ExecutionStatus::Failed);
}

#[tokio::test]
async fn can_enhance_errors_fail_the_engine() {
    let f = fixture(
        vec![MockEngine::failing_can_enhance("a", "unsupported mime type")],
        linear("check", &["a"]),
        5_000,
    );

    let err = f.manager.enhance_content(item()).await.unwrap_err();

    assert!(matches!(
        err,
        ChainError::EngineFailed { source: Some(EngineError::InvalidContent { .. }), .. }
    ));
    assert_eq!(f.calls("a"), 0);
}

#[tokio::test]
async fn panicking_engines_are_recorded_as_failures() {
    for mode in [EnhanceMode::Synchronous, EnhanceMode::Asynchronous] {
        let f = fixture(
            vec![MockEngine::panicking("a", mode), MockEngine::synchronous("b")],
            linear("panic", &["a", "b"]),
            5_000,
        );
        let item = item();

        let err = f.manager.enhance_content(item.clone()).await.unwrap_err();

        match err {
            ChainError::EngineFailed { engine, source: Some(EngineError::Panicked { message, .. }), .. } => {
                assert_eq!(engine, "a");
                assert!(message.contains("panicked"), "{message}");
            }
            other => panic!("unexpected error for {mode:?}: {other}"),
        }
        assert_eq!(f.calls("b"), 0);
        // The poisoned lock stays usable.
        assert_eq!(status(&item, "a"), ExecutionStatus::Failed);
    }
}

#[tokio::test]
async fn panicking_can_enhance_is_recorded_as_a_failure() {
    let f = fixture(
        vec![MockEngine::panicking_can_enhance("a"), MockEngine::synchronous("b")],
        linear("check-panic", &["a", "b"]),
        5_000,
    );
    let item = item();

    let err = f.manager.enhance_content(item.clone()).await.unwrap_err();

    match err {
        ChainError::EngineFailed { engine, source: Some(EngineError::Panicked { message, .. }), .. } => {
            assert_eq!(engine, "a");
            assert!(message.contains("can_enhance"), "{message}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(f.calls("b"), 0);
    assert_eq!(status(&item, "a"), ExecutionStatus::Failed);
    assert_eq!(status(&item, "b"), ExecutionStatus::Skipped);
}

#[tokio::test]
async fn default_async_implementation_appends_to_the_metadata() {
    let f = fixture(
        vec![MockEngine::synchronous("a")],
        linear("default-async", &["a", "default-async"]),
        5_000,
    );
    f.manager.engines().register(Arc::new(DefaultAsyncEngine));
    let item = item();

    f.manager.enhance_content(item.clone()).await.unwrap();

    let metadata = item.metadata();
    assert_eq!(metadata.len(), 2);
    assert_eq!(metadata.created_by("default-async").count(), 1);
    assert_eq!(status(&item, "default-async"), ExecutionStatus::Completed);
}

// ============================================================
// Waiting, timeouts and shutdown
// ============================================================

// Current-thread runtime on real time: a runtime worker blocking on the item
// lock would also block the timer.
#[tokio::test]
async fn sync_engine_holding_the_lock_does_not_stall_the_timeout() {
    let plan = ExecutionPlan::new(
        "locked",
        vec![
            ExecutionNode::new("a"),
            ExecutionNode::new("b").depends_on(["a"]),
            ExecutionNode::new("default-async").depends_on(["a"]),
        ],
    );
    let f = fixture(
        vec![
            MockEngine::synchronous("a"),
            MockEngine::synchronous("b").with_delay(Duration::from_secs(2)),
        ],
        plan,
        500,
    );
    f.manager.engines().register(Arc::new(DefaultAsyncEngine));
    let started = std::time::Instant::now();

    let err = f.manager.enhance_content(item()).await.unwrap_err();

    assert!(matches!(err, ChainError::Timeout { .. }), "{err}");
    assert!(
        started.elapsed() < Duration::from_millis(1_500),
        "timed out only after {:?}",
        started.elapsed()
    );
}

#[tokio::test(start_paused = true)]
async fn slow_jobs_time_out_with_a_status_report() {
    let f = fixture(
        vec![MockEngine::asynchronous("slow").with_delay(Duration::from_secs(30))],
        linear("slow", &["slow"]),
        1_000,
    );

    let err = f.manager.enhance_content(item()).await.unwrap_err();

    match err {
        ChainError::Timeout { elapsed, timeout, status, .. } => {
            assert_eq!(timeout, Duration::from_secs(1));
            assert!(elapsed >= timeout);
            assert!(status.contains("  -slow: in-progress"), "{status}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn deactivation_wakes_waiting_callers() {
    let f = fixture(
        vec![MockEngine::asynchronous("slow").with_delay(Duration::from_secs(30))],
        linear("slow", &["slow"]),
        60_000,
    );
    let waiting = {
        let manager = Arc::clone(&f.manager);
        tokio::spawn(async move { manager.enhance_content(item()).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    f.manager.deactivate();

    assert!(matches!(
        waiting.await.unwrap(),
        Err(ChainError::Deactivated(_))
    ));
    assert!(!f.manager.is_active());
    assert!(matches!(
        f.manager.enhance_content(item()).await,
        Err(ChainError::Deactivated(_))
    ));
}

#[tokio::test]
async fn registering_a_job_twice_returns_the_same_observer() {
    let engines = Arc::new(EngineManager::new());
    engines.register(Arc::new(
        MockEngine::asynchronous("slow").with_delay(Duration::from_millis(50)),
    ));
    let handler = EnhancementJobHandler::new(engines, Duration::from_secs(10));
    let plan = Arc::new(linear("slow", &["slow"]));
    let job = Arc::new(EnhancementJob::new(item(), plan, false).unwrap());

    let first = handler.register(Arc::clone(&job)).await.unwrap();
    let second = handler.register(Arc::clone(&job)).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(handler.active_jobs().len(), 1);

    assert!(first.wait_for_completion(Duration::from_secs(10)).await);
    assert!(handler.active_jobs().is_empty());
    handler.close();
}

// ============================================================
// Manager API
// ============================================================

#[tokio::test]
async fn an_item_is_only_enhanced_once() {
    let f = fixture(vec![MockEngine::synchronous("a")], linear("once", &["a"]), 5_000);
    let item = item();
    f.manager.enhance_content(item.clone()).await.unwrap();

    assert!(matches!(
        f.manager.enhance_content(item).await,
        Err(ChainError::ExecutionMetadataPresent(_))
    ));
}

#[tokio::test]
async fn chains_can_be_selected_by_name() {
    let f = fixture(vec![MockEngine::synchronous("a")], linear("default", &["a"]), 5_000);
    f.manager.chains().register(Chain::new(linear("named", &["a"])).unwrap());
    let named = item();

    f.manager.enhance_content_named(named.clone(), "named").await.unwrap();
    assert_eq!(named.execution_metadata().unwrap().chain_execution.chain, "named");

    assert!(matches!(
        f.manager.enhance_content_named(item(), "unknown").await,
        Err(ChainError::UnknownChain(name)) if name == "unknown"
    ));
}

#[tokio::test]
async fn no_default_chain_is_an_error() {
    let engines = Arc::new(EngineManager::new());
    let chains = Arc::new(ChainManager::new(None));
    let manager = EventJobManager::activate(engines, chains, JobManagerConfig::default());

    assert!(matches!(
        manager.enhance_content(item()).await,
        Err(ChainError::NoDefaultChain(_))
    ));
    assert!(matches!(manager.active_engines(), Err(ChainError::NoDefaultChain(_))));
}

#[tokio::test]
async fn active_engines_follow_execution_order() {
    let f = fixture(
        vec![MockEngine::synchronous("c"), MockEngine::synchronous("a")],
        linear("ordered", &["a", "b", "c"]),
        5_000,
    );
    let names: Vec<String> = f
        .manager
        .active_engines()
        .unwrap()
        .iter()
        .map(|e| e.name().to_owned())
        .collect();
    assert_eq!(names, vec!["a", "c"]);
}

#[tokio::test]
async fn interrupted_items_can_be_resumed() {
    let f = fixture(
        vec![MockEngine::synchronous("a"), MockEngine::synchronous("b")],
        linear("resume", &["a", "b"]),
        5_000,
    );
    let item = item();
    {
        // An earlier run that completed `a` and was interrupted during `b`.
        let plan = Arc::new(linear("resume", &["a", "b"]));
        let job = EnhancementJob::new(item.clone(), plan, true).unwrap();
        job.set_running("a").unwrap();
        job.set_completed("a").unwrap();
        job.set_running("b").unwrap();
    }

    f.manager.resume_content(item.clone()).await.unwrap();

    assert_eq!(f.calls("a"), 0);
    assert_eq!(f.calls("b"), 1);
    assert_eq!(status(&item, "b"), ExecutionStatus::Completed);
    assert_eq!(chain_status(&item), ExecutionStatus::Completed);
}
