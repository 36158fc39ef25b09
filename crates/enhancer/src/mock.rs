//! `MockEngine`: a test double for `EnhancementEngine`.
//!
//! Useful in unit and integration tests where a real engine implementation is
//! either unavailable or irrelevant.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::{ContentItem, EngineError, EnhanceMode, Enhancement, EnhancementEngine, EnhancementKind, Metadata};

/// Behaviour injected into `MockEngine` at construction time.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Enhance with the given mode, adding one text annotation.
    Enhance(EnhanceMode),
    /// Fail inside `compute_enhancements*` with the given mode and message.
    Fail(EnhanceMode, String),
    /// Fail inside `can_enhance`.
    FailCanEnhance(String),
    /// Panic inside `compute_enhancements*`.
    Panic(EnhanceMode),
    /// Panic inside `can_enhance`.
    PanicCanEnhance,
}

/// A mock engine that records every call it receives.
pub struct MockEngine {
    /// Engine name, as referenced by execution plans.
    pub name: String,
    /// What the engine does when asked to enhance.
    pub behaviour: MockBehaviour,
    /// Delay applied before the work of a run. Synchronous runs sleep on
    /// their thread while holding the item's write lock.
    pub delay: Option<Duration>,
    /// Shared log of engine names in call order, across engines.
    pub call_log: Arc<Mutex<Vec<String>>>,
    calls: Mutex<usize>,
}

impl MockEngine {
    fn with_behaviour(name: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self {
            name: name.into(),
            behaviour,
            delay: None,
            call_log: Arc::new(Mutex::new(Vec::new())),
            calls: Mutex::new(0),
        }
    }

    /// Create a mock that enhances synchronously.
    pub fn synchronous(name: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::Enhance(EnhanceMode::Synchronous))
    }

    /// Create a mock that enhances asynchronously.
    pub fn asynchronous(name: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::Enhance(EnhanceMode::Asynchronous))
    }

    /// Create a mock that never wants to enhance anything.
    pub fn cannot_enhance(name: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::Enhance(EnhanceMode::CannotEnhance))
    }

    /// Create a mock that always fails (synchronously) with `msg`.
    pub fn failing(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::Fail(EnhanceMode::Synchronous, msg.into()))
    }

    /// Create a mock that always fails (asynchronously) with `msg`.
    pub fn failing_async(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::Fail(EnhanceMode::Asynchronous, msg.into()))
    }

    /// Create a mock whose `can_enhance` check errors.
    pub fn failing_can_enhance(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::FailCanEnhance(msg.into()))
    }

    /// Create a mock whose `can_enhance` check panics.
    pub fn panicking_can_enhance(name: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::PanicCanEnhance)
    }

    /// Create a mock that panics while enhancing.
    pub fn panicking(name: impl Into<String>, mode: EnhanceMode) -> Self {
        Self::with_behaviour(name, MockBehaviour::Panic(mode))
    }

    /// Delay every run by `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Share a call log with other mocks to assert on execution order.
    pub fn with_call_log(mut self, log: Arc<Mutex<Vec<String>>>) -> Self {
        self.call_log = log;
        self
    }

    /// Number of times this engine computed (or tried to compute) enhancements.
    pub fn call_count(&self) -> usize {
        *self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_call(&self) {
        *self.calls.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        self.call_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(self.name.clone());
    }

    fn run(&self, metadata: &mut Metadata) -> Result<(), EngineError> {
        match &self.behaviour {
            MockBehaviour::Enhance(_) => {
                metadata.add(
                    Enhancement::new(self.name.clone(), EnhancementKind::TextAnnotation)
                        .with("mock", true),
                );
                Ok(())
            }
            MockBehaviour::Fail(_, msg) => Err(EngineError::enhancement(&self.name, msg.clone())),
            MockBehaviour::Panic(_) | MockBehaviour::PanicCanEnhance => {
                panic!("mock engine '{}' panicked", self.name)
            }
            MockBehaviour::FailCanEnhance(msg) => {
                Err(EngineError::invalid_content(&self.name, msg.clone()))
            }
        }
    }
}

#[async_trait]
impl EnhancementEngine for MockEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_enhance(&self, _item: &ContentItem) -> Result<EnhanceMode, EngineError> {
        match &self.behaviour {
            MockBehaviour::Enhance(mode) | MockBehaviour::Fail(mode, _) | MockBehaviour::Panic(mode) => {
                Ok(*mode)
            }
            MockBehaviour::FailCanEnhance(msg) => {
                Err(EngineError::invalid_content(&self.name, msg.clone()))
            }
            MockBehaviour::PanicCanEnhance => {
                panic!("mock engine '{}' panicked in can_enhance", self.name)
            }
        }
    }

    fn compute_enhancements(
        &self,
        _item: &ContentItem,
        metadata: &mut Metadata,
    ) -> Result<(), EngineError> {
        self.record_call();
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.run(metadata)
    }

    async fn compute_enhancements_async(&self, item: &Arc<ContentItem>) -> Result<(), EngineError> {
        self.record_call();
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut metadata = Metadata::default();
        self.run(&mut metadata)?;
        item.add_enhancements(&self.name, metadata.split_off(0)).await
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synchronous_mock_adds_an_annotation() {
        let engine = MockEngine::synchronous("ner");
        let item = ContentItem::from_text("text");
        assert_eq!(engine.can_enhance(&item), Ok(EnhanceMode::Synchronous));

        let mut parts = item.write();
        engine.compute_enhancements(&item, &mut parts.metadata).unwrap();
        assert_eq!(parts.metadata.created_by("ner").count(), 1);
        assert_eq!(engine.call_count(), 1);
    }

    #[tokio::test]
    async fn failing_async_mock_reports_its_message() {
        let engine = MockEngine::failing_async("linking", "index offline");
        let item = Arc::new(ContentItem::from_text("text"));
        assert_eq!(engine.can_enhance(&item), Ok(EnhanceMode::Asynchronous));

        let err = engine.compute_enhancements_async(&item).await.unwrap_err();
        assert_eq!(err.message(), "index offline");
        assert!(item.metadata().is_empty());
    }

    #[test]
    fn can_enhance_failure_is_an_error() {
        let engine = MockEngine::failing_can_enhance("tika", "unsupported");
        let item = ContentItem::from_text("text");
        assert!(matches!(
            engine.can_enhance(&item),
            Err(EngineError::InvalidContent { .. })
        ));
    }

    #[tokio::test]
    async fn asynchronous_mock_adds_an_annotation() {
        let engine = MockEngine::asynchronous("ner");
        let item = Arc::new(ContentItem::from_text("text"));

        engine.compute_enhancements_async(&item).await.unwrap();
        assert_eq!(item.metadata().created_by("ner").count(), 1);
    }

    #[test]
    #[should_panic(expected = "panicked in can_enhance")]
    fn can_enhance_can_panic() {
        let engine = MockEngine::panicking_can_enhance("tika");
        let _ = engine.can_enhance(&ContentItem::from_text("text"));
    }

    #[test]
    fn shared_call_log_records_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = MockEngine::synchronous("a").with_call_log(Arc::clone(&log));
        let b = MockEngine::synchronous("b").with_call_log(Arc::clone(&log));
        let item = ContentItem::from_text("text");
        let mut metadata = Metadata::default();
        b.compute_enhancements(&item, &mut metadata).unwrap();
        a.compute_enhancements(&item, &mut metadata).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["b", "a"]);
    }
}
