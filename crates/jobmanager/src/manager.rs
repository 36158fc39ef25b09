//! `EventJobManager`: the entry point for enhancing content items.
//!
//! Wraps an [`EnhancementJobHandler`]: creates the job for a content item,
//! registers it, waits for it and turns the job's final state into a
//! `Result`.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use enhancer::{Chain, ContentItem, EnhancementEngine, validate_plan};

use crate::handler::run_blocking;
use crate::{ChainError, ChainManager, EngineManager, EnhancementJob, EnhancementJobHandler};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the job manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobManagerConfig {
    /// How long `enhance_content` waits for a job before reporting a timeout.
    pub max_wait_time_ms: u64,
    /// Interval of the daemon logging active jobs.
    pub observer_interval_ms: u64,
    /// Name of the default chain. Falls back to a chain named `default`.
    pub default_chain: Option<String>,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            max_wait_time_ms: 60_000,
            observer_interval_ms: 10_000,
            default_chain: None,
        }
    }
}

impl JobManagerConfig {
    pub fn max_wait_time(&self) -> Duration {
        Duration::from_millis(self.max_wait_time_ms)
    }

    pub fn observer_interval(&self) -> Duration {
        Duration::from_millis(self.observer_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// EventJobManager
// ---------------------------------------------------------------------------

pub struct EventJobManager {
    engines: Arc<EngineManager>,
    chains: Arc<ChainManager>,
    config: JobManagerConfig,
    handler: Arc<EnhancementJobHandler>,
}

impl EventJobManager {
    /// Start a job manager over the given registries.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn activate(
        engines: Arc<EngineManager>,
        chains: Arc<ChainManager>,
        config: JobManagerConfig,
    ) -> Self {
        info!(?config, "activate EventJobManager");
        let handler = EnhancementJobHandler::new(Arc::clone(&engines), config.observer_interval());
        Self {
            engines,
            chains,
            config,
            handler,
        }
    }

    /// Close the handler. Callers still waiting get [`ChainError::Deactivated`];
    /// later calls fail with it immediately.
    pub fn deactivate(&self) {
        info!("deactivate EventJobManager");
        self.handler.close();
    }

    pub fn is_active(&self) -> bool {
        !self.handler.is_closed()
    }

    pub fn config(&self) -> &JobManagerConfig {
        &self.config
    }

    pub fn engines(&self) -> &Arc<EngineManager> {
        &self.engines
    }

    pub fn chains(&self) -> &Arc<ChainManager> {
        &self.chains
    }

    /// Enhance `item` with the default chain.
    pub async fn enhance_content(&self, item: Arc<ContentItem>) -> Result<(), ChainError> {
        let chain = self
            .chains
            .default_chain()
            .ok_or_else(|| ChainError::NoDefaultChain(item.uri().to_owned()))?;
        self.enhance_content_with(item, &chain).await
    }

    /// Enhance `item` with the registered chain called `name`.
    ///
    /// # Errors
    /// [`ChainError::UnknownChain`] if no such chain is registered, otherwise
    /// as [`enhance_content_with`](Self::enhance_content_with).
    pub async fn enhance_content_named(
        &self,
        item: Arc<ContentItem>,
        name: &str,
    ) -> Result<(), ChainError> {
        let chain = self.chains.require(name)?;
        self.enhance_content_with(item, &chain).await
    }

    /// Enhance `item` with `chain` and wait for the result.
    ///
    /// # Errors
    /// - [`ChainError::EngineFailed`] if a required engine failed.
    /// - [`ChainError::Timeout`] if the job did not finish in time.
    /// - [`ChainError::Deactivated`] if the manager was deactivated.
    /// - Plan or metadata errors from creating the job.
    #[instrument(skip_all, fields(item = %item.uri(), chain = %chain.name()))]
    pub async fn enhance_content_with(
        &self,
        item: Arc<ContentItem>,
        chain: &Chain,
    ) -> Result<(), ChainError> {
        let started = Instant::now();
        debug!(">> enhance {} with chain {}", item.uri(), chain.name());
        let is_default = self
            .chains
            .default_chain()
            .is_some_and(|default| *default == *chain);
        let uri = item.uri().to_owned();
        let plan = chain.execution_plan();
        let job = run_blocking(&uri, move || EnhancementJob::new(item, plan, is_default)).await??;
        self.run(Arc::new(job), started).await
    }

    /// Continue enhancing an item that carries execution metadata from an
    /// earlier, interrupted run.
    #[instrument(skip_all, fields(item = %item.uri()))]
    pub async fn resume_content(&self, item: Arc<ContentItem>) -> Result<(), ChainError> {
        let started = Instant::now();
        let uri = item.uri().to_owned();
        let job = run_blocking(&uri, move || EnhancementJob::resume(item)).await??;
        debug!(">> resume {uri} with chain {}", job.chain_name());
        self.run(Arc::new(job), started).await
    }

    async fn run(&self, job: Arc<EnhancementJob>, started: Instant) -> Result<(), ChainError> {
        let uri = job.content_item().uri().to_owned();
        let observer = self.handler.register(Arc::clone(&job)).await?;

        let max_wait = self.config.max_wait_time();
        if !observer.wait_for_completion(max_wait).await {
            // Engines may still hold the item's lock: nothing here waits for it.
            if observer.is_closed() {
                warn!("EventJobManager was deactivated while enhancing {uri}");
                return Err(ChainError::Deactivated(uri));
            }
            let status = job.try_status_report().unwrap_or_else(|| {
                "  (unavailable: the content item is locked by a running engine)\n".to_owned()
            });
            return Err(ChainError::Timeout {
                item: uri,
                elapsed: started.elapsed(),
                timeout: max_wait,
                status,
            });
        }

        let item = uri.clone();
        run_blocking(&uri, move || Self::outcome(&job, &item, started)).await?
    }

    /// Map a finished job to the caller's result.
    fn outcome(job: &EnhancementJob, uri: &str, started: Instant) -> Result<(), ChainError> {
        let failed = job.is_failed();
        info!(
            "execution of chain {} {} after {}ms for content item {uri}",
            job.chain_name(),
            if failed { "failed" } else { "finished" },
            started.elapsed().as_millis()
        );

        if failed {
            job.log_info(None, true);
            let failure = job.error();
            let message = job
                .error_message()
                .or_else(|| failure.as_ref().map(|f| f.message.clone()))
                .unwrap_or_else(|| format!("enhancement chain '{}' failed", job.chain_name()));
            return Err(ChainError::EngineFailed {
                engine: failure.as_ref().map(|f| f.engine.clone()).unwrap_or_default(),
                message,
                source: failure.and_then(|f| f.source),
            });
        }

        if let Some(em) = job.execution_metadata() {
            info!("> processed content item {uri} with {}", em.timing_summary());
        }
        Ok(())
    }

    /// Registered engines of the default chain, in execution order.
    pub fn active_engines(&self) -> Result<Vec<Arc<dyn EnhancementEngine>>, ChainError> {
        let chain = self
            .chains
            .default_chain()
            .ok_or_else(|| ChainError::NoDefaultChain(self.chains.default_chain_name().to_owned()))?;
        let order = validate_plan(&chain.execution_plan())?;
        Ok(order
            .iter()
            .filter_map(|engine| self.engines.get(engine))
            .collect())
    }
}

impl Drop for EventJobManager {
    fn drop(&mut self) {
        self.handler.close();
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = JobManagerConfig::default();
        assert_eq!(config.max_wait_time(), Duration::from_secs(60));
        assert_eq!(config.observer_interval(), Duration::from_secs(10));
        assert!(config.default_chain.is_none());
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let config: JobManagerConfig =
            serde_json::from_str(r#"{ "max_wait_time_ms": 250, "default_chain": "text" }"#).unwrap();
        assert_eq!(config.max_wait_time_ms, 250);
        assert_eq!(config.observer_interval_ms, 10_000);
        assert_eq!(config.default_chain.as_deref(), Some("text"));
    }
}
