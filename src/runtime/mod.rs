//! Worker runtime: polls a task queue and drives decision cycles and
//! side-effect attempts against a [`Provider`].
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::providers::{Provider, ProviderError};
use crate::{ExecutionKey, OrchestrationContext, OrchestrationError, SideEffectError};

mod dispatchers;
pub mod limits;
pub mod observability;
mod query;
pub mod registry;
pub(crate) mod replay_engine;

pub use observability::{LogFormat, Metrics, MetricsSnapshot, ObservabilityConfig};
pub use registry::{OrchestrationRegistry, Registry, RegistryBuilder, SideEffectRegistry};

/// Configuration for a [`Worker`].
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// The only task queue this worker polls.
    pub task_queue: String,
    /// Concurrent decision loops. Decisions for one execution stay
    /// serialized by the conditional append regardless of this value.
    pub decision_concurrency: usize,
    /// Concurrent side-effect loops.
    pub side_effect_concurrency: usize,
    pub decision_lease: Duration,
    /// Lease taken on a side-effect task; renewed while the function runs.
    pub side_effect_lease: Duration,
    /// How long before lease expiry a renewal is sent.
    pub renewal_buffer: Duration,
    /// Sleep between polls when the queue is empty.
    pub idle_poll_interval: Duration,
    /// Visibility delay applied to a decision task that lost an append race
    /// or arrived before its execution started.
    pub conflict_retry_delay: Duration,
    pub worker_id: String,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            task_queue: "default".to_string(),
            decision_concurrency: 2,
            side_effect_concurrency: 4,
            decision_lease: Duration::from_secs(30),
            side_effect_lease: Duration::from_secs(30),
            renewal_buffer: Duration::from_secs(5),
            idle_poll_interval: Duration::from_millis(10),
            conflict_retry_delay: Duration::from_millis(20),
            worker_id: format!("worker-{}", std::process::id()),
        }
    }
}

impl WorkerOptions {
    pub fn new(task_queue: impl Into<String>) -> Self {
        Self {
            task_queue: task_queue.into(),
            ..Default::default()
        }
    }

    pub fn with_decision_concurrency(mut self, n: usize) -> Self {
        self.decision_concurrency = n.max(1);
        self
    }

    pub fn with_side_effect_concurrency(mut self, n: usize) -> Self {
        self.side_effect_concurrency = n.max(1);
        self
    }

    pub fn with_decision_lease(mut self, lease: Duration) -> Self {
        self.decision_lease = lease;
        self
    }

    pub fn with_side_effect_lease(mut self, lease: Duration, renewal_buffer: Duration) -> Self {
        self.side_effect_lease = lease;
        self.renewal_buffer = renewal_buffer;
        self
    }

    pub fn with_idle_poll_interval(mut self, interval: Duration) -> Self {
        self.idle_poll_interval = interval;
        self
    }

    pub fn with_conflict_retry_delay(mut self, delay: Duration) -> Self {
        self.conflict_retry_delay = delay;
        self
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }
}

/// Trait implemented by orchestration handlers the worker can replay.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, OrchestrationError>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F>(pub F);

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, OrchestrationError>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, OrchestrationError> {
        (self.0)(ctx, input).await
    }
}

/// Trait implemented by side-effect functions.
#[async_trait]
pub trait SideEffectHandler: Send + Sync {
    async fn invoke(&self, ctx: SideEffectContext, input: String) -> Result<String, SideEffectError>;
}

pub struct FnSideEffect<F>(pub F);

#[async_trait]
impl<F, Fut> SideEffectHandler for FnSideEffect<F>
where
    F: Fn(SideEffectContext, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, SideEffectError>> + Send + 'static,
{
    async fn invoke(&self, ctx: SideEffectContext, input: String) -> Result<String, SideEffectError> {
        (self.0)(ctx, input).await
    }
}

/// Metadata handed to a side-effect function for one attempt.
#[derive(Debug, Clone)]
pub struct SideEffectContext {
    key: ExecutionKey,
    name: String,
    scheduled_seq: u64,
    attempt: u32,
    worker_id: String,
}

impl SideEffectContext {
    pub(crate) fn new(key: ExecutionKey, name: String, scheduled_seq: u64, attempt: u32, worker_id: String) -> Self {
        Self {
            key,
            name,
            scheduled_seq,
            attempt,
            worker_id,
        }
    }

    pub fn key(&self) -> &ExecutionKey {
        &self.key
    }

    pub fn execution_id(&self) -> &str {
        &self.key.execution_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Seq of the `SideEffectScheduled` event; stable across attempts and
    /// usable as an idempotency key.
    pub fn scheduled_seq(&self) -> u64 {
        self.scheduled_seq
    }

    /// 1-based.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn trace_info(&self, message: impl Into<String>) {
        tracing::info!(
            target: "reprise::side_effect",
            task_queue = %self.key.task_queue,
            execution_id = %self.key.execution_id,
            side_effect = %self.name,
            attempt = self.attempt,
            worker_id = %self.worker_id,
            "{}",
            message.into()
        );
    }

    pub fn trace_warn(&self, message: impl Into<String>) {
        tracing::warn!(
            target: "reprise::side_effect",
            task_queue = %self.key.task_queue,
            execution_id = %self.key.execution_id,
            side_effect = %self.name,
            attempt = self.attempt,
            worker_id = %self.worker_id,
            "{}",
            message.into()
        );
    }
}

/// Polls one task queue and dispatches decision and side-effect tasks.
pub struct Worker {
    provider: Arc<dyn Provider>,
    orchestrations: OrchestrationRegistry,
    side_effects: SideEffectRegistry,
    options: WorkerOptions,
    joins: Mutex<Vec<JoinHandle<()>>>,
    shutdown_flag: Arc<AtomicBool>,
    snapshots: query::SnapshotCache,
    metrics: Arc<Metrics>,
}

impl Worker {
    /// Spawns the decision and side-effect loops and returns immediately.
    pub async fn start(
        provider: Arc<dyn Provider>,
        orchestrations: OrchestrationRegistry,
        side_effects: SideEffectRegistry,
        options: WorkerOptions,
    ) -> Arc<Self> {
        // No-op when the embedding application already installed a subscriber.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
            .try_init();

        debug!(
            target: "reprise::runtime",
            task_queue = %options.task_queue,
            worker_id = %options.worker_id,
            orchestrations = ?orchestrations.list_names(),
            side_effects = ?side_effects.list_names(),
            "worker starting"
        );

        let worker = Arc::new(Self {
            provider,
            orchestrations,
            side_effects,
            options,
            joins: Mutex::new(Vec::new()),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            snapshots: query::SnapshotCache::new(limits::MAX_CACHED_SNAPSHOTS),
            metrics: Arc::new(Metrics::default()),
        });

        let decisions = worker.clone().start_decision_dispatcher();
        let side_effects = worker.clone().start_side_effect_dispatcher();
        {
            let mut joins = worker.joins.lock().await;
            joins.extend(decisions);
            joins.extend(side_effects);
        }
        worker
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Stops polling. Loops finish the task they hold, then exit; anything
    /// still running after the grace period is aborted and its lease left to
    /// expire.
    pub async fn shutdown(self: Arc<Self>) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
        let mut joins = self.joins.lock().await;
        for mut j in joins.drain(..) {
            if tokio::time::timeout(limits::SHUTDOWN_GRACE, &mut j).await.is_err() {
                j.abort();
            }
        }
        debug!(target: "reprise::runtime", worker_id = %self.options.worker_id, "worker stopped");
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }
}

/// Retries `operation` with exponential backoff while it fails with a
/// retryable provider error.
pub(crate) async fn execute_with_retry<T, F, R>(operation: F, operation_tag: &str) -> Result<T, ProviderError>
where
    F: Fn() -> R,
    R: Future<Output = Result<T, ProviderError>>,
{
    let mut attempts: u32 = 0;
    loop {
        match operation().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempts < limits::PROVIDER_RETRY_ATTEMPTS => {
                let backoff_ms = limits::PROVIDER_RETRY_BASE_MS.saturating_mul(1 << attempts);
                warn!(target: "reprise::runtime", attempts, backoff_ms, error = %e, "{} failed; retrying", operation_tag);
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                attempts += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn retry_helper_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), ProviderError> = execute_with_retry(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::permanent("op", "bad"))
            },
            "op",
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_helper_recovers_from_busy() {
        let calls = AtomicU32::new(0);
        let result = execute_with_retry(
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProviderError::retryable("op", "busy"))
                } else {
                    Ok(7u64)
                }
            },
            "op",
        )
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn options_builders_clamp_concurrency() {
        let opts = WorkerOptions::new("loans")
            .with_decision_concurrency(0)
            .with_worker_id("w1");
        assert_eq!(opts.task_queue, "loans");
        assert_eq!(opts.decision_concurrency, 1);
        assert_eq!(opts.worker_id, "w1");
    }
}
