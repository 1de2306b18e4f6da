//! Structured logging setup and in-process metrics counters.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log format options for structured logging
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Structured JSON output for log aggregators
    Json,
    /// Human-readable format for development (with all fields)
    Pretty,
    /// Compact format: timestamp level target fields message
    #[default]
    Compact,
}

/// Logging configuration for embedding applications.
///
/// ```rust,no_run
/// # use reprise::runtime::{ObservabilityConfig, LogFormat};
/// let config = ObservabilityConfig {
///     log_format: LogFormat::Json,
///     log_level: "debug".to_string(),
/// };
/// reprise::runtime::observability::init_logging(&config).ok();
/// ```
///
/// Runtime logs carry `task_queue`, `execution_id`, `worker_id` and, where
/// relevant, `seq`, `side_effect` and `attempt` fields. `RUST_LOG`, when
/// set, overrides `log_level`.
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    pub log_format: LogFormat,
    /// Level applied to orchestration and side-effect logs; runtime
    /// internals stay at `warn`.
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Compact,
            log_level: "info".to_string(),
        }
    }
}

fn default_filter_expression(level: &str) -> String {
    format!("warn,reprise::orchestration={level},reprise::side_effect={level}")
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &ObservabilityConfig) -> Result<(), String> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter_expression(&config.log_level)));

    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| format!("Failed to initialize JSON logging: {e}")),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .map_err(|e| format!("Failed to initialize pretty logging: {e}")),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init()
            .map_err(|e| format!("Failed to initialize compact logging: {e}")),
    }
}

/// Snapshot of worker counters for tests and diagnostics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub decision_cycles: u64,
    pub commits: u64,
    pub conflicts: u64,
    /// Decision tasks dropped as duplicates, stale generations or closed executions.
    pub decisions_dropped: u64,
    pub decisions_deferred: u64,
    pub nondeterminism_failures: u64,
    pub executions_completed: u64,
    pub executions_failed: u64,
    pub side_effect_successes: u64,
    pub side_effect_failures: u64,
    pub side_effect_timeouts: u64,
    pub queries_answered: u64,
}

#[derive(Debug, Default)]
pub struct Metrics {
    decision_cycles: AtomicU64,
    commits: AtomicU64,
    conflicts: AtomicU64,
    decisions_dropped: AtomicU64,
    decisions_deferred: AtomicU64,
    nondeterminism_failures: AtomicU64,
    executions_completed: AtomicU64,
    executions_failed: AtomicU64,
    side_effect_successes: AtomicU64,
    side_effect_failures: AtomicU64,
    side_effect_timeouts: AtomicU64,
    queries_answered: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Metrics {
    pub fn record_decision_cycle(&self) {
        bump(&self.decision_cycles);
    }

    pub fn record_commit(&self) {
        bump(&self.commits);
    }

    pub fn record_conflict(&self) {
        bump(&self.conflicts);
    }

    pub fn record_dropped(&self) {
        bump(&self.decisions_dropped);
    }

    pub fn record_deferred(&self) {
        bump(&self.decisions_deferred);
    }

    pub fn record_nondeterminism(&self) {
        bump(&self.nondeterminism_failures);
    }

    pub fn record_execution_completed(&self) {
        bump(&self.executions_completed);
    }

    pub fn record_execution_failed(&self) {
        bump(&self.executions_failed);
    }

    pub fn record_side_effect_success(&self) {
        bump(&self.side_effect_successes);
    }

    pub fn record_side_effect_failure(&self, timed_out: bool) {
        bump(&self.side_effect_failures);
        if timed_out {
            bump(&self.side_effect_timeouts);
        }
    }

    pub fn record_query_answered(&self) {
        bump(&self.queries_answered);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            decision_cycles: self.decision_cycles.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            decisions_dropped: self.decisions_dropped.load(Ordering::Relaxed),
            decisions_deferred: self.decisions_deferred.load(Ordering::Relaxed),
            nondeterminism_failures: self.nondeterminism_failures.load(Ordering::Relaxed),
            executions_completed: self.executions_completed.load(Ordering::Relaxed),
            executions_failed: self.executions_failed.load(Ordering::Relaxed),
            side_effect_successes: self.side_effect_successes.load(Ordering::Relaxed),
            side_effect_failures: self.side_effect_failures.load(Ordering::Relaxed),
            side_effect_timeouts: self.side_effect_timeouts.load(Ordering::Relaxed),
            queries_answered: self.queries_answered.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_count_as_failures() {
        let m = Metrics::default();
        m.record_side_effect_failure(true);
        m.record_side_effect_failure(false);
        m.record_side_effect_success();
        let snap = m.snapshot();
        assert_eq!(snap.side_effect_failures, 2);
        assert_eq!(snap.side_effect_timeouts, 1);
        assert_eq!(snap.side_effect_successes, 1);
    }

    #[test]
    fn default_filter_keeps_internals_quiet() {
        assert_eq!(
            default_filter_expression("debug"),
            "warn,reprise::orchestration=debug,reprise::side_effect=debug"
        );
    }
}
