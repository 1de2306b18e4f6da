//! Reprise: durable orchestrations replayed deterministically over an
//! append-only history.
//!
//! An orchestration is plain async Rust code. Every decision cycle re-runs it
//! from the beginning against the execution's history; side-effect calls,
//! timers and signal waits resolve from recorded events, and the first call
//! without a recorded outcome suspends the pass and becomes a command. The
//! [`runtime::Worker`] turns commands into history events plus task-queue
//! entries, committed atomically through a [`providers::Provider`].
//!
//! ```ignore
//! use std::sync::Arc;
//! use reprise::providers::in_memory::InMemoryProvider;
//! use reprise::runtime::{registry::{OrchestrationRegistry, SideEffectRegistry}, Worker, WorkerOptions};
//! use reprise::{Client, OrchestrationContext, OrchestrationError};
//!
//! let side_effects = SideEffectRegistry::builder()
//!     .register("greet", |_ctx, name: String| async move { Ok(format!("hello {name}")) })
//!     .build();
//! let orchestrations = OrchestrationRegistry::builder()
//!     .register("hello", |ctx: OrchestrationContext, input: String| async move {
//!         Ok(ctx.call_side_effect("greet", input).await?)
//!     })
//!     .build();
//!
//! let provider = Arc::new(InMemoryProvider::new());
//! let worker = Worker::start(provider.clone(), orchestrations, side_effects, WorkerOptions::new("default")).await;
//! let client = Client::new(provider);
//! let handle = client.start("run-1", "default", "hello", "world").await?;
//! let outcome = handle.result().await?;
//! worker.shutdown().await;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod client;
pub mod codec;
pub mod context;
pub mod durable_future;
pub mod logging;
pub mod providers;
pub mod replay;
pub mod retry;
pub mod runtime;

pub use client::{Client, ClientError, ExecutionHandle, QueryResponse, StartOptions};
pub use codec::{Codec, Json};
pub use context::{OrchestrationContext, QueryHandler};
pub use replay::{run_turn, TurnOutput, TurnStatus};
pub use retry::{BackoffStrategy, RetryPolicy};

/// Whole milliseconds in `d`, saturating at `u64::MAX`.
pub(crate) fn millis(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Signal name reserved for cooperative cancellation.
pub const CANCEL_SIGNAL: &str = "__reprise_cancel";

/// Address of an execution: the task queue it runs on plus its id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionKey {
    pub task_queue: String,
    pub execution_id: String,
}

impl ExecutionKey {
    pub fn new(task_queue: impl Into<String>, execution_id: impl Into<String>) -> Self {
        Self {
            task_queue: task_queue.into(),
            execution_id: execution_id.into(),
        }
    }
}

impl fmt::Display for ExecutionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.task_queue, self.execution_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
    Terminated,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Running => "Running",
            ExecutionStatus::Completed => "Completed",
            ExecutionStatus::Failed => "Failed",
            ExecutionStatus::Cancelled => "Cancelled",
            ExecutionStatus::Terminated => "Terminated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Running" => Some(ExecutionStatus::Running),
            "Completed" => Some(ExecutionStatus::Completed),
            "Failed" => Some(ExecutionStatus::Failed),
            "Cancelled" => Some(ExecutionStatus::Cancelled),
            "Terminated" => Some(ExecutionStatus::Terminated),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final result of an execution, as returned by [`Client::result`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionOutcome {
    Completed(String),
    Failed(ErrorDetails),
    Cancelled(String),
    Terminated(String),
}

impl ExecutionOutcome {
    pub fn status(&self) -> ExecutionStatus {
        match self {
            ExecutionOutcome::Completed(_) => ExecutionStatus::Completed,
            ExecutionOutcome::Failed(_) => ExecutionStatus::Failed,
            ExecutionOutcome::Cancelled(_) => ExecutionStatus::Cancelled,
            ExecutionOutcome::Terminated(_) => ExecutionStatus::Terminated,
        }
    }

    /// Outcome recorded by a terminal history event, if `kind` is one.
    pub fn from_terminal_event(kind: &EventKind) -> Option<Self> {
        match kind {
            EventKind::ExecutionCompleted { output } => Some(ExecutionOutcome::Completed(output.clone())),
            EventKind::ExecutionFailed { error } => Some(ExecutionOutcome::Failed(error.clone())),
            EventKind::ExecutionCancelled { reason } => Some(ExecutionOutcome::Cancelled(reason.clone())),
            EventKind::ExecutionTerminated { reason } => Some(ExecutionOutcome::Terminated(reason.clone())),
            _ => None,
        }
    }
}

/// One durable history record. `seq` starts at 1 and is gapless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub timestamp_ms: u64,
    pub kind: EventKind,
}

impl Event {
    pub fn new(seq: u64, timestamp_ms: u64, kind: EventKind) -> Self {
        Self { seq, timestamp_ms, kind }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    ExecutionStarted {
        orchestration: String,
        input: String,
    },
    SideEffectScheduled {
        name: String,
        input: String,
        policy: RetryPolicy,
    },
    SideEffectCompleted {
        scheduled_seq: u64,
        attempt: u32,
        result: String,
    },
    /// `terminal == false` means another attempt was scheduled after
    /// `retry_delay_ms`; orchestration code only observes terminal failures.
    SideEffectFailed {
        scheduled_seq: u64,
        attempt: u32,
        error: SideEffectError,
        terminal: bool,
        retry_delay_ms: Option<u64>,
    },
    TimerStarted {
        delay_ms: u64,
        fire_at_ms: u64,
    },
    TimerFired {
        timer_seq: u64,
        fire_at_ms: u64,
    },
    SignalReceived {
        signal_id: u64,
        name: String,
        payload: String,
    },
    ExecutionCompleted {
        output: String,
    },
    ExecutionFailed {
        error: ErrorDetails,
    },
    ExecutionCancelled {
        reason: String,
    },
    ExecutionTerminated {
        reason: String,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::ExecutionStarted { .. } => "ExecutionStarted",
            EventKind::SideEffectScheduled { .. } => "SideEffectScheduled",
            EventKind::SideEffectCompleted { .. } => "SideEffectCompleted",
            EventKind::SideEffectFailed { .. } => "SideEffectFailed",
            EventKind::TimerStarted { .. } => "TimerStarted",
            EventKind::TimerFired { .. } => "TimerFired",
            EventKind::SignalReceived { .. } => "SignalReceived",
            EventKind::ExecutionCompleted { .. } => "ExecutionCompleted",
            EventKind::ExecutionFailed { .. } => "ExecutionFailed",
            EventKind::ExecutionCancelled { .. } => "ExecutionCancelled",
            EventKind::ExecutionTerminated { .. } => "ExecutionTerminated",
        }
    }

    /// Events emitted by orchestration code itself and matched on replay.
    pub fn is_schedule(&self) -> bool {
        matches!(
            self,
            EventKind::SideEffectScheduled { .. } | EventKind::TimerStarted { .. }
        )
    }

    /// Events delivered to orchestration code one at a time during replay.
    pub fn is_inbound(&self) -> bool {
        match self {
            EventKind::SideEffectCompleted { .. }
            | EventKind::TimerFired { .. }
            | EventKind::SignalReceived { .. } => true,
            EventKind::SideEffectFailed { terminal, .. } => *terminal,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::ExecutionCompleted { .. }
                | EventKind::ExecutionFailed { .. }
                | EventKind::ExecutionCancelled { .. }
                | EventKind::ExecutionTerminated { .. }
        )
    }
}

/// Classification reported by a side-effect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureClass {
    Retryable,
    Terminal,
    Timeout,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureClass::Retryable => f.write_str("retryable"),
            FailureClass::Terminal => f.write_str("terminal"),
            FailureClass::Timeout => f.write_str("timeout"),
        }
    }
}

/// Error returned by a side-effect function, persisted in history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{class}: {message}")]
pub struct SideEffectError {
    pub class: FailureClass,
    pub message: String,
    pub code: Option<String>,
}

impl SideEffectError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Retryable,
            message: message.into(),
            code: None,
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Terminal,
            message: message.into(),
            code: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Timeout,
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// A side effect that failed for good, as seen by orchestration code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("side effect '{name}' failed after {attempts} attempt(s): {error}")]
pub struct SideEffectFailure {
    pub name: String,
    pub attempts: u32,
    pub error: SideEffectError,
}

/// Error type returned by orchestration functions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestrationError {
    #[error(transparent)]
    SideEffect(#[from] SideEffectFailure),
    #[error("{0}")]
    Failed(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl OrchestrationError {
    pub fn failed(message: impl Into<String>) -> Self {
        OrchestrationError::Failed(message.into())
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        OrchestrationError::Cancelled(reason.into())
    }
}

impl From<String> for OrchestrationError {
    fn from(message: String) -> Self {
        OrchestrationError::Failed(message)
    }
}

/// Why an execution failed; stored in `ExecutionFailed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum ErrorDetails {
    #[error("nondeterministic: {message}")]
    NonDeterminism { message: String },
    #[error("side effect '{name}' failed after {attempts} attempt(s): {error}")]
    SideEffect {
        name: String,
        attempts: u32,
        error: SideEffectError,
    },
    #[error("timed out: {message}")]
    Timeout { message: String },
    #[error("unregistered {kind} '{name}'")]
    Unregistered { kind: String, name: String },
    #[error("{message}")]
    Application { message: String },
}

impl ErrorDetails {
    pub fn nondeterminism(message: impl Into<String>) -> Self {
        ErrorDetails::NonDeterminism { message: message.into() }
    }

    pub fn application(message: impl Into<String>) -> Self {
        ErrorDetails::Application { message: message.into() }
    }

    pub fn is_nondeterminism(&self) -> bool {
        matches!(self, ErrorDetails::NonDeterminism { .. })
    }
}

impl From<SideEffectFailure> for ErrorDetails {
    fn from(f: SideEffectFailure) -> Self {
        ErrorDetails::SideEffect {
            name: f.name,
            attempts: f.attempts,
            error: f.error,
        }
    }
}

/// Work emitted by one replay pass for the worker to dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ScheduleSideEffect {
        scheduled_seq: u64,
        name: String,
        input: String,
        attempt: u32,
        timeout_ms: Option<u64>,
        delay_ms: u64,
    },
    StartTimer {
        timer_seq: u64,
        fire_at_ms: u64,
    },
    WaitForSignal {
        name: String,
    },
}
