//! Storage and queueing boundary.
//!
//! A provider is three things behind one object: the append-only history
//! store, the task queue that hands decision and side-effect tasks to
//! workers, and the result channel that carries query answers back to
//! clients. [`Provider`] adds the two operations that must span them
//! atomically.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{Event, ExecutionKey, ExecutionOutcome, ExecutionStatus, SideEffectError};

pub mod error;
pub mod in_memory;
pub mod sqlite;

pub use error::ProviderError;

/// Status record kept next to each execution's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub key: ExecutionKey,
    pub orchestration: String,
    pub input: String,
    /// Bumped each time a terminal execution id is started again.
    pub generation: u64,
    pub status: ExecutionStatus,
    pub outcome: Option<ExecutionOutcome>,
    pub last_seq: u64,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    Decision,
    SideEffect,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Decision => "decision",
            TaskKind::SideEffect => "side_effect",
        }
    }
}

/// Inbound message that drives one decision cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionMessage {
    Start {
        orchestration: String,
        input: String,
    },
    SideEffectResult {
        scheduled_seq: u64,
        attempt: u32,
        outcome: Result<String, SideEffectError>,
    },
    TimerFired {
        timer_seq: u64,
        fire_at_ms: u64,
    },
    /// The queue's task id becomes the signal id, so a redelivered signal
    /// task deduplicates.
    Signal {
        name: String,
        payload: String,
    },
    /// Answered through the result channel under the task id.
    Query {
        name: String,
        args: String,
    },
    Terminate {
        reason: String,
    },
    ExecutionTimeout,
}

impl DecisionMessage {
    pub fn label(&self) -> &'static str {
        match self {
            DecisionMessage::Start { .. } => "start",
            DecisionMessage::SideEffectResult { .. } => "side_effect_result",
            DecisionMessage::TimerFired { .. } => "timer_fired",
            DecisionMessage::Signal { .. } => "signal",
            DecisionMessage::Query { .. } => "query",
            DecisionMessage::Terminate { .. } => "terminate",
            DecisionMessage::ExecutionTimeout => "execution_timeout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionTask {
    pub key: ExecutionKey,
    pub generation: u64,
    pub message: DecisionMessage,
}

/// One attempt of a side effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideEffectTask {
    pub key: ExecutionKey,
    pub generation: u64,
    pub scheduled_seq: u64,
    pub attempt: u32,
    pub name: String,
    pub input: String,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Task {
    Decision(DecisionTask),
    SideEffect(SideEffectTask),
}

impl Task {
    pub fn kind(&self) -> TaskKind {
        match self {
            Task::Decision(_) => TaskKind::Decision,
            Task::SideEffect(_) => TaskKind::SideEffect,
        }
    }

    pub fn key(&self) -> &ExecutionKey {
        match self {
            Task::Decision(t) => &t.key,
            Task::SideEffect(t) => &t.key,
        }
    }
}

/// Task to enqueue as part of an atomic commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingTask {
    pub task: Task,
    pub delay: Option<Duration>,
}

impl OutgoingTask {
    pub fn now(task: Task) -> Self {
        Self { task, delay: None }
    }

    pub fn delayed(task: Task, delay: Duration) -> Self {
        Self {
            task,
            delay: (!delay.is_zero()).then_some(delay),
        }
    }
}

/// A task fetched under a lease. Invisible to other fetchers until acked,
/// abandoned, or the lease expires.
#[derive(Debug, Clone)]
pub struct LeasedTask {
    pub task_id: u64,
    pub token: String,
    pub task: Task,
    /// 1 on first delivery.
    pub delivery_count: u32,
}

/// Reply to a query task, published on the result channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryAnswered {
    pub query_id: u64,
    /// History seq the answer was computed at; 0 when none was computed.
    pub as_of_seq: u64,
    pub result: Result<QueryReply, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryReply {
    Value(String),
    Terminal(ExecutionOutcome),
}

/// Opaque resume point for providers that support snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub as_of_seq: u64,
    pub state: String,
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Full history of the current generation, in seq order.
    async fn read(&self, key: &ExecutionKey) -> Result<Vec<Event>, ProviderError>;

    /// History of one generation, current or finished. Empty when that
    /// generation never existed.
    async fn read_generation(&self, key: &ExecutionKey, generation: u64) -> Result<Vec<Event>, ProviderError>;

    async fn describe(&self, key: &ExecutionKey) -> Result<Option<ExecutionInfo>, ProviderError>;

    /// Appends `events` if the log still ends at `expected_last_seq`, else
    /// `Conflict`. Events must continue the seq without gaps. A terminal
    /// event updates the status record in the same write. Returns the new
    /// last seq.
    async fn append(&self, key: &ExecutionKey, expected_last_seq: u64, events: Vec<Event>)
        -> Result<u64, ProviderError>;

    async fn list_executions(&self, task_queue: &str) -> Result<Vec<ExecutionInfo>, ProviderError>;

    async fn save_snapshot(&self, key: &ExecutionKey, _snapshot: Snapshot) -> Result<(), ProviderError> {
        Err(ProviderError::permanent(
            "save_snapshot",
            format!("snapshots are not supported by this provider ({key})"),
        ))
    }

    async fn load_snapshot(&self, _key: &ExecutionKey) -> Result<Option<Snapshot>, ProviderError> {
        Ok(None)
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Returns the task id.
    async fn enqueue(&self, task: Task, delay: Option<Duration>) -> Result<u64, ProviderError>;

    /// Oldest visible task of `kind` on `task_queue`, leased for `lease`.
    async fn fetch(&self, task_queue: &str, kind: TaskKind, lease: Duration)
        -> Result<Option<LeasedTask>, ProviderError>;

    async fn ack(&self, token: &str) -> Result<(), ProviderError>;

    /// Acks the leased task and enqueues `follow_up` atomically.
    async fn complete(&self, token: &str, follow_up: Vec<OutgoingTask>) -> Result<(), ProviderError>;

    async fn renew(&self, token: &str, lease: Duration) -> Result<(), ProviderError>;

    /// Releases the lease; the task becomes visible again after `delay`.
    async fn abandon(&self, token: &str, delay: Option<Duration>) -> Result<(), ProviderError>;

    /// Queued tasks of `kind` on `task_queue`, delayed and leased included.
    async fn queue_depth(&self, task_queue: &str, kind: TaskKind) -> Result<usize, ProviderError>;
}

#[async_trait]
pub trait ResultChannel: Send + Sync {
    async fn publish_query_result(&self, answer: QueryAnswered) -> Result<(), ProviderError>;

    /// Removes and returns the answer for `query_id` if it has arrived.
    async fn take_query_result(&self, query_id: u64) -> Result<Option<QueryAnswered>, ProviderError>;
}

#[async_trait]
pub trait Provider: HistoryStore + TaskQueue + ResultChannel {
    /// Creates the status record (or a new generation of a terminal one),
    /// writes nothing to history, and enqueues the start decision plus an
    /// optional delayed timeout decision. `AlreadyExists` while a
    /// non-terminal execution holds the key.
    async fn start_execution(
        &self,
        key: &ExecutionKey,
        orchestration: &str,
        input: &str,
        execution_timeout: Option<Duration>,
    ) -> Result<ExecutionInfo, ProviderError>;

    /// Conditional append, enqueue of `follow_up`, and ack of the decision
    /// lease `token`, all or nothing. A lease that already expired is not an
    /// error: the redelivered copy deduplicates against the new history.
    async fn commit_decision(
        &self,
        token: &str,
        key: &ExecutionKey,
        expected_last_seq: u64,
        events: Vec<Event>,
        follow_up: Vec<OutgoingTask>,
    ) -> Result<u64, ProviderError>;
}

/// Tasks a fresh start enqueues.
pub(crate) fn start_tasks(
    key: &ExecutionKey,
    generation: u64,
    orchestration: &str,
    input: &str,
    execution_timeout: Option<Duration>,
) -> Vec<OutgoingTask> {
    let mut tasks = vec![OutgoingTask::now(Task::Decision(DecisionTask {
        key: key.clone(),
        generation,
        message: DecisionMessage::Start {
            orchestration: orchestration.to_string(),
            input: input.to_string(),
        },
    }))];
    if let Some(timeout) = execution_timeout {
        tasks.push(OutgoingTask {
            task: Task::Decision(DecisionTask {
                key: key.clone(),
                generation,
                message: DecisionMessage::ExecutionTimeout,
            }),
            delay: Some(timeout),
        });
    }
    tasks
}

/// Checks that `events` continue a log ending at `last_seq`.
pub(crate) fn validate_continuation(last_seq: u64, events: &[Event]) -> Result<(), ProviderError> {
    for (i, ev) in events.iter().enumerate() {
        let expected = last_seq + 1 + i as u64;
        if ev.seq != expected {
            return Err(ProviderError::permanent(
                "append",
                format!("event seq {} breaks the log; expected {expected}", ev.seq),
            ));
        }
    }
    Ok(())
}

/// Status and outcome implied by the last terminal event in `events`.
pub(crate) fn terminal_transition(events: &[Event]) -> Option<ExecutionOutcome> {
    events
        .iter()
        .rev()
        .find_map(|e| ExecutionOutcome::from_terminal_event(&e.kind))
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(crate::millis)
        .unwrap_or(0)
}
