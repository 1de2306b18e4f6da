use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};

use crate::codec::{Codec, Json};
use crate::providers::{
    DecisionMessage, DecisionTask, ExecutionInfo, Provider, ProviderError, QueryAnswered, QueryReply, Task,
};
use crate::runtime::{execute_with_retry, limits};
use crate::{ExecutionKey, ExecutionOutcome, CANCEL_SIGNAL};

/// Errors returned by [`Client`] operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("execution {0} already exists and is not terminal")]
    AlreadyExists(ExecutionKey),
    #[error("execution {0} not found")]
    NotFound(ExecutionKey),
    /// The handle's generation ended and the id was started again.
    #[error("generation {generation} of execution {key} was superseded")]
    Superseded { key: ExecutionKey, generation: u64 },
    #[error("timed out waiting on execution {0}")]
    Timeout(ExecutionKey),
    #[error("query failed: {0}")]
    QueryFailed(String),
    /// A typed result was requested but the execution did not complete.
    #[error("execution ended as {}", .0.status())]
    NotCompleted(ExecutionOutcome),
    #[error("codec: {0}")]
    Codec(String),
    #[error(transparent)]
    Provider(ProviderError),
}

impl From<ProviderError> for ClientError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::AlreadyExists(key) => ClientError::AlreadyExists(key),
            ProviderError::NotFound(key) => ClientError::NotFound(key),
            other => ClientError::Provider(other),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Fails the execution with `ErrorDetails::Timeout` if it is still
    /// running after this long.
    pub execution_timeout: Option<Duration>,
}

impl StartOptions {
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }
}

/// Answer to [`Client::query`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryResponse {
    /// Computed from replayed state as of history seq `as_of_seq`.
    Live { as_of_seq: u64, value: String },
    /// The execution already finished; no handler ran.
    Terminal(ExecutionOutcome),
}

/// Control-plane client.
///
/// The client never reads or writes history: it creates status records,
/// enqueues decision tasks, and reads the status record and the query result
/// channel.
#[derive(Clone)]
pub struct Client {
    provider: Arc<dyn Provider>,
    poll_interval: Duration,
}

impl Client {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            poll_interval: limits::CLIENT_POLL_INTERVAL,
        }
    }

    /// Interval between status checks while waiting on a result or query.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub async fn start(
        &self,
        execution_id: &str,
        task_queue: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<ExecutionHandle, ClientError> {
        self.start_with_options(execution_id, task_queue, orchestration, input, StartOptions::default())
            .await
    }

    /// Starts an execution. Fails with `AlreadyExists` while a non-terminal
    /// execution holds the key; a terminal one is replaced by a new
    /// generation.
    pub async fn start_with_options(
        &self,
        execution_id: &str,
        task_queue: &str,
        orchestration: &str,
        input: impl Into<String>,
        options: StartOptions,
    ) -> Result<ExecutionHandle, ClientError> {
        let key = ExecutionKey::new(task_queue, execution_id);
        let input = input.into();
        let info = execute_with_retry(
            || async {
                self.provider
                    .start_execution(&key, orchestration, &input, options.execution_timeout)
                    .await
            },
            "start_execution",
        )
        .await?;
        tracing::debug!(
            target: "reprise::client",
            task_queue = %key.task_queue,
            execution_id = %key.execution_id,
            orchestration,
            generation = info.generation,
            "execution started"
        );
        Ok(ExecutionHandle {
            client: self.clone(),
            key,
            generation: info.generation,
        })
    }

    pub async fn start_typed<In: Serialize>(
        &self,
        execution_id: &str,
        task_queue: &str,
        orchestration: &str,
        input: &In,
    ) -> Result<ExecutionHandle, ClientError> {
        let payload = Json::encode(input).map_err(ClientError::Codec)?;
        self.start(execution_id, task_queue, orchestration, payload).await
    }

    async fn require(&self, key: &ExecutionKey) -> Result<ExecutionInfo, ClientError> {
        execute_with_retry(|| async { self.provider.describe(key).await }, "describe")
            .await?
            .ok_or_else(|| ClientError::NotFound(key.clone()))
    }

    /// Like `require`, pinned to `generation` when one is given.
    async fn require_at(&self, key: &ExecutionKey, generation: Option<u64>) -> Result<ExecutionInfo, ClientError> {
        let info = self.require(key).await?;
        match generation {
            Some(g) if g != info.generation => Err(ClientError::Superseded {
                key: key.clone(),
                generation: g,
            }),
            _ => Ok(info),
        }
    }

    async fn send(
        &self,
        key: &ExecutionKey,
        generation: Option<u64>,
        message: DecisionMessage,
    ) -> Result<u64, ClientError> {
        let info = self.require_at(key, generation).await?;
        let task = Task::Decision(DecisionTask {
            key: key.clone(),
            generation: info.generation,
            message,
        });
        let id = execute_with_retry(|| async { self.provider.enqueue(task.clone(), None).await }, "enqueue").await?;
        Ok(id)
    }

    /// Durable fire-and-forget. A signal sent to an execution that finishes
    /// before the signal is recorded is dropped.
    pub async fn signal(&self, key: &ExecutionKey, name: &str, payload: impl Into<String>) -> Result<(), ClientError> {
        self.signal_at(key, None, name, payload.into()).await
    }

    async fn signal_at(
        &self,
        key: &ExecutionKey,
        generation: Option<u64>,
        name: &str,
        payload: String,
    ) -> Result<(), ClientError> {
        self.send(
            key,
            generation,
            DecisionMessage::Signal {
                name: name.to_string(),
                payload,
            },
        )
        .await
        .map(|_| ())
    }

    pub async fn signal_typed<T: Serialize>(&self, key: &ExecutionKey, name: &str, payload: &T) -> Result<(), ClientError> {
        let payload = Json::encode(payload).map_err(ClientError::Codec)?;
        self.signal(key, name, payload).await
    }

    /// Requests cooperative cancellation: sends the reserved cancel signal,
    /// which orchestration code observes through
    /// `ctx.is_cancellation_requested()`.
    pub async fn cancel(&self, key: &ExecutionKey, reason: impl Into<String>) -> Result<(), ClientError> {
        self.signal(key, CANCEL_SIGNAL, reason).await
    }

    /// Ends the execution with `Terminated` without running its code again.
    pub async fn terminate(&self, key: &ExecutionKey, reason: impl Into<String>) -> Result<(), ClientError> {
        self.terminate_at(key, None, reason.into()).await
    }

    async fn terminate_at(&self, key: &ExecutionKey, generation: Option<u64>, reason: String) -> Result<(), ClientError> {
        self.send(key, generation, DecisionMessage::Terminate { reason })
            .await
            .map(|_| ())
    }

    pub async fn query(&self, key: &ExecutionKey, name: &str, args: impl Into<String>) -> Result<QueryResponse, ClientError> {
        self.query_with_timeout(key, name, args, limits::DEFAULT_QUERY_TIMEOUT).await
    }

    /// Runs a query handler against the execution's current replayed state.
    /// History is never written.
    pub async fn query_with_timeout(
        &self,
        key: &ExecutionKey,
        name: &str,
        args: impl Into<String>,
        timeout: Duration,
    ) -> Result<QueryResponse, ClientError> {
        self.query_at(key, None, name, args.into(), timeout).await
    }

    async fn query_at(
        &self,
        key: &ExecutionKey,
        generation: Option<u64>,
        name: &str,
        args: String,
        timeout: Duration,
    ) -> Result<QueryResponse, ClientError> {
        let info = self.require_at(key, generation).await?;
        if let (true, Some(outcome)) = (info.status.is_terminal(), info.outcome) {
            return Ok(QueryResponse::Terminal(outcome));
        }
        let query_id = self
            .send(
                key,
                generation,
                DecisionMessage::Query {
                    name: name.to_string(),
                    args,
                },
            )
            .await?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let taken = execute_with_retry(
                || async { self.provider.take_query_result(query_id).await },
                "take_query_result",
            )
            .await?;
            if let Some(QueryAnswered { as_of_seq, result, .. }) = taken {
                return match result {
                    Ok(QueryReply::Value(value)) => Ok(QueryResponse::Live { as_of_seq, value }),
                    Ok(QueryReply::Terminal(outcome)) => Ok(QueryResponse::Terminal(outcome)),
                    Err(message) => Err(ClientError::QueryFailed(message)),
                };
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ClientError::Timeout(key.clone()));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    pub async fn describe(&self, key: &ExecutionKey) -> Result<ExecutionInfo, ClientError> {
        self.require(key).await
    }

    /// Waits until the execution reaches a terminal status.
    pub async fn result(&self, key: &ExecutionKey) -> Result<ExecutionOutcome, ClientError> {
        self.result_at(key, None).await
    }

    async fn result_at(&self, key: &ExecutionKey, generation: Option<u64>) -> Result<ExecutionOutcome, ClientError> {
        loop {
            let info = self.require_at(key, generation).await?;
            if let (true, Some(outcome)) = (info.status.is_terminal(), info.outcome) {
                return Ok(outcome);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    pub async fn result_timeout(&self, key: &ExecutionKey, timeout: Duration) -> Result<ExecutionOutcome, ClientError> {
        self.result_timeout_at(key, None, timeout).await
    }

    async fn result_timeout_at(
        &self,
        key: &ExecutionKey,
        generation: Option<u64>,
        timeout: Duration,
    ) -> Result<ExecutionOutcome, ClientError> {
        tokio::time::timeout(timeout, self.result_at(key, generation))
            .await
            .map_err(|_| ClientError::Timeout(key.clone()))?
    }

    /// Decodes a `Completed` output; any other outcome is `NotCompleted`.
    pub async fn result_typed<T: DeserializeOwned>(&self, key: &ExecutionKey) -> Result<T, ClientError> {
        Self::decode_outcome(self.result(key).await?)
    }

    fn decode_outcome<T: DeserializeOwned>(outcome: ExecutionOutcome) -> Result<T, ClientError> {
        match outcome {
            ExecutionOutcome::Completed(output) => Json::decode(&output).map_err(ClientError::Codec),
            other => Err(ClientError::NotCompleted(other)),
        }
    }
}

/// Returned by `start`; addresses the generation it started. Once that
/// generation is replaced by a new start, calls fail with `Superseded`.
#[derive(Clone)]
pub struct ExecutionHandle {
    client: Client,
    key: ExecutionKey,
    generation: u64,
}

impl std::fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .finish()
    }
}

impl ExecutionHandle {
    pub fn key(&self) -> &ExecutionKey {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn pinned(&self) -> Option<u64> {
        Some(self.generation)
    }

    pub async fn signal(&self, name: &str, payload: impl Into<String>) -> Result<(), ClientError> {
        self.client.signal_at(&self.key, self.pinned(), name, payload.into()).await
    }

    pub async fn query(&self, name: &str, args: impl Into<String>) -> Result<QueryResponse, ClientError> {
        self.client
            .query_at(&self.key, self.pinned(), name, args.into(), limits::DEFAULT_QUERY_TIMEOUT)
            .await
    }

    pub async fn cancel(&self, reason: impl Into<String>) -> Result<(), ClientError> {
        self.client
            .signal_at(&self.key, self.pinned(), CANCEL_SIGNAL, reason.into())
            .await
    }

    pub async fn terminate(&self, reason: impl Into<String>) -> Result<(), ClientError> {
        self.client.terminate_at(&self.key, self.pinned(), reason.into()).await
    }

    pub async fn describe(&self) -> Result<ExecutionInfo, ClientError> {
        self.client.require_at(&self.key, self.pinned()).await
    }

    pub async fn result(&self) -> Result<ExecutionOutcome, ClientError> {
        self.client.result_at(&self.key, self.pinned()).await
    }

    pub async fn result_timeout(&self, timeout: Duration) -> Result<ExecutionOutcome, ClientError> {
        self.client.result_timeout_at(&self.key, self.pinned(), timeout).await
    }

    pub async fn result_typed<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        Client::decode_outcome(self.result().await?)
    }
}
