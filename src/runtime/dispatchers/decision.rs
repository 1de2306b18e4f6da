//! Decision dispatcher: one decision cycle per fetched decision task.
//!
//! A cycle reads the execution's history, records the task's message,
//! replays the orchestration, and commits the new events together with the
//! follow-up tasks and the ack. Losing the conditional append to a
//! concurrent cycle abandons the lease so the task is replayed against the
//! fresher history.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::super::execute_with_retry;
use super::super::query::QuerySnapshot;
use super::super::replay_engine::{Intake, ReplayEngine};
use super::super::Worker;
use crate::providers::{
    now_ms, DecisionMessage, DecisionTask, ExecutionInfo, LeasedTask, ProviderError, QueryAnswered, QueryReply, Task,
    TaskKind,
};
use crate::{ExecutionKey, ExecutionOutcome};

impl Worker {
    pub(in crate::runtime) fn start_decision_dispatcher(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.options.decision_concurrency)
            .map(|idx| {
                let worker = self.clone();
                let dispatcher_id = format!("{}-decision-{idx}", worker.options.worker_id);
                tokio::spawn(async move {
                    loop {
                        if worker.is_shutting_down() {
                            break;
                        }
                        let fetched = worker
                            .provider
                            .fetch(&worker.options.task_queue, TaskKind::Decision, worker.options.decision_lease)
                            .await;
                        match fetched {
                            Ok(Some(leased)) => worker.process_decision(leased, &dispatcher_id).await,
                            Ok(None) => tokio::time::sleep(worker.options.idle_poll_interval).await,
                            Err(e) => {
                                warn!(
                                    target: "reprise::runtime::decision",
                                    worker_id = %dispatcher_id,
                                    error = %e,
                                    "fetch failed"
                                );
                                tokio::time::sleep(worker.options.idle_poll_interval).await;
                            }
                        }
                    }
                    debug!(target: "reprise::runtime::decision", worker_id = %dispatcher_id, "decision loop exited");
                })
            })
            .collect()
    }

    async fn process_decision(&self, leased: LeasedTask, dispatcher_id: &str) {
        let Task::Decision(task) = &leased.task else {
            warn!(target: "reprise::runtime::decision", task_id = leased.task_id, "side-effect task on decision lease; dropping");
            self.ack_quietly(&leased.token).await;
            return;
        };
        let key = &task.key;

        let info = match execute_with_retry(|| async { self.provider.describe(key).await }, "describe").await {
            Ok(Some(info)) => info,
            Ok(None) => {
                self.drop_task(&leased, key, "execution not found").await;
                return;
            }
            Err(e) => {
                warn!(target: "reprise::runtime::decision", execution = %key, error = %e, "describe failed");
                self.abandon_quietly(&leased.token, self.options.conflict_retry_delay).await;
                return;
            }
        };

        if info.generation != task.generation {
            self.drop_task(&leased, key, "stale generation").await;
            return;
        }

        if let DecisionMessage::Query { name, args } = &task.message {
            self.answer_query(&leased, &info, name, args).await;
            return;
        }

        if info.status.is_terminal() {
            self.drop_task(&leased, key, "execution closed").await;
            return;
        }

        self.run_decision_cycle(&leased, task, &info, dispatcher_id).await;
    }

    async fn run_decision_cycle(&self, leased: &LeasedTask, task: &DecisionTask, info: &ExecutionInfo, dispatcher_id: &str) {
        let key = &task.key;
        let history = match execute_with_retry(|| async { self.provider.read(key).await }, "read").await {
            Ok(h) => h,
            Err(e) => {
                warn!(target: "reprise::runtime::decision", execution = %key, error = %e, "history read failed");
                self.abandon_quietly(&leased.token, self.options.conflict_retry_delay).await;
                return;
            }
        };

        self.metrics.record_decision_cycle();
        let engine = ReplayEngine::new(key.clone(), info.generation, history, now_ms());
        let expected_last_seq = engine.last_seq();

        let decision = match engine.intake(&task.message, leased.task_id) {
            Intake::Drop(reason) => {
                self.drop_task(leased, key, reason).await;
                return;
            }
            Intake::Deferred => {
                debug!(
                    target: "reprise::runtime::decision",
                    execution = %key,
                    message = task.message.label(),
                    "execution not started yet; deferring"
                );
                self.metrics.record_deferred();
                self.abandon_quietly(&leased.token, self.options.conflict_retry_delay).await;
                return;
            }
            Intake::Close(kind) => engine.close(kind),
            Intake::Record { events, follow_up } => engine.decide(events, follow_up, &self.orchestrations),
        };

        debug!(
            target: "reprise::runtime::decision",
            task_queue = %key.task_queue,
            execution_id = %key.execution_id,
            worker_id = %dispatcher_id,
            message = task.message.label(),
            seq = expected_last_seq,
            new_events = decision.events.len(),
            follow_up = decision.follow_up.len(),
            "decision computed"
        );

        let committed = execute_with_retry(
            || async {
                self.provider
                    .commit_decision(
                        &leased.token,
                        key,
                        expected_last_seq,
                        decision.events.clone(),
                        decision.follow_up.clone(),
                    )
                    .await
            },
            "commit_decision",
        )
        .await;

        match committed {
            Ok(last_seq) => {
                self.metrics.record_commit();
                if decision.nondeterministic {
                    self.metrics.record_nondeterminism();
                }
                match &decision.outcome {
                    Some(outcome) => {
                        self.snapshots.remove(key);
                        self.record_outcome(key, outcome, last_seq);
                    }
                    None => {
                        if let Some(snapshot) = decision.queries {
                            self.snapshots.store(key.clone(), snapshot);
                        }
                    }
                }
            }
            Err(ProviderError::Conflict { expected, actual, .. }) => {
                debug!(
                    target: "reprise::runtime::decision",
                    execution = %key,
                    expected,
                    actual,
                    "lost append race; retrying against fresh history"
                );
                self.metrics.record_conflict();
                self.abandon_quietly(&leased.token, self.options.conflict_retry_delay).await;
            }
            Err(ProviderError::ExecutionClosed(_)) | Err(ProviderError::NotFound(_)) => {
                self.drop_task(leased, key, "execution closed during decision").await;
            }
            Err(e) => {
                warn!(target: "reprise::runtime::decision", execution = %key, error = %e, "commit failed");
                self.abandon_quietly(&leased.token, self.options.conflict_retry_delay).await;
            }
        }
    }

    fn record_outcome(&self, key: &ExecutionKey, outcome: &ExecutionOutcome, last_seq: u64) {
        match outcome {
            ExecutionOutcome::Failed(details) => {
                self.metrics.record_execution_failed();
                warn!(
                    target: "reprise::runtime",
                    task_queue = %key.task_queue,
                    execution_id = %key.execution_id,
                    seq = last_seq,
                    error = %details,
                    "execution failed"
                );
            }
            other => {
                self.metrics.record_execution_completed();
                info!(
                    target: "reprise::runtime",
                    task_queue = %key.task_queue,
                    execution_id = %key.execution_id,
                    seq = last_seq,
                    status = %other.status(),
                    "execution finished"
                );
            }
        }
    }

    async fn drop_task(&self, leased: &LeasedTask, key: &ExecutionKey, reason: &str) {
        debug!(
            target: "reprise::runtime::decision",
            execution = %key,
            task_id = leased.task_id,
            delivery_count = leased.delivery_count,
            reason,
            "dropping decision task"
        );
        self.metrics.record_dropped();
        self.ack_quietly(&leased.token).await;
    }

    /// Answers from the cached snapshot when it is current, otherwise from
    /// a replay whose output is discarded. History is never written.
    async fn answer_query(&self, leased: &LeasedTask, info: &ExecutionInfo, name: &str, args: &str) {
        let key = &info.key;
        let (as_of_seq, result) = match (&info.outcome, self.snapshots.current(key, info.generation, info.last_seq)) {
            (Some(outcome), _) if info.status.is_terminal() => (info.last_seq, Ok(QueryReply::Terminal(outcome.clone()))),
            (_, Some(snapshot)) => (snapshot.as_of_seq, snapshot.answer(name, args).map(QueryReply::Value)),
            _ => {
                let history = match execute_with_retry(|| async { self.provider.read(key).await }, "read").await {
                    Ok(h) => h,
                    Err(e) => {
                        warn!(target: "reprise::runtime::decision", execution = %key, error = %e, "history read failed");
                        self.abandon_quietly(&leased.token, self.options.conflict_retry_delay).await;
                        return;
                    }
                };
                if history.is_empty() {
                    self.metrics.record_deferred();
                    self.abandon_quietly(&leased.token, self.options.conflict_retry_delay).await;
                    return;
                }
                let engine = ReplayEngine::new(key.clone(), info.generation, history, now_ms());
                match engine.replay_for_query(&self.orchestrations) {
                    Ok(snapshot) => self.answer_and_cache(key, snapshot, name, args),
                    Err(e) => (engine.last_seq(), Err(e)),
                }
            }
        };

        let answer = QueryAnswered {
            query_id: leased.task_id,
            as_of_seq,
            result,
        };
        let published = execute_with_retry(
            || async { self.provider.publish_query_result(answer.clone()).await },
            "publish_query_result",
        )
        .await;
        match published {
            Ok(()) => {
                self.metrics.record_query_answered();
                self.ack_quietly(&leased.token).await;
            }
            Err(e) => {
                warn!(target: "reprise::runtime::decision", execution = %key, error = %e, "query answer not published");
                self.abandon_quietly(&leased.token, self.options.conflict_retry_delay).await;
            }
        }
    }

    fn answer_and_cache(
        &self,
        key: &ExecutionKey,
        snapshot: QuerySnapshot,
        name: &str,
        args: &str,
    ) -> (u64, Result<QueryReply, String>) {
        let as_of_seq = snapshot.as_of_seq;
        let result = snapshot.answer(name, args).map(QueryReply::Value);
        self.snapshots.store(key.clone(), snapshot);
        (as_of_seq, result)
    }
}
