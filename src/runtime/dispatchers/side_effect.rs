//! Side-effect dispatcher: N concurrent loops, each running one attempt at
//! a time under lease renewal and reporting its outcome as a decision task.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::super::{execute_with_retry, SideEffectContext, Worker};
use super::spawn_lease_renewal_task;
use crate::providers::{DecisionMessage, DecisionTask, LeasedTask, OutgoingTask, SideEffectTask, Task, TaskKind};
use crate::replay::panic_message;
use crate::{FailureClass, SideEffectError};

impl Worker {
    pub(in crate::runtime) fn start_side_effect_dispatcher(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.options.side_effect_concurrency)
            .map(|idx| {
                let worker = self.clone();
                let dispatcher_id = format!("{}-side-effect-{idx}", worker.options.worker_id);
                tokio::spawn(async move {
                    loop {
                        if worker.is_shutting_down() {
                            break;
                        }
                        let fetched = worker
                            .provider
                            .fetch(
                                &worker.options.task_queue,
                                TaskKind::SideEffect,
                                worker.options.side_effect_lease,
                            )
                            .await;
                        match fetched {
                            Ok(Some(leased)) => worker.process_side_effect(leased, &dispatcher_id).await,
                            Ok(None) => tokio::time::sleep(worker.options.idle_poll_interval).await,
                            Err(e) => {
                                warn!(
                                    target: "reprise::runtime::side_effect",
                                    worker_id = %dispatcher_id,
                                    error = %e,
                                    "fetch failed"
                                );
                                tokio::time::sleep(worker.options.idle_poll_interval).await;
                            }
                        }
                    }
                })
            })
            .collect()
    }

    async fn process_side_effect(&self, leased: LeasedTask, dispatcher_id: &str) {
        let Task::SideEffect(task) = &leased.task else {
            warn!(target: "reprise::runtime::side_effect", task_id = leased.task_id, "decision task on side-effect lease; dropping");
            self.ack_quietly(&leased.token).await;
            return;
        };
        let key = &task.key;

        // Attempts for closed executions or older generations are not run.
        match execute_with_retry(|| async { self.provider.describe(key).await }, "describe").await {
            Ok(Some(info)) if info.generation == task.generation && !info.status.is_terminal() => {}
            Ok(_) => {
                debug!(
                    target: "reprise::runtime::side_effect",
                    execution = %key,
                    side_effect = %task.name,
                    "execution closed or replaced; skipping attempt"
                );
                self.ack_quietly(&leased.token).await;
                return;
            }
            Err(e) => {
                warn!(target: "reprise::runtime::side_effect", execution = %key, error = %e, "describe failed");
                self.abandon_quietly(&leased.token, self.options.conflict_retry_delay).await;
                return;
            }
        }

        let renewal = spawn_lease_renewal_task(
            self.provider.clone(),
            leased.token.clone(),
            self.options.side_effect_lease,
            self.options.renewal_buffer,
            self.shutdown_flag.clone(),
        );

        let ctx = SideEffectContext::new(
            key.clone(),
            task.name.clone(),
            task.scheduled_seq,
            task.attempt,
            dispatcher_id.to_string(),
        );
        debug!(
            target: "reprise::runtime::side_effect",
            task_queue = %key.task_queue,
            execution_id = %key.execution_id,
            side_effect = %task.name,
            attempt = task.attempt,
            worker_id = %dispatcher_id,
            delivery_count = leased.delivery_count,
            "side effect started"
        );
        let started = Instant::now();
        let outcome = self.run_attempt(ctx, task).await;
        renewal.abort();
        let duration_ms = crate::millis(started.elapsed());

        match &outcome {
            Ok(result) => {
                self.metrics.record_side_effect_success();
                debug!(
                    target: "reprise::runtime::side_effect",
                    execution = %key,
                    side_effect = %task.name,
                    attempt = task.attempt,
                    duration_ms,
                    result_size = result.len(),
                    "side effect completed"
                );
            }
            Err(error) => {
                self.metrics.record_side_effect_failure(error.class == FailureClass::Timeout);
                warn!(
                    target: "reprise::runtime::side_effect",
                    execution = %key,
                    side_effect = %task.name,
                    attempt = task.attempt,
                    duration_ms,
                    error = %error,
                    "side effect failed"
                );
            }
        }

        let report = OutgoingTask::now(Task::Decision(DecisionTask {
            key: key.clone(),
            generation: task.generation,
            message: DecisionMessage::SideEffectResult {
                scheduled_seq: task.scheduled_seq,
                attempt: task.attempt,
                outcome,
            },
        }));
        let completed = execute_with_retry(
            || async { self.provider.complete(&leased.token, vec![report.clone()]).await },
            "complete",
        )
        .await;
        if let Err(e) = completed {
            // The lease expires and the attempt is redelivered.
            warn!(
                target: "reprise::runtime::side_effect",
                execution = %key,
                side_effect = %task.name,
                attempt = task.attempt,
                error = %e,
                "side-effect outcome not reported"
            );
        }
    }

    /// Runs the registered function under the attempt timeout. A panic
    /// counts as a retryable failure.
    async fn run_attempt(&self, ctx: SideEffectContext, task: &SideEffectTask) -> Result<String, SideEffectError> {
        let Some(handler) = self.side_effects.get(&task.name) else {
            return Err(SideEffectError::terminal(format!("unregistered side effect '{}'", task.name)));
        };
        let call = AssertUnwindSafe(handler.invoke(ctx, task.input.clone())).catch_unwind();
        let caught = match task.timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), call).await {
                Ok(caught) => caught,
                Err(_) => return Err(SideEffectError::timeout(format!("attempt exceeded {ms}ms"))),
            },
            None => call.await,
        };
        caught.unwrap_or_else(|payload| {
            Err(SideEffectError::retryable(format!(
                "side effect panicked: {}",
                panic_message(payload.as_ref())
            )))
        })
    }
}
