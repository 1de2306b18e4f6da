//! Turns one inbound decision message plus the current history into the
//! events to append and the tasks to enqueue.
//!
//! The engine is pure: it reads nothing beyond the history and clock it is
//! built with, so the decision dispatcher can rebuild it after a conflict.

use std::time::Duration;

use tracing::debug;

use super::query::QuerySnapshot;
use super::registry::OrchestrationRegistry;
use crate::providers::{DecisionMessage, DecisionTask, OutgoingTask, SideEffectTask, Task};
use crate::replay::{run_turn, TurnOutput, TurnStatus};
use crate::{Command, ErrorDetails, Event, EventKind, ExecutionKey, ExecutionOutcome};

/// How a decision message enters history.
#[derive(Debug)]
pub(crate) enum Intake {
    /// Append these events, then replay.
    Record {
        events: Vec<EventKind>,
        follow_up: Vec<OutgoingTask>,
    },
    /// Append this terminal event without replaying.
    Close(EventKind),
    /// Already recorded or no longer relevant.
    Drop(&'static str),
    /// The execution has not recorded `ExecutionStarted` yet.
    Deferred,
}

/// Everything one decision cycle commits.
pub(crate) struct Decision {
    pub events: Vec<Event>,
    pub follow_up: Vec<OutgoingTask>,
    pub outcome: Option<ExecutionOutcome>,
    /// Query handlers after the replay; `None` when the execution closed.
    pub queries: Option<QuerySnapshot>,
    pub nondeterministic: bool,
}

impl std::fmt::Debug for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decision")
            .field("events", &self.events)
            .field("follow_up", &self.follow_up)
            .field("outcome", &self.outcome)
            .field("nondeterministic", &self.nondeterministic)
            .finish()
    }
}

pub(crate) struct ReplayEngine {
    key: ExecutionKey,
    generation: u64,
    history: Vec<Event>,
    now_ms: u64,
}

impl ReplayEngine {
    pub fn new(key: ExecutionKey, generation: u64, history: Vec<Event>, now_ms: u64) -> Self {
        Self {
            key,
            generation,
            history,
            now_ms,
        }
    }

    pub fn last_seq(&self) -> u64 {
        self.history.last().map_or(0, |e| e.seq)
    }

    pub fn is_started(&self) -> bool {
        !self.history.is_empty()
    }

    fn event_at(&self, seq: u64) -> Option<&EventKind> {
        self.history.iter().find(|e| e.seq == seq).map(|e| &e.kind)
    }

    pub fn intake(&self, message: &DecisionMessage, task_id: u64) -> Intake {
        if let DecisionMessage::Start { orchestration, input } = message {
            if self.is_started() {
                return Intake::Drop("execution already started");
            }
            return Intake::Record {
                events: vec![EventKind::ExecutionStarted {
                    orchestration: orchestration.clone(),
                    input: input.clone(),
                }],
                follow_up: Vec::new(),
            };
        }
        if !self.is_started() {
            return Intake::Deferred;
        }

        match message {
            DecisionMessage::Start { .. } => Intake::Drop("execution already started"),
            DecisionMessage::SideEffectResult {
                scheduled_seq,
                attempt,
                outcome,
            } => self.intake_side_effect_result(*scheduled_seq, *attempt, outcome),
            DecisionMessage::TimerFired { timer_seq, fire_at_ms } => {
                if !matches!(self.event_at(*timer_seq), Some(EventKind::TimerStarted { .. })) {
                    return Intake::Drop("timer fire for unknown timer");
                }
                let already = self
                    .history
                    .iter()
                    .any(|e| matches!(e.kind, EventKind::TimerFired { timer_seq: s, .. } if s == *timer_seq));
                if already {
                    return Intake::Drop("timer already fired");
                }
                Intake::Record {
                    events: vec![EventKind::TimerFired {
                        timer_seq: *timer_seq,
                        fire_at_ms: *fire_at_ms,
                    }],
                    follow_up: Vec::new(),
                }
            }
            DecisionMessage::Signal { name, payload } => {
                let already = self
                    .history
                    .iter()
                    .any(|e| matches!(e.kind, EventKind::SignalReceived { signal_id, .. } if signal_id == task_id));
                if already {
                    return Intake::Drop("signal already recorded");
                }
                Intake::Record {
                    events: vec![EventKind::SignalReceived {
                        signal_id: task_id,
                        name: name.clone(),
                        payload: payload.clone(),
                    }],
                    follow_up: Vec::new(),
                }
            }
            DecisionMessage::Query { .. } => Intake::Drop("queries are answered without a decision"),
            DecisionMessage::Terminate { reason } => Intake::Close(EventKind::ExecutionTerminated { reason: reason.clone() }),
            DecisionMessage::ExecutionTimeout => Intake::Close(EventKind::ExecutionFailed {
                error: ErrorDetails::Timeout {
                    message: "execution exceeded its timeout".to_string(),
                },
            }),
        }
    }

    fn intake_side_effect_result(
        &self,
        scheduled_seq: u64,
        attempt: u32,
        outcome: &Result<String, crate::SideEffectError>,
    ) -> Intake {
        let Some(EventKind::SideEffectScheduled { name, input, policy }) = self.event_at(scheduled_seq) else {
            return Intake::Drop("side-effect result for unknown schedule");
        };

        let mut retries = 0u32;
        for e in &self.history {
            match &e.kind {
                EventKind::SideEffectCompleted { scheduled_seq: s, .. } if *s == scheduled_seq => {
                    return Intake::Drop("side effect already completed");
                }
                EventKind::SideEffectFailed {
                    scheduled_seq: s,
                    terminal,
                    ..
                } if *s == scheduled_seq => {
                    if *terminal {
                        return Intake::Drop("side effect already failed");
                    }
                    retries += 1;
                }
                _ => {}
            }
        }
        if attempt != retries + 1 {
            return Intake::Drop("result for a superseded attempt");
        }

        match outcome {
            Ok(result) => Intake::Record {
                events: vec![EventKind::SideEffectCompleted {
                    scheduled_seq,
                    attempt,
                    result: result.clone(),
                }],
                follow_up: Vec::new(),
            },
            Err(error) if policy.should_retry(attempt, error) => {
                let delay = policy.delay_for_attempt(attempt);
                let retry = Task::SideEffect(SideEffectTask {
                    key: self.key.clone(),
                    generation: self.generation,
                    scheduled_seq,
                    attempt: attempt + 1,
                    name: name.clone(),
                    input: input.clone(),
                    timeout_ms: policy.timeout_ms(),
                });
                Intake::Record {
                    events: vec![EventKind::SideEffectFailed {
                        scheduled_seq,
                        attempt,
                        error: error.clone(),
                        terminal: false,
                        retry_delay_ms: Some(crate::millis(delay)),
                    }],
                    follow_up: vec![OutgoingTask::delayed(retry, delay)],
                }
            }
            Err(error) => Intake::Record {
                events: vec![EventKind::SideEffectFailed {
                    scheduled_seq,
                    attempt,
                    error: error.clone(),
                    terminal: true,
                    retry_delay_ms: None,
                }],
                follow_up: Vec::new(),
            },
        }
    }

    fn stamp(&self, first_seq: u64, kinds: Vec<EventKind>) -> Vec<Event> {
        kinds
            .into_iter()
            .enumerate()
            .map(|(i, kind)| Event::new(first_seq + i as u64, self.now_ms, kind))
            .collect()
    }

    /// Appends a terminal event without running orchestration code.
    pub fn close(self, kind: EventKind) -> Decision {
        let events = self.stamp(self.last_seq() + 1, vec![kind]);
        let outcome = events.last().and_then(|e| ExecutionOutcome::from_terminal_event(&e.kind));
        Decision {
            events,
            follow_up: Vec::new(),
            outcome,
            queries: None,
            nondeterministic: false,
        }
    }

    fn replay(&self, history: Vec<Event>, orchestrations: &OrchestrationRegistry) -> TurnOutput {
        let name = match history.first().map(|e| &e.kind) {
            Some(EventKind::ExecutionStarted { orchestration, .. }) => orchestration.clone(),
            _ => String::new(),
        };
        match orchestrations.get(&name) {
            Some(handler) => run_turn(self.key.clone(), history, self.now_ms, move |ctx, input| async move {
                handler.invoke(ctx, input).await
            }),
            None => TurnOutput::failed(ErrorDetails::Unregistered {
                kind: "orchestration".to_string(),
                name,
            }),
        }
    }

    /// Records the intake events, replays, and converts the pass into
    /// events and follow-up tasks.
    pub fn decide(self, inbound: Vec<EventKind>, intake_follow_up: Vec<OutgoingTask>, orchestrations: &OrchestrationRegistry) -> Decision {
        let mut events = self.stamp(self.last_seq() + 1, inbound);
        let mut history = self.history.clone();
        history.extend(events.iter().cloned());

        let mut out = self.replay(history, orchestrations);
        let next_seq = |events: &[Event]| events.last().map_or(self.last_seq(), |e| e.seq) + 1;

        let terminal = match std::mem::replace(&mut out.status, TurnStatus::Suspended) {
            TurnStatus::Suspended => None,
            TurnStatus::Completed(output) => Some(EventKind::ExecutionCompleted { output }),
            TurnStatus::Cancelled(reason) => Some(EventKind::ExecutionCancelled { reason }),
            TurnStatus::Failed(error) => Some(EventKind::ExecutionFailed { error }),
        };

        let nondeterministic = matches!(&terminal, Some(EventKind::ExecutionFailed { error }) if error.is_nondeterminism());
        if out.cancel_requested {
            debug!(target: "reprise::runtime", execution = %self.key, "cancellation requested");
        }

        events.extend(std::mem::take(&mut out.new_events));

        match terminal {
            Some(kind) => {
                let seq = next_seq(&events);
                events.push(Event::new(seq, self.now_ms, kind));
                let outcome = events.last().and_then(|e| ExecutionOutcome::from_terminal_event(&e.kind));
                Decision {
                    events,
                    follow_up: Vec::new(),
                    outcome,
                    queries: None,
                    nondeterministic,
                }
            }
            None => {
                let mut follow_up = intake_follow_up;
                follow_up.extend(out.commands.iter().filter_map(|c| self.command_task(c)));
                let queries = QuerySnapshot {
                    generation: self.generation,
                    as_of_seq: next_seq(&events) - 1,
                    handlers: out.take_queries(),
                };
                Decision {
                    events,
                    follow_up,
                    outcome: None,
                    queries: Some(queries),
                    nondeterministic: false,
                }
            }
        }
    }

    /// Replays the current history for a query. Nothing is recorded.
    pub fn replay_for_query(&self, orchestrations: &OrchestrationRegistry) -> Result<QuerySnapshot, String> {
        let mut out = self.replay(self.history.clone(), orchestrations);
        if let TurnStatus::Failed(error) = &out.status {
            if error.is_nondeterminism() || matches!(error, ErrorDetails::Unregistered { .. }) {
                return Err(error.to_string());
            }
        }
        Ok(QuerySnapshot {
            generation: self.generation,
            as_of_seq: self.last_seq(),
            handlers: out.take_queries(),
        })
    }

    fn command_task(&self, command: &Command) -> Option<OutgoingTask> {
        match command {
            Command::ScheduleSideEffect {
                scheduled_seq,
                name,
                input,
                attempt,
                timeout_ms,
                delay_ms,
            } => Some(OutgoingTask::delayed(
                Task::SideEffect(SideEffectTask {
                    key: self.key.clone(),
                    generation: self.generation,
                    scheduled_seq: *scheduled_seq,
                    attempt: *attempt,
                    name: name.clone(),
                    input: input.clone(),
                    timeout_ms: *timeout_ms,
                }),
                Duration::from_millis(*delay_ms),
            )),
            Command::StartTimer { timer_seq, fire_at_ms } => Some(OutgoingTask::delayed(
                Task::Decision(DecisionTask {
                    key: self.key.clone(),
                    generation: self.generation,
                    message: DecisionMessage::TimerFired {
                        timer_seq: *timer_seq,
                        fire_at_ms: *fire_at_ms,
                    },
                }),
                Duration::from_millis(fire_at_ms.saturating_sub(self.now_ms)),
            )),
            // Satisfied by a future SignalReceived; nothing to dispatch.
            Command::WaitForSignal { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{OrchestrationContext, RetryPolicy, SideEffectError};

    const NOW: u64 = 10_000;

    fn key() -> ExecutionKey {
        ExecutionKey::new("loans", "e1")
    }

    fn registry() -> OrchestrationRegistry {
        OrchestrationRegistry::builder()
            .register("charge", |ctx: OrchestrationContext, input: String| async move {
                let policy = RetryPolicy::new(3).with_backoff(crate::BackoffStrategy::Fixed {
                    delay: Duration::from_millis(50),
                });
                let receipt = ctx.call_side_effect_with_retry("charge_card", input, policy).await?;
                Ok(receipt)
            })
            .register("sleepy", |ctx: OrchestrationContext, _input: String| async move {
                ctx.timer(Duration::from_secs(2)).await;
                Ok("woke".to_string())
            })
            .register("swapped", |ctx: OrchestrationContext, input: String| async move {
                Ok(ctx.call_side_effect("other", input).await?)
            })
            .build()
    }

    fn started(orchestration: &str) -> Event {
        Event::new(
            1,
            1_000,
            EventKind::ExecutionStarted {
                orchestration: orchestration.into(),
                input: "card-1".into(),
            },
        )
    }

    fn charge_scheduled() -> Event {
        Event::new(
            2,
            1_000,
            EventKind::SideEffectScheduled {
                name: "charge_card".into(),
                input: "card-1".into(),
                policy: RetryPolicy::new(3).with_backoff(crate::BackoffStrategy::Fixed {
                    delay: Duration::from_millis(50),
                }),
            },
        )
    }

    fn decide(engine: ReplayEngine, message: DecisionMessage) -> Decision {
        match engine.intake(&message, 99) {
            Intake::Record { events, follow_up } => engine.decide(events, follow_up, &registry()),
            Intake::Close(kind) => engine.close(kind),
            other => panic!("unexpected intake {other:?}"),
        }
    }

    #[test]
    fn start_records_and_schedules_first_call() {
        let engine = ReplayEngine::new(key(), 1, vec![], NOW);
        let d = decide(
            engine,
            DecisionMessage::Start {
                orchestration: "charge".into(),
                input: "card-1".into(),
            },
        );
        assert_eq!(d.events.len(), 2);
        assert!(matches!(d.events[0].kind, EventKind::ExecutionStarted { .. }));
        assert!(matches!(d.events[1].kind, EventKind::SideEffectScheduled { .. }));
        assert_eq!(d.follow_up.len(), 1);
        assert!(matches!(
            &d.follow_up[0].task,
            Task::SideEffect(SideEffectTask { scheduled_seq: 2, attempt: 1, .. })
        ));
        assert_eq!(d.queries.map(|q| q.as_of_seq), Some(2));
    }

    #[test]
    fn retryable_failure_schedules_next_attempt() {
        let engine = ReplayEngine::new(key(), 1, vec![started("charge"), charge_scheduled()], NOW);
        let d = decide(
            engine,
            DecisionMessage::SideEffectResult {
                scheduled_seq: 2,
                attempt: 1,
                outcome: Err(SideEffectError::retryable("gateway busy")),
            },
        );
        assert!(matches!(
            d.events[..],
            [Event {
                seq: 3,
                kind: EventKind::SideEffectFailed {
                    terminal: false,
                    retry_delay_ms: Some(50),
                    ..
                },
                ..
            }]
        ));
        assert_eq!(d.follow_up.len(), 1);
        assert_eq!(d.follow_up[0].delay, Some(Duration::from_millis(50)));
        assert!(matches!(
            &d.follow_up[0].task,
            Task::SideEffect(SideEffectTask { attempt: 2, .. })
        ));
        assert!(d.outcome.is_none());
    }

    #[test]
    fn final_attempt_failure_fails_execution() {
        let failed = |seq, attempt| {
            Event::new(
                seq,
                2_000,
                EventKind::SideEffectFailed {
                    scheduled_seq: 2,
                    attempt,
                    error: SideEffectError::retryable("busy"),
                    terminal: false,
                    retry_delay_ms: Some(50),
                },
            )
        };
        let history = vec![started("charge"), charge_scheduled(), failed(3, 1), failed(4, 2)];
        let engine = ReplayEngine::new(key(), 1, history, NOW);
        let d = decide(
            engine,
            DecisionMessage::SideEffectResult {
                scheduled_seq: 2,
                attempt: 3,
                outcome: Err(SideEffectError::retryable("busy")),
            },
        );
        assert!(d.follow_up.is_empty());
        assert!(matches!(
            d.outcome,
            Some(ExecutionOutcome::Failed(ErrorDetails::SideEffect { attempts: 3, .. }))
        ));
        assert_eq!(d.events.last().map(|e| e.seq), Some(6));
    }

    #[test]
    fn duplicate_and_stale_results_are_dropped() {
        let history = vec![
            started("charge"),
            charge_scheduled(),
            Event::new(
                3,
                2_000,
                EventKind::SideEffectCompleted {
                    scheduled_seq: 2,
                    attempt: 1,
                    result: "r".into(),
                },
            ),
        ];
        let engine = ReplayEngine::new(key(), 1, history, NOW);
        let dup = DecisionMessage::SideEffectResult {
            scheduled_seq: 2,
            attempt: 1,
            outcome: Ok("r".into()),
        };
        assert!(matches!(engine.intake(&dup, 5), Intake::Drop(_)));

        let engine = ReplayEngine::new(key(), 1, vec![started("charge"), charge_scheduled()], NOW);
        let stale = DecisionMessage::SideEffectResult {
            scheduled_seq: 2,
            attempt: 2,
            outcome: Ok("r".into()),
        };
        assert!(matches!(engine.intake(&stale, 5), Intake::Drop(_)));
    }

    #[test]
    fn timer_becomes_delayed_decision_task() {
        let engine = ReplayEngine::new(key(), 4, vec![], NOW);
        let d = decide(
            engine,
            DecisionMessage::Start {
                orchestration: "sleepy".into(),
                input: String::new(),
            },
        );
        assert!(matches!(
            d.events[1].kind,
            EventKind::TimerStarted {
                delay_ms: 2_000,
                fire_at_ms: 12_000
            }
        ));
        let timer = &d.follow_up[0];
        assert_eq!(timer.delay, Some(Duration::from_secs(2)));
        assert!(matches!(
            &timer.task,
            Task::Decision(DecisionTask {
                generation: 4,
                message: DecisionMessage::TimerFired {
                    timer_seq: 2,
                    fire_at_ms: 12_000
                },
                ..
            })
        ));
    }

    #[test]
    fn signal_redelivery_is_deduplicated() {
        let history = vec![
            started("sleepy"),
            Event::new(
                2,
                1_500,
                EventKind::SignalReceived {
                    signal_id: 99,
                    name: "noise".into(),
                    payload: String::new(),
                },
            ),
        ];
        let engine = ReplayEngine::new(key(), 1, history, NOW);
        let msg = DecisionMessage::Signal {
            name: "noise".into(),
            payload: String::new(),
        };
        assert!(matches!(engine.intake(&msg, 99), Intake::Drop(_)));
        assert!(matches!(engine.intake(&msg, 100), Intake::Record { .. }));
    }

    #[test]
    fn messages_before_start_are_deferred() {
        let engine = ReplayEngine::new(key(), 1, vec![], NOW);
        let msg = DecisionMessage::Signal {
            name: "x".into(),
            payload: String::new(),
        };
        assert!(matches!(engine.intake(&msg, 1), Intake::Deferred));
    }

    #[test]
    fn terminate_closes_without_replay() {
        let engine = ReplayEngine::new(key(), 1, vec![started("charge"), charge_scheduled()], NOW);
        let d = decide(engine, DecisionMessage::Terminate { reason: "ops".into() });
        assert_eq!(d.events.len(), 1);
        assert_eq!(d.events[0].seq, 3);
        assert_eq!(d.outcome, Some(ExecutionOutcome::Terminated("ops".into())));
    }

    #[test]
    fn nondeterminism_keeps_inbound_and_fails() {
        let history = vec![started("swapped"), charge_scheduled()];
        let engine = ReplayEngine::new(key(), 1, history, NOW);
        let d = decide(
            engine,
            DecisionMessage::SideEffectResult {
                scheduled_seq: 2,
                attempt: 1,
                outcome: Ok("receipt".into()),
            },
        );
        assert!(d.nondeterministic);
        assert!(matches!(d.events[0].kind, EventKind::SideEffectCompleted { .. }));
        assert!(matches!(
            &d.events[1].kind,
            EventKind::ExecutionFailed { error } if error.is_nondeterminism()
        ));
        assert!(d.follow_up.is_empty());
    }

    #[test]
    fn unregistered_orchestration_fails() {
        let engine = ReplayEngine::new(key(), 1, vec![], NOW);
        let d = decide(
            engine,
            DecisionMessage::Start {
                orchestration: "nope".into(),
                input: String::new(),
            },
        );
        assert!(matches!(
            d.outcome,
            Some(ExecutionOutcome::Failed(ErrorDetails::Unregistered { ref name, .. })) if name == "nope"
        ));
    }

    #[test]
    fn timeout_fails_with_timeout_details() {
        let engine = ReplayEngine::new(key(), 1, vec![started("sleepy")], NOW);
        let d = decide(engine, DecisionMessage::ExecutionTimeout);
        assert!(matches!(
            d.outcome,
            Some(ExecutionOutcome::Failed(ErrorDetails::Timeout { .. }))
        ));
    }
}
