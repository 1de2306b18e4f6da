//! Pure replay driver: one orchestration pass over a history.
//!
//! [`run_turn`] touches no storage and no clock beyond the `turn_time_ms` it
//! is given, so scenario tests can feed it hand-built histories.

use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::task::{Context, Poll};

use crate::context::{Delivery, OrchestrationContext, QueryHandler};
use crate::{Command, ErrorDetails, Event, EventKind, ExecutionKey, OrchestrationError};

#[derive(Debug, Clone, PartialEq)]
pub enum TurnStatus {
    /// Orchestration is waiting on a side effect, timer or signal.
    Suspended,
    Completed(String),
    Failed(ErrorDetails),
    Cancelled(String),
}

impl TurnStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TurnStatus::Suspended)
    }
}

/// Result of replaying an orchestration against a history.
pub struct TurnOutput {
    /// Schedule events recorded by this pass, seqs continuing the history.
    pub new_events: Vec<Event>,
    pub commands: Vec<Command>,
    pub status: TurnStatus,
    pub cancel_requested: bool,
    pub(crate) queries: HashMap<String, QueryHandler>,
}

impl TurnOutput {
    pub(crate) fn failed(details: ErrorDetails) -> Self {
        Self {
            new_events: Vec::new(),
            commands: Vec::new(),
            status: TurnStatus::Failed(details),
            cancel_requested: false,
            queries: HashMap::new(),
        }
    }

    /// Runs a query handler registered during this pass.
    pub fn query(&self, name: &str, args: &str) -> Option<Result<String, String>> {
        self.queries.get(name).map(|h| h(args.to_string()))
    }

    pub fn query_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queries.keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn take_queries(&mut self) -> HashMap<String, QueryHandler> {
        std::mem::take(&mut self.queries)
    }
}

impl std::fmt::Debug for TurnOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnOutput")
            .field("new_events", &self.new_events)
            .field("commands", &self.commands)
            .field("status", &self.status)
            .field("cancel_requested", &self.cancel_requested)
            .field("queries", &self.query_names())
            .finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Replays `orchestration` against `history` and advances it until it
/// completes or every inbound event has been delivered.
///
/// `history` must begin with `ExecutionStarted`. Inbound events are
/// delivered strictly in history order with a poll after each one. A pass
/// that diverges from the recorded schedule events yields
/// `TurnStatus::Failed(ErrorDetails::NonDeterminism)` with no new events or
/// commands.
pub fn run_turn<F, Fut>(key: ExecutionKey, history: Vec<Event>, turn_time_ms: u64, orchestration: F) -> TurnOutput
where
    F: FnOnce(OrchestrationContext, String) -> Fut,
    Fut: Future<Output = Result<String, OrchestrationError>>,
{
    let input = match history.first().map(|e| &e.kind) {
        Some(EventKind::ExecutionStarted { input, .. }) => input.clone(),
        _ => {
            return TurnOutput::failed(ErrorDetails::nondeterminism(
                "history does not begin with ExecutionStarted",
            ))
        }
    };

    let ctx = OrchestrationContext::new(key, history, turn_time_ms);
    let mut cx = Context::from_waker(futures::task::noop_waker_ref());

    let polled = catch_unwind(AssertUnwindSafe(|| {
        let mut fut = Box::pin(orchestration(ctx.clone(), input));
        loop {
            match fut.as_mut().poll(&mut cx) {
                Poll::Ready(result) => return (Some(result), Vec::new()),
                Poll::Pending => match ctx.deliver_next() {
                    Delivery::Delivered | Delivery::Handler { .. } => continue,
                    Delivery::Exhausted | Delivery::Diverged => {
                        return (None, ctx.lock().pending_signal_waits());
                    }
                },
            }
        }
    }));

    let parts = ctx.take_parts();
    let (result, waits) = match polled {
        Ok(r) => r,
        Err(payload) => {
            return TurnOutput::failed(ErrorDetails::application(format!(
                "orchestration panicked: {}",
                panic_message(payload.as_ref())
            )))
        }
    };

    if let Some(message) = parts.divergence {
        return TurnOutput::failed(ErrorDetails::nondeterminism(message));
    }
    if let Some((seq, recorded)) = parts.unclaimed {
        return TurnOutput::failed(ErrorDetails::nondeterminism(format!(
            "history has {recorded} at seq {seq} that code never issued"
        )));
    }

    let status = match result {
        None => TurnStatus::Suspended,
        Some(Ok(output)) => TurnStatus::Completed(output),
        Some(Err(OrchestrationError::Cancelled(reason))) => TurnStatus::Cancelled(reason),
        Some(Err(OrchestrationError::SideEffect(failure))) => TurnStatus::Failed(failure.into()),
        Some(Err(OrchestrationError::Failed(message))) => TurnStatus::Failed(ErrorDetails::application(message)),
    };

    let mut commands = parts.commands;
    commands.extend(waits.into_iter().map(|name| Command::WaitForSignal { name }));

    TurnOutput {
        new_events: parts.new_events,
        commands,
        status,
        cancel_requested: parts.cancel_requested,
        queries: parts.queries,
    }
}
