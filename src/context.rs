//! Orchestration context and the per-replay state behind it.
//!
//! A context is rebuilt from history on every decision cycle. Side-effect
//! calls and timers claim the recorded schedule events in order; inbound
//! events (completions, terminal failures, timer fires, signals) are
//! delivered one at a time by the replay driver in [`crate::replay`].

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};

use crate::codec::{Codec, Json};
use crate::durable_future::{DurableJoin, Select2, SideEffectFuture, SignalFuture, TimerFuture};
use crate::{
    Command, Event, EventKind, ExecutionKey, RetryPolicy, SideEffectError, SideEffectFailure, CANCEL_SIGNAL,
};

/// Read-only query callback registered by orchestration code.
pub type QueryHandler = Arc<dyn Fn(String) -> Result<String, String> + Send + Sync>;

pub(crate) type SignalHandler = Box<dyn FnMut(String) + Send>;

#[derive(Debug, Clone)]
pub(crate) enum Resolution {
    SideEffect(Result<String, SideEffectFailure>),
    Timer,
}

pub(crate) enum ScheduleRequest<'a> {
    SideEffect {
        name: &'a str,
        input: &'a str,
        policy: &'a RetryPolicy,
    },
    Timer {
        delay_ms: u64,
    },
}

impl ScheduleRequest<'_> {
    fn matches(&self, kind: &EventKind) -> bool {
        match (self, kind) {
            (
                ScheduleRequest::SideEffect { name, input, .. },
                EventKind::SideEffectScheduled {
                    name: recorded_name,
                    input: recorded_input,
                    ..
                },
            ) => recorded_name == name && recorded_input == input,
            (ScheduleRequest::Timer { delay_ms }, EventKind::TimerStarted { delay_ms: recorded, .. }) => {
                recorded == delay_ms
            }
            _ => false,
        }
    }

    fn describe(&self) -> String {
        match self {
            ScheduleRequest::SideEffect { name, input, .. } => format!("SideEffectScheduled('{name}','{input}')"),
            ScheduleRequest::Timer { delay_ms } => format!("TimerStarted({delay_ms}ms)"),
        }
    }
}

fn describe_recorded(kind: &EventKind) -> String {
    match kind {
        EventKind::SideEffectScheduled { name, input, .. } => format!("SideEffectScheduled('{name}','{input}')"),
        EventKind::TimerStarted { delay_ms, .. } => format!("TimerStarted({delay_ms}ms)"),
        other => other.name().to_string(),
    }
}

pub(crate) enum Delivery {
    Delivered,
    /// A signal for which a handler is registered; the caller invokes it
    /// outside the context lock.
    Handler { name: String, payload: String },
    Exhausted,
    Diverged,
}

/// Everything a finished replay pass hands back to the driver.
pub(crate) struct ReplayParts {
    pub(crate) new_events: Vec<Event>,
    pub(crate) commands: Vec<Command>,
    pub(crate) divergence: Option<String>,
    pub(crate) unclaimed: Option<(u64, String)>,
    pub(crate) queries: HashMap<String, QueryHandler>,
    pub(crate) cancel_requested: bool,
}

pub(crate) struct CtxInner {
    key: ExecutionKey,
    history: Vec<Event>,
    seq_index: HashMap<u64, usize>,
    schedule_positions: Vec<usize>,
    last_inbound: Option<usize>,
    claimed: usize,
    cursor: usize,
    next_seq: u64,
    turn_time_ms: u64,
    now_ms: u64,

    new_events: Vec<Event>,
    commands: Vec<Command>,
    resolutions: HashMap<u64, Resolution>,

    signal_waiters: VecDeque<(u64, String)>,
    signal_arrivals: HashMap<u64, String>,
    next_waiter: u64,
    signal_handlers: HashMap<String, SignalHandler>,
    query_handlers: HashMap<String, QueryHandler>,
    cancel_reason: Option<String>,

    divergence: Option<String>,
}

impl CtxInner {
    fn new(key: ExecutionKey, history: Vec<Event>, turn_time_ms: u64) -> Self {
        let mut seq_index = HashMap::with_capacity(history.len());
        let mut schedule_positions = Vec::new();
        let mut last_inbound = None;
        for (idx, ev) in history.iter().enumerate() {
            seq_index.insert(ev.seq, idx);
            if ev.kind.is_schedule() {
                schedule_positions.push(idx);
            }
            if ev.kind.is_inbound() {
                last_inbound = Some(idx);
            }
        }
        let next_seq = history.last().map_or(1, |e| e.seq + 1);
        let now_ms = history.first().map_or(turn_time_ms, |e| e.timestamp_ms);
        // Index 0 is ExecutionStarted and is consumed by the driver.
        let cursor = usize::from(!history.is_empty());
        Self {
            key,
            history,
            seq_index,
            schedule_positions,
            last_inbound,
            claimed: 0,
            cursor,
            next_seq,
            turn_time_ms,
            now_ms,
            new_events: Vec::new(),
            commands: Vec::new(),
            resolutions: HashMap::new(),
            signal_waiters: VecDeque::new(),
            signal_arrivals: HashMap::new(),
            next_waiter: 0,
            signal_handlers: HashMap::new(),
            query_handlers: HashMap::new(),
            cancel_reason: None,
            divergence: None,
        }
    }

    fn diverge(&mut self, message: String) {
        if self.divergence.is_none() {
            tracing::debug!(target: "reprise::replay", execution = %self.key, %message, "replay diverged");
            self.divergence = Some(message);
        }
    }

    pub(crate) fn is_diverged(&self) -> bool {
        self.divergence.is_some()
    }

    fn is_replaying(&self) -> bool {
        self.claimed < self.schedule_positions.len() || self.last_inbound.is_some_and(|i| i >= self.cursor)
    }

    fn next_inbound_index(&self) -> Option<usize> {
        self.history
            .get(self.cursor..)?
            .iter()
            .position(|e| e.kind.is_inbound())
            .map(|p| p + self.cursor)
    }

    /// Matches a call against the next unclaimed schedule event, or records a
    /// new one when history is exhausted. `None` means the pass diverged.
    pub(crate) fn claim_or_schedule(&mut self, req: ScheduleRequest<'_>) -> Option<u64> {
        if self.divergence.is_some() {
            return None;
        }
        if let Some(&idx) = self.schedule_positions.get(self.claimed) {
            let ev = &self.history[idx];
            if req.matches(&ev.kind) {
                self.claimed += 1;
                return Some(ev.seq);
            }
            let message = format!(
                "schedule order mismatch: history has {} at seq {} but code issued {}",
                describe_recorded(&ev.kind),
                ev.seq,
                req.describe()
            );
            self.diverge(message);
            return None;
        }
        if let Some(idx) = self.next_inbound_index() {
            let message = format!(
                "code issued {} which history does not record before {} at seq {}",
                req.describe(),
                self.history[idx].kind.name(),
                self.history[idx].seq
            );
            self.diverge(message);
            return None;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let kind = match req {
            ScheduleRequest::SideEffect { name, input, policy } => {
                self.commands.push(Command::ScheduleSideEffect {
                    scheduled_seq: seq,
                    name: name.to_string(),
                    input: input.to_string(),
                    attempt: 1,
                    timeout_ms: policy.timeout_ms(),
                    delay_ms: 0,
                });
                EventKind::SideEffectScheduled {
                    name: name.to_string(),
                    input: input.to_string(),
                    policy: policy.clone(),
                }
            }
            ScheduleRequest::Timer { delay_ms } => {
                let fire_at_ms = self.now_ms.saturating_add(delay_ms);
                self.commands.push(Command::StartTimer {
                    timer_seq: seq,
                    fire_at_ms,
                });
                EventKind::TimerStarted { delay_ms, fire_at_ms }
            }
        };
        self.new_events.push(Event::new(seq, self.turn_time_ms, kind));
        Some(seq)
    }

    pub(crate) fn resolution(&self, seq: u64) -> Option<Resolution> {
        self.resolutions.get(&seq).cloned()
    }

    pub(crate) fn register_waiter(&mut self, name: &str) -> u64 {
        let id = self.next_waiter;
        self.next_waiter += 1;
        self.signal_waiters.push_back((id, name.to_string()));
        id
    }

    /// Drops a waiter whose future went away, so it cannot swallow a later
    /// signal.
    pub(crate) fn forget_waiter(&mut self, waiter: u64) {
        self.signal_waiters.retain(|(id, _)| *id != waiter);
        self.signal_arrivals.remove(&waiter);
    }

    pub(crate) fn take_signal(&mut self, waiter: u64) -> Option<String> {
        self.signal_arrivals.remove(&waiter)
    }

    fn scheduled_side_effect_name(&self, seq: u64) -> Option<String> {
        let idx = self.seq_index.get(&seq)?;
        match &self.history[*idx].kind {
            EventKind::SideEffectScheduled { name, .. } => Some(name.clone()),
            _ => None,
        }
    }

    fn is_timer(&self, seq: u64) -> bool {
        self.seq_index
            .get(&seq)
            .is_some_and(|idx| matches!(self.history[*idx].kind, EventKind::TimerStarted { .. }))
    }

    /// Advances the cursor to the next inbound event and applies it.
    pub(crate) fn deliver_next(&mut self) -> Delivery {
        if self.divergence.is_some() {
            return Delivery::Diverged;
        }
        let Some(target) = self.next_inbound_index() else {
            return Delivery::Exhausted;
        };
        if let Some(&idx) = self.schedule_positions.get(self.claimed) {
            if idx < target {
                let message = format!(
                    "history has {} at seq {} that code did not issue before {} at seq {}",
                    describe_recorded(&self.history[idx].kind),
                    self.history[idx].seq,
                    self.history[target].kind.name(),
                    self.history[target].seq
                );
                self.diverge(message);
                return Delivery::Diverged;
            }
        }

        self.cursor = target + 1;
        let event = self.history[target].clone();
        self.now_ms = self.now_ms.max(event.timestamp_ms);

        match event.kind {
            EventKind::SideEffectCompleted {
                scheduled_seq, result, ..
            } => {
                if self.scheduled_side_effect_name(scheduled_seq).is_none() {
                    self.diverge(format!(
                        "SideEffectCompleted at seq {} refers to seq {scheduled_seq}, which is not a SideEffectScheduled",
                        event.seq
                    ));
                    return Delivery::Diverged;
                }
                self.resolutions
                    .entry(scheduled_seq)
                    .or_insert(Resolution::SideEffect(Ok(result)));
                Delivery::Delivered
            }
            EventKind::SideEffectFailed {
                scheduled_seq,
                attempt,
                error,
                ..
            } => {
                let Some(name) = self.scheduled_side_effect_name(scheduled_seq) else {
                    self.diverge(format!(
                        "SideEffectFailed at seq {} refers to seq {scheduled_seq}, which is not a SideEffectScheduled",
                        event.seq
                    ));
                    return Delivery::Diverged;
                };
                self.resolutions
                    .entry(scheduled_seq)
                    .or_insert(Resolution::SideEffect(Err(SideEffectFailure {
                        name,
                        attempts: attempt,
                        error,
                    })));
                Delivery::Delivered
            }
            EventKind::TimerFired { timer_seq, fire_at_ms } => {
                if !self.is_timer(timer_seq) {
                    self.diverge(format!(
                        "TimerFired at seq {} refers to seq {timer_seq}, which is not a TimerStarted",
                        event.seq
                    ));
                    return Delivery::Diverged;
                }
                self.now_ms = self.now_ms.max(fire_at_ms);
                self.resolutions.insert(timer_seq, Resolution::Timer);
                Delivery::Delivered
            }
            EventKind::SignalReceived { name, payload, .. } => {
                if name == CANCEL_SIGNAL && self.cancel_reason.is_none() {
                    self.cancel_reason = Some(payload.clone());
                }
                if let Some(pos) = self.signal_waiters.iter().position(|(_, n)| *n == name) {
                    if let Some((waiter, _)) = self.signal_waiters.remove(pos) {
                        self.signal_arrivals.insert(waiter, payload);
                    }
                    Delivery::Delivered
                } else if self.signal_handlers.contains_key(&name) {
                    Delivery::Handler { name, payload }
                } else {
                    if name != CANCEL_SIGNAL {
                        tracing::debug!(
                            target: "reprise::replay",
                            execution = %self.key,
                            signal = %name,
                            seq = event.seq,
                            "signal has no waiter or handler; dropped"
                        );
                    }
                    Delivery::Delivered
                }
            }
            _ => Delivery::Delivered,
        }
    }

    /// Names of signal waits still pending, oldest first.
    pub(crate) fn pending_signal_waits(&self) -> Vec<String> {
        self.signal_waiters.iter().map(|(_, name)| name.clone()).collect()
    }

    pub(crate) fn take_parts(&mut self) -> ReplayParts {
        let commands = std::mem::take(&mut self.commands);
        let unclaimed = self
            .schedule_positions
            .get(self.claimed)
            .map(|&idx| (self.history[idx].seq, describe_recorded(&self.history[idx].kind)));
        self.signal_handlers.clear();
        ReplayParts {
            new_events: std::mem::take(&mut self.new_events),
            commands,
            divergence: self.divergence.take(),
            unclaimed,
            queries: std::mem::take(&mut self.query_handlers),
            cancel_requested: self.cancel_reason.is_some(),
        }
    }
}

/// Handle given to orchestration code. Cheap to clone.
#[derive(Clone)]
pub struct OrchestrationContext {
    inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    pub(crate) fn new(key: ExecutionKey, history: Vec<Event>, turn_time_ms: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(key, history, turn_time_ms))),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CtxInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delivers the next inbound event, running a signal handler if one
    /// claims it. The handler runs without the context lock held so it may
    /// call back into the context.
    pub(crate) fn deliver_next(&self) -> Delivery {
        let delivery = self.lock().deliver_next();
        match delivery {
            Delivery::Handler { name, payload } => {
                let handler = self.lock().signal_handlers.remove(&name);
                if let Some(mut handler) = handler {
                    handler(payload);
                    self.lock().signal_handlers.entry(name).or_insert(handler);
                }
                Delivery::Delivered
            }
            other => other,
        }
    }

    pub(crate) fn take_parts(&self) -> ReplayParts {
        self.lock().take_parts()
    }

    pub fn key(&self) -> ExecutionKey {
        self.lock().key.clone()
    }

    pub fn execution_id(&self) -> String {
        self.lock().key.execution_id.clone()
    }

    pub fn task_queue(&self) -> String {
        self.lock().key.task_queue.clone()
    }

    /// Deterministic clock: timestamp of the most recently delivered event.
    pub fn now_ms(&self) -> u64 {
        self.lock().now_ms
    }

    /// True while code is re-executing decisions already recorded in history.
    pub fn is_replaying(&self) -> bool {
        self.lock().is_replaying()
    }

    pub fn is_logging_enabled(&self) -> bool {
        !self.is_replaying()
    }

    /// Set once the reserved cancellation signal has been delivered.
    pub fn is_cancellation_requested(&self) -> bool {
        self.lock().cancel_reason.is_some()
    }

    pub fn cancellation_reason(&self) -> Option<String> {
        self.lock().cancel_reason.clone()
    }

    /// Call a side effect once, without a timeout.
    pub fn call_side_effect(&self, name: impl Into<String>, input: impl Into<String>) -> SideEffectFuture {
        self.call_side_effect_with_retry(name, input, RetryPolicy::once())
    }

    pub fn call_side_effect_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        policy: RetryPolicy,
    ) -> SideEffectFuture {
        SideEffectFuture::new(self.clone(), name.into(), input.into(), policy)
    }

    /// JSON-encoded variant of [`call_side_effect`](Self::call_side_effect).
    pub async fn call_side_effect_typed<In, Out>(
        &self,
        name: impl Into<String>,
        input: &In,
    ) -> Result<Out, SideEffectFailure>
    where
        In: Serialize,
        Out: DeserializeOwned,
    {
        let name = name.into();
        let codec_failure = |message: String, name: &str| SideEffectFailure {
            name: name.to_string(),
            attempts: 0,
            error: SideEffectError::terminal(message),
        };
        let payload = Json::encode(input).map_err(|e| codec_failure(e, &name))?;
        let output = self.call_side_effect(name.clone(), payload).await?;
        Json::decode(&output).map_err(|e| codec_failure(e, &name))
    }

    pub fn timer(&self, delay: Duration) -> TimerFuture {
        TimerFuture::new(self.clone(), crate::millis(delay))
    }

    /// Resolves with the payload of the next signal named `name` that arrives
    /// after this wait was first polled.
    pub fn wait_for_signal(&self, name: impl Into<String>) -> SignalFuture {
        SignalFuture::new(self.clone(), name.into())
    }

    pub async fn wait_for_signal_typed<T: DeserializeOwned>(&self, name: impl Into<String>) -> Result<T, String> {
        let payload = self.wait_for_signal(name).await;
        Json::decode(&payload)
    }

    /// Handler for signals named `name` that arrive after registration and
    /// are not claimed by a pending `wait_for_signal`. Re-registering
    /// replaces the previous handler.
    pub fn register_signal_handler<F>(&self, name: impl Into<String>, handler: F)
    where
        F: FnMut(String) + Send + 'static,
    {
        self.lock().signal_handlers.insert(name.into(), Box::new(handler));
    }

    pub fn register_query_handler<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(String) -> Result<String, String> + Send + Sync + 'static,
    {
        self.lock().query_handlers.insert(name.into(), Arc::new(handler));
    }

    /// Awaits all futures, polling each one in order on every pass.
    pub fn join<F: Future>(&self, futures: Vec<F>) -> DurableJoin<F> {
        DurableJoin::new(futures)
    }

    /// Resolves with whichever future completes first; `a` wins ties.
    pub fn select2<A: Future, B: Future>(&self, a: A, b: B) -> Select2<A, B> {
        Select2::new(a, b)
    }

    /// Re-checks `predicate` after every `interval` timer until it holds
    /// (`true`) or `deadline` of durable time has elapsed (`false`).
    pub async fn wait_for_condition<P>(&self, interval: Duration, deadline: Option<Duration>, mut predicate: P) -> bool
    where
        P: FnMut() -> bool,
    {
        let started = self.now_ms();
        let deadline_ms = deadline.map(crate::millis);
        loop {
            if predicate() {
                return true;
            }
            if deadline_ms.is_some_and(|d| self.now_ms().saturating_sub(started) >= d) {
                return false;
            }
            self.timer(interval).await;
        }
    }

    /// Waits `interval`, calls side effect `name`, and repeats until `accept`
    /// returns true for the recorded output (`Some(output)`) or `deadline`
    /// elapses (`None`).
    pub async fn poll_until<A>(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        interval: Duration,
        deadline: Option<Duration>,
        mut accept: A,
    ) -> Result<Option<String>, SideEffectFailure>
    where
        A: FnMut(&str) -> bool,
    {
        let name = name.into();
        let input = input.into();
        let started = self.now_ms();
        let deadline_ms = deadline.map(crate::millis);
        loop {
            self.timer(interval).await;
            let output = self.call_side_effect(name.clone(), input.clone()).await?;
            if accept(&output) {
                return Ok(Some(output));
            }
            if deadline_ms.is_some_and(|d| self.now_ms().saturating_sub(started) >= d) {
                return Ok(None);
            }
        }
    }

    pub fn trace_info(&self, message: impl Into<String>) {
        let message = message.into();
        crate::durable_info!(self, "{}", message);
    }

    pub fn trace_warn(&self, message: impl Into<String>) {
        let message = message.into();
        crate::durable_warn!(self, "{}", message);
    }
}
