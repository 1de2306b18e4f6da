//! Futures returned by [`OrchestrationContext`]. They never register a waker:
//! the replay driver re-polls the orchestration after every delivered event.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::Either;

use crate::context::{OrchestrationContext, Resolution, ScheduleRequest};
use crate::{RetryPolicy, SideEffectFailure};

pub struct SideEffectFuture {
    ctx: OrchestrationContext,
    name: String,
    input: String,
    policy: RetryPolicy,
    seq: Option<u64>,
}

impl SideEffectFuture {
    pub(crate) fn new(ctx: OrchestrationContext, name: String, input: String, policy: RetryPolicy) -> Self {
        Self {
            ctx,
            name,
            input,
            policy,
            seq: None,
        }
    }
}

impl Future for SideEffectFuture {
    type Output = Result<String, SideEffectFailure>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.ctx.lock();
        let seq = match this.seq {
            Some(seq) => seq,
            None => {
                let req = ScheduleRequest::SideEffect {
                    name: &this.name,
                    input: &this.input,
                    policy: &this.policy,
                };
                match inner.claim_or_schedule(req) {
                    Some(seq) => {
                        this.seq = Some(seq);
                        seq
                    }
                    None => return Poll::Pending,
                }
            }
        };
        match inner.resolution(seq) {
            Some(Resolution::SideEffect(result)) => Poll::Ready(result),
            _ => Poll::Pending,
        }
    }
}

pub struct TimerFuture {
    ctx: OrchestrationContext,
    delay_ms: u64,
    seq: Option<u64>,
}

impl TimerFuture {
    pub(crate) fn new(ctx: OrchestrationContext, delay_ms: u64) -> Self {
        Self {
            ctx,
            delay_ms,
            seq: None,
        }
    }
}

impl Future for TimerFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        let mut inner = this.ctx.lock();
        let seq = match this.seq {
            Some(seq) => seq,
            None => match inner.claim_or_schedule(ScheduleRequest::Timer {
                delay_ms: this.delay_ms,
            }) {
                Some(seq) => {
                    this.seq = Some(seq);
                    seq
                }
                None => return Poll::Pending,
            },
        };
        match inner.resolution(seq) {
            Some(Resolution::Timer) => Poll::Ready(()),
            _ => Poll::Pending,
        }
    }
}

pub struct SignalFuture {
    ctx: OrchestrationContext,
    name: String,
    waiter: Option<u64>,
}

impl SignalFuture {
    pub(crate) fn new(ctx: OrchestrationContext, name: String) -> Self {
        Self { ctx, name, waiter: None }
    }
}

impl Future for SignalFuture {
    type Output = String;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<String> {
        let this = self.get_mut();
        let mut inner = this.ctx.lock();
        if inner.is_diverged() {
            return Poll::Pending;
        }
        match this.waiter {
            None => {
                this.waiter = Some(inner.register_waiter(&this.name));
                Poll::Pending
            }
            Some(waiter) => match inner.take_signal(waiter) {
                Some(payload) => Poll::Ready(payload),
                None => Poll::Pending,
            },
        }
    }
}

impl Drop for SignalFuture {
    fn drop(&mut self) {
        if let Some(waiter) = self.waiter {
            self.ctx.lock().forget_waiter(waiter);
        }
    }
}

/// Deterministic join: every pending child is polled, in order, on each pass.
pub struct DurableJoin<F: Future> {
    pending: Vec<Option<Pin<Box<F>>>>,
    outputs: Vec<Option<F::Output>>,
}

impl<F: Future> DurableJoin<F> {
    pub(crate) fn new(futures: Vec<F>) -> Self {
        let outputs = futures.iter().map(|_| None).collect();
        Self {
            pending: futures.into_iter().map(|f| Some(Box::pin(f))).collect(),
            outputs,
        }
    }
}

impl<F: Future> Unpin for DurableJoin<F> {}

impl<F: Future> Future for DurableJoin<F> {
    type Output = Vec<F::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        for (slot, out) in this.pending.iter_mut().zip(this.outputs.iter_mut()) {
            if let Some(fut) = slot {
                if let Poll::Ready(v) = fut.as_mut().poll(cx) {
                    *out = Some(v);
                    *slot = None;
                }
            }
        }
        if this.pending.iter().all(Option::is_none) {
            Poll::Ready(this.outputs.iter_mut().filter_map(Option::take).collect())
        } else {
            Poll::Pending
        }
    }
}

pub struct Select2<A: Future, B: Future> {
    a: Pin<Box<A>>,
    b: Pin<Box<B>>,
}

impl<A: Future, B: Future> Select2<A, B> {
    pub(crate) fn new(a: A, b: B) -> Self {
        Self {
            a: Box::pin(a),
            b: Box::pin(b),
        }
    }
}

impl<A: Future, B: Future> Unpin for Select2<A, B> {}

impl<A: Future, B: Future> Future for Select2<A, B> {
    type Output = Either<A::Output, B::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Poll::Ready(v) = this.a.as_mut().poll(cx) {
            return Poll::Ready(Either::Left(v));
        }
        if let Poll::Ready(v) = this.b.as_mut().poll(cx) {
            return Poll::Ready(Either::Right(v));
        }
        Poll::Pending
    }
}
