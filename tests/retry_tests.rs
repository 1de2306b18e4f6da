use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reprise::runtime::{OrchestrationRegistry, SideEffectRegistry};
use reprise::{
    BackoffStrategy, Client, ErrorDetails, EventKind, ExecutionOutcome, FailureClass, OrchestrationContext, RetryPolicy,
    SideEffectError,
};

mod common;
use common::*;

fn fast_backoff(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts).with_backoff(BackoffStrategy::Fixed {
        delay: Duration::from_millis(5),
    })
}

#[tokio::test]
async fn always_retryable_runs_exactly_max_attempts() {
    let provider = in_memory();
    let attempts = Arc::new(AtomicU32::new(0));
    let seen = attempts.clone();
    let side_effects = SideEffectRegistry::builder()
        .register("flaky", move |ctx, _input: String| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Err(SideEffectError::retryable(format!("attempt {} failed", ctx.attempt())))
            }
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("retrying", |ctx: OrchestrationContext, input: String| async move {
            Ok(ctx.call_side_effect_with_retry("flaky", input, fast_backoff(4)).await?)
        })
        .build();
    let worker = start_worker(provider.clone(), orchestrations, side_effects).await;
    let client = Client::new(provider.clone());

    let handle = client.start("r1", QUEUE, "retrying", "x").await.unwrap();
    let outcome = handle.result_timeout(Duration::from_secs(5)).await.unwrap();
    match outcome {
        ExecutionOutcome::Failed(ErrorDetails::SideEffect { name, attempts, error }) => {
            assert_eq!(name, "flaky");
            assert_eq!(attempts, 4);
            assert_eq!(error.message, "attempt 4 failed");
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 4);

    let history = provider.read(handle.key()).await.unwrap();
    let failures: Vec<bool> = history
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::SideEffectFailed { terminal, .. } => Some(*terminal),
            _ => None,
        })
        .collect();
    assert_eq!(failures, vec![false, false, false, true]);
    worker.shutdown().await;
}

#[tokio::test]
async fn non_retryable_code_fails_on_first_attempt() {
    let provider = in_memory();
    let attempts = Arc::new(AtomicU32::new(0));
    let seen = attempts.clone();
    let side_effects = SideEffectRegistry::builder()
        .register("charge", move |_ctx, _input: String| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Err(SideEffectError::retryable("card declined").with_code("DECLINED"))
            }
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("pay", |ctx: OrchestrationContext, input: String| async move {
            let policy = fast_backoff(5).with_non_retryable_code("DECLINED");
            match ctx.call_side_effect_with_retry("charge", input, policy).await {
                Ok(r) => Ok(r),
                Err(failure) => Ok(format!("handled after {} attempt(s)", failure.attempts)),
            }
        })
        .build();
    let worker = start_worker(provider.clone(), orchestrations, side_effects).await;
    let client = Client::new(provider.clone());

    let handle = client.start("r2", QUEUE, "pay", "card").await.unwrap();
    let outcome = handle.result_timeout(Duration::from_secs(5)).await.unwrap();
    assert_eq!(outcome, ExecutionOutcome::Completed("handled after 1 attempt(s)".into()));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    worker.shutdown().await;
}

#[tokio::test]
async fn two_timeouts_then_success_completes() {
    let provider = in_memory();
    let attempts = Arc::new(AtomicU32::new(0));
    let seen = attempts.clone();
    let side_effects = SideEffectRegistry::builder()
        .register("slow_then_fast", move |_ctx, input: String| {
            let seen = seen.clone();
            async move {
                if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Ok(format!("{input}-done"))
            }
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("patient", |ctx: OrchestrationContext, input: String| async move {
            let policy = fast_backoff(3).with_timeout(Duration::from_millis(50));
            Ok(ctx.call_side_effect_with_retry("slow_then_fast", input, policy).await?)
        })
        .build();
    let worker = start_worker(provider.clone(), orchestrations, side_effects).await;
    let client = Client::new(provider.clone());

    let handle = client.start("r3", QUEUE, "patient", "job").await.unwrap();
    let outcome = handle.result_timeout(Duration::from_secs(5)).await.unwrap();
    assert_eq!(outcome, ExecutionOutcome::Completed("job-done".into()));

    let history = provider.read(handle.key()).await.unwrap();
    let failures: Vec<(FailureClass, bool)> = history
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::SideEffectFailed { error, terminal, .. } => Some((error.class, *terminal)),
            _ => None,
        })
        .collect();
    assert_eq!(failures, vec![(FailureClass::Timeout, false), (FailureClass::Timeout, false)]);
    assert_eq!(count(&history, |k| matches!(k, EventKind::SideEffectCompleted { attempt: 3, .. })), 1);
    assert!(wait_for_metrics(&worker, |m| m.side_effect_timeouts == 2, 1_000).await);
    worker.shutdown().await;
}

#[tokio::test]
async fn unregistered_side_effect_fails_terminally() {
    let provider = in_memory();
    let orchestrations = OrchestrationRegistry::builder()
        .register("lost", |ctx: OrchestrationContext, input: String| async move {
            Ok(ctx.call_side_effect_with_retry("missing", input, fast_backoff(3)).await?)
        })
        .build();
    let worker = start_worker(provider.clone(), orchestrations, SideEffectRegistry::builder().build()).await;
    let client = Client::new(provider.clone());

    let handle = client.start("r4", QUEUE, "lost", "").await.unwrap();
    let outcome = handle.result_timeout(Duration::from_secs(5)).await.unwrap();
    match outcome {
        ExecutionOutcome::Failed(ErrorDetails::SideEffect { attempts, error, .. }) => {
            assert_eq!(attempts, 1);
            assert_eq!(error.class, FailureClass::Terminal);
            assert!(error.message.contains("unregistered side effect 'missing'"));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    worker.shutdown().await;
}

#[tokio::test]
async fn fan_out_schedules_every_call_in_one_turn() {
    let provider = in_memory();
    let side_effects = SideEffectRegistry::builder()
        .register("square", |_ctx, input: String| async move {
            let n: u64 = input.parse().map_err(|_| SideEffectError::terminal("not a number"))?;
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, SideEffectError>((n * n).to_string())
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("squares", |ctx: OrchestrationContext, _input: String| async move {
            let calls = (1..=4).map(|n| ctx.call_side_effect("square", n.to_string())).collect();
            let results = ctx.join(calls).await;
            let mut total = 0u64;
            for r in results {
                total += r?.parse::<u64>().map_err(|e| e.to_string())?;
            }
            Ok(total.to_string())
        })
        .build();
    let worker = start_worker(provider.clone(), orchestrations, side_effects).await;
    let client = Client::new(provider.clone());

    let handle = client.start("fan", QUEUE, "squares", "").await.unwrap();
    let outcome = handle.result_timeout(Duration::from_secs(5)).await.unwrap();
    assert_eq!(outcome, ExecutionOutcome::Completed("30".into()));

    let history = provider.read(handle.key()).await.unwrap();
    let scheduled: Vec<u64> = history
        .iter()
        .filter(|e| matches!(e.kind, EventKind::SideEffectScheduled { .. }))
        .map(|e| e.seq)
        .collect();
    assert_eq!(scheduled, vec![2, 3, 4, 5]);
    worker.shutdown().await;
}
