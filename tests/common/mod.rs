#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use reprise::providers::in_memory::InMemoryProvider;
use reprise::providers::sqlite::SqliteProvider;
use reprise::providers::Provider;
use reprise::runtime::{MetricsSnapshot, OrchestrationRegistry, SideEffectRegistry, Worker, WorkerOptions};
use reprise::{Event, EventKind, ExecutionKey, OrchestrationContext, OrchestrationError, RetryPolicy};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

pub const QUEUE: &str = "loans";

// ---- history builders ----

pub fn started(orchestration: &str, input: &str) -> Event {
    Event::new(
        1,
        1_000,
        EventKind::ExecutionStarted {
            orchestration: orchestration.into(),
            input: input.into(),
        },
    )
}

pub fn scheduled(seq: u64, name: &str, input: &str) -> Event {
    Event::new(
        seq,
        1_000 + seq,
        EventKind::SideEffectScheduled {
            name: name.into(),
            input: input.into(),
            policy: RetryPolicy::once(),
        },
    )
}

pub fn completed(seq: u64, scheduled_seq: u64, result: &str) -> Event {
    Event::new(
        seq,
        1_000 + seq,
        EventKind::SideEffectCompleted {
            scheduled_seq,
            attempt: 1,
            result: result.into(),
        },
    )
}

pub fn timer_started(seq: u64, delay: Duration) -> Event {
    let delay_ms = delay.as_millis() as u64;
    Event::new(
        seq,
        1_000 + seq,
        EventKind::TimerStarted {
            delay_ms,
            fire_at_ms: 1_000 + seq + delay_ms,
        },
    )
}

pub fn timer_fired(seq: u64, timer_seq: u64, fire_at_ms: u64) -> Event {
    Event::new(seq, fire_at_ms, EventKind::TimerFired { timer_seq, fire_at_ms })
}

pub fn signal(seq: u64, name: &str, payload: &str) -> Event {
    Event::new(
        seq,
        1_000 + seq,
        EventKind::SignalReceived {
            signal_id: 1_000 + seq,
            name: name.into(),
            payload: payload.into(),
        },
    )
}

// ---- providers and workers ----

pub fn in_memory() -> Arc<dyn Provider> {
    Arc::new(InMemoryProvider::new())
}

pub async fn create_sqlite_store_disk() -> (Arc<dyn Provider>, TempDir) {
    let td = tempfile::tempdir().unwrap();
    let db_path = td.path().join("test.db");
    let url = format!("sqlite:{}", db_path.display());
    let store = SqliteProvider::new(&url).await.unwrap();
    (Arc::new(store), td)
}

pub fn fast_options() -> WorkerOptions {
    WorkerOptions::new(QUEUE)
        .with_idle_poll_interval(Duration::from_millis(2))
        .with_conflict_retry_delay(Duration::from_millis(5))
        .with_worker_id("test")
}

pub async fn start_worker(
    provider: Arc<dyn Provider>,
    orchestrations: OrchestrationRegistry,
    side_effects: SideEffectRegistry,
) -> Arc<Worker> {
    Worker::start(provider, orchestrations, side_effects, fast_options()).await
}

pub async fn wait_for_history<F>(provider: &Arc<dyn Provider>, key: &ExecutionKey, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&[Event]) -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let hist = provider.read(key).await.unwrap_or_default();
        if predicate(&hist) {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Metrics are recorded after the commit that makes an outcome visible, so
/// tests poll for them.
pub async fn wait_for_metrics<F>(worker: &Worker, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&MetricsSnapshot) -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if predicate(&worker.metrics()) {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn count<F: Fn(&EventKind) -> bool>(history: &[Event], f: F) -> usize {
    history.iter().filter(|e| f(&e.kind)).count()
}

// ---- loan approval ----

pub const CHECK_INTERVAL: Duration = Duration::from_millis(40);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoanRequest {
    pub customer_id: String,
    pub amount: u64,
}

pub fn loan_input() -> String {
    serde_json::to_string(&LoanRequest {
        customer_id: "123".into(),
        amount: 50_000,
    })
    .unwrap()
}

/// Submits an application, polls its decision every `CHECK_INTERVAL` until
/// it is no longer PENDING, then persists and publishes an approval.
/// Cancellation between checks ends with REJECTED.
pub async fn loan_orchestration(ctx: OrchestrationContext, input: String) -> Result<String, OrchestrationError> {
    let status = Arc::new(Mutex::new("SUBMITTING".to_string()));
    let s = status.clone();
    ctx.register_query_handler("status", move |_args| Ok(s.lock().unwrap().clone()));

    let application_id = ctx.call_side_effect("submit", input).await?;
    *status.lock().unwrap() = "PENDING".to_string();

    let decision = loop {
        if ctx.is_cancellation_requested() {
            *status.lock().unwrap() = "REJECTED".to_string();
            return Ok("REJECTED".to_string());
        }
        let decision = ctx.call_side_effect("check_decision", application_id.clone()).await?;
        if decision != "PENDING" {
            break decision;
        }
        ctx.timer(CHECK_INTERVAL).await;
    };

    *status.lock().unwrap() = decision.clone();
    if decision == "APPROVED" {
        ctx.call_side_effect("persist", application_id.clone()).await?;
        ctx.call_side_effect("publish", application_id).await?;
    }
    Ok(decision)
}

pub fn loan_orchestrations() -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register("loan", loan_orchestration)
        .build()
}

/// Scripted bank: `check_decision` pops from `decisions`, answering PENDING
/// once the script runs out. Every call is recorded in `calls`.
#[derive(Clone, Default)]
pub struct LoanBank {
    pub decisions: Arc<Mutex<VecDeque<String>>>,
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl LoanBank {
    pub fn scripted(decisions: &[&str]) -> Self {
        let bank = Self::default();
        bank.decisions
            .lock()
            .unwrap()
            .extend(decisions.iter().map(|d| d.to_string()));
        bank
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn side_effects(&self) -> SideEffectRegistry {
        let submit = self.calls.clone();
        let check = self.clone();
        let persist = self.calls.clone();
        let publish = self.calls.clone();
        SideEffectRegistry::builder()
            .register("submit", move |_ctx, input: String| {
                let calls = submit.clone();
                async move {
                    let req: LoanRequest = match serde_json::from_str(&input) {
                        Ok(req) => req,
                        Err(e) => return Err(reprise::SideEffectError::terminal(e.to_string())),
                    };
                    calls.lock().unwrap().push("submit".into());
                    Ok(format!("app-{}", req.customer_id))
                }
            })
            .register("check_decision", move |_ctx, _app: String| {
                let bank = check.clone();
                async move {
                    bank.calls.lock().unwrap().push("check_decision".into());
                    let next = bank.decisions.lock().unwrap().pop_front();
                    Ok(next.unwrap_or_else(|| "PENDING".to_string()))
                }
            })
            .register("persist", move |_ctx, _app: String| {
                let calls = persist.clone();
                async move {
                    calls.lock().unwrap().push("persist".into());
                    Ok(String::new())
                }
            })
            .register("publish", move |_ctx, _app: String| {
                let calls = publish.clone();
                async move {
                    calls.lock().unwrap().push("publish".into());
                    Ok(String::new())
                }
            })
            .build()
    }
}
