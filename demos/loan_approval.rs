//! Loan approval walkthrough.
//!
//! Submits an application, polls the bank's decision on a durable timer,
//! exposes the current status through a query, and persists plus publishes
//! an approval. A second application is cancelled while it is still pending.
//!
//! Run with: `cargo run --example loan_approval`

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reprise::providers::sqlite::SqliteProvider;
use reprise::runtime::observability::init_logging;
use reprise::runtime::{ObservabilityConfig, OrchestrationRegistry, SideEffectRegistry, Worker, WorkerOptions};
use reprise::{durable_info, Client, OrchestrationContext, OrchestrationError, QueryResponse, SideEffectError};
use serde::{Deserialize, Serialize};

const QUEUE: &str = "loans";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoanRequest {
    customer_id: String,
    amount: u64,
}

async fn loan(ctx: OrchestrationContext, input: String) -> Result<String, OrchestrationError> {
    let status = Arc::new(Mutex::new("SUBMITTING".to_string()));
    let view = status.clone();
    ctx.register_query_handler("status", move |_| {
        view.lock()
            .map(|s| s.clone())
            .map_err(|_| "status unavailable".to_string())
    });
    let set_status = |s: &str| {
        if let Ok(mut guard) = status.lock() {
            *guard = s.to_string();
        }
    };

    let application_id = ctx.call_side_effect("submit", input).await?;
    durable_info!(ctx, application_id = %application_id, "application submitted");
    set_status("PENDING");

    let decision = loop {
        if ctx.is_cancellation_requested() {
            set_status("REJECTED");
            return Ok("REJECTED".to_string());
        }
        let decision = ctx.call_side_effect("check_decision", application_id.clone()).await?;
        if decision != "PENDING" {
            break decision;
        }
        ctx.timer(Duration::from_millis(200)).await;
    };

    set_status(&decision);
    if decision == "APPROVED" {
        ctx.call_side_effect("persist", application_id.clone()).await?;
        ctx.call_side_effect("publish", application_id).await?;
    }
    durable_info!(ctx, decision = %decision, "loan decided");
    Ok(decision)
}

/// The bank approves `loan-1` on its third check and never decides `loan-2`.
fn bank() -> SideEffectRegistry {
    let checks = Arc::new(AtomicU32::new(0));
    SideEffectRegistry::builder()
        .register("submit", |ctx, input: String| async move {
            let req: LoanRequest =
                serde_json::from_str(&input).map_err(|e| SideEffectError::terminal(format!("bad request: {e}")))?;
            ctx.trace_info(format!("submitting {} for customer {}", req.amount, req.customer_id));
            Ok(format!("app-{}", ctx.key().execution_id))
        })
        .register("check_decision", move |_ctx, application_id: String| {
            let checks = checks.clone();
            async move {
                if application_id == "app-loan-1" && checks.fetch_add(1, Ordering::SeqCst) >= 2 {
                    Ok("APPROVED".to_string())
                } else {
                    Ok("PENDING".to_string())
                }
            }
        })
        .register("persist", |ctx, application_id: String| async move {
            ctx.trace_info(format!("persisted {application_id}"));
            Ok(String::new())
        })
        .register("publish", |ctx, application_id: String| async move {
            ctx.trace_info(format!("published {application_id}"));
            Ok(String::new())
        })
        .build()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(&ObservabilityConfig::default())?;

    let temp_dir = tempfile::tempdir()?;
    let db_url = format!("sqlite:{}", temp_dir.path().join("loans.db").display());
    let provider = Arc::new(SqliteProvider::new(&db_url).await?);

    let orchestrations = OrchestrationRegistry::builder().register("loan", loan).build();
    let worker = Worker::start(provider.clone(), orchestrations, bank(), WorkerOptions::new(QUEUE)).await;
    let client = Client::new(provider);

    let request = LoanRequest {
        customer_id: "123".into(),
        amount: 50_000,
    };
    let approved = client.start_typed("loan-1", QUEUE, "loan", &request).await?;
    let pending = client.start_typed("loan-2", QUEUE, "loan", &request).await?;

    tokio::time::sleep(Duration::from_millis(300)).await;
    if let QueryResponse::Live { as_of_seq, value } = pending.query("status", "").await? {
        println!("loan-2 status at seq {as_of_seq}: {value}");
    }
    pending.cancel("customer withdrew").await?;

    println!("loan-1: {:?}", approved.result_timeout(Duration::from_secs(10)).await?);
    println!("loan-2: {:?}", pending.result_timeout(Duration::from_secs(10)).await?);
    println!("{:?}", worker.metrics());

    worker.shutdown().await;
    Ok(())
}
