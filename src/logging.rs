//! Replay-safe logging for orchestration code.
//!
//! Orchestration code re-runs on every decision cycle; these macros only emit
//! when the context is executing past the recorded history, so each line is
//! logged once per execution instead of once per replay.

#[macro_export]
macro_rules! durable_info {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::info!(
                target: "reprise::orchestration",
                execution_id = %$ctx.execution_id(),
                $($arg)+
            );
        }
    }};
}

#[macro_export]
macro_rules! durable_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::warn!(
                target: "reprise::orchestration",
                execution_id = %$ctx.execution_id(),
                $($arg)+
            );
        }
    }};
}

#[macro_export]
macro_rules! durable_error {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::error!(
                target: "reprise::orchestration",
                execution_id = %$ctx.execution_id(),
                $($arg)+
            );
        }
    }};
}

#[macro_export]
macro_rules! durable_debug {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::debug!(
                target: "reprise::orchestration",
                execution_id = %$ctx.execution_id(),
                $($arg)+
            );
        }
    }};
}
