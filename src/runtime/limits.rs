//! Runtime limits and constants.
//!
//! Hard limits live here so runtime code and tests reference one place.

use std::time::Duration;

/// Upper bound on query snapshots a worker keeps in memory. When full, the
/// snapshot with the lowest `as_of_seq` is evicted; evicted executions fall
/// back to a non-mutating replay on their next query.
pub const MAX_CACHED_SNAPSHOTS: usize = 1024;

/// Retries of a provider call that failed with a retryable error, after the
/// first attempt.
pub const PROVIDER_RETRY_ATTEMPTS: u32 = 5;

/// Backoff before the first provider retry; doubles per retry.
pub const PROVIDER_RETRY_BASE_MS: u64 = 10;

/// How long `Worker::shutdown` waits for a loop to finish its current task
/// before aborting it.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Lease renewal switches from "lease minus buffer" to "half the lease"
/// below this duration.
pub const RENEWAL_BUFFER_THRESHOLD: Duration = Duration::from_secs(15);

/// Poll interval used by `Client::result` and `Client::query` while waiting.
pub const CLIENT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default bound on `Client::query`.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);
