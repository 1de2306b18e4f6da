use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use tracing::debug;

use super::{
    now_ms, start_tasks, terminal_transition, validate_continuation, ExecutionInfo, HistoryStore, LeasedTask,
    OutgoingTask, Provider, ProviderError, QueryAnswered, ResultChannel, Snapshot, Task, TaskKind, TaskQueue,
};
use crate::{Event, ExecutionKey, ExecutionOutcome, ExecutionStatus};

/// SQLite-backed provider. Every multi-statement operation runs in one
/// transaction whose first statement is a write, so concurrent writers queue
/// on the busy timeout instead of failing a lock upgrade.
pub struct SqliteProvider {
    pool: SqlitePool,
    token_counter: AtomicU64,
}

impl SqliteProvider {
    fn sqlx_to_provider_error(operation: &str, e: sqlx::Error) -> ProviderError {
        let msg = e.to_string();
        if msg.contains("database is locked") || msg.contains("SQLITE_BUSY") || msg.contains("database table is locked")
        {
            return ProviderError::retryable(operation, format!("database locked: {msg}"));
        }
        if msg.contains("UNIQUE constraint") || msg.contains("PRIMARY KEY") {
            return ProviderError::permanent(operation, format!("constraint violation: {msg}"));
        }
        if matches!(e, sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)) || msg.contains("connection") {
            return ProviderError::retryable(operation, format!("connection error: {msg}"));
        }
        ProviderError::retryable(operation, msg)
    }

    fn is_unique_violation(e: &sqlx::Error) -> bool {
        let msg = e.to_string();
        msg.contains("UNIQUE constraint") || msg.contains("PRIMARY KEY")
    }

    /// Opens (creating if missing) the database at `database_url`, e.g.
    /// `sqlite:/var/lib/reprise/state.db`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or schema creation fails.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let is_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let mut pool_options = SqlitePoolOptions::new();
        if is_memory {
            // A private in-memory database lives and dies with its connection.
            pool_options = pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        } else {
            pool_options = pool_options.max_connections(5);
        }
        let pool = pool_options
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if is_memory {
                        sqlx::query("PRAGMA journal_mode = MEMORY").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = OFF").execute(&mut *conn).await?;
                    } else {
                        sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = NORMAL").execute(&mut *conn).await?;
                    }
                    sqlx::query("PRAGMA busy_timeout = 60000").execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .connect_with(options)
            .await?;

        Self::create_schema(&pool).await?;
        Ok(Self {
            pool,
            token_counter: AtomicU64::new(0),
        })
    }

    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        Self::new("sqlite::memory:").await
    }

    async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                task_queue TEXT NOT NULL,
                execution_id TEXT NOT NULL,
                orchestration TEXT NOT NULL,
                input TEXT NOT NULL,
                generation INTEGER NOT NULL,
                status TEXT NOT NULL,
                outcome TEXT,
                last_seq INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (task_queue, execution_id)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS history (
                task_queue TEXT NOT NULL,
                execution_id TEXT NOT NULL,
                generation INTEGER NOT NULL,
                seq INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                event_data TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (task_queue, execution_id, generation, seq)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_queue TEXT NOT NULL,
                execution_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                visible_at INTEGER NOT NULL,
                lock_token TEXT,
                locked_until INTEGER,
                delivery_count INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_fetch ON tasks(task_queue, kind, visible_at)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_execution ON tasks(task_queue, execution_id, kind)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_lock ON tasks(lock_token)")
            .execute(pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS query_results (
                query_id INTEGER PRIMARY KEY,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS snapshots (
                task_queue TEXT NOT NULL,
                execution_id TEXT NOT NULL,
                as_of_seq INTEGER NOT NULL,
                state TEXT NOT NULL,
                PRIMARY KEY (task_queue, execution_id)
            )
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    fn generate_lock_token(&self) -> String {
        let n = self.token_counter.fetch_add(1, Ordering::Relaxed);
        format!("lock_{}_{}_{n}", now_ms(), std::process::id())
    }

    fn visible_at(now: i64, delay: Option<Duration>) -> i64 {
        now.saturating_add(delay.map_or(0, |d| d.as_millis().min(i64::MAX as u128) as i64))
    }

    async fn insert_tasks(
        tx: &mut Transaction<'_, Sqlite>,
        operation: &str,
        tasks: Vec<OutgoingTask>,
        now: i64,
    ) -> Result<(), ProviderError> {
        for t in tasks {
            let payload = serde_json::to_string(&t.task)?;
            sqlx::query("INSERT INTO tasks (task_queue, execution_id, kind, payload, visible_at) VALUES (?, ?, ?, ?, ?)")
                .bind(&t.task.key().task_queue)
                .bind(&t.task.key().execution_id)
                .bind(t.task.kind().as_str())
                .bind(payload)
                .bind(Self::visible_at(now, t.delay))
                .execute(&mut **tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
        }
        Ok(())
    }

    fn row_to_info(row: &SqliteRow) -> Result<ExecutionInfo, ProviderError> {
        let get_err = |e: sqlx::Error| Self::sqlx_to_provider_error("describe", e);
        let status: String = row.try_get("status").map_err(get_err)?;
        let status = ExecutionStatus::parse(&status)
            .ok_or_else(|| ProviderError::Serialization(format!("unknown status '{status}'")))?;
        let outcome: Option<String> = row.try_get("outcome").map_err(get_err)?;
        let outcome = outcome
            .map(|s| serde_json::from_str::<ExecutionOutcome>(&s))
            .transpose()?;
        Ok(ExecutionInfo {
            key: ExecutionKey {
                task_queue: row.try_get("task_queue").map_err(get_err)?,
                execution_id: row.try_get("execution_id").map_err(get_err)?,
            },
            orchestration: row.try_get("orchestration").map_err(get_err)?,
            input: row.try_get("input").map_err(get_err)?,
            generation: row.try_get::<i64, _>("generation").map_err(get_err)? as u64,
            status,
            outcome,
            last_seq: row.try_get::<i64, _>("last_seq").map_err(get_err)? as u64,
            created_at_ms: row.try_get::<i64, _>("created_at").map_err(get_err)? as u64,
            updated_at_ms: row.try_get::<i64, _>("updated_at").map_err(get_err)? as u64,
        })
    }

    /// Conditional append inside `tx`. The guarded UPDATE takes the write
    /// lock before anything is read.
    async fn append_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        key: &ExecutionKey,
        expected_last_seq: u64,
        events: &[Event],
        now: i64,
    ) -> Result<u64, ProviderError> {
        validate_continuation(expected_last_seq, events)?;
        let new_last = events.last().map_or(expected_last_seq, |e| e.seq);
        let transition = terminal_transition(events);
        let status = transition.as_ref().map(|o| o.status().as_str());
        let outcome = transition.as_ref().map(serde_json::to_string).transpose()?;

        let updated = sqlx::query(
            r#"
            UPDATE executions
            SET last_seq = ?1, updated_at = ?2,
                status = COALESCE(?3, status), outcome = COALESCE(?4, outcome)
            WHERE task_queue = ?5 AND execution_id = ?6 AND last_seq = ?7 AND status = 'Running'
            "#,
        )
        .bind(new_last as i64)
        .bind(now)
        .bind(status)
        .bind(outcome)
        .bind(&key.task_queue)
        .bind(&key.execution_id)
        .bind(expected_last_seq as i64)
        .execute(&mut **tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("append", e))?;

        if updated.rows_affected() == 0 {
            let row = sqlx::query("SELECT status, last_seq FROM executions WHERE task_queue = ? AND execution_id = ?")
                .bind(&key.task_queue)
                .bind(&key.execution_id)
                .fetch_optional(&mut **tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error("append", e))?;
            let Some(row) = row else {
                return Err(ProviderError::NotFound(key.clone()));
            };
            let status: String = row.try_get("status").map_err(|e| Self::sqlx_to_provider_error("append", e))?;
            if status != ExecutionStatus::Running.as_str() {
                return Err(ProviderError::ExecutionClosed(key.clone()));
            }
            let actual: i64 = row.try_get("last_seq").map_err(|e| Self::sqlx_to_provider_error("append", e))?;
            return Err(ProviderError::Conflict {
                key: key.clone(),
                expected: expected_last_seq,
                actual: actual as u64,
            });
        }

        let generation: i64 =
            sqlx::query_scalar("SELECT generation FROM executions WHERE task_queue = ? AND execution_id = ?")
                .bind(&key.task_queue)
                .bind(&key.execution_id)
                .fetch_one(&mut **tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error("append", e))?;

        for ev in events {
            let data = serde_json::to_string(ev)?;
            sqlx::query(
                r#"
                INSERT INTO history (task_queue, execution_id, generation, seq, event_type, event_data, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&key.task_queue)
            .bind(&key.execution_id)
            .bind(generation)
            .bind(ev.seq as i64)
            .bind(ev.kind.name())
            .bind(data)
            .bind(now)
            .execute(&mut **tx)
            .await
            .map_err(|e| {
                if Self::is_unique_violation(&e) {
                    ProviderError::Conflict {
                        key: key.clone(),
                        expected: expected_last_seq,
                        actual: ev.seq,
                    }
                } else {
                    Self::sqlx_to_provider_error("append", e)
                }
            })?;
        }
        Ok(new_last)
    }
}

#[async_trait]
impl HistoryStore for SqliteProvider {
    async fn read(&self, key: &ExecutionKey) -> Result<Vec<Event>, ProviderError> {
        let rows: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT h.event_data FROM history h
            JOIN executions e
              ON e.task_queue = h.task_queue AND e.execution_id = h.execution_id AND e.generation = h.generation
            WHERE h.task_queue = ? AND h.execution_id = ?
            ORDER BY h.seq
            "#,
        )
        .bind(&key.task_queue)
        .bind(&key.execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("read", e))?;

        rows.iter()
            .map(|data| serde_json::from_str::<Event>(data).map_err(ProviderError::from))
            .collect()
    }

    async fn read_generation(&self, key: &ExecutionKey, generation: u64) -> Result<Vec<Event>, ProviderError> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT event_data FROM history WHERE task_queue = ? AND execution_id = ? AND generation = ? ORDER BY seq",
        )
        .bind(&key.task_queue)
        .bind(&key.execution_id)
        .bind(generation as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("read_generation", e))?;

        rows.iter()
            .map(|data| serde_json::from_str::<Event>(data).map_err(ProviderError::from))
            .collect()
    }

    async fn describe(&self, key: &ExecutionKey) -> Result<Option<ExecutionInfo>, ProviderError> {
        let row = sqlx::query("SELECT * FROM executions WHERE task_queue = ? AND execution_id = ?")
            .bind(&key.task_queue)
            .bind(&key.execution_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("describe", e))?;
        row.as_ref().map(Self::row_to_info).transpose()
    }

    async fn append(
        &self,
        key: &ExecutionKey,
        expected_last_seq: u64,
        events: Vec<Event>,
    ) -> Result<u64, ProviderError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("append", e))?;
        let last = Self::append_in_tx(&mut tx, key, expected_last_seq, &events, now_ms() as i64).await?;
        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("append", e))?;
        Ok(last)
    }

    async fn list_executions(&self, task_queue: &str) -> Result<Vec<ExecutionInfo>, ProviderError> {
        let rows = sqlx::query("SELECT * FROM executions WHERE task_queue = ? ORDER BY execution_id")
            .bind(task_queue)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("list_executions", e))?;
        rows.iter().map(Self::row_to_info).collect()
    }

    async fn save_snapshot(&self, key: &ExecutionKey, snapshot: Snapshot) -> Result<(), ProviderError> {
        sqlx::query(
            r#"
            INSERT INTO snapshots (task_queue, execution_id, as_of_seq, state) VALUES (?, ?, ?, ?)
            ON CONFLICT(task_queue, execution_id) DO UPDATE SET as_of_seq = excluded.as_of_seq, state = excluded.state
            "#,
        )
        .bind(&key.task_queue)
        .bind(&key.execution_id)
        .bind(snapshot.as_of_seq as i64)
        .bind(&snapshot.state)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("save_snapshot", e))?;
        Ok(())
    }

    async fn load_snapshot(&self, key: &ExecutionKey) -> Result<Option<Snapshot>, ProviderError> {
        let row = sqlx::query("SELECT as_of_seq, state FROM snapshots WHERE task_queue = ? AND execution_id = ?")
            .bind(&key.task_queue)
            .bind(&key.execution_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("load_snapshot", e))?;
        row.map(|r| {
            Ok(Snapshot {
                as_of_seq: r
                    .try_get::<i64, _>("as_of_seq")
                    .map_err(|e| Self::sqlx_to_provider_error("load_snapshot", e))? as u64,
                state: r
                    .try_get("state")
                    .map_err(|e| Self::sqlx_to_provider_error("load_snapshot", e))?,
            })
        })
        .transpose()
    }
}

const FETCH_SIDE_EFFECT_SQL: &str = r#"
    UPDATE tasks
    SET lock_token = ?1, locked_until = ?2, delivery_count = delivery_count + 1
    WHERE id = (
        SELECT id FROM tasks
        WHERE task_queue = ?3 AND kind = ?4 AND visible_at <= ?5
          AND (lock_token IS NULL OR locked_until <= ?5)
        ORDER BY id
        LIMIT 1
    )
    RETURNING id, payload, delivery_count
"#;

// A leased decision task locks its execution. An earlier decision task that
// is ready, or was delivered before and abandoned, keeps its place in line.
const FETCH_DECISION_SQL: &str = r#"
    UPDATE tasks
    SET lock_token = ?1, locked_until = ?2, delivery_count = delivery_count + 1
    WHERE id = (
        SELECT t.id FROM tasks t
        WHERE t.task_queue = ?3 AND t.kind = ?4 AND t.visible_at <= ?5
          AND (t.lock_token IS NULL OR t.locked_until <= ?5)
          AND NOT EXISTS (
            SELECT 1 FROM tasks o
            WHERE o.task_queue = t.task_queue
              AND o.execution_id = t.execution_id
              AND o.kind = t.kind
              AND o.id <> t.id
              AND (
                (o.lock_token IS NOT NULL AND o.locked_until > ?5)
                OR (o.id < t.id AND (o.visible_at <= ?5 OR o.delivery_count > 0))
              )
          )
        ORDER BY t.id
        LIMIT 1
    )
    RETURNING id, payload, delivery_count
"#;

#[async_trait]
impl TaskQueue for SqliteProvider {
    async fn enqueue(&self, task: Task, delay: Option<Duration>) -> Result<u64, ProviderError> {
        let payload = serde_json::to_string(&task)?;
        let result =
            sqlx::query("INSERT INTO tasks (task_queue, execution_id, kind, payload, visible_at) VALUES (?, ?, ?, ?, ?)")
                .bind(&task.key().task_queue)
                .bind(&task.key().execution_id)
                .bind(task.kind().as_str())
                .bind(payload)
                .bind(Self::visible_at(now_ms() as i64, delay))
                .execute(&self.pool)
                .await
                .map_err(|e| Self::sqlx_to_provider_error("enqueue", e))?;
        let id = result.last_insert_rowid() as u64;
        debug!(target: "reprise::providers::sqlite", task_id = id, kind = task.kind().as_str(), ?delay, "enqueue");
        Ok(id)
    }

    async fn fetch(
        &self,
        task_queue: &str,
        kind: TaskKind,
        lease: Duration,
    ) -> Result<Option<LeasedTask>, ProviderError> {
        let now = now_ms() as i64;
        let token = self.generate_lock_token();
        let sql = match kind {
            TaskKind::Decision => FETCH_DECISION_SQL,
            TaskKind::SideEffect => FETCH_SIDE_EFFECT_SQL,
        };
        let row = sqlx::query(sql)
            .bind(&token)
            .bind(Self::visible_at(now, Some(lease)))
            .bind(task_queue)
            .bind(kind.as_str())
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("fetch", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let id: i64 = row.try_get("id").map_err(|e| Self::sqlx_to_provider_error("fetch", e))?;
        let payload: String = row.try_get("payload").map_err(|e| Self::sqlx_to_provider_error("fetch", e))?;
        let delivery_count: i64 = row
            .try_get("delivery_count")
            .map_err(|e| Self::sqlx_to_provider_error("fetch", e))?;
        let task: Task = serde_json::from_str(&payload)?;
        Ok(Some(LeasedTask {
            task_id: id as u64,
            token,
            task,
            delivery_count: delivery_count as u32,
        }))
    }

    async fn ack(&self, token: &str) -> Result<(), ProviderError> {
        sqlx::query("DELETE FROM tasks WHERE lock_token = ?")
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack", e))?;
        Ok(())
    }

    async fn complete(&self, token: &str, follow_up: Vec<OutgoingTask>) -> Result<(), ProviderError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("complete", e))?;
        sqlx::query("DELETE FROM tasks WHERE lock_token = ?")
            .bind(token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("complete", e))?;
        Self::insert_tasks(&mut tx, "complete", follow_up, now_ms() as i64).await?;
        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("complete", e))?;
        Ok(())
    }

    async fn renew(&self, token: &str, lease: Duration) -> Result<(), ProviderError> {
        let now = now_ms() as i64;
        let result = sqlx::query("UPDATE tasks SET locked_until = ?1 WHERE lock_token = ?2 AND locked_until > ?3")
            .bind(Self::visible_at(now, Some(lease)))
            .bind(token)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("renew", e))?;
        if result.rows_affected() == 0 {
            return Err(ProviderError::permanent("renew", "lease expired or not held"));
        }
        Ok(())
    }

    async fn abandon(&self, token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        sqlx::query("UPDATE tasks SET lock_token = NULL, locked_until = NULL, visible_at = ?1 WHERE lock_token = ?2")
            .bind(Self::visible_at(now_ms() as i64, delay))
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("abandon", e))?;
        Ok(())
    }

    async fn queue_depth(&self, task_queue: &str, kind: TaskKind) -> Result<usize, ProviderError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE task_queue = ? AND kind = ?")
            .bind(task_queue)
            .bind(kind.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("queue_depth", e))?;
        Ok(count as usize)
    }
}

#[async_trait]
impl ResultChannel for SqliteProvider {
    async fn publish_query_result(&self, answer: QueryAnswered) -> Result<(), ProviderError> {
        let payload = serde_json::to_string(&answer)?;
        sqlx::query("INSERT OR REPLACE INTO query_results (query_id, payload, created_at) VALUES (?, ?, ?)")
            .bind(answer.query_id as i64)
            .bind(payload)
            .bind(now_ms() as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("publish_query_result", e))?;
        Ok(())
    }

    async fn take_query_result(&self, query_id: u64) -> Result<Option<QueryAnswered>, ProviderError> {
        let payload: Option<String> = sqlx::query_scalar("DELETE FROM query_results WHERE query_id = ? RETURNING payload")
            .bind(query_id as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("take_query_result", e))?;
        payload
            .map(|p| serde_json::from_str(&p).map_err(ProviderError::from))
            .transpose()
    }
}

#[async_trait]
impl Provider for SqliteProvider {
    async fn start_execution(
        &self,
        key: &ExecutionKey,
        orchestration: &str,
        input: &str,
        execution_timeout: Option<Duration>,
    ) -> Result<ExecutionInfo, ProviderError> {
        let now = now_ms() as i64;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("start_execution", e))?;

        let reused = sqlx::query(
            r#"
            UPDATE executions
            SET generation = generation + 1, status = 'Running', outcome = NULL, last_seq = 0,
                orchestration = ?1, input = ?2, created_at = ?3, updated_at = ?3
            WHERE task_queue = ?4 AND execution_id = ?5 AND status != 'Running'
            "#,
        )
        .bind(orchestration)
        .bind(input)
        .bind(now)
        .bind(&key.task_queue)
        .bind(&key.execution_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("start_execution", e))?;

        if reused.rows_affected() == 0 {
            sqlx::query(
                r#"
                INSERT INTO executions
                    (task_queue, execution_id, orchestration, input, generation, status, last_seq, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, 1, 'Running', 0, ?5, ?5)
                "#,
            )
            .bind(&key.task_queue)
            .bind(&key.execution_id)
            .bind(orchestration)
            .bind(input)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if Self::is_unique_violation(&e) {
                    ProviderError::AlreadyExists(key.clone())
                } else {
                    Self::sqlx_to_provider_error("start_execution", e)
                }
            })?;
        } else {
            sqlx::query("DELETE FROM snapshots WHERE task_queue = ? AND execution_id = ?")
                .bind(&key.task_queue)
                .bind(&key.execution_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error("start_execution", e))?;
        }

        let row = sqlx::query("SELECT * FROM executions WHERE task_queue = ? AND execution_id = ?")
            .bind(&key.task_queue)
            .bind(&key.execution_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("start_execution", e))?;
        let info = Self::row_to_info(&row)?;

        let tasks = start_tasks(key, info.generation, orchestration, input, execution_timeout);
        Self::insert_tasks(&mut tx, "start_execution", tasks, now).await?;
        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("start_execution", e))?;
        debug!(target: "reprise::providers::sqlite", execution = %key, generation = info.generation, "started");
        Ok(info)
    }

    async fn commit_decision(
        &self,
        token: &str,
        key: &ExecutionKey,
        expected_last_seq: u64,
        events: Vec<Event>,
        follow_up: Vec<OutgoingTask>,
    ) -> Result<u64, ProviderError> {
        let now = now_ms() as i64;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("commit_decision", e))?;
        let last = Self::append_in_tx(&mut tx, key, expected_last_seq, &events, now).await?;
        Self::insert_tasks(&mut tx, "commit_decision", follow_up, now).await?;
        sqlx::query("DELETE FROM tasks WHERE lock_token = ?")
            .bind(token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("commit_decision", e))?;
        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("commit_decision", e))?;
        Ok(last)
    }
}
