use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    now_ms, start_tasks, terminal_transition, validate_continuation, ExecutionInfo, HistoryStore, LeasedTask,
    OutgoingTask, Provider, ProviderError, QueryAnswered, ResultChannel, Snapshot, Task, TaskKind, TaskQueue,
};
use crate::{Event, ExecutionKey, ExecutionStatus};

struct ExecutionRecord {
    info: ExecutionInfo,
    history: Vec<Event>,
    /// Histories of finished generations, oldest first.
    earlier: Vec<Vec<Event>>,
}

struct QueuedTask {
    task: Task,
    visible_at_ms: u64,
    lease: Option<(String, u64)>,
    delivery_count: u32,
}

#[derive(Default)]
struct State {
    executions: HashMap<ExecutionKey, ExecutionRecord>,
    tasks: BTreeMap<u64, QueuedTask>,
    leases: HashMap<String, u64>,
    next_task_id: u64,
    query_results: HashMap<u64, QueryAnswered>,
    snapshots: HashMap<ExecutionKey, Snapshot>,
}

impl State {
    fn push_task(&mut self, task: Task, delay: Option<Duration>, now: u64) -> u64 {
        self.next_task_id += 1;
        let id = self.next_task_id;
        let visible_at_ms = now.saturating_add(delay.map_or(0, crate::millis));
        self.tasks.insert(
            id,
            QueuedTask {
                task,
                visible_at_ms,
                lease: None,
                delivery_count: 0,
            },
        );
        id
    }

    /// Oldest ready decision task of an execution with no decision in
    /// flight. A task delivered before keeps its place while abandoned.
    fn next_decision(&self, task_queue: &str, now: u64) -> Option<u64> {
        let mut blocked: HashSet<&ExecutionKey> = HashSet::new();
        for (id, t) in &self.tasks {
            let key = t.task.key();
            if t.task.kind() != TaskKind::Decision || key.task_queue != task_queue || blocked.contains(key) {
                continue;
            }
            if t.lease.as_ref().is_some_and(|(_, until)| *until > now) {
                blocked.insert(key);
            } else if t.visible_at_ms <= now {
                return Some(*id);
            } else if t.delivery_count > 0 {
                blocked.insert(key);
            }
        }
        None
    }

    fn release(&mut self, token: &str) -> Option<u64> {
        let id = self.leases.remove(token)?;
        if let Some(t) = self.tasks.get_mut(&id) {
            t.lease = None;
        }
        Some(id)
    }

    fn append(
        &mut self,
        key: &ExecutionKey,
        expected_last_seq: u64,
        events: Vec<Event>,
        now: u64,
    ) -> Result<u64, ProviderError> {
        let rec = self
            .executions
            .get_mut(key)
            .ok_or_else(|| ProviderError::NotFound(key.clone()))?;
        if rec.info.status.is_terminal() {
            return Err(ProviderError::ExecutionClosed(key.clone()));
        }
        if rec.info.last_seq != expected_last_seq {
            return Err(ProviderError::Conflict {
                key: key.clone(),
                expected: expected_last_seq,
                actual: rec.info.last_seq,
            });
        }
        validate_continuation(expected_last_seq, &events)?;
        if let Some(outcome) = terminal_transition(&events) {
            rec.info.status = outcome.status();
            rec.info.outcome = Some(outcome);
        }
        if let Some(last) = events.last() {
            rec.info.last_seq = last.seq;
        }
        rec.info.updated_at_ms = now;
        rec.history.extend(events);
        Ok(rec.info.last_seq)
    }
}

/// Provider that keeps everything in process memory. All operations take a
/// single lock, so every multi-step operation is atomic.
#[derive(Default)]
pub struct InMemoryProvider {
    state: Mutex<State>,
    token_counter: AtomicU64,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_token(&self, task_id: u64) -> String {
        let n = self.token_counter.fetch_add(1, Ordering::Relaxed);
        format!("mem-{task_id}-{n}")
    }
}

#[async_trait]
impl HistoryStore for InMemoryProvider {
    async fn read(&self, key: &ExecutionKey) -> Result<Vec<Event>, ProviderError> {
        let g = self.state.lock().await;
        Ok(g.executions.get(key).map(|r| r.history.clone()).unwrap_or_default())
    }

    async fn read_generation(&self, key: &ExecutionKey, generation: u64) -> Result<Vec<Event>, ProviderError> {
        let g = self.state.lock().await;
        let Some(rec) = g.executions.get(key) else {
            return Ok(Vec::new());
        };
        if generation == rec.info.generation {
            return Ok(rec.history.clone());
        }
        let idx = generation.checked_sub(1).and_then(|i| usize::try_from(i).ok());
        Ok(idx.and_then(|i| rec.earlier.get(i)).cloned().unwrap_or_default())
    }

    async fn describe(&self, key: &ExecutionKey) -> Result<Option<ExecutionInfo>, ProviderError> {
        let g = self.state.lock().await;
        Ok(g.executions.get(key).map(|r| r.info.clone()))
    }

    async fn append(
        &self,
        key: &ExecutionKey,
        expected_last_seq: u64,
        events: Vec<Event>,
    ) -> Result<u64, ProviderError> {
        let mut g = self.state.lock().await;
        g.append(key, expected_last_seq, events, now_ms())
    }

    async fn list_executions(&self, task_queue: &str) -> Result<Vec<ExecutionInfo>, ProviderError> {
        let g = self.state.lock().await;
        let mut out: Vec<ExecutionInfo> = g
            .executions
            .values()
            .filter(|r| r.info.key.task_queue == task_queue)
            .map(|r| r.info.clone())
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    async fn save_snapshot(&self, key: &ExecutionKey, snapshot: Snapshot) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        if !g.executions.contains_key(key) {
            return Err(ProviderError::NotFound(key.clone()));
        }
        g.snapshots.insert(key.clone(), snapshot);
        Ok(())
    }

    async fn load_snapshot(&self, key: &ExecutionKey) -> Result<Option<Snapshot>, ProviderError> {
        Ok(self.state.lock().await.snapshots.get(key).cloned())
    }
}

#[async_trait]
impl TaskQueue for InMemoryProvider {
    async fn enqueue(&self, task: Task, delay: Option<Duration>) -> Result<u64, ProviderError> {
        let mut g = self.state.lock().await;
        Ok(g.push_task(task, delay, now_ms()))
    }

    async fn fetch(
        &self,
        task_queue: &str,
        kind: TaskKind,
        lease: Duration,
    ) -> Result<Option<LeasedTask>, ProviderError> {
        let now = now_ms();
        let mut g = self.state.lock().await;
        let candidate = match kind {
            TaskKind::Decision => g.next_decision(task_queue, now),
            TaskKind::SideEffect => g.tasks.iter().find_map(|(id, t)| {
                let free = t.lease.as_ref().map_or(true, |(_, until)| *until <= now);
                (free && t.visible_at_ms <= now && t.task.kind() == kind && t.task.key().task_queue == task_queue)
                    .then_some(*id)
            }),
        };
        let Some(id) = candidate else {
            return Ok(None);
        };

        let token = self.next_token(id);
        let expired = g.tasks.get(&id).and_then(|t| t.lease.as_ref().map(|(tok, _)| tok.clone()));
        if let Some(old) = expired {
            tracing::debug!(target: "reprise::providers::in_memory", task_id = id, "lease expired; redelivering");
            g.leases.remove(&old);
        }
        g.leases.insert(token.clone(), id);
        let Some(t) = g.tasks.get_mut(&id) else {
            return Ok(None);
        };
        t.lease = Some((token.clone(), now.saturating_add(crate::millis(lease))));
        t.delivery_count += 1;
        Ok(Some(LeasedTask {
            task_id: id,
            token,
            task: t.task.clone(),
            delivery_count: t.delivery_count,
        }))
    }

    async fn ack(&self, token: &str) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        if let Some(id) = g.leases.remove(token) {
            g.tasks.remove(&id);
        }
        Ok(())
    }

    async fn complete(&self, token: &str, follow_up: Vec<OutgoingTask>) -> Result<(), ProviderError> {
        let now = now_ms();
        let mut g = self.state.lock().await;
        if let Some(id) = g.leases.remove(token) {
            g.tasks.remove(&id);
        }
        for t in follow_up {
            g.push_task(t.task, t.delay, now);
        }
        Ok(())
    }

    async fn renew(&self, token: &str, lease: Duration) -> Result<(), ProviderError> {
        let now = now_ms();
        let mut g = self.state.lock().await;
        let id = g
            .leases
            .get(token)
            .copied()
            .ok_or_else(|| ProviderError::permanent("renew", "lease not held"))?;
        let t = g
            .tasks
            .get_mut(&id)
            .ok_or_else(|| ProviderError::permanent("renew", "task no longer queued"))?;
        match &mut t.lease {
            Some((tok, until)) if tok == token && *until > now => {
                *until = now.saturating_add(crate::millis(lease));
                Ok(())
            }
            _ => Err(ProviderError::permanent("renew", "lease expired")),
        }
    }

    async fn abandon(&self, token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        let now = now_ms();
        let mut g = self.state.lock().await;
        if let Some(id) = g.release(token) {
            if let Some(t) = g.tasks.get_mut(&id) {
                t.visible_at_ms = now.saturating_add(delay.map_or(0, crate::millis));
            }
        }
        Ok(())
    }

    async fn queue_depth(&self, task_queue: &str, kind: TaskKind) -> Result<usize, ProviderError> {
        let g = self.state.lock().await;
        Ok(g.tasks
            .values()
            .filter(|t| t.task.kind() == kind && t.task.key().task_queue == task_queue)
            .count())
    }
}

#[async_trait]
impl ResultChannel for InMemoryProvider {
    async fn publish_query_result(&self, answer: QueryAnswered) -> Result<(), ProviderError> {
        self.state.lock().await.query_results.insert(answer.query_id, answer);
        Ok(())
    }

    async fn take_query_result(&self, query_id: u64) -> Result<Option<QueryAnswered>, ProviderError> {
        Ok(self.state.lock().await.query_results.remove(&query_id))
    }
}

#[async_trait]
impl Provider for InMemoryProvider {
    async fn start_execution(
        &self,
        key: &ExecutionKey,
        orchestration: &str,
        input: &str,
        execution_timeout: Option<Duration>,
    ) -> Result<ExecutionInfo, ProviderError> {
        let now = now_ms();
        let mut g = self.state.lock().await;
        let (generation, earlier) = match g.executions.remove(key) {
            Some(rec) if !rec.info.status.is_terminal() => {
                g.executions.insert(key.clone(), rec);
                return Err(ProviderError::AlreadyExists(key.clone()));
            }
            Some(mut rec) => {
                rec.earlier.push(rec.history);
                (rec.info.generation + 1, rec.earlier)
            }
            None => (1, Vec::new()),
        };
        let info = ExecutionInfo {
            key: key.clone(),
            orchestration: orchestration.to_string(),
            input: input.to_string(),
            generation,
            status: ExecutionStatus::Running,
            outcome: None,
            last_seq: 0,
            created_at_ms: now,
            updated_at_ms: now,
        };
        g.executions.insert(
            key.clone(),
            ExecutionRecord {
                info: info.clone(),
                history: Vec::new(),
                earlier,
            },
        );
        g.snapshots.remove(key);
        for t in start_tasks(key, generation, orchestration, input, execution_timeout) {
            g.push_task(t.task, t.delay, now);
        }
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
        let now = now_ms();
        let mut g = self.state.lock().await;
        let last_seq = g.append(key, expected_last_seq, events, now)?;
        for t in follow_up {
            g.push_task(t.task, t.delay, now);
        }
        if let Some(id) = g.leases.remove(token) {
            g.tasks.remove(&id);
        }
        Ok(last_seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{DecisionMessage, DecisionTask};
    use crate::EventKind;

    fn key() -> ExecutionKey {
        ExecutionKey::new("q", "e1")
    }

    fn started() -> Event {
        Event::new(
            1,
            0,
            EventKind::ExecutionStarted {
                orchestration: "o".into(),
                input: String::new(),
            },
        )
    }

    fn signal_task(name: &str) -> Task {
        Task::Decision(DecisionTask {
            key: key(),
            generation: 1,
            message: DecisionMessage::Signal {
                name: name.into(),
                payload: String::new(),
            },
        })
    }

    #[tokio::test]
    async fn leased_task_is_invisible_until_expiry() {
        let p = InMemoryProvider::new();
        p.enqueue(signal_task("a"), None).await.unwrap();
        let first = p
            .fetch("q", TaskKind::Decision, Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.delivery_count, 1);
        assert!(p
            .fetch("q", TaskKind::Decision, Duration::from_millis(50))
            .await
            .unwrap()
            .is_none());

        tokio::time::sleep(Duration::from_millis(80)).await;
        let again = p
            .fetch("q", TaskKind::Decision, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.task_id, first.task_id);
        assert_eq!(again.delivery_count, 2);
        // The stale token no longer acks anything.
        p.ack(&first.token).await.unwrap();
        assert_eq!(p.queue_depth("q", TaskKind::Decision).await.unwrap(), 1);
        p.ack(&again.token).await.unwrap();
        assert_eq!(p.queue_depth("q", TaskKind::Decision).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fetch_filters_by_queue_and_kind() {
        let p = InMemoryProvider::new();
        p.enqueue(signal_task("a"), None).await.unwrap();
        assert!(p
            .fetch("other", TaskKind::Decision, Duration::from_secs(1))
            .await
            .unwrap()
            .is_none());
        assert!(p
            .fetch("q", TaskKind::SideEffect, Duration::from_secs(1))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn delayed_and_abandoned_tasks_wait() {
        let p = InMemoryProvider::new();
        p.enqueue(signal_task("a"), Some(Duration::from_secs(60))).await.unwrap();
        assert!(p
            .fetch("q", TaskKind::Decision, Duration::from_secs(1))
            .await
            .unwrap()
            .is_none());

        p.enqueue(signal_task("b"), None).await.unwrap();
        let leased = p
            .fetch("q", TaskKind::Decision, Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        p.abandon(&leased.token, Some(Duration::from_secs(60))).await.unwrap();
        assert!(p
            .fetch("q", TaskKind::Decision, Duration::from_secs(1))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn start_rejects_running_and_bumps_generation_after_terminal() {
        let p = InMemoryProvider::new();
        let info = p.start_execution(&key(), "o", "", None).await.unwrap();
        assert_eq!(info.generation, 1);
        assert!(matches!(
            p.start_execution(&key(), "o", "", None).await,
            Err(ProviderError::AlreadyExists(_))
        ));

        p.append(&key(), 0, vec![started()]).await.unwrap();
        p.append(
            &key(),
            1,
            vec![Event::new(2, 0, EventKind::ExecutionCompleted { output: "ok".into() })],
        )
        .await
        .unwrap();
        let info = p.describe(&key()).await.unwrap().unwrap();
        assert_eq!(info.status, ExecutionStatus::Completed);

        let again = p.start_execution(&key(), "o", "", None).await.unwrap();
        assert_eq!(again.generation, 2);
        assert!(p.read(&key()).await.unwrap().is_empty());

        let first = p.read_generation(&key(), 1).await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(matches!(first[1].kind, EventKind::ExecutionCompleted { .. }));
        assert!(p.read_generation(&key(), 2).await.unwrap().is_empty());
        assert!(p.read_generation(&key(), 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn decisions_of_one_execution_are_leased_one_at_a_time() {
        let p = InMemoryProvider::new();
        let other = Task::Decision(DecisionTask {
            key: ExecutionKey::new("q", "e2"),
            generation: 1,
            message: DecisionMessage::Signal {
                name: "other".into(),
                payload: String::new(),
            },
        });
        let a = p.enqueue(signal_task("a"), None).await.unwrap();
        let b = p.enqueue(signal_task("b"), None).await.unwrap();
        let c = p.enqueue(other, None).await.unwrap();

        let lease = Duration::from_secs(5);
        let first = p.fetch("q", TaskKind::Decision, lease).await.unwrap().unwrap();
        assert_eq!(first.task_id, a);
        let next = p.fetch("q", TaskKind::Decision, lease).await.unwrap().unwrap();
        assert_eq!(next.task_id, c);
        assert!(p.fetch("q", TaskKind::Decision, lease).await.unwrap().is_none());

        // Abandoned with a delay, "a" still goes before "b".
        p.abandon(&first.token, Some(Duration::from_millis(60))).await.unwrap();
        assert!(p.fetch("q", TaskKind::Decision, lease).await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(90)).await;
        let again = p.fetch("q", TaskKind::Decision, lease).await.unwrap().unwrap();
        assert_eq!(again.task_id, a);
        p.ack(&again.token).await.unwrap();
        let last = p.fetch("q", TaskKind::Decision, lease).await.unwrap().unwrap();
        assert_eq!(last.task_id, b);
    }

    #[tokio::test]
    async fn delayed_decision_does_not_hold_back_later_ones() {
        let p = InMemoryProvider::new();
        p.enqueue(signal_task("timer"), Some(Duration::from_secs(60))).await.unwrap();
        let now = p.enqueue(signal_task("now"), None).await.unwrap();
        let leased = p
            .fetch("q", TaskKind::Decision, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased.task_id, now);
    }

    #[tokio::test]
    async fn snapshots_round_trip_and_reset_with_a_new_generation() {
        let p = InMemoryProvider::new();
        let snap = |seq: u64| Snapshot {
            as_of_seq: seq,
            state: format!("state@{seq}"),
        };
        assert!(matches!(
            p.save_snapshot(&key(), snap(1)).await,
            Err(ProviderError::NotFound(_))
        ));

        p.start_execution(&key(), "o", "", None).await.unwrap();
        assert_eq!(p.load_snapshot(&key()).await.unwrap(), None);
        p.save_snapshot(&key(), snap(1)).await.unwrap();
        assert_eq!(p.load_snapshot(&key()).await.unwrap(), Some(snap(1)));
        p.save_snapshot(&key(), snap(3)).await.unwrap();
        assert_eq!(p.load_snapshot(&key()).await.unwrap(), Some(snap(3)));

        p.append(
            &key(),
            0,
            vec![
                started(),
                Event::new(2, 0, EventKind::ExecutionCompleted { output: "ok".into() }),
            ],
        )
        .await
        .unwrap();
        p.start_execution(&key(), "o", "", None).await.unwrap();
        assert_eq!(p.load_snapshot(&key()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn conditional_append_detects_conflict() {
        let p = InMemoryProvider::new();
        p.start_execution(&key(), "o", "", None).await.unwrap();
        assert_eq!(p.append(&key(), 0, vec![started()]).await.unwrap(), 1);
        let err = p.append(&key(), 0, vec![started()]).await.unwrap_err();
        assert_eq!(
            err,
            ProviderError::Conflict {
                key: key(),
                expected: 0,
                actual: 1
            }
        );
    }

    #[tokio::test]
    async fn append_to_terminal_execution_is_rejected() {
        let p = InMemoryProvider::new();
        p.start_execution(&key(), "o", "", None).await.unwrap();
        p.append(
            &key(),
            0,
            vec![
                started(),
                Event::new(2, 0, EventKind::ExecutionTerminated { reason: "stop".into() }),
            ],
        )
        .await
        .unwrap();
        let err = p
            .append(
                &key(),
                2,
                vec![Event::new(3, 0, EventKind::ExecutionCompleted { output: String::new() })],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::ExecutionClosed(_)));
    }

    #[tokio::test]
    async fn failed_commit_leaves_queue_untouched() {
        let p = InMemoryProvider::new();
        p.start_execution(&key(), "o", "", None).await.unwrap();
        let leased = p
            .fetch("q", TaskKind::Decision, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        p.append(&key(), 0, vec![started()]).await.unwrap();

        let err = p
            .commit_decision(
                &leased.token,
                &key(),
                0,
                vec![started()],
                vec![OutgoingTask::now(signal_task("x"))],
            )
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        // Only the still-leased start task remains; nothing was enqueued.
        assert_eq!(p.queue_depth("q", TaskKind::Decision).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn query_results_are_taken_once() {
        let p = InMemoryProvider::new();
        p.publish_query_result(QueryAnswered {
            query_id: 9,
            as_of_seq: 4,
            result: Err("nope".into()),
        })
        .await
        .unwrap();
        assert!(p.take_query_result(9).await.unwrap().is_some());
        assert!(p.take_query_result(9).await.unwrap().is_none());
    }
}
