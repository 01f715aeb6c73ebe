//! Task queue
//!
//! Durable queue of executable tasks with generation-fenced lifecycle
//! updates. Every (re)assignment increments the task's generation, and a
//! completion/failure/acceptance frame is only honored when it carries the
//! current generation. The fence, not message ordering, is the defence
//! against a stuck old worker racing a reassigned new one: the reclamation
//! sweep bumps the generation, after which the old worker's frames are
//! rejected without touching state.

use crate::bus::{HubEvent, TaskEventKind, TopicBus, topic};
use crate::classify::{self, ClassifyParams, Complexity};
use crate::domain_types::{AgentId, GoalId, TaskId, Tier, clamp_priority, now_ms};
use crate::storage::{KvTable, StoreError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Default retry budget for new tasks.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Assigned,
    Working,
    Complete,
    Failed,
    DeadLetter,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Assigned => "assigned",
            Self::Working => "working",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::DeadLetter => "dead_letter",
        };
        f.write_str(s)
    }
}

/// An executable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub priority: u8,
    pub status: TaskStatus,
    /// Monotonic per task; incremented on every (re)assignment.
    pub generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_progress_at: Option<u64>,
    pub retries: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    pub complexity: Complexity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_id: Option<GoalId>,
    pub enqueued_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Parameters accepted at submission.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitTask {
    pub description: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    /// Explicit tier override; inference still runs for comparison.
    #[serde(default)]
    pub tier: Option<Tier>,
    #[serde(default)]
    pub file_hints: Vec<String>,
    #[serde(default)]
    pub verification_steps: Vec<String>,
    #[serde(default)]
    pub goal_id: Option<GoalId>,
}

/// Outcome of a fenced failure report.
#[derive(Debug, Clone)]
pub enum FailOutcome {
    /// Retry budget left; the task went back to the queue.
    Retried(Task),
    /// Budget exhausted; the task is dead-lettered.
    DeadLetter(Task),
}

/// Outcome of a worker-reconnect recovery probe.
#[derive(Debug, Clone)]
pub enum Recovery {
    /// The worker still owns the task; resume under the given state.
    Continue(Task),
    /// Drop local state and ask for new work.
    Reassign,
}

/// Task queue errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("generation mismatch on {task_id}: frame has {got}, task is at {expected}")]
    GenerationMismatch {
        task_id: TaskId,
        expected: u64,
        got: u64,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Durable, generation-fenced task queue.
pub struct TaskQueue {
    table: Arc<KvTable>,
    bus: Arc<TopicBus>,
    // Serializes read-modify-write cycles on task records.
    write: Mutex<()>,
}

impl TaskQueue {
    #[must_use]
    pub fn new(table: Arc<KvTable>, bus: Arc<TopicBus>) -> Self {
        Self {
            table,
            bus,
            write: Mutex::new(()),
        }
    }

    fn publish(&self, task_id: TaskId, kind: TaskEventKind) {
        self.bus.publish(topic::TASKS, HubEvent::Task { task_id, kind });
    }

    async fn load(&self, id: &TaskId) -> Result<Task, TaskError> {
        self.table
            .get(id.as_str())
            .await?
            .ok_or_else(|| TaskError::NotFound(id.clone()))
    }

    fn fence(task: &Task, got: u64) -> Result<(), TaskError> {
        if task.generation == got {
            return Ok(());
        }
        warn!(
            target: "telemetry",
            task_id = %task.id,
            expected = task.generation,
            got,
            "stale task frame discarded by generation fence"
        );
        Err(TaskError::GenerationMismatch {
            task_id: task.id.clone(),
            expected: task.generation,
            got,
        })
    }

    /// Submits a task, classifying its complexity on the way in.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn enqueue(&self, params: SubmitTask) -> Result<Task, TaskError> {
        let complexity = classify::build(&ClassifyParams {
            description: &params.description,
            file_hints: &params.file_hints,
            verification_steps: &params.verification_steps,
            explicit_tier: params.tier,
        });
        let task = Task {
            id: TaskId::generate(),
            description: params.description,
            metadata: params.metadata.unwrap_or(serde_json::Value::Null),
            priority: clamp_priority(params.priority),
            status: TaskStatus::Queued,
            generation: 0,
            assigned_to: None,
            assigned_at: None,
            last_progress_at: None,
            retries: 0,
            max_retries: params.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            required_capabilities: params.required_capabilities,
            complexity,
            goal_id: params.goal_id,
            enqueued_at: now_ms(),
            result: None,
            error: None,
        };
        {
            let _guard = self.write.lock().await;
            self.table.put(task.id.as_str(), &task).await?;
        }
        info!(task_id = %task.id, tier = %task.complexity.effective_tier, "task enqueued");
        self.publish(task.id.clone(), TaskEventKind::Queued);
        Ok(task)
    }

    /// Assigns the best queued task the agent is capable of to that agent.
    /// Bumps the generation; the push to the worker must carry it.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn assign_next(
        &self,
        agent: &AgentId,
        capabilities: &[String],
    ) -> Result<Option<Task>, TaskError> {
        let _guard = self.write.lock().await;
        let candidate = self
            .table
            .fold::<Task, Option<Task>, _>(None, |best, _k, task| {
                if task.status != TaskStatus::Queued {
                    return best;
                }
                if !task
                    .required_capabilities
                    .iter()
                    .all(|cap| capabilities.contains(cap))
                {
                    return best;
                }
                let replace = match &best {
                    Some(current) => {
                        (task.priority, task.enqueued_at, &task.id)
                            < (current.priority, current.enqueued_at, &current.id)
                    }
                    None => true,
                };
                if replace { Some(task) } else { best }
            })
            .await?;
        let Some(mut task) = candidate else {
            return Ok(None);
        };
        let now = now_ms();
        task.generation += 1;
        task.status = TaskStatus::Assigned;
        task.assigned_to = Some(agent.clone());
        task.assigned_at = Some(now);
        task.last_progress_at = Some(now);
        self.table.put(task.id.as_str(), &task).await?;
        info!(task_id = %task.id, agent_id = %agent, generation = task.generation, "task assigned");
        self.publish(
            task.id.clone(),
            TaskEventKind::Assigned {
                agent_id: agent.clone(),
            },
        );
        Ok(Some(task))
    }

    /// Marks an assigned task as actively worked, under the fence.
    ///
    /// # Errors
    ///
    /// Generation mismatches and unknown ids.
    pub async fn accept_task(&self, id: &TaskId, generation: u64) -> Result<Task, TaskError> {
        let _guard = self.write.lock().await;
        let mut task = self.load(id).await?;
        Self::fence(&task, generation)?;
        task.status = TaskStatus::Working;
        task.last_progress_at = Some(now_ms());
        self.table.put(task.id.as_str(), &task).await?;
        Ok(task)
    }

    /// Refreshes the progress heartbeat. No other effect.
    ///
    /// # Errors
    ///
    /// Unknown ids and storage errors.
    pub async fn update_progress(&self, id: &TaskId) -> Result<(), TaskError> {
        let _guard = self.write.lock().await;
        let mut task = self.load(id).await?;
        task.last_progress_at = Some(now_ms());
        self.table.put(task.id.as_str(), &task).await?;
        self.publish(task.id, TaskEventKind::Progress);
        Ok(())
    }

    /// Completes a task, fenced on generation.
    ///
    /// # Errors
    ///
    /// Generation mismatches leave the task untouched; unknown ids error.
    pub async fn complete_task(
        &self,
        id: &TaskId,
        generation: u64,
        result: serde_json::Value,
    ) -> Result<Task, TaskError> {
        let _guard = self.write.lock().await;
        let mut task = self.load(id).await?;
        Self::fence(&task, generation)?;
        task.status = TaskStatus::Complete;
        task.result = Some(result);
        task.last_progress_at = Some(now_ms());
        self.table.put(task.id.as_str(), &task).await?;
        info!(task_id = %task.id, "task complete");
        self.publish(task.id.clone(), TaskEventKind::Completed);
        Ok(task)
    }

    /// Records a failure, fenced on generation. Retries until the budget is
    /// spent, then dead-letters.
    ///
    /// # Errors
    ///
    /// Generation mismatches leave the task untouched; unknown ids error.
    pub async fn fail_task(
        &self,
        id: &TaskId,
        generation: u64,
        error: String,
    ) -> Result<FailOutcome, TaskError> {
        let _guard = self.write.lock().await;
        let mut task = self.load(id).await?;
        Self::fence(&task, generation)?;
        task.error = Some(error);
        if task.retries < task.max_retries {
            task.retries += 1;
            task.status = TaskStatus::Queued;
            task.assigned_to = None;
            task.assigned_at = None;
            self.table.put(task.id.as_str(), &task).await?;
            info!(task_id = %task.id, retries = task.retries, "task requeued for retry");
            self.publish(task.id.clone(), TaskEventKind::Retry);
            Ok(FailOutcome::Retried(task))
        } else {
            task.status = TaskStatus::DeadLetter;
            self.table.put(task.id.as_str(), &task).await?;
            warn!(task_id = %task.id, "task dead-lettered");
            self.publish(task.id.clone(), TaskEventKind::DeadLetter);
            Ok(FailOutcome::DeadLetter(task))
        }
    }

    /// Recovery probe from a reconnecting worker. The worker resumes only
    /// when it still owns the task; otherwise it should drop local state and
    /// ask for new work.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn recover_task(&self, id: &TaskId, agent: &AgentId) -> Result<Recovery, TaskError> {
        let _guard = self.write.lock().await;
        let Some(mut task) = self.table.get::<Task>(id.as_str()).await? else {
            return Ok(Recovery::Reassign);
        };
        if task.assigned_to.as_ref() == Some(agent) {
            task.last_progress_at = Some(now_ms());
            self.table.put(task.id.as_str(), &task).await?;
            debug!(task_id = %task.id, agent_id = %agent, "worker resumed task");
            Ok(Recovery::Continue(task))
        } else {
            Ok(Recovery::Reassign)
        }
    }

    /// Reclaims orphaned assignments: tasks whose worker is gone from the
    /// registry or silent past `orphan_ms`. Bumping the generation
    /// invalidates any late frames from the previous worker.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn reclaim_stale<F>(
        &self,
        present: F,
        now: u64,
        orphan_ms: u64,
    ) -> Result<Vec<TaskId>, TaskError>
    where
        F: Fn(&AgentId) -> bool,
    {
        let _guard = self.write.lock().await;
        let candidates = self
            .table
            .fold::<Task, Vec<Task>, _>(Vec::new(), |mut acc, _k, task| {
                if matches!(task.status, TaskStatus::Assigned | TaskStatus::Working) {
                    acc.push(task);
                }
                acc
            })
            .await?;
        let mut reclaimed = Vec::new();
        for mut task in candidates {
            let worker_gone = task.assigned_to.as_ref().is_none_or(|a| !present(a));
            let silent = task
                .last_progress_at
                .is_none_or(|t| now.saturating_sub(t) > orphan_ms);
            if !(worker_gone || silent) {
                continue;
            }
            task.generation += 1;
            task.status = TaskStatus::Queued;
            task.assigned_to = None;
            task.assigned_at = None;
            self.table.put(task.id.as_str(), &task).await?;
            info!(task_id = %task.id, generation = task.generation, "orphaned task reclaimed");
            self.publish(task.id.clone(), TaskEventKind::Reclaimed);
            reclaimed.push(task.id);
        }
        Ok(reclaimed)
    }

    /// Fetches a task.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn get(&self, id: &TaskId) -> Result<Option<Task>, TaskError> {
        Ok(self.table.get(id.as_str()).await?)
    }

    /// All tasks, optionally filtered by status, sorted by
    /// (priority, enqueued_at).
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn list(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, TaskError> {
        let mut tasks = self
            .table
            .fold::<Task, Vec<Task>, _>(Vec::new(), |mut acc, _k, task| {
                if status.is_none_or(|s| task.status == s) {
                    acc.push(task);
                }
                acc
            })
            .await?;
        tasks.sort_by(|a, b| {
            (a.priority, a.enqueued_at, &a.id).cmp(&(b.priority, b.enqueued_at, &b.id))
        });
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: &str) -> AgentId {
        AgentId::try_new(id).unwrap()
    }

    async fn queue(dir: &std::path::Path) -> TaskQueue {
        let bus = Arc::new(TopicBus::new());
        let table = Arc::new(KvTable::open(dir, "task_queue", None).await.unwrap());
        TaskQueue::new(table, bus)
    }

    fn submit(description: &str) -> SubmitTask {
        SubmitTask {
            description: description.to_string(),
            ..SubmitTask::default()
        }
    }

    #[tokio::test]
    async fn happy_path_assign_accept_complete() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path()).await;
        let w = agent("w1");
        q.enqueue(submit("do the thing")).await.unwrap();

        let task = q.assign_next(&w, &[]).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
        assert_eq!(task.generation, 1);
        assert_eq!(task.assigned_to, Some(w.clone()));

        let task = q.accept_task(&task.id, 1).await.unwrap();
        assert_eq!(task.status, TaskStatus::Working);

        let done = q
            .complete_task(&task.id, 1, serde_json::json!({ "ok": true }))
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Complete);
        assert!(done.result.is_some());
    }

    #[tokio::test]
    async fn generation_fence_rejects_stale_worker() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path()).await;
        let (w1, w2) = (agent("w1"), agent("w2"));
        q.enqueue(submit("contested")).await.unwrap();

        let task = q.assign_next(&w1, &[]).await.unwrap().unwrap();
        assert_eq!(task.generation, 1);

        // Reclaim invalidates w1, generation moves to 2.
        let reclaimed = q.reclaim_stale(|_| false, now_ms(), 0).await.unwrap();
        assert_eq!(reclaimed.len(), 1);

        let task = q.assign_next(&w2, &[]).await.unwrap().unwrap();
        assert_eq!(task.generation, 3, "reassignment bumps past the reclaim");

        // w1's late completion is fenced out without touching state.
        let err = q
            .complete_task(&task.id, 1, serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::GenerationMismatch { .. }));
        let current = q.get(&task.id).await.unwrap().unwrap();
        assert_eq!(current.status, TaskStatus::Assigned);
        assert_eq!(current.assigned_to, Some(w2.clone()));

        // w2's completion at the current generation lands.
        q.complete_task(&task.id, 3, serde_json::json!({}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn retries_then_dead_letter() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path()).await;
        let w = agent("w1");
        q.enqueue(SubmitTask {
            description: "flaky".into(),
            max_retries: Some(2),
            ..SubmitTask::default()
        })
        .await
        .unwrap();

        for expected_retry in 1..=2u32 {
            let task = q.assign_next(&w, &[]).await.unwrap().unwrap();
            match q
                .fail_task(&task.id, task.generation, "boom".into())
                .await
                .unwrap()
            {
                FailOutcome::Retried(t) => {
                    assert_eq!(t.retries, expected_retry);
                    assert_eq!(t.status, TaskStatus::Queued);
                }
                FailOutcome::DeadLetter(_) => panic!("budget not yet spent"),
            }
        }
        let task = q.assign_next(&w, &[]).await.unwrap().unwrap();
        match q
            .fail_task(&task.id, task.generation, "boom".into())
            .await
            .unwrap()
        {
            FailOutcome::DeadLetter(t) => assert_eq!(t.status, TaskStatus::DeadLetter),
            FailOutcome::Retried(_) => panic!("budget was spent"),
        }
    }

    #[tokio::test]
    async fn recovery_continues_owner_and_reassigns_strangers() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path()).await;
        let (w1, w2) = (agent("w1"), agent("w2"));
        q.enqueue(submit("owned")).await.unwrap();
        let task = q.assign_next(&w1, &[]).await.unwrap().unwrap();

        match q.recover_task(&task.id, &w1).await.unwrap() {
            Recovery::Continue(t) => assert_eq!(t.generation, task.generation),
            Recovery::Reassign => panic!("owner should continue"),
        }
        assert!(matches!(
            q.recover_task(&task.id, &w2).await.unwrap(),
            Recovery::Reassign
        ));
        assert!(matches!(
            q.recover_task(&TaskId::generate(), &w1).await.unwrap(),
            Recovery::Reassign
        ));
    }

    #[tokio::test]
    async fn reclaim_targets_only_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path()).await;
        let (alive, gone) = (agent("alive"), agent("gone"));
        q.enqueue(submit("a")).await.unwrap();
        q.enqueue(submit("b")).await.unwrap();
        let t1 = q.assign_next(&alive, &[]).await.unwrap().unwrap();
        let t2 = q.assign_next(&gone, &[]).await.unwrap().unwrap();

        let reclaimed = q
            .reclaim_stale(|a| a == &alive, now_ms(), 60_000)
            .await
            .unwrap();
        assert_eq!(reclaimed, vec![t2.id.clone()]);
        assert_eq!(
            q.get(&t1.id).await.unwrap().unwrap().status,
            TaskStatus::Assigned
        );
        assert_eq!(
            q.get(&t2.id).await.unwrap().unwrap().status,
            TaskStatus::Queued
        );
    }

    #[tokio::test]
    async fn assignment_honors_capabilities_and_priority() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path()).await;
        q.enqueue(SubmitTask {
            description: "needs gpu".into(),
            priority: Some(0),
            required_capabilities: vec!["gpu".into()],
            ..SubmitTask::default()
        })
        .await
        .unwrap();
        q.enqueue(SubmitTask {
            description: "plain".into(),
            priority: Some(2),
            ..SubmitTask::default()
        })
        .await
        .unwrap();

        // No gpu capability: skips the urgent task.
        let task = q.assign_next(&agent("cpu-only"), &[]).await.unwrap().unwrap();
        assert_eq!(task.description, "plain");

        let task = q
            .assign_next(&agent("beefy"), &["gpu".to_string()])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.description, "needs gpu");
        assert!(q.assign_next(&agent("idle"), &[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn progress_update_refreshes_heartbeat_only() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path()).await;
        q.enqueue(submit("slow")).await.unwrap();
        let task = q.assign_next(&agent("w1"), &[]).await.unwrap().unwrap();
        q.update_progress(&task.id).await.unwrap();
        let after = q.get(&task.id).await.unwrap().unwrap();
        assert_eq!(after.status, TaskStatus::Assigned);
        assert_eq!(after.generation, task.generation);
    }
}
