use std::sync::Arc;

use git::WorktreeManager;
use sandbox::AgentInvoker;
use store::{
    StoreError, TaskStore,
    models::{CreateTask, EventKind, Task, TaskEvent, TaskStatus, UpdateBacklog},
};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use super::{ServiceError, commit::CommitPipeline, runner::Runner};

/// External transition requests (start, feedback, cancel, retry, resume,
/// sync, archive). Each operation validates the current status, mutates the
/// store, and spawns follow-up coroutines only after the store write
/// commits.
#[derive(Clone)]
pub struct Lifecycle {
    store: Arc<TaskStore>,
    worktrees: WorktreeManager,
    invoker: Arc<dyn AgentInvoker>,
    runner: Arc<Runner>,
    pipeline: Arc<CommitPipeline>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateTaskRequest {
    pub status: Option<TaskStatus>,
    pub position: Option<i64>,
    #[serde(flatten)]
    pub backlog: UpdateBacklog,
}

impl Lifecycle {
    pub fn new(
        store: Arc<TaskStore>,
        worktrees: WorktreeManager,
        invoker: Arc<dyn AgentInvoker>,
        runner: Arc<Runner>,
        pipeline: Arc<CommitPipeline>,
    ) -> Self {
        Lifecycle {
            store,
            worktrees,
            invoker,
            runner,
            pipeline,
        }
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    /// Create a backlog task and kick off title generation.
    pub fn create_task(&self, req: CreateTask) -> Result<Task, ServiceError> {
        let task = self.store.create_task(req)?;
        let runner = self.runner.clone();
        let prompt = task.prompt.clone();
        let task_id = task.id;
        tokio::spawn(runner.generate_title(task_id, prompt));
        Ok(task)
    }

    /// Status writes arriving from the board. Drags map onto the lifecycle
    /// graph; anything else is an invalid transition.
    pub async fn update_task(
        &self,
        id: Uuid,
        req: UpdateTaskRequest,
    ) -> Result<Task, ServiceError> {
        if let Some(position) = req.position {
            self.store.update_position(id, position)?;
        }
        let has_backlog_edit = req.backlog.prompt.is_some()
            || req.backlog.timeout_minutes.is_some()
            || req.backlog.fresh_start.is_some();
        if has_backlog_edit {
            self.store.update_backlog(id, req.backlog.clone())?;
        }

        let Some(to) = req.status else {
            return Ok(self.store.get_task(id)?);
        };
        let task = self.store.get_task(id)?;
        match (task.status, to) {
            (from, to) if from == to => Ok(task),
            (TaskStatus::Backlog, TaskStatus::InProgress) => self.start_task(id).await,
            (TaskStatus::Waiting, TaskStatus::Done) => self.mark_done(id).await,
            (from, TaskStatus::Backlog) if from.is_retryable() => self.retry_task(id, false).await,
            (_, TaskStatus::Cancelled) => self.cancel_task(id).await,
            (from, to) => Err(ServiceError::InvalidState(format!(
                "cannot move a {from} task to {to}"
            ))),
        }
    }

    /// Backlog -> in_progress; spawns the runner coroutine.
    pub async fn start_task(&self, id: Uuid) -> Result<Task, ServiceError> {
        let task = self.store.get_task(id)?;
        if task.status != TaskStatus::Backlog {
            return Err(ServiceError::InvalidState(format!(
                "only backlog tasks can be started, task is {}",
                task.status
            )));
        }
        let updated = self.store.update_status(id, TaskStatus::InProgress)?;
        let session = if task.fresh_start {
            String::new()
        } else {
            task.session_id.clone()
        };
        info!(task = %id, "starting task");
        tokio::spawn(self.runner.clone().run(id, task.prompt.clone(), session, false));
        Ok(updated)
    }

    /// Feedback on a waiting task resumes the conversation.
    pub async fn feedback(&self, id: Uuid, message: String) -> Result<Task, ServiceError> {
        if message.trim().is_empty() {
            return Err(ServiceError::Store(StoreError::InvalidArgument(
                "feedback must not be empty".into(),
            )));
        }
        let task = self.store.get_task(id)?;
        if task.status != TaskStatus::Waiting {
            return Err(ServiceError::InvalidState(format!(
                "feedback requires a waiting task, task is {}",
                task.status
            )));
        }
        self.store
            .insert_event(id, EventKind::Feedback, TaskEvent::feedback_payload(&message))?;
        let updated = self.store.update_status(id, TaskStatus::InProgress)?;
        tokio::spawn(
            self.runner
                .clone()
                .run(id, message, task.session_id.clone(), true),
        );
        Ok(updated)
    }

    /// "Mark done" on a waiting task: commit whatever is in the worktrees.
    pub async fn mark_done(&self, id: Uuid) -> Result<Task, ServiceError> {
        let task = self.store.get_task(id)?;
        if task.status != TaskStatus::Waiting {
            return Err(ServiceError::InvalidState(format!(
                "only waiting tasks can be marked done, task is {}",
                task.status
            )));
        }
        let updated = self.store.update_status(id, TaskStatus::Committing)?;

        let store = self.store.clone();
        let pipeline = self.pipeline.clone();
        tokio::spawn(async move {
            let cancel = tokio_util::sync::CancellationToken::new();
            match pipeline.run(id, &cancel).await {
                Ok(()) => {
                    if let Err(e) = store.update_status_unless_cancelled(id, TaskStatus::Done) {
                        tracing::warn!(task = %id, "failed to finish mark-done: {e}");
                    }
                }
                Err(e) => {
                    if let Err(store_err) =
                        store.fail_unless_cancelled(id, &format!("commit pipeline failed: {e}"))
                    {
                        tracing::warn!(task = %id, "failed to record pipeline failure: {store_err}");
                    }
                }
            }
            store.remove_live_log(id);
        });
        Ok(updated)
    }

    /// Kill the container first, then write `cancelled` *before* cleaning
    /// up worktrees so the runner's next re-read sees the terminal status.
    pub async fn cancel_task(&self, id: Uuid) -> Result<Task, ServiceError> {
        let task = self.store.get_task(id)?;
        if !task.status.is_cancellable() {
            return Err(ServiceError::InvalidState(format!(
                "cannot cancel a task in status {}",
                task.status
            )));
        }

        if task.status == TaskStatus::InProgress {
            self.invoker.kill_container(id).await;
            self.runner.cancel(id);
        }

        let updated = self.store.update_status(id, TaskStatus::Cancelled)?;

        if !task.worktree_paths.is_empty() {
            self.worktrees
                .cleanup(id, &task.worktree_paths, &task.branch_name)
                .await;
            self.store.clear_worktrees(id)?;
        }
        self.store.remove_live_log(id);
        Ok(updated)
    }

    /// Back to the backlog for another run. Worktrees are removed before
    /// the record is reset; the session survives unless `fresh_start`.
    pub async fn retry_task(&self, id: Uuid, fresh_start: bool) -> Result<Task, ServiceError> {
        let task = self.store.get_task(id)?;
        if !task.status.is_retryable() {
            return Err(ServiceError::InvalidState(format!(
                "cannot retry a task in status {}",
                task.status
            )));
        }
        if !task.worktree_paths.is_empty() {
            self.worktrees
                .cleanup(id, &task.worktree_paths, &task.branch_name)
                .await;
        }
        Ok(self.store.reset_for_retry(id, fresh_start)?)
    }

    /// Failed -> in_progress in the same agent session.
    pub async fn resume_task(&self, id: Uuid) -> Result<Task, ServiceError> {
        let updated = self.store.resume_task(id)?;
        tokio::spawn(self.runner.clone().run(
            id,
            "Continue where you left off.".to_string(),
            updated.session_id.clone(),
            false,
        ));
        Ok(updated)
    }

    /// Rebase the task's worktrees onto the latest default branch without
    /// merging; the task returns to its previous status afterwards.
    pub async fn sync_task(&self, id: Uuid) -> Result<Task, ServiceError> {
        let task = self.store.get_task(id)?;
        if task.worktree_paths.is_empty() {
            return Err(ServiceError::Store(StoreError::InvalidArgument(
                "task has no worktrees to sync".into(),
            )));
        }
        if !matches!(task.status, TaskStatus::Waiting | TaskStatus::Failed) {
            return Err(ServiceError::InvalidState(format!(
                "cannot sync a task in status {}",
                task.status
            )));
        }
        let prev = task.status;
        let updated = self.store.update_status(id, TaskStatus::InProgress)?;
        tokio::spawn(self.runner.clone().sync_worktrees(id, prev));
        Ok(updated)
    }

    pub fn set_archived(&self, id: Uuid, archived: bool) -> Result<Task, ServiceError> {
        Ok(self.store.set_archived(id, archived)?)
    }

    /// Deleting a running task is refused; cancel first.
    pub async fn delete_task(&self, id: Uuid) -> Result<(), ServiceError> {
        let task = self.store.get_task(id)?;
        if task.status.is_running() {
            return Err(ServiceError::InvalidState(format!(
                "cannot delete a task in status {}; cancel it first",
                task.status
            )));
        }
        if !task.worktree_paths.is_empty() {
            self.worktrees
                .cleanup(id, &task.worktree_paths, &task.branch_name)
                .await;
        }
        self.store.delete_task(id)?;
        Ok(())
    }
}
