use std::{collections::BTreeSet, path::Path, sync::Arc, time::Duration};

use dashmap::DashMap;
use git::WorktreeManager;
use sandbox::{AgentInvoker, RunRequest, SandboxError, salvage_session_id};
use store::{
    TaskStore,
    models::{EventKind, TaskEvent, TaskStatus, TaskUsage},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use utils::text::truncate_to_char_boundary;
use uuid::Uuid;

use super::{ServiceError, commit::CommitPipeline, instructions::InstructionFiles};

const TITLE_GEN_TIMEOUT: Duration = Duration::from_secs(60);
const TITLE_MAX_CHARS: usize = 80;

/// Drives the agent through multiple turns for one task. One runner
/// coroutine per `in_progress` task; the coroutine holds no task state
/// beyond its id and re-reads the record whenever it must check for
/// cancellation.
pub struct Runner {
    store: Arc<TaskStore>,
    worktrees: WorktreeManager,
    invoker: Arc<dyn AgentInvoker>,
    pipeline: Arc<CommitPipeline>,
    instructions: InstructionFiles,
    cancellations: DashMap<Uuid, CancellationToken>,
}

/// Moves the task to `failed` if the coroutine unwinds or returns without
/// recording a terminal status; a task never sticks in `in_progress`.
struct TerminalGuard {
    store: Arc<TaskStore>,
    task_id: Uuid,
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        match self
            .store
            .fail_if_running(self.task_id, "runner exited without recording a terminal status")
        {
            Ok(true) => warn!(task = %self.task_id, "terminal guard moved task to failed"),
            Ok(false) => {}
            Err(e) => warn!(task = %self.task_id, "terminal guard failed: {e}"),
        }
    }
}

impl Runner {
    pub fn new(
        store: Arc<TaskStore>,
        worktrees: WorktreeManager,
        invoker: Arc<dyn AgentInvoker>,
        pipeline: Arc<CommitPipeline>,
        instructions: InstructionFiles,
    ) -> Self {
        Runner {
            store,
            worktrees,
            invoker,
            pipeline,
            instructions,
            cancellations: DashMap::new(),
        }
    }

    /// Cancel the task's in-flight container read loop, if any.
    pub fn cancel(&self, task_id: Uuid) {
        if let Some(token) = self.cancellations.get(&task_id) {
            token.cancel();
        }
    }

    /// The task execution loop, spawned by the lifecycle controller after
    /// the `in_progress` write commits.
    pub async fn run(
        self: Arc<Self>,
        task_id: Uuid,
        prompt: String,
        session_id: String,
        resumed_from_waiting: bool,
    ) {
        let timeout_minutes = match self.store.get_task(task_id) {
            Ok(task) => task.timeout_minutes,
            Err(e) => {
                warn!(task = %task_id, "runner could not load task: {e}");
                return;
            }
        };

        let cancel = CancellationToken::new();
        self.cancellations.insert(task_id, cancel.clone());
        let watchdog = {
            let token = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(u64::from(timeout_minutes) * 60)).await;
                token.cancel();
            })
        };
        let guard = TerminalGuard {
            store: self.store.clone(),
            task_id,
        };

        if let Err(e) = self
            .drive(task_id, prompt, session_id, resumed_from_waiting, &cancel)
            .await
        {
            warn!(task = %task_id, "runner stopped on store error: {e}");
        }

        watchdog.abort();
        self.cancellations.remove(&task_id);
        self.store.remove_live_log(task_id);
        drop(guard);
    }

    async fn drive(
        &self,
        task_id: Uuid,
        mut prompt: String,
        mut session_id: String,
        resumed_from_waiting: bool,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        let task = self.store.get_task(task_id)?;
        let original_prompt = task.prompt.clone();

        // Reuse recorded worktrees only when every one of them still exists
        // on disk.
        let mapping = if !task.worktree_paths.is_empty()
            && task.worktree_paths.values().all(|p| Path::new(p).exists())
        {
            task.worktree_paths.clone()
        } else {
            match self.worktrees.create_or_reuse(task_id).await {
                Ok((mapping, branch)) => {
                    self.store.update_worktrees(task_id, mapping.clone(), &branch)?;
                    mapping
                }
                Err(e) => {
                    self.store
                        .fail_unless_cancelled(task_id, &format!("worktree setup failed: {e}"))?;
                    return Ok(());
                }
            }
        };

        let mut retried_without_session = false;
        loop {
            let turn = self.store.increment_turns(task_id)?;
            info!(
                task = %task_id,
                turn,
                session = %session_id,
                timeout_minutes = task.timeout_minutes,
                resumed_from_waiting,
                "starting agent turn"
            );

            let req = self.build_request(task_id, &prompt, &session_id, &mapping);
            let live_log = self.store.live_log_path(task_id);
            let output = self.invoker.run_turn(&req, Some(&live_log), cancel).await;

            if let Err(e) = self
                .store
                .save_turn_output(task_id, turn, &output.stdout, &output.stderr)
            {
                warn!(task = %task_id, turn, "failed to save turn output: {e}");
            }

            let result = match output.result {
                Err(err) => {
                    // A resume that came back empty is a known upstream
                    // quirk: drop the session once and replay the original
                    // prompt in a fresh one. Both attempts stay auditable
                    // through the saved turn outputs and this event.
                    if !session_id.is_empty()
                        && matches!(err, SandboxError::EmptyOutput)
                        && !retried_without_session
                    {
                        retried_without_session = true;
                        self.store.insert_event(
                            task_id,
                            EventKind::System,
                            TaskEvent::system_payload(
                                "session resume produced empty output; retrying with a fresh session",
                            ),
                        )?;
                        session_id.clear();
                        prompt = original_prompt.clone();
                        continue;
                    }
                    if session_id.is_empty()
                        && let Some(salvaged) = salvage_session_id(&output.stdout)
                    {
                        debug!(task = %task_id, "salvaged session id from partial output");
                        self.store.update_session(task_id, &salvaged)?;
                    }
                    self.store
                        .fail_unless_cancelled(task_id, &format!("agent invocation failed: {err}"))?;
                    return Ok(());
                }
                Ok(result) => result,
            };

            self.store.insert_event(
                task_id,
                EventKind::Output,
                TaskEvent::output_payload(&result.result, &result.stop_reason, &result.session_id),
            )?;
            self.store.update_result(
                task_id,
                &result.result,
                &result.stop_reason,
                Some(&result.session_id),
            )?;
            if !result.session_id.is_empty() {
                session_id = result.session_id.clone();
            }
            self.store.accumulate_usage(
                task_id,
                &TaskUsage {
                    input_tokens: result.usage.input_tokens,
                    output_tokens: result.usage.output_tokens,
                    cache_read_tokens: result.usage.cache_read_tokens,
                    cache_creation_tokens: result.usage.cache_creation_tokens,
                    cost: result.total_cost_usd,
                },
            )?;

            if result.is_error {
                self.store.fail_unless_cancelled(
                    task_id,
                    &format!(
                        "agent reported an error: {}",
                        truncate_to_char_boundary(&result.result, 500)
                    ),
                )?;
                return Ok(());
            }

            match result.stop_reason.as_str() {
                "end_turn" => {
                    match self.pipeline.run(task_id, cancel).await {
                        Ok(()) => {
                            self.store
                                .update_status_unless_cancelled(task_id, TaskStatus::Done)?;
                        }
                        Err(e) => {
                            self.store.fail_unless_cancelled(
                                task_id,
                                &format!("commit pipeline failed: {e}"),
                            )?;
                        }
                    }
                    return Ok(());
                }
                // The agent ran out of room or paused itself: continue the
                // same session with no new prompt.
                "max_tokens" | "pause_turn" => {
                    prompt.clear();
                    continue;
                }
                other => {
                    debug!(task = %task_id, stop_reason = other, "agent is waiting for input");
                    self.store
                        .update_status_unless_cancelled(task_id, TaskStatus::Waiting)?;
                    return Ok(());
                }
            }
        }
    }

    fn build_request(
        &self,
        task_id: Uuid,
        prompt: &str,
        session_id: &str,
        mapping: &std::collections::BTreeMap<String, String>,
    ) -> RunRequest {
        let git_workspaces: BTreeSet<String> = self
            .worktrees
            .git_workspaces()
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        RunRequest {
            task_id,
            container_suffix: None,
            prompt: prompt.to_string(),
            session_id: (!session_id.is_empty()).then(|| session_id.to_string()),
            workspaces: self.worktrees.workspaces().to_vec(),
            worktree_overrides: mapping.clone(),
            git_workspaces,
            instructions_file: self.instructions.mount_file(),
        }
    }

    /// One-shot short-timeout call asking for a 2-5 word card title. The
    /// agent's compliance is best-effort; anything empty or oversized is
    /// dropped and the card simply shows no title.
    pub async fn generate_title(self: Arc<Self>, task_id: Uuid, prompt: String) {
        let req = RunRequest {
            task_id,
            container_suffix: Some("title".to_string()),
            prompt: format!(
                "Reply with only a 2-5 word title summarizing this task. No quotes, \
                 no trailing punctuation.\n\n{}",
                truncate_to_char_boundary(&prompt, 500)
            ),
            ..Default::default()
        };

        let cancel = CancellationToken::new();
        let timer = {
            let token = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(TITLE_GEN_TIMEOUT).await;
                token.cancel();
            })
        };
        let output = self.invoker.run_turn(&req, None, &cancel).await;
        timer.abort();

        match output.result {
            Ok(result) if !result.is_error => {
                let title = result.result.trim();
                if title.is_empty() || title.chars().count() > TITLE_MAX_CHARS {
                    debug!(task = %task_id, "dropping non-conforming generated title");
                    return;
                }
                if let Err(e) = self.store.update_title(task_id, title) {
                    warn!(task = %task_id, "failed to store generated title: {e}");
                }
            }
            Ok(_) | Err(_) => {
                debug!(task = %task_id, "title generation failed, leaving title empty");
            }
        }
    }

    /// Rebase each worktree onto the latest default branch without merging,
    /// then restore the task to `prev_status`. Spawned by the lifecycle
    /// controller after it marks the task `in_progress`.
    pub async fn sync_worktrees(self: Arc<Self>, task_id: Uuid, prev_status: TaskStatus) {
        let guard = TerminalGuard {
            store: self.store.clone(),
            task_id,
        };
        let cancel = CancellationToken::new();
        self.cancellations.insert(task_id, cancel.clone());

        match self.sync_inner(task_id, &cancel).await {
            Ok(()) => {
                if let Err(e) = self.store.update_status_unless_cancelled(task_id, prev_status) {
                    warn!(task = %task_id, "failed to restore status after sync: {e}");
                }
            }
            Err(e) => {
                if let Err(store_err) = self
                    .store
                    .fail_unless_cancelled(task_id, &format!("sync failed: {e}"))
                {
                    warn!(task = %task_id, "failed to record sync failure: {store_err}");
                }
            }
        }
        self.cancellations.remove(&task_id);
        drop(guard);
    }

    async fn sync_inner(
        &self,
        task_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        let task = self.store.get_task(task_id)?;
        for (workspace, worktree) in &task.worktree_paths {
            let manager = self.worktrees.clone();
            let (ws, wt) = (workspace.clone(), worktree.clone());
            let (behind, default) = tokio::task::spawn_blocking(move || {
                let ws_path = Path::new(&ws);
                let behind = manager.commits_behind(ws_path, Path::new(&wt))?;
                let default = manager.default_branch(ws_path)?;
                Ok::<_, git::GitCliError>((behind, default))
            })
            .await
            .map_err(|e| ServiceError::Join(e.to_string()))??;

            if behind == 0 {
                continue;
            }

            let cli = self.worktrees.cli().clone();
            let wt = worktree.clone();
            let stashed = tokio::task::spawn_blocking(move || cli.stash_push(Path::new(&wt)))
                .await
                .map_err(|e| ServiceError::Join(e.to_string()))??;

            let rebase_result = self
                .pipeline
                .rebase_with_resolution(&task, workspace, worktree, &default, cancel)
                .await;

            if stashed {
                let cli = self.worktrees.cli().clone();
                let wt = worktree.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || cli.stash_pop(Path::new(&wt)))
                    .await
                    .map_err(|e| ServiceError::Join(e.to_string()))?
                {
                    warn!(task = %task_id, "stash pop after sync failed: {e}");
                }
            }
            rebase_result?;

            self.store.insert_event(
                task_id,
                EventKind::System,
                TaskEvent::system_payload(&format!(
                    "Synced {} onto {default} ({behind} commits)",
                    Path::new(workspace)
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| workspace.clone()),
                )),
            )?;
        }
        Ok(())
    }
}
