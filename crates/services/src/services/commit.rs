use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use dashmap::DashMap;
use git::{GitCliError, WorktreeManager};
use sandbox::{AgentInvoker, RunRequest};
use store::{TaskStore, models::{EventKind, Task, TaskEvent}};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use utils::text::{first_line_truncated, truncate_to_char_boundary};
use uuid::Uuid;

use super::ServiceError;

pub const MAX_REBASE_RETRIES: u32 = 3;
const MESSAGE_GEN_TIMEOUT: Duration = Duration::from_secs(60);
const COMMIT_MESSAGE_MAX: usize = 120;

struct StagePlan {
    /// (workspace, worktree) pairs with staged changes awaiting a commit.
    staged: Vec<(String, String)>,
    /// Git-backed pairs, staged or not; rebase + merge applies to all of
    /// them because the agent may have committed on its own.
    git: Vec<(String, String)>,
    /// Pre-staged snapshot directories of non-git workspaces.
    non_git: Vec<(String, String)>,
    stat: String,
    style: String,
}

/// Host-side stage/commit -> rebase -> fast-forward merge -> cleanup,
/// executed when a task terminates successfully. Rebase and merge on the
/// same repository are serialized through a per-repo mutex; different
/// repositories proceed in parallel. Phase errors leave the worktrees in
/// place for inspection.
pub struct CommitPipeline {
    store: Arc<TaskStore>,
    worktrees: WorktreeManager,
    invoker: Arc<dyn AgentInvoker>,
    repo_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl CommitPipeline {
    pub fn new(
        store: Arc<TaskStore>,
        worktrees: WorktreeManager,
        invoker: Arc<dyn AgentInvoker>,
    ) -> Self {
        CommitPipeline {
            store,
            worktrees,
            invoker,
            repo_locks: DashMap::new(),
        }
    }

    pub async fn run(&self, task_id: Uuid, cancel: &CancellationToken) -> Result<(), ServiceError> {
        let task = self.store.get_task(task_id)?;
        if task.worktree_paths.is_empty() {
            self.system_event(task_id, "Commit pipeline: no worktrees, nothing to commit")?;
            return Ok(());
        }

        // Phase 1: stage everything and commit pending changes.
        self.system_event(task_id, "Commit pipeline: staging changes")?;
        let plan = self.stage(&task).await?;

        if plan.staged.is_empty() {
            self.system_event(task_id, "Commit pipeline: working trees clean, nothing to commit")?;
        } else {
            let message = self.commit_message(&task, &plan.stat, &plan.style, cancel).await;
            self.commit_staged(&plan.staged, &message).await?;
            self.system_event(task_id, &format!("Commit pipeline: committed \"{message}\""))?;
        }

        // Phase 2: per-repo rebase and fast-forward merge, serialized per
        // repository path.
        let mut base_hashes = task.base_commit_hashes.clone();
        let mut commit_hashes = task.commit_hashes.clone();
        for (workspace, worktree) in &plan.git {
            self.rebase_and_merge(
                &task,
                workspace,
                worktree,
                &mut base_hashes,
                &mut commit_hashes,
                cancel,
            )
            .await?;
        }

        for (workspace, worktree) in &plan.non_git {
            let (src, dst) = (PathBuf::from(worktree), PathBuf::from(workspace));
            tokio::task::spawn_blocking(move || utils::fs::copy_dir_contents(&src, &dst))
                .await
                .map_err(|e| ServiceError::Join(e.to_string()))??;
            self.system_event(
                task_id,
                &format!("Commit pipeline: copied snapshot back to {}", basename(workspace)),
            )?;
        }

        // Phase 3: persist hashes, then drop the worktrees.
        self.store.update_base_commit_hashes(task_id, base_hashes)?;
        self.store.update_commit_hashes(task_id, commit_hashes)?;
        self.worktrees
            .cleanup(task_id, &task.worktree_paths, &task.branch_name)
            .await;
        self.store.clear_worktrees(task_id)?;
        self.system_event(task_id, "Commit pipeline completed")?;
        Ok(())
    }

    async fn stage(&self, task: &Task) -> Result<StagePlan, ServiceError> {
        let cli = self.worktrees.cli().clone();
        let entries: Vec<(String, String)> = task
            .worktree_paths
            .iter()
            .map(|(ws, wt)| (ws.clone(), wt.clone()))
            .collect();

        run_blocking(move || {
            let mut plan = StagePlan {
                staged: Vec::new(),
                git: Vec::new(),
                non_git: Vec::new(),
                stat: String::new(),
                style: String::new(),
            };
            for (workspace, worktree) in entries {
                let ws_path = Path::new(&workspace);
                let wt_path = Path::new(&worktree);
                if !cli.is_git_repo(ws_path) {
                    plan.non_git.push((workspace, worktree));
                    continue;
                }
                cli.add_all(wt_path)?;
                if cli.has_staged_changes(wt_path)? {
                    plan.stat.push_str(&cli.diff_cached_stat(wt_path)?);
                    if plan.style.is_empty() {
                        plan.style = cli.recent_subjects(ws_path, 5);
                    }
                    plan.staged.push((workspace.clone(), worktree.clone()));
                }
                plan.git.push((workspace, worktree));
            }
            Ok(plan)
        })
        .await
    }

    async fn commit_staged(
        &self,
        staged: &[(String, String)],
        message: &str,
    ) -> Result<(), ServiceError> {
        let cli = self.worktrees.cli().clone();
        let staged = staged.to_vec();
        let message = message.to_string();
        run_blocking(move || {
            let first = Path::new(&staged[0].0);
            let name = cli
                .config_global(first, "user.name")
                .unwrap_or_else(|| "wallfacer".to_string());
            let email = cli
                .config_global(first, "user.email")
                .unwrap_or_else(|| "wallfacer@localhost".to_string());
            for (_, worktree) in &staged {
                cli.commit_with_identity(Path::new(worktree), &message, &name, &email)?;
            }
            Ok(())
        })
        .await
    }

    async fn rebase_and_merge(
        &self,
        task: &Task,
        workspace: &str,
        worktree: &str,
        base_hashes: &mut BTreeMap<String, String>,
        commit_hashes: &mut BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        let lock = self.repo_lock(workspace);
        let _guard = lock.lock().await;

        let cli = self.worktrees.cli().clone();
        let manager = self.worktrees.clone();
        let ws = workspace.to_string();
        let wt = worktree.to_string();

        let (default, base, ahead) = run_blocking(move || {
            let ws_path = Path::new(&ws);
            let default = manager.default_branch(ws_path)?;
            // Captured unconditionally so later diff reconstruction can tell
            // "nothing changed" apart from "worktree is gone".
            let base = cli.rev_parse(ws_path, &default)?;
            let ahead = cli.rev_list_count(Path::new(&wt), &format!("{default}..HEAD"))?;
            Ok((default, base, ahead))
        })
        .await?;
        base_hashes.insert(workspace.to_string(), base);
        self.store
            .update_base_commit_hashes(task.id, base_hashes.clone())?;

        if ahead == 0 {
            self.system_event(
                task.id,
                &format!("Commit pipeline: no commits to merge for {}", basename(workspace)),
            )?;
            return Ok(());
        }

        self.rebase_with_resolution(task, workspace, worktree, &default, cancel)
            .await?;

        let cli = self.worktrees.cli().clone();
        let ws = workspace.to_string();
        let branch = task.branch_name.clone();
        let head = run_blocking(move || {
            let ws_path = Path::new(&ws);
            cli.merge_ff_only(ws_path, &branch)?;
            cli.rev_parse(ws_path, "HEAD")
        })
        .await?;
        self.system_event(
            task.id,
            &format!(
                "Commit pipeline: merged {} into {} at {} ({})",
                task.branch_name,
                default,
                &head[..head.len().min(8)],
                basename(workspace),
            ),
        )?;
        commit_hashes.insert(workspace.to_string(), head);
        self.store
            .update_commit_hashes(task.id, commit_hashes.clone())?;
        Ok(())
    }

    /// Rebase the worktree onto `onto`, invoking the conflict-resolver
    /// container on conflicts, up to `MAX_REBASE_RETRIES` times. Shared
    /// with the sync path.
    pub(crate) async fn rebase_with_resolution(
        &self,
        task: &Task,
        workspace: &str,
        worktree: &str,
        onto: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        let mut attempt = 0;
        loop {
            let cli = self.worktrees.cli().clone();
            let wt = worktree.to_string();
            let onto_ref = onto.to_string();
            let outcome = run_blocking(move || cli.rebase(Path::new(&wt), &onto_ref)).await;
            match outcome {
                Ok(()) => return Ok(()),
                Err(ServiceError::Git(
                    err @ (GitCliError::Conflict(_) | GitCliError::RebaseInProgress),
                )) => {
                    if attempt >= MAX_REBASE_RETRIES {
                        return Err(ServiceError::Conflict(format!(
                            "rebase conflicts persisted after {MAX_REBASE_RETRIES} resolution attempts: {err}"
                        )));
                    }
                    attempt += 1;
                    self.system_event(
                        task.id,
                        &format!(
                            "Rebase conflict in {}; running resolver (attempt {attempt}/{MAX_REBASE_RETRIES})",
                            basename(workspace)
                        ),
                    )?;
                    self.resolve_conflicts(task, workspace, worktree, cancel).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn resolve_conflicts(
        &self,
        task: &Task,
        workspace: &str,
        worktree: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        let req = RunRequest {
            task_id: task.id,
            container_suffix: Some("fix".to_string()),
            prompt: "A git rebase in this repository stopped on conflicts. Resolve every \
                     conflicted file, stage the resolutions with `git add`, then run \
                     `git rebase --continue`. Do NOT run `git commit`."
                .to_string(),
            session_id: (!task.session_id.is_empty()).then(|| task.session_id.clone()),
            workspaces: vec![PathBuf::from(workspace)],
            worktree_overrides: BTreeMap::from([(workspace.to_string(), worktree.to_string())]),
            git_workspaces: BTreeSet::from([workspace.to_string()]),
            instructions_file: None,
        };
        let output = self.invoker.run_turn(&req, None, cancel).await;
        match output.result {
            Ok(res) if !res.is_error => Ok(()),
            Ok(res) => Err(ServiceError::Conflict(format!(
                "conflict resolver reported an error: {}",
                truncate_to_char_boundary(&res.result, 500)
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Generate a commit message with a short-timeout agent call; fall back
    /// to a prefix of the first prompt line when the agent is unavailable
    /// or uncooperative.
    async fn commit_message(
        &self,
        task: &Task,
        stat: &str,
        style: &str,
        cancel: &CancellationToken,
    ) -> String {
        let first_prompt = task.prompt_history.first().unwrap_or(&task.prompt);
        let fallback = format!("wallfacer: {}", first_line_truncated(first_prompt, 72));

        let prompt = format!(
            "Write a one-line git commit message for the change described below. \
             Reply with only the message, no quotes.\n\nTask: {}\n\nChanged files:\n{}\n\n\
             Recent commit subjects, for style reference:\n{}",
            truncate_to_char_boundary(first_prompt, 1000),
            truncate_to_char_boundary(stat, 2000),
            truncate_to_char_boundary(style, 500),
        );
        let req = RunRequest {
            task_id: task.id,
            container_suffix: Some("msg".to_string()),
            prompt,
            ..Default::default()
        };

        let gen_cancel = cancel.child_token();
        let timer = {
            let token = gen_cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(MESSAGE_GEN_TIMEOUT).await;
                token.cancel();
            })
        };
        let output = self.invoker.run_turn(&req, None, &gen_cancel).await;
        timer.abort();

        match output.result {
            Ok(res) if !res.is_error => {
                let line = first_line_truncated(&res.result, COMMIT_MESSAGE_MAX);
                if line.is_empty() {
                    fallback
                } else {
                    line.to_string()
                }
            }
            Ok(_) | Err(_) => {
                debug!(task = %task.id, "commit message generation failed, using fallback");
                fallback
            }
        }
    }

    fn repo_lock(&self, repo: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.repo_locks
            .entry(repo.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn system_event(&self, task_id: Uuid, message: &str) -> Result<(), ServiceError> {
        self.store
            .insert_event(task_id, EventKind::System, TaskEvent::system_payload(message))
            .map(|_| ())
            .map_err(|e| {
                warn!("failed to record pipeline event: {e}");
                ServiceError::from(e)
            })
    }
}

fn basename(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
}

async fn run_blocking<T, F>(f: F) -> Result<T, ServiceError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, GitCliError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ServiceError::Join(e.to_string()))?
        .map_err(ServiceError::from)
}
