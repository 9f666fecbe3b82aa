//! Per-task diffs. While a task's worktrees exist, the diff is computed
//! live against the merge base with the default branch (so uncommitted
//! agent work shows up). After cleanup, it is reconstructed from the
//! commit hashes the pipeline recorded.

use std::{path::Path, sync::Arc};

use git::WorktreeManager;
use serde::Serialize;
use store::TaskStore;
use uuid::Uuid;

use super::ServiceError;

#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceDiff {
    pub workspace: String,
    pub diff: String,
}

pub async fn task_diffs(
    store: Arc<TaskStore>,
    worktrees: WorktreeManager,
    task_id: Uuid,
) -> Result<Vec<WorkspaceDiff>, ServiceError> {
    let task = store.get_task(task_id)?;
    tokio::task::spawn_blocking(move || -> Result<Vec<WorkspaceDiff>, git::GitCliError> {
        let cli = worktrees.cli();
        let mut diffs = Vec::new();

        if !task.worktree_paths.is_empty() {
            for (workspace, worktree) in &task.worktree_paths {
                let ws_path = Path::new(workspace);
                let wt_path = Path::new(worktree);
                if !cli.is_git_repo(ws_path) {
                    continue;
                }
                let default = worktrees.default_branch(ws_path)?;
                let base = cli.merge_base(wt_path, &default, "HEAD")?;
                diffs.push(WorkspaceDiff {
                    workspace: workspace.clone(),
                    diff: cli.diff_against(wt_path, &base)?,
                });
            }
            return Ok(diffs);
        }

        // Worktrees are gone; fall back to the recorded hashes. A base hash
        // without a commit hash means the task merged nothing there.
        for (workspace, base) in &task.base_commit_hashes {
            let diff = match task.commit_hashes.get(workspace) {
                Some(head) => cli.diff_range(Path::new(workspace), base, head)?,
                None => String::new(),
            };
            diffs.push(WorkspaceDiff {
                workspace: workspace.clone(),
                diff,
            });
        }
        Ok(diffs)
    })
    .await
    .map_err(|e| ServiceError::Join(e.to_string()))?
    .map_err(ServiceError::from)
}
