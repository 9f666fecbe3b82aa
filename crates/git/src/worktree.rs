use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use thiserror::Error;
use tracing::{debug, info, warn};
use utils::text::task_branch;
use uuid::Uuid;

use crate::cli::{GitCli, GitCliError};

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error(transparent)]
    GitCli(#[from] GitCliError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("task join error: {0}")]
    TaskJoin(String),
}

/// One isolated working copy per (task, git workspace), all on the shared
/// per-task branch `task/<first8>`. Worktree directories live at
/// `<worktrees_root>/<task-id>/<basename-of-workspace>`. Non-git workspace
/// directories are tolerated and skipped; the container invoker mounts them
/// directly.
#[derive(Clone)]
pub struct WorktreeManager {
    cli: GitCli,
    worktrees_root: PathBuf,
    workspaces: Vec<PathBuf>,
    default_branches: Arc<Mutex<HashMap<PathBuf, String>>>,
}

impl WorktreeManager {
    pub fn new(worktrees_root: PathBuf, workspaces: Vec<PathBuf>) -> Self {
        WorktreeManager {
            cli: GitCli::new(),
            worktrees_root,
            workspaces,
            default_branches: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn cli(&self) -> &GitCli {
        &self.cli
    }

    pub fn workspaces(&self) -> &[PathBuf] {
        &self.workspaces
    }

    /// The configured workspaces that are git repositories.
    pub fn git_workspaces(&self) -> Vec<PathBuf> {
        self.workspaces
            .iter()
            .filter(|ws| self.cli.is_git_repo(ws))
            .cloned()
            .collect()
    }

    pub fn worktree_dir(&self, task_id: Uuid) -> PathBuf {
        self.worktrees_root.join(task_id.to_string())
    }

    /// Create (or reuse) one worktree per git workspace for this task.
    /// Idempotent: an existing worktree directory is reused without
    /// touching git. Returns the workspace -> worktree mapping and the
    /// shared branch name.
    pub async fn create_or_reuse(
        &self,
        task_id: Uuid,
    ) -> Result<(BTreeMap<String, String>, String), WorktreeError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.create_or_reuse_blocking(task_id))
            .await
            .map_err(|e| WorktreeError::TaskJoin(e.to_string()))?
    }

    fn create_or_reuse_blocking(
        &self,
        task_id: Uuid,
    ) -> Result<(BTreeMap<String, String>, String), WorktreeError> {
        let branch = task_branch(&task_id);
        let mut mapping = BTreeMap::new();

        for workspace in &self.workspaces {
            if !self.cli.is_git_repo(workspace) {
                debug!("skipping non-git workspace {}", workspace.display());
                continue;
            }
            let basename = workspace
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "workspace".to_string());
            let worktree_path = self.worktree_dir(task_id).join(&basename);

            if worktree_path.exists() {
                debug!("reusing worktree at {}", worktree_path.display());
            } else {
                if let Some(parent) = worktree_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let default = self.default_branch(workspace)?;
                match self
                    .cli
                    .worktree_add(workspace, &worktree_path, &branch, Some(&default))
                {
                    Ok(()) => {
                        info!(
                            "created worktree {} at {}",
                            branch,
                            worktree_path.display()
                        );
                    }
                    Err(e) if e.is_branch_exists() => {
                        // Restart case: the directory was deleted but the
                        // branch survived. Drop stale metadata, then check
                        // out the existing branch.
                        if let Err(prune_err) = self.cli.worktree_prune(workspace) {
                            debug!("worktree prune before reuse failed: {prune_err}");
                        }
                        self.cli
                            .worktree_add(workspace, &worktree_path, &branch, None)?;
                        info!(
                            "checked out existing branch {} at {}",
                            branch,
                            worktree_path.display()
                        );
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            mapping.insert(
                workspace.to_string_lossy().into_owned(),
                worktree_path.to_string_lossy().into_owned(),
            );
        }

        Ok((mapping, branch))
    }

    /// Best-effort removal of each worktree plus the task branch, then the
    /// task's worktree directory tree. Errors are logged, never fatal.
    pub async fn cleanup(
        &self,
        task_id: Uuid,
        mapping: &BTreeMap<String, String>,
        branch: &str,
    ) {
        let this = self.clone();
        let mapping = mapping.clone();
        let branch = branch.to_string();
        let result = tokio::task::spawn_blocking(move || {
            this.cleanup_blocking(task_id, &mapping, &branch)
        })
        .await;
        if let Err(e) = result {
            warn!("worktree cleanup join error for {task_id}: {e}");
        }
    }

    fn cleanup_blocking(&self, task_id: Uuid, mapping: &BTreeMap<String, String>, branch: &str) {
        for (workspace, worktree) in mapping {
            let workspace = Path::new(workspace);
            let worktree = Path::new(worktree);
            if let Err(e) = self.cli.worktree_remove(workspace, worktree, true) {
                debug!("worktree remove non-fatal error: {e}");
            }
            if let Err(e) = self.cli.worktree_prune(workspace) {
                debug!("worktree prune non-fatal error: {e}");
            }
            if let Err(e) = self.cli.branch_delete(workspace, branch) {
                debug!("branch delete non-fatal error: {e}");
            }
        }
        let dir = self.worktree_dir(task_id);
        if dir.exists()
            && let Err(e) = fs::remove_dir_all(&dir)
        {
            warn!("failed to remove worktree dir {}: {e}", dir.display());
        }
    }

    /// Remove worktree subdirectories whose name parses as a task id that is
    /// not in the known set, and drop stale git references for each known
    /// git workspace. Runs once at startup.
    pub async fn prune_orphans(&self, known: &HashSet<Uuid>) -> Result<(), WorktreeError> {
        let this = self.clone();
        let known = known.clone();
        tokio::task::spawn_blocking(move || this.prune_orphans_blocking(&known))
            .await
            .map_err(|e| WorktreeError::TaskJoin(e.to_string()))?
    }

    fn prune_orphans_blocking(&self, known: &HashSet<Uuid>) -> Result<(), WorktreeError> {
        if self.worktrees_root.is_dir() {
            for entry in fs::read_dir(&self.worktrees_root)? {
                let entry = entry?;
                let Ok(id) = entry.file_name().to_string_lossy().parse::<Uuid>() else {
                    continue;
                };
                if known.contains(&id) {
                    continue;
                }
                info!("pruning orphaned worktrees for task {id}");
                let branch = task_branch(&id);
                for workspace in self.git_workspaces() {
                    let _ = self.cli.branch_delete(&workspace, &branch);
                }
                if let Err(e) = fs::remove_dir_all(entry.path()) {
                    warn!("failed to remove orphan dir {}: {e}", entry.path().display());
                }
            }
        }
        for workspace in self.git_workspaces() {
            if let Err(e) = self.cli.worktree_prune(&workspace) {
                debug!("startup worktree prune failed for {}: {e}", workspace.display());
            }
        }
        Ok(())
    }

    /// The repository's primary integration branch: the remote-tracking
    /// symbolic ref when present, else the currently checked-out branch,
    /// else `main`. Cached per repo path.
    pub fn default_branch(&self, repo: &Path) -> Result<String, GitCliError> {
        if let Some(cached) = self.default_branches.lock().unwrap().get(repo) {
            return Ok(cached.clone());
        }
        let branch = match self.cli.remote_head_branch(repo)? {
            Some(b) => b,
            None => self
                .cli
                .current_branch(repo)
                .unwrap_or_else(|_| "main".to_string()),
        };
        self.default_branches
            .lock()
            .unwrap()
            .insert(repo.to_path_buf(), branch.clone());
        Ok(branch)
    }

    pub fn merge_base(&self, repo: &Path, a: &str, b: &str) -> Result<String, GitCliError> {
        self.cli.merge_base(repo, a, b)
    }

    /// Number of commits on the repo's default branch not yet present in
    /// the worktree's branch.
    pub fn commits_behind(&self, repo: &Path, worktree: &Path) -> Result<u64, GitCliError> {
        let default = self.default_branch(repo)?;
        self.cli.rev_list_count(worktree, &format!("HEAD..{default}"))
    }

    /// Commits on the worktree's branch that the default branch lacks.
    pub fn commits_ahead(&self, repo: &Path, worktree: &Path) -> Result<u64, GitCliError> {
        let default = self.default_branch(repo)?;
        self.cli.rev_list_count(worktree, &format!("{default}..HEAD"))
    }
}
