//! All repo work goes through the `git` CLI, invoked as `git -C <path> …`.
//! Worktree metadata encodes host-absolute paths, and the CLI refuses to
//! clobber uncommitted changes during checkout/rebase/merge unless forced,
//! so the CLI is both the safer and the only wire contract this crate has.

use std::{
    ffi::{OsStr, OsString},
    path::Path,
    process::{Command, Stdio},
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitCliError {
    #[error("git executable not found or not runnable")]
    NotAvailable,
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("rebase conflict: {0}")]
    Conflict(String),
    #[error("rebase in progress in this worktree")]
    RebaseInProgress,
}

impl GitCliError {
    /// True when the failure is git refusing to create a branch that
    /// already exists (e.g. a restart after the worktree directory was
    /// deleted but the branch survived).
    pub fn is_branch_exists(&self) -> bool {
        match self {
            GitCliError::CommandFailed(msg) => {
                let lower = msg.to_ascii_lowercase();
                lower.contains("already exists") || lower.contains("already checked out")
            }
            _ => false,
        }
    }
}

#[derive(Clone, Default)]
pub struct GitCli;

impl GitCli {
    pub fn new() -> Self {
        Self {}
    }

    /// Run `git -C <repo_path> <args…>` and return stdout on success.
    /// Prefer the dedicated helpers below so command choices stay
    /// centralized; use this directly only in tests or when no helper
    /// exists yet.
    pub fn git<I, S>(&self, repo_path: &Path, args: I) -> Result<String, GitCliError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(repo_path);
        for a in args {
            cmd.arg(a);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        tracing::trace!(repo = ?repo_path, "running git command: {:?}", cmd);

        let out = cmd.output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                GitCliError::NotAvailable
            } else {
                GitCliError::CommandFailed(e.to_string())
            }
        })?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            let stdout = String::from_utf8_lossy(&out.stdout).trim().to_string();
            let combined = match (stderr.is_empty(), stdout.is_empty()) {
                (true, true) => "command failed with no output".to_string(),
                (false, true) => stderr,
                (true, false) => stdout,
                (false, false) => format!("{stderr}\n{stdout}"),
            };
            return Err(GitCliError::CommandFailed(combined));
        }
        Ok(String::from_utf8_lossy(&out.stdout).to_string())
    }

    /// True when `path` is inside a git working tree (a plain directory, a
    /// repo root, or a linked worktree).
    pub fn is_git_repo(&self, path: &Path) -> bool {
        self.git(path, ["rev-parse", "--is-inside-work-tree"])
            .map(|out| out.trim() == "true")
            .unwrap_or(false)
    }

    // ----- worktrees and branches -----

    /// `git worktree add [-b <branch>] <path> <commit-ish>`. With
    /// `create_branch`, the branch is created at `start_point`; without it,
    /// the existing branch is checked out into the new worktree.
    pub fn worktree_add(
        &self,
        repo_path: &Path,
        worktree_path: &Path,
        branch: &str,
        start_point: Option<&str>,
    ) -> Result<(), GitCliError> {
        let mut args: Vec<OsString> = vec!["worktree".into(), "add".into()];
        match start_point {
            Some(start) => {
                args.push("-b".into());
                args.push(branch.into());
                args.push(worktree_path.as_os_str().into());
                args.push(start.into());
            }
            None => {
                args.push(worktree_path.as_os_str().into());
                args.push(branch.into());
            }
        }
        self.git(repo_path, args)?;
        Ok(())
    }

    pub fn worktree_remove(
        &self,
        repo_path: &Path,
        worktree_path: &Path,
        force: bool,
    ) -> Result<(), GitCliError> {
        let mut args: Vec<OsString> = vec!["worktree".into(), "remove".into()];
        if force {
            args.push("--force".into());
        }
        args.push(worktree_path.as_os_str().into());
        self.git(repo_path, args)?;
        Ok(())
    }

    /// Drop stale worktree metadata (worktrees whose directories are gone).
    pub fn worktree_prune(&self, repo_path: &Path) -> Result<(), GitCliError> {
        self.git(repo_path, ["worktree", "prune"])?;
        Ok(())
    }

    pub fn branch_delete(&self, repo_path: &Path, branch: &str) -> Result<(), GitCliError> {
        self.git(repo_path, ["branch", "-D", branch])?;
        Ok(())
    }

    pub fn current_branch(&self, repo_path: &Path) -> Result<String, GitCliError> {
        Ok(self
            .git(repo_path, ["symbolic-ref", "--short", "HEAD"])?
            .trim()
            .to_string())
    }

    /// Branch the remote HEAD points at, e.g. `main` from
    /// `refs/remotes/origin/HEAD -> refs/remotes/origin/main`.
    pub fn remote_head_branch(&self, repo_path: &Path) -> Result<Option<String>, GitCliError> {
        match self.git(repo_path, ["symbolic-ref", "refs/remotes/origin/HEAD"]) {
            Ok(full) => Ok(full
                .trim()
                .strip_prefix("refs/remotes/origin/")
                .map(|b| b.to_string())),
            Err(GitCliError::CommandFailed(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    // ----- queries -----

    pub fn rev_parse(&self, repo_path: &Path, refname: &str) -> Result<String, GitCliError> {
        Ok(self.git(repo_path, ["rev-parse", refname])?.trim().to_string())
    }

    pub fn merge_base(&self, repo_path: &Path, a: &str, b: &str) -> Result<String, GitCliError> {
        Ok(self.git(repo_path, ["merge-base", a, b])?.trim().to_string())
    }

    /// `git rev-list --count <range>`.
    pub fn rev_list_count(&self, repo_path: &Path, range: &str) -> Result<u64, GitCliError> {
        let out = self.git(repo_path, ["rev-list", "--count", range])?;
        out.trim()
            .parse::<u64>()
            .map_err(|e| GitCliError::CommandFailed(format!("unparseable rev-list count: {e}")))
    }

    pub fn merge_commit_count(&self, repo_path: &Path, refname: &str) -> Result<u64, GitCliError> {
        let out = self.git(repo_path, ["rev-list", "--merges", "--count", refname])?;
        out.trim()
            .parse::<u64>()
            .map_err(|e| GitCliError::CommandFailed(format!("unparseable rev-list count: {e}")))
    }

    // ----- staging and committing -----

    pub fn status_clean(&self, worktree_path: &Path) -> Result<bool, GitCliError> {
        let out = self.git(
            worktree_path,
            ["--no-optional-locks", "status", "--porcelain"],
        )?;
        Ok(out.trim().is_empty())
    }

    pub fn add_all(&self, worktree_path: &Path) -> Result<(), GitCliError> {
        self.git(worktree_path, ["add", "-A"])?;
        Ok(())
    }

    pub fn has_staged_changes(&self, worktree_path: &Path) -> Result<bool, GitCliError> {
        let out = Command::new("git")
            .arg("-C")
            .arg(worktree_path)
            .args(["diff", "--cached", "--quiet"])
            .output()
            .map_err(|e| GitCliError::CommandFailed(e.to_string()))?;
        match out.status.code() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(GitCliError::CommandFailed(
                String::from_utf8_lossy(&out.stderr).trim().to_string(),
            )),
        }
    }

    pub fn diff_cached_stat(&self, worktree_path: &Path) -> Result<String, GitCliError> {
        self.git(worktree_path, ["diff", "--cached", "--stat"])
    }

    /// Subjects of the last `n` commits, for commit-message style context.
    /// Empty on a repo with no history.
    pub fn recent_subjects(&self, repo_path: &Path, n: u32) -> String {
        let count_arg = format!("-{n}");
        self.git(repo_path, ["log", "--format=%s", count_arg.as_str()])
            .unwrap_or_default()
    }

    /// Commit with an explicit identity so identities configured inside the
    /// sandbox never leak into host commits.
    pub fn commit_with_identity(
        &self,
        worktree_path: &Path,
        message: &str,
        name: &str,
        email: &str,
    ) -> Result<(), GitCliError> {
        let name_arg = format!("user.name={name}");
        let email_arg = format!("user.email={email}");
        self.git(
            worktree_path,
            [
                "-c",
                name_arg.as_str(),
                "-c",
                email_arg.as_str(),
                "commit",
                "-m",
                message,
            ],
        )?;
        Ok(())
    }

    pub fn config_global(&self, repo_path: &Path, key: &str) -> Option<String> {
        self.git(repo_path, ["config", "--global", key])
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// `git diff <from>..<to>` between two commits.
    pub fn diff_range(&self, repo_path: &Path, from: &str, to: &str) -> Result<String, GitCliError> {
        let range = format!("{from}..{to}");
        self.git(repo_path, ["diff", range.as_str()])
    }

    /// Diff of the working tree (staged and unstaged) against `base`.
    pub fn diff_against(&self, worktree_path: &Path, base: &str) -> Result<String, GitCliError> {
        self.git(worktree_path, ["diff", base])
    }

    // ----- rebase and merge -----

    /// Rebase the worktree's branch onto `onto`. Conflicts are classified
    /// so the caller can hand them to the resolver.
    pub fn rebase(&self, worktree_path: &Path, onto: &str) -> Result<(), GitCliError> {
        if self.is_rebase_in_progress(worktree_path)? {
            return Err(GitCliError::RebaseInProgress);
        }
        match self.git(worktree_path, ["rebase", onto]) {
            Ok(_) => Ok(()),
            Err(GitCliError::CommandFailed(msg)) => {
                let lower = msg.to_ascii_lowercase();
                if lower.contains("conflict") || lower.contains("could not apply") {
                    Err(GitCliError::Conflict(msg))
                } else {
                    Err(GitCliError::CommandFailed(msg))
                }
            }
            Err(e) => Err(e),
        }
    }

    pub fn is_rebase_in_progress(&self, worktree_path: &Path) -> Result<bool, GitCliError> {
        let rebase_merge = self.git(worktree_path, ["rev-parse", "--git-path", "rebase-merge"])?;
        let rebase_apply = self.git(worktree_path, ["rev-parse", "--git-path", "rebase-apply"])?;
        Ok(Path::new(rebase_merge.trim()).exists() || Path::new(rebase_apply.trim()).exists())
    }

    /// Fast-forward merge `branch` into the currently checked-out branch of
    /// `repo_path`. Never creates a merge commit.
    pub fn merge_ff_only(&self, repo_path: &Path, branch: &str) -> Result<(), GitCliError> {
        self.git(repo_path, ["merge", "--ff-only", branch])?;
        Ok(())
    }

    // ----- stash -----

    /// Stash any dirty state (including untracked files). Returns whether
    /// anything was stashed.
    pub fn stash_push(&self, worktree_path: &Path) -> Result<bool, GitCliError> {
        if self.status_clean(worktree_path)? {
            return Ok(false);
        }
        self.git(worktree_path, ["stash", "push", "--include-untracked"])?;
        Ok(true)
    }

    pub fn stash_pop(&self, worktree_path: &Path) -> Result<(), GitCliError> {
        self.git(worktree_path, ["stash", "pop"])?;
        Ok(())
    }
}
