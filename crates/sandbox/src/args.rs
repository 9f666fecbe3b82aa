use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
};

use utils::text::short_id;
use uuid::Uuid;

pub const CONTAINER_PREFIX: &str = "wf-";
pub const GUEST_WORKSPACE_ROOT: &str = "/workspace";
pub const GUEST_INSTRUCTIONS_PATH: &str = "/workspace/AGENTS.md";

/// Everything about the runtime environment that is fixed at startup.
#[derive(Debug, Clone)]
pub struct SandboxProfile {
    /// Container runtime binary, e.g. `docker` or `podman`.
    pub runtime_bin: String,
    pub image: String,
    /// Credentials env file passed through `--env-file`.
    pub env_file: Option<PathBuf>,
    /// Named volume holding persistent agent configuration.
    pub config_volume: String,
    pub guest_config_dir: String,
    pub model: Option<String>,
}

/// One agent invocation. Argument assembly is a pure function of this plus
/// the profile, so it is unit-testable without a container runtime.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub task_id: Uuid,
    /// Distinguishes auxiliary runs (title, commit message, conflict
    /// resolution) from the main turn while keeping the task's name prefix.
    pub container_suffix: Option<String>,
    pub prompt: String,
    pub session_id: Option<String>,
    pub workspaces: Vec<PathBuf>,
    /// Workspace path -> worktree path substituted for the direct mount.
    pub worktree_overrides: BTreeMap<String, String>,
    /// Workspace paths that are git repositories; their `.git` directories
    /// are bind-mounted alongside worktree overrides.
    pub git_workspaces: BTreeSet<String>,
    /// Instruction file mounted read-only at a fixed guest path if present.
    pub instructions_file: Option<PathBuf>,
}

pub fn container_name(task_id: &Uuid, suffix: Option<&str>) -> String {
    match suffix {
        Some(s) => format!("{CONTAINER_PREFIX}{}-{s}", short_id(task_id)),
        None => format!("{CONTAINER_PREFIX}{}", short_id(task_id)),
    }
}

/// True when a container name belongs to this task (main turn or any
/// auxiliary run).
pub fn container_matches_task(name: &str, task_id: &Uuid) -> bool {
    name.starts_with(&format!("{CONTAINER_PREFIX}{}", short_id(task_id)))
}

/// Assemble the full `run` argument list for one invocation.
///
/// Worktree overrides replace the direct workspace mount; for git-backed
/// workspaces the repo's `.git` directory is additionally mounted at the
/// same absolute host path so the worktree's internal host-absolute gitdir
/// reference resolves inside the container.
pub fn build_run_args(profile: &SandboxProfile, req: &RunRequest) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "--network=host".to_string(),
        "--name".to_string(),
        container_name(&req.task_id, req.container_suffix.as_deref()),
    ];

    if let Some(env_file) = &profile.env_file {
        args.push("--env-file".to_string());
        args.push(env_file.to_string_lossy().into_owned());
    }

    args.push("-v".to_string());
    args.push(format!("{}:{}", profile.config_volume, profile.guest_config_dir));

    for workspace in &req.workspaces {
        let key = workspace.to_string_lossy().into_owned();
        let host = req
            .worktree_overrides
            .get(&key)
            .cloned()
            .unwrap_or_else(|| key.clone());
        let basename = workspace
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "workspace".to_string());
        args.push("-v".to_string());
        args.push(format!("{host}:{GUEST_WORKSPACE_ROOT}/{basename}"));

        if req.worktree_overrides.contains_key(&key) && req.git_workspaces.contains(&key) {
            let git_dir = format!("{key}/.git");
            args.push("-v".to_string());
            args.push(format!("{git_dir}:{git_dir}"));
        }
    }

    if let Some(instructions) = &req.instructions_file {
        args.push("-v".to_string());
        args.push(format!(
            "{}:{GUEST_INSTRUCTIONS_PATH}:ro",
            instructions.to_string_lossy()
        ));
    }

    args.push(profile.image.clone());

    args.push("-p".to_string());
    args.push(req.prompt.clone());
    args.push("--verbose".to_string());
    args.push("--output-format".to_string());
    args.push("stream-json".to_string());

    if let Some(model) = &profile.model {
        args.push("--model".to_string());
        args.push(model.clone());
    }
    if let Some(session) = req.session_id.as_deref().filter(|s| !s.is_empty()) {
        args.push("--resume".to_string());
        args.push(session.to_string());
    }

    args
}
