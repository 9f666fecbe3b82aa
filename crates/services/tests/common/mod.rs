#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use git::{GitCli, WorktreeManager};
use sandbox::{AgentInvoker, AgentResult, RunRequest, SandboxError, TurnOutput};
use services::services::{
    commit::CommitPipeline, instructions::InstructionFiles, lifecycle::Lifecycle, runner::Runner,
};
use store::{TaskStore, models::TaskStatus};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One scripted reply from the fake agent.
pub enum ScriptedTurn {
    Ok(AgentResult),
    EmptyOutput,
    ExecError(i32),
    /// Block until the runner's cancellation token fires, then report a
    /// terminated container.
    WaitForCancel,
}

impl ScriptedTurn {
    pub fn end_turn() -> Self {
        ScriptedTurn::Ok(AgentResult {
            kind: "result".into(),
            result: "finished the work".into(),
            session_id: "sess-1".into(),
            stop_reason: "end_turn".into(),
            ..Default::default()
        })
    }

    pub fn stop_reason(reason: &str) -> Self {
        ScriptedTurn::Ok(AgentResult {
            kind: "result".into(),
            result: format!("stopped with {reason:?}"),
            session_id: "sess-1".into(),
            stop_reason: reason.into(),
            ..Default::default()
        })
    }

    async fn into_output(self, cancel: &CancellationToken) -> TurnOutput {
        match self {
            ScriptedTurn::Ok(result) => TurnOutput {
                stdout: serde_json::to_string(&result).unwrap(),
                stderr: String::new(),
                result: Ok(result),
            },
            ScriptedTurn::EmptyOutput => TurnOutput {
                stdout: String::new(),
                stderr: String::new(),
                result: Err(SandboxError::EmptyOutput),
            },
            ScriptedTurn::ExecError(code) => TurnOutput {
                stdout: String::new(),
                stderr: "agent crashed".into(),
                result: Err(SandboxError::Exec {
                    code,
                    detail: "agent crashed".into(),
                }),
            },
            ScriptedTurn::WaitForCancel => {
                cancel.cancelled().await;
                TurnOutput {
                    stdout: String::new(),
                    stderr: String::new(),
                    result: Err(SandboxError::Terminated),
                }
            }
        }
    }
}

type ResolverHook = Box<dyn Fn(&RunRequest) + Send + Sync>;

/// Scripted in-memory stand-in for the sandboxed agent CLI. Main turns pop
/// from a queue; auxiliary runs (title, commit message, conflict resolver)
/// answer canned replies, with an optional hook that lets conflict tests
/// actually resolve the rebase on disk.
#[derive(Default)]
pub struct MockInvoker {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    aux_turns: Mutex<HashMap<String, VecDeque<ScriptedTurn>>>,
    pub requests: Mutex<Vec<RunRequest>>,
    pub killed: Mutex<Vec<Uuid>>,
    pub live_containers: Mutex<Vec<String>>,
    pub resolver_hook: Mutex<Option<ResolverHook>>,
}

impl MockInvoker {
    pub fn push_turn(&self, turn: ScriptedTurn) {
        self.turns.lock().unwrap().push_back(turn);
    }

    pub fn push_aux(&self, suffix: &str, turn: ScriptedTurn) {
        self.aux_turns
            .lock()
            .unwrap()
            .entry(suffix.to_string())
            .or_default()
            .push_back(turn);
    }

    pub fn set_resolver_hook(&self, hook: ResolverHook) {
        *self.resolver_hook.lock().unwrap() = Some(hook);
    }

    pub fn main_requests(&self) -> Vec<RunRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.container_suffix.is_none())
            .cloned()
            .collect()
    }

    fn default_aux_reply(suffix: &str) -> ScriptedTurn {
        let text = match suffix {
            "title" => "Scripted Task Title",
            "msg" => "scripted commit message",
            _ => "ok",
        };
        ScriptedTurn::Ok(AgentResult {
            kind: "result".into(),
            result: text.into(),
            stop_reason: "end_turn".into(),
            ..Default::default()
        })
    }
}

#[async_trait]
impl AgentInvoker for MockInvoker {
    async fn run_turn(
        &self,
        req: &RunRequest,
        _live_log: Option<&Path>,
        cancel: &CancellationToken,
    ) -> TurnOutput {
        self.requests.lock().unwrap().push(req.clone());

        let scripted = match req.container_suffix.as_deref() {
            None => self
                .turns
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(ScriptedTurn::ExecError(97)),
            Some(suffix) => {
                if suffix == "fix"
                    && let Some(hook) = self.resolver_hook.lock().unwrap().as_ref()
                {
                    hook(req);
                }
                self.aux_turns
                    .lock()
                    .unwrap()
                    .get_mut(suffix)
                    .and_then(|q| q.pop_front())
                    .unwrap_or_else(|| Self::default_aux_reply(suffix))
            }
        };
        scripted.into_output(cancel).await
    }

    async fn kill_container(&self, task_id: Uuid) {
        self.killed.lock().unwrap().push(task_id);
    }

    async fn list_live_containers(&self) -> Result<Vec<String>, SandboxError> {
        Ok(self.live_containers.lock().unwrap().clone())
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub workspace: PathBuf,
    pub store: Arc<TaskStore>,
    pub invoker: Arc<MockInvoker>,
    pub worktrees: WorktreeManager,
    pub lifecycle: Lifecycle,
}

pub fn init_repo(dir: &Path) -> GitCli {
    let cli = GitCli::new();
    std::fs::create_dir_all(dir).unwrap();
    cli.git(dir, ["init", "-b", "main"]).unwrap();
    cli.git(dir, ["config", "user.email", "test@example.com"]).unwrap();
    cli.git(dir, ["config", "user.name", "Test"]).unwrap();
    std::fs::write(dir.join("file.txt"), "base\n").unwrap();
    cli.git(dir, ["add", "-A"]).unwrap();
    cli.git(dir, ["commit", "-m", "initial"]).unwrap();
    cli
}

/// Harness whose single workspace is a real git repository in a tempdir.
pub fn git_harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let workspace = dir.path().join("repo");
    init_repo(&workspace);
    build_harness(dir, workspace)
}

/// Harness whose single workspace is a plain directory (no git).
pub fn plain_harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let workspace = dir.path().join("plain");
    std::fs::create_dir_all(&workspace).unwrap();
    build_harness(dir, workspace)
}

fn build_harness(dir: TempDir, workspace: PathBuf) -> Harness {
    let store = Arc::new(TaskStore::open(&dir.path().join("data"), &[workspace.clone()]).unwrap());
    let worktrees = WorktreeManager::new(dir.path().join("worktrees"), vec![workspace.clone()]);
    let invoker: Arc<MockInvoker> = Arc::new(MockInvoker::default());
    let agent: Arc<dyn AgentInvoker> = invoker.clone();
    let pipeline = Arc::new(CommitPipeline::new(
        store.clone(),
        worktrees.clone(),
        agent.clone(),
    ));
    let instructions = InstructionFiles::new(vec![workspace.clone()]);
    let runner = Arc::new(Runner::new(
        store.clone(),
        worktrees.clone(),
        agent.clone(),
        pipeline.clone(),
        instructions,
    ));
    let lifecycle = Lifecycle::new(store.clone(), worktrees.clone(), agent, runner, pipeline);
    Harness {
        dir,
        workspace,
        store,
        invoker,
        worktrees,
        lifecycle,
    }
}

pub async fn wait_for_status(store: &TaskStore, id: Uuid, status: TaskStatus) {
    for _ in 0..500 {
        if store.get_task(id).unwrap().status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "task never reached {status}, stuck at {}",
        store.get_task(id).unwrap().status
    );
}
