use std::{
    collections::{BTreeMap, HashMap},
    fs, io,
    path::{Path, PathBuf},
    sync::RwLock,
};

use chrono::Utc;
use thiserror::Error;
use tracing::warn;
use utils::fingerprint::workspace_fingerprint;
use uuid::Uuid;

use crate::{
    bus::{NotifyBus, Subscription},
    models::{
        CreateTask, EventKind, Task, TaskEvent, TaskStatus, TaskUsage, UpdateBacklog,
        task::clamp_timeout,
    },
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(Uuid),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

struct Inner {
    tasks: HashMap<Uuid, Task>,
    events: HashMap<Uuid, Vec<TaskEvent>>,
    next_seq: HashMap<Uuid, u64>,
}

/// Durable per-task records plus append-only event logs, one directory per
/// task under `<data_root>/<workspace-fingerprint>/`. The filesystem is
/// authoritative; the in-memory maps are a cache rebuilt at boot. A single
/// reader-writer lock guards all three maps, and every write to disk goes
/// through temp-file + rename while the lock is held.
pub struct TaskStore {
    root: PathBuf,
    inner: RwLock<Inner>,
    bus: NotifyBus,
}

impl TaskStore {
    /// Scan `<data_root>/<fingerprint>` and rebuild the in-memory state.
    /// Task directories without a parseable `task.json` are skipped with a
    /// warning; so are unparseable event files. Never fails on bad content.
    pub fn open(data_root: &Path, workspaces: &[PathBuf]) -> Result<Self, StoreError> {
        let root = data_root.join(workspace_fingerprint(workspaces));
        utils::fs::ensure_dir(&root)?;

        let mut tasks = HashMap::new();
        let mut events: HashMap<Uuid, Vec<TaskEvent>> = HashMap::new();
        let mut next_seq = HashMap::new();

        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Ok(id) = entry.file_name().to_string_lossy().parse::<Uuid>() else {
                continue;
            };

            let task_file = entry.path().join("task.json");
            let task: Task = match fs::read(&task_file)
                .map_err(StoreError::from)
                .and_then(|bytes| serde_json::from_slice(&bytes).map_err(StoreError::from))
            {
                Ok(task) => task,
                Err(e) => {
                    warn!("skipping task dir {}: {e}", entry.path().display());
                    continue;
                }
            };

            let mut task_events = Vec::new();
            let traces_dir = entry.path().join("traces");
            if traces_dir.is_dir() {
                let mut files: Vec<PathBuf> = fs::read_dir(&traces_dir)?
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                    .collect();
                files.sort();
                for file in files {
                    match fs::read(&file)
                        .map_err(StoreError::from)
                        .and_then(|b| serde_json::from_slice::<TaskEvent>(&b).map_err(StoreError::from))
                    {
                        Ok(event) => task_events.push(event),
                        Err(e) => warn!("skipping event file {}: {e}", file.display()),
                    }
                }
            }

            let seq = task_events.last().map(|e| e.sequence + 1).unwrap_or(1);
            next_seq.insert(id, seq);
            events.insert(id, task_events);
            tasks.insert(id, task);
        }

        Ok(TaskStore {
            root,
            inner: RwLock::new(Inner {
                tasks,
                events,
                next_seq,
            }),
            bus: NotifyBus::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn task_dir(&self, id: Uuid) -> PathBuf {
        self.root.join(id.to_string())
    }

    pub fn live_log_path(&self, id: Uuid) -> PathBuf {
        self.task_dir(id).join("live.log")
    }

    pub fn outputs_dir(&self, id: Uuid) -> PathBuf {
        self.task_dir(id).join("outputs")
    }

    // ----- subscriptions -----

    pub fn subscribe(&self) -> Option<Subscription> {
        self.bus.subscribe()
    }

    pub fn unsubscribe(&self, id: u64) {
        self.bus.unsubscribe(id);
    }

    // ----- task CRUD -----

    pub fn create_task(&self, req: CreateTask) -> Result<Task, StoreError> {
        if req.prompt.trim().is_empty() {
            return Err(StoreError::InvalidArgument("prompt must not be empty".into()));
        }
        let mut inner = self.inner.write().unwrap();
        let position = inner
            .tasks
            .values()
            .map(|t| t.position)
            .max()
            .unwrap_or(-1)
            + 1;
        let task = Task::new(req.prompt, req.timeout_minutes, position);

        let dir = self.task_dir(task.id);
        utils::fs::ensure_dir(&dir.join("traces"))?;
        utils::fs::ensure_dir(&dir.join("outputs"))?;
        self.persist_task(&task)?;

        inner.next_seq.insert(task.id, 1);
        inner.events.insert(task.id, Vec::new());
        inner.tasks.insert(task.id, task.clone());
        self.bus.notify_all();
        Ok(task)
    }

    pub fn get_task(&self, id: Uuid) -> Result<Task, StoreError> {
        let inner = self.inner.read().unwrap();
        inner.tasks.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    /// Defensive copies, ordered by column position then creation time.
    pub fn list_tasks(&self, include_archived: bool) -> Vec<Task> {
        let inner = self.inner.read().unwrap();
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| include_archived || !t.archived)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| {
            a.position
                .cmp(&b.position)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        tasks
    }

    pub fn delete_task(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        if inner.tasks.remove(&id).is_none() {
            return Err(StoreError::NotFound(id));
        }
        inner.events.remove(&id);
        inner.next_seq.remove(&id);
        if let Err(e) = fs::remove_dir_all(self.task_dir(id)) {
            warn!("failed to remove task dir for {id}: {e}");
        }
        self.bus.notify_all();
        Ok(())
    }

    // ----- status transitions -----

    /// Write a status change plus its `state_change` event under a single
    /// lock hold. Writing the current status again is a no-op.
    pub fn update_status(&self, id: Uuid, to: TaskStatus) -> Result<Task, StoreError> {
        let mut inner = self.inner.write().unwrap();
        self.transition_locked(&mut inner, id, to)
    }

    /// Like `update_status`, but yields ownership to the cancel path: when
    /// the task has meanwhile been cancelled, nothing is written and `false`
    /// is returned.
    pub fn update_status_unless_cancelled(
        &self,
        id: Uuid,
        to: TaskStatus,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().unwrap();
        let task = inner.tasks.get(&id).ok_or(StoreError::NotFound(id))?;
        if task.status == TaskStatus::Cancelled {
            return Ok(false);
        }
        self.transition_locked(&mut inner, id, to)?;
        Ok(true)
    }

    fn transition_locked(
        &self,
        inner: &mut Inner,
        id: Uuid,
        to: TaskStatus,
    ) -> Result<Task, StoreError> {
        let task = inner.tasks.get(&id).ok_or(StoreError::NotFound(id))?;
        let from = task.status;
        if from == to {
            return Ok(task.clone());
        }
        let mut updated = task.clone();
        updated.status = to;
        updated.updated_at = Utc::now();
        self.persist_task(&updated)?;
        inner.tasks.insert(id, updated.clone());
        self.append_event_locked(
            inner,
            id,
            EventKind::StateChange,
            TaskEvent::state_change_payload(from, to),
        )?;
        self.bus.notify_all();
        Ok(updated)
    }

    /// Terminal failure: exactly one human-readable `error` event followed
    /// by exactly one `state_change` to `failed`, under a single lock hold.
    pub fn fail_with_error(&self, id: Uuid, message: &str) -> Result<Task, StoreError> {
        let mut inner = self.inner.write().unwrap();
        self.append_event_locked(&mut inner, id, EventKind::Error, TaskEvent::error_payload(message))?;
        self.transition_locked(&mut inner, id, TaskStatus::Failed)
    }

    /// Like `fail_with_error`, but the cancel path keeps ownership: nothing
    /// is written when the task is already cancelled.
    pub fn fail_unless_cancelled(&self, id: Uuid, message: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().unwrap();
        let task = inner.tasks.get(&id).ok_or(StoreError::NotFound(id))?;
        if task.status == TaskStatus::Cancelled {
            return Ok(false);
        }
        self.append_event_locked(&mut inner, id, EventKind::Error, TaskEvent::error_payload(message))?;
        self.transition_locked(&mut inner, id, TaskStatus::Failed)?;
        Ok(true)
    }

    /// Backstop for runner coroutines that exit without recording a
    /// terminal status: only fires while the task still reads as running.
    pub fn fail_if_running(&self, id: Uuid, message: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().unwrap();
        let Some(task) = inner.tasks.get(&id) else {
            return Ok(false);
        };
        if task.status != TaskStatus::InProgress {
            return Ok(false);
        }
        self.append_event_locked(&mut inner, id, EventKind::Error, TaskEvent::error_payload(message))?;
        self.transition_locked(&mut inner, id, TaskStatus::Failed)?;
        Ok(true)
    }

    // ----- field updates -----

    fn mutate<F>(&self, id: Uuid, f: F) -> Result<Task, StoreError>
    where
        F: FnOnce(&mut Task) -> Result<(), StoreError>,
    {
        let mut inner = self.inner.write().unwrap();
        let task = inner.tasks.get(&id).ok_or(StoreError::NotFound(id))?;
        let mut updated = task.clone();
        f(&mut updated)?;
        updated.updated_at = Utc::now();
        self.persist_task(&updated)?;
        inner.tasks.insert(id, updated.clone());
        self.bus.notify_all();
        Ok(updated)
    }

    pub fn update_title(&self, id: Uuid, title: &str) -> Result<Task, StoreError> {
        self.mutate(id, |t| {
            t.title = title.to_string();
            Ok(())
        })
    }

    /// Record the latest agent result. A non-empty session id from the agent
    /// overwrites the stored one.
    pub fn update_result(
        &self,
        id: Uuid,
        result: &str,
        stop_reason: &str,
        session_id: Option<&str>,
    ) -> Result<Task, StoreError> {
        self.mutate(id, |t| {
            t.result = result.to_string();
            t.stop_reason = stop_reason.to_string();
            if let Some(session) = session_id.filter(|s| !s.is_empty()) {
                t.session_id = session.to_string();
            }
            Ok(())
        })
    }

    /// Keep a session id salvaged from a failed run so the task can be
    /// resumed later.
    pub fn update_session(&self, id: Uuid, session_id: &str) -> Result<Task, StoreError> {
        self.mutate(id, |t| {
            if !session_id.is_empty() {
                t.session_id = session_id.to_string();
            }
            Ok(())
        })
    }

    pub fn accumulate_usage(&self, id: Uuid, delta: &TaskUsage) -> Result<Task, StoreError> {
        self.mutate(id, |t| {
            t.usage.accumulate(delta);
            Ok(())
        })
    }

    pub fn increment_turns(&self, id: Uuid) -> Result<u32, StoreError> {
        let task = self.mutate(id, |t| {
            t.turns += 1;
            Ok(())
        })?;
        Ok(task.turns)
    }

    pub fn update_position(&self, id: Uuid, position: i64) -> Result<Task, StoreError> {
        self.mutate(id, |t| {
            t.position = position;
            Ok(())
        })
    }

    /// Prompt, timeout and fresh-start are editable only while the task sits
    /// in the backlog. A superseded prompt is pushed onto the history.
    pub fn update_backlog(&self, id: Uuid, update: UpdateBacklog) -> Result<Task, StoreError> {
        self.mutate(id, |t| {
            if t.status != TaskStatus::Backlog {
                return Err(StoreError::InvalidArgument(format!(
                    "task is {}, only backlog tasks are editable",
                    t.status
                )));
            }
            if let Some(prompt) = update.prompt {
                if prompt.trim().is_empty() {
                    return Err(StoreError::InvalidArgument("prompt must not be empty".into()));
                }
                if prompt != t.prompt {
                    let old = std::mem::replace(&mut t.prompt, prompt);
                    t.prompt_history.push(old);
                }
            }
            if let Some(minutes) = update.timeout_minutes {
                t.timeout_minutes = clamp_timeout(Some(minutes));
            }
            if let Some(fresh) = update.fresh_start {
                t.fresh_start = fresh;
            }
            Ok(())
        })
    }

    /// Move a task back to the backlog for another run. Worktree and commit
    /// bookkeeping is cleared (the lifecycle controller removes the actual
    /// worktrees first); the session survives unless this is a fresh start.
    pub fn reset_for_retry(&self, id: Uuid, fresh_start: bool) -> Result<Task, StoreError> {
        let mut inner = self.inner.write().unwrap();
        {
            let task = inner.tasks.get(&id).ok_or(StoreError::NotFound(id))?;
            if !task.status.is_retryable() {
                return Err(StoreError::InvalidArgument(format!(
                    "cannot retry a task in status {}",
                    task.status
                )));
            }
        }
        let task = inner.tasks.get(&id).unwrap();
        let mut updated = task.clone();
        updated.result = String::new();
        updated.stop_reason = String::new();
        updated.turns = 0;
        updated.worktree_paths = BTreeMap::new();
        updated.commit_hashes = BTreeMap::new();
        updated.base_commit_hashes = BTreeMap::new();
        updated.fresh_start = fresh_start;
        if fresh_start {
            updated.session_id = String::new();
        }
        updated.updated_at = Utc::now();
        self.persist_task(&updated)?;
        inner.tasks.insert(id, updated);
        self.transition_locked(&mut inner, id, TaskStatus::Backlog)
    }

    pub fn set_archived(&self, id: Uuid, archived: bool) -> Result<Task, StoreError> {
        self.mutate(id, |t| {
            if archived && !matches!(t.status, TaskStatus::Done | TaskStatus::Cancelled) {
                return Err(StoreError::InvalidArgument(format!(
                    "only done or cancelled tasks can be archived, task is {}",
                    t.status
                )));
            }
            t.archived = archived;
            Ok(())
        })
    }

    /// Resume a failed task in its existing agent session.
    pub fn resume_task(&self, id: Uuid) -> Result<Task, StoreError> {
        let mut inner = self.inner.write().unwrap();
        {
            let task = inner.tasks.get(&id).ok_or(StoreError::NotFound(id))?;
            if task.status != TaskStatus::Failed {
                return Err(StoreError::InvalidArgument(format!(
                    "only failed tasks can be resumed, task is {}",
                    task.status
                )));
            }
            if task.session_id.is_empty() {
                return Err(StoreError::InvalidArgument(
                    "task has no session to resume".into(),
                ));
            }
        }
        self.transition_locked(&mut inner, id, TaskStatus::InProgress)
    }

    pub fn update_worktrees(
        &self,
        id: Uuid,
        worktree_paths: BTreeMap<String, String>,
        branch_name: &str,
    ) -> Result<Task, StoreError> {
        self.mutate(id, |t| {
            t.worktree_paths = worktree_paths;
            t.branch_name = branch_name.to_string();
            Ok(())
        })
    }

    pub fn clear_worktrees(&self, id: Uuid) -> Result<Task, StoreError> {
        self.mutate(id, |t| {
            t.worktree_paths = BTreeMap::new();
            Ok(())
        })
    }

    pub fn update_commit_hashes(
        &self,
        id: Uuid,
        hashes: BTreeMap<String, String>,
    ) -> Result<Task, StoreError> {
        self.mutate(id, |t| {
            t.commit_hashes = hashes;
            Ok(())
        })
    }

    pub fn update_base_commit_hashes(
        &self,
        id: Uuid,
        hashes: BTreeMap<String, String>,
    ) -> Result<Task, StoreError> {
        self.mutate(id, |t| {
            t.base_commit_hashes = hashes;
            Ok(())
        })
    }

    // ----- events -----

    pub fn insert_event(
        &self,
        id: Uuid,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> Result<TaskEvent, StoreError> {
        let mut inner = self.inner.write().unwrap();
        if !inner.tasks.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        let event = self.append_event_locked(&mut inner, id, kind, payload)?;
        self.bus.notify_all();
        Ok(event)
    }

    fn append_event_locked(
        &self,
        inner: &mut Inner,
        id: Uuid,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> Result<TaskEvent, StoreError> {
        let seq = *inner.next_seq.get(&id).unwrap_or(&1);
        let event = TaskEvent {
            sequence: seq,
            task_id: id,
            kind,
            payload,
            timestamp: Utc::now(),
        };
        let traces = self.task_dir(id).join("traces");
        utils::fs::ensure_dir(&traces)?;
        utils::fs::write_json_atomic(&traces.join(format!("{seq:04}.json")), &event)?;
        inner.next_seq.insert(id, seq + 1);
        inner.events.entry(id).or_default().push(event.clone());
        Ok(event)
    }

    pub fn get_events(&self, id: Uuid) -> Result<Vec<TaskEvent>, StoreError> {
        let inner = self.inner.read().unwrap();
        if !inner.tasks.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        Ok(inner.events.get(&id).cloned().unwrap_or_default())
    }

    // ----- turn outputs and live log -----

    /// Persist the raw agent output of one turn. The stderr file is written
    /// only when there is stderr to keep.
    pub fn save_turn_output(
        &self,
        id: Uuid,
        turn: u32,
        stdout: &str,
        stderr: &str,
    ) -> Result<(), StoreError> {
        let dir = self.outputs_dir(id);
        utils::fs::ensure_dir(&dir)?;
        utils::fs::write_atomic(&dir.join(format!("turn-{turn:04}.json")), stdout.as_bytes())?;
        if !stderr.is_empty() {
            utils::fs::write_atomic(
                &dir.join(format!("turn-{turn:04}.stderr.txt")),
                stderr.as_bytes(),
            )?;
        }
        Ok(())
    }

    /// Saved per-turn artifacts (`turn-*.json` and `turn-*.stderr.txt`) in
    /// filename order.
    pub fn list_turn_outputs(&self, id: Uuid) -> Vec<PathBuf> {
        let dir = self.outputs_dir(id);
        let Ok(entries) = fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("turn-"))
            })
            .collect();
        files.sort();
        files
    }

    pub fn remove_live_log(&self, id: Uuid) {
        let path = self.live_log_path(id);
        if let Err(e) = fs::remove_file(&path)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!("failed to remove live log {}: {e}", path.display());
        }
    }

    fn persist_task(&self, task: &Task) -> Result<(), StoreError> {
        let dir = self.task_dir(task.id);
        utils::fs::ensure_dir(&dir)?;
        utils::fs::write_json_atomic(&dir.join("task.json"), task)?;
        Ok(())
    }
}
