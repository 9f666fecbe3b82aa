use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use utils::text::task_branch;
use uuid::Uuid;

pub const DEFAULT_TIMEOUT_MINUTES: u32 = 5;
pub const MAX_TIMEOUT_MINUTES: u32 = 1440;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, Default,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Backlog,
    InProgress,
    Waiting,
    Committing,
    Done,
    Failed,
    Cancelled,
    Archived,
}

impl TaskStatus {
    /// States a task can be retried from (back to backlog).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Waiting
        )
    }

    /// States a task can be cancelled from.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            TaskStatus::Backlog | TaskStatus::InProgress | TaskStatus::Waiting | TaskStatus::Failed
        )
    }

    /// States in which the live log is the thing to tail.
    pub fn is_running(&self) -> bool {
        matches!(self, TaskStatus::InProgress | TaskStatus::Committing)
    }
}

/// Running token/cost totals across all of a task's turns. Monotonically
/// non-decreasing over the task's life.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cost: f64,
}

impl TaskUsage {
    pub fn accumulate(&mut self, delta: &TaskUsage) {
        self.input_tokens += delta.input_tokens;
        self.output_tokens += delta.output_tokens;
        self.cache_read_tokens += delta.cache_read_tokens;
        self.cache_creation_tokens += delta.cache_creation_tokens;
        self.cost += delta.cost;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub prompt: String,
    #[serde(default)]
    pub prompt_history: Vec<String>,
    #[serde(default)]
    pub title: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub fresh_start: bool,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub stop_reason: String,
    #[serde(default)]
    pub turns: u32,
    pub timeout_minutes: u32,
    #[serde(default)]
    pub usage: TaskUsage,
    /// Workspace path -> per-task worktree path. Empty when the task never
    /// started on a git workspace or its worktrees were cleaned up.
    #[serde(default)]
    pub worktree_paths: BTreeMap<String, String>,
    #[serde(default)]
    pub branch_name: String,
    /// Workspace path -> merged HEAD, captured by the commit pipeline so
    /// diffs can be reconstructed after the worktree is gone.
    #[serde(default)]
    pub commit_hashes: BTreeMap<String, String>,
    /// Workspace path -> default-branch HEAD at merge time; present even
    /// when nothing merged, to tell "no change" from "worktree gone".
    #[serde(default)]
    pub base_commit_hashes: BTreeMap<String, String>,
    pub position: i64,
    #[serde(default)]
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(prompt: String, timeout_minutes: Option<u32>, position: i64) -> Self {
        let id = Uuid::new_v4();
        let now = Utc::now();
        Task {
            branch_name: task_branch(&id),
            id,
            prompt,
            prompt_history: Vec::new(),
            title: String::new(),
            status: TaskStatus::Backlog,
            session_id: String::new(),
            fresh_start: false,
            result: String::new(),
            stop_reason: String::new(),
            turns: 0,
            timeout_minutes: clamp_timeout(timeout_minutes),
            usage: TaskUsage::default(),
            worktree_paths: BTreeMap::new(),
            commit_hashes: BTreeMap::new(),
            base_commit_hashes: BTreeMap::new(),
            position,
            archived: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Clamp to [1, 1440]; zero and absent both fall back to the default.
pub fn clamp_timeout(minutes: Option<u32>) -> u32 {
    match minutes {
        None | Some(0) => DEFAULT_TIMEOUT_MINUTES,
        Some(m) => m.min(MAX_TIMEOUT_MINUTES),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTask {
    pub prompt: String,
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
}

/// Fields editable only while a task sits in the backlog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateBacklog {
    pub prompt: Option<String>,
    pub timeout_minutes: Option<u32>,
    pub fresh_start: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_form_is_snake_case() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        assert_eq!(TaskStatus::InProgress.to_string(), "in_progress");
        assert_eq!(
            "committing".parse::<TaskStatus>().unwrap(),
            TaskStatus::Committing
        );
    }

    #[test]
    fn test_clamp_timeout() {
        assert_eq!(clamp_timeout(None), 5);
        assert_eq!(clamp_timeout(Some(0)), 5);
        assert_eq!(clamp_timeout(Some(1)), 1);
        assert_eq!(clamp_timeout(Some(90)), 90);
        assert_eq!(clamp_timeout(Some(100_000)), 1440);
    }

    #[test]
    fn test_branch_name_uses_first_eight_of_id() {
        let task = Task::new("hi".into(), None, 0);
        assert!(task.branch_name.starts_with("task/"));
        assert_eq!(task.branch_name.len(), "task/".len() + 8);
        assert!(task.id.simple().to_string().starts_with(&task.branch_name["task/".len()..]));
    }

    #[test]
    fn test_usage_accumulate() {
        let mut usage = TaskUsage::default();
        usage.accumulate(&TaskUsage {
            input_tokens: 10,
            output_tokens: 5,
            cache_read_tokens: 2,
            cache_creation_tokens: 1,
            cost: 0.25,
        });
        usage.accumulate(&TaskUsage {
            input_tokens: 1,
            ..Default::default()
        });
        assert_eq!(usage.input_tokens, 11);
        assert_eq!(usage.output_tokens, 5);
        assert!((usage.cost - 0.25).abs() < f64::EPSILON);
    }
}
