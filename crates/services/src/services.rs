pub mod commit;
pub mod config;
pub mod diff;
pub mod env_file;
pub mod instructions;
pub mod lifecycle;
pub mod logs;
pub mod recovery;
pub mod runner;

use git::{GitCliError, WorktreeError};
use sandbox::SandboxError;
use store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Worktree(#[from] WorktreeError),
    #[error(transparent)]
    Git(#[from] GitCliError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("task join error: {0}")]
    Join(String),
}
