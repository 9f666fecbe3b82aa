pub mod error;
pub mod routes;

use std::{path::PathBuf, sync::Arc};

use git::WorktreeManager;
use services::services::{config::Config, instructions::InstructionFiles, lifecycle::Lifecycle};
use store::TaskStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<TaskStore>,
    pub lifecycle: Lifecycle,
    pub worktrees: WorktreeManager,
    pub config: Arc<Config>,
    pub instructions: InstructionFiles,
    /// Credentials env file handed to the sandbox; created on demand by
    /// config updates when absent at startup.
    pub env_file: Option<PathBuf>,
}
