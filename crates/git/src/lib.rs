pub mod cli;
pub mod worktree;

pub use cli::{GitCli, GitCliError};
pub use worktree::{WorktreeError, WorktreeManager};
