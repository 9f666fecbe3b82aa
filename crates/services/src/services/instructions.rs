//! Per-workspace instruction files. The file lives at the workspace root
//! and is mounted read-only into the sandbox at a fixed guest path.

use std::{fs, io, path::PathBuf};

use store::StoreError;

pub const INSTRUCTIONS_FILENAME: &str = "WALLFACER.md";
pub const MAX_INSTRUCTIONS_BYTES: usize = 512 * 1024;

#[derive(Clone)]
pub struct InstructionFiles {
    workspaces: Vec<PathBuf>,
}

impl InstructionFiles {
    pub fn new(workspaces: Vec<PathBuf>) -> Self {
        InstructionFiles { workspaces }
    }

    /// Resolve a workspace by its basename.
    pub fn resolve(&self, workspace_name: &str) -> Option<PathBuf> {
        self.workspaces
            .iter()
            .find(|ws| {
                ws.file_name()
                    .is_some_and(|n| n.to_string_lossy() == workspace_name)
            })
            .map(|ws| ws.join(INSTRUCTIONS_FILENAME))
    }

    /// The instruction file the invoker mounts: the first workspace's file,
    /// when it exists.
    pub fn mount_file(&self) -> Option<PathBuf> {
        self.workspaces
            .iter()
            .map(|ws| ws.join(INSTRUCTIONS_FILENAME))
            .find(|p| p.is_file())
    }

    pub fn read(&self, workspace_name: &str) -> Result<String, StoreError> {
        let path = self
            .resolve(workspace_name)
            .ok_or_else(|| StoreError::InvalidArgument(format!("unknown workspace: {workspace_name}")))?;
        match fs::read_to_string(&path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write(&self, workspace_name: &str, content: &str) -> Result<(), StoreError> {
        if content.len() > MAX_INSTRUCTIONS_BYTES {
            return Err(StoreError::InvalidArgument(format!(
                "instruction file exceeds {MAX_INSTRUCTIONS_BYTES} bytes"
            )));
        }
        let path = self
            .resolve(workspace_name)
            .ok_or_else(|| StoreError::InvalidArgument(format!("unknown workspace: {workspace_name}")))?;
        utils::fs::write_atomic(&path, content.as_bytes())?;
        Ok(())
    }
}
