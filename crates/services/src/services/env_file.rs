//! The credentials env file handed to the sandbox through `--env-file`.
//! Written 0600 next to the task data; the only mutable configuration
//! artifact. The update contract: an empty string means "no change" for
//! secrets and "clear" for non-secret fields.

use std::{collections::BTreeMap, fs, io, path::{Path, PathBuf}};

use serde::Deserialize;
use tracing::info;

use super::config::Config;

pub const SANDBOX_ENV_FILE: &str = "sandbox.env";

const KEY_OAUTH_TOKEN: &str = "CLAUDE_CODE_OAUTH_TOKEN";
const KEY_API_KEY: &str = "ANTHROPIC_API_KEY";
const KEY_BASE_URL: &str = "ANTHROPIC_BASE_URL";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvFileUpdate {
    /// Empty string leaves the stored token untouched.
    pub oauth_token: Option<String>,
    /// Empty string leaves the stored key untouched.
    pub api_key: Option<String>,
    /// Empty string clears the override.
    pub api_base_url: Option<String>,
}

pub fn env_file_path(config: &Config) -> PathBuf {
    config.data_dir.join(SANDBOX_ENV_FILE)
}

/// Write the env file from the startup configuration. Returns the path, or
/// `None` when no credential is configured (the sandbox then runs without
/// `--env-file`).
pub fn write_from_config(config: &Config) -> io::Result<Option<PathBuf>> {
    let mut entries = BTreeMap::new();
    if let Some(token) = &config.oauth_token {
        entries.insert(KEY_OAUTH_TOKEN.to_string(), token.clone());
    }
    if let Some(key) = &config.api_key {
        entries.insert(KEY_API_KEY.to_string(), key.clone());
    }
    if let Some(url) = &config.api_base_url {
        entries.insert(KEY_BASE_URL.to_string(), url.clone());
    }
    if entries.is_empty() {
        return Ok(None);
    }
    let path = env_file_path(config);
    utils::fs::ensure_dir(&config.data_dir)?;
    write_entries(&path, &entries)?;
    Ok(Some(path))
}

/// Apply a browser-submitted update to the env file on disk.
pub fn apply_update(path: &Path, update: EnvFileUpdate) -> io::Result<()> {
    let mut entries = read_entries(path)?;

    if let Some(token) = update.oauth_token.filter(|t| !t.is_empty()) {
        entries.insert(KEY_OAUTH_TOKEN.to_string(), token);
    }
    if let Some(key) = update.api_key.filter(|k| !k.is_empty()) {
        entries.insert(KEY_API_KEY.to_string(), key);
    }
    if let Some(url) = update.api_base_url {
        if url.is_empty() {
            entries.remove(KEY_BASE_URL);
        } else {
            entries.insert(KEY_BASE_URL.to_string(), url);
        }
    }

    write_entries(path, &entries)?;
    info!("sandbox env file updated");
    Ok(())
}

fn read_entries(path: &Path) -> io::Result<BTreeMap<String, String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content
            .lines()
            .filter_map(|line| {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    return None;
                }
                line.split_once('=')
                    .map(|(k, v)| (k.trim().to_string(), v.to_string()))
            })
            .collect()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(e),
    }
}

fn write_entries(path: &Path, entries: &BTreeMap<String, String>) -> io::Result<()> {
    let mut content = String::new();
    for (key, value) in entries {
        content.push_str(key);
        content.push('=');
        content.push_str(value);
        content.push('\n');
    }
    utils::fs::write_atomic(path, content.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_semantics() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sandbox.env");
        fs::write(
            &path,
            "ANTHROPIC_BASE_URL=https://proxy\nCLAUDE_CODE_OAUTH_TOKEN=tok-1\n",
        )
        .unwrap();

        // Empty token = no change; empty url = clear.
        apply_update(
            &path,
            EnvFileUpdate {
                oauth_token: Some(String::new()),
                api_key: Some("sk-key".into()),
                api_base_url: Some(String::new()),
            },
        )
        .unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("CLAUDE_CODE_OAUTH_TOKEN=tok-1"));
        assert!(content.contains("ANTHROPIC_API_KEY=sk-key"));
        assert!(!content.contains("ANTHROPIC_BASE_URL"));
    }
}
