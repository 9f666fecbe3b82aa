use std::path::PathBuf;

use sandbox::SandboxProfile;
use serde::Serialize;

pub const CONFIG_VOLUME: &str = "wallfacer-config";
pub const GUEST_CONFIG_DIR: &str = "/root/.config/agent";
const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:4331";
const DEFAULT_RUNTIME_BIN: &str = "docker";
const DEFAULT_SANDBOX_IMAGE: &str = "wallfacer-sandbox:latest";

/// Process-wide configuration, read once at startup from the environment
/// (an external `.env` loader populates it beforehand). Immutable after
/// initialization; the credentials env file is the only piece rewritten at
/// runtime.
#[derive(Debug, Clone)]
pub struct Config {
    pub oauth_token: Option<String>,
    pub api_key: Option<String>,
    pub api_base_url: Option<String>,
    pub model: Option<String>,
    pub listen_addr: String,
    pub data_dir: PathBuf,
    pub runtime_bin: String,
    pub sandbox_image: String,
    pub worktrees_dir: PathBuf,
    pub workspaces: Vec<PathBuf>,
}

impl Config {
    pub fn from_env() -> Self {
        let data_dir = env_var("WALLFACER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("wallfacer")
            });
        let worktrees_dir = env_var("WALLFACER_WORKTREES_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("worktrees"));
        let workspaces = env_var("WALLFACER_WORKSPACES")
            .map(|raw| raw.split(':').filter(|s| !s.is_empty()).map(PathBuf::from).collect())
            .unwrap_or_else(|| {
                vec![std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))]
            });

        Config {
            oauth_token: env_var("WALLFACER_OAUTH_TOKEN"),
            api_key: env_var("WALLFACER_API_KEY"),
            api_base_url: env_var("WALLFACER_API_BASE_URL"),
            model: env_var("WALLFACER_MODEL"),
            listen_addr: env_var("WALLFACER_LISTEN_ADDR")
                .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string()),
            data_dir,
            runtime_bin: env_var("WALLFACER_RUNTIME_BIN")
                .unwrap_or_else(|| DEFAULT_RUNTIME_BIN.to_string()),
            sandbox_image: env_var("WALLFACER_SANDBOX_IMAGE")
                .unwrap_or_else(|| DEFAULT_SANDBOX_IMAGE.to_string()),
            worktrees_dir,
            workspaces,
        }
    }

    pub fn sandbox_profile(&self, env_file: Option<PathBuf>) -> SandboxProfile {
        SandboxProfile {
            runtime_bin: self.runtime_bin.clone(),
            image: self.sandbox_image.clone(),
            env_file,
            config_volume: CONFIG_VOLUME.to_string(),
            guest_config_dir: GUEST_CONFIG_DIR.to_string(),
            model: self.model.clone(),
        }
    }

    /// Snapshot safe to hand to the browser: secrets are masked.
    pub fn masked_view(&self) -> ConfigView {
        ConfigView {
            oauth_token: self.oauth_token.as_deref().map(mask_secret),
            api_key: self.api_key.as_deref().map(mask_secret),
            api_base_url: self.api_base_url.clone(),
            model: self.model.clone(),
            listen_addr: self.listen_addr.clone(),
            data_dir: self.data_dir.display().to_string(),
            runtime_bin: self.runtime_bin.clone(),
            sandbox_image: self.sandbox_image.clone(),
            worktrees_dir: self.worktrees_dir.display().to_string(),
            workspaces: self
                .workspaces
                .iter()
                .map(|p| p.display().to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigView {
    pub oauth_token: Option<String>,
    pub api_key: Option<String>,
    pub api_base_url: Option<String>,
    pub model: Option<String>,
    pub listen_addr: String,
    pub data_dir: String,
    pub runtime_bin: String,
    pub sandbox_image: String,
    pub worktrees_dir: String,
    pub workspaces: Vec<String>,
}

pub fn mask_secret(secret: &str) -> String {
    if secret.len() <= 8 {
        return "••••".to_string();
    }
    format!("{}…{}", &secret[..4], &secret[secret.len() - 4..])
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
