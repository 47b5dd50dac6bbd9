use crate::error::SolverError;
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");
const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub version: u32,
    pub docker: Docker,
    pub launch: Launch,
    pub logs: Logs,
    pub summarizer: SummarizerConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Docker {
    pub image: String,
    pub repo_mount: String,
    pub cache_dir: String,
    pub cache_mount: String,
    pub stop_grace_sec: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Launch {
    pub default_timeout_sec: u64,
    pub venv_activate: String,
    pub driver_script: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Logs {
    pub trailing_marker: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct SummarizerConfig {
    pub enabled: bool,
    pub model: String,
    pub base_url: String,
    pub api_key_env: String,
    pub request_timeout_sec: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            docker: Docker::default(),
            launch: Launch::default(),
            logs: Logs::default(),
            summarizer: SummarizerConfig::default(),
        }
    }
}

impl Default for Docker {
    fn default() -> Self {
        Self {
            image: "paulgauthier/aider".to_string(),
            repo_mount: "/app".to_string(),
            cache_dir: "/tmp/aider_cache".to_string(),
            cache_mount: "/home/ubuntu".to_string(),
            stop_grace_sec: 10,
        }
    }
}

impl Default for Launch {
    fn default() -> Self {
        Self {
            default_timeout_sec: 300,
            venv_activate: "/venv/bin/activate".to_string(),
            driver_script: "modify_repo.py".to_string(),
        }
    }
}

impl Default for Logs {
    fn default() -> Self {
        Self {
            trailing_marker: "Tokens:".to_string(),
        }
    }
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            request_timeout_sec: 60,
        }
    }
}

impl Config {
    pub fn cache_dir(&self) -> PathBuf {
        PathBuf::from(expand_path(&self.docker.cache_dir))
    }
}

pub fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("AIDER_SOLVER_CONFIG") {
        return PathBuf::from(path);
    }
    let mut base = default_config_dir();
    base.push("config.yaml");
    base
}

pub fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("AIDER_SOLVER_CONFIG_DIR") {
        return PathBuf::from(path);
    }
    let mut base = dirs::config_dir()
        .or_else(|| home_dir().map(|home| home.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.push("aider-solver");
    base
}

pub fn ensure_parent(path: &Path) -> Result<(), SolverError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

pub fn expand_path(input: &str) -> String {
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped).to_string_lossy().to_string();
        }
    }
    input.to_string()
}

pub fn read_config_from_str(content: &str) -> Result<Config, SolverError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    if cfg.version != CONFIG_VERSION {
        return Err(SolverError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    validate_config(&cfg)?;
    Ok(cfg)
}

/// Reads the config at `path`, falling back to built-in defaults when the file
/// does not exist.
pub fn load_config(path: &Path) -> Result<Config, SolverError> {
    if !path.exists() {
        let cfg = Config::default();
        validate_config(&cfg)?;
        return Ok(cfg);
    }
    let content = fs::read_to_string(path)?;
    read_config_from_str(&content)
}

pub fn validate_config(cfg: &Config) -> Result<(), SolverError> {
    if cfg.docker.image.trim().is_empty() {
        return Err(SolverError::Config(
            "docker.image must not be empty".to_string(),
        ));
    }
    for (field, value) in [
        ("docker.repo_mount", &cfg.docker.repo_mount),
        ("docker.cache_mount", &cfg.docker.cache_mount),
    ] {
        if !value.starts_with('/') {
            return Err(SolverError::Config(format!(
                "{field} must be an absolute container path, got '{value}'"
            )));
        }
    }
    if cfg.docker.cache_dir.trim().is_empty() {
        return Err(SolverError::Config(
            "docker.cache_dir must not be empty".to_string(),
        ));
    }
    if cfg.launch.default_timeout_sec == 0 {
        return Err(SolverError::Config(
            "launch.default_timeout_sec must be greater than 0".to_string(),
        ));
    }
    if cfg.launch.driver_script.trim().is_empty() {
        return Err(SolverError::Config(
            "launch.driver_script must not be empty".to_string(),
        ));
    }
    if cfg.logs.trailing_marker.is_empty() {
        return Err(SolverError::Config(
            "logs.trailing_marker must not be empty".to_string(),
        ));
    }
    if cfg.summarizer.enabled {
        if cfg.summarizer.model.trim().is_empty() {
            return Err(SolverError::Config(
                "summarizer.model must not be empty when the summarizer is enabled".to_string(),
            ));
        }
        if cfg.summarizer.request_timeout_sec == 0 {
            return Err(SolverError::Config(
                "summarizer.request_timeout_sec must be greater than 0".to_string(),
            ));
        }
    }
    Ok(())
}
