use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_ENV_PREFIX: &str = "MURAL";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub admins: AdminConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub demo: DemoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdminConfig {
    #[serde(default = "default_admin_emails")]
    pub emails: Vec<String>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            emails: default_admin_emails(),
        }
    }
}

fn default_admin_emails() -> Vec<String> {
    vec!["admin@mural.local".into()]
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedConfig {
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_comment_limit")]
    pub comment_limit: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            comment_limit: default_comment_limit(),
        }
    }
}

fn default_window_size() -> usize {
    10
}

fn default_comment_limit() -> usize {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    /// "memory" runs the in-process emulator, "rest" talks to the real service.
    #[serde(default = "default_backend_mode")]
    pub mode: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_identity_url")]
    pub identity_url: String,
    #[serde(default = "default_firestore_url")]
    pub firestore_url: String,
    #[serde(default = "default_storage_url")]
    pub storage_url: String,
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            mode: default_backend_mode(),
            project_id: String::new(),
            api_key: String::new(),
            identity_url: default_identity_url(),
            firestore_url: default_firestore_url(),
            storage_url: default_storage_url(),
            poll_interval: default_poll_interval(),
        }
    }
}

fn default_backend_mode() -> String {
    "memory".into()
}

fn default_identity_url() -> String {
    "https://identitytoolkit.googleapis.com/v1".into()
}

fn default_firestore_url() -> String {
    "https://firestore.googleapis.com/v1".into()
}

fn default_storage_url() -> String {
    "https://firebasestorage.googleapis.com/v0".into()
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(3)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DemoConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_open_browser")]
    pub open_browser: bool,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            open_browser: default_open_browser(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:0".into()
}

fn default_open_browser() -> bool {
    true
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = options.config_file.as_ref() {
        if path.exists() {
            let from_file = read_config_file(path)?;
            cfg = merge_config(cfg, from_file);
        }
    } else if let Some(default_path) = default_config_path() {
        if default_path.exists() {
            let from_file = read_config_file(&default_path)?;
            cfg = merge_config(cfg, from_file);
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    apply_env(&mut cfg, prefix);

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn merge_config(mut base: Config, other: Config) -> Config {
    if !other.admins.emails.is_empty() {
        base.admins.emails = other.admins.emails;
    }

    if other.feed.window_size != 0 {
        base.feed.window_size = other.feed.window_size;
    }
    if other.feed.comment_limit != 0 {
        base.feed.comment_limit = other.feed.comment_limit;
    }

    if !other.backend.mode.is_empty() {
        base.backend.mode = other.backend.mode;
    }
    if !other.backend.project_id.is_empty() {
        base.backend.project_id = other.backend.project_id;
    }
    if !other.backend.api_key.is_empty() {
        base.backend.api_key = other.backend.api_key;
    }
    if !other.backend.identity_url.is_empty() {
        base.backend.identity_url = other.backend.identity_url;
    }
    if !other.backend.firestore_url.is_empty() {
        base.backend.firestore_url = other.backend.firestore_url;
    }
    if !other.backend.storage_url.is_empty() {
        base.backend.storage_url = other.backend.storage_url;
    }
    base.backend.poll_interval = other.backend.poll_interval;

    if !other.demo.listen.is_empty() {
        base.demo.listen = other.demo.listen;
    }
    base.demo.open_browser = other.demo.open_browser;

    base
}

/// Env values land directly on the loaded config so unset variables never
/// disturb file-provided settings.
fn apply_env(cfg: &mut Config, prefix: &str) {
    let upper_prefix = format!("{}_", prefix.to_uppercase());

    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            apply_env_value(cfg, &normalized, value);
        }
    }
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "admins.emails" => {
            cfg.admins.emails = value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        "feed.window_size" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.feed.window_size = parsed;
            }
        }
        "feed.comment_limit" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.feed.comment_limit = parsed;
            }
        }
        "backend.mode" => cfg.backend.mode = value,
        "backend.project_id" => cfg.backend.project_id = value,
        "backend.api_key" => cfg.backend.api_key = value,
        "backend.identity_url" => cfg.backend.identity_url = value,
        "backend.firestore_url" => cfg.backend.firestore_url = value,
        "backend.storage_url" => cfg.backend.storage_url = value,
        "backend.poll_interval" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.backend.poll_interval = duration;
            }
        }
        "demo.listen" => cfg.demo.listen = value,
        "demo.open_browser" => {
            cfg.demo.open_browser = matches!(value.as_str(), "1" | "true" | "TRUE" | "True");
        }
        _ => {}
    }
}

pub fn default_path() -> Option<PathBuf> {
    default_config_path()
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("mural").join("config.yaml"))
}

pub fn save_backend_credentials(
    path: Option<PathBuf>,
    project_id: &str,
    api_key: &str,
) -> Result<PathBuf> {
    let project_id = project_id.trim();
    let api_key = api_key.trim();

    anyhow::ensure!(
        !project_id.is_empty(),
        "config: backend.project_id is required"
    );
    anyhow::ensure!(!api_key.is_empty(), "config: backend.api_key is required");

    let path = if let Some(path) = path {
        path
    } else {
        default_config_path().context("config: unable to determine default config path")?
    };

    let mut cfg = if path.exists() {
        read_config_file(&path)?
    } else {
        Config::default()
    };

    cfg.backend.project_id = project_id.to_string();
    cfg.backend.api_key = api_key.to_string();
    cfg.backend.mode = "rest".to_string();

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("config: failed to create directory {}", parent.display()))?;
    }

    let contents = serde_yaml::to_string(&cfg).context("config: failed to serialize config")?;
    fs::write(&path, contents)
        .with_context(|| format!("config: failed to write file {}", path.display()))?;

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use tempfile::tempdir;

    #[test]
    fn load_defaults_without_files() {
        let cfg = load(LoadOptions::default()).unwrap();
        assert_eq!(cfg.feed.window_size, 10);
        assert_eq!(cfg.backend.mode, "memory");
        assert_eq!(cfg.demo.listen, default_listen());
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "admins:\n  emails: [one@example.com, two@example.com]\nfeed:\n  window_size: 25\n",
        )
        .unwrap();
        let cfg = load(LoadOptions {
            config_file: Some(path),
            env_prefix: Some("MURAL_TEST_NONE".into()),
        })
        .unwrap();
        assert_eq!(cfg.feed.window_size, 25);
        assert_eq!(cfg.feed.comment_limit, 100);
        assert_eq!(cfg.admins.emails.len(), 2);
    }

    #[test]
    fn file_values_survive_empty_env_stage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "backend:\n  poll_interval: 10s\ndemo:\n  open_browser: false\n",
        )
        .unwrap();
        let cfg = load(LoadOptions {
            config_file: Some(path),
            env_prefix: Some("MURAL_TEST_NONE".into()),
        })
        .unwrap();
        assert_eq!(cfg.backend.poll_interval, Duration::from_secs(10));
        assert!(!cfg.demo.open_browser);
    }

    #[test]
    fn save_credentials_creates_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        save_backend_credentials(Some(path.clone()), "demo-project", "key-123").unwrap();
        let saved = read_config_file(&path).unwrap();
        assert_eq!(saved.backend.project_id, "demo-project");
        assert_eq!(saved.backend.mode, "rest");
    }

    #[test]
    fn env_overrides() {
        env::set_var("MURAL_FEED__WINDOW_SIZE", "7");
        let cfg = load(LoadOptions::default()).unwrap();
        assert_eq!(cfg.feed.window_size, 7);
        env::remove_var("MURAL_FEED__WINDOW_SIZE");
    }
}
