use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use petlink_observability::trace;

pub const CHANNEL_URL_ENV: &str = "PETLINK_CHANNEL_URL";
pub const WORKER_PATH_ENV: &str = "PETLINK_WORKER_PATH";
pub const RUN_MODE_ENV: &str = "PETLINK_RUN_MODE";

pub const DEFAULT_CHANNEL_URL: &str = "ws://127.0.0.1:8765";
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 2_000;
/// Floor applied by [`AppConfig::reconnect_delay`].
pub const MIN_RECONNECT_DELAY_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub channel_url: String,
    pub reconnect_delay_ms: u64,
    /// Relative to the bundle's resource dir; `None` uses the per-platform default.
    pub worker_relative_path: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            channel_url: DEFAULT_CHANNEL_URL.to_string(),
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            worker_relative_path: None,
        }
    }
}

impl AppConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms.max(MIN_RECONNECT_DELAY_MS))
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var(CHANNEL_URL_ENV) {
            let t = url.trim();
            if !t.is_empty() {
                self.channel_url = t.to_string();
            }
        }
        self
    }
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.json")
}

pub fn load_config(data_dir: &Path) -> Result<AppConfig> {
    let p = config_path(data_dir);
    if !p.exists() {
        return Ok(AppConfig::default());
    }
    let s = fs::read_to_string(&p).context("read config.json failed")?;
    let cfg: AppConfig = serde_json::from_str(&s).context("parse config.json failed")?;
    Ok(cfg)
}

/// Never fails: a broken config file falls back to defaults and is traced.
pub fn load_config_or_recover(data_dir: &Path) -> AppConfig {
    match load_config(data_dir) {
        Ok(cfg) => cfg,
        Err(e) => {
            trace::event(
                data_dir,
                None,
                "Config",
                "CFG.load",
                "err",
                Some(serde_json::json!({
                    "code": "E_CONFIG_LOAD",
                    "error": format!("{e:#}"),
                    "path": config_path(data_dir).display().to_string(),
                })),
            );
            AppConfig::default()
        }
    }
}

pub fn save_config(data_dir: &Path, cfg: &AppConfig) -> Result<()> {
    fs::create_dir_all(data_dir).context("create data dir failed")?;
    let s = serde_json::to_string_pretty(cfg).context("serialize config failed")?;
    fs::write(config_path(data_dir), s).context("write config.json failed")?;
    Ok(())
}

/// Whether an externally managed worker is assumed (dev) or we own it (prod).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunContext {
    Development,
    Production,
}

impl RunContext {
    pub fn resolve(shell_is_dev: bool) -> Self {
        match std::env::var(RUN_MODE_ENV)
            .map(|v| v.trim().to_ascii_lowercase())
            .as_deref()
        {
            Ok("dev") | Ok("development") => RunContext::Development,
            Ok("prod") | Ok("production") => RunContext::Production,
            _ if shell_is_dev => RunContext::Development,
            _ => RunContext::Production,
        }
    }
}

pub fn default_worker_relative_path() -> PathBuf {
    let bin = if cfg!(windows) {
        "petlink-worker.exe"
    } else {
        "petlink-worker"
    };
    PathBuf::from("backend").join(bin)
}

pub fn resolve_worker_path(resource_dir: &Path, cfg: &AppConfig) -> PathBuf {
    if let Ok(raw) = std::env::var(WORKER_PATH_ENV) {
        let t = raw.trim();
        if !t.is_empty() {
            return PathBuf::from(t);
        }
    }
    match cfg.worker_relative_path.as_deref().map(str::trim) {
        Some(rel) if !rel.is_empty() => resource_dir.join(rel),
        _ => resource_dir.join(default_worker_relative_path()),
    }
}
