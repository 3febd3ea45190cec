use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result};
use client_core::{EngineConfig, ReconnectPolicy};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub server_url: String,
    pub user_id: Option<i64>,
    pub auth_token: Option<String>,
    pub heartbeat_secs: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_max_attempts: u32,
    /// Zero disables the acknowledgement timeout.
    pub ack_timeout_secs: u64,
    pub history_page_size: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            user_id: None,
            auth_token: None,
            heartbeat_secs: 25,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 30_000,
            reconnect_max_attempts: 5,
            ack_timeout_secs: 30,
            history_page_size: 50,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    server_url: Option<String>,
    user_id: Option<i64>,
    auth_token: Option<String>,
    heartbeat_secs: Option<u64>,
    reconnect_base_ms: Option<u64>,
    reconnect_max_ms: Option<u64>,
    reconnect_max_attempts: Option<u32>,
    ack_timeout_secs: Option<u64>,
    history_page_size: Option<u32>,
}

impl Settings {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(self.reconnect_base_ms),
                max_delay: Duration::from_millis(self.reconnect_max_ms),
                max_attempts: self.reconnect_max_attempts,
            },
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs.max(1)),
            ack_timeout: (self.ack_timeout_secs > 0)
                .then(|| Duration::from_secs(self.ack_timeout_secs)),
            history_page_size: self.history_page_size,
            ..EngineConfig::default()
        }
    }
}

/// Defaults, then `client.toml`, then `APP__*` environment overrides.
pub fn load_settings() -> Result<Settings> {
    load_settings_from(Path::new("client.toml"), |key| std::env::var(key).ok())
}

pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Settings> {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        let file_cfg: FileSettings = toml::from_str(&raw)
            .with_context(|| format!("invalid client config {}", path.display()))?;
        apply_file(&mut settings, file_cfg);
    }

    if let Some(v) = env("APP__SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = env("APP__USER_ID") {
        settings.user_id = Some(parse_env("APP__USER_ID", &v)?);
    }
    if let Some(v) = env("APP__AUTH_TOKEN") {
        settings.auth_token = Some(v);
    }
    if let Some(v) = env("APP__HEARTBEAT_SECS") {
        settings.heartbeat_secs = parse_env("APP__HEARTBEAT_SECS", &v)?;
    }
    if let Some(v) = env("APP__RECONNECT_BASE_MS") {
        settings.reconnect_base_ms = parse_env("APP__RECONNECT_BASE_MS", &v)?;
    }
    if let Some(v) = env("APP__RECONNECT_MAX_MS") {
        settings.reconnect_max_ms = parse_env("APP__RECONNECT_MAX_MS", &v)?;
    }
    if let Some(v) = env("APP__RECONNECT_MAX_ATTEMPTS") {
        settings.reconnect_max_attempts = parse_env("APP__RECONNECT_MAX_ATTEMPTS", &v)?;
    }
    if let Some(v) = env("APP__ACK_TIMEOUT_SECS") {
        settings.ack_timeout_secs = parse_env("APP__ACK_TIMEOUT_SECS", &v)?;
    }
    if let Some(v) = env("APP__HISTORY_PAGE_SIZE") {
        settings.history_page_size = parse_env("APP__HISTORY_PAGE_SIZE", &v)?;
    }

    Ok(settings)
}

fn apply_file(settings: &mut Settings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.server_url {
        settings.server_url = v;
    }
    if file_cfg.user_id.is_some() {
        settings.user_id = file_cfg.user_id;
    }
    if file_cfg.auth_token.is_some() {
        settings.auth_token = file_cfg.auth_token;
    }
    if let Some(v) = file_cfg.heartbeat_secs {
        settings.heartbeat_secs = v;
    }
    if let Some(v) = file_cfg.reconnect_base_ms {
        settings.reconnect_base_ms = v;
    }
    if let Some(v) = file_cfg.reconnect_max_ms {
        settings.reconnect_max_ms = v;
    }
    if let Some(v) = file_cfg.reconnect_max_attempts {
        settings.reconnect_max_attempts = v;
    }
    if let Some(v) = file_cfg.ack_timeout_secs {
        settings.ack_timeout_secs = v;
    }
    if let Some(v) = file_cfg.history_page_size {
        settings.history_page_size = v;
    }
}

fn parse_env<T>(key: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse()
        .with_context(|| format!("{key} has an invalid value: {raw}"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
