use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use url::Url;

use crate::error::{ClientError, ClientResult};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CREDENTIAL_COOKIE: &str = "access_token";
const SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub api_url: String,
    pub live_url: String,
    pub request_timeout: Duration,
    pub credential_cookie_name: String,
    pub reconnect_initial_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// `None` keeps retrying until the session is torn down.
    pub reconnect_max_attempts: Option<u32>,
    pub session_file: Option<PathBuf>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:3000".into(),
            live_url: "ws://127.0.0.1:3000/live".into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            credential_cookie_name: DEFAULT_CREDENTIAL_COOKIE.into(),
            reconnect_initial_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
            reconnect_max_attempts: None,
            session_file: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    api_url: Option<String>,
    live_url: Option<String>,
    request_timeout_ms: Option<u64>,
    credential_cookie_name: Option<String>,
    reconnect_initial_delay_ms: Option<u64>,
    reconnect_max_delay_ms: Option<u64>,
    reconnect_max_attempts: Option<u32>,
    session_file: Option<PathBuf>,
}

impl ClientSettings {
    /// Settings for `api_url` with the live endpoint derived from it.
    pub fn for_api_url(api_url: &str) -> ClientResult<Self> {
        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            live_url: derive_live_url(api_url)?,
            ..Self::default()
        })
    }

    pub fn validate(&self) -> ClientResult<()> {
        let api = Url::parse(&self.api_url)
            .map_err(|err| ClientError::Config(format!("api_url '{}': {err}", self.api_url)))?;
        if !matches!(api.scheme(), "http" | "https") {
            return Err(ClientError::Config(
                "api_url must start with http:// or https://".into(),
            ));
        }
        let live = Url::parse(&self.live_url)
            .map_err(|err| ClientError::Config(format!("live_url '{}': {err}", self.live_url)))?;
        if !matches!(live.scheme(), "ws" | "wss") {
            return Err(ClientError::Config(
                "live_url must start with ws:// or wss://".into(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(ClientError::Config("request timeout must be positive".into()));
        }
        if self.credential_cookie_name.trim().is_empty() {
            return Err(ClientError::Config("credential cookie name is empty".into()));
        }
        Ok(())
    }

    fn apply_file(&mut self, file_cfg: FileSettings) {
        let explicit_live = file_cfg.live_url.is_some();
        if let Some(v) = file_cfg.api_url {
            self.api_url = v.trim_end_matches('/').to_string();
            if !explicit_live {
                if let Ok(live) = derive_live_url(&self.api_url) {
                    self.live_url = live;
                }
            }
        }
        if let Some(v) = file_cfg.live_url {
            self.live_url = v;
        }
        if let Some(v) = file_cfg.request_timeout_ms {
            self.request_timeout = Duration::from_millis(v);
        }
        if let Some(v) = file_cfg.credential_cookie_name {
            self.credential_cookie_name = v;
        }
        if let Some(v) = file_cfg.reconnect_initial_delay_ms {
            self.reconnect_initial_delay = Duration::from_millis(v);
        }
        if let Some(v) = file_cfg.reconnect_max_delay_ms {
            self.reconnect_max_delay = Duration::from_millis(v);
        }
        if file_cfg.reconnect_max_attempts.is_some() {
            self.reconnect_max_attempts = file_cfg.reconnect_max_attempts;
        }
        if file_cfg.session_file.is_some() {
            self.session_file = file_cfg.session_file;
        }
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        let api_url = var("APP__API_URL").or_else(|| var("API_URL"));
        let live_url = var("APP__LIVE_URL").or_else(|| var("LIVE_URL"));
        if let Some(v) = api_url {
            self.api_url = v.trim_end_matches('/').to_string();
            if live_url.is_none() {
                if let Ok(live) = derive_live_url(&self.api_url) {
                    self.live_url = live;
                }
            }
        }
        if let Some(v) = live_url {
            self.live_url = v;
        }
        if let Some(v) = var("APP__REQUEST_TIMEOUT_MS") {
            if let Ok(parsed) = v.parse::<u64>() {
                self.request_timeout = Duration::from_millis(parsed);
            }
        }
        if let Some(v) = var("APP__CREDENTIAL_COOKIE") {
            self.credential_cookie_name = v;
        }
        if let Some(v) = var("APP__SESSION_FILE") {
            self.session_file = Some(PathBuf::from(v));
        }
    }
}

/// Defaults, then `client.toml` in the working directory, then environment.
pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(SETTINGS_FILE), |key| std::env::var(key).ok())
}

pub fn load_settings_from(
    path: &Path,
    var: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => settings.apply_file(file_cfg),
            Err(err) => tracing::warn!(
                path = %path.display(),
                "config: ignoring unreadable settings file: {err}"
            ),
        }
    }

    settings.apply_env(var);
    settings
}

/// `http://host/x` becomes `ws://host/x/live`, `https` becomes `wss`.
pub fn derive_live_url(api_url: &str) -> ClientResult<String> {
    let trimmed = api_url.trim_end_matches('/');
    let ws_url = if trimmed.starts_with("https://") {
        trimmed.replacen("https://", "wss://", 1)
    } else if trimmed.starts_with("http://") {
        trimmed.replacen("http://", "ws://", 1)
    } else {
        return Err(ClientError::Config(
            "api_url must start with http:// or https://".into(),
        ));
    };
    Ok(format!("{ws_url}/live"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
