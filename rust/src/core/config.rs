use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ChatCore;
use crate::transport::ReconnectPolicy;

pub(crate) const CONFIG_FILE_NAME: &str = "forum_chat_config.json";

const DEFAULT_API_BASE_URL: &str = "https://forum.example.com/api";
const DEFAULT_WS_URL: &str = "wss://forum.example.com/ws";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct AppConfig {
    pub(crate) api_base_url: Option<String>,
    pub(crate) ws_url: Option<String>,
    pub(crate) disable_network: Option<bool>,
    pub(crate) history_page_size: Option<u32>,
    pub(crate) dedup_window_secs: Option<u64>,
    pub(crate) max_mini_windows: Option<usize>,
    pub(crate) reconnect_initial_ms: Option<u64>,
    pub(crate) reconnect_max_ms: Option<u64>,
    pub(crate) breaker_threshold: Option<u32>,
    pub(crate) breaker_cooldown_ms: Option<u64>,
    pub(crate) request_timeout_secs: Option<u64>,
}

pub(crate) fn load_app_config(data_dir: &str) -> AppConfig {
    let path = Path::new(data_dir).join(CONFIG_FILE_NAME);
    let Ok(bytes) = std::fs::read(&path) else {
        return AppConfig::default();
    };
    match serde_json::from_slice::<AppConfig>(&bytes) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "malformed config; using defaults");
            AppConfig::default()
        }
    }
}

pub(crate) fn default_app_config_json() -> String {
    let defaults = AppConfig {
        api_base_url: Some(DEFAULT_API_BASE_URL.to_string()),
        ws_url: Some(DEFAULT_WS_URL.to_string()),
        disable_network: Some(false),
        history_page_size: Some(30),
        dedup_window_secs: Some(5),
        max_mini_windows: Some(crate::windows::MAX_MINI_WINDOWS),
        reconnect_initial_ms: Some(3_000),
        reconnect_max_ms: Some(60_000),
        breaker_threshold: Some(8),
        breaker_cooldown_ms: Some(120_000),
        request_timeout_secs: Some(30),
    };
    serde_json::to_string_pretty(&defaults).unwrap_or_else(|_| "{}".to_string())
}

impl AppConfig {
    pub(crate) fn api_base_url(&self) -> &str {
        non_empty(self.api_base_url.as_deref()).unwrap_or(DEFAULT_API_BASE_URL)
    }

    pub(crate) fn ws_url(&self) -> &str {
        non_empty(self.ws_url.as_deref()).unwrap_or(DEFAULT_WS_URL)
    }

    pub(crate) fn history_page_size(&self) -> u32 {
        self.history_page_size.filter(|n| *n > 0).unwrap_or(30)
    }

    pub(crate) fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs.unwrap_or(5))
    }

    pub(crate) fn max_mini_windows(&self) -> usize {
        self.max_mini_windows
            .filter(|n| *n > 0)
            .unwrap_or(crate::windows::MAX_MINI_WINDOWS)
    }

    pub(crate) fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.filter(|n| *n > 0).unwrap_or(30))
    }

    pub(crate) fn reconnect_policy(&self) -> ReconnectPolicy {
        let defaults = ReconnectPolicy::default();
        ReconnectPolicy {
            initial_delay: self
                .reconnect_initial_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_delay),
            max_delay: self
                .reconnect_max_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
            breaker_threshold: self.breaker_threshold.unwrap_or(defaults.breaker_threshold),
            breaker_cooldown: self
                .breaker_cooldown_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.breaker_cooldown),
            ..defaults
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

impl ChatCore {
    pub(super) fn network_enabled(&self) -> bool {
        // Used to keep Rust tests deterministic and offline.
        if let Some(disable) = self.config.disable_network {
            return !disable;
        }
        std::env::var("FORUM_CHAT_DISABLE_NETWORK").ok().as_deref() != Some("1")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_or_malformed_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_str().unwrap();
        let config = load_app_config(data_dir);
        assert_eq!(config.history_page_size(), 30);
        assert_eq!(config.max_mini_windows(), 3);

        std::fs::write(dir.path().join(CONFIG_FILE_NAME), b"{not json").unwrap();
        let config = load_app_config(data_dir);
        assert_eq!(config.ws_url(), DEFAULT_WS_URL);
    }

    #[test]
    fn partial_file_overrides_only_its_fields() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            br#"{ "ws_url": "ws://127.0.0.1:9000/ws", "reconnect_initial_ms": 50, "breaker_threshold": 0 }"#,
        )
        .unwrap();
        let config = load_app_config(dir.path().to_str().unwrap());
        assert_eq!(config.ws_url(), "ws://127.0.0.1:9000/ws");
        let policy = config.reconnect_policy();
        assert_eq!(policy.initial_delay, Duration::from_millis(50));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
        assert_eq!(policy.breaker_threshold, 0);
    }

    #[test]
    fn default_json_round_trips_through_the_loader() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), default_app_config_json()).unwrap();
        let config = load_app_config(dir.path().to_str().unwrap());
        assert_eq!(config.disable_network, Some(false));
        assert_eq!(config.dedup_window(), Duration::from_secs(5));
        assert_eq!(config.reconnect_policy(), ReconnectPolicy::default());
    }
}
