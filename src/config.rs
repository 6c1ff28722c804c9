use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "config/textcall.json";

/// Timing and retention knobs of the coordination core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Call-site keystroke batching window for typing updates.
    #[serde(default = "default_typing_debounce_ms")]
    pub typing_debounce_ms: u64,
    /// Quiet window after which a user's typing state is auto-cleared.
    #[serde(default = "default_typing_decay_ms")]
    pub typing_decay_ms: u64,
    /// Delay between the last leave and the empty-room existence check.
    #[serde(default = "default_empty_room_grace_ms")]
    pub empty_room_grace_ms: u64,
    /// Read-side cap on messages delivered per snapshot.
    #[serde(default = "default_message_display_limit")]
    pub message_display_limit: usize,
}

fn default_typing_debounce_ms() -> u64 {
    100
}

fn default_typing_decay_ms() -> u64 {
    5000
}

fn default_empty_room_grace_ms() -> u64 {
    1000
}

fn default_message_display_limit() -> usize {
    50
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            typing_debounce_ms: default_typing_debounce_ms(),
            typing_decay_ms: default_typing_decay_ms(),
            empty_room_grace_ms: default_empty_room_grace_ms(),
            message_display_limit: default_message_display_limit(),
        }
    }
}

pub fn load_config(path: &str) -> AppConfig {
    let path = Path::new(path);
    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<AppConfig>(&content) {
            Ok(config) => config,
            Err(err) => {
                log::warn!("Failed to parse config file {}: {err}", path.display());
                AppConfig::default()
            }
        },
        Err(err) => {
            log::info!(
                "Config file {} not found ({err}); using defaults",
                path.display()
            );
            AppConfig::default()
        }
    }
}

pub fn save_config(path: &str, config: &AppConfig) -> std::io::Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = load_config("does/not/exist.json");
        assert_eq!(config.typing_debounce_ms, 100);
        assert_eq!(config.typing_decay_ms, 5000);
        assert_eq!(config.empty_room_grace_ms, 1000);
        assert_eq!(config.message_display_limit, 50);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let config: AppConfig = serde_json::from_str(r#"{ "typing_decay_ms": 3000 }"#).unwrap();
        assert_eq!(config.typing_decay_ms, 3000);
        assert_eq!(config.typing_debounce_ms, 100);
    }

    #[test]
    fn save_and_load_round_trip() {
        let path = std::env::temp_dir().join("textcall_config_test.json");
        let path = path.to_string_lossy().to_string();

        let mut config = AppConfig::default();
        config.empty_room_grace_ms = 250;
        save_config(&path, &config).unwrap();

        let loaded = load_config(&path);
        assert_eq!(loaded.empty_room_grace_ms, 250);
        let _ = std::fs::remove_file(&path);
    }
}
