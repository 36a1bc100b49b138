//! Connection settings storage
//!
//! Handles saving and loading the API credential and service URLs to a JSON
//! file in the user's config directory. Environment variables take
//! precedence over the stored file so CI and one-off runs never have to
//! touch the on-disk settings.

use crate::error::SettingsError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::{error, info};

/// Environment variable overriding the stored API key
pub(crate) const API_KEY_ENV: &str = "MEETSCRIBE_API_KEY";

/// Environment variable overriding the stored REST base URL
pub(crate) const API_URL_ENV: &str = "MEETSCRIBE_API_URL";

/// Environment variable overriding the stored WebSocket URL
pub(crate) const WS_URL_ENV: &str = "MEETSCRIBE_WS_URL";

/// Stored connection settings
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct Settings {
    /// API key for the transcription service
    pub api_key: Option<String>,
    /// REST API base URL (None = use default from config.toml)
    pub api_base_url: Option<String>,
    /// WebSocket event stream URL (None = use default from config.toml)
    pub websocket_url: Option<String>,
}

/// Get the settings file path
fn settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("Meetscribe").join("settings.json"))
}

/// Load settings from disk
///
/// Returns default settings if the file doesn't exist or can't be read
pub(crate) fn load_settings() -> Settings {
    let Some(path) = settings_path() else {
        return Settings::default();
    };

    if !path.exists() {
        return Settings::default();
    }

    match fs::read_to_string(&path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                error!("Failed to parse settings: {}", e);
                Settings::default()
            }
        },
        Err(e) => {
            error!("Failed to read settings file: {}", e);
            Settings::default()
        }
    }
}

/// Save settings to disk
pub(crate) fn save_settings(settings: &Settings) -> Result<(), SettingsError> {
    let path = settings_path().ok_or(SettingsError::NoConfigDir)?;

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)?;
            info!("Created settings directory: {:?}", parent);
        }
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(&path, json)?;
    info!("Saved settings to: {:?}", path);

    Ok(())
}

/// Remove all stored settings
pub(crate) fn clear_settings() -> Result<(), SettingsError> {
    let path = settings_path().ok_or(SettingsError::NoConfigDir)?;

    if path.exists() {
        fs::remove_file(&path)?;
        info!("Cleared settings at: {:?}", path);
    }

    Ok(())
}

/// Get the API key, preferring the environment over the stored file
pub(crate) fn get_api_key() -> Option<String> {
    if let Ok(key) = std::env::var(API_KEY_ENV) {
        if !key.is_empty() {
            return Some(key);
        }
    }
    load_settings().api_key.filter(|k| !k.is_empty())
}

/// Store the API key
pub(crate) fn set_api_key(key: &str) -> Result<(), SettingsError> {
    let mut settings = load_settings();
    settings.api_key = Some(key.to_string());
    save_settings(&settings)
}

/// Get the REST base URL override, if any
pub(crate) fn get_api_base_url() -> Option<String> {
    if let Ok(url) = std::env::var(API_URL_ENV) {
        if !url.is_empty() {
            return Some(url);
        }
    }
    load_settings().api_base_url.filter(|u| !u.is_empty())
}

/// Get the WebSocket URL override, if any
pub(crate) fn get_websocket_url() -> Option<String> {
    if let Ok(url) = std::env::var(WS_URL_ENV) {
        if !url.is_empty() {
            return Some(url);
        }
    }
    load_settings().websocket_url.filter(|u| !u.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert!(settings.api_key.is_none());
        assert!(settings.api_base_url.is_none());
        assert!(settings.websocket_url.is_none());
    }

    #[test]
    fn test_settings_path() {
        let path = settings_path();
        assert!(path.is_some());
        let path = path.unwrap();
        assert!(path.ends_with("Meetscribe/settings.json"));
    }

    #[test]
    fn test_settings_roundtrip_json() {
        let settings = Settings {
            api_key: Some("key123".to_string()),
            api_base_url: Some("https://api.example.com".to_string()),
            websocket_url: None,
        };

        let json = serde_json::to_string(&settings).unwrap();
        let parsed: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.api_key.as_deref(), Some("key123"));
        assert_eq!(
            parsed.api_base_url.as_deref(),
            Some("https://api.example.com")
        );
        assert!(parsed.websocket_url.is_none());
    }
}
