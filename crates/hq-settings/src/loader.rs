//! Settings loading: defaults ← file deep-merge ← env overrides.

use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::errors::{Result, SettingsError};
use crate::types::HqSettings;

/// Path of the user settings file (`~/.hq/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
    PathBuf::from(home).join(".hq").join("settings.json")
}

/// Deep-merge `overlay` onto `base`.
///
/// Objects merge key-by-key recursively; any other value in the overlay
/// replaces the base value wholesale.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value,
                };
                let _ = base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (_, overlay) => overlay,
    }
}

/// Load settings from the default path with env overrides applied.
pub fn load_settings() -> Result<HqSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific file with env overrides applied.
///
/// A missing file is not an error: defaults (plus env) apply.
pub fn load_settings_from_path(path: &Path) -> Result<HqSettings> {
    let defaults = serde_json::to_value(HqSettings::default())?;

    let merged = if path.exists() {
        let text = std::fs::read_to_string(path)?;
        let file_value: Value = serde_json::from_str(&text)?;
        deep_merge(defaults, file_value)
    } else {
        defaults
    };

    let mut settings: HqSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings)?;
    Ok(settings)
}

/// Apply environment overrides (highest priority layer).
fn apply_env_overrides(settings: &mut HqSettings) -> Result<()> {
    if let Ok(port) = std::env::var("PORT") {
        settings.server.port = port.parse().map_err(|_| SettingsError::InvalidEnv {
            var: "PORT".into(),
            message: format!("not a port number: {port}"),
        })?;
    }
    if let Ok(url) = std::env::var("API_URL") {
        settings.server.api_url = url;
    }
    if let Ok(skip) = std::env::var("SKIP_AUTH") {
        settings.server.skip_auth = matches!(skip.as_str(), "1" | "true" | "yes");
    }
    if let Ok(bucket) = std::env::var("HQ_BUCKET") {
        settings.storage.bucket = bucket;
    }
    if let Ok(prefix) = std::env::var("HQ_PREFIX") {
        settings.storage.prefix = prefix;
    }
    if let Ok(dir) = std::env::var("HQ_LOCAL_DIR") {
        settings.storage.local_dir = dir;
    }
    if let Ok(endpoint) = std::env::var("HQ_FLEET_URL") {
        settings.fleet.endpoint = endpoint;
    }
    Ok(())
}
