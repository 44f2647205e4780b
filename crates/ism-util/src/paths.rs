//! Default paths for ismd components
//!
//! Paths are user-writable by default (no root required):
//! - Settings: `$XDG_CONFIG_HOME/ismd/ismd.toml` or `~/.config/ismd/ismd.toml`
//! - Data: `$XDG_DATA_HOME/ismd` or `~/.local/share/ismd`

use std::path::PathBuf;

/// Environment variable for overriding the data directory
pub const ISMD_DATA_DIR_ENV: &str = "ISMD_DATA_DIR";

/// Settings filename within the config directory
const SETTINGS_FILENAME: &str = "ismd.toml";

/// Store filename within the data directory
pub const STORE_FILENAME: &str = "ismd.db";

/// Application subdirectory name
const APP_DIR: &str = "ismd";

/// Get the default settings file path.
///
/// Order of precedence:
/// 1. `$XDG_CONFIG_HOME/ismd/ismd.toml` (if XDG_CONFIG_HOME is set)
/// 2. `~/.config/ismd/ismd.toml` (fallback)
///
/// `ISMD_CONFIG` is handled by the CLI layer.
pub fn default_settings_path() -> PathBuf {
    if let Ok(config_home) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(config_home).join(APP_DIR).join(SETTINGS_FILENAME);
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home)
            .join(".config")
            .join(APP_DIR)
            .join(SETTINGS_FILENAME);
    }

    PathBuf::from("/etc").join(APP_DIR).join(SETTINGS_FILENAME)
}

/// Get the default data directory.
///
/// Order of precedence:
/// 1. `$ISMD_DATA_DIR` environment variable (if set)
/// 2. `$XDG_DATA_HOME/ismd` (if XDG_DATA_HOME is set)
/// 3. `~/.local/share/ismd` (fallback)
pub fn default_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var(ISMD_DATA_DIR_ENV) {
        return PathBuf::from(path);
    }

    data_dir_without_env()
}

fn data_dir_without_env() -> PathBuf {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(data_home).join(APP_DIR);
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home)
            .join(".local")
            .join("share")
            .join(APP_DIR);
    }

    PathBuf::from("/var/lib").join(APP_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_path_contains_app_dir() {
        let path = default_settings_path();
        assert!(path.to_string_lossy().contains("ismd"));
        assert!(path.to_string_lossy().ends_with(".toml"));
    }

    #[test]
    fn data_dir_contains_app_dir() {
        let path = data_dir_without_env();
        assert!(path.to_string_lossy().contains("ismd"));
    }
}
