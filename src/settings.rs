use crate::storage::{read_json, write_json};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const SETTINGS_FILE: &str = "db_manager_settings.json";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Settings {
    #[serde(default = "default_save_location")]
    pub save_location: PathBuf,
}

fn default_save_location() -> PathBuf {
    dirs::desktop_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            save_location: default_save_location(),
        }
    }
}

pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> Settings {
        read_json(&self.path).unwrap_or_default()
    }

    pub fn save(&self, settings: &Settings) {
        if let Err(err) = write_json(&self.path, settings) {
            tracing::warn!(path = %self.path.display(), error = %err, "failed to save settings");
        }
    }
}
