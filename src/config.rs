use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub tools: ToolsConfig,
    pub history: HistoryConfig,
    pub operations: OperationsConfig,
    pub log: LogConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ToolsConfig {
    pub version_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    // Searched before the built-in install locations
    pub extra_search_paths: Vec<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            version_timeout_secs: 10,
            connect_timeout_secs: 30,
            extra_search_paths: Vec::new(),
        }
    }
}

impl ToolsConfig {
    pub fn version_timeout(&self) -> Duration {
        Duration::from_secs(self.version_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HistoryConfig {
    pub max_shown: usize,
    // Unbounded when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_entries: Option<usize>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_shown: 50,
            max_entries: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct OperationsConfig {
    // Refuse to start a backup while a restore runs, and vice versa
    pub exclusive: bool,
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self { exclusive: true }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

impl Config {
    /// Like [`Config::load_or_init`], but an unreadable, malformed or
    /// unwritable file yields the defaults. The error is handed back so the
    /// caller can log it once the subscriber, which needs the level, is up.
    pub fn load_or_default(dir: &Path) -> (Self, Option<anyhow::Error>) {
        match Self::load_or_init(dir) {
            Ok(config) => (config, None),
            Err(err) => (Self::default(), Some(err)),
        }
    }

    /// Reads `config.toml` from `dir`, writing the defaults on first run.
    fn load_or_init(dir: &Path) -> Result<Self> {
        let config_path = Self::path_in(dir);

        if config_path.exists() {
            let content = fs::read_to_string(&config_path)
                .with_context(|| format!("failed to read {}", config_path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("failed to parse {}", config_path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(dir)?;
            Ok(config)
        }
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;

        let content = toml::to_string_pretty(self)?;
        fs::write(Self::path_in(dir), content)?;
        Ok(())
    }

    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(CONFIG_FILE)
    }
}
