//! Configuration for the project watch subsystem.
//!
//! Layered configuration:
//! - Default values
//! - `.projwatch/settings.toml` (searched upwards from the current directory)
//! - Environment variable overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `PROJWATCH_` and use double
//! underscores to separate nested levels:
//! - `PROJWATCH_WATCH__STABILITY_THRESHOLD_MS=500` sets `watch.stability_threshold_ms`
//! - `PROJWATCH_WATCH__MAX_DEPTH=8` sets `watch.max_depth`
//! - `PROJWATCH_LOGGING__DEFAULT=debug` sets `logging.default`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Directory holding the settings file.
pub const CONFIG_DIR: &str = ".projwatch";
/// Settings file name inside [`CONFIG_DIR`].
pub const CONFIG_FILE: &str = "settings.toml";
/// Environment variable prefix.
pub const ENV_PREFIX: &str = "PROJWATCH_";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// Watch policy tuning
    #[serde(default)]
    pub watch: WatchConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Projects the host starts watching on launch
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct WatchConfig {
    /// How long a file must stay unchanged before a write counts as settled
    #[serde(default = "default_stability_threshold_ms")]
    pub stability_threshold_ms: u64,

    /// How often pending writes are checked for stability
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Collapse delete-then-recreate sequences into a single change
    #[serde(default = "default_true")]
    pub atomic: bool,

    /// Follow symbolic links while scanning
    #[serde(default)]
    pub follow_symlinks: bool,

    /// Maximum directory depth below the project root
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Project-local ignore-config file exempt from the dotfile rule
    #[serde(default = "default_ignore_file")]
    pub ignore_file: String,

    /// Extra glob patterns, matched against project-relative paths
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Default level for every target
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Per-module level overrides
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ProjectConfig {
    pub id: String,
    pub path: PathBuf,
}

fn default_version() -> u32 {
    1
}
fn default_true() -> bool {
    true
}
fn default_stability_threshold_ms() -> u64 {
    2000
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_max_depth() -> usize {
    32
}
fn default_ignore_file() -> String {
    ".watchignore".to_string()
}
fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            watch: WatchConfig::default(),
            logging: LoggingConfig::default(),
            projects: Vec::new(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            stability_threshold_ms: default_stability_threshold_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            atomic: true,
            follow_symlinks: false,
            max_depth: default_max_depth(),
            ignore_file: default_ignore_file(),
            ignore_patterns: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: HashMap::new(),
        }
    }
}

impl Settings {
    /// Load configuration from all sources
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config_path = Self::find_workspace_config()
            .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join(CONFIG_FILE));
        Self::load_from(config_path)
    }

    /// Load configuration from a specific file, still honouring env overrides
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            // Double underscore separates nesting; single underscore stays in field names
            .merge(Env::prefixed(ENV_PREFIX).map(|key| {
                key.as_str().to_lowercase().replace("__", ".").into()
            }))
            .extract()
            .map_err(Box::new)
    }

    /// Find the settings file by looking for `.projwatch` from the current
    /// directory up to the filesystem root
    fn find_workspace_config() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;

        for ancestor in current.ancestors() {
            let config_dir = ancestor.join(CONFIG_DIR);
            if config_dir.is_dir() {
                return Some(config_dir.join(CONFIG_FILE));
            }
        }

        None
    }

    /// Save current configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let parent = path.as_ref().parent().ok_or("Invalid path")?;
        std::fs::create_dir_all(parent)?;

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }
}
