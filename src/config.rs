//! Configuration for landscout.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (LANDSCOUT_HOME, LANDSCOUT_DB)
//! 2. Config file (.landscout/config.yaml)
//! 3. Defaults (~/.landscout)
//!
//! Config file discovery:
//! - Searches current directory and parents for .landscout/config.yaml
//! - Paths in config file are relative to the .landscout/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::{OrchestratorSettings, ReaperConfig, DEFAULT_APPROVAL_THRESHOLD};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const CONFIG_DIR: &str = ".landscout";
const DB_FILE: &str = "jobs.db";
const DEFAULT_COLLECTOR: &str = "landscout-collector";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub executor: Option<ExecutorConfig>,
    #[serde(default)]
    pub reaper: Option<ReaperFileConfig>,
    #[serde(default)]
    pub review: Option<ReviewConfig>,
    #[serde(default)]
    pub collector: Option<CollectorConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .landscout/)
    pub home: Option<String>,
    /// Job database (relative to .landscout/)
    pub database: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    pub poll_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReaperFileConfig {
    pub interval_secs: Option<u64>,
    pub timeout_minutes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReviewConfig {
    pub approval_threshold: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    pub timeout_secs: Option<u64>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// State directory
    pub home: PathBuf,
    /// SQLite job database
    pub database: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub settings: Settings,
}

/// Runtime tunables
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    /// How often `serve` asks for the next job
    pub poll_interval_secs: u64,
    pub reaper_interval_secs: u64,
    pub reaper_timeout_minutes: u64,
    pub approval_threshold: f64,
    /// External collector program, looked up on PATH
    pub collector_command: String,
    pub collector_args: Vec<String>,
    pub collector_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            reaper_interval_secs: 300,
            reaper_timeout_minutes: 30,
            approval_threshold: DEFAULT_APPROVAL_THRESHOLD,
            collector_command: DEFAULT_COLLECTOR.to_string(),
            collector_args: Vec::new(),
            collector_timeout_secs: 600,
        }
    }
}

impl Settings {
    fn from_file(file: &ConfigFile) -> Result<Self> {
        let defaults = Self::default();

        let approval_threshold = file
            .review
            .as_ref()
            .and_then(|r| r.approval_threshold)
            .unwrap_or(defaults.approval_threshold);
        if !(0.0..=1.0).contains(&approval_threshold) {
            anyhow::bail!(
                "review.approval_threshold must be within [0, 1], got {}",
                approval_threshold
            );
        }

        Ok(Self {
            poll_interval_secs: file
                .executor
                .as_ref()
                .and_then(|e| e.poll_interval_secs)
                .unwrap_or(defaults.poll_interval_secs),
            reaper_interval_secs: file
                .reaper
                .as_ref()
                .and_then(|r| r.interval_secs)
                .unwrap_or(defaults.reaper_interval_secs),
            reaper_timeout_minutes: file
                .reaper
                .as_ref()
                .and_then(|r| r.timeout_minutes)
                .unwrap_or(defaults.reaper_timeout_minutes),
            approval_threshold,
            collector_command: file
                .collector
                .as_ref()
                .and_then(|c| c.command.clone())
                .unwrap_or(defaults.collector_command),
            collector_args: file
                .collector
                .as_ref()
                .map(|c| c.args.clone())
                .unwrap_or_default(),
            collector_timeout_secs: file
                .collector
                .as_ref()
                .and_then(|c| c.timeout_secs)
                .unwrap_or(defaults.collector_timeout_secs),
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn collector_timeout(&self) -> Duration {
        Duration::from_secs(self.collector_timeout_secs)
    }

    pub fn reaper(&self) -> ReaperConfig {
        ReaperConfig {
            interval: Duration::from_secs(self.reaper_interval_secs.max(1)),
            timeout: Duration::from_secs(self.reaper_timeout_minutes * 60),
        }
    }

    pub fn orchestrator(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            approval_threshold: self.approval_threshold,
            reaper: self.reaper(),
        }
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Combine a parsed config file with environment overrides
fn resolve(
    config_file: Option<(PathBuf, ConfigFile)>,
    default_home: PathBuf,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ResolvedConfig> {
    let (path, file) = match config_file {
        Some((path, file)) => (Some(path), file),
        None => (None, ConfigFile::default()),
    };
    let config_dir = path
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf);

    let home = if let Some(env_home) = env("LANDSCOUT_HOME") {
        PathBuf::from(env_home)
    } else if let (Some(dir), Some(home)) = (&config_dir, &file.paths.home) {
        resolve_path(dir, home)
    } else {
        default_home
    };

    let database = if let Some(env_db) = env("LANDSCOUT_DB") {
        PathBuf::from(env_db)
    } else if let (Some(dir), Some(db)) = (&config_dir, &file.paths.database) {
        resolve_path(dir, db)
    } else {
        home.join(DB_FILE)
    };

    let settings = Settings::from_file(&file)?;

    Ok(ResolvedConfig {
        home,
        database,
        config_file: path,
        settings,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);

    let config_file = match find_config_file() {
        Some(path) => {
            let file = load_config_file(&path)?;
            Some((path, file))
        }
        None => None,
    };

    resolve(config_file, default_home, |key| std::env::var(key).ok())
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the landscout home directory
pub fn landscout_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the job database path
pub fn database_path() -> Result<PathBuf> {
    Ok(config()?.database.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults_without_file() {
        let home = PathBuf::from("/home/scout/.landscout");
        let config = resolve(None, home.clone(), no_env).unwrap();

        assert_eq!(config.home, home);
        assert_eq!(config.database, home.join("jobs.db"));
        assert!(config.config_file.is_none());
        assert_eq!(config.settings, Settings::default());
        assert_eq!(config.settings.reaper(), ReaperConfig::default());
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join(".landscout");
        std::fs::create_dir_all(&dir).unwrap();

        let config_path = dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1.0"
paths:
  database: data/jobs.db
reaper:
  interval_secs: 60
  timeout_minutes: 45
review:
  approval_threshold: 0.8
collector:
  command: scout-collect
  args: ["--json"]
"#
        )
        .unwrap();

        let parsed = load_config_file(&config_path).unwrap();
        assert_eq!(parsed.version.as_deref(), Some("1.0"));

        let config = resolve(
            Some((config_path.clone(), parsed)),
            PathBuf::from("/unused"),
            no_env,
        )
        .unwrap();
        assert_eq!(config.database, dir.join("data/jobs.db"));
        assert_eq!(config.config_file, Some(config_path));

        let settings = &config.settings;
        assert_eq!(settings.reaper_timeout_minutes, 45);
        assert_eq!(settings.reaper().interval, Duration::from_secs(60));
        assert_eq!(settings.approval_threshold, 0.8);
        assert_eq!(settings.collector_command, "scout-collect");
        assert_eq!(settings.collector_args, vec!["--json".to_string()]);
        assert_eq!(settings.collector_timeout_secs, 600);
        assert_eq!(settings.poll_interval_secs, 10);
    }

    #[test]
    fn test_env_overrides_file() {
        let file = ConfigFile {
            paths: PathsConfig {
                home: Some("state".to_string()),
                database: Some("state/jobs.db".to_string()),
            },
            ..Default::default()
        };

        let config = resolve(
            Some((PathBuf::from("/proj/.landscout/config.yaml"), file)),
            PathBuf::from("/unused"),
            |key| match key {
                "LANDSCOUT_DB" => Some("/tmp/override.db".to_string()),
                _ => None,
            },
        )
        .unwrap();

        assert_eq!(config.home, PathBuf::from("/proj/.landscout/state"));
        assert_eq!(config.database, PathBuf::from("/tmp/override.db"));
    }

    #[test]
    fn test_rejects_bad_threshold() {
        let file = ConfigFile {
            review: Some(ReviewConfig {
                approval_threshold: Some(1.5),
            }),
            ..Default::default()
        };
        let result = resolve(
            Some((PathBuf::from("/p/.landscout/config.yaml"), file)),
            PathBuf::from("/h"),
            no_env,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project/.landscout");

        assert_eq!(
            resolve_path(&base, "jobs.db"),
            PathBuf::from("/home/user/project/.landscout/jobs.db")
        );
        assert_eq!(
            resolve_path(&base, "/var/lib/landscout.db"),
            PathBuf::from("/var/lib/landscout.db")
        );
    }
}
