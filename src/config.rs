use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming the destination store.
pub const DATABASE_URL_VAR: &str = "DATABASE_URL";

/// Dotenv file read at startup unless `--env-file` says otherwise.
pub const DEFAULT_ENV_FILE: &str = "config/.env";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("DATABASE_URL environment variable is not set")]
    MissingDatabaseUrl,
    #[error("invalid DATABASE_URL: {0}")]
    InvalidDatabaseUrl(String),
    #[error("unsupported store scheme `{0}` (expected sqlite or postgres)")]
    UnsupportedScheme(String),
    #[error("reading config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("loading env file {}: {source}", path.display())]
    EnvFile {
        path: PathBuf,
        #[source]
        source: dotenvy::Error,
    },
    #[error("interval_secs must be at least 1")]
    ZeroInterval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// Human-readable, colored when attached to a terminal.
    Pretty,
}

/// Runtime settings. Every key is optional in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Seconds between ticks.
    pub interval_secs: u64,
    /// Any path on the filesystem whose usage is sampled.
    pub disk_mount: PathBuf,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            disk_mount: PathBuf::from("/"),
            log_format: LogFormat::default(),
        }
    }
}

impl Config {
    /// Load settings from `path`, or from the default location when `path`
    /// is `None`. An explicit path must exist; the default one may not.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(p) => (expand(p), true),
            None => match default_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };

        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => return Err(ConfigError::Read { path, source }),
        };

        let config = Self::from_toml(&text).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.clone(),
                source,
            },
            other => other,
        })?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// `<config_dir>/sysmetrics-logger/config.toml` for the current user.
pub fn default_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "sysmetrics-logger")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

fn expand(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned())
}

/// Load `KEY=value` pairs from a dotenv file into the process environment.
///
/// Variables already set are left alone. Returns `false` when the file does
/// not exist.
pub fn load_env_file(path: &Path) -> Result<bool, ConfigError> {
    let path = expand(path);
    match dotenvy::from_path(&path) {
        Ok(()) => Ok(true),
        Err(e) if e.not_found() => Ok(false),
        Err(source) => Err(ConfigError::EnvFile { path, source }),
    }
}

/// Read the store URL from the process environment.
pub fn database_url() -> Result<String, ConfigError> {
    database_url_from(|key| std::env::var(key).ok())
}

pub fn database_url_from(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<String, ConfigError> {
    lookup(DATABASE_URL_VAR)
        .filter(|url| !url.trim().is_empty())
        .ok_or(ConfigError::MissingDatabaseUrl)
}
