use std::fs;
use std::path::{Path, PathBuf};
use directories::BaseDirs;
use merge::Merge;
use serde::Deserialize;
use thiserror::Error;

mod catalog;

pub use catalog::{
    CatalogProvider, EnvCatalog, FileCatalog, ServerCatalog, ServerEntry, ServerId, ServerSpec,
};

/// A custom merge strategy for `Option<T>` fields. It overwrites the destination
/// (`left`) with the source (`right`) only if the source is `Some`.
fn overwrite_if_some<T>(left: &mut Option<T>, right: Option<T>) {
    if right.is_some() {
        *left = right;
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found at '{0}'")]
    NotFound(PathBuf),
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse configuration file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Failed to read environment file: {0}")]
    EnvFile(#[from] dotenvy::Error),
    #[error("Server {index}: invalid port '{value}' (expected 1-65535)")]
    InvalidPort { index: u32, value: String },
    #[error("Server {index}: host must not be empty")]
    EmptyHost { index: u32 },
    #[error("Server id {id} appears more than once")]
    DuplicateId { id: u32 },
    #[error("Port {port} is used by both server {first} and server {second}")]
    DuplicatePort { port: u16, first: u32, second: u32 },
}

#[derive(Deserialize, Merge, Debug, Clone, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub probe_timeout_ms: Option<u64>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub probe_host: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub ssh_binary: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub server_alive_interval: Option<u32>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub server_alive_count_max: Option<u32>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub ssh_extra_args: Option<Vec<String>>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub terminate_grace_ms: Option<u64>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub log_level: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub env_prefix: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub env_file: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub servers: Option<Vec<ServerEntry>>,
}

impl Config {
    /// Built-in defaults, the bottom layer of the merge.
    pub fn defaults() -> Self {
        Self {
            poll_interval_secs: Some(5),
            probe_timeout_ms: Some(2000),
            probe_host: Some("127.0.0.1".to_string()),
            ssh_binary: Some("ssh".to_string()),
            server_alive_interval: Some(60),
            server_alive_count_max: Some(5),
            ssh_extra_args: Some(Vec::new()),
            terminate_grace_ms: Some(1500),
            log_level: Some("info".to_string()),
            env_prefix: Some("SERVER".to_string()),
            env_file: Some(".env".to_string()),
            servers: None,
        }
    }

    /// The configured catalog source: the file's `servers` array when present,
    /// otherwise the numbered environment variables backed by `env_file`.
    pub fn catalog_provider(&self) -> Box<dyn CatalogProvider> {
        match &self.servers {
            Some(entries) => Box::new(FileCatalog::new(entries.clone())),
            None => {
                let env_file = self
                    .env_file
                    .as_deref()
                    .map(|path| expand_tilde(path).unwrap_or_else(|| PathBuf::from(path)));
                Box::new(
                    EnvCatalog::new(self.env_prefix.as_deref().unwrap_or("SERVER"))
                        .with_env_file(env_file),
                )
            }
        }
    }
}

/// Loads configuration from standard paths.
pub fn load_from_paths() -> Result<Config, ConfigError> {
    let home_dir_path = BaseDirs::new().map(|dirs| {
        dirs.home_dir().join(".sockswatch/config.json")
    });

    let current_dir_path = Path::new("./config.json").to_path_buf();

    let paths_to_check = [
        home_dir_path,
        Some(current_dir_path)
    ];

    for path in paths_to_check.iter().flatten() {
        if path.exists() {
            return read_config(path);
        }
    }

    // No file is not an error: the layer simply contributes nothing.
    Ok(Config::default())
}

/// Loads configuration from an explicit path, which must exist.
pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let path = expand_tilde(path).unwrap_or_else(|| path.to_path_buf());
    if !path.exists() {
        return Err(ConfigError::NotFound(path));
    }
    read_config(&path)
}

fn read_config(path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: Config = serde_json::from_str(&content)?;
    Ok(config)
}

/// Resolves a path that may start with `~/`.
pub fn expand_tilde<P: AsRef<Path>>(path: P) -> Option<PathBuf> {
    let path = path.as_ref();
    let Ok(rest) = path.strip_prefix("~") else {
        return Some(path.to_path_buf());
    };

    BaseDirs::new().map(|dirs| dirs.home_dir().join(rest))
}
