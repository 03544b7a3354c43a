use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::ConfigError;

/// Stable identity of a server within a catalog snapshot: its 1-based index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerId(pub u32);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::str::FromStr for ServerId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(ServerId)
    }
}

/// One tunnel definition: a dynamic forward on the local `port` through `host`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSpec {
    pub id: ServerId,
    pub host: String,
    pub port: u16,
    pub display_name: String,
}

impl ServerSpec {
    pub fn new(id: u32, host: &str, port: u16, display_name: Option<&str>) -> Self {
        let display_name = display_name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(host)
            .to_string();
        Self {
            id: ServerId(id),
            host: host.to_string(),
            port,
            display_name,
        }
    }

    /// Two specs describe the same tunnel when they share id, host and port.
    /// The display name is presentation only.
    pub fn same_tunnel(&self, other: &ServerSpec) -> bool {
        self.id == other.id && self.host == other.host && self.port == other.port
    }
}

/// A server entry as written in the `servers` array of the config file.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServerEntry {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// A validated, ordered snapshot of server definitions.
///
/// Every catalog that exists has unique ids, unique ports and non-empty hosts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerCatalog {
    specs: Vec<ServerSpec>,
}

impl ServerCatalog {
    /// Builds a catalog from already-identified specs, rejecting duplicates.
    pub fn from_specs(specs: Vec<ServerSpec>) -> Result<Self, ConfigError> {
        let mut ids = HashMap::new();
        let mut ports: HashMap<u16, ServerId> = HashMap::new();
        for spec in &specs {
            if spec.host.trim().is_empty() {
                return Err(ConfigError::EmptyHost { index: spec.id.0 });
            }
            if spec.port == 0 {
                return Err(ConfigError::InvalidPort {
                    index: spec.id.0,
                    value: spec.port.to_string(),
                });
            }
            if ids.insert(spec.id, ()).is_some() {
                return Err(ConfigError::DuplicateId { id: spec.id.0 });
            }
            if let Some(first) = ports.insert(spec.port, spec.id) {
                return Err(ConfigError::DuplicatePort {
                    port: spec.port,
                    first: first.0,
                    second: spec.id.0,
                });
            }
        }
        Ok(Self { specs })
    }

    /// Scans `<PREFIX>_<i>_HOST`, `<PREFIX>_<i>_PORT` and `<PREFIX>_<i>_DISPLAY_NAME`
    /// for i = 1, 2, ... through `lookup`, stopping at the first index missing
    /// either a host or a port.
    pub fn from_lookup<F>(prefix: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut raw = Vec::new();
        let mut index = 1u32;
        loop {
            let host = lookup(&format!("{prefix}_{index}_HOST"));
            let port = lookup(&format!("{prefix}_{index}_PORT"));
            let display_name = lookup(&format!("{prefix}_{index}_DISPLAY_NAME"));
            let Some(entry) = RawEntry::present(host, port, display_name) else {
                break;
            };
            raw.push(entry);
            index += 1;
        }
        Self::from_raw(raw)
    }

    /// Reads the `servers` array of the config file with the same
    /// stop-at-first-gap rule as the environment layout.
    pub fn from_entries(entries: &[ServerEntry]) -> Result<Self, ConfigError> {
        let raw = entries
            .iter()
            .map_while(|entry| {
                RawEntry::present(
                    entry.host.clone(),
                    entry.port.map(|p| p.to_string()),
                    entry.display_name.clone(),
                )
            })
            .collect();
        Self::from_raw(raw)
    }

    fn from_raw(raw: Vec<RawEntry>) -> Result<Self, ConfigError> {
        let mut specs = Vec::with_capacity(raw.len());
        for (i, entry) in raw.into_iter().enumerate() {
            let index = i as u32 + 1;
            let port = parse_port(index, &entry.port)?;
            specs.push(ServerSpec::new(
                index,
                &entry.host,
                port,
                entry.display_name.as_deref(),
            ));
        }
        Self::from_specs(specs)
    }

    pub fn specs(&self) -> &[ServerSpec] {
        &self.specs
    }

    pub fn get(&self, id: ServerId) -> Option<&ServerSpec> {
        self.specs.iter().find(|spec| spec.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServerSpec> {
        self.specs.iter()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

struct RawEntry {
    host: String,
    port: String,
    display_name: Option<String>,
}

impl RawEntry {
    fn present(
        host: Option<String>,
        port: Option<String>,
        display_name: Option<String>,
    ) -> Option<Self> {
        let host = host.map(|h| h.trim().to_string()).filter(|h| !h.is_empty())?;
        let port = port.map(|p| p.trim().to_string()).filter(|p| !p.is_empty())?;
        Some(Self {
            host,
            port,
            display_name,
        })
    }
}

fn parse_port(index: u32, value: &str) -> Result<u16, ConfigError> {
    match value.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(ConfigError::InvalidPort {
            index,
            value: value.to_string(),
        }),
    }
}

/// Anything that can produce a fresh catalog snapshot on demand.
pub trait CatalogProvider: Send + Sync {
    fn load(&self) -> Result<ServerCatalog, ConfigError>;
}

impl CatalogProvider for ServerCatalog {
    fn load(&self) -> Result<ServerCatalog, ConfigError> {
        Ok(self.clone())
    }
}

/// Reads servers from environment variables, falling back to a dotenv file.
///
/// The file is re-read on every `load`, so edits show up on reload. Variables
/// already set in the process environment win over the file.
pub struct EnvCatalog {
    prefix: String,
    env_file: Option<PathBuf>,
}

impl EnvCatalog {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            env_file: Some(PathBuf::from(".env")),
        }
    }

    /// Replaces the dotenv file; `None` reads the process environment only.
    pub fn with_env_file(mut self, path: Option<PathBuf>) -> Self {
        self.env_file = path;
        self
    }
}

/// Parses a dotenv file without touching the process environment.
/// A missing file contributes nothing.
fn read_env_file(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    for item in dotenvy::from_path_iter(path)? {
        let (key, value) = item?;
        vars.insert(key, value);
    }
    Ok(vars)
}

impl CatalogProvider for EnvCatalog {
    fn load(&self) -> Result<ServerCatalog, ConfigError> {
        let file_vars = match &self.env_file {
            Some(path) => read_env_file(path)?,
            None => HashMap::new(),
        };
        ServerCatalog::from_lookup(&self.prefix, |key| {
            std::env::var(key)
                .ok()
                .or_else(|| file_vars.get(key).cloned())
        })
    }
}

/// Reads servers from the `servers` array of a loaded config.
pub struct FileCatalog {
    entries: Vec<ServerEntry>,
}

impl FileCatalog {
    pub fn new(entries: Vec<ServerEntry>) -> Self {
        Self { entries }
    }
}

impl CatalogProvider for FileCatalog {
    fn load(&self) -> Result<ServerCatalog, ConfigError> {
        ServerCatalog::from_entries(&self.entries)
    }
}
