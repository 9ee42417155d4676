//! Connection profiles for the `sqt` command-line tool.
//!
//! ```toml
//! default = "local"
//!
//! [connections.local]
//! conninfo = "host=/var/run/postgresql"
//! database = "postgres"
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{SqtError, SqtResult};

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Profile {
    /// Connection string, `key=value` pairs or a `postgres://` URI
    pub conninfo: String,
    pub database: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Profile used when none is named.
    pub default: Option<String>,
    #[serde(default)]
    pub connections: HashMap<String, Profile>,
}

impl Config {
    /// `sqt/config.toml` in the user's configuration directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("sqt").join("config.toml"))
    }

    /// Load the default file. A missing file is an empty configuration.
    pub fn load() -> SqtResult<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> SqtResult<Self> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
            .map_err(|e| SqtError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn parse(content: &str) -> SqtResult<Self> {
        toml::from_str(content).map_err(|e| SqtError::Config(e.to_string()))
    }

    /// The named profile, or the default one when `name` is `None`.
    pub fn profile(&self, name: Option<&str>) -> SqtResult<Option<&Profile>> {
        let Some(name) = name.or(self.default.as_deref()) else {
            return Ok(None);
        };
        self.connections
            .get(name)
            .map(Some)
            .ok_or_else(|| SqtError::Config(format!("unknown connection profile: {}", name)))
    }
}
