// src/config.rs
//! Configuration for a brewer installation
//!
//! A TOML file supplies the layout and build settings:
//!
//! ```toml
//! prefix = "/opt/brewer"
//! cellar = "/opt/brewer/Cellar"      # defaults to <prefix>/Cellar
//! state_dir = "/opt/brewer/.brewer"  # defaults to <prefix>/.brewer
//! formula_dir = "/opt/brewer/formulas"
//!
//! [build]
//! jobs = 8
//! timeout_secs = 3600
//! optimization = "O2"
//! ```
//!
//! `BREWER_PREFIX`, `BREWER_CELLAR`, `BREWER_STATE_DIR` and
//! `BREWER_FORMULA_DIR` override the file.

use crate::build::BuildSettings;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Prefix used when neither the file nor the environment names one
pub const DEFAULT_PREFIX: &str = "/opt/brewer";

/// Where the CLI looks for a configuration file by default
pub const DEFAULT_CONFIG_PATH: &str = "/etc/brewer.toml";

/// Resolved configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// The shared prefix kegs are linked into
    pub prefix: PathBuf,
    /// Keg store root
    pub cellar: PathBuf,
    /// History database, prefix lock and download cache
    pub state_dir: PathBuf,
    /// Default directory of `<name>.toml` formula files
    pub formula_dir: Option<PathBuf>,
    pub build: BuildSettings,
}

/// On-disk form; every path is optional
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    prefix: Option<PathBuf>,
    cellar: Option<PathBuf>,
    state_dir: Option<PathBuf>,
    formula_dir: Option<PathBuf>,
    build: BuildSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self::for_prefix(DEFAULT_PREFIX)
    }
}

impl Config {
    /// Default layout rooted at `prefix`
    pub fn for_prefix(prefix: impl Into<PathBuf>) -> Self {
        let prefix = prefix.into();
        Self {
            cellar: prefix.join("Cellar"),
            state_dir: prefix.join(".brewer"),
            prefix,
            formula_dir: None,
            build: BuildSettings::default(),
        }
    }

    /// Load from `path` (if it exists) and apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let contents = match path {
            Some(path) if path.exists() => {
                debug!("Reading configuration from {}", path.display());
                Some(fs::read_to_string(path)?)
            }
            _ => None,
        };
        Self::resolve(contents.as_deref(), |key| std::env::var(key).ok())
    }

    /// Parse TOML text without consulting the environment
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Self::resolve(Some(contents), |_| None)
    }

    fn resolve(contents: Option<&str>, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let file: ConfigFile = match contents {
            Some(text) => toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?,
            None => ConfigFile::default(),
        };

        let prefix = env("BREWER_PREFIX")
            .map(PathBuf::from)
            .or(file.prefix)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PREFIX));
        let cellar = env("BREWER_CELLAR")
            .map(PathBuf::from)
            .or(file.cellar)
            .unwrap_or_else(|| prefix.join("Cellar"));
        let state_dir = env("BREWER_STATE_DIR")
            .map(PathBuf::from)
            .or(file.state_dir)
            .unwrap_or_else(|| prefix.join(".brewer"));
        let formula_dir = env("BREWER_FORMULA_DIR")
            .map(PathBuf::from)
            .or(file.formula_dir);

        let config = Self {
            prefix,
            cellar,
            state_dir,
            formula_dir,
            build: file.build,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (name, path) in [
            ("prefix", &self.prefix),
            ("cellar", &self.cellar),
            ("state_dir", &self.state_dir),
        ] {
            if !path.is_absolute() {
                return Err(Error::Config(format!(
                    "{} must be an absolute path, got {}",
                    name,
                    path.display()
                )));
            }
        }
        if self.build.jobs == Some(0) {
            return Err(Error::Config("build.jobs must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join("brewer.db")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join("prefix.lock")
    }

    /// Download cache for source archives
    pub fn cache_dir(&self) -> PathBuf {
        self.state_dir.join("cache")
    }

    pub fn build_timeout(&self) -> Option<Duration> {
        self.build.timeout_secs.map(Duration::from_secs)
    }
}
