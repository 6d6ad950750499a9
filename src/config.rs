//! TOML configuration.
//!
//! Every key is optional:
//!
//! ```toml
//! storage_root = "/var/lib/clone-store/clones"
//! metadata_path = "/var/lib/clone-store/clones.json"
//! host_identifier = "com.example.cloner"
//! denylist = ["com.apple.finder"]
//! copy_buffer_bytes = 1048576
//!
//! [[sources]]
//! identifier = "com.example.app"
//! display_name = "App"
//! version_label = "1.0"
//! payload_path = "/Applications/App.app/Contents/MacOS/App"
//! ```
//!
//! Relative paths are resolved against the directory holding the file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::copier::DEFAULT_BUFFER_BYTES;
use crate::model::SourceArtifact;

/// Identifier of this tool, which it refuses to clone.
pub const DEFAULT_HOST_IDENTIFIER: &str = "org.clone-store.cli";

const APP_DIR: &str = "clone-store";
const CONFIG_FILENAME: &str = "config.toml";

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "CLONE_STORE_CONFIG";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    storage_root: Option<PathBuf>,
    metadata_path: Option<PathBuf>,
    host_identifier: Option<String>,
    denylist: Option<Vec<String>>,
    copy_buffer_bytes: Option<usize>,
    sources: Option<Vec<SourceArtifact>>,
}

/// Resolved configuration.
#[derive(Debug, Clone)]
pub struct CloneStoreConfig {
    pub storage_root: PathBuf,
    pub metadata_path: PathBuf,
    pub host_identifier: String,
    pub denylist: Vec<String>,
    pub copy_buffer_bytes: usize,
    pub sources: Vec<SourceArtifact>,
}

impl Default for CloneStoreConfig {
    fn default() -> Self {
        let base = default_data_dir();
        Self {
            storage_root: base.join("clones"),
            metadata_path: base.join("clones.json"),
            host_identifier: DEFAULT_HOST_IDENTIFIER.to_string(),
            denylist: Vec::new(),
            copy_buffer_bytes: DEFAULT_BUFFER_BYTES,
            sources: Vec::new(),
        }
    }
}

impl CloneStoreConfig {
    /// Load and resolve a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config '{}'", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&text, base).with_context(|| format!("parsing config '{}'", path.display()))
    }

    /// Load `explicit` if given, else the file named by [`CONFIG_ENV`], else
    /// the default location. Only a missing *default* file falls back to
    /// built-in defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Self::load(Path::new(&path));
        }
        match default_config_path() {
            Some(path) if path.is_file() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Parse TOML text, resolving relative paths against `base`.
    pub fn parse(text: &str, base: &Path) -> Result<Self> {
        let parsed: ConfigToml = toml::from_str(text)?;
        let defaults = Self::default();
        let resolve = |p: PathBuf| if p.is_absolute() { p } else { base.join(p) };

        let host_identifier = parsed
            .host_identifier
            .map(|s| s.trim().to_string())
            .unwrap_or(defaults.host_identifier);
        anyhow::ensure!(!host_identifier.is_empty(), "host_identifier must not be empty");

        let mut denylist: Vec<String> = parsed
            .denylist
            .unwrap_or_default()
            .into_iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect();
        denylist.sort();
        denylist.dedup();

        let sources = parsed
            .sources
            .unwrap_or_default()
            .into_iter()
            .map(|mut source| {
                source.payload_path = resolve(source.payload_path);
                source
            })
            .collect();

        Ok(Self {
            storage_root: parsed
                .storage_root
                .map(resolve)
                .unwrap_or(defaults.storage_root),
            metadata_path: parsed
                .metadata_path
                .map(resolve)
                .unwrap_or(defaults.metadata_path),
            host_identifier,
            denylist,
            copy_buffer_bytes: parsed
                .copy_buffer_bytes
                .unwrap_or(defaults.copy_buffer_bytes),
            sources,
        })
    }
}

/// `<config dir>/clone-store/config.toml`, when the platform has one.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILENAME))
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from(".").join(format!(".{APP_DIR}")))
}
