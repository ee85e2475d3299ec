//! Loader configuration

use crate::{ModuleError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default compile cache budget (64 MiB)
pub const DEFAULT_COMPILE_CACHE_LIMIT: u64 = 64 * 1024 * 1024;

/// Module loader configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Extra directories searched for bare specifiers
    #[serde(default)]
    pub search_paths: Vec<PathBuf>,

    /// Extensions probed in priority order
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    /// Extensions whose contents are already compiled
    #[serde(default = "default_binary_extensions")]
    pub binary_extensions: Vec<String>,

    /// Dependency directory names searched from the base directory upward
    #[serde(default = "default_dependency_dirs")]
    pub dependency_dirs: Vec<String>,

    /// Manifest file name
    #[serde(default = "default_manifest_name")]
    pub manifest_name: String,

    /// Directory index file stem
    #[serde(default = "default_index_name")]
    pub index_name: String,

    /// Whether repeated loads are served from the module registry
    #[serde(default = "default_true")]
    pub enable_cache: bool,

    /// Maximum number of completed modules kept in memory
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: usize,

    /// Accept the `node:` prefix for built-in modules
    #[serde(default = "default_true")]
    pub node_compat: bool,

    /// Extra resolution conditions added to every context
    #[serde(default)]
    pub conditions: Vec<String>,

    /// Compile cache settings; the cache starts enabled when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile_cache: Option<CompileCacheConfig>,
}

/// On-disk compile cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileCacheConfig {
    /// Cache directory
    #[serde(default = "default_compile_cache_dir")]
    pub directory: PathBuf,

    /// Normalize sources before fingerprinting so entries survive moves
    #[serde(default)]
    pub portable: bool,

    /// Size budget in bytes
    #[serde(default = "default_size_limit")]
    pub size_limit: u64,

    /// Prefix stripped from sources in portable mode (defaults to the working directory)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub portable_root: Option<PathBuf>,
}

fn default_extensions() -> Vec<String> {
    [".js", ".mjs", ".cjs", ".json", ".wasm"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_binary_extensions() -> Vec<String> {
    vec![".wasm".to_string(), ".jsc".to_string()]
}

fn default_dependency_dirs() -> Vec<String> {
    vec!["node_modules".to_string()]
}

fn default_manifest_name() -> String {
    loadstar_package::DEFAULT_MANIFEST_NAME.to_string()
}

fn default_index_name() -> String {
    "index".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_cache_size() -> usize {
    1000
}

fn default_size_limit() -> u64 {
    DEFAULT_COMPILE_CACHE_LIMIT
}

/// `<home>/.loadstar/compile-cache`
pub fn default_compile_cache_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".loadstar")
        .join("compile-cache")
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            search_paths: Vec::new(),
            extensions: default_extensions(),
            binary_extensions: default_binary_extensions(),
            dependency_dirs: default_dependency_dirs(),
            manifest_name: default_manifest_name(),
            index_name: default_index_name(),
            enable_cache: true,
            max_cache_size: default_max_cache_size(),
            node_compat: true,
            conditions: Vec::new(),
            compile_cache: None,
        }
    }
}

impl Default for CompileCacheConfig {
    fn default() -> Self {
        Self {
            directory: default_compile_cache_dir(),
            portable: false,
            size_limit: DEFAULT_COMPILE_CACHE_LIMIT,
            portable_root: None,
        }
    }
}

impl CompileCacheConfig {
    /// Cache settings for `directory` with default limits
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::default()
        }
    }
}

impl LoaderConfig {
    /// Parse configuration from TOML
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| ModuleError::Config {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|error| ModuleError::IoError {
            path: path.to_path_buf(),
            error,
        })?;
        Self::from_toml_str(&content)
    }

    /// Serialize configuration to TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ModuleError::Config {
            message: e.to_string(),
        })
    }

    /// Check that the settings are usable
    pub fn validate(&self) -> Result<()> {
        if let Some(ext) = self
            .extensions
            .iter()
            .chain(&self.binary_extensions)
            .find(|ext| !ext.starts_with('.'))
        {
            return Err(ModuleError::Config {
                message: format!("extension '{}' must start with '.'", ext),
            });
        }
        if self.manifest_name.is_empty() {
            return Err(ModuleError::Config {
                message: "manifest_name cannot be empty".to_string(),
            });
        }
        if let Some(cache) = &self.compile_cache {
            if cache.size_limit == 0 {
                return Err(ModuleError::Config {
                    message: "compile_cache.size_limit must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Whether files with this extension hold precompiled contents
    pub fn is_binary_extension(&self, path: &Path) -> bool {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => self
                .binary_extensions
                .iter()
                .any(|b| b.trim_start_matches('.') == ext),
            None => false,
        }
    }
}
