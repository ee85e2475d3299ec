//! Module system error types

use crate::engine::CompileError;
use std::path::PathBuf;
use thiserror::Error;

/// Type alias for module system results
pub type Result<T> = std::result::Result<T, ModuleError>;

/// Errors that can occur in the module system
#[derive(Error, Debug)]
pub enum ModuleError {
    /// No candidate file exists for the specifier
    #[error("Module not found: {specifier} (from {base})")]
    ModuleNotFound {
        /// The specifier that was requested
        specifier: String,
        /// Directory the search started in
        base: String,
    },

    /// The specifier cannot be resolved by the default resolver at all
    #[error("Invalid module specifier '{specifier}': {reason}")]
    InvalidSpecifier {
        /// The offending specifier
        specifier: String,
        /// Why it was rejected
        reason: String,
    },

    /// `register_hooks` was called without a usable capability
    #[error("TypeError: {message}")]
    InvalidHookOptions {
        /// Error message
        message: String,
    },

    /// A hook failed; the hook's own error is carried unchanged
    #[error(transparent)]
    Hook(anyhow::Error),

    /// A hook neither called `next` nor asked to short-circuit
    #[error("{phase} hook #{hook_id} returned without calling next() and without short_circuit")]
    MissingShortCircuit {
        /// `resolve` or `load`
        phase: &'static str,
        /// Registration id of the hook
        hook_id: u32,
    },

    /// The script engine rejected the source
    #[error("Compile error in module {id}: {error}")]
    Compile {
        /// Canonical id of the module
        id: String,
        /// The engine's error
        #[source]
        error: CompileError,
    },

    /// The module body failed while running
    #[error("Error executing module {id}: {error}")]
    Execution {
        /// Canonical id of the module
        id: String,
        /// The engine's error
        #[source]
        error: anyhow::Error,
    },

    /// I/O error occurred while reading a module
    #[error("IO error reading module {path}: {error}")]
    IoError {
        /// Path to the module that failed to read
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        error: std::io::Error,
    },

    /// The module is suspended in another, unfinished load
    #[error("Module {id} is still being loaded")]
    LoadInProgress {
        /// Canonical id of the module
        id: String,
    },

    /// A load hook produced a deferred result during a synchronous load
    #[error("Load hook for {url} returned a pending result during a synchronous load")]
    AsyncHookInSyncLoad {
        /// Canonical id of the module
        url: String,
    },

    /// The compile cache could not be enabled
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Invalid loader configuration
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
    },
}

impl ModuleError {
    /// Wrap an embedder error raised inside a hook. Loader errors that a
    /// hook merely passed along (e.g. from `next`) come back unwrapped.
    pub fn hook(error: impl Into<anyhow::Error>) -> Self {
        match error.into().downcast::<ModuleError>() {
            Ok(inner) => inner,
            Err(error) => ModuleError::Hook(error),
        }
    }

    /// The embedder's error, if this failure came from a hook
    pub fn hook_error(&self) -> Option<&anyhow::Error> {
        match self {
            ModuleError::Hook(error) => Some(error),
            _ => None,
        }
    }
}

/// Failures inside the compile cache. Lookups recover from these locally;
/// only enabling the cache reports them to the caller.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Filesystem failure on a cache path
    #[error("Compile cache IO error on {path}: {error}")]
    Io {
        /// The path being accessed
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        error: std::io::Error,
    },

    /// A cache entry exists but does not validate
    #[error("Corrupt compile cache entry {path}: {reason}")]
    Corrupt {
        /// The entry file
        path: PathBuf,
        /// What failed to validate
        reason: String,
    },

    /// The directory index could not be encoded or decoded
    #[error("Compile cache index error: {0}")]
    Index(#[from] serde_json::Error),
}
