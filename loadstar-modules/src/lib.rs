//! Loadstar Module System
//!
//! This crate provides the module-loading core of the Loadstar runtime:
//! - Specifier resolution (relative paths, dependency directories, manifests)
//! - An embedder hook chain for resolution and loading
//! - A persistent, size-bounded compile cache
//! - The module registry with cycle support and hot reload
//! - Statistics over all of the above

pub mod cache;
pub mod config;
pub mod engine;
pub mod environment;
pub mod error;
pub mod fingerprint;
pub mod hooks;
pub mod loader;
pub mod registry;
pub mod resolver;
pub mod stats;

pub use cache::{CacheLookup, CompileCache};
pub use config::{CompileCacheConfig, LoaderConfig};
pub use engine::{Bytecode, CompileError, CompileOptions, ExecutionScope, ScriptEngine};
pub use environment::ExportsHandle;
pub use error::{CacheError, ModuleError, Result};
pub use fingerprint::Fingerprint;
pub use hooks::{
    HookChain, HookOptions, HookReply, LoadContext, LoadOutput, NextLoad, NextResolve,
    RegistrationHandle, ResolutionContext, ResolveOutput,
};
pub use loader::{CompileCacheStatus, EnableStatus, ModuleLoader};
pub use registry::{ModuleId, ModuleRecord, ModuleRegistry, ModuleState};
pub use resolver::ModuleResolver;
pub use stats::{CompileCacheStats, ModuleCacheStats, ReloadResult, Statistics};

use serde::{Deserialize, Serialize};

/// How a module's contents are turned into a running module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleFormat {
    /// Source text compiled by the script engine
    Script,
    /// Already compiled contents, executed as is
    Binary,
    /// No backing file; exports come from the host
    Virtual,
}

impl ModuleFormat {
    /// Parse a format name as used by hooks
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "script" | "module" | "commonjs" | "json" => Some(ModuleFormat::Script),
            "binary" | "wasm" => Some(ModuleFormat::Binary),
            "virtual" | "builtin" => Some(ModuleFormat::Virtual),
            _ => None,
        }
    }
}

/// Module system a script is written for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleKind {
    CommonJs,
    Esm,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_names() {
        assert_eq!(ModuleFormat::parse("commonjs"), Some(ModuleFormat::Script));
        assert_eq!(ModuleFormat::parse("wasm"), Some(ModuleFormat::Binary));
        assert_eq!(ModuleFormat::parse("builtin"), Some(ModuleFormat::Virtual));
        assert_eq!(ModuleFormat::parse("jpeg"), None);
    }
}
