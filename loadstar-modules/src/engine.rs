//! Boundary to the external script engine

use crate::environment::ExportsHandle;
use crate::{ModuleFormat, ModuleKind};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Compiled bytecode, shared between the cache and the registry
#[derive(Clone, PartialEq, Eq)]
pub struct Bytecode(Arc<[u8]>);

impl Bytecode {
    /// Wrap raw bytecode bytes
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self(bytes.into())
    }

    /// The raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Size in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no bytes at all
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Bytecode {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes.into())
    }
}

impl fmt::Debug for Bytecode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bytecode({} bytes)", self.0.len())
    }
}

/// Options passed to the compiler. Serialized into the cache fingerprint,
/// so any change here produces a different cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompileOptions {
    /// Format of the source
    pub format: ModuleFormat,
    /// Module system the source is written for
    pub kind: ModuleKind,
    /// Compile in strict mode
    pub strict: bool,
    /// Drop debug information from the output
    pub strip_debug: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            format: ModuleFormat::Script,
            kind: ModuleKind::CommonJs,
            strict: false,
            strip_debug: false,
        }
    }
}

impl CompileOptions {
    /// Default options for a module of the given kind
    pub fn for_kind(kind: ModuleKind) -> Self {
        Self {
            kind,
            // ESM is always strict
            strict: kind == ModuleKind::Esm,
            ..Self::default()
        }
    }
}

/// The engine rejected a source text
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}{}", line.map(|l| format!(" (line {})", l)).unwrap_or_default())]
pub struct CompileError {
    /// Diagnostic message
    pub message: String,
    /// 1-based line, if known
    pub line: Option<u32>,
}

impl CompileError {
    /// An error without position information
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
        }
    }

    /// An error at a specific line
    pub fn at_line(message: impl Into<String>, line: u32) -> Self {
        Self {
            message: message.into(),
            line: Some(line),
        }
    }
}

/// The script engine the loader drives.
///
/// Compilation must be deterministic for a given source, version and
/// options: the compile cache relies on it.
pub trait ScriptEngine {
    /// Version string; part of every cache fingerprint
    fn version(&self) -> &str;

    /// Compile source text into bytecode
    fn compile(&self, source: &[u8], options: &CompileOptions) -> Result<Bytecode, CompileError>;

    /// Run a module body. The scope gives access to the module's exports
    /// and to `require` for its dependencies.
    fn execute(&self, bytecode: &Bytecode, scope: &mut ExecutionScope<'_>) -> anyhow::Result<()>;
}

/// Everything a module body can see while it runs
pub struct ExecutionScope<'a> {
    pub(crate) loader: &'a crate::ModuleLoader,
    pub(crate) id: String,
    pub(crate) base: std::path::PathBuf,
    pub(crate) exports: ExportsHandle,
    pub(crate) dependencies: Vec<String>,
}

impl<'a> ExecutionScope<'a> {
    /// Canonical id of the running module
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The module's exports, already visible to cyclic importers
    pub fn exports(&self) -> &ExportsHandle {
        &self.exports
    }

    /// Load a dependency relative to the running module
    pub fn require(&mut self, specifier: &str) -> crate::Result<ExportsHandle> {
        let (id, exports) = self.loader.require_from(specifier, &self.base)?;
        if !self.dependencies.contains(&id) {
            self.dependencies.push(id);
        }
        Ok(exports)
    }

    /// Dependencies required so far
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }
}
