//! Shared fixtures for loader integration tests

#![allow(dead_code)]

use anyhow::{anyhow, Context};
use loadstar_modules::{
    Bytecode, CompileError, CompileOptions, ExecutionScope, LoaderConfig, ModuleLoader,
    ScriptEngine,
};
use serde_json::Value;
use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

pub const ENGINE_VERSION: &str = "fake-engine 1.0";

/// A tiny line-based "language":
///
/// ```text
/// export name = <json or bare word>
/// import name from <specifier>    # exports[name] = dependency's exports
/// peek name from <specifier>      # exports[name] = dependency's `ready` (or null)
/// require <specifier>
/// throw <message>
/// ! anything                      # compile error
/// ```
pub struct FakeEngine {
    compiles: Cell<usize>,
    executions: Cell<usize>,
}

impl FakeEngine {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            compiles: Cell::new(0),
            executions: Cell::new(0),
        })
    }

    pub fn compiles(&self) -> usize {
        self.compiles.get()
    }

    pub fn executions(&self) -> usize {
        self.executions.get()
    }
}

impl ScriptEngine for FakeEngine {
    fn version(&self) -> &str {
        ENGINE_VERSION
    }

    fn compile(&self, source: &[u8], options: &CompileOptions) -> Result<Bytecode, CompileError> {
        self.compiles.set(self.compiles.get() + 1);
        let text = std::str::from_utf8(source).map_err(|_| CompileError::new("invalid utf-8"))?;
        for (number, line) in text.lines().enumerate() {
            if line.trim_start().starts_with('!') {
                return Err(CompileError::at_line(
                    format!("unexpected token in '{}'", line.trim()),
                    number as u32 + 1,
                ));
            }
        }
        let mut bytecode = format!("FAKE {:?}\n", options.kind).into_bytes();
        bytecode.extend_from_slice(source);
        Ok(Bytecode::from(bytecode))
    }

    fn execute(&self, bytecode: &Bytecode, scope: &mut ExecutionScope<'_>) -> anyhow::Result<()> {
        self.executions.set(self.executions.get() + 1);
        let text = std::str::from_utf8(bytecode.as_bytes())?;
        let body = text
            .strip_prefix("FAKE ")
            .and_then(|rest| rest.split_once('\n'))
            .map(|(_, body)| body)
            .unwrap_or(text);

        for line in body.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(rest) = line.strip_prefix("export ") {
                let (name, value) = rest
                    .split_once('=')
                    .ok_or_else(|| anyhow!("malformed export: {}", line))?;
                let value = value.trim();
                let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
                scope.exports().set(name.trim(), value);
            } else if let Some(rest) = line.strip_prefix("import ") {
                let (name, spec) = rest
                    .split_once(" from ")
                    .ok_or_else(|| anyhow!("malformed import: {}", line))?;
                let dep = scope.require(spec.trim()).context("import failed")?;
                scope.exports().set(name.trim(), dep.to_json());
            } else if let Some(rest) = line.strip_prefix("peek ") {
                let (name, spec) = rest
                    .split_once(" from ")
                    .ok_or_else(|| anyhow!("malformed peek: {}", line))?;
                let dep = scope.require(spec.trim())?;
                scope
                    .exports()
                    .set(name.trim(), dep.get("ready").unwrap_or(Value::Null));
            } else if let Some(spec) = line.strip_prefix("require ") {
                scope.require(spec.trim())?;
            } else if let Some(message) = line.strip_prefix("throw ") {
                return Err(anyhow!("{}", message));
            } else {
                return Err(anyhow!("unknown statement: {}", line));
            }
        }
        Ok(())
    }
}

/// Write `content` to `root/relative`, creating parent directories
pub fn write(root: &Path, relative: &str, content: &str) -> PathBuf {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, content).unwrap();
    path
}

/// Canonical id the loader uses for a file
pub fn id_of(path: &Path) -> String {
    path.canonicalize().unwrap().to_string_lossy().into_owned()
}

pub fn loader_with(config: LoaderConfig, engine: &Rc<FakeEngine>) -> ModuleLoader {
    ModuleLoader::new(config, engine.clone()).unwrap()
}

pub fn loader(engine: &Rc<FakeEngine>) -> ModuleLoader {
    loader_with(LoaderConfig::default(), engine)
}
