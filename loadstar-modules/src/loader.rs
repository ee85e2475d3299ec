//! Module loading functionality

use crate::cache::{CacheLookup, CompileCache};
use crate::engine::{Bytecode, CompileOptions, ExecutionScope, ScriptEngine};
use crate::environment::ExportsHandle;
use crate::fingerprint::Fingerprint;
use crate::hooks::{
    dispatch_load, dispatch_resolve, DefaultLoad, HookChain, HookOptions, HookReply, LoadContext,
    LoadOutput, RegistrationHandle, ResolutionContext, ResolveOutput,
};
use crate::registry::{ModuleId, ModuleRegistry, ModuleState};
use crate::resolver::{ModuleResolver, BUILTIN_PREFIX};
use crate::stats::{
    percentage, CompileCacheStats, ConfigurationSnapshot, ReloadDelta, ReloadResult, Statistics,
};
use crate::{
    CompileCacheConfig, LoaderConfig, ModuleError, ModuleFormat, ModuleKind, Result,
};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, info, warn};
use url::Url;

/// Outcome of enabling the compile cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnableStatus {
    /// The cache was opened by this call
    Enabled,
    /// A cache was already active; it was left as is
    AlreadyEnabled,
}

/// Report returned by `enable_compile_cache`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompileCacheStatus {
    pub status: EnableStatus,
    pub message: String,
    pub directory: PathBuf,
    pub portable: bool,
}

/// A fresh load waiting for its load hooks
struct PendingLoad {
    id: ModuleId,
    key: String,
    base: PathBuf,
    reply: HookReply<LoadOutput>,
}

enum LoadStart {
    /// Served from the registry
    Cached(String, ExportsHandle),
    Fresh(PendingLoad),
}

/// Module loader: owns the resolver, hook chain, registry and compile cache
/// of one runtime instance.
pub struct ModuleLoader {
    config: Rc<LoaderConfig>,
    engine: Rc<dyn ScriptEngine>,
    resolver: ModuleResolver,
    hooks: RefCell<HookChain>,
    registry: RefCell<ModuleRegistry>,
    compile_cache: RefCell<Option<CompileCache>>,
    builtins: RefCell<FxHashMap<String, ExportsHandle>>,
    main_loaded: Cell<bool>,
    /// Module bodies currently running; nested loads happen above zero
    executing: Cell<usize>,
}

impl ModuleLoader {
    /// Create a loader. The compile cache is opened when configured.
    pub fn new(config: LoaderConfig, engine: Rc<dyn ScriptEngine>) -> Result<Self> {
        config.validate()?;
        let config = Rc::new(config);
        let compile_cache = match &config.compile_cache {
            Some(cache_config) => Some(CompileCache::open(cache_config)?),
            None => None,
        };

        Ok(Self {
            resolver: ModuleResolver::new(config.clone()),
            registry: RefCell::new(ModuleRegistry::new(config.max_cache_size)),
            hooks: RefCell::new(HookChain::new()),
            compile_cache: RefCell::new(compile_cache),
            builtins: RefCell::new(FxHashMap::default()),
            main_loaded: Cell::new(false),
            executing: Cell::new(0),
            engine,
            config,
        })
    }

    /// Loader configuration
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Add a hook set to the chain
    pub fn register_hooks(&self, options: Option<HookOptions>) -> Result<RegistrationHandle> {
        self.hooks.borrow_mut().register(options)
    }

    /// Make a built-in module available as `builtin:<name>`
    pub fn define_builtin(&self, name: &str, exports: ExportsHandle) {
        self.resolver.register_builtin(name);
        self.builtins.borrow_mut().insert(name.to_string(), exports);
        debug!("Defined built-in module: {}", name);
    }

    /// Resolve a specifier through the hook chain
    pub fn resolve(&self, specifier: &str, base: &Path) -> Result<ResolveOutput> {
        let context = self.context(specifier, base, "require", false);
        self.resolve_with_hooks(specifier, &context)
    }

    /// Load a module synchronously; fails if a load hook answers asynchronously
    pub fn require(&self, specifier: &str, base: &Path) -> Result<ExportsHandle> {
        self.require_from(specifier, base).map(|(_, exports)| exports)
    }

    /// Load a module, waiting for asynchronous load hooks
    pub async fn import(&self, specifier: &str, base: &Path) -> Result<ExportsHandle> {
        self.registry.borrow_mut().record_load_started();
        let result = match self.start_load(specifier, base, "import") {
            Ok(LoadStart::Cached(_, exports)) => Ok(exports),
            Ok(LoadStart::Fresh(pending)) => {
                let PendingLoad { id, key, base, reply } = pending;
                let output = reply.resolve().await;
                self.finish_load(id, &key, &base, output)
            }
            Err(e) => Err(e),
        };
        self.record_outcome(specifier, &result);
        result
    }

    /// Synchronous load used by `require` and by executing modules
    pub(crate) fn require_from(&self, specifier: &str, base: &Path) -> Result<(String, ExportsHandle)> {
        self.registry.borrow_mut().record_load_started();
        let result = match self.start_load(specifier, base, "require") {
            Ok(LoadStart::Cached(key, exports)) => Ok((key, exports)),
            Ok(LoadStart::Fresh(pending)) => {
                let PendingLoad { id, key, base, reply } = pending;
                let output = match reply {
                    HookReply::Ready(output) => output,
                    HookReply::Pending(_) => Err(ModuleError::AsyncHookInSyncLoad { url: key.clone() }),
                };
                self.finish_load(id, &key, &base, output)
                    .map(|exports| (key, exports))
            }
            Err(e) => Err(e),
        };
        self.record_outcome(specifier, &result);
        result
    }

    fn record_outcome<T>(&self, specifier: &str, result: &Result<T>) {
        let mut registry = self.registry.borrow_mut();
        match result {
            Ok(_) => registry.record_load_succeeded(),
            Err(e) => {
                registry.record_load_failed();
                debug!("Failed to load '{}': {}", specifier, e);
            }
        }
    }

    fn context(&self, specifier: &str, base: &Path, condition: &str, is_main: bool) -> ResolutionContext {
        let mut conditions = vec![condition.to_string()];
        conditions.extend(self.config.conditions.iter().cloned());
        ResolutionContext {
            specifier: specifier.to_string(),
            base_path: base.to_path_buf(),
            conditions,
            is_main,
        }
    }

    fn resolve_with_hooks(&self, specifier: &str, context: &ResolutionContext) -> Result<ResolveOutput> {
        // Snapshot so no borrow is held while hooks run
        let chain = self.hooks.borrow_mut().resolve_chain();
        let default = |specifier: &str, context: &ResolutionContext| {
            self.resolver.resolve(specifier, context)
        };
        dispatch_resolve(&chain, &default, specifier, context)
    }

    fn load_with_hooks(&self, url: &str, context: &LoadContext) -> HookReply<LoadOutput> {
        let chain = self.hooks.borrow_mut().load_chain();
        let depth = chain.len();
        let config = self.config.clone();
        let default: DefaultLoad =
            Rc::new(move |url: &str, context: &LoadContext| default_load(&config, url, context));
        dispatch_load(chain, depth, default, url, context)
    }

    /// Resolve, consult the registry and start loading a fresh record
    fn start_load(&self, specifier: &str, base: &Path, condition: &str) -> Result<LoadStart> {
        // Only the first top-level load is the entry point
        let is_main = self.executing.get() == 0 && !self.main_loaded.get();
        if is_main {
            self.main_loaded.set(true);
        }
        let context = self.context(specifier, base, condition, is_main);
        let resolved = self.resolve_with_hooks(specifier, &context)?;
        let key = resolved.url;

        if let Some(exports) = self.cached_exports(&key)? {
            return Ok(LoadStart::Cached(key, exports));
        }

        let id = {
            let mut registry = self.registry.borrow_mut();
            registry.record_miss();
            let id = registry.insert(&key, resolved.format.unwrap_or(ModuleFormat::Script));
            registry.advance(id, ModuleState::Resolving);
            id
        };

        let module_base = match Path::new(&key).parent() {
            Some(parent) if Path::new(&key).is_absolute() => parent.to_path_buf(),
            _ => base.to_path_buf(),
        };
        let load_context = LoadContext {
            format: resolved.format,
            conditions: context.conditions,
            is_main: context.is_main,
        };
        let reply = self.load_with_hooks(&key, &load_context);
        Ok(LoadStart::Fresh(PendingLoad {
            id,
            key,
            base: module_base,
            reply,
        }))
    }

    /// Exports of an already known module, or why it cannot be used yet
    fn cached_exports(&self, key: &str) -> Result<Option<ExportsHandle>> {
        let mut registry = self.registry.borrow_mut();
        let Some(id) = registry.lookup(key) else {
            return Ok(None);
        };
        let Some(record) = registry.get(id) else {
            return Ok(None);
        };

        match record.state() {
            ModuleState::Complete if self.config.enable_cache => {
                let exports = record.exports().cloned();
                if exports.is_some() {
                    registry.record_hit();
                    registry.touch(id);
                }
                Ok(exports)
            }
            // Cycle: hand out the partially populated exports
            ModuleState::Executing => Ok(record.exports().cloned()),
            ModuleState::Unresolved | ModuleState::Resolving | ModuleState::Compiling => {
                Err(ModuleError::LoadInProgress { id: key.to_string() })
            }
            ModuleState::Complete | ModuleState::Errored => Ok(None),
        }
    }

    fn finish_load(
        &self,
        id: ModuleId,
        key: &str,
        base: &Path,
        output: Result<LoadOutput>,
    ) -> Result<ExportsHandle> {
        let result = output.and_then(|output| self.compile_and_execute(id, key, base, output));
        match &result {
            Ok(_) => info!("Loaded module: {}", key),
            Err(e) => self.registry.borrow_mut().fail(id, e.to_string()),
        }
        result
    }

    fn compile_and_execute(
        &self,
        id: ModuleId,
        key: &str,
        base: &Path,
        output: LoadOutput,
    ) -> Result<ExportsHandle> {
        {
            let mut registry = self.registry.borrow_mut();
            registry.set_format(id, output.format);
            registry.advance(id, ModuleState::Compiling);
        }

        if output.format == ModuleFormat::Virtual {
            let name = key.strip_prefix(BUILTIN_PREFIX).unwrap_or(key);
            let exports = self.builtins.borrow().get(name).cloned().ok_or_else(|| {
                ModuleError::ModuleNotFound {
                    specifier: key.to_string(),
                    base: base.display().to_string(),
                }
            })?;
            let mut registry = self.registry.borrow_mut();
            registry.set_exports(id, exports.clone());
            registry.begin_execution(id);
            registry.complete(id);
            return Ok(exports);
        }

        let source = output.source.ok_or_else(|| ModuleError::Compile {
            id: key.to_string(),
            error: crate::engine::CompileError::new("load produced no source"),
        })?;
        let (fingerprint, bytecode) = match output.format {
            ModuleFormat::Binary => (None, Bytecode::from(source.clone())),
            _ => self.compile(key, &source)?,
        };

        let exports = {
            let mut registry = self.registry.borrow_mut();
            registry.set_compiled(id, fingerprint, source.len());
            registry.begin_execution(id).unwrap_or_default()
        };

        let mut scope = ExecutionScope {
            loader: self,
            id: key.to_string(),
            base: base.to_path_buf(),
            exports: exports.clone(),
            dependencies: Vec::new(),
        };
        self.executing.set(self.executing.get() + 1);
        let executed = self.engine.execute(&bytecode, &mut scope);
        self.executing.set(self.executing.get() - 1);
        executed.map_err(|error| ModuleError::Execution {
            id: key.to_string(),
            error,
        })?;

        let mut registry = self.registry.borrow_mut();
        registry.set_dependencies(id, scope.dependencies);
        registry.complete(id);
        Ok(exports)
    }

    fn compile(&self, key: &str, source: &[u8]) -> Result<(Option<Fingerprint>, Bytecode)> {
        let path = Path::new(key);
        let kind = if path.is_absolute() {
            self.resolver.module_kind(path)
        } else {
            ModuleKind::CommonJs
        };
        let options = CompileOptions::for_kind(kind);
        let engine = self.engine.clone();
        // The compiler may call back into the loader, so the cache is not
        // borrowed while it runs
        let lookup = self
            .compile_cache
            .borrow_mut()
            .as_mut()
            .map(|cache| cache.lookup(source, engine.version(), &options));
        let fingerprint = match lookup {
            Some(CacheLookup::Hit(fingerprint, bytecode)) => return Ok((Some(fingerprint), bytecode)),
            Some(CacheLookup::Miss(fingerprint)) => Some(fingerprint),
            None => None,
        };

        let bytecode = engine
            .compile(source, &options)
            .map_err(|error| ModuleError::Compile {
                id: key.to_string(),
                error,
            })?;
        if let Some(fingerprint) = fingerprint {
            if let Some(cache) = self.compile_cache.borrow_mut().as_mut() {
                cache.store(fingerprint, engine.version(), &bytecode);
            }
        }
        Ok((fingerprint, bytecode))
    }

    /// Enable the compile cache in `directory` (default `<home>/.loadstar/compile-cache`)
    pub fn enable_compile_cache(&self, directory: Option<&Path>, portable: bool) -> Result<CompileCacheStatus> {
        let mut config = self.config.compile_cache.clone().unwrap_or_default();
        if let Some(directory) = directory {
            config.directory = directory.to_path_buf();
        }
        config.portable = portable;
        self.enable_compile_cache_with(config)
    }

    /// Enable the compile cache with explicit settings
    pub fn enable_compile_cache_with(&self, config: CompileCacheConfig) -> Result<CompileCacheStatus> {
        let mut slot = self.compile_cache.borrow_mut();
        if let Some(cache) = slot.as_ref() {
            return Ok(CompileCacheStatus {
                status: EnableStatus::AlreadyEnabled,
                message: "Compile cache already enabled".to_string(),
                directory: cache.directory().to_path_buf(),
                portable: cache.is_portable(),
            });
        }

        let cache = CompileCache::open(&config)?;
        let status = CompileCacheStatus {
            status: EnableStatus::Enabled,
            message: "Compile cache enabled".to_string(),
            directory: cache.directory().to_path_buf(),
            portable: cache.is_portable(),
        };
        *slot = Some(cache);
        Ok(status)
    }

    /// Compile cache counters, if the cache is enabled
    pub fn compile_cache_stats(&self) -> Option<CompileCacheStats> {
        self.compile_cache.borrow().as_ref().map(CompileCache::stats)
    }

    /// Delete every compile cache entry; returns how many were removed
    pub fn clear_compile_cache(&self) -> usize {
        self.compile_cache
            .borrow_mut()
            .as_mut()
            .map_or(0, CompileCache::clear)
    }

    /// Forget finished modules (the compile cache is untouched)
    pub fn clear_module_cache(&self) -> usize {
        self.registry.borrow_mut().clear()
    }

    /// Nearest manifest for `path`, taken relative to `base`
    pub fn find_package_manifest(&self, path: &str, base: &Path) -> Option<PathBuf> {
        self.resolver.find_package_manifest(&base.join(path))
    }

    /// State of a module by canonical id
    pub fn module_state(&self, id: &str) -> Option<ModuleState> {
        self.registry.borrow().get_by_key(id).map(|r| r.state())
    }

    /// Dependencies recorded for a module
    pub fn module_dependencies(&self, id: &str) -> Vec<String> {
        self.registry
            .borrow()
            .get_by_key(id)
            .map(|r| r.dependencies().to_vec())
            .unwrap_or_default()
    }

    /// Re-read and re-run one module. Failures are reported in the result.
    pub fn reload_module(&self, path_or_specifier: &str, base: &Path) -> ReloadResult {
        let before = self.registry.borrow().load_counters();
        let mut result = ReloadResult {
            path: path_or_specifier.to_string(),
            resolved_path: None,
            was_cached: false,
            reload_success: false,
            error: None,
            statistics: ReloadDelta::default(),
            exports: None,
        };

        match self.reload_inner(path_or_specifier, base, &mut result) {
            Ok(exports) => {
                result.reload_success = true;
                result.exports = Some(exports.to_json());
                info!("Reloaded module: {}", path_or_specifier);
            }
            Err(e) => {
                warn!("Reload of '{}' failed: {}", path_or_specifier, e);
                result.error = Some(e.to_string());
            }
        }

        let after = self.registry.borrow().load_counters();
        result.statistics = ReloadDelta::between(before, after);
        result
    }

    fn reload_inner(&self, specifier: &str, base: &Path, result: &mut ReloadResult) -> Result<ExportsHandle> {
        let context = self.context(specifier, base, "require", false);
        let key = self.resolve_with_hooks(specifier, &context)?.url;
        result.resolved_path = Some(key.clone());

        if let Some(name) = key.strip_prefix(BUILTIN_PREFIX) {
            // Built-ins have nothing to re-read
            result.was_cached = self.registry.borrow().lookup(&key).is_some();
            return self.builtins.borrow().get(name).cloned().ok_or_else(|| {
                ModuleError::ModuleNotFound {
                    specifier: specifier.to_string(),
                    base: base.display().to_string(),
                }
            });
        }

        let previous = {
            let mut registry = self.registry.borrow_mut();
            if let Some(record) = registry.get_by_key(&key) {
                if !record.state().is_terminal() {
                    return Err(ModuleError::LoadInProgress { id: key });
                }
            }
            registry.invalidate(&key)
        };
        result.was_cached = previous.is_some();

        if let Some(fingerprint) = previous.and_then(|record| record.fingerprint()) {
            if let Some(cache) = self.compile_cache.borrow_mut().as_mut() {
                cache.remove(fingerprint);
            }
        }
        self.resolver.clear_manifest_cache();

        self.require(&key, base)
    }

    /// Snapshot of every counter. Never changes loader state.
    pub fn get_statistics(&self) -> Statistics {
        let registry = self.registry.borrow();
        let loads = registry.load_counters();
        let module_cache = registry.stats();
        Statistics {
            loads_total: loads.total,
            loads_success: loads.success,
            loads_failed: loads.failed,
            success_rate: percentage(loads.success, loads.total),
            cache_hits: module_cache.hits,
            cache_misses: module_cache.misses,
            cache_hit_rate: percentage(module_cache.hits, module_cache.hits + module_cache.misses),
            memory_used: registry.memory_used(),
            module_cache,
            compile_cache: self.compile_cache_stats(),
            hooks: self.hooks.borrow().stats(),
            configuration: ConfigurationSnapshot {
                cache_enabled: self.config.enable_cache,
                node_compat_enabled: self.config.node_compat,
                max_cache_size: self.config.max_cache_size,
            },
        }
    }

    /// Persist the compile cache index
    pub fn flush(&self) -> Result<()> {
        if let Some(cache) = self.compile_cache.borrow_mut().as_mut() {
            cache.flush()?;
        }
        Ok(())
    }
}

/// Read a file-backed module from disk
fn default_load(config: &LoaderConfig, url: &str, context: &LoadContext) -> HookReply<LoadOutput> {
    if url.starts_with(BUILTIN_PREFIX) {
        return HookReply::ready(LoadOutput::new(ModuleFormat::Virtual, None));
    }

    let path = match Url::parse(url) {
        Ok(parsed) if parsed.scheme() == "file" => parsed.to_file_path().unwrap_or_default(),
        _ => PathBuf::from(url),
    };
    if !path.is_absolute() {
        return HookReply::Ready(Err(ModuleError::InvalidSpecifier {
            specifier: url.to_string(),
            reason: "no load hook handled this URL".to_string(),
        }));
    }

    match fs::read(&path) {
        Ok(source) => {
            let format = match context.format {
                Some(format) if format != ModuleFormat::Virtual => format,
                _ if config.is_binary_extension(&path) => ModuleFormat::Binary,
                _ => ModuleFormat::Script,
            };
            HookReply::ready(LoadOutput::new(format, Some(source)))
        }
        Err(error) => HookReply::Ready(Err(ModuleError::IoError { path, error })),
    }
}
