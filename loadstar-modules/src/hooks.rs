//! Embedder hooks intercepting resolution and loading
//!
//! Hooks are dispatched last-registered-first. Each hook gets a `next`
//! continuation running the earlier-registered hooks and finally the
//! built-in behavior. A hook that returns its own result without calling
//! `next` must say so with `short_circuit`.

use crate::{ModuleError, ModuleFormat, Result};
use serde::Serialize;
use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::rc::Rc;
use tracing::{debug, trace};

/// A deferred hook result
pub type HookFuture<T> = Pin<Box<dyn Future<Output = Result<T>>>>;

/// Result of a hook that may finish later
pub enum HookReply<T> {
    /// The result is available now
    Ready(Result<T>),
    /// The result is still being produced
    Pending(HookFuture<T>),
}

impl<T: 'static> HookReply<T> {
    /// An immediate success
    pub fn ready(value: T) -> Self {
        HookReply::Ready(Ok(value))
    }

    /// An immediate failure raised by the hook itself
    pub fn error(error: impl Into<anyhow::Error>) -> Self {
        HookReply::Ready(Err(ModuleError::hook(error)))
    }

    /// A result produced by a future
    pub fn pending(future: impl Future<Output = Result<T>> + 'static) -> Self {
        HookReply::Pending(Box::pin(future))
    }

    /// Whether the result is deferred
    pub fn is_pending(&self) -> bool {
        matches!(self, HookReply::Pending(_))
    }

    /// Transform a successful result, now or once it arrives
    pub fn and_then<U: 'static>(self, f: impl FnOnce(T) -> Result<U> + 'static) -> HookReply<U> {
        match self {
            HookReply::Ready(result) => HookReply::Ready(result.and_then(f)),
            HookReply::Pending(future) => HookReply::pending(async move { f(future.await?) }),
        }
    }

    /// Wait for the result
    pub async fn resolve(self) -> Result<T> {
        match self {
            HookReply::Ready(result) => result,
            HookReply::Pending(future) => future.await,
        }
    }
}

impl<T> fmt::Debug for HookReply<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookReply::Ready(Ok(_)) => f.write_str("Ready(Ok(..))"),
            HookReply::Ready(Err(e)) => write!(f, "Ready(Err({}))", e),
            HookReply::Pending(_) => f.write_str("Pending"),
        }
    }
}

/// Input to a resolve hook
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionContext {
    /// The specifier as originally requested
    pub specifier: String,
    /// Directory of the requesting module
    pub base_path: PathBuf,
    /// Active conditions, e.g. `require` or `import`
    pub conditions: Vec<String>,
    /// Whether this is the program's entry module
    pub is_main: bool,
}

impl ResolutionContext {
    /// Context for a request made from `base_path`
    pub fn new(specifier: impl Into<String>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            specifier: specifier.into(),
            base_path: base_path.into(),
            conditions: Vec::new(),
            is_main: false,
        }
    }

    /// Replace the conditions
    pub fn with_conditions(mut self, conditions: Vec<String>) -> Self {
        self.conditions = conditions;
        self
    }

    /// Whether a condition is active
    pub fn has_condition(&self, condition: &str) -> bool {
        self.conditions.iter().any(|c| c == condition)
    }
}

/// Output of a resolve hook
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveOutput {
    /// Canonical id: an absolute path, `builtin:` id or URL
    pub url: String,
    /// Format hint for the load phase
    pub format: Option<ModuleFormat>,
    /// The hook did not call `next` on purpose
    pub short_circuit: bool,
}

impl ResolveOutput {
    /// A resolution result without format hint
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            format: None,
            short_circuit: false,
        }
    }

    /// Attach a format hint
    pub fn with_format(mut self, format: ModuleFormat) -> Self {
        self.format = Some(format);
        self
    }

    /// Mark as final, skipping the rest of the chain
    pub fn short_circuit(mut self) -> Self {
        self.short_circuit = true;
        self
    }
}

/// Input to a load hook
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadContext {
    /// Format chosen by resolution, if any
    pub format: Option<ModuleFormat>,
    /// Active conditions
    pub conditions: Vec<String>,
    /// Whether this is the program's entry module
    pub is_main: bool,
}

/// Output of a load hook
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOutput {
    /// Format of `source`
    pub format: ModuleFormat,
    /// Module contents; `None` for virtual modules
    pub source: Option<Vec<u8>>,
    /// The hook did not call `next` on purpose
    pub short_circuit: bool,
}

impl LoadOutput {
    /// Source text for a script module
    pub fn script(source: impl Into<Vec<u8>>) -> Self {
        Self {
            format: ModuleFormat::Script,
            source: Some(source.into()),
            short_circuit: false,
        }
    }

    /// Contents of the given format
    pub fn new(format: ModuleFormat, source: Option<Vec<u8>>) -> Self {
        Self {
            format,
            source,
            short_circuit: false,
        }
    }

    /// Mark as final, skipping the rest of the chain
    pub fn short_circuit(mut self) -> Self {
        self.short_circuit = true;
        self
    }
}

/// Built-in resolution at the end of the chain
pub type DefaultResolve<'a> = &'a dyn Fn(&str, &ResolutionContext) -> Result<ResolveOutput>;

/// Built-in loading at the end of the chain
pub type DefaultLoad = Rc<dyn Fn(&str, &LoadContext) -> HookReply<LoadOutput>>;

type ResolveEntry = (u32, Rc<dyn ResolveHook>);
type LoadEntry = (u32, Rc<dyn LoadHook>);

/// Intercepts specifier resolution
pub trait ResolveHook {
    /// Resolve `specifier`, optionally delegating to `next`
    fn resolve(
        &self,
        specifier: &str,
        context: &ResolutionContext,
        next: &NextResolve<'_>,
    ) -> anyhow::Result<ResolveOutput>;
}

impl<F> ResolveHook for F
where
    F: Fn(&str, &ResolutionContext, &NextResolve<'_>) -> anyhow::Result<ResolveOutput>,
{
    fn resolve(
        &self,
        specifier: &str,
        context: &ResolutionContext,
        next: &NextResolve<'_>,
    ) -> anyhow::Result<ResolveOutput> {
        self(specifier, context, next)
    }
}

/// Intercepts source acquisition; may answer asynchronously
pub trait LoadHook {
    /// Load `url`, optionally delegating to `next`
    fn load(&self, url: &str, context: &LoadContext, next: NextLoad) -> HookReply<LoadOutput>;
}

impl<F> LoadHook for F
where
    F: Fn(&str, &LoadContext, NextLoad) -> HookReply<LoadOutput>,
{
    fn load(&self, url: &str, context: &LoadContext, next: NextLoad) -> HookReply<LoadOutput> {
        self(url, context, next)
    }
}

/// Continuation into the earlier-registered resolve hooks
pub struct NextResolve<'a> {
    hooks: &'a [ResolveEntry],
    default: DefaultResolve<'a>,
    called: Cell<bool>,
}

impl NextResolve<'_> {
    /// Run the rest of the chain
    pub fn call(&self, specifier: &str, context: &ResolutionContext) -> Result<ResolveOutput> {
        self.called.set(true);
        dispatch_resolve(self.hooks, self.default, specifier, context)
    }
}

/// Continuation into the earlier-registered load hooks. Owned so async
/// hooks can carry it into their futures.
#[derive(Clone)]
pub struct NextLoad {
    hooks: Rc<[LoadEntry]>,
    depth: usize,
    default: DefaultLoad,
    called: Rc<Cell<bool>>,
}

impl NextLoad {
    /// Run the rest of the chain
    pub fn call(&self, url: &str, context: &LoadContext) -> HookReply<LoadOutput> {
        self.called.set(true);
        dispatch_load(self.hooks.clone(), self.depth, self.default.clone(), url, context)
    }
}

/// Run resolve hooks over `hooks` (registration order), newest first
pub fn dispatch_resolve(
    hooks: &[ResolveEntry],
    default: DefaultResolve<'_>,
    specifier: &str,
    context: &ResolutionContext,
) -> Result<ResolveOutput> {
    let Some(((hook_id, hook), rest)) = hooks.split_last() else {
        return default(specifier, context);
    };

    trace!("Dispatching resolve hook #{} for '{}'", hook_id, specifier);
    let next = NextResolve {
        hooks: rest,
        default,
        called: Cell::new(false),
    };
    let output = hook
        .resolve(specifier, context, &next)
        .map_err(ModuleError::hook)?;

    if !next.called.get() && !output.short_circuit {
        return Err(ModuleError::MissingShortCircuit {
            phase: "resolve",
            hook_id: *hook_id,
        });
    }
    Ok(output)
}

/// Run the first `depth` load hooks of `hooks`, newest first
pub fn dispatch_load(
    hooks: Rc<[LoadEntry]>,
    depth: usize,
    default: DefaultLoad,
    url: &str,
    context: &LoadContext,
) -> HookReply<LoadOutput> {
    if depth == 0 {
        return default(url, context);
    }

    let (hook_id, hook) = hooks[depth - 1].clone();
    trace!("Dispatching load hook #{} for {}", hook_id, url);
    let called = Rc::new(Cell::new(false));
    let next = NextLoad {
        hooks,
        depth: depth - 1,
        default,
        called: called.clone(),
    };

    hook.load(url, context, next).and_then(move |output| {
        if !called.get() && !output.short_circuit {
            return Err(ModuleError::MissingShortCircuit {
                phase: "load",
                hook_id,
            });
        }
        Ok(output)
    })
}

/// Capabilities passed to `register_hooks`
#[derive(Default, Clone)]
pub struct HookOptions {
    resolve: Option<Rc<dyn ResolveHook>>,
    load: Option<Rc<dyn LoadHook>>,
}

impl HookOptions {
    /// No capabilities yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a resolve closure
    pub fn resolve<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &ResolutionContext, &NextResolve<'_>) -> anyhow::Result<ResolveOutput> + 'static,
    {
        self.resolve = Some(Rc::new(f));
        self
    }

    /// Add a load closure
    pub fn load<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &LoadContext, NextLoad) -> HookReply<LoadOutput> + 'static,
    {
        self.load = Some(Rc::new(f));
        self
    }

    /// Add a resolve hook object
    pub fn resolve_hook(mut self, hook: impl ResolveHook + 'static) -> Self {
        self.resolve = Some(Rc::new(hook));
        self
    }

    /// Add a load hook object
    pub fn load_hook(mut self, hook: impl LoadHook + 'static) -> Self {
        self.load = Some(Rc::new(hook));
        self
    }
}

impl fmt::Debug for HookOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookOptions")
            .field("resolve", &self.resolve.is_some())
            .field("load", &self.load.is_some())
            .finish()
    }
}

/// Returned from a successful registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistrationHandle {
    /// Registration id, increasing with every registration
    pub id: u32,
    /// Whether a resolve hook was registered
    pub resolve: bool,
    /// Whether a load hook was registered
    pub load: bool,
}

/// Hook chain counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HookStats {
    /// Number of registrations
    pub registrations: usize,
    /// Resolutions that went through at least one hook
    pub resolve_dispatches: u64,
    /// Loads that went through at least one hook
    pub load_dispatches: u64,
}

struct HookRegistration {
    id: u32,
    resolve: Option<Rc<dyn ResolveHook>>,
    load: Option<Rc<dyn LoadHook>>,
}

/// Ordered hook registrations
#[derive(Default)]
pub struct HookChain {
    registrations: Vec<HookRegistration>,
    next_id: u32,
    resolve_dispatches: u64,
    load_dispatches: u64,
}

impl HookChain {
    /// An empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook set. Fails without options or without any capability.
    pub fn register(&mut self, options: Option<HookOptions>) -> Result<RegistrationHandle> {
        let options = options.ok_or_else(|| ModuleError::InvalidHookOptions {
            message: "register_hooks requires an options object".to_string(),
        })?;
        if options.resolve.is_none() && options.load.is_none() {
            return Err(ModuleError::InvalidHookOptions {
                message: "register_hooks requires at least resolve or load function".to_string(),
            });
        }

        self.next_id += 1;
        let handle = RegistrationHandle {
            id: self.next_id,
            resolve: options.resolve.is_some(),
            load: options.load.is_some(),
        };
        self.registrations.push(HookRegistration {
            id: handle.id,
            resolve: options.resolve,
            load: options.load,
        });
        debug!(
            "Registered hooks #{} (resolve: {}, load: {})",
            handle.id, handle.resolve, handle.load
        );
        Ok(handle)
    }

    /// Number of registrations
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Snapshot of the resolve hooks for one dispatch
    pub fn resolve_chain(&mut self) -> Vec<ResolveEntry> {
        let chain: Vec<ResolveEntry> = self
            .registrations
            .iter()
            .filter_map(|r| r.resolve.clone().map(|h| (r.id, h)))
            .collect();
        if !chain.is_empty() {
            self.resolve_dispatches += 1;
        }
        chain
    }

    /// Snapshot of the load hooks for one dispatch
    pub fn load_chain(&mut self) -> Rc<[LoadEntry]> {
        let chain: Rc<[LoadEntry]> = self
            .registrations
            .iter()
            .filter_map(|r| r.load.clone().map(|h| (r.id, h)))
            .collect();
        if !chain.is_empty() {
            self.load_dispatches += 1;
        }
        chain
    }

    /// Current counters
    pub fn stats(&self) -> HookStats {
        HookStats {
            registrations: self.registrations.len(),
            resolve_dispatches: self.resolve_dispatches,
            load_dispatches: self.load_dispatches,
        }
    }
}
