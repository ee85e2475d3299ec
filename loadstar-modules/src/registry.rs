//! In-memory module records
//!
//! Records live in an arena addressed by `ModuleId`. Ids are never reused, so
//! a stale id held across a reload simply stops resolving.

use crate::environment::ExportsHandle;
use crate::fingerprint::Fingerprint;
use crate::stats::{percentage, LoadCounters, ModuleCacheStats};
use crate::ModuleFormat;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::fmt;
use tracing::{debug, trace, warn};

/// Stable handle to a module record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(u32);

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Load progress of a module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ModuleState {
    Unresolved,
    Resolving,
    Compiling,
    Executing,
    Complete,
    Errored,
}

impl ModuleState {
    fn rank(self) -> u8 {
        match self {
            ModuleState::Unresolved => 0,
            ModuleState::Resolving => 1,
            ModuleState::Compiling => 2,
            ModuleState::Executing => 3,
            ModuleState::Complete | ModuleState::Errored => 4,
        }
    }

    /// `Complete` or `Errored`
    pub fn is_terminal(self) -> bool {
        matches!(self, ModuleState::Complete | ModuleState::Errored)
    }

    /// States only move forward; `Errored` is reachable from any non-terminal state
    pub fn can_advance_to(self, next: ModuleState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

/// One module known to the registry
#[derive(Debug, Clone)]
pub struct ModuleRecord {
    key: String,
    format: ModuleFormat,
    state: ModuleState,
    exports: Option<ExportsHandle>,
    fingerprint: Option<Fingerprint>,
    dependencies: Vec<String>,
    error: Option<String>,
    source_len: usize,
}

impl ModuleRecord {
    /// Canonical id
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn format(&self) -> ModuleFormat {
        self.format
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    /// Present from the start of execution onward
    pub fn exports(&self) -> Option<&ExportsHandle> {
        self.exports.as_ref()
    }

    /// Fingerprint of the compiled source, if it went through the compiler
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.fingerprint
    }

    /// Canonical ids this module required while executing
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    /// Failure message of an errored load
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn approximate_size(&self) -> usize {
        self.key.len()
            + self.source_len
            + self.dependencies.iter().map(String::len).sum::<usize>()
            + self.exports.as_ref().map_or(0, ExportsHandle::approximate_size)
    }
}

/// Table of module records by canonical id
#[derive(Debug)]
pub struct ModuleRegistry {
    records: Vec<Option<ModuleRecord>>,
    by_key: FxHashMap<String, ModuleId>,
    /// Finished modules, least recently used first
    access_order: Vec<ModuleId>,
    max_size: usize,
    loads: LoadCounters,
    hits: u64,
    misses: u64,
}

impl ModuleRegistry {
    /// Create a registry keeping at most `max_size` finished modules
    pub fn new(max_size: usize) -> Self {
        Self {
            records: Vec::new(),
            by_key: FxHashMap::default(),
            access_order: Vec::new(),
            max_size,
            loads: LoadCounters::default(),
            hits: 0,
            misses: 0,
        }
    }

    /// Id of the record for `key`
    pub fn lookup(&self, key: &str) -> Option<ModuleId> {
        self.by_key.get(key).copied()
    }

    /// Record by id
    pub fn get(&self, id: ModuleId) -> Option<&ModuleRecord> {
        self.records.get(id.0 as usize).and_then(Option::as_ref)
    }

    fn get_mut(&mut self, id: ModuleId) -> Option<&mut ModuleRecord> {
        self.records.get_mut(id.0 as usize).and_then(Option::as_mut)
    }

    /// Record by canonical id
    pub fn get_by_key(&self, key: &str) -> Option<&ModuleRecord> {
        self.lookup(key).and_then(|id| self.get(id))
    }

    /// Create a fresh `Unresolved` record for `key`, replacing any previous one
    pub fn insert(&mut self, key: &str, format: ModuleFormat) -> ModuleId {
        self.invalidate(key);

        let id = ModuleId(self.records.len() as u32);
        self.records.push(Some(ModuleRecord {
            key: key.to_string(),
            format,
            state: ModuleState::Unresolved,
            exports: None,
            fingerprint: None,
            dependencies: Vec::new(),
            error: None,
            source_len: 0,
        }));
        self.by_key.insert(key.to_string(), id);
        trace!("Registered module {} as {}", key, id);
        id
    }

    /// Move a record forward. Backward moves are refused.
    pub fn advance(&mut self, id: ModuleId, next: ModuleState) -> bool {
        let Some(record) = self.get_mut(id) else {
            return false;
        };
        if !record.state.can_advance_to(next) {
            warn!(
                "Refused state change {:?} -> {:?} for {}",
                record.state, next, record.key
            );
            return false;
        }
        trace!("Module {}: {:?} -> {:?}", record.key, record.state, next);
        record.state = next;
        true
    }

    /// Enter `Executing` and allocate the exports handle before the body runs
    pub fn begin_execution(&mut self, id: ModuleId) -> Option<ExportsHandle> {
        if !self.advance(id, ModuleState::Executing) {
            return None;
        }
        let record = self.get_mut(id)?;
        let exports = record.exports.get_or_insert_with(ExportsHandle::new).clone();
        Some(exports)
    }

    /// Use a provided exports table instead of a fresh one
    pub fn set_exports(&mut self, id: ModuleId, exports: ExportsHandle) {
        if let Some(record) = self.get_mut(id) {
            record.exports = Some(exports);
        }
    }

    /// Remember what was compiled
    pub fn set_compiled(&mut self, id: ModuleId, fingerprint: Option<Fingerprint>, source_len: usize) {
        if let Some(record) = self.get_mut(id) {
            record.fingerprint = fingerprint;
            record.source_len = source_len;
        }
    }

    /// Replace the format chosen during loading
    pub fn set_format(&mut self, id: ModuleId, format: ModuleFormat) {
        if let Some(record) = self.get_mut(id) {
            record.format = format;
        }
    }

    /// Store the dependency edges discovered during execution
    pub fn set_dependencies(&mut self, id: ModuleId, dependencies: Vec<String>) {
        if let Some(record) = self.get_mut(id) {
            record.dependencies = dependencies;
        }
    }

    /// Mark a module complete and apply the size limit
    pub fn complete(&mut self, id: ModuleId) {
        if !self.advance(id, ModuleState::Complete) {
            return;
        }
        self.touch(id);
        self.evict_over_limit(id);
    }

    /// Mark a load as failed. Errored records count toward the size limit
    /// like completed ones.
    pub fn fail(&mut self, id: ModuleId, message: impl Into<String>) {
        if !self.advance(id, ModuleState::Errored) {
            return;
        }
        if let Some(record) = self.get_mut(id) {
            record.error = Some(message.into());
        }
        self.touch(id);
        self.evict_over_limit(id);
    }

    /// Note a use of a completed module
    pub fn touch(&mut self, id: ModuleId) {
        self.access_order.retain(|x| *x != id);
        self.access_order.push(id);
    }

    fn evict_over_limit(&mut self, keep: ModuleId) {
        while self.access_order.len() > self.max_size {
            let Some(pos) = self.access_order.iter().position(|x| *x != keep) else {
                break;
            };
            let victim = self.access_order.remove(pos);
            if let Some(record) = self.records.get_mut(victim.0 as usize).and_then(Option::take) {
                self.by_key.remove(&record.key);
                debug!("Evicted module from registry: {}", record.key);
            }
        }
    }

    /// Drop the record for `key`
    pub fn invalidate(&mut self, key: &str) -> Option<ModuleRecord> {
        let id = self.by_key.remove(key)?;
        self.access_order.retain(|x| *x != id);
        let record = self.records.get_mut(id.0 as usize).and_then(Option::take);
        if record.is_some() {
            debug!("Invalidated module: {}", key);
        }
        record
    }

    /// Drop every finished record; loads in flight keep theirs
    pub fn clear(&mut self) -> usize {
        let finished: Vec<String> = self
            .by_key
            .iter()
            .filter(|(_, id)| self.get(**id).map_or(true, |r| r.state.is_terminal()))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &finished {
            self.invalidate(key);
        }
        debug!("Cleared {} modules from registry", finished.len());
        finished.len()
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    /// Whether no records are live
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Canonical ids of all live records
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.by_key.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn record_load_started(&mut self) {
        self.loads.total += 1;
    }

    pub fn record_load_succeeded(&mut self) {
        self.loads.success += 1;
    }

    pub fn record_load_failed(&mut self) {
        self.loads.failed += 1;
    }

    pub fn record_hit(&mut self) {
        self.hits += 1;
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    /// Load counters so far
    pub fn load_counters(&self) -> LoadCounters {
        self.loads
    }

    /// Approximate bytes held by live records
    pub fn memory_used(&self) -> u64 {
        self.records
            .iter()
            .flatten()
            .map(|r| r.approximate_size() as u64)
            .sum()
    }

    /// Registry cache counters
    pub fn stats(&self) -> ModuleCacheStats {
        let size = self.access_order.len();
        ModuleCacheStats {
            hits: self.hits,
            misses: self.misses,
            size,
            max_size: self.max_size,
            utilization: percentage(size as u64, self.max_size as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run_to_complete(registry: &mut ModuleRegistry, key: &str) -> ModuleId {
        let id = registry.insert(key, ModuleFormat::Script);
        assert!(registry.advance(id, ModuleState::Resolving));
        assert!(registry.advance(id, ModuleState::Compiling));
        registry.begin_execution(id).unwrap();
        registry.complete(id);
        id
    }

    #[test]
    fn test_state_machine_only_moves_forward() {
        let mut registry = ModuleRegistry::new(10);
        let id = registry.insert("/a.js", ModuleFormat::Script);
        assert_eq!(registry.get(id).unwrap().state(), ModuleState::Unresolved);

        assert!(registry.advance(id, ModuleState::Compiling));
        assert!(!registry.advance(id, ModuleState::Resolving));
        assert!(registry.advance(id, ModuleState::Errored));
        assert!(!registry.advance(id, ModuleState::Complete));
        assert!(!registry.advance(id, ModuleState::Errored));
    }

    #[test]
    fn test_exports_exist_while_executing() {
        let mut registry = ModuleRegistry::new(10);
        let id = registry.insert("/cycle.js", ModuleFormat::Script);
        registry.advance(id, ModuleState::Compiling);
        let exports = registry.begin_execution(id).unwrap();
        exports.set("partial", json!(true));

        let record = registry.get_by_key("/cycle.js").unwrap();
        assert_eq!(record.state(), ModuleState::Executing);
        assert!(record.exports().unwrap().ptr_eq(&exports));
    }

    #[test]
    fn test_fail_records_message() {
        let mut registry = ModuleRegistry::new(10);
        let id = registry.insert("/bad.js", ModuleFormat::Script);
        registry.fail(id, "syntax error");
        let record = registry.get(id).unwrap();
        assert_eq!(record.state(), ModuleState::Errored);
        assert_eq!(record.error(), Some("syntax error"));
    }

    #[test]
    fn test_lru_eviction_of_completed_modules() {
        let mut registry = ModuleRegistry::new(2);
        let a = run_to_complete(&mut registry, "/a.js");
        run_to_complete(&mut registry, "/b.js");
        registry.touch(a);
        run_to_complete(&mut registry, "/c.js");

        assert!(registry.lookup("/a.js").is_some());
        assert!(registry.lookup("/b.js").is_none());
        assert!(registry.lookup("/c.js").is_some());
        assert_eq!(registry.stats().size, 2);
        assert_eq!(registry.stats().utilization, 100.0);
    }

    #[test]
    fn test_errored_records_are_evicted() {
        let mut registry = ModuleRegistry::new(2);
        for i in 0..5 {
            let id = registry.insert(&format!("/missing{}.js", i), ModuleFormat::Script);
            registry.fail(id, "not found");
        }
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.keys(),
            vec!["/missing3.js".to_string(), "/missing4.js".to_string()]
        );
        assert_eq!(registry.get_by_key("/missing4.js").unwrap().error(), Some("not found"));
    }

    #[test]
    fn test_in_flight_records_survive_clear_and_eviction() {
        let mut registry = ModuleRegistry::new(1);
        let pending = registry.insert("/pending.js", ModuleFormat::Script);
        registry.advance(pending, ModuleState::Resolving);
        run_to_complete(&mut registry, "/a.js");
        run_to_complete(&mut registry, "/b.js");

        assert!(registry.lookup("/pending.js").is_some());
        assert_eq!(registry.clear(), 1);
        assert_eq!(registry.keys(), vec!["/pending.js".to_string()]);
    }

    #[test]
    fn test_reinsert_replaces_record_with_new_id() {
        let mut registry = ModuleRegistry::new(10);
        let old = run_to_complete(&mut registry, "/a.js");
        let new = registry.insert("/a.js", ModuleFormat::Script);
        assert_ne!(old, new);
        assert!(registry.get(old).is_none());
        assert_eq!(registry.len(), 1);
    }
}
