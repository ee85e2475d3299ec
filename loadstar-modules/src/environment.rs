//! Module exports

use rustc_hash::FxHashMap;
use serde_json::Value;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// A module's exports object.
///
/// Cloning shares the underlying table: a module that is still executing
/// hands the same handle to cyclic importers, and they observe whatever
/// bindings it has defined so far.
#[derive(Clone, Default)]
pub struct ExportsHandle {
    bindings: Rc<RefCell<FxHashMap<String, Value>>>,
}

impl ExportsHandle {
    /// Create an empty exports table
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table pre-filled with bindings
    pub fn from_bindings(bindings: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self {
            bindings: Rc::new(RefCell::new(bindings.into_iter().collect())),
        }
    }

    /// Define or replace a binding
    pub fn set(&self, name: impl Into<String>, value: Value) {
        self.bindings.borrow_mut().insert(name.into(), value);
    }

    /// Look up a binding
    pub fn get(&self, name: &str) -> Option<Value> {
        self.bindings.borrow().get(name).cloned()
    }

    /// Check if a name is exported
    pub fn contains(&self, name: &str) -> bool {
        self.bindings.borrow().contains_key(name)
    }

    /// Exported names, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.bindings.borrow().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of bindings
    pub fn len(&self) -> usize {
        self.bindings.borrow().len()
    }

    /// Whether nothing is exported yet
    pub fn is_empty(&self) -> bool {
        self.bindings.borrow().is_empty()
    }

    /// Whether two handles share the same table
    pub fn ptr_eq(&self, other: &ExportsHandle) -> bool {
        Rc::ptr_eq(&self.bindings, &other.bindings)
    }

    /// Snapshot as a JSON object
    pub fn to_json(&self) -> Value {
        let bindings = self.bindings.borrow();
        Value::Object(
            bindings
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Rough heap footprint of the bindings
    pub(crate) fn approximate_size(&self) -> usize {
        self.bindings
            .borrow()
            .iter()
            .map(|(k, v)| k.len() + v.to_string().len())
            .sum()
    }
}

impl fmt::Debug for ExportsHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportsHandle")
            .field("keys", &self.keys())
            .finish()
    }
}
