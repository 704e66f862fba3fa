//! Live-object bookkeeping
//!
//! When a program is compiled with refcount debugging, every heap object is
//! registered here at allocation and unregistered when its ledger drops to
//! zero. The table has no collection policy; it exists so a leak dump can
//! name what is still alive.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;

use crate::errors::{runtime_assert, RuntimeError};
use crate::values::RefObject;

/// Registry of live heap objects, keyed by their monotonically increasing id
pub struct LiveObjects {
    enabled: Cell<bool>,
    map: RefCell<BTreeMap<u64, RefObject>>,
}

impl LiveObjects {
    pub fn new() -> Self {
        Self {
            enabled: Cell::new(false),
            map: RefCell::new(BTreeMap::new()),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.set(enabled);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    pub fn len(&self) -> usize {
        self.map.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.borrow().is_empty()
    }

    pub fn register(&self, obj: &RefObject) {
        if self.enabled.get() {
            self.map.borrow_mut().insert(obj.id(), obj.clone());
        }
    }

    /// Drop an object from the registry. Unless `keep_alive` is set, the
    /// object's refcount ledger must already be balanced to zero.
    pub fn unregister(&self, obj: &RefObject, keep_alive: bool) -> Result<(), RuntimeError> {
        if !keep_alive {
            runtime_assert(
                obj.refs() == 0,
                "unregistering a live object with outstanding references",
            )?;
        }
        self.map.borrow_mut().remove(&obj.id());
        Ok(())
    }

    /// Log every object still registered, for leak diagnosis
    pub fn dump_live_pointers(&self) {
        let map = self.map.borrow();
        tracing::debug!(target: "fibra::refcount", live = map.len(), "live object dump");
        for obj in map.values() {
            tracing::debug!(target: "fibra::refcount", "  {:?}", obj);
        }
    }
}

impl Default for LiveObjects {
    fn default() -> Self {
        Self::new()
    }
}
