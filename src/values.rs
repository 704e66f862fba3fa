//! Runtime values and the reference-counted heap
//!
//! `Value` is what flows through frame registers, event queues and the
//! debugger. Composite values live in `RefObject`s: shared heap cells with a
//! monotonically increasing id and an explicit refcount ledger. The ledger is
//! bookkeeping only (storage is released by ownership, never by the count),
//! but the event-queue and fiber paths must keep it balanced so leak dumps
//! stay meaningful.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{json, Value as JsonValue};

use crate::errors::{oops, RuntimeError};
use crate::runtime::frame::LabelFnRef;

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/* ===================== Values ===================== */

/// A runtime value
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    /// Shared heap object (list, object or action)
    Ref(RefObject),
    /// A function-like value with its arguments already bound; handing one
    /// to a resume callback requests a tail call
    Fn(FnWrapper),
}

impl Value {
    pub fn as_num(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The ref object behind this value, if it holds one
    pub fn ref_object(&self) -> Option<&RefObject> {
        match self {
            Value::Ref(o) => Some(o),
            Value::Fn(w) => Some(&w.action),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Num(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Ref(o) => write!(f, "<ref #{}>", o.id()),
            Value::Fn(w) => write!(f, "<fn #{}/{}>", w.action.id(), w.args.len()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Num(a), Value::Num(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Ref(a), Value::Ref(b)) => a.ptr_eq(b),
            (Value::Fn(a), Value::Fn(b)) => a.action.ptr_eq(&b.action) && a.args == b.args,
            _ => false,
        }
    }
}

/* ===================== Heap objects ===================== */

/// Payload of a heap object
pub enum HeapData {
    List(Vec<Value>),
    Obj(HashMap<String, Value>),
    Action { label: LabelFnRef, caps: Vec<Value> },
}

struct RefInner {
    id: u64,
    refs: Cell<i64>,
    data: RefCell<HeapData>,
}

/// A shared, reference-counted heap object
#[derive(Clone)]
pub struct RefObject {
    inner: Rc<RefInner>,
}

impl RefObject {
    pub fn new(data: HeapData) -> Self {
        let id = NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            inner: Rc::new(RefInner {
                id,
                refs: Cell::new(1),
                data: RefCell::new(data),
            }),
        }
    }

    pub fn list(items: Vec<Value>) -> Self {
        Self::new(HeapData::List(items))
    }

    pub fn obj(fields: HashMap<String, Value>) -> Self {
        Self::new(HeapData::Obj(fields))
    }

    pub fn action(label: LabelFnRef, caps: Vec<Value>) -> Self {
        Self::new(HeapData::Action { label, caps })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn refs(&self) -> i64 {
        self.inner.refs.get()
    }

    pub fn incr(&self) {
        self.inner.refs.set(self.inner.refs.get() + 1);
    }

    pub fn decr(&self) -> i64 {
        let refs = self.inner.refs.get() - 1;
        debug_assert!(refs >= 0, "refcount of object #{} went negative", self.id());
        self.inner.refs.set(refs);
        refs
    }

    pub fn data(&self) -> Ref<'_, HeapData> {
        self.inner.data.borrow()
    }

    pub fn data_mut(&self) -> RefMut<'_, HeapData> {
        self.inner.data.borrow_mut()
    }

    pub fn ptr_eq(&self, other: &RefObject) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for RefObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &*self.data() {
            HeapData::List(items) => format!("list[{}]", items.len()),
            HeapData::Obj(fields) => format!("obj[{}]", fields.len()),
            HeapData::Action { caps, .. } => format!("action/{}", caps.len()),
        };
        write!(f, "RefObject {{ id: {}, refs: {}, {} }}", self.id(), self.refs(), kind)
    }
}

/* ===================== Function wrappers ===================== */

/// An action plus bound arguments
#[derive(Clone)]
pub struct FnWrapper {
    pub action: RefObject,
    pub args: Vec<Value>,
}

impl FnWrapper {
    pub fn new(action: RefObject, args: Vec<Value>) -> Self {
        Self { action, args }
    }

    /// The wrapped label function; fails if the object is not an action
    pub fn label(&self) -> Result<LabelFnRef, RuntimeError> {
        match &*self.action.data() {
            HeapData::Action { label, .. } => Ok(label.clone()),
            _ => Err(oops(format!(
                "object #{} is not callable",
                self.action.id()
            ))),
        }
    }

    /// Captured variables of the wrapped action
    pub fn caps(&self) -> Vec<Value> {
        match &*self.action.data() {
            HeapData::Action { caps, .. } => caps.clone(),
            _ => Vec::new(),
        }
    }
}

impl fmt::Debug for FnWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FnWrapper {{ action: #{}, args: {} }}", self.action.id(), self.args.len())
    }
}

/* ===================== Refcount helpers ===================== */

/// Record one more reference to a value (no-op for scalars)
pub fn incr(v: &Value) {
    if let Some(o) = v.ref_object() {
        o.incr();
    }
}

/// Record one reference released; returns the remaining count, if any
pub fn decr(v: &Value) -> Option<i64> {
    v.ref_object().map(|o| o.decr())
}

/* ===================== JSON conversion ===================== */

/// Convert a runtime value to JSON (for debugger snapshots)
pub fn value_to_json(v: &Value) -> JsonValue {
    match v {
        Value::Null => JsonValue::Null,
        Value::Bool(b) => json!(b),
        Value::Num(n) => json!(n),
        Value::Str(s) => json!(s),
        Value::Ref(o) => match &*o.data() {
            HeapData::List(items) => {
                JsonValue::Array(items.iter().map(value_to_json).collect())
            }
            HeapData::Obj(fields) => {
                let map = fields
                    .iter()
                    .map(|(k, v)| (k.clone(), value_to_json(v)))
                    .collect();
                JsonValue::Object(map)
            }
            HeapData::Action { .. } => json!(format!("<function #{}>", o.id())),
        },
        Value::Fn(w) => json!(format!("<function #{}>", w.action.id())),
    }
}

/// Convert JSON to a runtime value, allocating fresh heap objects for
/// arrays and objects
pub fn json_to_value(j: &JsonValue) -> Value {
    match j {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(b) => Value::Bool(*b),
        JsonValue::Number(n) => Value::Num(n.as_f64().unwrap_or(f64::NAN)),
        JsonValue::String(s) => Value::Str(s.clone()),
        JsonValue::Array(items) => {
            Value::Ref(RefObject::list(items.iter().map(json_to_value).collect()))
        }
        JsonValue::Object(fields) => {
            let map = fields
                .iter()
                .map(|(k, v)| (k.clone(), json_to_value(v)))
                .collect();
            Value::Ref(RefObject::obj(map))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_ids_monotonic() {
        let a = RefObject::list(vec![]);
        let b = RefObject::list(vec![]);
        assert!(b.id() > a.id());
    }

    #[test]
    fn test_refcount_ledger() {
        let v = Value::Ref(RefObject::list(vec![Value::Num(1.0)]));
        assert_eq!(v.ref_object().unwrap().refs(), 1);
        incr(&v);
        incr(&v);
        assert_eq!(v.ref_object().unwrap().refs(), 3);
        assert_eq!(decr(&v), Some(2));
        assert_eq!(decr(&v), Some(1));
        assert_eq!(decr(&v), Some(0));
        // Scalars have no ledger
        assert_eq!(decr(&Value::Num(3.0)), None);
    }

    #[test]
    fn test_value_equality_by_identity() {
        let a = Value::Ref(RefObject::list(vec![]));
        let b = Value::Ref(RefObject::list(vec![]));
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_eq!(Value::Str("x".into()), Value::Str("x".into()));
    }

    #[test]
    fn test_json_round_trip_shape() {
        let j = serde_json::json!({ "n": 2.0, "items": [1.0, "two", null], "ok": true });
        let v = json_to_value(&j);
        assert_eq!(value_to_json(&v), j);
    }

    #[test]
    fn test_obj_snapshot_shape() {
        use maplit::hashmap;
        let v = Value::Ref(RefObject::obj(hashmap! {
            "x".to_string() => Value::Num(1.0),
            "label".to_string() => Value::Str("origin".into()),
        }));
        assert_eq!(
            value_to_json(&v),
            serde_json::json!({ "x": 1.0, "label": "origin" })
        );
    }
}
