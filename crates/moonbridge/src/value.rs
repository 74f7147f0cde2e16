//! Host-side "any" value
//!
//! [`Value`] is what [`State::to_native`](crate::State::to_native) produces
//! and what typed resolution goes through on its way to a concrete host type.

use crate::refs::ValueRef;
use std::any::Any;
use std::ffi::c_void;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// Byte buffer resolved from (or pushed as) a VM string
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Bytes(pub Vec<u8>);

impl From<Vec<u8>> for Bytes {
    fn from(bytes: Vec<u8>) -> Self {
        Bytes(bytes)
    }
}

impl From<&[u8]> for Bytes {
    fn from(bytes: &[u8]) -> Self {
        Bytes(bytes.to_vec())
    }
}

/// A VM value converted to host form
///
/// Equality and hashing are structural. Floats compare bitwise so that
/// `Value` can serve as a map key; userdata compare by identity.
#[derive(Clone)]
pub enum Value {
    /// `nil`
    Nil,
    /// Boolean
    Boolean(bool),
    /// Integer number
    Integer(i64),
    /// Float number
    Number(f64),
    /// String holding valid UTF-8
    String(String),
    /// String holding arbitrary bytes
    Bytes(Vec<u8>),
    /// Table with keys exactly `1..=n`
    Array(Vec<Value>),
    /// Any other table, as key/value pairs in traversal order
    Map(Vec<(Value, Value)>),
    /// Light userdata pointer
    LightUserdata(*mut c_void),
    /// Host value projected into the VM as an opaque handle
    Userdata(Rc<dyn Any>),
    /// Unresolved VM value kept alive in the registry
    Ref(ValueRef),
}

impl Value {
    /// Name of this value's variant, for diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::LightUserdata(_) => "lightuserdata",
            Value::Userdata(_) => "userdata",
            Value::Ref(_) => "reference",
        }
    }

    /// True for `nil`
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Whether the value can be used as a table key: not nil, not NaN,
    /// and made only of such values.
    pub fn is_hashable(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Number(n) => !n.is_nan(),
            Value::Array(items) => items.iter().all(Value::is_hashable),
            Value::Map(entries) => entries
                .iter()
                .all(|(k, v)| k.is_hashable() && v.is_hashable()),
            _ => true,
        }
    }

    /// Integer view, accepting floats with an exact integer value
    pub fn as_integer(&self) -> Option<i64> {
        match *self {
            Value::Integer(i) => Some(i),
            Value::Number(n) => float_to_integer(n),
            _ => None,
        }
    }

    /// Float view of any number
    pub fn as_number(&self) -> Option<f64> {
        match *self {
            Value::Integer(i) => Some(i as f64),
            Value::Number(n) => Some(n),
            _ => None,
        }
    }

    /// String view
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Look up a key in a `Map` (or a 1-based integer in an `Array`)
    pub fn get(&self, key: &Value) -> Option<&Value> {
        match self {
            Value::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            Value::Array(items) => {
                let i = key.as_integer()?;
                if i >= 1 {
                    items.get(i as usize - 1)
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

pub(crate) fn float_to_integer(n: f64) -> Option<i64> {
    if n.fract() == 0.0 && n >= i64::MIN as f64 && n < i64::MAX as f64 {
        Some(n as i64)
    } else {
        None
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::LightUserdata(a), Value::LightUserdata(b)) => a == b,
            (Value::Userdata(a), Value::Userdata(b)) => Rc::ptr_eq(a, b),
            (Value::Ref(a), Value::Ref(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Nil => {}
            Value::Boolean(b) => b.hash(state),
            Value::Integer(i) => i.hash(state),
            Value::Number(n) => n.to_bits().hash(state),
            Value::String(s) => s.hash(state),
            Value::Bytes(b) => b.hash(state),
            Value::Array(items) => items.hash(state),
            Value::Map(entries) => entries.hash(state),
            Value::LightUserdata(p) => (*p as usize).hash(state),
            Value::Userdata(rc) => (Rc::as_ptr(rc) as *const u8 as usize).hash(state),
            Value::Ref(r) => r.hash(state),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Number(n) => write!(f, "{n:?}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "b{:?}", String::from_utf8_lossy(b)),
            Value::Array(items) => f.debug_list().entries(items).finish(),
            Value::Map(entries) => f
                .debug_map()
                .entries(entries.iter().map(|(k, v)| (k, v)))
                .finish(),
            Value::LightUserdata(p) => write!(f, "lightuserdata({p:?})"),
            Value::Userdata(rc) => write!(f, "userdata({:p})", Rc::as_ptr(rc)),
            Value::Ref(r) => write!(f, "{r:?}"),
        }
    }
}

// ============================================================================
// Conversions
// ============================================================================

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i as i64)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<ValueRef> for Value {
    fn from(r: ValueRef) -> Self {
        Value::Ref(r)
    }
}
