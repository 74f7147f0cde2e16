//! Value conversion between host types and the VM stack
//!
//! [`Push`] projects a host value onto the stack. [`Resolve`] describes a
//! host type by its [`Shape`] and rebuilds it from a resolved [`Value`].
//! [`FromArg`] turns a failed resolution of a closure argument into a
//! positional [`BridgeError::Argument`].

mod resolve;

pub use resolve::{Shape, TypeConstraint};

use crate::error::{BridgeError, BridgeResult};
use crate::refs::ValueRef;
use crate::stack::{Kind, StackIndex};
use crate::state::State;
use crate::value::{Bytes, Value};
use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::os::raw::c_int;
use std::rc::Rc;

// ============================================================================
// Push
// ============================================================================

/// A host value that can be pushed as exactly one VM value
pub trait Push {
    /// Push `self` onto the stack of `state`
    fn push_to(self, state: &State<'_>) -> BridgeResult<()>;
}

/// Values a bridged function can return: one value, nothing, or a tuple
pub trait IntoReturns {
    /// Push the values, returning how many were pushed
    fn push_returns(self, state: &State<'_>) -> BridgeResult<c_int>;
}

impl<T: Push> IntoReturns for T {
    fn push_returns(self, state: &State<'_>) -> BridgeResult<c_int> {
        state.push(self)?;
        Ok(1)
    }
}

impl IntoReturns for () {
    fn push_returns(self, _state: &State<'_>) -> BridgeResult<c_int> {
        Ok(0)
    }
}

impl<A: Push, B: Push> IntoReturns for (A, B) {
    fn push_returns(self, state: &State<'_>) -> BridgeResult<c_int> {
        state.push(self.0)?;
        state.push(self.1)?;
        Ok(2)
    }
}

impl<A: Push, B: Push, C: Push> IntoReturns for (A, B, C) {
    fn push_returns(self, state: &State<'_>) -> BridgeResult<c_int> {
        state.push(self.0)?;
        state.push(self.1)?;
        state.push(self.2)?;
        Ok(3)
    }
}

impl Push for bool {
    fn push_to(self, state: &State<'_>) -> BridgeResult<()> {
        state.ensure_stack(1)?;
        state.push_bool(self);
        Ok(())
    }
}

macro_rules! push_integer {
    ($($t:ty),*) => {
        $(
            impl Push for $t {
                fn push_to(self, state: &State<'_>) -> BridgeResult<()> {
                    state.ensure_stack(1)?;
                    match i64::try_from(self) {
                        Ok(i) => state.push_integer(i),
                        Err(_) => state.push_number(self as f64),
                    }
                    Ok(())
                }
            }
        )*
    };
}

push_integer!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

impl Push for f32 {
    fn push_to(self, state: &State<'_>) -> BridgeResult<()> {
        state.ensure_stack(1)?;
        state.push_number(self as f64);
        Ok(())
    }
}

impl Push for f64 {
    fn push_to(self, state: &State<'_>) -> BridgeResult<()> {
        state.ensure_stack(1)?;
        state.push_number(self);
        Ok(())
    }
}

impl Push for &str {
    fn push_to(self, state: &State<'_>) -> BridgeResult<()> {
        state.ensure_stack(1)?;
        state.push_str(self);
        Ok(())
    }
}

impl Push for String {
    fn push_to(self, state: &State<'_>) -> BridgeResult<()> {
        self.as_str().push_to(state)
    }
}

impl Push for Bytes {
    fn push_to(self, state: &State<'_>) -> BridgeResult<()> {
        state.ensure_stack(1)?;
        state.push_bytes(&self.0);
        Ok(())
    }
}

impl Push for &[u8] {
    fn push_to(self, state: &State<'_>) -> BridgeResult<()> {
        state.ensure_stack(1)?;
        state.push_bytes(self);
        Ok(())
    }
}

impl<T: Push> Push for Option<T> {
    fn push_to(self, state: &State<'_>) -> BridgeResult<()> {
        match self {
            Some(value) => value.push_to(state),
            None => {
                state.ensure_stack(1)?;
                state.push_nil();
                Ok(())
            }
        }
    }
}

impl<T: Push> Push for Vec<T> {
    fn push_to(self, state: &State<'_>) -> BridgeResult<()> {
        state.ensure_stack(2)?;
        state.new_table(self.len().min(i32::MAX as usize) as i32, 0);
        let table = state.top();
        guarded(state, table, |state| {
            for (i, item) in self.into_iter().enumerate() {
                state.push(item)?;
                state.raw_set_index(table, i as i64 + 1);
            }
            Ok(())
        })
    }
}

impl<K: Push, V: Push, S> Push for HashMap<K, V, S> {
    fn push_to(self, state: &State<'_>) -> BridgeResult<()> {
        push_pairs(state, self.len(), self)
    }
}

impl<K: Push, V: Push> Push for BTreeMap<K, V> {
    fn push_to(self, state: &State<'_>) -> BridgeResult<()> {
        push_pairs(state, self.len(), self)
    }
}

impl Push for ValueRef {
    fn push_to(self, state: &State<'_>) -> BridgeResult<()> {
        state.push_ref(&self)
    }
}

impl Push for &ValueRef {
    fn push_to(self, state: &State<'_>) -> BridgeResult<()> {
        state.push_ref(self)
    }
}

impl<T: Any> Push for Rc<T> {
    fn push_to(self, state: &State<'_>) -> BridgeResult<()> {
        state.push_handle(self)
    }
}

impl Push for Value {
    fn push_to(self, state: &State<'_>) -> BridgeResult<()> {
        match self {
            Value::Nil => None::<bool>.push_to(state),
            Value::Boolean(b) => b.push_to(state),
            Value::Integer(i) => i.push_to(state),
            Value::Number(n) => n.push_to(state),
            Value::String(s) => s.push_to(state),
            Value::Bytes(b) => Bytes(b).push_to(state),
            Value::Array(items) => items.push_to(state),
            Value::Map(entries) => push_pairs(state, entries.len(), entries),
            Value::LightUserdata(p) => {
                state.ensure_stack(1)?;
                state.push_light(p);
                Ok(())
            }
            Value::Userdata(rc) => {
                let id = (*rc).type_id();
                state.push_erased(rc, id, "userdata")
            }
            Value::Ref(r) => state.push_ref(&r),
        }
    }
}

/// Run `fill` against the freshly pushed table at `table`, dropping the
/// table and anything above it if filling fails.
fn guarded(
    state: &State<'_>,
    table: StackIndex,
    fill: impl FnOnce(&State<'_>) -> BridgeResult<()>,
) -> BridgeResult<()> {
    match fill(state) {
        Ok(()) => Ok(()),
        Err(err) => {
            state.set_top(table - 1);
            Err(err)
        }
    }
}

fn push_pairs<K: Push, V: Push>(
    state: &State<'_>,
    len: usize,
    pairs: impl IntoIterator<Item = (K, V)>,
) -> BridgeResult<()> {
    state.ensure_stack(3)?;
    state.new_table(0, len.min(i32::MAX as usize) as i32);
    let table = state.top();
    guarded(state, table, |state| {
        for (key, value) in pairs {
            state.push(key)?;
            let invalid_key = match state.kind(-1) {
                Some(Kind::Nil) => true,
                Some(Kind::Number) => state.to_number(-1).is_some_and(f64::is_nan),
                _ => false,
            };
            if invalid_key {
                return Err(BridgeError::host("table key cannot be nil or NaN"));
            }
            state.push(value)?;
            state.raw_set(table);
        }
        Ok(())
    })
}

// ============================================================================
// Resolve
// ============================================================================

/// A host type that VM values can be resolved to
pub trait Resolve: Sized {
    /// Shape resolution should aim for
    fn shape() -> Shape;

    /// Rebuild the host value from a value the shape admitted
    fn from_value(value: Value) -> Option<Self>;
}

impl Resolve for bool {
    fn shape() -> Shape {
        Shape::Boolean
    }

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Boolean(b) => Some(b),
            _ => None,
        }
    }
}

macro_rules! resolve_integer {
    ($($t:ty),*) => {
        $(
            impl Resolve for $t {
                fn shape() -> Shape {
                    Shape::Integer
                }

                fn from_value(value: Value) -> Option<Self> {
                    value.as_integer().and_then(|i| <$t>::try_from(i).ok())
                }
            }
        )*
    };
}

resolve_integer!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

impl Resolve for f64 {
    fn shape() -> Shape {
        Shape::Number
    }

    fn from_value(value: Value) -> Option<Self> {
        value.as_number()
    }
}

impl Resolve for f32 {
    fn shape() -> Shape {
        Shape::Number
    }

    fn from_value(value: Value) -> Option<Self> {
        value.as_number().map(|n| n as f32)
    }
}

impl Resolve for String {
    fn shape() -> Shape {
        Shape::Text
    }

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl Resolve for Bytes {
    fn shape() -> Shape {
        Shape::Bytes
    }

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Bytes(b) => Some(Bytes(b)),
            _ => None,
        }
    }
}

impl<T: Resolve> Resolve for Vec<T> {
    fn shape() -> Shape {
        Shape::sequence(T::shape())
    }

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Array(items) => items.into_iter().map(T::from_value).collect(),
            _ => None,
        }
    }
}

impl<K: Resolve + Eq + Hash, V: Resolve> Resolve for HashMap<K, V> {
    fn shape() -> Shape {
        Shape::mapping(K::shape(), V::shape())
    }

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Map(entries) => entries
                .into_iter()
                .map(|(k, v)| Some((K::from_value(k)?, V::from_value(v)?)))
                .collect(),
            _ => None,
        }
    }
}

impl<K: Resolve + Ord, V: Resolve> Resolve for BTreeMap<K, V> {
    fn shape() -> Shape {
        Shape::mapping(K::shape(), V::shape())
    }

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Map(entries) => entries
                .into_iter()
                .map(|(k, v)| Some((K::from_value(k)?, V::from_value(v)?)))
                .collect(),
            _ => None,
        }
    }
}

impl<T: Resolve> Resolve for Option<T> {
    fn shape() -> Shape {
        Shape::optional(T::shape())
    }

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Nil => Some(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl Resolve for Value {
    fn shape() -> Shape {
        Shape::Any
    }

    fn from_value(value: Value) -> Option<Self> {
        Some(value)
    }
}

impl Resolve for ValueRef {
    fn shape() -> Shape {
        Shape::Reference
    }

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Ref(r) => Some(r),
            _ => None,
        }
    }
}

impl<T: Any> Resolve for Rc<T> {
    fn shape() -> Shape {
        Shape::Userdata {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Userdata(rc) => rc.downcast::<T>().ok(),
            _ => None,
        }
    }
}

// ============================================================================
// Closure arguments
// ============================================================================

/// A closure parameter read from a 1-based argument position
pub trait FromArg: Sized {
    /// Read the argument at `position`
    fn from_arg(state: &State<'_>, position: StackIndex) -> BridgeResult<Self>;
}

impl<T: Resolve> FromArg for T {
    fn from_arg(state: &State<'_>, position: StackIndex) -> BridgeResult<Self> {
        state.resolve::<T>(position).ok_or_else(|| BridgeError::Argument {
            position,
            expected: T::shape().to_string(),
            got: state.type_name(position).to_string(),
        })
    }
}

impl<'a> State<'a> {
    /// Push a host value
    pub fn push<T: Push>(&self, value: T) -> BridgeResult<()> {
        value.push_to(self)
    }

    /// Resolve the value at `index` to `T`.
    ///
    /// Returns `None` when no interpretation of the value (or of any nested
    /// element) fits `T`. An unused index resolves as `nil`.
    pub fn resolve<T: Resolve>(&self, index: StackIndex) -> Option<T> {
        let value = self.resolve_shape(index, &T::shape())?;
        T::from_value(value)
    }

    /// Read argument `position` of the current call, naming the position in the error
    pub fn arg<T: FromArg>(&self, position: StackIndex) -> BridgeResult<T> {
        T::from_arg(self, position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Lua;

    #[test]
    fn test_push_then_resolve_nested() {
        let lua = Lua::new().unwrap();
        let state = lua.state();
        let mut scores = HashMap::new();
        scores.insert("a".to_string(), vec![1i64, 2]);
        scores.insert("b".to_string(), vec![]);
        state.push(scores.clone()).unwrap();
        let back: HashMap<String, Vec<i64>> = state.resolve(-1).unwrap();
        assert_eq!(back, scores);
        state.pop(1);
    }

    #[test]
    fn test_resolve_integer_from_float() {
        let lua = Lua::new().unwrap();
        let state = lua.state();
        state.push_number(8.0);
        assert_eq!(state.resolve::<i32>(-1), Some(8));
        state.push_number(8.5);
        assert_eq!(state.resolve::<i32>(-1), None);
        state.push_integer(300);
        assert_eq!(state.resolve::<u8>(-1), None);
        state.pop(3);
    }

    #[test]
    fn test_resolve_option_from_nil_and_absent() {
        let lua = Lua::new().unwrap();
        let state = lua.state();
        state.push_nil();
        assert_eq!(state.resolve::<Option<i64>>(1), Some(None));
        assert_eq!(state.resolve::<Option<i64>>(2), Some(None));
        assert_eq!(state.resolve::<i64>(1), None);
        state.pop(1);
    }

    #[test]
    fn test_nil_key_is_rejected() {
        let lua = Lua::new().unwrap();
        let state = lua.state();
        let entries = vec![(Value::from("ok"), Value::Integer(1)), (Value::Nil, Value::Integer(2))];
        let err = state.push(Value::Map(entries)).unwrap_err();
        assert!(err.to_string().contains("nil or NaN"));
        assert_eq!(state.top(), 0);
    }

    #[test]
    fn test_argument_error_names_position() {
        let lua = Lua::new().unwrap();
        let state = lua.state();
        state.push_integer(1);
        state.push_str("two");
        let err = state.arg::<i64>(2).unwrap_err();
        assert_eq!(err.to_string(), "argument 2: expected type integer, got string");
        let err = state.arg::<Vec<String>>(3).unwrap_err();
        assert_eq!(
            err.to_string(),
            "argument 3: expected type array<string>, got no value"
        );
        state.pop(2);
    }

    #[test]
    fn test_returns_count() {
        let lua = Lua::new().unwrap();
        let state = lua.state();
        assert_eq!(().push_returns(&state).unwrap(), 0);
        assert_eq!(7i64.push_returns(&state).unwrap(), 1);
        assert_eq!(("x", true).push_returns(&state).unwrap(), 2);
        assert_eq!(state.top(), 3);
        state.pop(3);
    }
}
