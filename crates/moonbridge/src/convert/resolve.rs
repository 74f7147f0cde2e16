//! Speculative aggregate resolution
//!
//! A table has no intrinsic host shape: `{1, 2, 3}` is equally a sequence and
//! an integer-keyed mapping, and a string may be wanted as text or as bytes.
//! Resolution tries each candidate interpretation of an element against the
//! caller's [`Shape`] and keeps the first one the shape admits. The winning
//! [`TypeConstraint`] is cached per collection (separately for keys and
//! values) so later elements start from it instead of repeating the search.
//!
//! Resolution never partially succeeds: if any element has no admissible
//! interpretation, the whole value resolves to `None`.
//!
//! A table met again while it is still being expanded, or nested deeper than
//! the depth limit, is kept as a [`Value::Ref`] where the shape is loose
//! (`Any`, `Hashable`) and fails resolution where the shape is explicit.

use crate::stack::{Kind, StackIndex};
use crate::state::State;
use crate::value::Value;
use rustc_hash::FxHashSet;
use std::any::TypeId;
use std::fmt;

/// Maximum table nesting followed before nested tables stop being expanded
const MAX_DEPTH: usize = 64;

// ============================================================================
// Shape
// ============================================================================

/// Host shape a VM value should resolve to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shape {
    /// Anything; tables are guessed
    Any,
    /// Anything usable as a table key
    Hashable,
    /// Boolean
    Boolean,
    /// Integer, or a float with an exact integer value
    Integer,
    /// Any number
    Number,
    /// UTF-8 string
    Text,
    /// Byte string
    Bytes,
    /// Table with keys `1..=n`, each element of the inner shape
    Sequence(Box<Shape>),
    /// Any table, keys and values of the given shapes
    Mapping(Box<Shape>, Box<Shape>),
    /// Opaque handle owning a host value of this type
    Userdata {
        /// Type identity of the host value
        id: TypeId,
        /// Display name of the host type
        name: &'static str,
    },
    /// The value kept unresolved in the registry
    Reference,
    /// `nil` (or absent), or the inner shape
    Optional(Box<Shape>),
}

impl Shape {
    /// Sequence of `element`
    pub fn sequence(element: Shape) -> Shape {
        Shape::Sequence(Box::new(element))
    }

    /// Mapping from `key` to `value`
    pub fn mapping(key: Shape, value: Shape) -> Shape {
        Shape::Mapping(Box::new(key), Box::new(value))
    }

    /// `nil` or `inner`
    pub fn optional(inner: Shape) -> Shape {
        Shape::Optional(Box::new(inner))
    }

    /// Whether `value` satisfies this shape
    pub fn admits(&self, value: &Value) -> bool {
        match (self, value) {
            (Shape::Any, _) => true,
            (Shape::Hashable, v) => v.is_hashable(),
            (Shape::Optional(_), Value::Nil) => true,
            (Shape::Optional(inner), v) => inner.admits(v),
            (Shape::Boolean, Value::Boolean(_)) => true,
            (Shape::Integer, v) => v.as_integer().is_some(),
            (Shape::Number, Value::Integer(_) | Value::Number(_)) => true,
            (Shape::Text, Value::String(_)) => true,
            (Shape::Bytes, Value::Bytes(_)) => true,
            (Shape::Sequence(element), Value::Array(items)) => {
                items.iter().all(|item| element.admits(item))
            }
            (Shape::Mapping(k, v), Value::Map(entries)) => entries
                .iter()
                .all(|(key, value)| k.admits(key) && v.admits(value)),
            (Shape::Userdata { id, .. }, Value::Userdata(rc)) => (**rc).type_id() == *id,
            (Shape::Reference, Value::Ref(_)) => true,
            _ => false,
        }
    }

    fn without_optional(&self) -> &Shape {
        match self {
            Shape::Optional(inner) => inner.without_optional(),
            other => other,
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Any => write!(f, "any"),
            Shape::Hashable => write!(f, "hashable"),
            Shape::Boolean => write!(f, "boolean"),
            Shape::Integer => write!(f, "integer"),
            Shape::Number => write!(f, "number"),
            Shape::Text => write!(f, "string"),
            Shape::Bytes => write!(f, "bytes"),
            Shape::Sequence(e) => write!(f, "array<{e}>"),
            Shape::Mapping(k, v) => write!(f, "map<{k}, {v}>"),
            Shape::Userdata { name, .. } => write!(f, "{name}"),
            Shape::Reference => write!(f, "reference"),
            Shape::Optional(inner) => write!(f, "{inner}?"),
        }
    }
}

// ============================================================================
// Type constraint
// ============================================================================

/// Cached decision about how elements of one collection resolve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeConstraint {
    /// Scalar taken as is
    Direct,
    /// String as UTF-8 text
    Text,
    /// String as raw bytes
    Bytes,
    /// Table as a sequence of anything
    Sequence,
    /// Table as a sequence of key-usable values
    HashableSequence,
    /// Table as a mapping of anything
    Mapping,
    /// Table as a mapping of key-usable values
    HashableMapping,
    /// Opaque handle as its boxed host value
    Boxed,
    /// Value kept as a raw registry reference
    Reference,
}

/// Candidate interpretations for a value of `kind` under `shape`, in trial order.
fn candidates(state: &State<'_>, index: StackIndex, kind: Kind, shape: &Shape) -> Vec<TypeConstraint> {
    use TypeConstraint::*;

    let shape = match shape {
        Shape::Optional(_) if kind == Kind::Nil => return vec![Direct],
        other => other.without_optional(),
    };
    if *shape == Shape::Reference {
        return vec![Reference];
    }

    match kind {
        Kind::Nil | Kind::Boolean | Kind::Number | Kind::LightUserdata => vec![Direct],
        Kind::String => vec![Text, Bytes],
        Kind::Table => match shape {
            Shape::Sequence(_) => vec![Sequence],
            Shape::Mapping(..) => vec![Mapping],
            // A sequence is always presentable as a mapping, so mapping wins ties.
            Shape::Hashable => vec![HashableMapping, HashableSequence],
            Shape::Any if state.sequence_length(index).is_some() => vec![Sequence, Mapping],
            Shape::Any => vec![Mapping],
            _ => Vec::new(),
        },
        Kind::Userdata => vec![Boxed, Reference],
        Kind::Function | Kind::Thread => vec![Reference],
    }
}

// ============================================================================
// Resolver
// ============================================================================

struct Resolver<'s, 'a> {
    state: &'s State<'a>,
    depth: usize,
    /// Identities of the tables currently being expanded
    open: FxHashSet<usize>,
    /// Set once an explicit shape runs into a cycle or the depth limit;
    /// every later trial fails
    exhausted: bool,
}

impl Resolver<'_, '_> {
    /// Resolve the value at absolute `index`, consulting and updating `cache`.
    fn resolve(
        &mut self,
        index: StackIndex,
        shape: &Shape,
        cache: &mut Option<TypeConstraint>,
    ) -> Option<Value> {
        if self.exhausted {
            return None;
        }
        let kind = self.state.kind(index).unwrap_or(Kind::Nil);

        if kind == Kind::Table && !self.can_expand(index) {
            // Loose shapes keep the table as a reference; explicit ones fail.
            if matches!(shape.without_optional(), Shape::Any | Shape::Hashable) {
                return self
                    .state
                    .keep(index)
                    .ok()
                    .map(Value::Ref)
                    .filter(|value| shape.admits(value));
            }
            self.exhausted = true;
            return None;
        }

        if let Some(cached) = *cache {
            if let Some(value) = self.attempt(index, kind, cached, shape) {
                return Some(value);
            }
        }

        for candidate in candidates(self.state, index, kind, shape) {
            if self.exhausted {
                return None;
            }
            if Some(candidate) == *cache {
                continue;
            }
            if let Some(value) = self.attempt(index, kind, candidate, shape) {
                *cache = Some(candidate);
                return Some(value);
            }
        }
        None
    }

    /// Trial: materialize one interpretation and test it against the shape.
    fn attempt(
        &mut self,
        index: StackIndex,
        kind: Kind,
        constraint: TypeConstraint,
        shape: &Shape,
    ) -> Option<Value> {
        let value = self.materialize(index, kind, constraint, shape)?;
        shape.admits(&value).then_some(value)
    }

    fn materialize(
        &mut self,
        index: StackIndex,
        kind: Kind,
        constraint: TypeConstraint,
        shape: &Shape,
    ) -> Option<Value> {
        let state = self.state;
        match constraint {
            TypeConstraint::Direct => match kind {
                Kind::Nil => Some(Value::Nil),
                Kind::Boolean => Some(Value::Boolean(state.to_bool(index))),
                Kind::Number if state.is_integer(index) => state.to_integer(index).map(Value::Integer),
                Kind::Number => state.to_number(index).map(Value::Number),
                Kind::LightUserdata => Some(Value::LightUserdata(state.to_userdata(index))),
                _ => None,
            },
            TypeConstraint::Text => state.to_str(index).map(Value::String),
            TypeConstraint::Bytes => state.to_bytes(index).map(Value::Bytes),
            TypeConstraint::Sequence => {
                let element = match shape.without_optional() {
                    Shape::Sequence(element) => element.as_ref().clone(),
                    _ => Shape::Any,
                };
                self.sequence(index, &element)
            }
            TypeConstraint::HashableSequence => self.sequence(index, &Shape::Hashable),
            TypeConstraint::Mapping => {
                let (key, value) = match shape.without_optional() {
                    Shape::Mapping(k, v) => (k.as_ref().clone(), v.as_ref().clone()),
                    _ => (Shape::Hashable, Shape::Any),
                };
                self.mapping(index, &key, &value)
            }
            TypeConstraint::HashableMapping => self.mapping(index, &Shape::Hashable, &Shape::Hashable),
            TypeConstraint::Boxed => state.handle_value(index).map(Value::Userdata),
            TypeConstraint::Reference => state.keep(index).ok().map(Value::Ref),
        }
    }

    /// False for a table already being expanded, or one past the depth limit
    fn can_expand(&self, table: StackIndex) -> bool {
        self.depth < MAX_DEPTH && !self.open.contains(&(self.state.to_pointer(table) as usize))
    }

    fn enter(&mut self, table: StackIndex) -> bool {
        if self.state.ensure_stack(3).is_err() {
            self.exhausted = true;
            return false;
        }
        self.open.insert(self.state.to_pointer(table) as usize);
        self.depth += 1;
        true
    }

    fn leave(&mut self, table: StackIndex) {
        self.open.remove(&(self.state.to_pointer(table) as usize));
        self.depth -= 1;
    }

    fn sequence(&mut self, table: StackIndex, element: &Shape) -> Option<Value> {
        let len = self.state.sequence_length(table)?;
        if !self.enter(table) {
            return None;
        }
        let mut cache = None;
        let mut items = Vec::with_capacity(len as usize);
        let mut ok = true;
        for i in 1..=len {
            self.state.raw_get_index(table, i);
            let item = self.resolve(self.state.top(), element, &mut cache);
            self.state.pop(1);
            match item {
                Some(item) => items.push(item),
                None => {
                    ok = false;
                    break;
                }
            }
        }
        self.leave(table);
        ok.then_some(Value::Array(items))
    }

    fn mapping(&mut self, table: StackIndex, key: &Shape, value: &Shape) -> Option<Value> {
        if !self.enter(table) {
            return None;
        }
        let mut key_cache = None;
        let mut value_cache = None;
        let mut entries = Vec::new();
        let mut ok = true;
        self.state.push_nil();
        while self.state.next(table) {
            let top = self.state.top();
            let k = self.resolve(top - 1, key, &mut key_cache);
            let v = self.resolve(top, value, &mut value_cache);
            self.state.pop(1);
            match (k, v) {
                (Some(k), Some(v)) => entries.push((k, v)),
                _ => {
                    self.state.pop(1);
                    ok = false;
                    break;
                }
            }
        }
        self.leave(table);
        ok.then_some(Value::Map(entries))
    }
}

// ============================================================================
// State entry points
// ============================================================================

impl<'a> State<'a> {
    /// Length `n` if the table at `index` has keys exactly `1..=n`
    /// (`Some(0)` for an empty table), otherwise `None`.
    pub fn sequence_length(&self, index: StackIndex) -> Option<i64> {
        if self.kind(index) != Some(Kind::Table) || self.ensure_stack(2).is_err() {
            return None;
        }
        let table = self.absolute(index);
        let mut count: i64 = 0;
        let mut max: i64 = 0;
        self.push_nil();
        while self.next(table) {
            let key = if self.is_integer(-2) { self.to_integer(-2) } else { None };
            match key {
                Some(k) if k >= 1 => {
                    count += 1;
                    max = max.max(k);
                    self.pop(1);
                }
                _ => {
                    self.pop(2);
                    return None;
                }
            }
        }
        (max == count).then_some(count)
    }

    /// Convert the value at `index` to a host value.
    ///
    /// With `guess`, strings and tables are resolved heuristically; without
    /// it they come back as [`Value::Ref`] placeholders. Returns `None` only
    /// for an unused index.
    pub fn to_native(&self, index: StackIndex, guess: bool) -> Option<Value> {
        let kind = self.kind(index)?;
        let index = self.absolute(index);
        if guess {
            return self.resolve_shape(index, &Shape::Any);
        }
        match kind {
            Kind::String | Kind::Table | Kind::Function | Kind::Thread => {
                self.keep(index).ok().map(Value::Ref)
            }
            Kind::Userdata => self
                .handle_value(index)
                .map(Value::Userdata)
                .or_else(|| self.keep(index).ok().map(Value::Ref)),
            _ => self.resolve_shape(index, &Shape::Any),
        }
    }

    /// Resolve the value at `index` against an explicit shape
    pub fn resolve_shape(&self, index: StackIndex, shape: &Shape) -> Option<Value> {
        let index = self.absolute(index);
        let mut resolver = Resolver {
            state: self,
            depth: 0,
            open: FxHashSet::default(),
            exhausted: false,
        };
        resolver.resolve(index, shape, &mut None)
    }
}
