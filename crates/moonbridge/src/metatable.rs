//! Metatable registry and opaque handles
//!
//! Host values without a native VM form are pushed as opaque handles: a
//! userdata owning an `Rc<dyn Any>`, finalized by the VM's collector. Each
//! host type gets one metatable per VM instance, built from the [`Metatable`]
//! registered for it, or from the process-wide default, or (failing both)
//! holding only the finalizer.
//!
//! Properties and methods are folded into synthesized `__index` and
//! `__newindex` functions when the table is registered.

use crate::closure::{callback, Completion};
use crate::error::{BridgeError, BridgeResult};
use crate::stack::{Kind, StackIndex};
use crate::state::State;
use crate::trampoline::{self, Finalize};
use mlua_sys as ffi;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::fmt;
use std::os::raw::c_int;
use std::ptr;
use std::rc::Rc;
use std::sync::Arc;

/// Shareable dispatch entry of a metatable
pub type Dispatch = Arc<dyn Fn(&State<'_>) -> BridgeResult<Completion> + Send + Sync>;

/// Operations a metatable can overload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Unm,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    BNot,
    Concat,
    Len,
    Eq,
    Lt,
    Le,
    Index,
    NewIndex,
    Call,
    ToString,
    Pairs,
    Close,
}

impl MetaOp {
    /// Metatable field name, e.g. `"__add"`
    pub fn field(self) -> &'static str {
        match self {
            MetaOp::Add => "__add",
            MetaOp::Sub => "__sub",
            MetaOp::Mul => "__mul",
            MetaOp::Div => "__div",
            MetaOp::Mod => "__mod",
            MetaOp::Pow => "__pow",
            MetaOp::Unm => "__unm",
            MetaOp::IDiv => "__idiv",
            MetaOp::BAnd => "__band",
            MetaOp::BOr => "__bor",
            MetaOp::BXor => "__bxor",
            MetaOp::Shl => "__shl",
            MetaOp::Shr => "__shr",
            MetaOp::BNot => "__bnot",
            MetaOp::Concat => "__concat",
            MetaOp::Len => "__len",
            MetaOp::Eq => "__eq",
            MetaOp::Lt => "__lt",
            MetaOp::Le => "__le",
            MetaOp::Index => "__index",
            MetaOp::NewIndex => "__newindex",
            MetaOp::Call => "__call",
            MetaOp::ToString => "__tostring",
            MetaOp::Pairs => "__pairs",
            MetaOp::Close => "__close",
        }
    }
}

// ============================================================================
// Metatable description
// ============================================================================

struct Property {
    get: Dispatch,
    set: Option<Dispatch>,
}

/// Dispatch table for one host type
///
/// Built once and registered with [`State::register_metatable`], or installed
/// process-wide with [`set_default_metatable`].
#[derive(Default)]
pub struct Metatable {
    name: Option<String>,
    ops: Vec<(MetaOp, Dispatch)>,
    methods: Vec<(String, Dispatch)>,
    properties: Vec<(String, Property)>,
}

impl Metatable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the display name (`__name`); defaults to the Rust type name
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Overload an operator. An explicit `Index`/`NewIndex` becomes the
    /// fallback once methods and properties have been consulted.
    pub fn op<F>(mut self, op: MetaOp, f: F) -> Self
    where
        F: Fn(&State<'_>) -> BridgeResult<Completion> + Send + Sync + 'static,
    {
        self.ops.retain(|(existing, _)| *existing != op);
        self.ops.push((op, Arc::new(f)));
        self
    }

    /// Add a method reachable as `value:name(...)`
    pub fn method<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&State<'_>) -> BridgeResult<Completion> + Send + Sync + 'static,
    {
        self.methods.push((name.into(), Arc::new(f)));
        self
    }

    /// Add a read-only property. The getter sees the handle at 1 and the key at 2.
    pub fn property<G>(mut self, name: impl Into<String>, get: G) -> Self
    where
        G: Fn(&State<'_>) -> BridgeResult<Completion> + Send + Sync + 'static,
    {
        self.properties.push((
            name.into(),
            Property {
                get: Arc::new(get),
                set: None,
            },
        ));
        self
    }

    /// Add a read-write property. The setter sees the handle, key and new value at 1..3.
    pub fn property_rw<G, S>(mut self, name: impl Into<String>, get: G, set: S) -> Self
    where
        G: Fn(&State<'_>) -> BridgeResult<Completion> + Send + Sync + 'static,
        S: Fn(&State<'_>) -> BridgeResult<Completion> + Send + Sync + 'static,
    {
        self.properties.push((
            name.into(),
            Property {
                get: Arc::new(get),
                set: Some(Arc::new(set)),
            },
        ));
        self
    }

    fn dispatch(&self, op: MetaOp) -> Option<Dispatch> {
        self.ops
            .iter()
            .find(|(existing, _)| *existing == op)
            .map(|(_, f)| f.clone())
    }
}

impl fmt::Debug for Metatable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metatable")
            .field("name", &self.name)
            .field("ops", &self.ops.iter().map(|(op, _)| op).collect::<Vec<_>>())
            .field("methods", &self.methods.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .field(
                "properties",
                &self.properties.iter().map(|(n, _)| n).collect::<Vec<_>>(),
            )
            .finish()
    }
}

static DEFAULT_METATABLE: Lazy<RwLock<Option<Arc<Metatable>>>> = Lazy::new(|| RwLock::new(None));

/// Install (or with `None`, remove) the process-wide fallback table used for
/// host types that have no registered metatable.
///
/// Affects types first pushed after the call; a VM that already built a
/// table for a type keeps it.
pub fn set_default_metatable(table: Option<Metatable>) {
    *DEFAULT_METATABLE.write() = table.map(Arc::new);
}

// ============================================================================
// Per-VM registry
// ============================================================================

struct MetatableEntry {
    name: String,
    /// Registry slot holding the built metatable
    slot: c_int,
}

/// Type identity to metatable, for one VM instance
#[derive(Default)]
pub(crate) struct MetatableRegistry {
    entries: FxHashMap<TypeId, MetatableEntry>,
    names: FxHashMap<String, TypeId>,
    /// Identities of every metatable built here, for handle checks
    known: FxHashSet<usize>,
}

impl MetatableRegistry {
    /// `base`, or `base#n` if another type already uses that name
    fn unique_name(&self, id: TypeId, base: &str) -> String {
        let mut name = base.to_string();
        let mut n = 2;
        while let Some(owner) = self.names.get(&name) {
            if *owner == id {
                break;
            }
            name = format!("{base}#{n}");
            n += 1;
        }
        name
    }
}

// ============================================================================
// Opaque handles
// ============================================================================

/// Userdata payload owning one host value
pub(crate) struct Handle {
    value: RefCell<Option<Rc<dyn Any>>>,
}

impl Finalize for Handle {
    fn finalize(&self) {
        let value = self.value.borrow_mut().take();
        drop(value);
    }
}

impl<'a> State<'a> {
    /// Register the metatable for host type `T` in this VM.
    ///
    /// # Panics
    ///
    /// Panics if `T` already has a metatable here, including one built
    /// implicitly when a `T` was pushed before registration.
    pub fn register_metatable<T: Any>(&self, table: Metatable) -> BridgeResult<()> {
        let id = TypeId::of::<T>();
        if self.shared.metatables.borrow().entries.contains_key(&id) {
            panic!(
                "metatable for {} is already registered",
                std::any::type_name::<T>()
            );
        }
        let name = table
            .name
            .clone()
            .unwrap_or_else(|| std::any::type_name::<T>().to_string());
        self.build_metatable(id, &name, Some(&table))?;
        Ok(())
    }

    /// Name under which `T`'s metatable was built, if it has one yet
    pub fn metatable_name<T: Any>(&self) -> Option<String> {
        self.shared
            .metatables
            .borrow()
            .entries
            .get(&TypeId::of::<T>())
            .map(|entry| entry.name.clone())
    }

    /// Push a host value as an opaque handle
    pub fn push_any<T: Any>(&self, value: T) -> BridgeResult<()> {
        self.push_handle(Rc::new(value))
    }

    /// Push a shared host value as an opaque handle
    pub fn push_handle<T: Any>(&self, value: Rc<T>) -> BridgeResult<()> {
        self.push_erased(value, TypeId::of::<T>(), std::any::type_name::<T>())
    }

    pub(crate) fn push_erased(
        &self,
        value: Rc<dyn Any>,
        id: TypeId,
        type_name: &str,
    ) -> BridgeResult<()> {
        self.ensure_stack(4)?;
        unsafe {
            let ud = ffi::lua_newuserdatauv(self.l, std::mem::size_of::<Handle>(), 0);
            ptr::write(
                ud as *mut Handle,
                Handle {
                    value: RefCell::new(Some(value)),
                },
            );
        }
        if let Err(err) = self.push_type_metatable(id, type_name) {
            self.abandon_handle();
            return Err(err);
        }
        unsafe { ffi::lua_setmetatable(self.l, -2) };
        Ok(())
    }

    /// Pop a handle that never got its metatable. Without `__gc` the
    /// collector would not release its value, so it is dropped here.
    fn abandon_handle(&self) {
        let handle = self.to_userdata(-1) as *const Handle;
        if let Some(handle) = unsafe { handle.as_ref() } {
            handle.finalize();
        }
        self.pop(1);
    }

    fn push_type_metatable(&self, id: TypeId, type_name: &str) -> BridgeResult<()> {
        let slot = self
            .shared
            .metatables
            .borrow()
            .entries
            .get(&id)
            .map(|entry| entry.slot);
        let slot = match slot {
            Some(slot) => slot,
            None => {
                let default = DEFAULT_METATABLE.read().clone();
                if default.is_none() {
                    tracing::warn!(
                        type_name,
                        "no metatable for pushed host type; it will expose no operations"
                    );
                }
                self.build_metatable(id, type_name, default.as_deref())?
            }
        };
        unsafe { ffi::lua_rawgeti(self.l, ffi::LUA_REGISTRYINDEX, slot as ffi::lua_Integer) };
        Ok(())
    }

    /// Build the VM table for `id`, pin it in the registry and record it.
    fn build_metatable(
        &self,
        id: TypeId,
        base_name: &str,
        table: Option<&Metatable>,
    ) -> BridgeResult<c_int> {
        let name = self.shared.metatables.borrow().unique_name(id, base_name);
        let top = self.top();
        self.ensure_stack(4)?;
        self.new_table(0, 4);
        let result = self.fill_metatable(&name, table);
        if let Err(err) = result {
            self.set_top(top);
            return Err(err);
        }

        let identity = self.to_pointer(-1) as usize;
        let slot = unsafe { ffi::luaL_ref(self.l, ffi::LUA_REGISTRYINDEX) };
        let mut registry = self.shared.metatables.borrow_mut();
        registry.known.insert(identity);
        registry.names.insert(name.clone(), id);
        registry.entries.insert(id, MetatableEntry { name: name.clone(), slot });
        tracing::debug!(name = %name, registered = table.is_some(), "built metatable");
        Ok(slot)
    }

    fn fill_metatable(&self, name: &str, table: Option<&Metatable>) -> BridgeResult<()> {
        self.push_cfunction(trampoline::finalizer::<Handle>);
        self.set_field_raw(-2, "__gc");
        self.push_str(name);
        self.set_field_raw(-2, "__name");

        let Some(table) = table else {
            return Ok(());
        };

        for (op, dispatch) in &table.ops {
            if matches!(op, MetaOp::Index | MetaOp::NewIndex)
                && !(table.methods.is_empty() && table.properties.is_empty())
            {
                continue;
            }
            let dispatch = dispatch.clone();
            self.push_callback(callback(move |state| dispatch(state)))?;
            self.set_field_raw(-2, op.field());
        }

        if table.methods.is_empty() && table.properties.is_empty() {
            return Ok(());
        }

        // Methods live in a plain table pinned for the VM's lifetime.
        self.new_table(0, table.methods.len() as i32);
        for (method, dispatch) in &table.methods {
            let dispatch = dispatch.clone();
            self.push_callback(callback(move |state| dispatch(state)))?;
            self.set_field_raw(-2, method);
        }
        let methods = unsafe { ffi::luaL_ref(self.l, ffi::LUA_REGISTRYINDEX) };

        let getters: FxHashMap<String, Dispatch> = table
            .properties
            .iter()
            .map(|(key, property)| (key.clone(), property.get.clone()))
            .collect();
        let fallback = table.dispatch(MetaOp::Index);
        self.push_callback(callback(move |state| {
            if let Some(key) = state.to_str(2) {
                if let Some(getter) = getters.get(&key) {
                    return getter(state);
                }
                state.ensure_stack(2)?;
                unsafe {
                    ffi::lua_rawgeti(state.l, ffi::LUA_REGISTRYINDEX, methods as ffi::lua_Integer)
                };
                state.push_copy(2);
                if state.raw_get(-2) != Kind::Nil {
                    return Ok(Completion::Return(1));
                }
                state.pop(2);
            }
            match &fallback {
                Some(fallback) => fallback(state),
                None => {
                    state.push_nil();
                    Ok(Completion::Return(1))
                }
            }
        }))?;
        self.set_field_raw(-2, "__index");

        let setters: FxHashMap<String, Dispatch> = table
            .properties
            .iter()
            .filter_map(|(key, property)| Some((key.clone(), property.set.clone()?)))
            .collect();
        let fallback = table.dispatch(MetaOp::NewIndex);
        let type_name = name.to_string();
        self.push_callback(callback(move |state| {
            if let Some(key) = state.to_str(2) {
                if let Some(setter) = setters.get(&key) {
                    return setter(state);
                }
                if fallback.is_none() {
                    return Err(BridgeError::host(format!(
                        "cannot assign field '{key}' of {type_name}"
                    )));
                }
            }
            match &fallback {
                Some(fallback) => fallback(state),
                None => Err(BridgeError::host(format!(
                    "cannot assign to a {} key of {type_name}",
                    state.type_name(2)
                ))),
            }
        }))?;
        self.set_field_raw(-2, "__newindex");
        Ok(())
    }

    /// True if the value at `index` is a handle created by this VM's registry
    pub fn is_handle(&self, index: StackIndex) -> bool {
        if self.kind(index) != Some(Kind::Userdata) || self.ensure_stack(1).is_err() {
            return false;
        }
        if unsafe { ffi::lua_getmetatable(self.l, index) } == 0 {
            return false;
        }
        let identity = self.to_pointer(-1) as usize;
        self.pop(1);
        self.shared.metatables.borrow().known.contains(&identity)
    }

    /// The host value owned by the handle at `index`
    pub fn handle_value(&self, index: StackIndex) -> Option<Rc<dyn Any>> {
        if !self.is_handle(index) {
            return None;
        }
        let handle = self.to_userdata(index) as *const Handle;
        unsafe { handle.as_ref() }.and_then(|handle| handle.value.borrow().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Lua;

    struct Counter(std::cell::Cell<i64>);

    #[test]
    fn test_metaop_fields() {
        assert_eq!(MetaOp::Add.field(), "__add");
        assert_eq!(MetaOp::ToString.field(), "__tostring");
        assert_eq!(MetaOp::Close.field(), "__close");
    }

    #[test]
    fn test_unique_names() {
        let mut registry = MetatableRegistry::default();
        let a = TypeId::of::<u8>();
        let b = TypeId::of::<u16>();
        registry.names.insert("Thing".to_string(), a);
        assert_eq!(registry.unique_name(a, "Thing"), "Thing");
        assert_eq!(registry.unique_name(b, "Thing"), "Thing#2");
        registry.names.insert("Thing#2".to_string(), b);
        assert_eq!(registry.unique_name(TypeId::of::<u32>(), "Thing"), "Thing#3");
    }

    #[test]
    fn test_handle_roundtrip() {
        let lua = Lua::new().unwrap();
        let state = lua.state();
        state.push_any(Counter(std::cell::Cell::new(3))).unwrap();
        assert!(state.is_handle(-1));
        let counter: Rc<Counter> = state.resolve(-1).unwrap();
        assert_eq!(counter.0.get(), 3);
        assert!(state.resolve::<Rc<String>>(-1).is_none());
        state.pop(1);
    }

    #[test]
    fn test_foreign_userdata_is_not_a_handle() {
        let lua = Lua::new().unwrap();
        let state = lua.state();
        unsafe { ffi::lua_newuserdatauv(state.as_ptr(), 16, 0) };
        assert!(!state.is_handle(-1));
        assert!(state.handle_value(-1).is_none());
        state.pop(1);
    }

    #[test]
    fn test_handle_dropped_on_collect() {
        let lua = Lua::new().unwrap();
        let state = lua.state();
        let shared = Rc::new(Counter(std::cell::Cell::new(0)));
        state.push_handle(shared.clone()).unwrap();
        assert_eq!(Rc::strong_count(&shared), 2);
        state.pop(1);
        state.gc_collect();
        assert_eq!(Rc::strong_count(&shared), 1);
    }

    #[test]
    fn test_abandoned_handle_releases_value() {
        let lua = Lua::new().unwrap();
        let state = lua.state();
        let shared = Rc::new(Counter(std::cell::Cell::new(1)));
        unsafe {
            let ud = ffi::lua_newuserdatauv(state.as_ptr(), std::mem::size_of::<Handle>(), 0);
            ptr::write(
                ud as *mut Handle,
                Handle {
                    value: RefCell::new(Some(shared.clone() as Rc<dyn Any>)),
                },
            );
        }
        assert_eq!(Rc::strong_count(&shared), 2);
        state.abandon_handle();
        assert_eq!(Rc::strong_count(&shared), 1);
        assert_eq!(state.top(), 0);
    }

    #[test]
    fn test_implicit_table_has_finalizer_and_name() {
        let lua = Lua::new().unwrap();
        let state = lua.state();
        state.push_any(5u128).unwrap();
        assert_eq!(state.metatable_name::<u128>().as_deref(), Some("u128"));
        state.pop(1);
    }
}
