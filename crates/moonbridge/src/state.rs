//! VM instance ownership and the host-side state block
//!
//! [`Lua`] owns a `lua_State` and the [`Shared`] block that every bridged
//! call reaches through the registry. [`State`] is a borrowed view of one VM
//! thread; it is what bridged closures receive as their call context.

use crate::closure::ClosureWrapper;
use crate::continuation::ContinuationRecord;
use crate::error::{BridgeError, BridgeResult};
use crate::metatable::MetatableRegistry;
use crate::options::LuaOptions;
use crate::refs::RefSlot;
use crate::trampoline;
use mlua_sys as ffi;
use rustc_hash::FxHashMap;
use std::cell::{Cell, RefCell};
use std::ffi::{c_void, CStr};
use std::fmt;
use std::os::raw::c_int;
use std::rc::{Rc, Weak};

// ============================================================================
// Registry keys
// ============================================================================

// Fixed registry keys. Only the address of each static matters.

/// Key of the closure-wrapper metatable consulted by the call trampoline
pub(crate) static CLOSURE_WRAPPER_KEY: u8 = 0;
/// Key of the continuation-record metatable consulted on re-entry
pub(crate) static CONTINUATION_KEY: u8 = 0;
/// Key of the host-side state block
pub(crate) static STATE_BLOCK_KEY: u8 = 0;

pub(crate) fn registry_key(key: &'static u8) -> *const c_void {
    key as *const u8 as *const c_void
}

// ============================================================================
// Shared state block
// ============================================================================

/// Host-side state shared by every thread of one VM instance
pub(crate) struct Shared {
    pub(crate) main: *mut ffi::lua_State,
    pub(crate) this: Weak<Shared>,
    /// Set while the VM is being torn down
    pub(crate) closing: Cell<bool>,
    /// Reverse pointers from registry slots to live `ValueRef`s
    pub(crate) refs: RefCell<FxHashMap<c_int, Weak<RefSlot>>>,
    pub(crate) metatables: RefCell<MetatableRegistry>,
    pub(crate) options: LuaOptions,
}

impl Shared {
    /// Mark every outstanding `ValueRef` invalid, returning how many there were.
    pub(crate) fn invalidate_refs(&self) -> usize {
        let refs = std::mem::take(&mut *self.refs.borrow_mut());
        let mut count = 0;
        for slot in refs.values().filter_map(Weak::upgrade) {
            slot.invalidate();
            count += 1;
        }
        count
    }
}

// ============================================================================
// Lua
// ============================================================================

/// An owned Lua VM instance
///
/// Dropping it closes the VM. Any [`ValueRef`](crate::ValueRef) still held
/// by the host becomes invalid, and using it afterwards reports
/// [`BridgeError::Closed`].
pub struct Lua {
    main: *mut ffi::lua_State,
    shared: Rc<Shared>,
}

impl Lua {
    /// Create a VM with default options
    pub fn new() -> BridgeResult<Self> {
        Self::with_options(LuaOptions::default())
    }

    /// Create a VM with the given options
    pub fn with_options(options: LuaOptions) -> BridgeResult<Self> {
        let main = unsafe { ffi::luaL_newstate() };
        if main.is_null() {
            return Err(BridgeError::Memory);
        }

        let shared = Rc::new_cyclic(|this| Shared {
            main,
            this: this.clone(),
            closing: Cell::new(false),
            refs: RefCell::new(FxHashMap::default()),
            metatables: RefCell::new(MetatableRegistry::default()),
            options,
        });

        unsafe {
            ffi::lua_pushlightuserdata(main, Rc::as_ptr(&shared) as *mut c_void);
            ffi::lua_rawsetp(main, ffi::LUA_REGISTRYINDEX, registry_key(&STATE_BLOCK_KEY));
        }

        let lua = Lua { main, shared };
        {
            let state = lua.state();
            state.install_internal_metatable(
                &CLOSURE_WRAPPER_KEY,
                c"moonbridge.closure",
                trampoline::finalizer::<ClosureWrapper>,
            )?;
            state.install_internal_metatable(
                &CONTINUATION_KEY,
                c"moonbridge.continuation",
                trampoline::finalizer::<ContinuationRecord>,
            )?;
            for library in &lua.shared.options.libraries {
                state.require(library.name(), library.opener(), true)?;
            }
            if let Some(mode) = lua.shared.options.gc_mode {
                state.set_gc_mode(mode);
            }
        }

        tracing::debug!(
            libraries = lua.shared.options.libraries.len(),
            "opened Lua VM"
        );
        Ok(lua)
    }

    /// View of the main thread
    pub fn state(&self) -> State<'_> {
        State {
            l: self.main,
            shared: &self.shared,
        }
    }

    /// Options this VM was created with
    pub fn options(&self) -> &LuaOptions {
        &self.shared.options
    }
}

impl Drop for Lua {
    fn drop(&mut self) {
        self.shared.closing.set(true);
        let invalidated = self.shared.invalidate_refs();
        unsafe { ffi::lua_close(self.main) };
        tracing::debug!(invalidated, "closed Lua VM");
    }
}

impl fmt::Debug for Lua {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lua")
            .field("main", &self.main)
            .field("live_refs", &self.shared.refs.borrow().len())
            .finish()
    }
}

// ============================================================================
// State
// ============================================================================

/// A borrowed view of one VM thread
///
/// `State` is cheap to copy. All stack, conversion, reference and call
/// operations are methods on it, split across the modules of this crate.
#[derive(Clone, Copy)]
pub struct State<'a> {
    pub(crate) l: *mut ffi::lua_State,
    pub(crate) shared: &'a Shared,
}

impl<'a> State<'a> {
    /// Recover the view for `l` from the state block in its registry.
    ///
    /// # Safety
    ///
    /// `l` must be a live thread of a VM created by [`Lua`], and the returned
    /// view must not outlive that VM.
    pub(crate) unsafe fn from_raw(l: *mut ffi::lua_State) -> Option<State<'a>> {
        ffi::lua_rawgetp(l, ffi::LUA_REGISTRYINDEX, registry_key(&STATE_BLOCK_KEY));
        let shared = ffi::lua_touserdata(l, -1) as *const Shared;
        ffi::lua_pop(l, 1);
        shared.as_ref().map(|shared| State { l, shared })
    }

    /// Raw thread pointer
    pub fn as_ptr(&self) -> *mut ffi::lua_State {
        self.l
    }

    /// True if this view is on the VM's main thread
    pub fn is_main_thread(&self) -> bool {
        self.l == self.shared.main
    }

    /// Whether `other` belongs to the same VM instance
    pub fn same_vm(&self, other: &State<'_>) -> bool {
        std::ptr::eq(self.shared, other.shared)
    }

    pub(crate) fn install_internal_metatable(
        &self,
        key: &'static u8,
        name: &CStr,
        gc: ffi::lua_CFunction,
    ) -> BridgeResult<()> {
        self.ensure_stack(3)?;
        self.new_table(0, 3);
        unsafe { ffi::lua_pushcfunction(self.l, gc) };
        self.set_field_raw(-2, "__gc");
        unsafe { ffi::lua_pushstring(self.l, name.as_ptr()) };
        self.set_field_raw(-2, "__name");
        self.push_bool(false);
        self.set_field_raw(-2, "__metatable");
        unsafe { ffi::lua_rawsetp(self.l, ffi::LUA_REGISTRYINDEX, registry_key(key)) };
        Ok(())
    }

    /// Push the metatable stored under a fixed registry key.
    pub(crate) fn push_internal_metatable(&self, key: &'static u8) {
        unsafe { ffi::lua_rawgetp(self.l, ffi::LUA_REGISTRYINDEX, registry_key(key)) };
    }
}

impl fmt::Debug for State<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("thread", &self.l)
            .field("top", &self.top())
            .finish()
    }
}
