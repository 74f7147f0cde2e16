//! Reference registry
//!
//! A [`ValueRef`] pins a VM value in the registry so the host can hold on to
//! it beyond the current call. The state block keeps a reverse pointer to
//! every live reference; when the VM is closed first, those references are
//! invalidated and later use is reported as [`BridgeError::Closed`].

use crate::error::{BridgeError, BridgeResult};
use crate::stack::{Kind, StackIndex};
use crate::state::{Shared, State};
use mlua_sys as ffi;
use std::cell::Cell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::os::raw::c_int;
use std::rc::{Rc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Live(c_int),
    Released,
    Invalidated,
}

/// Registry slot shared by all clones of one `ValueRef`
pub(crate) struct RefSlot {
    state: Cell<SlotState>,
    kind: Kind,
    /// False for slots the VM owns (the globals table, `nil`)
    pinned: bool,
    owner: Weak<Shared>,
}

impl RefSlot {
    pub(crate) fn invalidate(&self) {
        if let SlotState::Live(_) = self.state.get() {
            self.state.set(SlotState::Invalidated);
        }
    }

    fn unpin(&self) {
        let SlotState::Live(slot) = self.state.get() else {
            return;
        };
        self.state.set(SlotState::Released);
        if !self.pinned {
            return;
        }
        let Some(shared) = self.owner.upgrade() else {
            return;
        };
        if shared.closing.get() {
            return;
        }
        shared.refs.borrow_mut().remove(&slot);
        unsafe {
            if ffi::lua_checkstack(shared.main, 2) != 0 {
                ffi::luaL_unref(shared.main, ffi::LUA_REGISTRYINDEX, slot);
            }
        }
    }
}

impl Drop for RefSlot {
    fn drop(&mut self) {
        self.unpin();
    }
}

/// Host-held handle to a VM value pinned in the registry
///
/// Clones share one registry slot. The slot is unpinned by
/// [`release`](ValueRef::release) or when the last clone is dropped,
/// whichever comes first.
#[derive(Clone)]
pub struct ValueRef {
    slot: Rc<RefSlot>,
}

impl ValueRef {
    /// Dynamic type of the referenced value
    pub fn kind(&self) -> Kind {
        self.slot.kind
    }

    /// True until released or until the VM is closed
    pub fn is_valid(&self) -> bool {
        matches!(self.slot.state.get(), SlotState::Live(_)) && self.slot.owner.strong_count() > 0
    }

    /// Unpin the value. Releasing twice is an error.
    pub fn release(&self) -> BridgeResult<()> {
        self.slot_index()?;
        self.slot.unpin();
        Ok(())
    }

    /// Registry slot, or the reason it can no longer be used
    pub(crate) fn slot_index(&self) -> BridgeResult<c_int> {
        match self.slot.state.get() {
            SlotState::Live(_) if self.slot.owner.strong_count() == 0 => Err(BridgeError::Closed),
            SlotState::Live(slot) => Ok(slot),
            SlotState::Released => Err(BridgeError::Released),
            SlotState::Invalidated => Err(BridgeError::Closed),
        }
    }

    fn owned_by(&self, shared: &Shared) -> bool {
        std::ptr::eq(self.slot.owner.as_ptr(), shared)
    }
}

impl PartialEq for ValueRef {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.slot, &other.slot)
    }
}

impl Eq for ValueRef {}

impl Hash for ValueRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.slot) as usize).hash(state);
    }
}

impl fmt::Debug for ValueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.slot.state.get() {
            SlotState::Live(slot) => write!(f, "ValueRef({}, slot {slot})", self.slot.kind),
            SlotState::Released => write!(f, "ValueRef({}, released)", self.slot.kind),
            SlotState::Invalidated => write!(f, "ValueRef({}, closed)", self.slot.kind),
        }
    }
}

impl<'a> State<'a> {
    /// Pin a copy of the value at `index`. The stack is left unchanged.
    pub fn keep(&self, index: StackIndex) -> BridgeResult<ValueRef> {
        let kind = self.kind(index).unwrap_or(Kind::Nil);
        self.ensure_stack(1)?;
        self.push_copy(index);
        let slot = unsafe { ffi::luaL_ref(self.l, ffi::LUA_REGISTRYINDEX) };
        let pinned = slot != ffi::LUA_REFNIL;
        let value_ref = ValueRef {
            slot: Rc::new(RefSlot {
                state: Cell::new(SlotState::Live(slot)),
                kind,
                pinned,
                owner: self.shared.this.clone(),
            }),
        };
        if pinned {
            self.shared
                .refs
                .borrow_mut()
                .insert(slot, Rc::downgrade(&value_ref.slot));
        }
        Ok(value_ref)
    }

    /// Push the referenced value
    pub fn push_ref(&self, value_ref: &ValueRef) -> BridgeResult<()> {
        let slot = value_ref.slot_index()?;
        if !value_ref.owned_by(self.shared) {
            return Err(BridgeError::Closed);
        }
        self.ensure_stack(1)?;
        if slot == ffi::LUA_REFNIL {
            self.push_nil();
        } else {
            unsafe {
                ffi::lua_rawgeti(self.l, ffi::LUA_REGISTRYINDEX, slot as ffi::lua_Integer);
            }
        }
        Ok(())
    }

    /// Reference to the globals table; never needs releasing
    pub fn globals(&self) -> ValueRef {
        ValueRef {
            slot: Rc::new(RefSlot {
                state: Cell::new(SlotState::Live(ffi::LUA_RIDX_GLOBALS as c_int)),
                kind: Kind::Table,
                pinned: false,
                owner: self.shared.this.clone(),
            }),
        }
    }

    /// Number of pinned references the host currently holds
    pub fn live_refs(&self) -> usize {
        self.shared.refs.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Lua;

    #[test]
    fn test_keep_and_push() {
        let lua = Lua::new().unwrap();
        let state = lua.state();
        state.push_str("kept");
        let r = state.keep(-1).unwrap();
        state.pop(1);
        assert_eq!(state.top(), 0);
        assert_eq!(r.kind(), Kind::String);
        assert_eq!(state.live_refs(), 1);

        state.push_ref(&r).unwrap();
        assert_eq!(state.to_str(-1).as_deref(), Some("kept"));
        state.pop(1);
    }

    #[test]
    fn test_release_then_use_is_checked() {
        let lua = Lua::new().unwrap();
        let state = lua.state();
        state.new_table(0, 0);
        let r = state.keep(-1).unwrap();
        state.pop(1);

        r.release().unwrap();
        assert!(!r.is_valid());
        assert_eq!(state.live_refs(), 0);
        assert!(matches!(state.push_ref(&r), Err(BridgeError::Released)));
        assert!(matches!(r.release(), Err(BridgeError::Released)));
        assert_eq!(state.top(), 0);
    }

    #[test]
    fn test_drop_unpins() {
        let lua = Lua::new().unwrap();
        let state = lua.state();
        state.push_integer(1);
        let r = state.keep(-1).unwrap();
        let clone = r.clone();
        state.pop(1);
        drop(r);
        assert_eq!(state.live_refs(), 1);
        drop(clone);
        assert_eq!(state.live_refs(), 0);
    }

    #[test]
    fn test_nil_is_not_pinned() {
        let lua = Lua::new().unwrap();
        let state = lua.state();
        state.push_nil();
        let r = state.keep(-1).unwrap();
        state.pop(1);
        assert_eq!(state.live_refs(), 0);
        state.push_ref(&r).unwrap();
        assert_eq!(state.kind(-1), Some(Kind::Nil));
        state.pop(1);
    }

    #[test]
    fn test_globals_ref() {
        let lua = Lua::new().unwrap();
        let state = lua.state();
        let globals = state.globals();
        state.push_ref(&globals).unwrap();
        state.push_globals();
        assert!(state.raw_equal(-1, -2));
        state.pop(2);
        assert_eq!(state.live_refs(), 0);
    }

    #[test]
    fn test_teardown_invalidates_refs() {
        let r = {
            let lua = Lua::new().unwrap();
            let state = lua.state();
            state.push_str("gone soon");
            let r = state.keep(-1).unwrap();
            state.pop(1);
            r
        };
        assert!(!r.is_valid());
        assert!(matches!(r.release(), Err(BridgeError::Closed)));
    }

    #[test]
    fn test_foreign_ref_rejected() {
        let a = Lua::new().unwrap();
        let b = Lua::new().unwrap();
        let state_a = a.state();
        state_a.push_integer(3);
        let r = state_a.keep(-1).unwrap();
        state_a.pop(1);
        assert!(matches!(b.state().push_ref(&r), Err(BridgeError::Closed)));
    }
}
