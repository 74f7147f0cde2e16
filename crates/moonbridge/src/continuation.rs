//! Continuations for calls and yields issued by host closures
//!
//! When a closure finishes with a call, protected call or yield, the code
//! that should run afterwards is boxed into a [`ContinuationRecord`]
//! userdata and left on the stack below the callee. The VM hands the
//! record's position back as the continuation context, whether the call
//! returns normally or the coroutine is resumed later.

use crate::closure::Completion;
use crate::error::{panic_message, BridgeError, BridgeResult};
use crate::state::{State, CONTINUATION_KEY};
use crate::trampoline::{self, Finalize};
use mlua_sys as ffi;
use std::cell::RefCell;
use std::os::raw::c_int;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;

/// Code to run after a call or yield issued by a host closure
pub type Continuation = Box<dyn FnOnce(&State<'_>, ContinuationStatus) -> BridgeResult<Completion>>;

/// How the operation a continuation waited on ended
#[derive(Debug, Default)]
pub struct ContinuationStatus {
    /// True if the coroutine yielded in between and was resumed
    pub yielded: bool,
    /// Error caught by a protected call
    pub error: Option<BridgeError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ContinuationKind {
    Call,
    /// `handler` is true when a copy of the message handler sits just below the record
    ProtectedCall { handler: bool },
    Yield,
}

/// Userdata payload holding a pending continuation
pub(crate) struct ContinuationRecord {
    kind: ContinuationKind,
    slot: RefCell<Option<Continuation>>,
}

impl ContinuationRecord {
    fn take(&self) -> Option<Continuation> {
        self.slot.borrow_mut().take()
    }
}

impl Finalize for ContinuationRecord {
    fn finalize(&self) {
        let continuation = self.take();
        drop(continuation);
    }
}

impl<'a> State<'a> {
    pub(crate) fn push_continuation(
        &self,
        kind: ContinuationKind,
        continuation: Continuation,
    ) -> BridgeResult<()> {
        self.ensure_stack(2)?;
        unsafe {
            let ud = ffi::lua_newuserdatauv(self.l, std::mem::size_of::<ContinuationRecord>(), 0);
            ptr::write(
                ud as *mut ContinuationRecord,
                ContinuationRecord {
                    kind,
                    slot: RefCell::new(Some(continuation)),
                },
            );
        }
        self.push_internal_metatable(&CONTINUATION_KEY);
        unsafe { ffi::lua_setmetatable(self.l, -2) };
        Ok(())
    }

    /// Whether the value at `index` carries the continuation metatable
    fn is_continuation_record(&self, index: i32) -> bool {
        if unsafe { ffi::lua_getmetatable(self.l, index) } == 0 {
            return false;
        }
        self.push_internal_metatable(&CONTINUATION_KEY);
        let same = self.raw_equal(-1, -2);
        self.pop(2);
        same
    }
}

/// Body of the continuation trampoline. The record index and the VM status
/// are the top two values.
///
/// # Safety
///
/// `l` must be re-entering a continuation armed by a host closure.
pub(crate) unsafe fn call_continuation(l: *mut ffi::lua_State) -> c_int {
    let Some(state) = State::from_raw(l) else {
        return trampoline::missing_state(l);
    };
    let index = state.to_integer(-2).unwrap_or(0) as i32;
    let status = state.to_integer(-1).unwrap_or(0) as c_int;
    state.pop(2);

    if index < 1 || index > state.top() || !state.is_continuation_record(index) {
        return state.raise(BridgeError::host("continuation record missing from the stack"));
    }
    let record = state.to_userdata(index) as *const ContinuationRecord;
    let kind = (*record).kind;
    let continuation = (*record).take();
    state.remove(index);
    if kind == (ContinuationKind::ProtectedCall { handler: true }) {
        state.remove(index - 1);
    }

    let Some(continuation) = continuation else {
        return state.raise(BridgeError::host("continuation already consumed"));
    };

    let status = match status {
        ffi::LUA_OK => ContinuationStatus::default(),
        ffi::LUA_YIELD => ContinuationStatus {
            yielded: true,
            error: None,
        },
        failed => ContinuationStatus {
            yielded: false,
            error: Some(BridgeError::from_stack(&state, failed)),
        },
    };
    tracing::trace!(
        ?kind,
        yielded = status.yielded,
        failed = status.error.is_some(),
        "resuming continuation"
    );

    let result = catch_unwind(AssertUnwindSafe(|| continuation(&state, status)))
        .unwrap_or_else(|panic| Err(BridgeError::Panic(panic_message(panic.as_ref()))));
    state.complete(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Lua, Value};

    fn eval(state: &State<'_>, source: &str) -> BridgeResult<Value> {
        state.load(source, "=test", crate::LoadMode::Text)?;
        state.call(0, 1)?;
        let value = state.to_native(-1, true).unwrap_or(Value::Nil);
        state.pop(1);
        Ok(value)
    }

    #[test]
    fn test_call_k_sees_results() {
        let lua = Lua::new().unwrap();
        let state = lua.state();
        state
            .push_closure(|state| {
                // twice(f, x) = f(f(x))
                state.push_copy(1);
                state.push_copy(2);
                state.call_k(1, 1, |state, status| {
                    assert!(!status.yielded);
                    state.push_copy(1);
                    state.insert(-2);
                    state.call_k(1, 1, |_, _| Ok(Completion::Return(1)))
                })
            })
            .unwrap();
        state.set_global("twice").unwrap();
        assert_eq!(
            eval(&state, "return twice(function(n) return n * 3 end, 2)").unwrap(),
            Value::Integer(18)
        );
        assert_eq!(state.top(), 0);
    }

    #[test]
    fn test_pcall_k_catches_error() {
        let lua = Lua::new().unwrap();
        let state = lua.state();
        state
            .push_closure(|state| {
                state.push_copy(1);
                state.pcall_k(0, 0, None, |state, status| {
                    let message = status.error.map(|e| e.to_string()).unwrap_or_default();
                    state.push_str(&message);
                    Ok(Completion::Return(1))
                })
            })
            .unwrap();
        state.set_global("try").unwrap();
        assert_eq!(
            eval(&state, "return try(function() error('bad', 0) end)").unwrap(),
            Value::from("bad")
        );
    }

    #[test]
    fn test_pcall_k_with_handler() {
        let lua = Lua::new().unwrap();
        let state = lua.state();
        state
            .push_closure(|state| {
                // try_with(f, handler)
                state.push_copy(1);
                state.pcall_k(0, 1, Some(2), |state, status| {
                    let message = status.error.map(|e| e.to_string()).unwrap_or_default();
                    state.push_str(&message);
                    Ok(Completion::Return(1))
                })
            })
            .unwrap();
        state.set_global("try_with").unwrap();
        assert_eq!(
            eval(
                &state,
                "return try_with(function() error('raw', 0) end, function(m) return 'handled ' .. m end)"
            )
            .unwrap(),
            Value::from("handled raw")
        );
    }

    #[test]
    fn test_continuation_runs_once() {
        let continuation: Continuation =
            Box::new(|_: &State<'_>, _: ContinuationStatus| Ok(Completion::Return(0)));
        let record = ContinuationRecord {
            kind: ContinuationKind::Call,
            slot: RefCell::new(Some(continuation)),
        };
        assert!(record.take().is_some());
        assert!(record.take().is_none());
        record.finalize();
    }
}
