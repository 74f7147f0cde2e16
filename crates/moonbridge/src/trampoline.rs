//! C entry points handed to the VM
//!
//! Every function here is called by the VM directly. The Rust bodies they
//! delegate to own all values with destructors and have dropped them by the
//! time they return an integer code. Only then do these entry points act on
//! the code, which may raise, call or yield and so never return to Rust.

use crate::closure;
use crate::continuation;
use mlua_sys as ffi;
use std::os::raw::c_int;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;

/// The error object is on top; raise it.
pub(crate) const CALLCLOSURE_ERROR: c_int = -2;
/// Top three values are `nargs`, `nresults`, `msgh`; call in protected mode.
pub(crate) const PCALLK: c_int = -3;
/// Top two values are `nargs`, `nresults`; call.
pub(crate) const CALLK: c_int = -4;
/// Top two values are a resumable flag and `nresults`; yield.
pub(crate) const YIELD: c_int = -5;

/// Payload of an internal userdata that releases its resources on `__gc`
pub(crate) trait Finalize {
    fn finalize(&self);
}

/// Entry point of every host closure
pub(crate) unsafe extern "C-unwind" fn call_closure_wrapper(l: *mut ffi::lua_State) -> c_int {
    let ret = closure::call_closure(l);
    handle_closure_result(l, ret)
}

/// Continuation for calls and yields issued by host closures
unsafe extern "C-unwind" fn continuation(
    l: *mut ffi::lua_State,
    status: c_int,
    ctx: ffi::lua_KContext,
) -> c_int {
    ffi::luaL_checkstack(l, 2, ptr::null());
    ffi::lua_pushinteger(l, ctx as ffi::lua_Integer);
    ffi::lua_pushinteger(l, status as ffi::lua_Integer);
    let ret = continuation::call_continuation(l);
    handle_closure_result(l, ret)
}

unsafe fn handle_closure_result(l: *mut ffi::lua_State, ret: c_int) -> c_int {
    match ret {
        CALLCLOSURE_ERROR => ffi::lua_error(l),
        CALLK => {
            let nargs = ffi::lua_tointeger(l, -2) as c_int;
            let nresults = ffi::lua_tointeger(l, -1) as c_int;
            ffi::lua_pop(l, 2);
            // the continuation record sits just below the callee
            let ctx = (ffi::lua_gettop(l) - nargs - 1) as ffi::lua_KContext;
            ffi::lua_callk(l, nargs, nresults, ctx, Some(continuation));
            continuation(l, ffi::LUA_OK, ctx)
        }
        PCALLK => {
            let nargs = ffi::lua_tointeger(l, -3) as c_int;
            let nresults = ffi::lua_tointeger(l, -2) as c_int;
            let msgh = ffi::lua_tointeger(l, -1) as c_int;
            ffi::lua_pop(l, 3);
            let ctx = (ffi::lua_gettop(l) - nargs - 1) as ffi::lua_KContext;
            let status = ffi::lua_pcallk(l, nargs, nresults, msgh, ctx, Some(continuation));
            continuation(l, status, ctx)
        }
        YIELD => {
            let resumable = ffi::lua_toboolean(l, -2) != 0;
            let nresults = ffi::lua_tointeger(l, -1) as c_int;
            ffi::lua_pop(l, 2);
            if resumable {
                let ctx = (ffi::lua_gettop(l) - nresults) as ffi::lua_KContext;
                ffi::lua_yieldk(l, nresults, ctx, Some(continuation))
            } else {
                ffi::lua_yield(l, nresults)
            }
        }
        n => n,
    }
}

/// Report a thread whose registry lacks the state block.
pub(crate) unsafe fn missing_state(l: *mut ffi::lua_State) -> c_int {
    ffi::lua_pushstring(l, c"moonbridge state block missing from registry".as_ptr());
    CALLCLOSURE_ERROR
}

/// `__gc` for internal userdata payloads
pub(crate) unsafe extern "C-unwind" fn finalizer<T: Finalize>(l: *mut ffi::lua_State) -> c_int {
    run_finalizer::<T>(l);
    0
}

unsafe fn run_finalizer<T: Finalize>(l: *mut ffi::lua_State) {
    let payload = ffi::lua_touserdata(l, 1) as *const T;
    let Some(payload) = payload.as_ref() else {
        return;
    };
    if catch_unwind(AssertUnwindSafe(|| payload.finalize())).is_err() {
        tracing::error!(
            payload = std::any::type_name::<T>(),
            "panic while finalizing userdata"
        );
    }
}

// ============================================================================
// Protected primitives
// ============================================================================

// Each of these runs under lua_pcall so that metamethod errors are caught.

/// `(table, key) -> table[key]`
pub(crate) unsafe extern "C-unwind" fn protected_gettable(l: *mut ffi::lua_State) -> c_int {
    ffi::lua_gettable(l, 1);
    1
}

/// `(table, key, value) -> ()`
pub(crate) unsafe extern "C-unwind" fn protected_settable(l: *mut ffi::lua_State) -> c_int {
    ffi::lua_settable(l, 1);
    0
}

/// `(value) -> tostring(value)`
pub(crate) unsafe extern "C-unwind" fn protected_tostring(l: *mut ffi::lua_State) -> c_int {
    ffi::luaL_tolstring(l, 1, ptr::null_mut());
    1
}

/// `(a, b, op) -> boolean`
pub(crate) unsafe extern "C-unwind" fn protected_compare(l: *mut ffi::lua_State) -> c_int {
    let op = ffi::lua_tointeger(l, 3) as c_int;
    let result = ffi::lua_compare(l, 1, 2, op);
    ffi::lua_pushboolean(l, result);
    1
}

/// `(a, [b], op) -> result`
pub(crate) unsafe extern "C-unwind" fn protected_arith(l: *mut ffi::lua_State) -> c_int {
    let op = ffi::lua_tointeger(l, -1) as c_int;
    ffi::lua_pop(l, 1);
    ffi::lua_arith(l, op);
    1
}

/// `(name, opener, global) -> module`
pub(crate) unsafe extern "C-unwind" fn protected_requiref(l: *mut ffi::lua_State) -> c_int {
    let name = ffi::lua_tostring(l, 1);
    let global = ffi::lua_toboolean(l, 3);
    match ffi::lua_tocfunction(l, 2) {
        Some(opener) if !name.is_null() => {
            ffi::luaL_requiref(l, name, opener, global);
            1
        }
        _ => 0,
    }
}

/// Message handler appending a traceback to string errors
pub(crate) unsafe extern "C-unwind" fn traceback(l: *mut ffi::lua_State) -> c_int {
    if ffi::lua_type(l, 1) == ffi::LUA_TSTRING {
        let message = ffi::lua_tostring(l, 1);
        ffi::luaL_traceback(l, l, message, 1);
    } else {
        ffi::lua_settop(l, 1);
    }
    1
}

// ============================================================================
// Iteration
// ============================================================================

// Both loops run under lua_pcall with the table at 1 and the callback
// wrapper at 2. The key and value are handed to the callback at 3 and 4.

/// Visit every pair of the table, through `__pairs` when it has one
pub(crate) unsafe extern "C-unwind" fn for_each_pair(l: *mut ffi::lua_State) -> c_int {
    let status = if ffi::luaL_getmetafield(l, 1, c"__pairs".as_ptr()) != ffi::LUA_TNIL {
        ffi::lua_pushvalue(l, 1);
        ffi::lua_call(l, 1, 3);
        custom_pairs_loop(l)
    } else {
        pairs_loop(l)
    };
    if status == CALLCLOSURE_ERROR {
        ffi::lua_error(l);
    }
    0
}

unsafe fn pairs_loop(l: *mut ffi::lua_State) -> c_int {
    ffi::lua_settop(l, 2);
    ffi::lua_pushnil(l);
    while ffi::lua_next(l, 1) != 0 {
        match closure::call_unmanaged(l, 2) {
            1 => ffi::lua_settop(l, 3),
            0 => return 0,
            raised => return raised,
        }
    }
    0
}

/// Drive the iterator triple `__pairs` left at 3..5. The triple is parked
/// in a table at 1 so that the key and value can keep their slots.
unsafe fn custom_pairs_loop(l: *mut ffi::lua_State) -> c_int {
    ffi::lua_createtable(l, 3, 0);
    ffi::lua_rotate(l, 3, 1);
    ffi::lua_rawseti(l, 3, 3);
    ffi::lua_rawseti(l, 3, 2);
    ffi::lua_rawseti(l, 3, 1);
    ffi::lua_replace(l, 1);
    loop {
        ffi::lua_settop(l, 2);
        ffi::lua_rawgeti(l, 1, 1);
        ffi::lua_rawgeti(l, 1, 2);
        ffi::lua_rawgeti(l, 1, 3);
        ffi::lua_call(l, 2, 2);
        if ffi::lua_type(l, 3) == ffi::LUA_TNIL {
            return 0;
        }
        ffi::lua_pushvalue(l, 3);
        ffi::lua_rawseti(l, 1, 3);
        match closure::call_unmanaged(l, 2) {
            1 => {}
            0 => return 0,
            raised => return raised,
        }
    }
}

/// Visit `t[i], t[i+1], ...` up to the first nil, honoring `__index`.
/// The starting index is argument 3.
pub(crate) unsafe extern "C-unwind" fn for_each_ipair(l: *mut ffi::lua_State) -> c_int {
    if ipairs_loop(l) == CALLCLOSURE_ERROR {
        ffi::lua_error(l);
    }
    0
}

unsafe fn ipairs_loop(l: *mut ffi::lua_State) -> c_int {
    let mut i = ffi::lua_tointegerx(l, 3, ptr::null_mut());
    loop {
        ffi::lua_settop(l, 2);
        ffi::lua_pushinteger(l, i);
        if ffi::lua_geti(l, 1, i) == ffi::LUA_TNIL {
            return 0;
        }
        match closure::call_unmanaged(l, 2) {
            1 => i += 1,
            0 => return 0,
            raised => return raised,
        }
    }
}
