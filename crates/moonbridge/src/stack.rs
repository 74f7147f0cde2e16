//! Stack accessor
//!
//! Thin operations on the VM stack: index arithmetic, type queries, raw
//! table access and push/pop primitives. No conversions live here.

use crate::error::{BridgeError, BridgeResult};
use crate::state::State;
use mlua_sys as ffi;
use std::ffi::c_void;
use std::fmt;
use std::os::raw::c_int;
use std::ptr;

/// Position on a VM thread's stack
///
/// Positive values are absolute (1 is the bottom). Negative values are
/// relative to the top and move as values are pushed or popped.
pub type StackIndex = i32;

/// Dynamic type of a VM value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// `nil`
    Nil,
    /// `true` / `false`
    Boolean,
    /// Raw pointer value
    LightUserdata,
    /// Integer or float
    Number,
    /// Byte string
    String,
    /// Table
    Table,
    /// Lua or C function
    Function,
    /// Full userdata
    Userdata,
    /// Coroutine
    Thread,
}

impl Kind {
    /// Map a `LUA_T*` constant; `LUA_TNONE` maps to `None`.
    pub(crate) fn from_raw(t: c_int) -> Option<Kind> {
        match t {
            ffi::LUA_TNIL => Some(Kind::Nil),
            ffi::LUA_TBOOLEAN => Some(Kind::Boolean),
            ffi::LUA_TLIGHTUSERDATA => Some(Kind::LightUserdata),
            ffi::LUA_TNUMBER => Some(Kind::Number),
            ffi::LUA_TSTRING => Some(Kind::String),
            ffi::LUA_TTABLE => Some(Kind::Table),
            ffi::LUA_TFUNCTION => Some(Kind::Function),
            ffi::LUA_TUSERDATA => Some(Kind::Userdata),
            ffi::LUA_TTHREAD => Some(Kind::Thread),
            _ => None,
        }
    }

    /// Type of a value a VM call has just pushed
    pub(crate) fn pushed(t: c_int) -> Kind {
        Kind::from_raw(t).unwrap_or(Kind::Nil)
    }

    /// Type name as the VM reports it
    pub fn name(self) -> &'static str {
        match self {
            Kind::Nil => "nil",
            Kind::Boolean => "boolean",
            Kind::LightUserdata | Kind::Userdata => "userdata",
            Kind::Number => "number",
            Kind::String => "string",
            Kind::Table => "table",
            Kind::Function => "function",
            Kind::Thread => "thread",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl<'a> State<'a> {
    // ========================================================================
    // Index arithmetic
    // ========================================================================

    /// Number of values on the stack
    pub fn top(&self) -> StackIndex {
        unsafe { ffi::lua_gettop(self.l) }
    }

    /// Set the stack top, discarding or nil-filling as needed
    pub fn set_top(&self, index: StackIndex) {
        unsafe { ffi::lua_settop(self.l, index) }
    }

    /// Convert a relative index to an absolute one. Pseudo-indices and
    /// absolute indices are returned unchanged.
    pub fn absolute(&self, index: StackIndex) -> StackIndex {
        if index > 0 || index <= ffi::LUA_REGISTRYINDEX {
            index
        } else {
            unsafe { ffi::lua_absindex(self.l, index) }
        }
    }

    /// Make room for `extra` more values
    pub fn ensure_stack(&self, extra: i32) -> BridgeResult<()> {
        if unsafe { ffi::lua_checkstack(self.l, extra) } != 0 {
            Ok(())
        } else {
            Err(BridgeError::StackOverflow(extra))
        }
    }

    // ========================================================================
    // Type queries
    // ========================================================================

    /// Type of the value at `index`, or `None` for an unused index
    pub fn kind(&self, index: StackIndex) -> Option<Kind> {
        Kind::from_raw(unsafe { ffi::lua_type(self.l, index) })
    }

    /// VM type name of the value at `index`; `"no value"` for an unused index
    pub fn type_name(&self, index: StackIndex) -> &'static str {
        self.kind(index).map_or("no value", Kind::name)
    }

    /// True for a number with an integer representation
    pub fn is_integer(&self, index: StackIndex) -> bool {
        unsafe { ffi::lua_isinteger(self.l, index) != 0 }
    }

    // ========================================================================
    // Push / pop
    // ========================================================================

    /// Pop `n` values.
    ///
    /// # Panics
    ///
    /// Panics if fewer than `n` values are on the stack.
    pub fn pop(&self, n: i32) {
        let top = self.top();
        assert!(
            n >= 0 && n <= top,
            "pop({n}) with only {top} values on the stack"
        );
        unsafe { ffi::lua_settop(self.l, -n - 1) }
    }

    /// Push `nil`
    pub fn push_nil(&self) {
        unsafe { ffi::lua_pushnil(self.l) }
    }

    /// Push a boolean
    pub fn push_bool(&self, value: bool) {
        unsafe { ffi::lua_pushboolean(self.l, value as c_int) }
    }

    /// Push an integer
    pub fn push_integer(&self, value: i64) {
        unsafe { ffi::lua_pushinteger(self.l, value as ffi::lua_Integer) }
    }

    /// Push a float
    pub fn push_number(&self, value: f64) {
        unsafe { ffi::lua_pushnumber(self.l, value as ffi::lua_Number) }
    }

    /// Push a byte string
    pub fn push_bytes(&self, bytes: &[u8]) {
        unsafe {
            ffi::lua_pushlstring(self.l, bytes.as_ptr() as *const _, bytes.len());
        }
    }

    /// Push a string
    pub fn push_str(&self, s: &str) {
        self.push_bytes(s.as_bytes())
    }

    /// Push a raw pointer as light userdata
    pub fn push_light(&self, ptr: *mut c_void) {
        unsafe { ffi::lua_pushlightuserdata(self.l, ptr) }
    }

    /// Push a copy of the value at `index`
    pub fn push_copy(&self, index: StackIndex) {
        unsafe { ffi::lua_pushvalue(self.l, index) }
    }

    /// Push a plain C function
    pub fn push_cfunction(&self, f: ffi::lua_CFunction) {
        unsafe { ffi::lua_pushcfunction(self.l, f) }
    }

    /// Push the globals table
    pub fn push_globals(&self) {
        unsafe {
            ffi::lua_rawgeti(
                self.l,
                ffi::LUA_REGISTRYINDEX,
                ffi::LUA_RIDX_GLOBALS as ffi::lua_Integer,
            );
        }
    }

    /// Move the top value to `index`, shifting values above it up
    pub fn insert(&self, index: StackIndex) {
        unsafe { ffi::lua_rotate(self.l, index, 1) }
    }

    /// Remove the value at `index`, shifting values above it down
    pub fn remove(&self, index: StackIndex) {
        unsafe {
            ffi::lua_rotate(self.l, index, -1);
            ffi::lua_settop(self.l, -2);
        }
    }

    /// Pop the top value into `index`
    pub fn replace(&self, index: StackIndex) {
        unsafe {
            ffi::lua_copy(self.l, -1, index);
            ffi::lua_settop(self.l, -2);
        }
    }

    /// Rotate the values between `index` and the top by `n` positions
    pub fn rotate(&self, index: StackIndex, n: i32) {
        unsafe { ffi::lua_rotate(self.l, index, n) }
    }

    // ========================================================================
    // Raw table access
    // ========================================================================

    /// Push a new table with preallocated space
    pub fn new_table(&self, narr: i32, nrec: i32) {
        unsafe { ffi::lua_createtable(self.l, narr, nrec) }
    }

    /// Replace the key at the top with `table[key]`, bypassing metamethods
    pub fn raw_get(&self, table: StackIndex) -> Kind {
        Kind::pushed(unsafe { ffi::lua_rawget(self.l, table) })
    }

    /// Pop a key and value and store `table[key] = value`, bypassing metamethods.
    /// The key must not be nil or NaN.
    pub fn raw_set(&self, table: StackIndex) {
        unsafe { ffi::lua_rawset(self.l, table) }
    }

    /// Push `table[n]`, bypassing metamethods
    pub fn raw_get_index(&self, table: StackIndex, n: i64) -> Kind {
        Kind::pushed(unsafe { ffi::lua_rawgeti(self.l, table, n as ffi::lua_Integer) })
    }

    /// Pop a value into `table[n]`, bypassing metamethods
    pub fn raw_set_index(&self, table: StackIndex, n: i64) {
        unsafe { ffi::lua_rawseti(self.l, table, n as ffi::lua_Integer) }
    }

    /// Pop a value into `table[name]` with a string key, bypassing metamethods
    pub fn set_field_raw(&self, table: StackIndex, name: &str) {
        let table = self.absolute(table);
        self.push_str(name);
        self.insert(-2);
        self.raw_set(table);
    }

    /// Raw length: string byte length, table border or userdata size
    pub fn raw_len(&self, index: StackIndex) -> usize {
        unsafe { ffi::lua_rawlen(self.l, index) as usize }
    }

    /// Advance a `lua_next` traversal. The previous key must be on top;
    /// on `true` it is replaced by the next key and its value.
    pub fn next(&self, table: StackIndex) -> bool {
        unsafe { ffi::lua_next(self.l, table) != 0 }
    }

    /// Identity comparison without metamethods
    pub fn raw_equal(&self, a: StackIndex, b: StackIndex) -> bool {
        unsafe { ffi::lua_rawequal(self.l, a, b) != 0 }
    }

    // ========================================================================
    // Raw reads
    // ========================================================================

    /// Truthiness of the value at `index`
    pub fn to_bool(&self, index: StackIndex) -> bool {
        unsafe { ffi::lua_toboolean(self.l, index) != 0 }
    }

    /// Integer at `index`; floats with an exact integer value also convert.
    /// Strings are never coerced.
    pub fn to_integer(&self, index: StackIndex) -> Option<i64> {
        if self.kind(index) != Some(Kind::Number) {
            return None;
        }
        let mut isnum: c_int = 0;
        let value = unsafe { ffi::lua_tointegerx(self.l, index, &mut isnum) };
        (isnum != 0).then_some(value as i64)
    }

    /// Number at `index`. Strings are never coerced.
    pub fn to_number(&self, index: StackIndex) -> Option<f64> {
        if self.kind(index) != Some(Kind::Number) {
            return None;
        }
        Some(unsafe { ffi::lua_tonumberx(self.l, index, ptr::null_mut()) } as f64)
    }

    /// Copy of the bytes of the string at `index`
    pub fn to_bytes(&self, index: StackIndex) -> Option<Vec<u8>> {
        if self.kind(index) != Some(Kind::String) {
            return None;
        }
        unsafe {
            let mut len = 0usize;
            let data = ffi::lua_tolstring(self.l, index, &mut len);
            if data.is_null() {
                return None;
            }
            Some(std::slice::from_raw_parts(data as *const u8, len).to_vec())
        }
    }

    /// The string at `index`, if it is valid UTF-8
    pub fn to_str(&self, index: StackIndex) -> Option<String> {
        self.to_bytes(index)
            .and_then(|bytes| String::from_utf8(bytes).ok())
    }

    /// Pointer payload of light or full userdata
    pub fn to_userdata(&self, index: StackIndex) -> *mut c_void {
        unsafe { ffi::lua_touserdata(self.l, index) }
    }

    /// Identity pointer of a table, function, thread or userdata
    pub fn to_pointer(&self, index: StackIndex) -> *const c_void {
        unsafe { ffi::lua_topointer(self.l, index) }
    }

    /// Render an error object without running metamethods.
    pub(crate) fn error_message(&self, index: StackIndex) -> String {
        match self.kind(index) {
            Some(Kind::String) => {
                let bytes = self.to_bytes(index).unwrap_or_default();
                String::from_utf8_lossy(&bytes).into_owned()
            }
            Some(Kind::Number) => match self.to_integer(index) {
                Some(i) if self.is_integer(index) => i.to_string(),
                _ => self.to_number(index).unwrap_or_default().to_string(),
            },
            Some(Kind::Nil) | None => "nil".to_string(),
            Some(_) => match self.to_display_string(index) {
                Ok(s) => s,
                Err(_) => format!("(error object is a {} value)", self.type_name(index)),
            },
        }
    }
}
