//! Protected VM operations
//!
//! Anything that may run a metamethod (indexing, comparison, arithmetic,
//! `tostring`) or arbitrary guest code goes through `lua_pcall`, so VM
//! errors come back as [`BridgeError`]s instead of unwinding through host
//! frames.

use crate::convert::Resolve;
use crate::error::{BridgeError, BridgeResult};
use crate::stack::{Kind, StackIndex};
use crate::state::State;
use crate::trampoline;
use mlua_sys as ffi;
use std::ffi::CStr;
use std::os::raw::c_int;

/// Comparison operators honoring metamethods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// `==`
    Eq,
    /// `<`
    Lt,
    /// `<=`
    Le,
}

impl CompareOp {
    fn raw(self) -> c_int {
        match self {
            CompareOp::Eq => ffi::LUA_OPEQ,
            CompareOp::Lt => ffi::LUA_OPLT,
            CompareOp::Le => ffi::LUA_OPLE,
        }
    }
}

/// Arithmetic and bitwise operators honoring metamethods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Mod,
    Pow,
    Div,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    /// Unary minus; takes one operand
    Unm,
    /// Bitwise not; takes one operand
    BNot,
}

impl ArithOp {
    fn raw(self) -> c_int {
        match self {
            ArithOp::Add => ffi::LUA_OPADD,
            ArithOp::Sub => ffi::LUA_OPSUB,
            ArithOp::Mul => ffi::LUA_OPMUL,
            ArithOp::Mod => ffi::LUA_OPMOD,
            ArithOp::Pow => ffi::LUA_OPPOW,
            ArithOp::Div => ffi::LUA_OPDIV,
            ArithOp::IDiv => ffi::LUA_OPIDIV,
            ArithOp::BAnd => ffi::LUA_OPBAND,
            ArithOp::BOr => ffi::LUA_OPBOR,
            ArithOp::BXor => ffi::LUA_OPBXOR,
            ArithOp::Shl => ffi::LUA_OPSHL,
            ArithOp::Shr => ffi::LUA_OPSHR,
            ArithOp::Unm => ffi::LUA_OPUNM,
            ArithOp::BNot => ffi::LUA_OPBNOT,
        }
    }

    /// Number of operands the operator pops
    pub fn arity(self) -> i32 {
        match self {
            ArithOp::Unm | ArithOp::BNot => 1,
            _ => 2,
        }
    }
}

impl<'a> State<'a> {
    /// `lua_pcall` with the status mapped to a [`BridgeError`].
    pub(crate) fn pcall_raw(&self, nargs: i32, nresults: i32, msgh: StackIndex) -> BridgeResult<()> {
        let status = unsafe { ffi::lua_pcall(self.l, nargs, nresults, msgh) };
        if status == ffi::LUA_OK {
            Ok(())
        } else {
            Err(BridgeError::from_stack(self, status))
        }
    }

    /// Run a protected primitive over the top `nargs` values.
    fn protected(&self, f: ffi::lua_CFunction, nargs: i32, nresults: i32) -> BridgeResult<()> {
        self.ensure_stack(1)?;
        self.push_cfunction(f);
        self.insert(-(nargs + 1));
        self.pcall_raw(nargs, nresults, 0)
    }

    /// Replace the key on top with `table[key]`, running `__index` if needed
    pub fn get(&self, table: StackIndex) -> BridgeResult<Kind> {
        let table = self.absolute(table);
        self.ensure_stack(2)?;
        self.push_copy(table);
        self.insert(-2);
        self.protected(trampoline::protected_gettable, 2, 1)?;
        Ok(self.kind(-1).unwrap_or(Kind::Nil))
    }

    /// Pop a key and value (value on top) and assign `table[key] = value`,
    /// running `__newindex` if needed
    pub fn set(&self, table: StackIndex) -> BridgeResult<()> {
        let table = self.absolute(table);
        self.ensure_stack(2)?;
        self.push_copy(table);
        self.insert(-3);
        self.protected(trampoline::protected_settable, 3, 0)
    }

    /// `tostring` of the value at `index`, honoring `__tostring` and `__name`
    pub fn to_display_string(&self, index: StackIndex) -> BridgeResult<String> {
        let index = self.absolute(index);
        self.ensure_stack(2)?;
        self.push_copy(index);
        self.protected(trampoline::protected_tostring, 1, 1)?;
        let bytes = self.to_bytes(-1).unwrap_or_default();
        self.pop(1);
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Compare the values at `a` and `b`
    pub fn compare(&self, a: StackIndex, b: StackIndex, op: CompareOp) -> BridgeResult<bool> {
        let (a, b) = (self.absolute(a), self.absolute(b));
        self.ensure_stack(4)?;
        self.push_copy(a);
        self.push_copy(b);
        self.push_integer(op.raw() as i64);
        self.protected(trampoline::protected_compare, 3, 1)?;
        let result = self.to_bool(-1);
        self.pop(1);
        Ok(result)
    }

    /// Pop the operands of `op` and push the result
    pub fn arith(&self, op: ArithOp) -> BridgeResult<()> {
        let arity = op.arity();
        if self.top() < arity {
            return Err(BridgeError::host(format!(
                "{op:?} needs {arity} operands on the stack"
            )));
        }
        self.ensure_stack(2)?;
        self.push_integer(op.raw() as i64);
        self.protected(trampoline::protected_arith, arity + 1, 1)
    }

    /// Open a library through `package.loaded`, like `luaL_requiref`.
    /// The module is left on the stack.
    pub fn require_module(
        &self,
        name: &CStr,
        opener: ffi::lua_CFunction,
        global: bool,
    ) -> BridgeResult<()> {
        self.ensure_stack(4)?;
        unsafe { ffi::lua_pushstring(self.l, name.as_ptr()) };
        self.push_cfunction(opener);
        self.push_bool(global);
        self.protected(trampoline::protected_requiref, 3, 1)
    }

    /// Open a library and drop the module table
    pub fn require(
        &self,
        name: &CStr,
        opener: ffi::lua_CFunction,
        global: bool,
    ) -> BridgeResult<()> {
        self.require_module(name, opener, global)?;
        self.pop(1);
        Ok(())
    }

    /// Call the function below the top `nargs` values in protected mode.
    ///
    /// With [`LuaOptions::traceback_on_error`](crate::LuaOptions) set,
    /// string errors carry a traceback.
    pub fn call(&self, nargs: i32, nresults: i32) -> BridgeResult<()> {
        if nargs < 0 || self.top() < nargs + 1 {
            return Err(BridgeError::host(format!(
                "cannot call with {nargs} arguments and {} values on the stack",
                self.top()
            )));
        }
        if !self.shared.options.traceback_on_error {
            return self.pcall_raw(nargs, nresults, 0);
        }
        self.ensure_stack(1)?;
        let function = self.top() - nargs;
        self.push_cfunction(trampoline::traceback);
        self.insert(function);
        let result = self.pcall_raw(nargs, nresults, function);
        self.remove(function);
        result
    }

    /// Load and run a chunk, discarding its results
    pub fn exec(&self, source: impl AsRef<[u8]>) -> BridgeResult<()> {
        self.load(source, "=exec", self.shared.options.default_load_mode)?;
        self.call(0, 0)
    }

    /// Load and run a chunk, resolving its first result as `T`
    pub fn eval<T: Resolve>(&self, source: impl AsRef<[u8]>) -> BridgeResult<T> {
        self.load(source, "=eval", self.shared.options.default_load_mode)?;
        self.call(0, 1)?;
        let value = self.resolve::<T>(-1);
        let got = self.type_name(-1);
        self.pop(1);
        value.ok_or_else(|| BridgeError::Argument {
            position: 1,
            expected: T::shape().to_string(),
            got: got.to_string(),
        })
    }
}
