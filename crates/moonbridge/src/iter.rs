//! Table iteration with a host callback
//!
//! The loops run inside a protected call so that `__index` errors and
//! invalid traversal keys surface as [`BridgeError`](crate::BridgeError)s.
//! The callback sees the key at stack index 3 and the value at 4, and
//! returns `false` to stop early.

use crate::closure::{Callback, ClosureWrapper, Completion};
use crate::error::BridgeResult;
use crate::stack::StackIndex;
use crate::state::State;
use crate::trampoline;
use mlua_sys as ffi;
use std::cell::RefCell;
use std::rc::Rc;

/// Stack index of the current key inside an iteration callback
pub const ITER_KEY: StackIndex = 3;
/// Stack index of the current value inside an iteration callback
pub const ITER_VALUE: StackIndex = 4;

impl<'a> State<'a> {
    /// Visit every key/value pair of the value at `table`, like `pairs`:
    /// through its `__pairs` metamethod if it has one, else in `next` order.
    pub fn for_each_pair<F>(&self, table: StackIndex, f: F) -> BridgeResult<()>
    where
        F: FnMut(&State<'_>, StackIndex, StackIndex) -> BridgeResult<bool>,
    {
        self.iterate(table, trampoline::for_each_pair, None, f)
    }

    /// Visit `t[start], t[start + 1], ...` until the first nil, honoring `__index`
    pub fn for_each_ipair<F>(&self, table: StackIndex, start: i64, f: F) -> BridgeResult<()>
    where
        F: FnMut(&State<'_>, StackIndex, StackIndex) -> BridgeResult<bool>,
    {
        self.iterate(table, trampoline::for_each_ipair, Some(start), f)
    }

    fn iterate<F>(
        &self,
        table: StackIndex,
        entry: ffi::lua_CFunction,
        start: Option<i64>,
        f: F,
    ) -> BridgeResult<()>
    where
        F: FnMut(&State<'_>, StackIndex, StackIndex) -> BridgeResult<bool>,
    {
        let table = self.absolute(table);
        self.ensure_stack(5)?;

        let f = RefCell::new(f);
        let visit = |state: &State<'_>| -> BridgeResult<Completion> {
            let keep_going = (f.borrow_mut())(state, ITER_KEY, ITER_VALUE)?;
            state.ensure_stack(1)?;
            state.push_bool(keep_going);
            Ok(Completion::Return(1))
        };
        let visit: Rc<dyn Fn(&State<'_>) -> BridgeResult<Completion> + '_> = Rc::new(visit);
        // SAFETY: the wrapper is cleared before this frame returns, so the
        // borrow of `f` is never reached after it ends.
        let visit: Callback = unsafe { std::mem::transmute(visit) };

        // The first copy anchors the wrapper until it has been cleared.
        self.push_wrapper(visit)?;
        let anchor = self.top();
        let wrapper = self.to_userdata(anchor) as *const ClosureWrapper;
        self.push_cfunction(entry);
        self.push_copy(table);
        self.push_copy(anchor);
        let nargs = match start {
            Some(start) => {
                self.push_integer(start);
                3
            }
            None => 2,
        };
        let result = self.pcall_raw(nargs, 0, 0);

        unsafe { (*wrapper).clear() };
        self.remove(anchor);
        result
    }
}

#[cfg(test)]
mod tests {
    use crate::{BridgeError, Lua, Value};

    #[test]
    fn test_pairs_visits_everything() {
        let lua = Lua::new().unwrap();
        let state = lua.state();
        state.exec("t = { a = 1, b = 2, 3 }").unwrap();
        state.get_global("t").unwrap();
        let mut seen = Vec::new();
        state
            .for_each_pair(-1, |state, key, value| {
                seen.push((
                    state.to_native(key, true).unwrap(),
                    state.to_native(value, true).unwrap(),
                ));
                Ok(true)
            })
            .unwrap();
        seen.sort_by_key(|(k, _)| format!("{k:?}"));
        assert_eq!(
            seen,
            vec![
                (Value::from("a"), Value::Integer(1)),
                (Value::from("b"), Value::Integer(2)),
                (Value::Integer(1), Value::Integer(3)),
            ]
        );
        state.pop(1);
        assert_eq!(state.top(), 0);
    }

    #[test]
    fn test_ipairs_stops_early() {
        let lua = Lua::new().unwrap();
        let state = lua.state();
        state.exec("t = { 10, 20, 30, 40 }").unwrap();
        state.get_global("t").unwrap();
        let mut sum = 0;
        state
            .for_each_ipair(1, 1, |state, _, value| {
                sum += state.to_integer(value).unwrap_or(0);
                Ok(sum < 30)
            })
            .unwrap();
        assert_eq!(sum, 30);
        state.pop(1);
    }

    #[test]
    fn test_ipairs_honors_index() {
        let lua = Lua::new().unwrap();
        let state = lua.state();
        state
            .exec("t = setmetatable({}, { __index = function(_, i) if i <= 3 then return i * i end end })")
            .unwrap();
        state.get_global("t").unwrap();
        let mut squares = Vec::new();
        state
            .for_each_ipair(1, 1, |state, _, value| {
                squares.push(state.to_integer(value).unwrap());
                Ok(true)
            })
            .unwrap();
        assert_eq!(squares, vec![1, 4, 9]);
        state.pop(1);
    }

    #[test]
    fn test_ipairs_from_offset() {
        let lua = Lua::new().unwrap();
        let state = lua.state();
        state.exec("t = { 'a', 'b', 'c', 'd' }").unwrap();
        state.get_global("t").unwrap();
        let mut seen = Vec::new();
        state
            .for_each_ipair(1, 3, |state, key, value| {
                seen.push((state.to_integer(key).unwrap(), state.to_str(value).unwrap()));
                Ok(true)
            })
            .unwrap();
        assert_eq!(seen, vec![(3, "c".to_string()), (4, "d".to_string())]);
        state.pop(1);
    }

    #[test]
    fn test_pairs_honors_pairs_metamethod() {
        let lua = Lua::new().unwrap();
        let state = lua.state();
        state
            .exec(
                r#"
                local hidden = { x = 10, y = 20 }
                t = setmetatable({}, { __pairs = function() return next, hidden, nil end })
                "#,
            )
            .unwrap();
        state.get_global("t").unwrap();
        let mut total = 0;
        state
            .for_each_pair(-1, |state, _, value| {
                total += state.to_integer(value).unwrap_or(0);
                Ok(true)
            })
            .unwrap();
        assert_eq!(total, 30);
        assert_eq!(state.top(), 1);
        state.pop(1);
    }

    #[test]
    fn test_callback_error_propagates() {
        let lua = Lua::new().unwrap();
        let state = lua.state();
        state.exec("t = { 1, 2 }").unwrap();
        state.get_global("t").unwrap();
        let err = state
            .for_each_pair(1, |_, _, _| Err(BridgeError::host("stop here")))
            .unwrap_err();
        assert_eq!(err.to_string(), "stop here");
        assert_eq!(state.top(), 1);
        state.pop(1);
    }
}
