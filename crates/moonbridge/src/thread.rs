//! Coroutines driven from the host
//!
//! A thread created here is pinned as a [`ValueRef`]. [`State::resume`]
//! moves arguments across with `lua_xmove` and reports whether the
//! coroutine yielded or finished. A [`State`] view of the thread is
//! available through [`State::thread_state`].

use crate::error::{BridgeError, BridgeResult};
use crate::refs::ValueRef;
use crate::stack::Kind;
use crate::state::State;
use mlua_sys as ffi;
use std::os::raw::c_int;

/// Outcome of a resume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resumed {
    /// The coroutine yielded this many values
    Yielded(i32),
    /// The coroutine finished, returning this many values
    Returned(i32),
}

/// Lifecycle of a coroutine, as `coroutine.status` reports it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Not started yet, or suspended in a yield
    Suspended,
    /// Finished normally; cannot be resumed
    Dead,
    /// Stopped by an error; cannot be resumed
    Failed,
}

impl<'a> State<'a> {
    /// Create a new coroutine and pin it
    pub fn new_thread(&self) -> BridgeResult<ValueRef> {
        self.ensure_stack(1)?;
        unsafe { ffi::lua_newthread(self.l) };
        let thread = self.keep(-1);
        self.pop(1);
        thread
    }

    /// View of the coroutine held by `thread`
    pub fn thread_state(&self, thread: &ValueRef) -> BridgeResult<State<'a>> {
        if thread.kind() != Kind::Thread {
            return Err(BridgeError::host(format!(
                "expected a thread, got {}",
                thread.kind()
            )));
        }
        self.push_ref(thread)?;
        let l = unsafe { ffi::lua_tothread(self.l, -1) };
        self.pop(1);
        Ok(State {
            l,
            shared: self.shared,
        })
    }

    /// Current status of the coroutine held by `thread`
    pub fn thread_status(&self, thread: &ValueRef) -> BridgeResult<ThreadStatus> {
        let co = self.thread_state(thread)?;
        let status = unsafe { ffi::lua_status(co.l) };
        Ok(match status {
            ffi::LUA_YIELD => ThreadStatus::Suspended,
            ffi::LUA_OK if co.top() > 0 => ThreadStatus::Suspended,
            ffi::LUA_OK => ThreadStatus::Dead,
            _ => ThreadStatus::Failed,
        })
    }

    /// Resume `thread` with the top `nargs` values of this stack.
    ///
    /// On a fresh thread the function to run must sit just below the
    /// arguments; it is moved over with them. Yielded or returned values
    /// are moved back onto this stack. On error nothing is left behind.
    pub fn resume(&self, thread: &ValueRef, nargs: i32) -> BridgeResult<Resumed> {
        let co = self.thread_state(thread)?;
        let fresh = unsafe { ffi::lua_status(co.l) } == ffi::LUA_OK && co.top() == 0;
        let moved = if fresh { nargs + 1 } else { nargs };
        if nargs < 0 || self.top() < moved {
            return Err(BridgeError::host(format!(
                "cannot resume with {nargs} arguments and {} values on the stack",
                self.top()
            )));
        }
        co.ensure_stack(moved)?;
        unsafe { ffi::lua_xmove(self.l, co.l, moved) };

        let mut nresults: c_int = 0;
        let status = unsafe { ffi::lua_resume(co.l, self.l, nargs, &mut nresults) };
        match status {
            ffi::LUA_OK | ffi::LUA_YIELD => {
                if let Err(err) = self.ensure_stack(nresults) {
                    co.pop(nresults);
                    return Err(err);
                }
                unsafe { ffi::lua_xmove(co.l, self.l, nresults) };
                tracing::trace!(nresults, finished = status == ffi::LUA_OK, "resumed thread");
                Ok(if status == ffi::LUA_OK {
                    Resumed::Returned(nresults)
                } else {
                    Resumed::Yielded(nresults)
                })
            }
            failed => Err(BridgeError::from_stack(&co, failed)),
        }
    }

    /// Close `thread`, running pending to-be-closed variables.
    ///
    /// Returns the error that stopped the thread, if any.
    pub fn close_thread(&self, thread: &ValueRef) -> BridgeResult<()> {
        let co = self.thread_state(thread)?;
        let status = unsafe { ffi::lua_closethread(co.l, self.l) };
        if status == ffi::LUA_OK {
            Ok(())
        } else {
            Err(BridgeError::from_stack(&co, status))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Lua;

    #[test]
    fn test_resume_until_done() {
        let lua = Lua::new().unwrap();
        let state = lua.state();
        let thread = state.new_thread().unwrap();
        state
            .load(
                "local a = ...; local b = coroutine.yield(a + 1); return a + b",
                "=co",
                crate::LoadMode::Text,
            )
            .unwrap();
        state.push_integer(10);
        assert_eq!(state.resume(&thread, 1).unwrap(), Resumed::Yielded(1));
        assert_eq!(state.to_integer(-1), Some(11));
        state.pop(1);
        assert_eq!(state.thread_status(&thread).unwrap(), ThreadStatus::Suspended);

        state.push_integer(5);
        assert_eq!(state.resume(&thread, 1).unwrap(), Resumed::Returned(1));
        assert_eq!(state.to_integer(-1), Some(15));
        state.pop(1);
        assert_eq!(state.thread_status(&thread).unwrap(), ThreadStatus::Dead);
        assert_eq!(state.top(), 0);
    }

    #[test]
    fn test_resume_error() {
        let lua = Lua::new().unwrap();
        let state = lua.state();
        let thread = state.new_thread().unwrap();
        state.load("error('inside', 0)", "=co", crate::LoadMode::Text).unwrap();
        let err = state.resume(&thread, 0).unwrap_err();
        assert_eq!(err.to_string(), "inside");
        assert_eq!(state.thread_status(&thread).unwrap(), ThreadStatus::Failed);
        assert!(state.close_thread(&thread).is_err());
        assert_eq!(state.top(), 0);
    }

    #[test]
    fn test_non_thread_rejected() {
        let lua = Lua::new().unwrap();
        let state = lua.state();
        state.new_table(0, 0);
        let table = state.keep(-1).unwrap();
        state.pop(1);
        assert!(state.resume(&table, 0).is_err());
    }
}
