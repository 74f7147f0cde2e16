//! Garbage collector control

use crate::options::{GcKind, GcMode};
use crate::state::State;
use mlua_sys as ffi;

impl<'a> State<'a> {
    /// Run a full collection cycle. Finalizers of unreachable handles and
    /// closures run before this returns.
    pub fn gc_collect(&self) {
        unsafe { ffi::lua_gc(self.l, ffi::LUA_GCCOLLECT, 0) };
    }

    /// Memory in use by the VM, in bytes
    pub fn gc_count(&self) -> usize {
        let kbytes = unsafe { ffi::lua_gc(self.l, ffi::LUA_GCCOUNT, 0) } as usize;
        let remainder = unsafe { ffi::lua_gc(self.l, ffi::LUA_GCCOUNTB, 0) } as usize;
        kbytes * 1024 + remainder
    }

    /// Perform an incremental step; true if a cycle finished
    pub fn gc_step(&self, kbytes: i32) -> bool {
        unsafe { ffi::lua_gc(self.l, ffi::LUA_GCSTEP, kbytes) != 0 }
    }

    /// Stop the collector until [`gc_restart`](Self::gc_restart)
    pub fn gc_stop(&self) {
        unsafe { ffi::lua_gc(self.l, ffi::LUA_GCSTOP, 0) };
    }

    /// Restart a stopped collector
    pub fn gc_restart(&self) {
        unsafe { ffi::lua_gc(self.l, ffi::LUA_GCRESTART, 0) };
    }

    /// True unless the collector is stopped
    pub fn gc_is_running(&self) -> bool {
        unsafe { ffi::lua_gc(self.l, ffi::LUA_GCISRUNNING, 0) != 0 }
    }

    /// Switch collector mode, returning the previous one
    pub fn set_gc_mode(&self, mode: GcMode) -> Option<GcKind> {
        let previous = match mode {
            GcMode::Incremental {
                pause,
                step_multiplier,
                step_size,
            } => unsafe {
                ffi::lua_gc(self.l, ffi::LUA_GCINC, pause, step_multiplier, step_size)
            },
            GcMode::Generational {
                minor_multiplier,
                major_multiplier,
            } => unsafe {
                ffi::lua_gc(self.l, ffi::LUA_GCGEN, minor_multiplier, major_multiplier)
            },
        };
        tracing::debug!(?mode, "switched collector mode");
        match previous {
            ffi::LUA_GCINC => Some(GcKind::Incremental),
            ffi::LUA_GCGEN => Some(GcKind::Generational),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{GcKind, GcMode, Lua, LuaOptions};

    #[test]
    fn test_collect_reclaims_memory() {
        let lua = Lua::new().unwrap();
        let state = lua.state();
        state.exec("junk = {} for i = 1, 10000 do junk[i] = {i} end").unwrap();
        let before = state.gc_count();
        state.exec("junk = nil").unwrap();
        state.gc_collect();
        assert!(state.gc_count() < before);
    }

    #[test]
    fn test_stop_and_restart() {
        let lua = Lua::new().unwrap();
        let state = lua.state();
        assert!(state.gc_is_running());
        state.gc_stop();
        assert!(!state.gc_is_running());
        state.gc_restart();
        assert!(state.gc_is_running());
    }

    #[test]
    fn test_mode_switch_reports_previous() {
        let lua = Lua::with_options(LuaOptions {
            gc_mode: Some(GcMode::GENERATIONAL),
            ..Default::default()
        })
        .unwrap();
        let state = lua.state();
        assert_eq!(
            state.set_gc_mode(GcMode::INCREMENTAL),
            Some(GcKind::Generational)
        );
        assert_eq!(
            state.set_gc_mode(GcMode::INCREMENTAL),
            Some(GcKind::Incremental)
        );
    }
}
