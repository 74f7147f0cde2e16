//! VM construction options

use mlua_sys as ffi;
use std::ffi::CStr;

/// Standard libraries that can be opened in a new VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Library {
    /// Basic functions (`print`, `pcall`, `setmetatable`, ...)
    Base,
    /// `package` and `require`
    Package,
    /// `coroutine`
    Coroutine,
    /// `table`
    Table,
    /// `io`
    Io,
    /// `os`
    Os,
    /// `string`
    String,
    /// `math`
    Math,
    /// `utf8`
    Utf8,
    /// `debug`
    Debug,
}

impl Library {
    /// Every standard library
    pub const ALL: [Library; 10] = [
        Library::Base,
        Library::Package,
        Library::Coroutine,
        Library::Table,
        Library::Io,
        Library::Os,
        Library::String,
        Library::Math,
        Library::Utf8,
        Library::Debug,
    ];

    /// Libraries without filesystem, process or debug access
    pub const SAFE: [Library; 6] = [
        Library::Base,
        Library::Coroutine,
        Library::Table,
        Library::String,
        Library::Math,
        Library::Utf8,
    ];

    /// Module name the library is registered under
    pub fn name(self) -> &'static CStr {
        match self {
            Library::Base => c"_G",
            Library::Package => c"package",
            Library::Coroutine => c"coroutine",
            Library::Table => c"table",
            Library::Io => c"io",
            Library::Os => c"os",
            Library::String => c"string",
            Library::Math => c"math",
            Library::Utf8 => c"utf8",
            Library::Debug => c"debug",
        }
    }

    pub(crate) fn opener(self) -> ffi::lua_CFunction {
        match self {
            Library::Base => ffi::luaopen_base,
            Library::Package => ffi::luaopen_package,
            Library::Coroutine => ffi::luaopen_coroutine,
            Library::Table => ffi::luaopen_table,
            Library::Io => ffi::luaopen_io,
            Library::Os => ffi::luaopen_os,
            Library::String => ffi::luaopen_string,
            Library::Math => ffi::luaopen_math,
            Library::Utf8 => ffi::luaopen_utf8,
            Library::Debug => ffi::luaopen_debug,
        }
    }
}

/// Which chunk formats the loader accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadMode {
    /// Source text only
    #[default]
    Text,
    /// Precompiled binary chunks only
    Binary,
    /// Either
    Any,
}

impl LoadMode {
    pub(crate) fn as_cstr(self) -> &'static CStr {
        match self {
            LoadMode::Text => c"t",
            LoadMode::Binary => c"b",
            LoadMode::Any => c"bt",
        }
    }
}

/// Garbage collector mode and tuning parameters
///
/// A parameter of 0 keeps the VM's current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcMode {
    /// Incremental mark-and-sweep
    Incremental {
        /// Collector pause, in percent
        pause: i32,
        /// Step multiplier, in percent
        step_multiplier: i32,
        /// Log2 of the step size in bytes
        step_size: i32,
    },
    /// Generational collection
    Generational {
        /// Minor collection multiplier, in percent
        minor_multiplier: i32,
        /// Major collection multiplier, in percent
        major_multiplier: i32,
    },
}

impl GcMode {
    /// Incremental mode with the VM's current parameters
    pub const INCREMENTAL: GcMode = GcMode::Incremental {
        pause: 0,
        step_multiplier: 0,
        step_size: 0,
    };

    /// Generational mode with the VM's current parameters
    pub const GENERATIONAL: GcMode = GcMode::Generational {
        minor_multiplier: 0,
        major_multiplier: 0,
    };
}

/// Collector mode reported back by the VM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcKind {
    /// Incremental mode was active
    Incremental,
    /// Generational mode was active
    Generational,
}

/// Options used when creating a [`Lua`](crate::Lua) instance
#[derive(Debug, Clone)]
pub struct LuaOptions {
    /// Standard libraries to open
    pub libraries: Vec<Library>,
    /// Collector mode to switch to after opening libraries
    pub gc_mode: Option<GcMode>,
    /// Load mode used by `exec` and `eval`
    pub default_load_mode: LoadMode,
    /// Install a traceback message handler in `State::call`
    pub traceback_on_error: bool,
}

impl Default for LuaOptions {
    fn default() -> Self {
        Self {
            libraries: Library::ALL.to_vec(),
            gc_mode: None,
            default_load_mode: LoadMode::Text,
            traceback_on_error: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = LuaOptions::default();
        assert_eq!(options.libraries.len(), Library::ALL.len());
        assert_eq!(options.default_load_mode, LoadMode::Text);
        assert!(options.gc_mode.is_none());
        assert!(!options.traceback_on_error);
    }

    #[test]
    fn test_library_names() {
        assert_eq!(Library::Base.name(), c"_G");
        assert_eq!(Library::Utf8.name().to_str().unwrap(), "utf8");
        assert!(!Library::SAFE.contains(&Library::Io));
    }

    #[test]
    fn test_load_mode_strings() {
        assert_eq!(LoadMode::Text.as_cstr(), c"t");
        assert_eq!(LoadMode::Binary.as_cstr(), c"b");
        assert_eq!(LoadMode::Any.as_cstr(), c"bt");
    }
}
