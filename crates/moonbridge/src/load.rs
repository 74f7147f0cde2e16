//! Chunk loading, globals and preloaded modules

use crate::closure::{callback, Completion};
use crate::error::{BridgeError, BridgeResult};
use crate::options::LoadMode;
use crate::stack::Kind;
use crate::state::State;
use mlua_sys as ffi;
use std::ffi::CString;
use std::path::Path;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";
/// First byte of a precompiled chunk
const BINARY_SIGNATURE: u8 = 0x1B;

/// Drop a UTF-8 BOM and a leading `#` line. For source text the newline is
/// kept so that line numbers in error messages stay right; a precompiled
/// chunk after the comment gets no newline in front of it.
fn strip_preamble(source: &[u8]) -> &[u8] {
    let source = source.strip_prefix(UTF8_BOM).unwrap_or(source);
    if source.first() != Some(&b'#') {
        return source;
    }
    let end = source
        .iter()
        .position(|&b| b == b'\n')
        .unwrap_or(source.len());
    match source.get(end + 1) {
        Some(&BINARY_SIGNATURE) => &source[end + 1..],
        _ => &source[end..],
    }
}

fn c_string(s: &str) -> BridgeResult<CString> {
    CString::new(s).map_err(|_| BridgeError::host(format!("name contains a NUL byte: {s:?}")))
}

impl<'a> State<'a> {
    /// Compile `source` and push it as a function.
    ///
    /// `chunk_name` follows the VM's conventions: `=name` is shown verbatim,
    /// `@path` as a file name.
    pub fn load(
        &self,
        source: impl AsRef<[u8]>,
        chunk_name: &str,
        mode: LoadMode,
    ) -> BridgeResult<()> {
        let source = source.as_ref();
        let name = c_string(chunk_name)?;
        self.ensure_stack(1)?;
        let status = unsafe {
            ffi::luaL_loadbufferx(
                self.l,
                source.as_ptr() as *const _,
                source.len(),
                name.as_ptr(),
                mode.as_cstr().as_ptr(),
            )
        };
        if status == ffi::LUA_OK {
            Ok(())
        } else {
            Err(BridgeError::from_stack(self, status))
        }
    }

    /// Compile a source file and push it as a function.
    ///
    /// The chunk is named `@display_name`, or `@path` without one.
    pub fn load_file(
        &self,
        path: impl AsRef<Path>,
        display_name: Option<&str>,
        mode: LoadMode,
    ) -> BridgeResult<()> {
        let path = path.as_ref();
        let source = std::fs::read(path).map_err(|err| {
            let verb = match err.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => "open",
                _ => "read",
            };
            tracing::debug!(path = %path.display(), %err, "failed to read chunk");
            BridgeError::File {
                message: format!("cannot {verb} {}: {err}", path.display()),
            }
        })?;
        let display = display_name
            .map(str::to_string)
            .unwrap_or_else(|| path.display().to_string());
        self.load(strip_preamble(&source), &format!("@{display}"), mode)
    }

    /// Pop the top value into global `name`, bypassing metamethods
    pub fn set_global(&self, name: &str) -> BridgeResult<()> {
        self.ensure_stack(2)?;
        self.push_globals();
        self.push_str(name);
        self.rotate(-3, -1);
        self.raw_set(-3);
        self.pop(1);
        Ok(())
    }

    /// Push global `name`, bypassing metamethods, and return its type
    pub fn get_global(&self, name: &str) -> BridgeResult<Kind> {
        self.ensure_stack(2)?;
        self.push_globals();
        self.push_str(name);
        let kind = self.raw_get(-2);
        self.remove(-2);
        Ok(kind)
    }

    /// Register a module loader in `package.preload`, so that
    /// `require(name)` calls `loader` the first time.
    pub fn preload<F>(&self, name: &str, loader: F) -> BridgeResult<()>
    where
        F: Fn(&State<'_>) -> BridgeResult<Completion> + 'static,
    {
        let top = self.top();
        self.ensure_stack(3)?;
        unsafe {
            ffi::lua_getfield(self.l, ffi::LUA_REGISTRYINDEX, c"_PRELOAD".as_ptr());
        }
        if self.kind(-1) != Some(Kind::Table) {
            self.set_top(top);
            return Err(BridgeError::host(
                "package library is not open; cannot preload modules",
            ));
        }
        if let Err(err) = self.push_callback(callback(loader)) {
            self.set_top(top);
            return Err(err);
        }
        self.set_field_raw(-2, name);
        self.pop(1);
        tracing::debug!(module = name, "registered preload");
        Ok(())
    }
}
