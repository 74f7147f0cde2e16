//! Error types for the bridge
//!
//! Every failure that crosses the VM boundary is expressed as a [`BridgeError`].
//! Structural mismatches during value resolution are *not* errors; those come
//! back as `None` from [`State::resolve`](crate::State::resolve).

use crate::refs::ValueRef;
use crate::state::State;
use mlua_sys as ffi;
use std::any::Any;
use std::os::raw::c_int;
use thiserror::Error;

/// Status code `luaL_loadfilex` uses for file errors.
pub(crate) const LUA_ERRFILE: c_int = ffi::LUA_ERRERR + 1;

/// Errors that can occur while bridging values and calls
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    /// Runtime error raised by the VM (or by guest code calling `error`)
    ///
    /// `payload` keeps the original error object alive when it was not a
    /// plain string, so it can be rethrown unchanged.
    #[error("{message}")]
    Runtime {
        /// Best-effort string rendering of the error object
        message: String,
        /// The original error object, if it was not a string
        payload: Option<ValueRef>,
    },

    /// A required closure argument could not be resolved to the expected type
    #[error("argument {position}: expected type {expected}, got {got}")]
    Argument {
        /// 1-based argument position
        position: i32,
        /// Display name of the expected host type
        expected: String,
        /// VM type name of the value actually passed
        got: String,
    },

    /// Malformed source handed to the loader
    #[error("{message}")]
    Syntax {
        /// Message produced by the VM compiler
        message: String,
    },

    /// Source file could not be opened or read
    #[error("{message}")]
    File {
        /// `cannot <open|read> <path>: <reason>`
        message: String,
    },

    /// The VM ran out of memory
    #[error("not enough memory")]
    Memory,

    /// The message handler of a protected call failed itself
    #[error("error in error handling: {message}")]
    ErrorHandler {
        /// Rendering of the handler's error object
        message: String,
    },

    /// A [`ValueRef`] was used after being released
    #[error("value reference used after release")]
    Released,

    /// A [`ValueRef`] outlived the VM instance that created it
    #[error("value reference belongs to a closed or different VM instance")]
    Closed,

    /// Error raised by host code inside a bridged closure
    #[error("{0}")]
    Host(String),

    /// A bridged closure panicked
    #[error("panic in host closure: {0}")]
    Panic(String),

    /// The VM stack could not grow to hold the requested values
    #[error("stack overflow (cannot grow VM stack by {0} slots)")]
    StackOverflow(i32),
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

impl BridgeError {
    /// Create a runtime error carrying only a message
    pub fn runtime(message: impl Into<String>) -> Self {
        BridgeError::Runtime {
            message: message.into(),
            payload: None,
        }
    }

    /// Create a host error, the usual way for closures to fail
    pub fn host(message: impl Into<String>) -> Self {
        BridgeError::Host(message.into())
    }

    /// The original VM error object, if one was kept
    pub fn payload(&self) -> Option<&ValueRef> {
        match self {
            BridgeError::Runtime { payload, .. } => payload.as_ref(),
            _ => None,
        }
    }

    /// Build an error from a failed VM status, popping the error object at the top of the stack.
    pub(crate) fn from_stack(state: &State<'_>, status: c_int) -> Self {
        if status == ffi::LUA_ERRMEM {
            state.pop(1);
            return BridgeError::Memory;
        }

        let message = state.error_message(-1);
        let err = match status {
            ffi::LUA_ERRSYNTAX => BridgeError::Syntax { message },
            ffi::LUA_ERRERR => BridgeError::ErrorHandler { message },
            LUA_ERRFILE => BridgeError::File { message },
            _ => {
                let payload = match state.kind(-1) {
                    Some(crate::Kind::String) | None => None,
                    Some(_) => state.keep(-1).ok(),
                };
                BridgeError::Runtime { message, payload }
            }
        };
        state.pop(1);
        err
    }
}

/// Extract a readable message from a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argument_error_message() {
        let err = BridgeError::Argument {
            position: 2,
            expected: "integer".to_string(),
            got: "string".to_string(),
        };
        assert_eq!(err.to_string(), "argument 2: expected type integer, got string");
    }

    #[test]
    fn test_runtime_constructor() {
        let err = BridgeError::runtime("boom");
        assert_eq!(err.to_string(), "boom");
        assert!(err.payload().is_none());
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("bad state");
        assert_eq!(panic_message(boxed.as_ref()), "bad state");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
