//! Moonbridge: a host bridge for an embedded Lua 5.4 VM
//!
//! This crate provides:
//! - Stack access and typed value conversion, including speculative
//!   resolution of tables into host collections
//! - Registry-pinned references with checked release and teardown
//! - Host closures callable from the VM, with panics and errors turned
//!   into VM errors
//! - Continuations, so host closures can call back into the VM or yield
//!   a coroutine and resume later
//! - Per-type metatables for opaque host values
//!
//! Everything hangs off a [`State`], obtained from an owned [`Lua`] or
//! handed to a host closure as its call context.

#![warn(rust_2018_idioms)]

mod closure;
mod continuation;
mod convert;
mod error;
mod gc;
mod iter;
mod load;
mod metatable;
mod ops;
mod options;
mod refs;
mod stack;
mod state;
mod thread;
mod trampoline;
mod value;

pub use closure::{Callback, Completion, IntoFunction, MULTRET};
pub use continuation::{Continuation, ContinuationStatus};
pub use convert::{FromArg, IntoReturns, Push, Resolve, Shape, TypeConstraint};
pub use error::{BridgeError, BridgeResult};
pub use iter::{ITER_KEY, ITER_VALUE};
pub use metatable::{set_default_metatable, Dispatch, MetaOp, Metatable};
pub use ops::{ArithOp, CompareOp};
pub use options::{GcKind, GcMode, Library, LoadMode, LuaOptions};
pub use refs::ValueRef;
pub use stack::{Kind, StackIndex};
pub use state::{Lua, State};
pub use thread::{Resumed, ThreadStatus};
pub use value::{Bytes, Value};
