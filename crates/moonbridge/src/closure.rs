//! Host closures callable from the VM
//!
//! A host closure is stored in a userdata [`ClosureWrapper`] and pushed as a
//! C closure whose single upvalue is that wrapper. Every call goes through
//! the trampoline in [`crate::trampoline`]: the Rust side runs the closure,
//! drops everything it owns, and hands back an integer code telling the
//! trampoline to return, raise, call or yield.
//!
//! A closure reports how its call should finish with a [`Completion`].

use crate::continuation::{Continuation, ContinuationKind, ContinuationStatus};
use crate::convert::{FromArg, IntoReturns};
use crate::error::{panic_message, BridgeError, BridgeResult};
use crate::stack::StackIndex;
use crate::state::{State, CLOSURE_WRAPPER_KEY};
use crate::trampoline::{self, Finalize, CALLCLOSURE_ERROR, CALLK, PCALLK, YIELD};
use mlua_sys as ffi;
use std::cell::RefCell;
use std::os::raw::c_int;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::rc::Rc;

/// Request all results of a call
pub const MULTRET: i32 = ffi::LUA_MULTRET;

/// Type-erased host closure
pub type Callback = Rc<dyn Fn(&State<'_>) -> BridgeResult<Completion>>;

/// How a host closure finishes its call
pub enum Completion {
    /// Return the top `n` values to the caller
    Return(c_int),
    /// Call the function below the top `nargs` values, then run `continuation`
    Call {
        /// Number of arguments above the function
        nargs: c_int,
        /// Results to keep, or [`MULTRET`]
        nresults: c_int,
        /// Runs once the call has returned
        continuation: Continuation,
    },
    /// Like `Call`, but errors are caught and handed to `continuation`
    ProtectedCall {
        /// Number of arguments above the function
        nargs: c_int,
        /// Results to keep, or [`MULTRET`]
        nresults: c_int,
        /// Absolute index of a message handler, if any
        handler: Option<StackIndex>,
        /// Runs once the call has returned or failed
        continuation: Continuation,
    },
    /// Yield the top `nresults` values from the running coroutine
    Yield {
        /// Number of values to yield
        nresults: c_int,
        /// Runs when the coroutine is resumed; without one, the resume
        /// arguments become the closure's results
        continuation: Option<Continuation>,
    },
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Completion::Return(n) => write!(f, "Return({n})"),
            Completion::Call { nargs, nresults, .. } => {
                write!(f, "Call {{ nargs: {nargs}, nresults: {nresults} }}")
            }
            Completion::ProtectedCall {
                nargs,
                nresults,
                handler,
                ..
            } => write!(
                f,
                "ProtectedCall {{ nargs: {nargs}, nresults: {nresults}, handler: {handler:?} }}"
            ),
            Completion::Yield {
                nresults,
                continuation,
            } => write!(
                f,
                "Yield {{ nresults: {nresults}, continuation: {} }}",
                continuation.is_some()
            ),
        }
    }
}

// ============================================================================
// Wrapper userdata
// ============================================================================

/// Userdata payload holding a host closure
pub(crate) struct ClosureWrapper {
    slot: RefCell<Option<Callback>>,
}

impl ClosureWrapper {
    pub(crate) fn new(callback: Callback) -> Self {
        ClosureWrapper {
            slot: RefCell::new(Some(callback)),
        }
    }

    /// The closure, if it has not been released
    pub(crate) fn callback(&self) -> Option<Callback> {
        self.slot.borrow().clone()
    }

    /// Drop the closure. Later calls raise instead of running it.
    pub(crate) fn clear(&self) {
        let callback = self.slot.borrow_mut().take();
        drop(callback);
    }
}

impl Finalize for ClosureWrapper {
    fn finalize(&self) {
        self.clear();
    }
}

/// Pin a closure to the exact signature the wrapper stores.
pub(crate) fn callback<F>(f: F) -> Callback
where
    F: Fn(&State<'_>) -> BridgeResult<Completion> + 'static,
{
    Rc::new(f)
}

// ============================================================================
// Typed functions
// ============================================================================

/// Host functions with typed arguments
///
/// Implemented for closures taking up to three [`FromArg`] parameters and
/// returning `BridgeResult<R>` where `R` is any [`IntoReturns`]. The marker
/// parameter only disambiguates arities.
pub trait IntoFunction<Marker> {
    /// Erase the signature into a [`Callback`]
    fn into_callback(self) -> Callback;
}

macro_rules! impl_into_function {
    ($($arg:ident $value:ident => $pos:literal),*) => {
        impl<F, $($arg,)* R> IntoFunction<fn($($arg),*) -> R> for F
        where
            F: Fn($($arg),*) -> BridgeResult<R> + 'static,
            $($arg: FromArg,)*
            R: IntoReturns,
        {
            fn into_callback(self) -> Callback {
                callback(move |state| {
                    $(let $value = $arg::from_arg(state, $pos)?;)*
                    let n = (self)($($value),*)?.push_returns(state)?;
                    Ok(Completion::Return(n))
                })
            }
        }
    };
}

impl_into_function!();
impl_into_function!(A a => 1);
impl_into_function!(A a => 1, B b => 2);
impl_into_function!(A a => 1, B b => 2, C c => 3);

// ============================================================================
// State: pushing closures and completions
// ============================================================================

impl<'a> State<'a> {
    /// Push a host function with typed arguments
    pub fn push_function<M, F: IntoFunction<M>>(&self, f: F) -> BridgeResult<()> {
        self.push_callback(f.into_callback())
    }

    /// Push a host closure that works on the raw call context
    pub fn push_closure<F>(&self, f: F) -> BridgeResult<()>
    where
        F: Fn(&State<'_>) -> BridgeResult<Completion> + 'static,
    {
        self.push_callback(callback(f))
    }

    pub(crate) fn push_callback(&self, callback: Callback) -> BridgeResult<()> {
        self.push_wrapper(callback)?;
        unsafe { ffi::lua_pushcclosure(self.l, trampoline::call_closure_wrapper, 1) };
        Ok(())
    }

    /// Push the bare wrapper userdata, without the trampoline closure around it
    pub(crate) fn push_wrapper(&self, callback: Callback) -> BridgeResult<()> {
        self.ensure_stack(2)?;
        unsafe {
            let ud = ffi::lua_newuserdatauv(self.l, std::mem::size_of::<ClosureWrapper>(), 0);
            ptr::write(ud as *mut ClosureWrapper, ClosureWrapper::new(callback));
        }
        self.push_internal_metatable(&CLOSURE_WRAPPER_KEY);
        unsafe { ffi::lua_setmetatable(self.l, -2) };
        Ok(())
    }

    /// Finish by returning every value on the stack
    pub fn return_all(&self) -> BridgeResult<Completion> {
        Ok(Completion::Return(self.top()))
    }

    /// Finish by calling the function below the top `nargs` values.
    /// `continuation` runs with the results on the stack.
    pub fn call_k<K>(&self, nargs: c_int, nresults: c_int, continuation: K) -> BridgeResult<Completion>
    where
        K: FnOnce(&State<'_>, ContinuationStatus) -> BridgeResult<Completion> + 'static,
    {
        Ok(Completion::Call {
            nargs,
            nresults,
            continuation: Box::new(continuation),
        })
    }

    /// Finish by calling in protected mode. `continuation` runs with the
    /// results, or with the error in its status.
    pub fn pcall_k<K>(
        &self,
        nargs: c_int,
        nresults: c_int,
        handler: Option<StackIndex>,
        continuation: K,
    ) -> BridgeResult<Completion>
    where
        K: FnOnce(&State<'_>, ContinuationStatus) -> BridgeResult<Completion> + 'static,
    {
        Ok(Completion::ProtectedCall {
            nargs,
            nresults,
            handler: handler.map(|h| self.absolute(h)),
            continuation: Box::new(continuation),
        })
    }

    /// Finish by yielding the top `nresults` values; `continuation` runs on resume
    pub fn yield_k<K>(&self, nresults: c_int, continuation: K) -> BridgeResult<Completion>
    where
        K: FnOnce(&State<'_>, ContinuationStatus) -> BridgeResult<Completion> + 'static,
    {
        Ok(Completion::Yield {
            nresults,
            continuation: Some(Box::new(continuation)),
        })
    }

    /// Finish by yielding the top `nresults` values; the resume arguments become the results
    pub fn yield_values(&self, nresults: c_int) -> BridgeResult<Completion> {
        Ok(Completion::Yield {
            nresults,
            continuation: None,
        })
    }

    /// Translate a closure outcome into a trampoline code.
    pub(crate) fn complete(&self, result: BridgeResult<Completion>) -> c_int {
        match result.and_then(|completion| self.arm(completion)) {
            Ok(code) => code,
            Err(err) => self.raise(err),
        }
    }

    /// Lay out the stack for the trampoline and return its code.
    fn arm(&self, completion: Completion) -> BridgeResult<c_int> {
        let top = self.top();
        match completion {
            Completion::Return(n) => {
                if n < 0 || n > top {
                    return Err(BridgeError::host(format!(
                        "closure returned {n} values but only {top} are on the stack"
                    )));
                }
                Ok(n)
            }
            Completion::Call {
                nargs,
                nresults,
                continuation,
            } => {
                let function = self.callee_index(nargs)?;
                self.ensure_stack(3)?;
                self.push_continuation(ContinuationKind::Call, continuation)?;
                self.rotate(function, 1);
                self.push_integer(nargs as i64);
                self.push_integer(nresults as i64);
                Ok(CALLK)
            }
            Completion::ProtectedCall {
                nargs,
                nresults,
                handler,
                continuation,
            } => {
                let function = self.callee_index(nargs)?;
                self.ensure_stack(4)?;
                let msgh = match handler {
                    Some(handler) => {
                        if handler <= 0 || handler > top {
                            return Err(BridgeError::host(format!(
                                "message handler index {handler} is not on the stack"
                            )));
                        }
                        self.push_copy(handler);
                        self.push_continuation(
                            ContinuationKind::ProtectedCall { handler: true },
                            continuation,
                        )?;
                        self.rotate(function, 2);
                        function
                    }
                    None => {
                        self.push_continuation(
                            ContinuationKind::ProtectedCall { handler: false },
                            continuation,
                        )?;
                        self.rotate(function, 1);
                        0
                    }
                };
                self.push_integer(nargs as i64);
                self.push_integer(nresults as i64);
                self.push_integer(msgh as i64);
                Ok(PCALLK)
            }
            Completion::Yield {
                nresults,
                continuation,
            } => {
                if nresults < 0 || nresults > top {
                    return Err(BridgeError::host(format!(
                        "cannot yield {nresults} values with only {top} on the stack"
                    )));
                }
                self.ensure_stack(3)?;
                let resumable = continuation.is_some();
                if let Some(continuation) = continuation {
                    self.push_continuation(ContinuationKind::Yield, continuation)?;
                    self.rotate(top - nresults + 1, 1);
                }
                self.push_bool(resumable);
                self.push_integer(nresults as i64);
                Ok(YIELD)
            }
        }
    }

    fn callee_index(&self, nargs: c_int) -> BridgeResult<StackIndex> {
        let function = self.top() - nargs;
        if nargs < 0 || function < 1 {
            return Err(BridgeError::host(format!(
                "cannot call with {nargs} arguments and {} values on the stack",
                self.top()
            )));
        }
        Ok(function)
    }

    /// Push the error object for `err` and return the raise code.
    pub(crate) fn raise(&self, err: BridgeError) -> c_int {
        // A full stack gives up its top slot to the error object.
        if self.ensure_stack(1).is_err() && self.top() > 0 {
            self.pop(1);
        }
        let pushed = match err.payload() {
            Some(payload) => self.push_ref(payload).is_ok(),
            None => false,
        };
        if !pushed {
            self.push_str(&err.to_string());
        }
        CALLCLOSURE_ERROR
    }
}

/// Run a closure, turning a panic into an error.
pub(crate) fn run_callback(
    state: &State<'_>,
    callback: Option<Callback>,
) -> BridgeResult<Completion> {
    let Some(callback) = callback else {
        return Err(BridgeError::runtime("attempt to call a released host function"));
    };
    catch_unwind(AssertUnwindSafe(|| callback(state)))
        .unwrap_or_else(|panic| Err(BridgeError::Panic(panic_message(panic.as_ref()))))
}

/// Body of the call trampoline. The wrapper is upvalue 1.
///
/// # Safety
///
/// `l` must be running a closure pushed by [`State::push_callback`].
pub(crate) unsafe fn call_closure(l: *mut ffi::lua_State) -> c_int {
    let Some(state) = State::from_raw(l) else {
        return trampoline::missing_state(l);
    };
    let wrapper = ffi::lua_touserdata(l, ffi::lua_upvalueindex(1)) as *const ClosureWrapper;
    let callback = wrapper.as_ref().and_then(ClosureWrapper::callback);
    let result = run_callback(&state, callback);
    state.complete(result)
}

/// Call the wrapper userdata at `index` as a predicate: `1` to continue,
/// `0` to stop, or the raise code with the error on top.
///
/// # Safety
///
/// The value at `index` must be a closure wrapper userdata.
pub(crate) unsafe fn call_unmanaged(l: *mut ffi::lua_State, index: StackIndex) -> c_int {
    let Some(state) = State::from_raw(l) else {
        return trampoline::missing_state(l);
    };
    let wrapper = ffi::lua_touserdata(l, index) as *const ClosureWrapper;
    let callback = wrapper.as_ref().and_then(ClosureWrapper::callback);
    match run_callback(&state, callback) {
        Ok(Completion::Return(1)) => {
            let keep_going = state.to_bool(-1);
            state.pop(1);
            keep_going as c_int
        }
        Ok(other) => state.raise(BridgeError::host(format!(
            "iteration callback must return one value, not {other:?}"
        ))),
        Err(err) => state.raise(err),
    }
}
