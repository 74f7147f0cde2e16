//! Continuation Tests
//!
//! Host closures that hand control back to the VM and pick up again later:
//! - `call_k` / `pcall_k` whose callee yields a coroutine
//! - Errors raised after a resume reaching the continuation
//! - `yield_k` and `yield_values` driven by the host and by guest code
//!
//! # Running Tests
//! ```bash
//! cargo test --test continuation_tests
//! ```

use moonbridge::{BridgeError, ContinuationStatus, Lua, Resumed, State, MULTRET};

/// `guard(f)`: calls `f` under `pcall_k`; returns f's results followed by
/// the continuation's `yielded` flag, or the error message and the flag.
fn install_guard(state: &State<'_>) {
    state
        .push_closure(|state| {
            state.pcall_k(0, MULTRET, None, |state: &State<'_>, status: ContinuationStatus| {
                if let Some(err) = status.error {
                    state.push_str(&err.to_string());
                }
                state.push_bool(status.yielded);
                state.return_all()
            })
        })
        .unwrap();
    state.set_global("guard").unwrap();
}

// ===== Protected Call Tests =====

#[test]
fn test_pcall_k_callee_yields_then_returns() {
    let lua = Lua::new().unwrap();
    let state = lua.state();
    install_guard(&state);
    state
        .exec(
            r#"
            co = coroutine.wrap(function()
                return guard(function()
                    local x = coroutine.yield('paused')
                    return x * 2
                end)
            end)
            first = co()
            value, yielded = co(21)
            "#,
        )
        .unwrap();
    assert_eq!(state.eval::<String>("return first").unwrap(), "paused");
    assert_eq!(state.eval::<i64>("return value").unwrap(), 42);
    assert!(state.eval::<bool>("return yielded").unwrap());
}

#[test]
fn test_pcall_k_without_yield_reports_not_yielded() {
    let lua = Lua::new().unwrap();
    let state = lua.state();
    install_guard(&state);
    state
        .exec("value, yielded = guard(function() return 'direct' end)")
        .unwrap();
    assert_eq!(state.eval::<String>("return value").unwrap(), "direct");
    assert!(!state.eval::<bool>("return yielded").unwrap());
}

#[test]
fn test_pcall_k_error_after_resume_is_observed() {
    let lua = Lua::new().unwrap();
    let state = lua.state();
    install_guard(&state);
    state
        .exec(
            r#"
            co = coroutine.wrap(function()
                return guard(function()
                    coroutine.yield()
                    error('late failure', 0)
                end)
            end)
            co()
            message, yielded = co()
            "#,
        )
        .unwrap();
    // The error status replaces the yield status on this path.
    assert_eq!(state.eval::<String>("return message").unwrap(), "late failure");
    assert!(!state.eval::<bool>("return yielded").unwrap());
}

#[test]
fn test_pcall_k_with_message_handler() {
    let lua = Lua::new().unwrap();
    let state = lua.state();
    state
        .push_closure(|state| {
            // stack: handler, f
            state.pcall_k(0, 1, Some(1), |state: &State<'_>, status: ContinuationStatus| {
                let message = status.error.map(|err| err.to_string()).unwrap_or_default();
                state.set_top(0);
                state.push_str(&message);
                state.return_all()
            })
        })
        .unwrap();
    state.set_global("guard_with").unwrap();
    let message = state
        .eval::<String>(
            "return guard_with(function(m) return 'wrapped: ' .. m end, function() error('boom', 0) end)",
        )
        .unwrap();
    assert_eq!(message, "wrapped: boom");
}

// ===== Unprotected Call Tests =====

#[test]
fn test_call_k_callee_yields() {
    let lua = Lua::new().unwrap();
    let state = lua.state();
    state
        .push_closure(|state| {
            state.call_k(0, MULTRET, |state: &State<'_>, status: ContinuationStatus| {
                assert!(status.error.is_none());
                state.push_bool(status.yielded);
                state.return_all()
            })
        })
        .unwrap();
    state.set_global("relay").unwrap();
    state
        .exec(
            r#"
            co = coroutine.wrap(function()
                return relay(function() return coroutine.yield(1) + 1 end)
            end)
            co()
            value, yielded = co(9)
            "#,
        )
        .unwrap();
    assert_eq!(state.eval::<i64>("return value").unwrap(), 10);
    assert!(state.eval::<bool>("return yielded").unwrap());
}

#[test]
fn test_call_k_error_unwinds_past_continuation() {
    let lua = Lua::new().unwrap();
    let state = lua.state();
    state
        .push_closure(|state| {
            state.call_k(0, 0, |_: &State<'_>, _: ContinuationStatus| {
                panic!("continuation must not run after an error")
            })
        })
        .unwrap();
    state.set_global("relay").unwrap();
    let err = state
        .exec("relay(function() error('escaped', 0) end)")
        .unwrap_err();
    assert_eq!(err.to_string(), "escaped");
}

#[test]
fn test_continuation_error_becomes_vm_error() {
    let lua = Lua::new().unwrap();
    let state = lua.state();
    state
        .push_closure(|state| {
            state.call_k(0, 0, |_: &State<'_>, _: ContinuationStatus| {
                Err(BridgeError::host("rejected in continuation"))
            })
        })
        .unwrap();
    state.set_global("relay").unwrap();
    let err = state.exec("relay(function() end)").unwrap_err();
    assert_eq!(err.to_string(), "rejected in continuation");
}

#[test]
fn test_continuation_panic_becomes_vm_error() {
    let lua = Lua::new().unwrap();
    let state = lua.state();
    state
        .push_closure(|state| {
            state.call_k(0, 0, |_: &State<'_>, _: ContinuationStatus| -> moonbridge::BridgeResult<_> {
                panic!("exploded")
            })
        })
        .unwrap();
    state.set_global("relay").unwrap();
    let err = state.exec("relay(function() end)").unwrap_err();
    assert!(err.to_string().contains("exploded"), "{err}");
}

// ===== Yield Tests =====

#[test]
fn test_yield_values_from_guest_coroutine() {
    let lua = Lua::new().unwrap();
    let state = lua.state();
    state
        .push_closure(|state| state.yield_values(state.top()))
        .unwrap();
    state.set_global("pause").unwrap();
    state
        .exec(
            r#"
            co = coroutine.create(function(a)
                local reply = pause(a, a + 1)
                return reply
            end)
            _, x, y = coroutine.resume(co, 1)
            _, reply = coroutine.resume(co, 'done')
            "#,
        )
        .unwrap();
    assert_eq!(state.eval::<i64>("return x").unwrap(), 1);
    assert_eq!(state.eval::<i64>("return y").unwrap(), 2);
    assert_eq!(state.eval::<String>("return reply").unwrap(), "done");
}

#[test]
fn test_yield_k_resumed_by_host() {
    let lua = Lua::new().unwrap();
    let state = lua.state();
    state
        .push_closure(|state| {
            state.push_str("ready");
            state.yield_k(1, |state: &State<'_>, status: ContinuationStatus| {
                assert!(status.yielded);
                let mut sum = 0;
                for index in 1..=state.top() {
                    sum += state.to_integer(index).unwrap_or(0);
                }
                state.set_top(0);
                state.push_integer(sum);
                state.return_all()
            })
        })
        .unwrap();
    state.set_global("collect").unwrap();

    let thread = state.new_thread().unwrap();
    state
        .load("return 10 + collect()", "=stepper", moonbridge::LoadMode::Text)
        .unwrap();
    assert_eq!(state.resume(&thread, 0).unwrap(), Resumed::Yielded(1));
    assert_eq!(state.to_str(-1).as_deref(), Some("ready"));
    state.pop(1);

    state.push_integer(3);
    state.push_integer(4);
    assert_eq!(state.resume(&thread, 2).unwrap(), Resumed::Returned(1));
    assert_eq!(state.to_integer(-1), Some(17));
    state.pop(1);
    assert_eq!(state.top(), 0);
}

#[test]
fn test_yield_outside_coroutine_fails() {
    let lua = Lua::new().unwrap();
    let state = lua.state();
    state
        .push_closure(|state| state.yield_values(0))
        .unwrap();
    state.set_global("pause").unwrap();
    let err = state.exec("pause()").unwrap_err();
    assert!(err.to_string().contains("yield"), "{err}");
}
