//! Default Metatable Tests
//!
//! The process-wide default metatable is global state, so it is exercised
//! from a single test in its own binary.
//!
//! # Running Tests
//! ```bash
//! cargo test --test default_metatable_tests
//! ```

use moonbridge::{set_default_metatable, Completion, Lua, MetaOp, Metatable};

struct Unregistered;
struct Registered;

#[test]
fn test_default_metatable_applies_to_unregistered_types() {
    set_default_metatable(Some(Metatable::new().named("host value").op(
        MetaOp::ToString,
        |state| {
            state.push_str("<host value>");
            Ok(Completion::Return(1))
        },
    )));

    let lua = Lua::new().unwrap();
    let state = lua.state();
    state
        .register_metatable::<Registered>(Metatable::new().named("Registered"))
        .unwrap();

    state.push_any(Unregistered).unwrap();
    state.set_global("plain").unwrap();
    state.push_any(Registered).unwrap();
    state.set_global("typed").unwrap();

    assert_eq!(
        state.eval::<String>("return tostring(plain)").unwrap(),
        "<host value>"
    );
    assert!(state
        .eval::<String>("return tostring(typed)")
        .unwrap()
        .starts_with("Registered: "));

    // Types already built keep their table; later ones get none.
    set_default_metatable(None);
    state.push_any(5u8).unwrap();
    state.set_global("late").unwrap();
    assert_eq!(
        state.eval::<String>("return tostring(plain)").unwrap(),
        "<host value>"
    );
    assert!(state
        .eval::<String>("return tostring(late)")
        .unwrap()
        .starts_with("u8: "));
}
