//! Loading Tests
//!
//! Chunks from memory and from disk:
//! - Syntax and file errors
//! - Preamble handling (BOM and `#!` lines) without shifting line numbers
//! - Binary versus text load modes
//! - Preloaded modules and restricted standard libraries
//!
//! # Running Tests
//! ```bash
//! cargo test --test load_tests
//! ```

use moonbridge::{BridgeError, Completion, Library, LoadMode, Lua, LuaOptions};
use std::io::Write;
use tempfile::NamedTempFile;

fn script(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

// ===== File Tests =====

#[test]
fn test_load_file_runs() {
    let lua = Lua::new().unwrap();
    let state = lua.state();
    let file = script("return 6 * 7\n");
    state.load_file(file.path(), None, LoadMode::Text).unwrap();
    state.call(0, 1).unwrap();
    assert_eq!(state.to_integer(-1), Some(42));
    state.pop(1);
}

#[test]
fn test_missing_file() {
    let lua = Lua::new().unwrap();
    let state = lua.state();
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.lua");
    match state.load_file(&missing, None, LoadMode::Text) {
        Err(BridgeError::File { message }) => {
            assert!(message.starts_with("cannot open"), "{message}");
            assert!(message.contains("nope.lua"), "{message}");
        }
        other => panic!("expected a file error, got {other:?}"),
    }
    assert_eq!(state.top(), 0);
}

#[test]
fn test_syntax_error_uses_display_name() {
    let lua = Lua::new().unwrap();
    let state = lua.state();
    let file = script("local x = 1\nlocal = 2\n");
    match state.load_file(file.path(), Some("broken.lua"), LoadMode::Text) {
        Err(BridgeError::Syntax { message }) => {
            assert!(message.starts_with("broken.lua:2:"), "{message}");
        }
        other => panic!("expected a syntax error, got {other:?}"),
    }
    assert_eq!(state.top(), 0);
}

#[test]
fn test_shebang_keeps_line_numbers() {
    let lua = Lua::new().unwrap();
    let state = lua.state();
    let file = script("#!/usr/bin/env lua\nerror('second line')\n");
    state
        .load_file(file.path(), Some("tool.lua"), LoadMode::Text)
        .unwrap();
    let err = state.call(0, 0).unwrap_err();
    assert_eq!(err.to_string(), "tool.lua:2: second line");
}

#[test]
fn test_bom_is_skipped() {
    let lua = Lua::new().unwrap();
    let state = lua.state();
    let file = script("\u{feff}return 'ok'\n");
    state.load_file(file.path(), None, LoadMode::Text).unwrap();
    state.call(0, 1).unwrap();
    assert_eq!(state.to_str(-1).as_deref(), Some("ok"));
    state.pop(1);
}

#[test]
fn test_shebang_before_precompiled_chunk() {
    let lua = Lua::new().unwrap();
    let state = lua.state();
    let bytecode = state
        .eval::<moonbridge::Bytes>("return string.dump(function() return 7 end)")
        .unwrap();

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"#!/usr/bin/lua\n").unwrap();
    file.write_all(&bytecode.0).unwrap();
    file.flush().unwrap();

    state
        .load_file(file.path(), Some("bin"), LoadMode::Any)
        .unwrap();
    state.call(0, 1).unwrap();
    assert_eq!(state.to_integer(-1), Some(7));
    state.pop(1);
}

// ===== Load Mode Tests =====

#[test]
fn test_text_mode_rejects_binary_chunks() {
    let lua = Lua::new().unwrap();
    let state = lua.state();
    let bytecode = state
        .eval::<moonbridge::Bytes>("return string.dump(function() return 1 end)")
        .unwrap();

    let err = state.load(&bytecode.0, "=dumped", LoadMode::Text).unwrap_err();
    assert!(matches!(err, BridgeError::Syntax { .. }), "{err:?}");

    state.load(&bytecode.0, "=dumped", LoadMode::Binary).unwrap();
    state.call(0, 1).unwrap();
    assert_eq!(state.to_integer(-1), Some(1));
    state.pop(1);
}

#[test]
fn test_default_load_mode_applies_to_exec() {
    let lua = Lua::with_options(LuaOptions {
        default_load_mode: LoadMode::Binary,
        ..Default::default()
    })
    .unwrap();
    let state = lua.state();
    assert!(matches!(
        state.exec("x = 1").unwrap_err(),
        BridgeError::Syntax { .. }
    ));
}

// ===== Module Tests =====

#[test]
fn test_preload_and_require() {
    let lua = Lua::new().unwrap();
    let state = lua.state();
    state
        .preload("greeter", |state| {
            state.new_table(0, 1);
            state.push_function(|name: String| Ok(format!("hello, {name}")))?;
            state.set_field_raw(-2, "greet");
            Ok(Completion::Return(1))
        })
        .unwrap();
    assert_eq!(
        state
            .eval::<String>("return require('greeter').greet('moon')")
            .unwrap(),
        "hello, moon"
    );
    assert!(state
        .eval::<bool>("return require('greeter') == require('greeter')")
        .unwrap());
}

#[test]
fn test_restricted_libraries() {
    let lua = Lua::with_options(LuaOptions {
        libraries: vec![Library::Base, Library::String],
        ..Default::default()
    })
    .unwrap();
    let state = lua.state();
    assert!(state.eval::<bool>("return io == nil and os == nil").unwrap());
    assert_eq!(state.eval::<String>("return ('ab'):rep(2)").unwrap(), "abab");
    assert!(state.preload("anything", |state| state.return_all()).is_err());
}
