//! Sandboxed evaluator for `code` blocks.
//!
//! Caller-supplied Lua runs with a reduced stdlib (table, string, math —
//! no io, os, debug or package loading), a memory ceiling, read access to
//! the run context variables, and a wall-clock bound.

use mlua::{Lua, LuaOptions, LuaSerdeExt, StdLib};
use serde_json::{Map, Value};
use std::time::Duration;

use crate::error::{ExecutionError, Result};

const MEMORY_LIMIT_BYTES: usize = 64 * 1024 * 1024;

/// Evaluate one chunk and return its value as JSON.
pub async fn run_code_block(
    source: &str,
    vars: Map<String, Value>,
    timeout: Duration,
) -> Result<Value> {
    let source = source.to_string();
    let handle = tokio::task::spawn_blocking(move || evaluate(&source, vars));
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(ExecutionError::Internal(format!("code block panicked: {}", join))),
        Err(_) => Err(ExecutionError::Timeout),
    }
}

fn evaluate(source: &str, vars: Map<String, Value>) -> Result<Value> {
    let lua = Lua::new_with(
        StdLib::TABLE | StdLib::STRING | StdLib::MATH,
        LuaOptions::default(),
    )
    .map_err(|e| ExecutionError::Internal(format!("lua init: {}", e)))?;
    let _ = lua.set_memory_limit(MEMORY_LIMIT_BYTES);

    let globals = lua.globals();
    for (name, value) in &vars {
        let lua_value = lua
            .to_value(value)
            .map_err(|e| ExecutionError::Validation(format!("variable {}: {}", name, e)))?;
        globals
            .set(name.as_str(), lua_value)
            .map_err(|e| ExecutionError::Internal(format!("binding {}: {}", name, e)))?;
    }

    let result: mlua::Value = lua
        .load(source)
        .eval()
        .map_err(|e| ExecutionError::Validation(format!("code block: {}", e)))?;
    lua.from_value(result)
        .map_err(|e| ExecutionError::Validation(format!("code block result: {}", e)))
}
