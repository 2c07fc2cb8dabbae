//! The zygote: the shared blueprint every worker state is configured
//! from.
//!
//! A worker state gets the deterministic subset of the standard library
//! (no printing, no file loading, no clocks or randomness), the zb
//! builtins, and the prelude's internals; its stdlib is then frozen.
//! User chunks never run against the state globals directly: each chunk
//! gets a fresh environment table whose metatable falls through to the
//! frozen stdlib, so modules share standard bindings but may add
//! mutable bindings without poisoning shared state.

use mlua::{Function, Lua, LuaOptions, MultiValue, StdLib, Table, Value};

use crate::StateCtx;

const PRELUDE: &str = include_str!("prelude.lua");

/// Registry slot holding the prelude's internals table.
const INTERNAL_KEY: &str = "zb.internal";

/// Registry slot holding the per-state cache of marshaled module
/// values, so every reader of a module in one state observes the same
/// copy.
pub(crate) const MODULE_CACHE_KEY: &str = "zb.module_cache";

/// Globals removed from the sandbox: either nondeterministic or
/// environment-dependent.
const REMOVED_GLOBALS: &[&str] = &[
    "print",
    "dofile",
    "loadfile",
    "collectgarbage",
    "require",
];
const REMOVED_MATH: &[&str] = &["random", "randomseed"];

pub(crate) struct Zygote {}

impl Zygote {
    pub fn new() -> Zygote {
        Zygote {}
    }

    /// Creates a new worker state configured from this blueprint.
    /// Builtins reach the evaluator through the state's app data.
    pub fn spawn_state(&self, ctx: StateCtx) -> mlua::Result<Lua> {
        let lua = Lua::new_with(
            StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::COROUTINE | StdLib::UTF8,
            LuaOptions::default(),
        )?;
        lua.set_app_data(ctx);

        // prelude internals first; builtins and env plumbing use them
        let internal: Table = lua
            .load(PRELUDE)
            .set_name("=prelude")
            .set_mode(mlua::ChunkMode::Text)
            .call(())?;
        lua.set_named_registry_value(INTERNAL_KEY, internal)?;
        lua.set_named_registry_value(MODULE_CACHE_KEY, lua.create_table()?)?;

        sandbox(&lua)?;
        install_builtins(&lua)?;

        // Freeze the stdlib; module environments delegate to it from
        // here on.
        freeze(&lua, Value::Table(lua.globals()))?;

        Ok(lua)
    }
}

fn sandbox(lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();

    for name in REMOVED_GLOBALS {
        globals.raw_set(*name, Value::Nil)?;
    }
    if let Ok(Value::Table(math)) = globals.raw_get::<Value>("math") {
        for name in REMOVED_MATH {
            math.raw_set(*name, Value::Nil)?;
        }
    }

    // a fresh os table exposing only the environment
    let os = lua.create_table()?;
    os.raw_set(
        "getenv",
        lua.create_function(|_, name: String| Ok(std::env::var(&name).ok()))?,
    )?;
    globals.raw_set("os", os)?;

    // text-only load; binary chunks are refused
    globals.raw_set(
        "load",
        lua.create_function(sanitized_load)?,
    )?;

    Ok(())
}

/// `load(chunk [, chunkname [, mode [, env]]])` restricted to string
/// chunks in text mode. Mirrors Lua's contract of returning
/// `nil, message` on failure.
fn sanitized_load(
    lua: &Lua,
    (chunk, name, _mode, env): (Value, Option<String>, Option<String>, Option<Table>),
) -> mlua::Result<MultiValue> {
    let source = match chunk {
        Value::String(s) => String::from_utf8_lossy(&s.as_bytes()).into_owned(),
        _ => return soft_error(lua, "load only accepts string chunks"),
    };

    let mut chunk = lua
        .load(source)
        .set_mode(mlua::ChunkMode::Text);
    if let Some(name) = name {
        chunk = chunk.set_name(name);
    }
    if let Some(env) = env {
        chunk = chunk.set_environment(env);
    }

    match chunk.into_function() {
        Ok(f) => Ok(MultiValue::from_vec(vec![Value::Function(f)])),
        Err(e) => soft_error(lua, &e.to_string()),
    }
}

fn install_builtins(lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();

    globals.raw_set("import", lua.create_function(crate::module::import_builtin)?)?;
    globals.raw_set("await", lua.create_function(crate::module::await_builtin)?)?;
    globals.raw_set("lazy", lua.create_function(crate::lazy::lazy_builtin)?)?;
    globals.raw_set(
        "derivation",
        lua.create_function(crate::derivation::derivation_builtin)?,
    )?;
    globals.raw_set(
        "toFile",
        lua.create_function(crate::derivation::to_file_builtin)?,
    )?;
    globals.raw_set("path", lua.create_function(crate::source::path_builtin)?)?;

    Ok(())
}

/// Creates the environment table for one user chunk: reads fall through
/// to the frozen stdlib, writes stay local, and the special `_G` key
/// names the table itself.
pub(crate) fn module_env(lua: &Lua) -> mlua::Result<Table> {
    let env = lua.create_table()?;
    env.raw_set("_G", &env)?;

    let mt = lua.create_table()?;
    mt.raw_set("__index", lua.globals())?;
    set_metatable(lua, &env, mt)?;
    Ok(env)
}

/// Returns a (nil, message) pair, the convention for recoverable
/// builtin failures.
pub(crate) fn soft_error(lua: &Lua, message: &str) -> mlua::Result<MultiValue> {
    Ok(MultiValue::from_vec(vec![
        Value::Nil,
        Value::String(lua.create_string(message)?),
    ]))
}

fn internal(lua: &Lua) -> mlua::Result<Table> {
    lua.named_registry_value(INTERNAL_KEY)
}

/// Fetches one of the prelude's operator helpers.
pub(crate) fn op(lua: &Lua, name: &str) -> mlua::Result<Function> {
    let ops: Table = internal(lua)?.get("ops")?;
    ops.get(name)
}

/// Deep-freezes a value in its own state.
pub(crate) fn freeze(lua: &Lua, value: Value) -> mlua::Result<Value> {
    let freeze: Function = internal(lua)?.get("freeze")?;
    freeze.call(value)
}

/// Installs a metatable through the prelude, keeping the host off
/// version-specific APIs.
pub(crate) fn set_metatable(lua: &Lua, table: &Table, mt: Table) -> mlua::Result<()> {
    let setmeta: Function = op(lua, "setmetatable")?;
    setmeta.call::<Value>((table, mt))?;
    Ok(())
}
