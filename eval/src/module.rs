//! Module promises: `import(path)` returns an opaque value that loads
//! the file in its own worker state, at most once per file, and behaves
//! like the module's return value wherever it is used monomorphically.

use std::path::PathBuf;
use std::sync::Arc;

use mlua::{Lua, MetaMethod, MultiValue, UserData, UserDataMethods, Value};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, instrument};

use crate::source::{abs_source_path, ResolvedPath};
use crate::zygote::{self, module_env, soft_error};
use crate::{state_eval, value, wait_latch, EvalInner, StateCtx};

pub(crate) struct Module {
    pub filename: PathBuf,
    state: Mutex<ModuleState>,
    cond: Condvar,
}

enum ModuleState {
    Pending,
    /// The module's state is kept alive solely to host the frozen
    /// return value; access marshals it into the caller's state.
    Ready {
        lua: Lua,
        value: mlua::RegistryKey,
    },
    Failed(String),
}

/// The promise userdata handed to user code.
#[derive(Clone)]
pub(crate) struct ModuleHandle(pub Arc<Module>);

impl ModuleHandle {
    /// Awaits the module and marshals its value into `dst`.
    pub(crate) fn force(&self, dst: &Lua) -> mlua::Result<Value> {
        let (base, request) = {
            let ctx = dst
                .app_data_ref::<StateCtx>()
                .ok_or_else(|| mlua::Error::RuntimeError("state has no evaluator".into()))?;
            let inner = ctx.eval()?;
            (inner.cancel.clone(), ctx.request.clone())
        };

        wait_latch(&self.0.state, &self.0.cond, &base, &request, |st| {
            !matches!(st, ModuleState::Pending)
        })?;

        // one marshaled copy per destination state, so repeated
        // imports are indistinguishable from each other
        let cache: mlua::Table = dst.named_registry_value(zygote::MODULE_CACHE_KEY)?;
        let cache_key = Arc::as_ptr(&self.0) as usize as i64;
        if let Ok(Value::Table(cached)) = cache.raw_get::<Value>(cache_key) {
            return Ok(Value::Table(cached));
        }

        let st = self.0.state.lock();
        match &*st {
            ModuleState::Ready { lua, value } => {
                let v: Value = lua.registry_value(value)?;
                // the marshal itself may call back into the module's
                // state; its mutex is internal to mlua
                let src = lua.clone();
                drop(st);
                let copied = value::xmove(&src, dst, v)?;
                if matches!(copied, Value::Table(_)) {
                    cache.raw_set(cache_key, &copied)?;
                }
                Ok(copied)
            }
            ModuleState::Failed(msg) => Err(mlua::Error::RuntimeError(format!(
                "module {}: {}",
                self.0.filename.display(),
                msg
            ))),
            ModuleState::Pending => unreachable!("latch observed"),
        }
    }
}

/// Unwraps a module promise into its value; other values pass through.
pub(crate) fn resolve_promise(lua: &Lua, v: Value) -> mlua::Result<Value> {
    if let Value::UserData(ud) = &v {
        if let Ok(handle) = ud.borrow::<ModuleHandle>() {
            return handle.force(lua);
        }
    }
    Ok(v)
}

impl UserData for ModuleHandle {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, |lua, this, key: Value| {
            let v = this.force(lua)?;
            zygote::op(lua, "index")?.call::<Value>((v, key))
        });

        methods.add_meta_method(MetaMethod::Call, |lua, this, args: MultiValue| {
            let v = this.force(lua)?;
            let mut all = vec![v];
            all.extend(args);
            zygote::op(lua, "call")?.call::<MultiValue>(MultiValue::from_vec(all))
        });

        methods.add_meta_method(MetaMethod::ToString, |lua, this, ()| {
            let v = this.force(lua)?;
            zygote::op(lua, "tostring")?.call::<Value>(v)
        });

        methods.add_meta_method(MetaMethod::Len, |lua, this, ()| {
            let v = this.force(lua)?;
            zygote::op(lua, "len")?.call::<Value>(v)
        });

        for (meta, name) in [
            (MetaMethod::Concat, "concat"),
            (MetaMethod::Add, "add"),
            (MetaMethod::Sub, "sub"),
            (MetaMethod::Mul, "mul"),
            (MetaMethod::Div, "div"),
            (MetaMethod::Mod, "mod"),
            (MetaMethod::Pow, "pow"),
            (MetaMethod::IDiv, "idiv"),
            (MetaMethod::Eq, "eq"),
            (MetaMethod::Lt, "lt"),
            (MetaMethod::Le, "le"),
        ] {
            methods.add_meta_function(meta, move |lua, (a, b): (Value, Value)| {
                let a = resolve_promise(lua, a)?;
                let b = resolve_promise(lua, b)?;
                zygote::op(lua, name)?.call::<Value>((a, b))
            });
        }

        methods.add_meta_function(MetaMethod::Unm, |lua, args: MultiValue| {
            let a = args
                .into_iter()
                .next()
                .unwrap_or(Value::Nil);
            let a = resolve_promise(lua, a)?;
            zygote::op(lua, "unm")?.call::<Value>(a)
        });
    }
}

/// The `import(path)` builtin.
pub(crate) fn import_builtin(lua: &Lua, path: Value) -> mlua::Result<MultiValue> {
    let inner = state_eval(lua)?;

    let raw = match &path {
        Value::String(s) => value::utf8_string(s, "import path")?,
        _ => return soft_error(lua, "import expects a path string"),
    };

    let resolved = match abs_source_path(lua, &inner, &raw) {
        Ok(ResolvedPath::Local(p)) => p,
        Ok(ResolvedPath::Placeholder { .. }) => {
            return soft_error(lua, "cannot import from an unrealized derivation output")
        }
        Err(msg) => return soft_error(lua, &msg),
    };
    let resolved = std::fs::canonicalize(&resolved).unwrap_or(resolved);

    // cycle detection walks the chain carried by this state's context,
    // so concurrent imports on disjoint chains never falsely trip it
    {
        let ctx = lua
            .app_data_ref::<StateCtx>()
            .ok_or_else(|| mlua::Error::RuntimeError("state has no evaluator".into()))?;
        if let Some(pos) = ctx.chain.iter().position(|p| *p == resolved) {
            let mut msg = format!("import cycle: {}", resolved.display());
            for link in &ctx.chain[pos + 1..] {
                msg.push_str(&format!("\n→ {}", link.display()));
            }
            msg.push_str(&format!("\n→ {}", resolved.display()));
            return soft_error(lua, &msg);
        }
    }

    let module = lookup_or_spawn(lua, &inner, resolved)?;
    let ud = lua.create_userdata(ModuleHandle(module))?;
    Ok(MultiValue::from_vec(vec![Value::UserData(ud)]))
}

/// Returns the promise for `filename`, starting its load task on first
/// request.
fn lookup_or_spawn(
    lua: &Lua,
    inner: &Arc<EvalInner>,
    filename: PathBuf,
) -> mlua::Result<Arc<Module>> {
    let mut modules = inner.modules.lock();
    if let Some(existing) = modules.get(&filename) {
        return Ok(existing.clone());
    }

    let module = Arc::new(Module {
        filename: filename.clone(),
        state: Mutex::new(ModuleState::Pending),
        cond: Condvar::new(),
    });
    modules.insert(filename.clone(), module.clone());
    drop(modules);

    // the spawned module inherits this state's chain, extended by
    // itself
    let chain = {
        let ctx = lua
            .app_data_ref::<StateCtx>()
            .ok_or_else(|| mlua::Error::RuntimeError("state has no evaluator".into()))?;
        let mut chain = ctx.chain.clone();
        chain.push(filename);
        chain
    };

    spawn_load(inner, module.clone(), chain);
    Ok(module)
}

fn spawn_load(inner: &Arc<EvalInner>, module: Arc<Module>, chain: Vec<PathBuf>) {
    let task_inner = inner.clone();
    let task_module = module.clone();

    let spawned = std::thread::Builder::new()
        .name(format!("import {}", module.filename.display()))
        .spawn(move || {
            let outcome = load_module(&task_inner, &task_module, chain);
            let mut st = task_module.state.lock();
            *st = match outcome {
                Ok((lua, value)) => ModuleState::Ready { lua, value },
                Err(msg) => ModuleState::Failed(msg),
            };
            task_module.cond.notify_all();
        });

    match spawned {
        Ok(handle) => inner.tasks.lock().push(handle),
        Err(e) => {
            let mut st = module.state.lock();
            *st = ModuleState::Failed(format!("spawning import task: {}", e));
            module.cond.notify_all();
        }
    }
}

/// Loads one module file in a fresh worker state.
#[instrument(skip_all, fields(module = %module.filename.display()))]
fn load_module(
    inner: &Arc<EvalInner>,
    module: &Module,
    chain: Vec<PathBuf>,
) -> Result<(Lua, mlua::RegistryKey), String> {
    if inner.cancel.is_cancelled() {
        return Err("evaluation canceled".to_string());
    }

    let ctx = StateCtx {
        eval: Arc::downgrade(inner),
        chain,
        source: Some(module.filename.clone()),
        request: inner.cancel.child_token(),
    };
    let lua = inner
        .zygote
        .lock()
        .spawn_state(ctx)
        .map_err(|e| e.to_string())?;

    let bytes = std::fs::read(&module.filename).map_err(|e| e.to_string())?;
    let code = String::from_utf8_lossy(&bytes).into_owned();

    let env = module_env(&lua).map_err(|e| e.to_string())?;
    debug!("running module body");
    let results: MultiValue = lua
        .load(code)
        .set_name(format!("@{}", module.filename.display()))
        .set_mode(mlua::ChunkMode::Text)
        .set_environment(env.clone())
        .call(())
        .map_err(|e| e.to_string())?;

    // the module's value is its first return value, or its globals
    // table when it returns nothing
    let value = match results.into_iter().next() {
        Some(v) => v,
        None => Value::Table(env),
    };
    let value = zygote::freeze(&lua, value).map_err(|e| e.to_string())?;

    // once loaded, calls into this state come from *other* modules;
    // their own chains govern cycle detection from here on
    if let Some(mut ctx) = lua.app_data_mut::<StateCtx>() {
        ctx.chain.clear();
    }

    let key = lua
        .create_registry_value(value)
        .map_err(|e| e.to_string())?;
    Ok((lua, key))
}

/// The `await(x)` builtin: forces module promises, passes anything else
/// through.
pub(crate) fn await_builtin(lua: &Lua, v: Value) -> mlua::Result<Value> {
    resolve_promise(lua, v)
}
