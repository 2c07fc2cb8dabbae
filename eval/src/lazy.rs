//! Demand-driven tables: `lazy(fn, seed?)` returns a handle whose
//! indexing calls `fn(self, key)` at most once per key, caching the
//! result (or the error) under that key.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use mlua::{Lua, MetaMethod, MultiValue, UserData, UserDataMethods, Value};
use parking_lot::{Condvar, Mutex};

use crate::zygote;
use crate::{state_eval, value, wait_latch, StateCtx};

/// Keys a lazy table accepts: strings, booleans, and numbers excluding
/// NaN. Floats with integral values collapse onto integers, mirroring
/// Lua table indexing.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum LazyKey {
    Str(Vec<u8>),
    Bool(bool),
    Int(i64),
    Float(u64),
}

impl LazyKey {
    fn from_value(v: &Value) -> Option<LazyKey> {
        match v {
            Value::String(s) => Some(LazyKey::Str(s.as_bytes().to_vec())),
            Value::Boolean(b) => Some(LazyKey::Bool(*b)),
            Value::Integer(n) => Some(LazyKey::Int(*n)),
            Value::Number(f) => {
                if f.is_nan() {
                    None
                } else if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64 {
                    Some(LazyKey::Int(*f as i64))
                } else {
                    Some(LazyKey::Float(f.to_bits()))
                }
            }
            _ => None,
        }
    }

    fn to_value(&self, lua: &Lua) -> mlua::Result<Value> {
        Ok(match self {
            LazyKey::Str(s) => Value::String(lua.create_string(s)?),
            LazyKey::Bool(b) => Value::Boolean(*b),
            LazyKey::Int(n) => Value::Integer(*n),
            LazyKey::Float(bits) => Value::Number(f64::from_bits(*bits)),
        })
    }
}

enum Slot {
    /// A computation is in flight; waiters block on the table's
    /// condvar.
    Pending,
    /// Computed value, held in the owner state's registry.
    Value(mlua::RegistryKey),
    /// The callback returned nil; cached so it isn't retried.
    Nil,
    /// The callback raised; replayed to every reader.
    Error(String),
}

pub(crate) struct LazyTable {
    /// State the callback and cached values live in.
    owner: Lua,
    func: Option<mlua::RegistryKey>,
    storage: Mutex<HashMap<LazyKey, Slot>>,
    cond: Condvar,
    /// Self-reference handed to the callback as its first argument.
    self_weak: Weak<LazyTable>,
}

/// The handle userdata. It holds the table weakly: the strong reference
/// lives in the evaluator, so closing the evaluator releases the owner
/// states despite handles still floating around in Lua values.
#[derive(Clone)]
pub(crate) struct LazyHandle(pub Weak<LazyTable>);

impl LazyHandle {
    fn table(&self) -> mlua::Result<Arc<LazyTable>> {
        self.0
            .upgrade()
            .ok_or_else(|| mlua::Error::RuntimeError("evaluator is closed".to_string()))
    }
}

/// The `lazy(fn, seed?)` builtin.
pub(crate) fn lazy_builtin(
    lua: &Lua,
    (func, seed): (mlua::Function, Option<mlua::Table>),
) -> mlua::Result<Value> {
    let inner = state_eval(lua)?;

    let func_key = lua.create_registry_value(func)?;
    let table = Arc::new_cyclic(|self_weak| LazyTable {
        owner: lua.clone(),
        func: Some(func_key),
        storage: Mutex::new(HashMap::new()),
        cond: Condvar::new(),
        self_weak: self_weak.clone(),
    });

    // seed tables populate valid keys up front, freezing each value
    if let Some(seed) = seed {
        let mut storage = table.storage.lock();
        for pair in seed.pairs::<Value, Value>() {
            let (k, v) = pair?;
            let Some(key) = LazyKey::from_value(&k) else {
                continue;
            };
            let slot = match v {
                Value::Nil => Slot::Nil,
                v => {
                    let v = zygote::freeze(lua, v)?;
                    Slot::Value(lua.create_registry_value(v)?)
                }
            };
            storage.insert(key, slot);
        }
    }

    inner.lazies.lock().push(table.clone());
    let ud = lua.create_userdata(LazyHandle(Arc::downgrade(&table)))?;
    Ok(Value::UserData(ud))
}

impl UserData for LazyHandle {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, |lua, this, key: Value| {
            this.index(lua, key)
        });
    }
}

impl LazyHandle {
    fn index(&self, lua: &Lua, key: Value) -> mlua::Result<Value> {
        let table = self.table()?;

        let Some(key) = LazyKey::from_value(&key) else {
            return Ok(Value::Nil);
        };

        let (base, request) = {
            let ctx = lua
                .app_data_ref::<StateCtx>()
                .ok_or_else(|| mlua::Error::RuntimeError("state has no evaluator".into()))?;
            let inner = ctx.eval()?;
            (inner.cancel.clone(), ctx.request.clone())
        };

        loop {
            {
                let mut storage = table.storage.lock();
                match storage.get(&key) {
                    Some(Slot::Value(stored)) => {
                        let v: Value = table.owner.registry_value(stored)?;
                        drop(storage);
                        return value::xmove(&table.owner, lua, v);
                    }
                    Some(Slot::Nil) => return Ok(Value::Nil),
                    Some(Slot::Error(msg)) => {
                        return Err(mlua::Error::RuntimeError(msg.clone()))
                    }
                    Some(Slot::Pending) => {
                        // fall through to the latch wait below
                    }
                    None => {
                        // claim the key; the storage lock is released
                        // across the user callback
                        storage.insert(key.clone(), Slot::Pending);
                        drop(storage);

                        let slot = table.compute(&key);
                        let mut storage = table.storage.lock();
                        storage.insert(key.clone(), slot);
                        drop(storage);
                        table.cond.notify_all();
                        continue;
                    }
                }
            }

            // someone else is computing this key
            wait_latch(&table.storage, &table.cond, &base, &request, |storage| {
                !matches!(storage.get(&key), Some(Slot::Pending))
            })?;
        }
    }
}

impl LazyTable {
    /// Runs the callback for `key` in the owner state.
    fn compute(&self, key: &LazyKey) -> Slot {
        match self.compute_inner(key) {
            Ok(slot) => slot,
            Err(e) => Slot::Error(e.to_string()),
        }
    }

    fn compute_inner(&self, key: &LazyKey) -> mlua::Result<Slot> {
        let func_key = self
            .func
            .as_ref()
            .ok_or_else(|| mlua::Error::RuntimeError("lazy table has no callback".into()))?;
        let func: mlua::Function = self.owner.registry_value(func_key)?;

        // `self` as seen by the callback: a fresh handle in the owner
        // state sharing this table
        let self_ud = self
            .owner
            .create_userdata(LazyHandle(self.self_weak.clone()))?;

        let key_value = key.to_value(&self.owner)?;
        let results: MultiValue = func.call((self_ud, key_value))?;
        let result = results.into_iter().next().unwrap_or(Value::Nil);

        Ok(match result {
            Value::Nil => Slot::Nil,
            v => {
                let v = zygote::freeze(&self.owner, v)?;
                Slot::Value(self.owner.create_registry_value(v)?)
            }
        })
    }
}
