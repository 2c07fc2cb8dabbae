//! Value snapshots and cross-state marshaling.
//!
//! Each worker state is its own Lua universe; module promises and lazy
//! tables hand values between universes by deep copy. Functions cannot
//! be copied, so they are wrapped as callbacks that re-enter their home
//! state; opaque zb handles travel by sharing their Rust core.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ffi::c_void;

use mlua::{Lua, MultiValue, Table, Value};

use crate::{derivation::DrvHandle, lazy::LazyHandle, module::ModuleHandle, EvalInner};

/// Limit on structure depth when copying or snapshotting, to keep
/// runaway recursive structures from exhausting the stack.
const MAX_DEPTH: usize = 200;

fn too_deep() -> mlua::Error {
    mlua::Error::RuntimeError("value is nested too deeply".to_string())
}

/// A state-independent snapshot of an evaluation result.
#[derive(Clone, Debug, PartialEq)]
pub enum EvalValue {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    String {
        value: String,
        /// Context tags, in their textual form (a store path, or
        /// `!<drv>!<output>`).
        context: BTreeSet<String>,
    },
    /// Key/value pairs in table iteration order.
    Table(Vec<(EvalValue, EvalValue)>),
    Derivation {
        drv_path: String,
        outputs: BTreeMap<String, String>,
    },
    Function,
    Opaque(&'static str),
}

impl EvalValue {
    /// Convenience accessor for string results.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            EvalValue::String { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            EvalValue::Int(n) => Some(*n),
            _ => None,
        }
    }
}

/// Snapshots a Lua value into state-independent form.
pub(crate) fn snapshot(
    inner: &EvalInner,
    lua: &Lua,
    value: &Value,
) -> mlua::Result<EvalValue> {
    snapshot_at(inner, lua, value, 0)
}

fn snapshot_at(
    inner: &EvalInner,
    lua: &Lua,
    value: &Value,
    depth: usize,
) -> mlua::Result<EvalValue> {
    if depth > MAX_DEPTH {
        return Err(too_deep());
    }

    Ok(match value {
        Value::Nil => EvalValue::Nil,
        Value::Boolean(b) => EvalValue::Bool(*b),
        Value::Integer(n) => EvalValue::Int(*n),
        Value::Number(n) => EvalValue::Float(*n),
        Value::String(s) => {
            let bytes = s.as_bytes().to_vec();
            let context = inner
                .contexts
                .scan(&bytes)
                .into_iter()
                .map(|t| t.to_string())
                .collect();
            EvalValue::String {
                value: String::from_utf8_lossy(&bytes).into_owned(),
                context,
            }
        }
        Value::Table(t) => {
            let mut entries = Vec::new();
            let table = t.clone();
            for pair in table.pairs::<Value, Value>() {
                let (k, v) = pair?;
                entries.push((
                    snapshot_at(inner, lua, &k, depth + 1)?,
                    snapshot_at(inner, lua, &v, depth + 1)?,
                ));
            }
            EvalValue::Table(entries)
        }
        Value::Function(_) => EvalValue::Function,
        Value::UserData(ud) => {
            if let Ok(drv) = ud.borrow::<DrvHandle>() {
                EvalValue::Derivation {
                    drv_path: drv.data().drv_path.to_string(),
                    outputs: drv.data().outputs.clone(),
                }
            } else if ud.is::<ModuleHandle>() {
                EvalValue::Opaque("module")
            } else if ud.is::<LazyHandle>() {
                EvalValue::Opaque("lazy")
            } else {
                EvalValue::Opaque("userdata")
            }
        }
        _ => EvalValue::Opaque("value"),
    })
}

/// Copies `value` (which lives in `src`) into `dst`.
///
/// Scalars and strings copy; tables deep-copy with sharing preserved
/// through `memo`; functions become callbacks that re-enter `src`;
/// zb handles re-wrap their shared core.
pub(crate) fn xmove(src: &Lua, dst: &Lua, value: Value) -> mlua::Result<Value> {
    let mut memo = HashMap::new();
    xmove_at(src, dst, value, &mut memo, 0)
}

fn xmove_at(
    src: &Lua,
    dst: &Lua,
    value: Value,
    memo: &mut HashMap<*const c_void, Table>,
    depth: usize,
) -> mlua::Result<Value> {
    if depth > MAX_DEPTH {
        return Err(too_deep());
    }

    Ok(match value {
        Value::Nil => Value::Nil,
        v @ (Value::Boolean(_) | Value::Integer(_) | Value::Number(_)) => v,
        Value::String(s) => Value::String(dst.create_string(&*s.as_bytes())?),
        Value::Table(t) => {
            let key = t.to_pointer();
            if let Some(copied) = memo.get(&key) {
                return Ok(Value::Table(copied.clone()));
            }
            let copied = dst.create_table()?;
            memo.insert(key, copied.clone());
            let entries = t.clone();
            for pair in entries.pairs::<Value, Value>() {
                let (k, v) = pair?;
                let k = xmove_at(src, dst, k, memo, depth + 1)?;
                let v = xmove_at(src, dst, v, memo, depth + 1)?;
                copied.raw_set(k, v)?;
            }
            // metatables travel too: a module may hand out tables whose
            // behavior (deferred indexing, frozenness) lives there
            if let Some(mt) = t.metatable() {
                if let Value::Table(mt_copy) =
                    xmove_at(src, dst, Value::Table(mt), memo, depth + 1)?
                {
                    crate::zygote::set_metatable(dst, &copied, mt_copy)?;
                }
            }
            Value::Table(copied)
        }
        Value::Function(f) => {
            // A callback that marshals its arguments into the home
            // state, runs the function there, and marshals the results
            // back out.
            let home = src.clone();
            let wrapped = dst.create_function(move |caller, args: MultiValue| {
                let mut home_args = Vec::with_capacity(args.len());
                for arg in args {
                    home_args.push(xmove(caller, &home, arg)?);
                }
                let results: MultiValue =
                    f.call(MultiValue::from_vec(home_args))?;
                let mut out = Vec::with_capacity(results.len());
                for r in results {
                    out.push(xmove(&home, caller, r)?);
                }
                Ok(MultiValue::from_vec(out))
            })?;
            Value::Function(wrapped)
        }
        Value::UserData(ud) => {
            if let Ok(drv) = ud.borrow::<DrvHandle>() {
                Value::UserData(dst.create_userdata((*drv).clone())?)
            } else if let Ok(module) = ud.borrow::<ModuleHandle>() {
                Value::UserData(dst.create_userdata((*module).clone())?)
            } else if let Ok(lazy) = ud.borrow::<LazyHandle>() {
                Value::UserData(dst.create_userdata((*lazy).clone())?)
            } else {
                return Err(mlua::Error::RuntimeError(
                    "cannot transfer foreign userdata between modules".to_string(),
                ));
            }
        }
        _ => {
            return Err(mlua::Error::RuntimeError(
                "cannot transfer this value between modules".to_string(),
            ))
        }
    })
}

/// Converts a snapshot back into a Lua value. Used for stashed
/// derivation arguments, which are stored state-independently.
pub(crate) fn to_lua(lua: &Lua, value: &EvalValue) -> mlua::Result<Value> {
    Ok(match value {
        EvalValue::Nil => Value::Nil,
        EvalValue::Bool(b) => Value::Boolean(*b),
        EvalValue::Int(n) => Value::Integer(*n),
        EvalValue::Float(f) => Value::Number(*f),
        EvalValue::String { value, .. } => Value::String(lua.create_string(value)?),
        EvalValue::Table(entries) => {
            let t = lua.create_table()?;
            for (k, v) in entries {
                let k = to_lua(lua, k)?;
                let v = to_lua(lua, v)?;
                if !matches!(k, Value::Nil) {
                    t.raw_set(k, v)?;
                }
            }
            Value::Table(t)
        }
        EvalValue::Derivation { drv_path, .. } => Value::String(lua.create_string(drv_path)?),
        EvalValue::Function | EvalValue::Opaque(_) => Value::Nil,
    })
}

/// Requires a UTF-8 Lua string.
pub(crate) fn utf8_string(s: &mlua::String, what: &str) -> mlua::Result<String> {
    String::from_utf8(s.as_bytes().to_vec())
        .map_err(|_| mlua::Error::RuntimeError(format!("{} must be valid UTF-8", what)))
}
