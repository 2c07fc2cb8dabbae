//! The `derivation{...}` and `toFile` builtins: turning user tables into
//! store objects.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use mlua::{Lua, MetaMethod, MultiValue, UserData, UserDataMethods, Value};
use tracing::{debug, instrument};

use zb_store::ca::ContentAddress;
use zb_store::derivation::{
    hash_placeholder, unknown_ca_output_placeholder, Derivation, Output, OutputRef,
    DEFAULT_OUTPUT_NAME,
};
use zb_store::hash::{sha256_sum, Hash, HashAlgo};
use zb_store::store_path::{fixed_ca_output_path, References};
use zb_store::StorePath;

use crate::context::ContextTag;
use crate::module::ModuleHandle;
use crate::value::{self, EvalValue};
use crate::zygote::{self, soft_error};
use crate::{state_eval, EvalInner};

/// The data behind a `derivation` value.
pub(crate) struct DrvData {
    pub drv_path: StorePath,
    /// Output name to the string its field resolves to: an
    /// `UnknownCAOutputPlaceholder` for floating outputs, the final
    /// path for fixed ones.
    pub outputs: BTreeMap<String, String>,
    /// Snapshot of the argument table, served through `__index`.
    pub args: BTreeMap<String, EvalValue>,
}

/// Userdata handle; shared by all states a derivation value travels to.
#[derive(Clone)]
pub(crate) struct DrvHandle(Arc<DrvData>);

impl DrvHandle {
    pub fn data(&self) -> &DrvData {
        &self.0
    }

    /// The string the default output resolves to.
    fn out_value(&self) -> mlua::Result<&str> {
        self.0
            .outputs
            .get(DEFAULT_OUTPUT_NAME)
            .map(String::as_str)
            .ok_or_else(|| {
                mlua::Error::RuntimeError("derivation has no `out` output".to_string())
            })
    }
}

fn resolve_drv_side(v: &Value) -> Option<mlua::Result<String>> {
    if let Value::UserData(ud) = v {
        if let Ok(drv) = ud.borrow::<DrvHandle>() {
            return Some(drv.out_value().map(str::to_string));
        }
    }
    None
}

impl UserData for DrvHandle {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, |lua, this, key: Value| {
            let key = match &key {
                Value::String(s) => value::utf8_string(s, "derivation key")?,
                _ => return Ok(Value::Nil),
            };

            if key == "drvPath" {
                return Ok(Value::String(
                    lua.create_string(this.0.drv_path.as_str())?,
                ));
            }
            if let Some(out) = this.0.outputs.get(&key) {
                return Ok(Value::String(lua.create_string(out)?));
            }
            match this.0.args.get(&key) {
                Some(v) => value::to_lua(lua, v),
                None => Ok(Value::Nil),
            }
        });

        methods.add_meta_method(MetaMethod::ToString, |lua, this, ()| {
            lua.create_string(this.out_value()?)
        });

        methods.add_meta_function(MetaMethod::Concat, |lua, (a, b): (Value, Value)| {
            let a = match resolve_drv_side(&a) {
                Some(s) => Value::String(lua.create_string(s?)?),
                None => a,
            };
            let b = match resolve_drv_side(&b) {
                Some(s) => Value::String(lua.create_string(s?)?),
                None => b,
            };
            zygote::op(lua, "concat")?.call::<Value>((a, b))
        });
    }
}

/// Converts one derivation argument into its environment string,
/// accumulating the context of every string consumed along the way.
fn to_env_var(
    lua: &Lua,
    inner: &EvalInner,
    v: &Value,
    allow_list: bool,
    context: &mut BTreeSet<ContextTag>,
) -> Result<String, String> {
    match v {
        Value::Boolean(true) => Ok("1".to_string()),
        Value::Boolean(false) => Ok(String::new()),
        Value::Integer(n) => Ok(n.to_string()),
        Value::Number(_) => {
            // numbers render the way Lua would print them
            let s: mlua::String = zygote::op(lua, "tostring")
                .and_then(|f| f.call(v.clone()))
                .map_err(|e| e.to_string())?;
            value::utf8_string(&s, "number").map_err(|e| e.to_string())
        }
        Value::String(s) => {
            let bytes = s.as_bytes().to_vec();
            let text = String::from_utf8(bytes)
                .map_err(|_| "derivation strings must be valid UTF-8".to_string())?;
            context.extend(inner.contexts.scan(text.as_bytes()));
            Ok(text)
        }
        Value::Table(t) => {
            if !allow_list {
                return Err("lists may not contain other lists".to_string());
            }
            // only proper sequences convert; anything else is a
            // mistake we refuse rather than flatten
            let len = t.raw_len() as usize;
            let mut pair_count = 0;
            let table = t.clone();
            for pair in table.pairs::<Value, Value>() {
                pair.map_err(|e| e.to_string())?;
                pair_count += 1;
            }
            if pair_count != len {
                return Err("derivation values must be lists, not tables".to_string());
            }

            let mut parts = Vec::with_capacity(len);
            for i in 1..=len {
                let element: Value = t.raw_get(i).map_err(|e| e.to_string())?;
                parts.push(to_env_var(lua, inner, &element, false, context)?);
            }
            Ok(parts.join(" "))
        }
        Value::UserData(ud) => {
            if let Ok(drv) = ud.borrow::<DrvHandle>() {
                let out = drv.out_value().map_err(|e| e.to_string())?.to_string();
                context.extend(inner.contexts.scan(out.as_bytes()));
                return Ok(out);
            }
            if let Ok(module) = ud.borrow::<ModuleHandle>() {
                let v = module.force(lua).map_err(|e| e.to_string())?;
                return to_env_var(lua, inner, &v, allow_list, context);
            }
            Err("cannot use this value in a derivation".to_string())
        }
        _ => Err(format!(
            "cannot use a {} in a derivation",
            v.type_name()
        )),
    }
}

/// The `derivation{...}` builtin.
#[instrument(skip_all)]
pub(crate) fn derivation_builtin(lua: &Lua, arg: Value) -> mlua::Result<MultiValue> {
    let inner = state_eval(lua)?;

    let table = match &arg {
        Value::Table(t) => t,
        _ => return soft_error(lua, "derivation expects a table"),
    };

    // deterministic processing order: sorted by key
    let mut entries: Vec<(String, Value)> = Vec::new();
    let arg_table = table.clone();
    for pair in arg_table.pairs::<Value, Value>() {
        let (k, v) = pair?;
        match &k {
            Value::String(s) => entries.push((value::utf8_string(s, "derivation key")?, v)),
            _ => return soft_error(lua, "derivation table keys must be strings"),
        }
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut drv = Derivation::new(inner.dir.clone(), "");
    let mut context: BTreeSet<ContextTag> = BTreeSet::new();
    let mut output_hash: Option<String> = None;
    let mut output_hash_mode: Option<String> = None;
    let mut args_snapshot = BTreeMap::new();

    for (key, v) in &entries {
        args_snapshot.insert(key.clone(), value::snapshot(&inner, lua, v)?);

        if key == "args" {
            // command line arguments; they go to args, not the env
            let list = match v {
                Value::Table(t) => t,
                _ => return soft_error(lua, "derivation args must be a list"),
            };
            for i in 1..=(list.raw_len() as usize) {
                let element: Value = list.raw_get(i)?;
                match to_env_var(lua, &inner, &element, false, &mut context) {
                    Ok(s) => drv.args.push(s),
                    Err(msg) => return soft_error(lua, &msg),
                }
            }
            continue;
        }

        let env_value = match to_env_var(lua, &inner, v, true, &mut context) {
            Ok(s) => s,
            Err(msg) => return soft_error(lua, &format!("derivation.{}: {}", key, msg)),
        };

        match key.as_str() {
            "name" => drv.name = env_value.clone(),
            "system" => drv.system = env_value.clone(),
            "builder" => drv.builder = env_value.clone(),
            "outputHash" => output_hash = Some(env_value.clone()),
            "outputHashMode" => output_hash_mode = Some(env_value.clone()),
            _ => {}
        }
        drv.env.insert(key.clone(), env_value);
    }

    if drv.name.is_empty() {
        return soft_error(lua, "derivation needs a non-empty name");
    }

    // the sole output: fixed when a hash is pinned, floating otherwise
    let output = match &output_hash {
        Some(hash_str) => {
            let hash = match Hash::parse(hash_str, None) {
                Ok(h) => h,
                Err(e) => return soft_error(lua, &format!("outputHash: {}", e)),
            };
            match output_hash_mode.as_deref() {
                None | Some("flat") => Output::Fixed(ContentAddress::Flat(hash)),
                Some("recursive") => Output::Fixed(ContentAddress::Recursive(hash)),
                Some(other) => {
                    return soft_error(
                        lua,
                        &format!("invalid outputHashMode {:?}", other),
                    )
                }
            }
        }
        None => Output::floating_default(),
    };
    drv.outputs.insert(DEFAULT_OUTPUT_NAME.to_string(), output);

    // each output's env var carries its placeholder or fixed path
    for (output_name, output) in drv.outputs.clone() {
        let env_value = match output {
            Output::Floating { .. } => hash_placeholder(&output_name),
            Output::Fixed(_) => match drv.fixed_output_path(&output_name) {
                Some(Ok(p)) => p.to_string(),
                Some(Err(e)) => return soft_error(lua, &e.to_string()),
                None => unreachable!("output is fixed"),
            },
        };
        drv.env.insert(output_name, env_value);
    }

    // inputs come from the context of every string consumed above
    for tag in &context {
        match tag {
            ContextTag::Path(p) => {
                drv.input_sources.insert(p.clone());
            }
            ContextTag::Output(r) => {
                drv.input_derivations
                    .entry(r.drv.clone())
                    .or_default()
                    .insert(r.output.clone());
            }
        }
    }

    if let Err(e) = drv.validate() {
        return soft_error(lua, &e.to_string());
    }

    // commit the derivation object to the store
    let exported = match drv.export(HashAlgo::Sha256) {
        Ok(e) => e,
        Err(e) => return soft_error(lua, &e.to_string()),
    };
    let drv_path = exported.trailer.store_path.clone();
    debug!(%drv_path, "exporting derivation");

    let mut stream = Vec::new();
    {
        let mut writer = zb_store::export::Writer::new(&mut stream);
        writer.object().map_err(mlua::Error::external)?;
        std::io::Write::write_all(&mut writer, &exported.nar).map_err(mlua::Error::external)?;
        writer.trailer(&exported.trailer).map_err(mlua::Error::external)?;
        writer.finish().map_err(mlua::Error::external)?;
    }
    if let Err(e) = inner.block_on(inner.store.store_import(&mut &stream[..])) {
        return soft_error(lua, &e.to_string());
    }

    inner.contexts.register_path(&drv_path);

    let mut out_values = BTreeMap::new();
    for (output_name, output) in &drv.outputs {
        let output_ref = OutputRef::new(drv_path.clone(), output_name.clone());
        let field = match output {
            Output::Floating { .. } => unknown_ca_output_placeholder(&output_ref),
            Output::Fixed(_) => match drv.fixed_output_path(output_name) {
                Some(Ok(p)) => p.to_string(),
                _ => unreachable!("validated above"),
            },
        };
        inner.contexts.register_output(&field, output_ref);
        out_values.insert(output_name.clone(), field);
    }

    let handle = DrvHandle(Arc::new(DrvData {
        drv_path,
        outputs: out_values,
        args: args_snapshot,
    }));
    let ud = lua.create_userdata(handle)?;
    Ok(MultiValue::from_vec(vec![Value::UserData(ud)]))
}

/// The `toFile(name, contents)` builtin: a text store object.
#[instrument(skip_all)]
pub(crate) fn to_file_builtin(
    lua: &Lua,
    (name, contents): (String, mlua::String),
) -> mlua::Result<MultiValue> {
    let inner = state_eval(lua)?;
    let bytes = contents.as_bytes().to_vec();

    // context becomes the object's reference set; output references
    // have no final path yet and cannot be stored in a text object
    let mut refs = References::default();
    for tag in inner.contexts.scan(&bytes) {
        match tag {
            ContextTag::Path(p) => {
                refs.others.insert(p);
            }
            ContextTag::Output(_) => {
                return soft_error(
                    lua,
                    "toFile contents may not reference derivation outputs",
                )
            }
        }
    }

    let ca = ContentAddress::Text(sha256_sum(&bytes));
    let store_path = match fixed_ca_output_path(&inner.dir, &name, &ca, &refs) {
        Ok(p) => p,
        Err(e) => return soft_error(lua, &e.to_string()),
    };

    let present = match inner.block_on(inner.store.object_exists(&store_path)) {
        Ok(p) => p,
        Err(e) => return soft_error(lua, &e.to_string()),
    };
    if !present {
        let mut nar = Vec::new();
        {
            let node = zb_store::nar::writer::open(&mut nar).map_err(mlua::Error::external)?;
            node.file(false, bytes.len() as u64, &mut &bytes[..])
                .map_err(mlua::Error::external)?;
        }
        let mut stream = Vec::new();
        {
            let mut writer = zb_store::export::Writer::new(&mut stream);
            writer.object().map_err(mlua::Error::external)?;
            std::io::Write::write_all(&mut writer, &nar).map_err(mlua::Error::external)?;
            writer
                .trailer(&zb_store::export::Trailer {
                    store_path: store_path.clone(),
                    references: refs.others.clone(),
                    deriver: None,
                    content_address: Some(ca),
                })
                .map_err(mlua::Error::external)?;
            writer.finish().map_err(mlua::Error::external)?;
        }
        if let Err(e) = inner.block_on(inner.store.store_import(&mut &stream[..])) {
            return soft_error(lua, &e.to_string());
        }
    }

    inner.contexts.register_path(&store_path);
    Ok(MultiValue::from_vec(vec![Value::String(
        lua.create_string(store_path.as_str())?,
    )]))
}
