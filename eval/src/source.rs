//! Source path resolution and `path(p)`: importing filesystem trees as
//! store objects.

use std::collections::BTreeMap;
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use mlua::{Function, Lua, MultiValue, Value};
use tracing::{debug, instrument};

use zb_store::ca::{source_sha256_content_address, SourceOptions};
use zb_store::derivation::OutputRef;
use zb_store::export::Trailer;
use zb_store::store_path::{fixed_ca_output_path, PathStyle, References};
use zb_store::{nar, StorePath};

use crate::stamp_cache::StampEntry;
use crate::zygote::soft_error;
use crate::{state_eval, value, EvalInner, StateCtx};

/// What a user-supplied source string resolves to.
pub(crate) enum ResolvedPath {
    /// A path on the local filesystem.
    Local(PathBuf),
    /// A path under an unrealized derivation output, kept as a
    /// placeholder until the store realizes it.
    Placeholder {
        output: OutputRef,
        /// Remainder after the placeholder, with leading separator.
        rest: String,
    },
}

/// Resolves a user-supplied string to an absolute filesystem path,
/// relative to the calling code's source file.
pub(crate) fn abs_source_path(
    lua: &Lua,
    inner: &EvalInner,
    s: &str,
) -> Result<ResolvedPath, String> {
    // a placeholder that appears in the string's context keeps its
    // prefix; it is rewritten once the store realizes the output
    if let Some((token, output)) = inner.contexts.placeholder_prefix(s) {
        return Ok(ResolvedPath::Placeholder {
            output,
            rest: s[token.len()..].replace(['/', '\\'], &style_sep()),
        });
    }

    let style = PathStyle::local();
    let (source, in_store) = {
        let ctx = lua.app_data_ref::<StateCtx>();
        let source = ctx.as_ref().and_then(|c| c.source.clone());
        let in_store = source
            .as_deref()
            .and_then(Path::to_str)
            .map(|p| inner.dir.parse_path(p).is_ok())
            .unwrap_or(false);
        (source, in_store)
    };

    let resolved = if style.is_absolute(s) {
        style.clean(s)
    } else {
        // relative to the caller's source directory, or the working
        // directory when there is none
        let base = match &source {
            Some(file) => file
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
            None => std::env::current_dir().map_err(|e| e.to_string())?,
        };
        let joined = base.join(s);
        let joined = joined
            .to_str()
            .ok_or_else(|| "source path is not valid UTF-8".to_string())?;
        if !style.is_absolute(joined) {
            return Err(format!("cannot resolve relative path {:?}", s));
        }
        style.clean(joined)
    };

    // code imported from the store may not escape the store directory
    if in_store && inner.dir.parse_path(&resolved).is_err() {
        return Err(format!(
            "{:?} escapes the store directory {}",
            s, inner.dir
        ));
    }

    Ok(ResolvedPath::Local(PathBuf::from(resolved)))
}

fn style_sep() -> String {
    PathStyle::local().separator().to_string()
}

/// The `path(p)` / `path{...}` builtin.
#[instrument(skip_all)]
pub(crate) fn path_builtin(lua: &Lua, arg: Value) -> mlua::Result<MultiValue> {
    let inner = state_eval(lua)?;

    // argument forms: a plain string, or a table with path/name/filter
    let (raw, name_arg, filter) = match &arg {
        Value::String(s) => (value::utf8_string(s, "path")?, None, None),
        Value::Table(t) => {
            let raw: mlua::String = match t.get("path") {
                Ok(s) => s,
                Err(_) => return soft_error(lua, "path: missing `path` field"),
            };
            let name: Option<String> = t.get("name").ok().flatten();
            let filter: Option<Function> = t.get("filter").ok().flatten();
            (value::utf8_string(&raw, "path")?, name, filter)
        }
        _ => return soft_error(lua, "path expects a string or table"),
    };

    let local = match abs_source_path(lua, &inner, &raw) {
        Ok(ResolvedPath::Local(p)) => p,
        Ok(ResolvedPath::Placeholder { output, rest }) => {
            match realize_placeholder(&inner, output, &rest) {
                Ok(Realized::StorePath(p)) => {
                    inner.contexts.register_path(&p);
                    return string_result(lua, p.as_str());
                }
                Ok(Realized::Local(p)) => p,
                Err(msg) => return soft_error(lua, &msg),
            }
        }
        Err(msg) => return soft_error(lua, &msg),
    };

    // a path naming a store object directly is already imported
    if let Some(p) = as_whole_store_object(&inner, &local) {
        return match inner.block_on(inner.store.object_exists(&p)) {
            Ok(true) => {
                inner.contexts.register_path(&p);
                string_result(lua, p.as_str())
            }
            Ok(false) => soft_error(lua, &format!("store object {} does not exist", p)),
            Err(e) => soft_error(lua, &e.to_string()),
        };
    }

    match import_tree(&inner, &local, name_arg, filter.as_ref()) {
        Ok(path) => {
            inner.contexts.register_path(&path);
            string_result(lua, path.as_str())
        }
        Err(msg) => soft_error(lua, &msg),
    }
}

fn string_result(lua: &Lua, s: &str) -> mlua::Result<MultiValue> {
    Ok(MultiValue::from_vec(vec![Value::String(
        lua.create_string(s)?,
    )]))
}

enum Realized {
    StorePath(StorePath),
    Local(PathBuf),
}

/// Asks the store to realize an output and splices the concrete path in
/// front of the remainder.
fn realize_placeholder(
    inner: &EvalInner,
    output: OutputRef,
    rest: &str,
) -> Result<Realized, String> {
    let results = inner
        .block_on(inner.store.realize(std::slice::from_ref(&output)))
        .map_err(|e| e.to_string())?;
    let built = results
        .into_iter()
        .find(|r| r.output == output)
        .and_then(|r| r.path)
        .ok_or_else(|| format!("build of {} produced no output path", output))?;

    if rest.is_empty() {
        Ok(Realized::StorePath(built))
    } else {
        Ok(Realized::Local(PathBuf::from(format!(
            "{}{}",
            built, rest
        ))))
    }
}

/// Reports whether `p` names a store object itself (not a path inside
/// one, not a path outside the store).
fn as_whole_store_object(inner: &EvalInner, p: &Path) -> Option<StorePath> {
    let s = p.to_str()?;
    match inner.dir.parse_path(s) {
        Ok((path, None)) => Some(path),
        _ => None,
    }
}

/// A walked source tree, shaped for NAR emission.
enum FsTree {
    File {
        executable: bool,
        size: u64,
        source: PathBuf,
    },
    Symlink {
        target: Vec<u8>,
    },
    Dir(BTreeMap<String, FsTree>),
}

/// Imports the tree at `root` into the store, reusing a previous import
/// when the stamp cache proves nothing changed.
fn import_tree(
    inner: &EvalInner,
    root: &Path,
    name_arg: Option<String>,
    filter: Option<&Function>,
) -> Result<StorePath, String> {
    let name = match name_arg {
        Some(n) => n,
        None => root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| format!("cannot derive a name from {:?}", root))?,
    };

    let mut stamps = Vec::new();
    let tree = walk(root, "", filter, &mut stamps)?
        .ok_or_else(|| format!("{:?} was filtered out entirely", root))?;

    let root_str = root.to_string_lossy().into_owned();

    // a prior import with identical stamps is reused if its object is
    // still present
    if let Some(prior) = stamp_lookup(inner, &root_str, &name, &stamps) {
        if let Ok(path) = StorePath::parse(&prior) {
            if inner
                .block_on(inner.store.object_exists(&path))
                .unwrap_or(false)
            {
                debug!(%path, "reusing previous import");
                return Ok(path);
            }
        }
    }

    // serialize the tree and compute its source content address
    let mut nar_bytes = Vec::new();
    {
        let node = nar::writer::open(&mut nar_bytes).map_err(|e| e.to_string())?;
        emit(node, &tree).map_err(|e| e.to_string())?;
    }
    let (ca, _) = source_sha256_content_address(&mut &nar_bytes[..], SourceOptions::default())
        .map_err(|e| e.to_string())?;
    let store_path = fixed_ca_output_path(&inner.dir, &name, &ca, &References::default())
        .map_err(|e| e.to_string())?;

    let present = inner
        .block_on(inner.store.object_exists(&store_path))
        .map_err(|e| e.to_string())?;
    if !present {
        let mut stream = Vec::new();
        {
            let mut writer = zb_store::export::Writer::new(&mut stream);
            writer.object().map_err(|e| e.to_string())?;
            std::io::Write::write_all(&mut writer, &nar_bytes).map_err(|e| e.to_string())?;
            writer
                .trailer(&Trailer {
                    store_path: store_path.clone(),
                    references: Default::default(),
                    deriver: None,
                    content_address: Some(ca),
                })
                .map_err(|e| e.to_string())?;
            writer.finish().map_err(|e| e.to_string())?;
        }
        inner
            .block_on(inner.store.store_import(&mut &stream[..]))
            .map_err(|e| e.to_string())?;
    }

    stamp_record(inner, &root_str, store_path.as_str(), &stamps);
    Ok(store_path)
}

fn stamp_lookup(
    inner: &EvalInner,
    root: &str,
    name: &str,
    stamps: &[StampEntry],
) -> Option<String> {
    let mut guard = inner.stamps.lock();
    let cache = guard.as_mut()?;
    match cache.lookup(root, name, stamps) {
        Ok(hit) => hit,
        Err(e) => {
            debug!("stamp cache lookup failed: {}", e);
            None
        }
    }
}

fn stamp_record(inner: &EvalInner, root: &str, store_path: &str, stamps: &[StampEntry]) {
    let mut guard = inner.stamps.lock();
    if let Some(cache) = guard.as_mut() {
        if let Err(e) = cache.record(root, store_path, stamps) {
            debug!("stamp cache record failed: {}", e);
        }
    }
}

/// Walks one filesystem entry, recording its stamp. Returns `None` when
/// the filter pruned it.
fn walk(
    fs_path: &Path,
    rel: &str,
    filter: Option<&Function>,
    stamps: &mut Vec<StampEntry>,
) -> Result<Option<FsTree>, String> {
    let meta = fs::symlink_metadata(fs_path).map_err(|e| format!("{:?}: {}", fs_path, e))?;

    let (tree, mode, size, stamp) = if meta.file_type().is_symlink() {
        let target = fs::read_link(fs_path).map_err(|e| format!("{:?}: {}", fs_path, e))?;
        let target_bytes = target.to_string_lossy().into_owned().into_bytes();
        let stamp = format!("link:{}", String::from_utf8_lossy(&target_bytes));
        (
            FsTree::Symlink {
                target: target_bytes,
            },
            file_mode(&meta),
            0,
            stamp,
        )
    } else if meta.is_dir() {
        let mut entries = BTreeMap::new();
        let mut names: Vec<(String, PathBuf)> = fs::read_dir(fs_path)
            .map_err(|e| format!("{:?}: {}", fs_path, e))?
            .filter_map(|entry| entry.ok())
            .map(|entry| {
                (
                    entry.file_name().to_string_lossy().into_owned(),
                    entry.path(),
                )
            })
            .collect();
        names.sort_by(|a, b| a.0.cmp(&b.0));

        // the directory's own stamp first, then its children
        stamps.push(StampEntry {
            path: rel.to_string(),
            mode: file_mode(&meta),
            size: 0,
            stamp: "dir".to_string(),
        });

        for (child_name, child_path) in names {
            let child_rel = if rel.is_empty() {
                child_name.clone()
            } else {
                format!("{}/{}", rel, child_name)
            };
            if let Some(f) = filter {
                let keep: bool = f
                    .call((child_rel.clone(), type_name(&child_path)))
                    .map_err(|e| e.to_string())?;
                if !keep {
                    // a pruned directory is skipped entirely
                    continue;
                }
            }
            if let Some(child) = walk(&child_path, &child_rel, filter, stamps)? {
                entries.insert(child_name, child);
            }
        }
        return Ok(Some(FsTree::Dir(entries)));
    } else if meta.is_file() {
        (
            FsTree::File {
                executable: is_executable(&meta),
                size: meta.len(),
                source: fs_path.to_path_buf(),
            },
            file_mode(&meta),
            meta.len(),
            file_stamp(&meta),
        )
    } else {
        return Err(format!("{:?}: unsupported file type", fs_path));
    };

    stamps.push(StampEntry {
        path: rel.to_string(),
        mode,
        size,
        stamp,
    });
    Ok(Some(tree))
}

fn type_name(p: &Path) -> &'static str {
    match fs::symlink_metadata(p) {
        Ok(m) if m.file_type().is_symlink() => "symlink",
        Ok(m) if m.is_dir() => "directory",
        _ => "regular",
    }
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    meta.mode()
}

#[cfg(not(unix))]
fn file_mode(_meta: &fs::Metadata) -> u32 {
    0
}

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    meta.mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &fs::Metadata) -> bool {
    false
}

#[cfg(unix)]
fn file_stamp(meta: &fs::Metadata) -> String {
    use std::os::unix::fs::MetadataExt;
    format!(
        "{}.{:06}-{}-{}-{}-{}-{}",
        meta.mtime(),
        meta.mtime_nsec() / 1_000,
        meta.len(),
        meta.ino(),
        meta.mode(),
        meta.uid(),
        meta.gid(),
    )
}

#[cfg(not(unix))]
fn file_stamp(meta: &fs::Metadata) -> String {
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .unwrap_or_default();
    format!(
        "{}.{:06}-{}",
        mtime.as_secs(),
        mtime.subsec_micros(),
        meta.len()
    )
}

/// Emits a walked tree as a NAR.
fn emit<W: std::io::Write>(node: nar::writer::Node<W>, tree: &FsTree) -> std::io::Result<()> {
    match tree {
        FsTree::File {
            executable,
            size,
            source,
        } => {
            let file = fs::File::open(source)?;
            node.file(*executable, *size, &mut BufReader::new(file))
        }
        FsTree::Symlink { target } => node.symlink(target),
        FsTree::Dir(entries) => {
            let mut dir = node.directory()?;
            for (name, child) in entries {
                let entry = dir.entry(name.as_bytes())?;
                emit(entry, child)?;
            }
            dir.close()
        }
    }
}
