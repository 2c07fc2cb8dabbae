//! Emission of the canonical ATerm form:
//!
//! ```plain
//! Derive([<outputs>], [<input-derivations>], [<input-sources>],
//!        <system>, <builder>, [<args>], [<env>])
//! ```
//!
//! Output maps, input-derivation maps and env maps are emitted in
//! ascending key order; all lists are sorted.

use std::io::{self, Write};

use crate::aterm::escape_string;

use super::Derivation;

pub(crate) const DERIVE_PREFIX: &str = "Derive";

fn write_quoted(w: &mut impl Write, s: &str) -> io::Result<()> {
    w.write_all(b"\"")?;
    w.write_all(escape_string(s).as_bytes())?;
    w.write_all(b"\"")
}

fn write_string_list<'a>(
    w: &mut impl Write,
    items: impl IntoIterator<Item = &'a str>,
) -> io::Result<()> {
    w.write_all(b"[")?;
    for (i, item) in items.into_iter().enumerate() {
        if i > 0 {
            w.write_all(b",")?;
        }
        write_quoted(w, item)?;
    }
    w.write_all(b"]")
}

/// Writes the whole derivation. `output_fields` carries the
/// pre-rendered `(name, path, hash-algo, hash)` tuple per output, in
/// ascending name order.
pub(crate) fn write_derivation(
    w: &mut impl Write,
    drv: &Derivation,
    output_fields: &[(String, String, String, String)],
) -> io::Result<()> {
    w.write_all(DERIVE_PREFIX.as_bytes())?;
    w.write_all(b"(")?;

    // outputs
    w.write_all(b"[")?;
    for (i, (name, path, algo, digest)) in output_fields.iter().enumerate() {
        if i > 0 {
            w.write_all(b",")?;
        }
        w.write_all(b"(")?;
        write_quoted(w, name)?;
        w.write_all(b",")?;
        write_quoted(w, path)?;
        w.write_all(b",")?;
        write_quoted(w, algo)?;
        w.write_all(b",")?;
        write_quoted(w, digest)?;
        w.write_all(b")")?;
    }
    w.write_all(b"],")?;

    // input derivations
    w.write_all(b"[")?;
    for (i, (drv_path, outputs)) in drv.input_derivations.iter().enumerate() {
        if i > 0 {
            w.write_all(b",")?;
        }
        w.write_all(b"(")?;
        write_quoted(w, drv_path.as_str())?;
        w.write_all(b",")?;
        write_string_list(w, outputs.iter().map(String::as_str))?;
        w.write_all(b")")?;
    }
    w.write_all(b"],")?;

    // input sources
    write_string_list(w, drv.input_sources.iter().map(|p| p.as_str()))?;
    w.write_all(b",")?;

    write_quoted(w, &drv.system)?;
    w.write_all(b",")?;
    write_quoted(w, &drv.builder)?;
    w.write_all(b",")?;

    write_string_list(w, drv.args.iter().map(String::as_str))?;
    w.write_all(b",")?;

    // environment
    w.write_all(b"[")?;
    for (i, (k, v)) in drv.env.iter().enumerate() {
        if i > 0 {
            w.write_all(b",")?;
        }
        w.write_all(b"(")?;
        write_quoted(w, k)?;
        w.write_all(b",")?;
        write_quoted(w, v)?;
        w.write_all(b")")?;
    }
    w.write_all(b"]")?;

    w.write_all(b")")
}
