//! String context: the set of store objects and derivation outputs a
//! string semantically references.
//!
//! Stock Lua offers no side-band slot on string values, so context is
//! held evaluator-wide: builtins that mint store references register the
//! minted token (a store path, or a placeholder standing in for an
//! output path), and a string's context is the set of tags whose token
//! occurs in its bytes. Every token embeds a 32-character digest or a
//! 52-character placeholder hash, so accidental matches are not a
//! practical concern, and propagation through concatenation and
//! substring operations is automatic.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use bstr::ByteSlice;
use parking_lot::RwLock;

use zb_store::derivation::OutputRef;
use zb_store::StorePath;

/// One element of a string's context.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ContextTag {
    /// A direct dependency on a store path.
    Path(StorePath),
    /// A dependency on a specific output of a derivation.
    Output(OutputRef),
}

impl fmt::Display for ContextTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextTag::Path(p) => write!(f, "{}", p),
            ContextTag::Output(r) => write!(f, "!{}!{}", r.drv, r.output),
        }
    }
}

#[derive(Default)]
pub struct ContextRegistry {
    /// Token bytes to the tags the token denotes.
    tokens: RwLock<BTreeMap<Vec<u8>, BTreeSet<ContextTag>>>,
}

impl ContextRegistry {
    /// Registers a store path; its absolute path string becomes a
    /// context token.
    pub fn register_path(&self, path: &StorePath) {
        self.tokens
            .write()
            .entry(path.as_str().as_bytes().to_vec())
            .or_default()
            .insert(ContextTag::Path(path.clone()));
    }

    /// Registers an output placeholder (or fixed output path) string as
    /// denoting a derivation output.
    pub fn register_output(&self, token: &str, output: OutputRef) {
        self.tokens
            .write()
            .entry(token.as_bytes().to_vec())
            .or_default()
            .insert(ContextTag::Output(output));
    }

    /// Computes the context of a string: every tag whose token occurs
    /// in it.
    pub fn scan(&self, haystack: &[u8]) -> BTreeSet<ContextTag> {
        let tokens = self.tokens.read();
        let mut out = BTreeSet::new();
        for (token, tags) in tokens.iter() {
            if token.len() <= haystack.len() && haystack.find(token).is_some() {
                out.extend(tags.iter().cloned());
            }
        }
        out
    }

    /// If `s` starts with a registered output token (an
    /// `UnknownCAOutputPlaceholder` in its context), returns the token
    /// and the output it denotes. The longest matching token wins.
    pub fn placeholder_prefix(&self, s: &str) -> Option<(String, OutputRef)> {
        let tokens = self.tokens.read();
        let mut best: Option<(&[u8], &ContextTag)> = None;
        for (token, tags) in tokens.iter() {
            if !s.as_bytes().starts_with(token) {
                continue;
            }
            for tag in tags {
                if matches!(tag, ContextTag::Output(_))
                    && best.map_or(true, |(t, _)| t.len() < token.len())
                {
                    best = Some((token, tag));
                }
            }
        }
        best.map(|(token, tag)| match tag {
            ContextTag::Output(r) => (String::from_utf8_lossy(token).into_owned(), r.clone()),
            ContextTag::Path(_) => unreachable!(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> StorePath {
        StorePath::parse(s).unwrap()
    }

    #[test]
    fn scan_finds_registered_tokens() {
        let reg = ContextRegistry::default();
        let p = path("/zb/store/00bgd045z0d4icpbc2yyz4gx48ak44la-dep");
        reg.register_path(&p);

        let hay = format!("prefix {} suffix", p);
        assert_eq!(
            reg.scan(hay.as_bytes()),
            BTreeSet::from([ContextTag::Path(p.clone())])
        );

        // concatenation keeps the context, unrelated strings have none
        assert!(reg.scan(b"no references here").is_empty());
        let concatenated = format!("{}/bin/tool", p);
        assert_eq!(reg.scan(concatenated.as_bytes()).len(), 1);
    }

    #[test]
    fn output_tokens_and_prefixes() {
        let reg = ContextRegistry::default();
        let drv = path("/zb/store/00bgd045z0d4icpbc2yyz4gx48ak44la-hello.drv");
        let output = OutputRef::new(drv, "out");
        let placeholder =
            zb_store::derivation::unknown_ca_output_placeholder(&output);
        reg.register_output(&placeholder, output.clone());

        let s = format!("{}/share/doc", placeholder);
        assert_eq!(
            reg.scan(s.as_bytes()),
            BTreeSet::from([ContextTag::Output(output.clone())])
        );

        let (token, found) = reg.placeholder_prefix(&s).expect("prefix must match");
        assert_eq!(token, placeholder);
        assert_eq!(found, output);

        assert!(reg.placeholder_prefix("/somewhere/else").is_none());
    }

    #[test]
    fn tag_formatting() {
        let p = path("/zb/store/00bgd045z0d4icpbc2yyz4gx48ak44la-dep");
        assert_eq!(
            ContextTag::Path(p.clone()).to_string(),
            "/zb/store/00bgd045z0d4icpbc2yyz4gx48ak44la-dep"
        );
        let drv = path("/zb/store/xp46jjlpnbvqzyqvcwpxlbdzlmzqc12c-hello.drv");
        assert_eq!(
            ContextTag::Output(OutputRef::new(drv, "out")).to_string(),
            "!/zb/store/xp46jjlpnbvqzyqvcwpxlbdzlmzqc12c-hello.drv!out"
        );
    }
}
