//! Store path construction from content fingerprints.
//!
//! A path digest is computed by hashing an ASCII fingerprint
//! `<type>{:<ref>}*{:self}?:<hash>:<dir>:<name>` with sha256, compressing
//! the digest to 20 bytes, and nixbase32-encoding it.

use std::collections::BTreeSet;

use sha2::{Digest, Sha256};

use crate::ca::ContentAddress;
use crate::hash::{Hash, HashAlgo};
use crate::nixbase32;

use super::{Directory, Error, StorePath};

/// References from a store object to other store objects, as they factor
/// into path construction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct References {
    /// The object refers to its own store path.
    pub self_reference: bool,
    /// Other store objects the object refers to.
    pub others: BTreeSet<StorePath>,
}

impl References {
    pub fn is_empty(&self) -> bool {
        !self.self_reference && self.others.is_empty()
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum BuildStorePathError {
    #[error("invalid content address: {0}")]
    InvalidContentAddress(String),
    #[error(transparent)]
    InvalidPath(#[from] Error),
}

/// compress_hash takes an arbitrarily long sequence of bytes (usually a
/// hash digest), and returns a sequence of bytes of length N.
///
/// It's calculated by rotating through the bytes in the output buffer
/// (zero-initialized), and XOR'ing with each byte of the passed input.
pub fn compress_hash<const N: usize>(input: &[u8]) -> [u8; N] {
    let mut output = [0; N];

    for (i, ch) in input.iter().enumerate() {
        output[i % N] ^= ch;
    }

    output
}

/// Builds a store path from a fingerprint type (already carrying any
/// references), a content hash and a name.
pub fn make_store_path(
    dir: &Directory,
    fingerprint_type: &str,
    hash: &Hash,
    name: &str,
) -> Result<StorePath, Error> {
    super::validate_name(name)?;

    let fingerprint = format!(
        "{}:{}:{}:{}",
        fingerprint_type,
        hash.to_typed_base16_string(),
        dir.as_str(),
        name
    );
    let digest = compress_hash::<20>(&Sha256::digest(fingerprint.as_bytes()));

    dir.object(&format!("{}-{}", nixbase32::encode(&digest), name))
}

/// Renders the `<type>{:<ref>}*{:self}?` part of a fingerprint.
fn fingerprint_type(base: &str, refs: &References) -> String {
    let mut out = base.to_string();
    for reference in &refs.others {
        out.push(':');
        out.push_str(reference.as_str());
    }
    if refs.self_reference {
        out.push_str(":self");
    }
    out
}

/// Computes the store path of a fixed content-addressed object.
///
/// Dispatches on the kind of content address:
///  - text objects hash with type `text` and their references; they must
///    use sha256 and may not reference themselves,
///  - "source" objects (recursive sha256) hash with type `source` and
///    their references,
///  - any other fixed content address first derives an intermediate
///    `fixed:out:` hash and uses type `output:out`; such objects may not
///    have references.
pub fn fixed_ca_output_path(
    dir: &Directory,
    name: &str,
    ca: &ContentAddress,
    refs: &References,
) -> Result<StorePath, BuildStorePathError> {
    match ca {
        ContentAddress::Text(hash) => {
            if hash.algo() != HashAlgo::Sha256 {
                return Err(BuildStorePathError::InvalidContentAddress(format!(
                    "text objects must use sha256, got {}",
                    hash.algo()
                )));
            }
            if refs.self_reference {
                return Err(BuildStorePathError::InvalidContentAddress(
                    "text objects may not reference themselves".into(),
                ));
            }
            Ok(make_store_path(
                dir,
                &fingerprint_type("text", refs),
                hash,
                name,
            )?)
        }
        _ if ca.is_source() => Ok(make_store_path(
            dir,
            &fingerprint_type("source", refs),
            ca.hash(),
            name,
        )?),
        _ => {
            if !refs.is_empty() {
                return Err(BuildStorePathError::InvalidContentAddress(
                    "fixed outputs may not have references".into(),
                ));
            }
            let inner = Hash::Sha256(
                Sha256::digest(
                    format!(
                        "fixed:out:{}{}:",
                        ca.method().prefix(),
                        ca.hash().to_typed_base16_string()
                    )
                    .as_bytes(),
                )
                .into(),
            );
            Ok(make_store_path(dir, "output:out", &inner, name)?)
        }
    }
}
