//! Derivations: serialized, hermetic build actions whose store path is a
//! function of their canonical ATerm form.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;

use crate::ca::ContentAddress;
use crate::export::Trailer;
use crate::hash::{Hash, HashAlgo};
use crate::nar;
use crate::store_path::{
    fixed_ca_output_path, BuildStorePathError, Directory, References, StorePath,
};

mod output;
mod parser;
mod placeholder;
mod validate;
mod write;

pub use output::Output;
pub use parser::ParseError;
pub use placeholder::{hash_placeholder, unknown_ca_output_placeholder};

/// The output name a derivation gets when the user doesn't say
/// otherwise.
pub const DEFAULT_OUTPUT_NAME: &str = "out";

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum DerivationError {
    #[error("derivation has no outputs")]
    NoOutputs,
    #[error("invalid output name {0:?}")]
    InvalidOutputName(String),
    #[error("fixed-output derivations must have a single output named {DEFAULT_OUTPUT_NAME}")]
    InvalidFixedOutputs,
    #[error("floating output {0:?} may not use a text content address")]
    TextFloatingOutput(String),
    #[error("input derivation {0:?} is not a derivation path")]
    InvalidInputDerivation(String),
    #[error("input derivation {drv:?} has invalid output name {output:?}")]
    InvalidInputDerivationOutput { drv: String, output: String },
    #[error("input {0:?} is outside the derivation's store directory")]
    InputOutsideStore(String),
    #[error("derivation system is empty")]
    EmptySystem,
    #[error("derivation builder is empty")]
    EmptyBuilder,
    #[error("derivation environment has an empty key")]
    EmptyEnvironmentKey,
    #[error("computing output path: {0}")]
    OutputPath(#[from] BuildStorePathError),
}

/// A build action: builder, arguments, environment and inputs, with one
/// or more named outputs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Derivation {
    /// Store directory every input and output of this derivation lives
    /// in.
    pub dir: Directory,
    /// Name of the derivation; its store object is named
    /// `<name>.drv`.
    pub name: String,
    pub system: String,
    /// Path to the executable that performs the build.
    pub builder: String,
    pub args: Vec<String>,
    /// Environment of the builder. Serialized in sorted key order.
    pub env: BTreeMap<String, String>,
    /// Store paths this derivation reads directly.
    pub input_sources: BTreeSet<StorePath>,
    /// Derivation path to the set of its output names used.
    pub input_derivations: BTreeMap<StorePath, BTreeSet<String>>,
    pub outputs: BTreeMap<String, Output>,
}

/// A reference to one output of a derivation.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutputRef {
    pub drv: StorePath,
    pub output: String,
}

impl OutputRef {
    pub fn new(drv: StorePath, output: impl Into<String>) -> OutputRef {
        OutputRef {
            drv,
            output: output.into(),
        }
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}", self.drv, self.output)
    }
}

impl FromStr for OutputRef {
    type Err = crate::store_path::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (drv, output) = s
            .rsplit_once('!')
            .ok_or_else(|| crate::store_path::Error::NotAbsolute(s.to_string()))?;
        Ok(OutputRef {
            drv: StorePath::parse(drv)?,
            output: output.to_string(),
        })
    }
}

/// Result of [Derivation::export]: the derivation wrapped in a
/// single-file NAR, ready to be imported into a store.
#[derive(Clone, Debug)]
pub struct ExportedDerivation {
    pub nar: Vec<u8>,
    pub trailer: Trailer,
    /// Hash of the NAR bytes with the requested algorithm.
    pub nar_hash: Hash,
}

impl Derivation {
    /// An empty derivation skeleton for the given directory and name.
    pub fn new(dir: Directory, name: impl Into<String>) -> Derivation {
        Derivation {
            dir,
            name: name.into(),
            system: String::new(),
            builder: String::new(),
            args: Vec::new(),
            env: BTreeMap::new(),
            input_sources: BTreeSet::new(),
            input_derivations: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    /// The store object name, `<name>.drv`.
    pub fn object_name(&self) -> String {
        format!("{}{}", self.name, crate::store_path::DERIVATION_EXT)
    }

    /// The name of the store object an output produces:
    /// the derivation name, plus `-<output>` for non-default outputs.
    pub fn output_object_name(&self, output_name: &str) -> String {
        if output_name == DEFAULT_OUTPUT_NAME {
            self.name.clone()
        } else {
            format!("{}-{}", self.name, output_name)
        }
    }

    /// The store path of a fixed output, or `None` for floating outputs
    /// (whose path is unknown until realization).
    pub fn fixed_output_path(
        &self,
        output_name: &str,
    ) -> Option<Result<StorePath, BuildStorePathError>> {
        let output = self.outputs.get(output_name)?;
        let ca = match output {
            Output::Fixed(ca) => ca,
            Output::Floating { .. } => return None,
        };
        Some(fixed_ca_output_path(
            &self.dir,
            &self.output_object_name(output_name),
            ca,
            &References::default(),
        ))
    }

    /// All input paths: sources plus input derivation paths. This is the
    /// reference set of the derivation's own store object.
    pub fn input_references(&self) -> References {
        References {
            self_reference: false,
            others: self
                .input_sources
                .iter()
                .chain(self.input_derivations.keys())
                .cloned()
                .collect(),
        }
    }

    /// Serializes to canonical ATerm form.
    pub fn to_aterm_bytes(&self) -> Result<Vec<u8>, DerivationError> {
        let mut buffer = Vec::new();
        // Writes to a Vec cannot fail.
        self.serialize_impl(&mut buffer)?
            .expect("unexpected write error to Vec");
        Ok(buffer)
    }

    /// Writes the canonical ATerm form to `writer`.
    pub fn serialize(&self, writer: &mut impl Write) -> io::Result<()> {
        self.serialize_impl(writer)
            .map_err(io::Error::other)?
    }

    /// Nested result: the outer layer is derivation-shaped failures
    /// (output path computation), the inner one I/O.
    fn serialize_impl(
        &self,
        writer: &mut impl Write,
    ) -> Result<io::Result<()>, DerivationError> {
        // Fixed output paths materialize in the serialization; compute
        // them up front so I/O and validation errors stay separate.
        let mut output_fields = Vec::new();
        for (output_name, output) in &self.outputs {
            let (path, algo, digest) = match output {
                Output::Fixed(ca) => {
                    let path = fixed_ca_output_path(
                        &self.dir,
                        &self.output_object_name(output_name),
                        ca,
                        &References::default(),
                    )?;
                    (
                        path.as_str().to_string(),
                        format!("{}{}", ca.method().prefix(), ca.hash().algo()),
                        ca.hash().to_plain_hex_string(),
                    )
                }
                Output::Floating { method, algo } => (
                    String::new(),
                    format!("{}{}", method.prefix(), algo),
                    String::new(),
                ),
            };
            output_fields.push((output_name.clone(), path, algo, digest));
        }

        Ok(write::write_derivation(writer, self, &output_fields))
    }

    /// Parses a derivation in ATerm form, named `name`, with all paths
    /// expected inside `dir`. The result is validated.
    pub fn parse(dir: &Directory, name: &str, bytes: &[u8]) -> Result<Derivation, ParseError> {
        parser::parse(dir, name, bytes)
    }

    /// The derivation's own store path: the text content address of its
    /// ATerm form, with all inputs as references.
    pub fn store_path(&self) -> Result<StorePath, DerivationError> {
        let aterm = self.to_aterm_bytes()?;
        let ca = ContentAddress::Text(crate::hash::sha256_sum(&aterm));
        Ok(fixed_ca_output_path(
            &self.dir,
            &self.object_name(),
            &ca,
            &self.input_references(),
        )?)
    }

    /// Serializes the derivation for a store: the ATerm bytes wrapped in
    /// a single-file NAR, together with the export trailer naming the
    /// computed store path, references and text content address.
    pub fn export(&self, hash_algo: HashAlgo) -> Result<ExportedDerivation, DerivationError> {
        let aterm = self.to_aterm_bytes()?;

        let mut nar_bytes = Vec::new();
        {
            let node =
                nar::writer::open(&mut nar_bytes).expect("unexpected write error to Vec");
            node.file(false, aterm.len() as u64, &mut &aterm[..])
                .expect("unexpected write error to Vec");
        }
        let nar_hash = crate::hash::sum(hash_algo, &nar_bytes);

        let ca = ContentAddress::Text(crate::hash::sha256_sum(&aterm));
        let refs = self.input_references();
        let store_path = fixed_ca_output_path(&self.dir, &self.object_name(), &ca, &refs)?;

        Ok(ExportedDerivation {
            nar: nar_bytes,
            trailer: Trailer {
                store_path,
                references: refs.others,
                deriver: None,
                content_address: Some(ca),
            },
            nar_hash,
        })
    }
}

#[cfg(test)]
mod tests;
