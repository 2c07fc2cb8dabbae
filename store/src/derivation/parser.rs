//! Constructs a [Derivation] by parsing its ATerm serialization.

use std::collections::{BTreeMap, BTreeSet};

use nom::bytes::complete::tag;
use nom::character::complete::char as nomchar;
use nom::combinator::all_consuming;
use nom::multi::{separated_list0, separated_list1};
use nom::sequence::{delimited, preceded, terminated, tuple};
use nom::IResult;

use crate::aterm;
use crate::ca::{ContentAddress, ContentAddressMethod};
use crate::hash::{Hash, HashAlgo};
use crate::store_path::{Directory, StorePath};

use super::{write, Derivation, DerivationError, Output};

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("syntax error {at} bytes into the derivation")]
    Syntax { at: usize },
    #[error("premature end of input")]
    Incomplete,
    #[error("duplicate {what} {name:?}")]
    Duplicate { what: &'static str, name: String },
    #[error("output {name:?}: {problem}")]
    InvalidOutput { name: String, problem: String },
    #[error("invalid store path in derivation: {0}")]
    InvalidPath(#[from] crate::store_path::Error),
    #[error(transparent)]
    Invalid(#[from] DerivationError),
}

/// Raw 4-tuple of an output field: name, path, hash-algo, hash.
type RawOutput = (String, String, String, String);

struct RawDerivation {
    outputs: Vec<RawOutput>,
    input_derivations: Vec<(String, Vec<String>)>,
    input_sources: Vec<String>,
    system: String,
    builder: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

pub(super) fn parse(dir: &Directory, name: &str, bytes: &[u8]) -> Result<Derivation, ParseError> {
    let raw = match all_consuming(parse_raw)(bytes) {
        Ok((_, raw)) => raw,
        Err(nom::Err::Incomplete(_)) => return Err(ParseError::Incomplete),
        Err(nom::Err::Error(e) | nom::Err::Failure(e)) => {
            return Err(ParseError::Syntax {
                at: bytes.len() - e.input.len(),
            })
        }
    };

    let mut drv = Derivation::new(dir.clone(), name);
    drv.system = raw.system;
    drv.builder = raw.builder;
    drv.args = raw.args;

    for (k, v) in raw.env {
        if drv.env.insert(k.clone(), v).is_some() {
            return Err(ParseError::Duplicate {
                what: "environment variable",
                name: k,
            });
        }
    }

    for (output_name, path, algo, digest) in raw.outputs {
        let output = build_output(&drv, &output_name, &path, &algo, &digest)?;
        if drv.outputs.insert(output_name.clone(), output).is_some() {
            return Err(ParseError::Duplicate {
                what: "output",
                name: output_name,
            });
        }
    }

    for (drv_path, outputs) in raw.input_derivations {
        let drv_path = StorePath::parse(&drv_path)?;
        let mut output_names = BTreeSet::new();
        for output in outputs {
            if !output_names.insert(output.clone()) {
                return Err(ParseError::Duplicate {
                    what: "input derivation output",
                    name: output,
                });
            }
        }
        if drv
            .input_derivations
            .insert(drv_path.clone(), output_names)
            .is_some()
        {
            return Err(ParseError::Duplicate {
                what: "input derivation",
                name: drv_path.to_string(),
            });
        }
    }

    for source in raw.input_sources {
        let source = StorePath::parse(&source)?;
        if !drv.input_sources.insert(source.clone()) {
            return Err(ParseError::Duplicate {
                what: "input source",
                name: source.to_string(),
            });
        }
    }

    drv.validate()?;
    Ok(drv)
}

/// Interprets the 4 raw strings of an output field.
fn build_output(
    drv: &Derivation,
    output_name: &str,
    path: &str,
    algo_and_method: &str,
    digest: &str,
) -> Result<Output, ParseError> {
    let invalid = |problem: &str| ParseError::InvalidOutput {
        name: output_name.to_string(),
        problem: problem.to_string(),
    };

    if algo_and_method.is_empty() {
        // zb derivations are content-addressed throughout; an output
        // with no hash algorithm (Nix's input-addressed form) is not
        // one of ours.
        return Err(invalid("missing hash algorithm"));
    }

    let (method, algo_str) = ContentAddressMethod::parse_prefix(algo_and_method);
    let algo: HashAlgo = algo_str
        .parse()
        .map_err(|e| invalid(&format!("{}", e)))?;

    if digest.is_empty() {
        if !path.is_empty() {
            return Err(invalid("floating output with a path"));
        }
        return Ok(Output::Floating { method, algo });
    }

    let hash = Hash::parse(digest, Some(algo)).map_err(|e| invalid(&format!("{}", e)))?;
    let ca = match method {
        ContentAddressMethod::Flat => ContentAddress::Flat(hash),
        ContentAddressMethod::Recursive => ContentAddress::Recursive(hash),
        ContentAddressMethod::Text => ContentAddress::Text(hash),
    };

    let output = Output::Fixed(ca);

    // the serialized path must agree with the one the content address
    // determines
    let expected = drv
        .fixed_output_path_for(output_name, &output)
        .map_err(|e| invalid(&format!("{}", e)))?;
    if path != expected.as_str() {
        return Err(invalid(&format!(
            "path {:?} does not match content address (expected {})",
            path, expected
        )));
    }

    Ok(output)
}

impl Derivation {
    fn fixed_output_path_for(
        &self,
        output_name: &str,
        output: &Output,
    ) -> Result<StorePath, crate::store_path::BuildStorePathError> {
        match output {
            Output::Fixed(ca) => crate::store_path::fixed_ca_output_path(
                &self.dir,
                &self.output_object_name(output_name),
                ca,
                &Default::default(),
            ),
            Output::Floating { .. } => unreachable!("only called for fixed outputs"),
        }
    }
}

fn parse_quoted_pair(i: &[u8]) -> IResult<&[u8], (String, String)> {
    delimited(
        nomchar('('),
        |i| {
            let (i, k) = terminated(aterm::parse_string_field, nomchar(','))(i)?;
            let (i, v) = aterm::parse_string_field(i)?;
            Ok((i, (k, v)))
        },
        nomchar(')'),
    )(i)
}

fn parse_output(i: &[u8]) -> IResult<&[u8], RawOutput> {
    delimited(
        nomchar('('),
        |i| {
            let (i, name) = terminated(aterm::parse_string_field, nomchar(','))(i)?;
            let (i, path) = terminated(aterm::parse_string_field, nomchar(','))(i)?;
            let (i, algo) = terminated(aterm::parse_string_field, nomchar(','))(i)?;
            let (i, digest) = aterm::parse_string_field(i)?;
            Ok((i, (name, path, algo, digest)))
        },
        nomchar(')'),
    )(i)
}

fn parse_input_derivation(i: &[u8]) -> IResult<&[u8], (String, Vec<String>)> {
    delimited(
        nomchar('('),
        |i| {
            let (i, path) = terminated(aterm::parse_string_field, nomchar(','))(i)?;
            let (i, outputs) = aterm::parse_string_list(i)?;
            Ok((i, (path, outputs)))
        },
        nomchar(')'),
    )(i)
}

fn parse_raw(i: &[u8]) -> IResult<&[u8], RawDerivation> {
    preceded(
        tag(write::DERIVE_PREFIX),
        delimited(
            nomchar('('),
            |i| {
                let (i, (outputs, input_derivations, input_sources, system, builder, args, env)) =
                    tuple((
                        terminated(
                            delimited(
                                nomchar('['),
                                separated_list1(nomchar(','), parse_output),
                                nomchar(']'),
                            ),
                            nomchar(','),
                        ),
                        terminated(
                            delimited(
                                nomchar('['),
                                separated_list0(nomchar(','), parse_input_derivation),
                                nomchar(']'),
                            ),
                            nomchar(','),
                        ),
                        terminated(aterm::parse_string_list, nomchar(',')),
                        terminated(aterm::parse_string_field, nomchar(',')),
                        terminated(aterm::parse_string_field, nomchar(',')),
                        terminated(aterm::parse_string_list, nomchar(',')),
                        delimited(
                            nomchar('['),
                            separated_list0(nomchar(','), parse_quoted_pair),
                            nomchar(']'),
                        ),
                    ))(i)?;
                Ok((
                    i,
                    RawDerivation {
                        outputs,
                        input_derivations,
                        input_sources,
                        system,
                        builder,
                        args,
                        env,
                    },
                ))
            },
            nomchar(')'),
        ),
    )(i)
}
