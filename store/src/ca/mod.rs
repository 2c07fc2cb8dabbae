//! Content addresses of store objects.

use std::fmt;
use std::str::FromStr;

use crate::hash::{Hash, HashAlgo};

pub mod hash_modulo;
mod macho;
pub mod source;

pub use source::{
    source_sha256_content_address, CreateTemp, NarHeader, SelfReferenceAnalysis, SourceError,
    SourceOptions, Spool,
};

/// A content address is a tag-and-hash pair that determines a store
/// object's path and is verifiable by rehashing the object.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContentAddress {
    /// SHA-256 over raw bytes. Reserved for derivations and small text
    /// objects; text objects may not reference themselves.
    Text(Hash),
    /// Hash over the flat contents of a regular file.
    Flat(Hash),
    /// Hash over the NAR serialization of the object.
    Recursive(Hash),
}

/// The ingestion method part of a [ContentAddress], without the hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentAddressMethod {
    Text,
    Flat,
    Recursive,
}

impl ContentAddressMethod {
    /// The prefix applied to the hash algorithm in derivation ATerm
    /// serializations and in the `fixed:out:` fingerprint string.
    pub fn prefix(&self) -> &'static str {
        match self {
            ContentAddressMethod::Flat => "",
            ContentAddressMethod::Recursive => "r:",
            ContentAddressMethod::Text => "text:",
        }
    }

    pub fn parse_prefix(s: &str) -> (ContentAddressMethod, &str) {
        if let Some(rest) = s.strip_prefix("r:") {
            (ContentAddressMethod::Recursive, rest)
        } else if let Some(rest) = s.strip_prefix("text:") {
            (ContentAddressMethod::Text, rest)
        } else {
            (ContentAddressMethod::Flat, s)
        }
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unknown content address form {0:?}")]
    UnknownForm(String),
    #[error("invalid content address hash: {0}")]
    InvalidHash(#[from] crate::hash::Error),
    #[error("text content addresses require sha256, got {0}")]
    InvalidTextAlgo(HashAlgo),
}

impl ContentAddress {
    /// The canonical content address of "source" store objects: the
    /// recursive-file (NAR) sha256 content address.
    pub fn source(hash: Hash) -> Option<ContentAddress> {
        match hash {
            Hash::Sha256(_) => Some(ContentAddress::Recursive(hash)),
            _ => None,
        }
    }

    /// Reports whether this is a "source" content address
    /// (recursive-file sha256).
    pub fn is_source(&self) -> bool {
        matches!(self, ContentAddress::Recursive(Hash::Sha256(_)))
    }

    pub fn method(&self) -> ContentAddressMethod {
        match self {
            ContentAddress::Text(_) => ContentAddressMethod::Text,
            ContentAddress::Flat(_) => ContentAddressMethod::Flat,
            ContentAddress::Recursive(_) => ContentAddressMethod::Recursive,
        }
    }

    pub fn hash(&self) -> &Hash {
        match self {
            ContentAddress::Text(h) | ContentAddress::Flat(h) | ContentAddress::Recursive(h) => h,
        }
    }

    /// Parses the textual form used in export trailers:
    /// `text:sha256:<nixbase32>`, `fixed:<algo>:<nixbase32>` or
    /// `fixed:r:<algo>:<nixbase32>`.
    pub fn parse(s: &str) -> Result<ContentAddress, ParseError> {
        if let Some(rest) = s.strip_prefix("text:") {
            let hash = Hash::parse(rest, None)?;
            if hash.algo() != HashAlgo::Sha256 {
                return Err(ParseError::InvalidTextAlgo(hash.algo()));
            }
            Ok(ContentAddress::Text(hash))
        } else if let Some(rest) = s.strip_prefix("fixed:") {
            if let Some(rest) = rest.strip_prefix("r:") {
                Ok(ContentAddress::Recursive(Hash::parse(rest, None)?))
            } else {
                Ok(ContentAddress::Flat(Hash::parse(rest, None)?))
            }
        } else {
            Err(ParseError::UnknownForm(s.to_string()))
        }
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentAddress::Text(h) => write!(f, "text:{}", h.to_typed_nixbase32_string()),
            ContentAddress::Flat(h) => write!(f, "fixed:{}", h.to_typed_nixbase32_string()),
            ContentAddress::Recursive(h) => write!(f, "fixed:r:{}", h.to_typed_nixbase32_string()),
        }
    }
}

impl FromStr for ContentAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ContentAddress::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::ContentAddress;
    use crate::hash::{sha256_sum, Hash, HashAlgo};
    use rstest::rstest;

    #[rstest]
    #[case::text("text:sha256:0hjszid30ak3rkzvc3m1ii1kcbr794nm1hg23mziqbn71h6a3g51")]
    #[case::flat("fixed:sha256:0hjszid30ak3rkzvc3m1ii1kcbr794nm1hg23mziqbn71h6a3g51")]
    #[case::recursive("fixed:r:sha256:0hjszid30ak3rkzvc3m1ii1kcbr794nm1hg23mziqbn71h6a3g51")]
    fn round_trip(#[case] s: &str) {
        let ca = ContentAddress::parse(s).expect("must parse");
        assert_eq!(ca.to_string(), s);
    }

    #[test]
    fn source() {
        let ca = ContentAddress::source(sha256_sum(b"x")).unwrap();
        assert!(ca.is_source());
        assert!(!ContentAddress::Flat(sha256_sum(b"x")).is_source());
        assert!(ContentAddress::source(Hash::Sha1([0; 20])).is_none());
    }

    #[test]
    fn parse_rejects() {
        ContentAddress::parse("garbage:sha256:00").expect_err("unknown form");
        assert!(matches!(
            ContentAddress::parse("text:sha1:y5q4drg5558zk8aamsx6xliv3i23x644"),
            Err(super::ParseError::InvalidTextAlgo(HashAlgo::Sha1))
        ));
    }
}
