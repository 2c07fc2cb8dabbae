//! Hash digests as they appear in content addresses, derivations and
//! realizations.

use std::fmt::{self, Display};

use data_encoding::{BASE64, BASE64_NOPAD, HEXLOWER};

use crate::nixbase32;

/// Hash algorithms the store knows about.
///
/// sha256 carries nearly all of the weight (content addresses, fingerprints,
/// realizations); the others exist so fixed-output hashes in user-provided
/// data can be parsed and round-tripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HashAlgo {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgo {
    pub fn digest_len(&self) -> usize {
        match self {
            HashAlgo::Md5 => 16,
            HashAlgo::Sha1 => 20,
            HashAlgo::Sha256 => 32,
            HashAlgo::Sha512 => 64,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgo::Md5 => "md5",
            HashAlgo::Sha1 => "sha1",
            HashAlgo::Sha256 => "sha256",
            HashAlgo::Sha512 => "sha512",
        }
    }
}

impl Display for HashAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HashAlgo {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "md5" => Ok(HashAlgo::Md5),
            "sha1" => Ok(HashAlgo::Sha1),
            "sha256" => Ok(HashAlgo::Sha256),
            "sha512" => Ok(HashAlgo::Sha512),
            _ => Err(Error::InvalidAlgo(s.to_string())),
        }
    }
}

/// A hash digest, tagged with its algorithm.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Hash {
    Md5([u8; 16]),
    Sha1([u8; 20]),
    Sha256([u8; 32]),
    Sha512(Box<[u8; 64]>),
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("invalid hash algorithm: {0}")]
    InvalidAlgo(String),
    #[error("invalid digest length {0} for algorithm {1}")]
    InvalidDigestLength(usize, HashAlgo),
    #[error("invalid encoded digest length {0} for algorithm {1}")]
    InvalidEncodedDigestLength(usize, HashAlgo),
    #[error("unable to decode digest: {0}")]
    InvalidDigestEncoding(String),
    #[error("missing algorithm prefix in {0:?}")]
    MissingAlgo(String),
}

impl Hash {
    /// Constructs a [Hash] from an algorithm and a raw digest.
    /// Fails if the digest length doesn't match the algorithm.
    pub fn from_digest(algo: HashAlgo, digest: &[u8]) -> Result<Self, Error> {
        if digest.len() != algo.digest_len() {
            return Err(Error::InvalidDigestLength(digest.len(), algo));
        }

        Ok(match algo {
            HashAlgo::Md5 => Hash::Md5(digest.try_into().unwrap()),
            HashAlgo::Sha1 => Hash::Sha1(digest.try_into().unwrap()),
            HashAlgo::Sha256 => Hash::Sha256(digest.try_into().unwrap()),
            HashAlgo::Sha512 => Hash::Sha512(Box::new(digest.try_into().unwrap())),
        })
    }

    pub fn algo(&self) -> HashAlgo {
        match self {
            Hash::Md5(_) => HashAlgo::Md5,
            Hash::Sha1(_) => HashAlgo::Sha1,
            Hash::Sha256(_) => HashAlgo::Sha256,
            Hash::Sha512(_) => HashAlgo::Sha512,
        }
    }

    pub fn digest(&self) -> &[u8] {
        match self {
            Hash::Md5(d) => d,
            Hash::Sha1(d) => d,
            Hash::Sha256(d) => d,
            Hash::Sha512(d) => d.as_ref(),
        }
    }

    /// The digest as a lowercase hex string, without algorithm prefix.
    pub fn to_plain_hex_string(&self) -> String {
        HEXLOWER.encode(self.digest())
    }

    /// `<algo>:<base16 digest>`, the form used in fingerprints and in the
    /// ATerm serialization of fixed outputs.
    pub fn to_typed_base16_string(&self) -> String {
        format!("{}:{}", self.algo(), self.to_plain_hex_string())
    }

    /// `<algo>:<nixbase32 digest>`, the form used in content address
    /// strings.
    pub fn to_typed_nixbase32_string(&self) -> String {
        format!("{}:{}", self.algo(), nixbase32::encode(self.digest()))
    }

    /// Parses a hash string.
    ///
    /// Accepted forms:
    ///  - `<algo>:<digest>` with the digest in base16, nixbase32 or base64
    ///    (chosen by length),
    ///  - `<algo>-<base64 digest>` (SRI),
    ///  - a bare digest, if `algo` supplies the algorithm out-of-band.
    pub fn parse(s: &str, algo: Option<HashAlgo>) -> Result<Self, Error> {
        if let Some((prefix, rest)) = s.split_once(':') {
            let parsed: HashAlgo = prefix.parse()?;
            if let Some(algo) = algo {
                if algo != parsed {
                    return Err(Error::InvalidAlgo(prefix.to_string()));
                }
            }
            return decode_digest(rest, parsed);
        }
        if let Some((prefix, rest)) = s.split_once('-') {
            // SRI form, always base64.
            let parsed: HashAlgo = prefix.parse()?;
            if let Some(algo) = algo {
                if algo != parsed {
                    return Err(Error::InvalidAlgo(prefix.to_string()));
                }
            }
            let digest = BASE64
                .decode(rest.as_bytes())
                .or_else(|_| BASE64_NOPAD.decode(rest.as_bytes()))
                .map_err(|e| Error::InvalidDigestEncoding(e.to_string()))?;
            return Hash::from_digest(parsed, &digest);
        }

        match algo {
            Some(algo) => decode_digest(s, algo),
            None => Err(Error::MissingAlgo(s.to_string())),
        }
    }
}

/// Decodes a digest string for a known algorithm, picking the encoding by
/// the string length.
fn decode_digest(s: &str, algo: HashAlgo) -> Result<Hash, Error> {
    let digest = if s.len() == algo.digest_len() * 2 {
        HEXLOWER
            .decode(s.to_ascii_lowercase().as_bytes())
            .map_err(|e| Error::InvalidDigestEncoding(e.to_string()))?
    } else if s.len() == nixbase32::encode_len(algo.digest_len()) {
        nixbase32::decode(s.as_bytes()).map_err(|e| Error::InvalidDigestEncoding(e.to_string()))?
    } else if s.len() == BASE64.encode_len(algo.digest_len()) {
        BASE64
            .decode(s.as_bytes())
            .map_err(|e| Error::InvalidDigestEncoding(e.to_string()))?
    } else {
        return Err(Error::InvalidEncodedDigestLength(s.len(), algo));
    };

    Hash::from_digest(algo, &digest)
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_typed_base16_string())
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_typed_base16_string())
    }
}

/// Convenience: sha256 of the given bytes.
pub fn sha256_sum(data: impl AsRef<[u8]>) -> Hash {
    use sha2::{Digest, Sha256};
    Hash::Sha256(Sha256::digest(data.as_ref()).into())
}

/// Hashes `data` with the given algorithm.
pub fn sum(algo: HashAlgo, data: impl AsRef<[u8]>) -> Hash {
    use md5::Digest;

    let data = data.as_ref();
    match algo {
        HashAlgo::Md5 => Hash::Md5(md5::Md5::digest(data).into()),
        HashAlgo::Sha1 => Hash::Sha1(sha1::Sha1::digest(data).into()),
        HashAlgo::Sha256 => Hash::Sha256(sha2::Sha256::digest(data).into()),
        HashAlgo::Sha512 => Hash::Sha512(Box::new(sha2::Sha512::digest(data).into())),
    }
}
