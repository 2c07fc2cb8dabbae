//! Realizations: bindings of a logical derivation output (identified by
//! the canonical hash of its derivation) to a concrete store path,
//! carrying the referenced paths' own realizations and optional ed25519
//! signatures.

use std::cmp::Ordering;

use data_encoding::BASE64_NOPAD;
use ed25519::Signature;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH};
use serde::Serialize;

use crate::hash::Hash;
use crate::store_path::StorePath;

/// Identifies one output of a derivation by the derivation's canonical
/// hash rather than its store path.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct RealizationOutputRef {
    pub derivation_hash: Hash,
    pub output_name: String,
}

/// One reference of a realized output: the path itself, and, when the
/// path is itself a realized output, which realization it was.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReferenceClass {
    pub path: StorePath,
    pub realization: Option<RealizationOutputRef>,
}

/// A signature over the canonical form of a realization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RealizationSignature {
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

/// A known realization of a derivation output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Realization {
    pub output_path: StorePath,
    pub reference_classes: Vec<ReferenceClass>,
    pub signatures: Vec<RealizationSignature>,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("public key has {0} bytes, expected {PUBLIC_KEY_LENGTH}")]
    InvalidPublicKeyLength(usize),
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("signature has {0} bytes, expected 64")]
    InvalidSignatureLength(usize),
    #[error("signature verification failed")]
    VerificationFailed,
}

// The signing payload, canonicalized per RFC 8785 (JCS). The value
// shape is objects, arrays and strings only, so serde_json's compact
// form with these (lexicographically declared) field orders is already
// canonical.

#[derive(Serialize)]
struct CanonicalHash<'a> {
    algorithm: &'a str,
    digest: String,
}

impl<'a> CanonicalHash<'a> {
    fn new(h: &'a Hash) -> CanonicalHash<'a> {
        CanonicalHash {
            algorithm: h.algo().as_str(),
            digest: BASE64_NOPAD.encode(h.digest()),
        }
    }
}

#[derive(Serialize)]
struct CanonicalOutputRef<'a> {
    derivation_hash: CanonicalHash<'a>,
    output_name: &'a str,
}

#[derive(Serialize)]
struct CanonicalReference<'a> {
    path: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    realization: Option<CanonicalOutputRef<'a>>,
}

#[derive(Serialize)]
struct CanonicalRealization<'a> {
    derivation_hash: CanonicalHash<'a>,
    output_name: &'a str,
    output_path: &'a str,
    reference_classes: Vec<CanonicalReference<'a>>,
}

fn reference_sort_key(a: &ReferenceClass, b: &ReferenceClass) -> Ordering {
    a.path
        .cmp(&b.path)
        .then_with(|| a.realization.is_some().cmp(&b.realization.is_some()))
        .then_with(|| match (&a.realization, &b.realization) {
            (Some(ra), Some(rb)) => ra
                .derivation_hash
                .algo()
                .cmp(&rb.derivation_hash.algo())
                .then_with(|| ra.derivation_hash.digest().cmp(rb.derivation_hash.digest()))
                .then_with(|| ra.output_name.cmp(&rb.output_name)),
            _ => Ordering::Equal,
        })
}

/// The canonical signing payload of a realization for the given output.
pub fn canonical_signing_payload(output: &RealizationOutputRef, r: &Realization) -> Vec<u8> {
    let mut references: Vec<&ReferenceClass> = r.reference_classes.iter().collect();
    references.sort_by(|a, b| reference_sort_key(a, b));

    let form = CanonicalRealization {
        derivation_hash: CanonicalHash::new(&output.derivation_hash),
        output_name: &output.output_name,
        output_path: r.output_path.as_str(),
        reference_classes: references
            .into_iter()
            .map(|rc| CanonicalReference {
                path: rc.path.as_str(),
                realization: rc.realization.as_ref().map(|or| CanonicalOutputRef {
                    derivation_hash: CanonicalHash::new(&or.derivation_hash),
                    output_name: &or.output_name,
                }),
            })
            .collect(),
    };

    serde_json::to_vec(&form).expect("canonical form serializes")
}

/// Signs a realization, returning the signature to attach to it.
pub fn sign_realization_with_ed25519(
    output: &RealizationOutputRef,
    r: &Realization,
    key: &SigningKey,
) -> RealizationSignature {
    let payload = canonical_signing_payload(output, r);
    let signature = key.sign(&payload);
    RealizationSignature {
        public_key: key.verifying_key().to_bytes().to_vec(),
        signature: signature.to_bytes().to_vec(),
    }
}

/// Verifies one signature of a realization.
pub fn verify_realization_signature(
    output: &RealizationOutputRef,
    r: &Realization,
    sig: &RealizationSignature,
) -> Result<(), SignatureError> {
    let key_bytes: &[u8; PUBLIC_KEY_LENGTH] = sig
        .public_key
        .as_slice()
        .try_into()
        .map_err(|_| SignatureError::InvalidPublicKeyLength(sig.public_key.len()))?;
    let key = VerifyingKey::from_bytes(key_bytes).map_err(|_| SignatureError::InvalidPublicKey)?;

    let sig_bytes: &[u8; 64] = sig
        .signature
        .as_slice()
        .try_into()
        .map_err(|_| SignatureError::InvalidSignatureLength(sig.signature.len()))?;
    let signature = Signature::from_bytes(sig_bytes);

    let payload = canonical_signing_payload(output, r);
    key.verify(&payload, &signature)
        .map_err(|_| SignatureError::VerificationFailed)
}
