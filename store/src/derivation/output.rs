//! Derivation outputs.

use crate::ca::{ContentAddress, ContentAddressMethod};
use crate::hash::HashAlgo;

/// How a derivation output is addressed.
///
/// zb derivations are content-addressed throughout: an output either has
/// its content hash fixed in advance, or it "floats" and receives its
/// path only once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Output {
    /// The output must hash to this content address; its store path is
    /// known before building.
    Fixed(ContentAddress),
    /// The output's content is unknown until it is built. Carries the
    /// ingestion method and hash algorithm that will address it.
    Floating {
        method: ContentAddressMethod,
        algo: HashAlgo,
    },
}

impl Output {
    /// The floating output zb uses when nothing else is requested:
    /// recursive (NAR) sha256.
    pub fn floating_default() -> Output {
        Output::Floating {
            method: ContentAddressMethod::Recursive,
            algo: HashAlgo::Sha256,
        }
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self, Output::Fixed(_))
    }
}
