//! Core data model of the zb store: store paths and directories, content
//! addresses, the NAR and `export` archive codecs, self-reference analysis
//! and rewriting, derivations, realizations, and the store interfaces.
//!
//! This crate contains no daemon, sandbox or RPC code; it is the layer
//! everything else (evaluator, build daemon, CLI) is built on.

pub(crate) mod aterm;
pub mod ca;
pub mod derivation;
pub mod export;
pub mod hash;
pub mod nar;
pub mod nixbase32;
pub mod realization;
pub mod rewrite;
pub mod store;
pub mod store_path;

pub use ca::ContentAddress;
pub use derivation::Derivation;
pub use export::Trailer;
pub use hash::{Hash, HashAlgo};
pub use store_path::{Directory, PathStyle, StorePath};
