//! The NAR ("Nix archive") serialization: a deterministic binary encoding
//! of a filesystem sub-tree.
//!
//! Every value on the wire is framed as a little-endian 64-bit length,
//! the bytes, then zero-padding to an 8-byte boundary. The grammar:
//!
//! ```plain
//! archive ::= "nix-archive-1" node
//!
//! node ::= "(" "type" "symlink" "target" string ")"
//!      ||= "(" "type" "regular" ("executable" "")? "contents" string ")"
//!      ||= "(" "type" "directory" entry* ")"
//!
//! entry ::= "entry" "(" "name" string "node" node ")"
//! ```
//!
//! Directory entries are emitted in strictly ascending order of their raw
//! byte names. The encoding is canonical: parsing and re-serializing a
//! valid NAR yields the identical bytes, which [copy] relies on.

mod copy;
pub mod reader;
pub mod wire;
pub mod writer;

pub use copy::copy;
