//! Read-only virtual filesystem over store contents.

use std::io;

/// Metadata of one node in the store filesystem.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FsNode {
    File { executable: bool, size: u64 },
    Directory,
    Symlink { target: Vec<u8> },
}

/// A read-only filesystem rooted at the store directory. Paths are
/// `/`-separated and relative to the store directory, so the first
/// component names a store object (`<digest>-<name>`).
pub trait StoreFileSystem: Send + Sync {
    fn metadata(&self, path: &str) -> io::Result<FsNode>;

    /// Reads a regular file's contents.
    fn read_file(&self, path: &str) -> io::Result<Vec<u8>>;

    /// Lists a directory's entry names, in ascending order.
    fn read_dir(&self, path: &str) -> io::Result<Vec<String>>;
}

pub(crate) fn not_found(path: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{:?} not found", path))
}
