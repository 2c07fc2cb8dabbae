//! Store interfaces: capability traits for looking up, importing and
//! exporting store objects, plus in-process implementations.
//!
//! The traits are deliberately narrow; a daemon client, an HTTP cache or
//! the in-memory store each implement the subset they can support, and
//! [export_closure] fills the gap for stores that aren't natively
//! [Exporter]s.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::sync::Arc;

use async_trait::async_trait;

use crate::export::Trailer;
use crate::hash::Hash;
use crate::realization::Realization;
use crate::store_path::StorePath;

mod cache;
mod closure;
mod fs;
mod memory;

pub use cache::Cache;
pub use closure::{export_closure, export_closure_batch};
pub use fs::{FsNode, StoreFileSystem};
pub use memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Requested object absent. Callers test for this with
    /// [StoreError::is_not_found].
    #[error("store object {0} not found")]
    NotFound(StorePath),
    #[error("malformed store data: {0}")]
    Malformed(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// A read handle to one store object.
#[async_trait]
pub trait Object: Send + Sync + std::fmt::Debug {
    fn trailer(&self) -> &Trailer;

    /// Writes the object's NAR serialization to `w`.
    async fn write_nar(&self, w: &mut (dyn Write + Send)) -> Result<(), StoreError>;
}

/// Looking up single store objects.
#[async_trait]
pub trait Store: Send + Sync {
    async fn object(&self, path: &StorePath) -> Result<Box<dyn Object>, StoreError>;
}

/// Consuming `export` streams.
#[async_trait]
pub trait Importer: Send + Sync {
    /// Consumes one complete export stream. Objects already present are
    /// no-ops; the call returns only after the stream is fully consumed
    /// or an error occurred.
    async fn store_import(&self, r: &mut (dyn Read + Send)) -> Result<(), StoreError>;
}

#[derive(Clone, Debug)]
pub struct ExportOptions {
    /// Also export the transitive reference closure of the requested
    /// paths.
    pub include_references: bool,
    /// Upper bound on concurrent object lookups for stores without
    /// batch support.
    pub max_concurrency: usize,
}

impl Default for ExportOptions {
    fn default() -> Self {
        ExportOptions {
            include_references: true,
            max_concurrency: 16,
        }
    }
}

/// Producing `export` streams.
#[async_trait]
pub trait Exporter: Send + Sync {
    async fn store_export(
        &self,
        w: &mut (dyn Write + Send),
        paths: &[StorePath],
        opts: &ExportOptions,
    ) -> Result<(), StoreError>;
}

/// Bulk object lookup. Missing paths are silently omitted from the
/// result.
#[async_trait]
pub trait BatchStore: Store {
    async fn object_batch(
        &self,
        paths: &[StorePath],
    ) -> Result<Vec<Box<dyn Object>>, StoreError>;
}

/// A read-only virtual filesystem rooted at the store directory.
pub trait RandomAccessStore: Store {
    fn store_fs(&self) -> Arc<dyn StoreFileSystem>;
}

/// Lookup of known realizations by derivation hash.
#[async_trait]
pub trait RealizationFetcher: Send + Sync {
    async fn fetch_realizations(
        &self,
        derivation_hash: &Hash,
    ) -> Result<BTreeMap<String, Vec<Realization>>, StoreError>;
}
