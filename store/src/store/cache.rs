//! A composite store layering a writable local store over a fallback.
//!
//! Asks near first; misses are answered from far. An object found only
//! in the fallback is copied into the local store the first time its
//! NAR is actually read, so lookups stay cheap and bytes move at most
//! once.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::export::{self, Trailer};
use crate::store_path::{Directory, StorePath};

use super::fs::{FsNode, StoreFileSystem};
use super::{Importer, Object, RandomAccessStore, Store, StoreError};

pub struct Cache<L, F> {
    dir: Directory,
    local: Arc<L>,
    fallback: Arc<F>,
}

impl<L, F> Cache<L, F> {
    pub fn new(dir: Directory, local: Arc<L>, fallback: Arc<F>) -> Cache<L, F> {
        Cache {
            dir,
            local,
            fallback,
        }
    }

    pub fn local(&self) -> &Arc<L> {
        &self.local
    }
}

#[async_trait]
impl<L, F> Store for Cache<L, F>
where
    L: Store + Importer + 'static,
    F: Store + 'static,
{
    async fn object(&self, path: &StorePath) -> Result<Box<dyn Object>, StoreError> {
        match self.local.object(path).await {
            Ok(obj) => Ok(obj),
            Err(e) if e.is_not_found() => {
                debug!(path = %path, "not in local store, asking fallback");
                let far = self.fallback.object(path).await?;
                Ok(Box::new(CacheObject {
                    local: self.local.clone(),
                    far,
                    copied: AtomicBool::new(false),
                }))
            }
            Err(e) => Err(e),
        }
    }
}

/// A fallback object that installs itself into the local store on first
/// read.
struct CacheObject<L> {
    local: Arc<L>,
    far: Box<dyn Object>,
    copied: AtomicBool,
}

impl<L> std::fmt::Debug for CacheObject<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheObject")
            .field("far", &self.far)
            .field("copied", &self.copied)
            .finish_non_exhaustive()
    }
}

impl<L: Store + Importer> CacheObject<L> {
    async fn copy_to_local(&self) -> Result<(), StoreError> {
        if self.copied.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut stream = Vec::new();
        {
            let mut writer = export::Writer::new(&mut stream);
            writer.object()?;
            self.far.write_nar(&mut writer).await?;
            writer.trailer(self.far.trailer())?;
            writer.finish()?;
        }
        self.local.store_import(&mut &stream[..]).await?;
        self.copied.store(true, Ordering::Release);
        Ok(())
    }
}

#[async_trait]
impl<L> Object for CacheObject<L>
where
    L: Store + Importer + Send + Sync + 'static,
{
    fn trailer(&self) -> &Trailer {
        self.far.trailer()
    }

    async fn write_nar(&self, w: &mut (dyn Write + Send)) -> Result<(), StoreError> {
        self.copy_to_local().await?;
        let local_obj = self.local.object(&self.far.trailer().store_path).await?;
        local_obj.write_nar(w).await
    }
}

impl<L, F> RandomAccessStore for Cache<L, F>
where
    L: Store + Importer + RandomAccessStore + 'static,
    F: Store + 'static,
{
    fn store_fs(&self) -> Arc<dyn StoreFileSystem> {
        Arc::new(CacheFs {
            dir: self.dir.clone(),
            local: self.local.clone(),
            fallback: self.fallback.clone(),
        })
    }
}

/// Filesystem view of the cache: a miss in the local store triggers a
/// copy of the containing store object and a re-query.
struct CacheFs<L, F> {
    dir: Directory,
    local: Arc<L>,
    fallback: Arc<F>,
}

impl<L, F> CacheFs<L, F>
where
    L: Store + Importer + RandomAccessStore + 'static,
    F: Store + 'static,
{
    /// Copies the store object containing `path` from the fallback into
    /// the local store, if the fallback has it.
    fn fault_in(&self, path: &str) -> io::Result<()> {
        let object_name = path
            .split('/')
            .find(|p| !p.is_empty())
            .ok_or_else(|| super::fs::not_found(path))?;
        let store_path = self
            .dir
            .object(object_name)
            .map_err(|_| super::fs::not_found(path))?;

        // Both layers in this crate are in-process stores, so blocking
        // on their futures cannot starve an executor.
        futures::executor::block_on(async {
            let far = match self.fallback.object(&store_path).await {
                Ok(obj) => obj,
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e),
            };
            let mut stream = Vec::new();
            {
                let mut writer = export::Writer::new(&mut stream);
                writer.object()?;
                far.write_nar(&mut writer).await?;
                writer.trailer(far.trailer())?;
                writer.finish()?;
            }
            self.local.store_import(&mut &stream[..]).await?;
            Ok(())
        })
        .map_err(io::Error::other)
    }
}

impl<L, F> StoreFileSystem for CacheFs<L, F>
where
    L: Store + Importer + RandomAccessStore + 'static,
    F: Store + 'static,
{
    fn metadata(&self, path: &str) -> io::Result<FsNode> {
        match self.local.store_fs().metadata(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.fault_in(path)?;
                self.local.store_fs().metadata(path)
            }
            other => other,
        }
    }

    fn read_file(&self, path: &str) -> io::Result<Vec<u8>> {
        match self.local.store_fs().read_file(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.fault_in(path)?;
                self.local.store_fs().read_file(path)
            }
            other => other,
        }
    }

    fn read_dir(&self, path: &str) -> io::Result<Vec<String>> {
        match self.local.store_fs().read_dir(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.fault_in(path)?;
                self.local.store_fs().read_dir(path)
            }
            other => other,
        }
    }
}
