//! An in-process store keeping objects as NAR bytes behind a lock.
//!
//! Used by tests and as the evaluator's default ephemeral store.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::export::{self, Trailer};
use crate::hash::Hash;
use crate::nar::reader as nar_reader;
use crate::realization::Realization;
use crate::store_path::StorePath;

use super::fs::{not_found, FsNode, StoreFileSystem};
use super::{
    export_closure_batch, BatchStore, ExportOptions, Exporter, Importer, Object,
    RandomAccessStore, RealizationFetcher, Store, StoreError,
};

#[derive(Debug)]
struct StoredObject {
    nar: Vec<u8>,
    trailer: Trailer,
}

type Objects = BTreeMap<StorePath, Arc<StoredObject>>;
type Realizations = BTreeMap<Hash, BTreeMap<String, Vec<Realization>>>;

#[derive(Clone, Default)]
pub struct MemoryStore {
    objects: Arc<RwLock<Objects>>,
    realizations: Arc<RwLock<Realizations>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    /// Adds an object directly; a no-op when the path is already
    /// present.
    pub fn insert(&self, nar: Vec<u8>, trailer: Trailer) -> Result<(), StoreError> {
        let mut objects = self.objects.write();
        objects
            .entry(trailer.store_path.clone())
            .or_insert_with(|| Arc::new(StoredObject { nar, trailer }));
        Ok(())
    }

    pub fn contains(&self, path: &StorePath) -> bool {
        self.objects.read().contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    fn get(&self, path: &StorePath) -> Result<Arc<StoredObject>, StoreError> {
        self.objects
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(path.clone()))
    }

    /// Records a known realization of one derivation output.
    pub fn add_realization(
        &self,
        derivation_hash: Hash,
        output_name: impl Into<String>,
        realization: Realization,
    ) {
        self.realizations
            .write()
            .entry(derivation_hash)
            .or_default()
            .entry(output_name.into())
            .or_default()
            .push(realization);
    }
}

#[derive(Debug)]
struct MemoryObject {
    inner: Arc<StoredObject>,
}

#[async_trait]
impl Object for MemoryObject {
    fn trailer(&self) -> &Trailer {
        &self.inner.trailer
    }

    async fn write_nar(&self, w: &mut (dyn Write + Send)) -> Result<(), StoreError> {
        w.write_all(&self.inner.nar)?;
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn object(&self, path: &StorePath) -> Result<Box<dyn Object>, StoreError> {
        Ok(Box::new(MemoryObject {
            inner: self.get(path)?,
        }))
    }
}

#[async_trait]
impl BatchStore for MemoryStore {
    async fn object_batch(
        &self,
        paths: &[StorePath],
    ) -> Result<Vec<Box<dyn Object>>, StoreError> {
        let objects = self.objects.read();
        Ok(paths
            .iter()
            .filter_map(|p| objects.get(p).cloned())
            .map(|inner| Box::new(MemoryObject { inner }) as Box<dyn Object>)
            .collect())
    }
}

#[async_trait]
impl Importer for MemoryStore {
    async fn store_import(&self, r: &mut (dyn Read + Send)) -> Result<(), StoreError> {
        let mut reader = export::Reader::new(r);
        loop {
            let mut nar = Vec::new();
            let trailer = match reader.next_object(&mut nar)? {
                Some(t) => t,
                None => return Ok(()),
            };
            debug!(path = %trailer.store_path, "importing object");
            self.insert(nar, trailer)?;
        }
    }
}

#[async_trait]
impl Exporter for MemoryStore {
    async fn store_export(
        &self,
        w: &mut (dyn Write + Send),
        paths: &[StorePath],
        opts: &ExportOptions,
    ) -> Result<(), StoreError> {
        export_closure_batch(self, w, paths, opts).await
    }
}

#[async_trait]
impl RealizationFetcher for MemoryStore {
    async fn fetch_realizations(
        &self,
        derivation_hash: &Hash,
    ) -> Result<BTreeMap<String, Vec<Realization>>, StoreError> {
        Ok(self
            .realizations
            .read()
            .get(derivation_hash)
            .cloned()
            .unwrap_or_default())
    }
}

impl RandomAccessStore for MemoryStore {
    fn store_fs(&self) -> Arc<dyn StoreFileSystem> {
        Arc::new(MemoryFs {
            objects: self.objects.clone(),
        })
    }
}

struct MemoryFs {
    objects: Arc<RwLock<Objects>>,
}

/// What a walk down a NAR found at the requested path.
enum Found {
    File { executable: bool, contents: Vec<u8> },
    Directory { names: Vec<String> },
    Symlink { target: Vec<u8> },
}

impl MemoryFs {
    fn lookup(&self, path: &str) -> io::Result<Found> {
        let mut parts = path.split('/').filter(|p| !p.is_empty());
        let object_name = parts.next().ok_or_else(|| not_found(path))?;
        let rest: Vec<&str> = parts.collect();

        let object = {
            let objects = self.objects.read();
            objects
                .iter()
                .find(|(p, _)| p.base() == object_name)
                .map(|(_, o)| o.clone())
                .ok_or_else(|| not_found(path))?
        };

        let mut rd = &object.nar[..];
        let root = nar_reader::open(&mut rd)?;
        walk(root, &rest).and_then(|found| found.ok_or_else(|| not_found(path)))
    }
}

/// Descends `parts` starting from `node`. Abandons the reader once the
/// target is found, which is fine for in-memory buffers.
fn walk(node: nar_reader::Node, parts: &[&str]) -> io::Result<Option<Found>> {
    match node {
        nar_reader::Node::Symlink { target } => Ok(if parts.is_empty() {
            Some(Found::Symlink { target })
        } else {
            None
        }),
        nar_reader::Node::File {
            executable,
            mut reader,
        } => {
            if !parts.is_empty() {
                return Ok(None);
            }
            let mut contents = Vec::new();
            reader.read_to_end(&mut contents)?;
            Ok(Some(Found::File {
                executable,
                contents,
            }))
        }
        nar_reader::Node::Directory(mut dir) => {
            if let Some((next, rest)) = parts.split_first() {
                while let Some(entry) = dir.next()? {
                    if entry.name == next.as_bytes() {
                        return walk(entry.node, rest);
                    }
                    discard(entry.node)?;
                }
                Ok(None)
            } else {
                let mut names = Vec::new();
                while let Some(entry) = dir.next()? {
                    names.push(String::from_utf8_lossy(&entry.name).into_owned());
                    discard(entry.node)?;
                }
                Ok(Some(Found::Directory { names }))
            }
        }
    }
}

/// Consumes a node without keeping its contents; needed to advance a
/// directory iterator past entries we don't care about.
fn discard(node: nar_reader::Node) -> io::Result<()> {
    match node {
        nar_reader::Node::Symlink { .. } => Ok(()),
        nar_reader::Node::File { mut reader, .. } => {
            io::copy(&mut reader, &mut io::sink())?;
            Ok(())
        }
        nar_reader::Node::Directory(mut dir) => {
            while let Some(entry) = dir.next()? {
                discard(entry.node)?;
            }
            Ok(())
        }
    }
}

impl StoreFileSystem for MemoryFs {
    fn metadata(&self, path: &str) -> io::Result<FsNode> {
        Ok(match self.lookup(path)? {
            Found::File {
                executable,
                contents,
            } => FsNode::File {
                executable,
                size: contents.len() as u64,
            },
            Found::Directory { .. } => FsNode::Directory,
            Found::Symlink { target } => FsNode::Symlink { target },
        })
    }

    fn read_file(&self, path: &str) -> io::Result<Vec<u8>> {
        match self.lookup(path)? {
            Found::File { contents, .. } => Ok(contents),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{:?} is not a regular file", path),
            )),
        }
    }

    fn read_dir(&self, path: &str) -> io::Result<Vec<String>> {
        match self.lookup(path)? {
            Found::Directory { names } => Ok(names),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{:?} is not a directory", path),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::io::BufReader;

    fn tree_nar() -> Vec<u8> {
        let mut nar = Vec::new();
        let node = crate::nar::writer::open(&mut nar).unwrap();
        let mut dir = node.directory().unwrap();
        {
            let mut bin = dir.entry(b"bin").unwrap().directory().unwrap();
            bin.entry(b"tool")
                .unwrap()
                .file(true, 5, &mut BufReader::new(&b"#!/x\n"[..]))
                .unwrap();
            bin.close().unwrap();
        }
        dir.entry(b"link").unwrap().symlink(b"bin/tool").unwrap();
        dir.close().unwrap();
        nar
    }

    fn sample_path() -> StorePath {
        StorePath::parse("/zb/store/00bgd045z0d4icpbc2yyz4gx48ak44la-tool").unwrap()
    }

    #[tokio::test]
    async fn object_round_trip() {
        let store = MemoryStore::new();
        let path = sample_path();
        store.insert(tree_nar(), Trailer::new(path.clone())).unwrap();

        let obj = store.object(&path).await.unwrap();
        assert_eq!(obj.trailer().store_path, path);

        let mut nar = Vec::new();
        obj.write_nar(&mut nar).await.unwrap();
        assert_eq!(nar, tree_nar());

        let missing =
            StorePath::parse("/zb/store/aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-nope").unwrap();
        assert!(store.object(&missing).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn realizations_round_trip() {
        use crate::hash::sha256_sum;
        use crate::realization::Realization;

        let store = MemoryStore::new();
        let drv_hash = sha256_sum(b"some drv");

        let empty = store.fetch_realizations(&drv_hash).await.unwrap();
        assert!(empty.is_empty());

        store.add_realization(
            drv_hash.clone(),
            "out",
            Realization {
                output_path: sample_path(),
                reference_classes: vec![],
                signatures: vec![],
            },
        );

        let found = store.fetch_realizations(&drv_hash).await.unwrap();
        assert_eq!(found["out"].len(), 1);
        assert_eq!(found["out"][0].output_path, sample_path());
    }

    #[tokio::test]
    async fn batch_omits_missing() {
        let store = MemoryStore::new();
        let path = sample_path();
        store.insert(tree_nar(), Trailer::new(path.clone())).unwrap();

        let missing =
            StorePath::parse("/zb/store/aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-nope").unwrap();
        let objs = store
            .object_batch(&[path.clone(), missing])
            .await
            .unwrap();
        assert_eq!(objs.len(), 1);
        assert_eq!(objs[0].trailer().store_path, path);
    }

    #[test]
    fn fs_view() {
        let store = MemoryStore::new();
        let path = sample_path();
        store
            .insert(
                tree_nar(),
                Trailer {
                    store_path: path.clone(),
                    references: BTreeSet::new(),
                    deriver: None,
                    content_address: None,
                },
            )
            .unwrap();

        let fs = store.store_fs();
        let base = path.base();

        assert_eq!(fs.metadata(base).unwrap(), FsNode::Directory);
        assert_eq!(
            fs.read_dir(base).unwrap(),
            vec!["bin".to_string(), "link".to_string()]
        );
        assert_eq!(
            fs.metadata(&format!("{}/bin/tool", base)).unwrap(),
            FsNode::File {
                executable: true,
                size: 5
            }
        );
        assert_eq!(
            fs.read_file(&format!("{}/bin/tool", base)).unwrap(),
            b"#!/x\n"
        );
        assert_eq!(
            fs.metadata(&format!("{}/link", base)).unwrap(),
            FsNode::Symlink {
                target: b"bin/tool".to_vec()
            }
        );

        assert!(fs.metadata("nope").is_err());
        assert!(fs.metadata(&format!("{}/bin/missing", base)).is_err());
    }
}
