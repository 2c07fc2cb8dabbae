//! Serializing filesystem trees into NAR archives.
//!
//! The writer hands out a [Node] for every position in the tree that
//! still needs content; filling a node consumes it, so an archive
//! cannot be left half-written by accident (directories are the
//! exception and carry an explicit [Directory::close]).
//!
//! ```rust
//! # let mut sink: Vec<u8> = Vec::new();
//! let node = zb_store::nar::writer::open(&mut sink)?;
//! let mut dir = node.directory()?;
//! dir.entry(b"hello.txt")?.file(false, 3, &mut &b"hi\n"[..])?;
//! dir.entry(b"link")?.symlink(b"hello.txt")?;
//! dir.close()?;
//! # Ok::<(), std::io::Error>(())
//! ```

use std::io::{
    self, BufRead,
    ErrorKind::{InvalidInput, UnexpectedEof},
    Write,
};

use super::wire;

const ZERO: [u8; 8] = [0; 8];

/// Starts an archive, leaving one root [Node] to fill in.
pub fn open<W: Write>(writer: &mut W) -> io::Result<Node<W>> {
    writer.write_all(&wire::TOK_NAR)?;
    Ok(Node { out: writer })
}

/// A position in the archive waiting for its content: the root, or one
/// directory entry.
pub struct Node<'w, W: Write> {
    out: &'w mut W,
}

impl<'w, W: Write> Node<'w, W> {
    fn emit(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.out.write_all(bytes)
    }

    /// Writes the zero padding that brings a `len`-byte string to an
    /// 8-byte boundary.
    fn pad_for(&mut self, len: u64) -> io::Result<()> {
        let pad = (8 - (len % 8) as usize) % 8;
        if pad == 0 {
            return Ok(());
        }
        self.emit(&ZERO[..pad])
    }

    /// Fills this node with a symlink.
    pub fn symlink(mut self, target: &[u8]) -> io::Result<()> {
        debug_assert!(
            !target.is_empty() && !target.contains(&0),
            "symlink targets are non-empty and null-free"
        );
        debug_assert!(
            target.len() <= wire::MAX_TARGET_LEN,
            "symlink target exceeds {} bytes",
            wire::MAX_TARGET_LEN
        );

        self.emit(&wire::TOK_SYM)?;
        self.emit(&(target.len() as u64).to_le_bytes())?;
        self.emit(target)?;
        self.pad_for(target.len() as u64)?;
        self.emit(&wire::TOK_PAR)
    }

    /// Fills this node with a regular file whose contents come from
    /// `reader`, which must yield exactly `size` bytes.
    pub fn file(mut self, executable: bool, size: u64, reader: &mut dyn BufRead) -> io::Result<()> {
        self.emit(if executable {
            &wire::TOK_EXE
        } else {
            &wire::TOK_REG
        })?;
        self.emit(&size.to_le_bytes())?;

        let mut remaining = size;
        while remaining > 0 {
            let chunk = reader.fill_buf()?;
            if chunk.is_empty() {
                return Err(UnexpectedEof.into());
            }
            let n = (chunk.len() as u64).min(remaining) as usize;
            self.emit(&chunk[..n])?;
            reader.consume(n);
            remaining -= n as u64;
        }

        // the declared size is part of the framing; excess input would
        // silently corrupt the archive, so probe for it
        if !reader.fill_buf()?.is_empty() {
            return Err(io::Error::new(
                InvalidInput,
                "file contents longer than the declared size",
            ));
        }

        self.pad_for(size)?;
        self.emit(&wire::TOK_PAR)
    }

    /// Turns this node into a directory. Entries are added through the
    /// returned handle, which must be [closed](Directory::close) for
    /// the archive to be valid.
    pub fn directory(mut self) -> io::Result<Directory<'w, W>> {
        self.emit(&wire::TOK_DIR)?;
        Ok(Directory {
            node: self,
            last_name: None,
        })
    }
}

/// An open directory node.
pub struct Directory<'w, W: Write> {
    node: Node<'w, W>,
    /// Name of the most recent entry. Its closing token is still owed,
    /// and the next entry's name has to sort after it.
    last_name: Option<Vec<u8>>,
}

fn valid_entry_name(name: &[u8]) -> bool {
    !name.is_empty()
        && name.len() <= wire::MAX_NAME_LEN
        && !name.contains(&0)
        && !name.contains(&b'/')
        && name != b"."
        && name != b".."
}

impl<'w, W: Write> Directory<'w, W> {
    /// Opens the next entry of this directory, returning the [Node] to
    /// fill with its content.
    ///
    /// Names must arrive in strictly ascending byte order — the format
    /// has no other legal layout — and the writer only checks this in
    /// debug builds.
    pub fn entry(&mut self, name: &[u8]) -> io::Result<Node<'_, W>> {
        debug_assert!(
            valid_entry_name(name),
            "invalid entry name {:?}",
            String::from_utf8_lossy(name)
        );

        if let Some(last) = self.last_name.replace(name.to_vec()) {
            debug_assert!(
                last.as_slice() < name,
                "entry {:?} not in ascending name order",
                String::from_utf8_lossy(name)
            );
            // terminate the previous entry now that no node can still
            // be writing into it
            self.node.emit(&wire::TOK_PAR)?;
        }

        self.node.emit(&wire::TOK_ENT)?;
        self.node.emit(&(name.len() as u64).to_le_bytes())?;
        self.node.emit(name)?;
        self.node.pad_for(name.len() as u64)?;
        self.node.emit(&wire::TOK_NOD)?;

        Ok(Node {
            out: &mut *self.node.out,
        })
    }

    /// Terminates the directory. Skipping this produces a truncated
    /// archive.
    pub fn close(mut self) -> io::Result<()> {
        if self.last_name.is_some() {
            self.node.emit(&wire::TOK_PAR)?;
        }
        self.node.emit(&wire::TOK_PAR)
    }
}

#[cfg(test)]
mod tests {
    use std::io::BufReader;

    /// NAR of a single empty regular file, as produced by `nix-store
    /// --dump` on one.
    pub const EMPTY_FILE_NAR: &[u8] = &[
        13, 0, 0, 0, 0, 0, 0, 0, b'n', b'i', b'x', b'-', b'a', b'r', b'c', b'h', b'i', b'v',
        b'e', b'-', b'1', 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, b'(', 0, 0, 0, 0, 0, 0, 0, 4, 0, 0,
        0, 0, 0, 0, 0, b't', b'y', b'p', b'e', 0, 0, 0, 0, 7, 0, 0, 0, 0, 0, 0, 0, b'r', b'e',
        b'g', b'u', b'l', b'a', b'r', 0, 8, 0, 0, 0, 0, 0, 0, 0, b'c', b'o', b'n', b't', b'e',
        b'n', b't', b's', 0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, b')', 0, 0, 0, 0, 0,
        0, 0,
    ];

    #[test]
    fn single_file() {
        let mut sink = Vec::new();
        let node = super::open(&mut sink).unwrap();
        node.file(false, 0, &mut BufReader::new(std::io::empty()))
            .unwrap();
        assert_eq!(sink, EMPTY_FILE_NAR);
    }

    #[test]
    fn symlink() {
        let mut sink = Vec::new();
        let node = super::open(&mut sink).unwrap();
        node.symlink(b"/zb/store/somewhere").unwrap();

        // the target lands length-prefixed and zero-padded
        let mut expected = Vec::new();
        expected.extend_from_slice(&super::wire::TOK_NAR);
        expected.extend_from_slice(&super::wire::TOK_SYM);
        expected.extend_from_slice(&19u64.to_le_bytes());
        expected.extend_from_slice(b"/zb/store/somewhere");
        expected.extend_from_slice(&[0; 5]);
        expected.extend_from_slice(&super::wire::TOK_PAR);
        assert_eq!(sink, expected);
    }

    #[test]
    fn file_size_is_enforced() {
        let mut sink = Vec::new();
        let node = super::open(&mut sink).unwrap();
        node.file(false, 8, &mut BufReader::new(&b"short"[..]))
            .expect_err("too little input");

        let mut sink = Vec::new();
        let node = super::open(&mut sink).unwrap();
        node.file(false, 2, &mut BufReader::new(&b"too much"[..]))
            .expect_err("too much input");
    }

    #[test]
    fn directory_tree() {
        let mut sink = Vec::new();
        let node = super::open(&mut sink).unwrap();
        let mut dir = node.directory().unwrap();
        dir.entry(b"a")
            .unwrap()
            .file(false, 3, &mut BufReader::new(&b"foo"[..]))
            .unwrap();
        dir.entry(b"b").unwrap().symlink(b"a").unwrap();
        let sub = dir.entry(b"c").unwrap().directory().unwrap();
        sub.close().unwrap();
        dir.close().unwrap();

        // parses back to the same structure
        let mut rd = &sink[..];
        let root = crate::nar::reader::open(&mut rd).unwrap();
        match root {
            crate::nar::reader::Node::Directory(mut dir) => {
                let mut names = Vec::new();
                while let Some(entry) = dir.next().unwrap() {
                    names.push(entry.name.clone());
                    match entry.node {
                        crate::nar::reader::Node::File { mut reader, .. } => {
                            let mut buf = Vec::new();
                            std::io::Read::read_to_end(&mut reader, &mut buf).unwrap();
                            assert_eq!(buf, b"foo");
                        }
                        crate::nar::reader::Node::Symlink { target } => {
                            assert_eq!(target, b"a");
                        }
                        crate::nar::reader::Node::Directory(mut sub) => {
                            assert!(sub.next().unwrap().is_none());
                        }
                    }
                }
                assert_eq!(names, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
            }
            _ => panic!("expected directory"),
        }
    }

    #[test]
    #[should_panic]
    fn misordered_names() {
        let mut sink = Vec::new();
        let node = super::open(&mut sink).unwrap();
        let mut dir = node.directory().unwrap();
        dir.entry(b"b").unwrap().symlink(b"x").unwrap();
        let _ = dir.entry(b"a");
    }
}
