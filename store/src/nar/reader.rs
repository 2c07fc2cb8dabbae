//! Parsing NAR archives from any [Read] source.
//!
//! The parser accepts exactly the canonical form: padding has to be
//! zero, directory entries have to arrive in strictly ascending name
//! order, and names and targets have to satisfy the bounds from
//! [super::wire]. Consumers drive it cursor-style — a [Node] borrows
//! the underlying stream, so an archive is read by walking its
//! structure to the end (or abandoning the reader entirely).

use std::io::{
    self,
    ErrorKind::{InvalidData, UnexpectedEof},
    Read,
};

use super::wire;

pub type Reader<'a> = dyn Read + 'a;

fn malformed(what: &str) -> io::Error {
    io::Error::new(InvalidData, format!("malformed archive: {}", what))
}

/// Consume a little-endian u64 from the reader.
pub(crate) fn read_u64(reader: &mut Reader) -> io::Result<u64> {
    let mut buf = [0; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Consume a framed byte string of at most `max_len` bytes, along with
/// its padding, which has to be zero.
pub(crate) fn read_bytes(reader: &mut Reader, max_len: usize) -> io::Result<Vec<u8>> {
    let len = read_u64(reader)?;
    if len > max_len as u64 {
        return Err(malformed("string exceeds length bound"));
    }
    let len = len as usize;

    let mut data = vec![0; len];
    reader.read_exact(&mut data)?;

    let pad = (8 - len % 8) % 8;
    if pad != 0 {
        let mut padding = [0u8; 7];
        reader.read_exact(&mut padding[..pad])?;
        if padding[..pad].iter().any(|&b| b != 0) {
            return Err(malformed("nonzero padding"));
        }
    }

    Ok(data)
}

/// Consume a framed string and require it to equal `expected`.
pub(crate) fn expect_bytes(reader: &mut Reader, expected: &[u8]) -> io::Result<()> {
    let actual = read_bytes(reader, expected.len())?;
    if actual != expected {
        return Err(malformed("unexpected token"));
    }
    Ok(())
}

/// Start reading an archive, yielding its root node.
pub fn open<'a, 'r>(reader: &'a mut Reader<'r>) -> io::Result<Node<'a, 'r>> {
    expect_bytes(reader, b"nix-archive-1")?;
    expect_bytes(reader, b"(")?;
    expect_bytes(reader, b"type")?;
    Node::new(reader)
}

pub enum Node<'a, 'r> {
    Symlink {
        target: Vec<u8>,
    },
    File {
        executable: bool,
        reader: FileReader<'a, 'r>,
    },
    Directory(DirReader<'a, 'r>),
}

impl std::fmt::Debug for Node<'_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Node::Symlink { target } => {
                f.debug_struct("Symlink").field("target", target).finish()
            }
            Node::File { executable, .. } => f
                .debug_struct("File")
                .field("executable", executable)
                .finish_non_exhaustive(),
            Node::Directory(_) => f.debug_tuple("Directory").finish_non_exhaustive(),
        }
    }
}

impl<'a, 'r> Node<'a, 'r> {
    /// Parses a node, positioned just past its `type` token.
    ///
    /// Symlinks are read in full here, including their closing token;
    /// files and directories hand the stream to [FileReader] and
    /// [DirReader], which consume their own terminators as they are
    /// driven.
    fn new(reader: &'a mut Reader<'r>) -> io::Result<Self> {
        let kind = read_bytes(reader, 9)?;
        match kind.as_slice() {
            b"symlink" => {
                expect_bytes(reader, b"target")?;
                let target = read_bytes(reader, wire::MAX_TARGET_LEN)?;

                if target.is_empty() || target.contains(&0) {
                    return Err(malformed("invalid symlink target"));
                }

                expect_bytes(reader, b")")?;

                Ok(Node::Symlink { target })
            }
            b"regular" => {
                let marker = read_bytes(reader, 10)?;
                let (executable, len) = match marker.as_slice() {
                    b"contents" => (false, read_u64(reader)?),
                    b"executable" => {
                        expect_bytes(reader, b"")?;
                        expect_bytes(reader, b"contents")?;
                        (true, read_u64(reader)?)
                    }
                    _ => return Err(malformed("unexpected token")),
                };

                Ok(Node::File {
                    executable,
                    reader: FileReader::new(reader, len)?,
                })
            }
            b"directory" => Ok(Node::Directory(DirReader::new(reader))),
            _ => Err(malformed("unknown node type")),
        }
    }
}

/// Streams one file's contents through [Read].
///
/// The reader represents a span of the archive, so partial use is not
/// an option: either drain it completely (its own framing ends it after
/// exactly [FileReader::len] bytes), or abandon the whole archive. Any
/// error likewise poisons the archive reader it came from.
pub struct FileReader<'a, 'r> {
    reader: &'a mut Reader<'r>,
    /// Content bytes still to deliver.
    len: u64,
    /// Zero bytes between the content and its closing token.
    padding: usize,
}

impl<'a, 'r> FileReader<'a, 'r> {
    /// Wraps the stream after the contents length has been read.
    fn new(reader: &'a mut Reader<'r>, len: u64) -> io::Result<Self> {
        let mut file = Self {
            reader,
            len,
            padding: (8 - (len % 8) as usize) % 8,
        };
        // an empty file may never see a read call, so its framing has
        // to be finished here
        if file.len == 0 {
            file.finish()?;
        }
        Ok(file)
    }

    /// Checks the padding and consumes the file's closing token.
    fn finish(&mut self) -> io::Result<()> {
        if self.padding != 0 {
            let mut padding = [0u8; 7];
            self.reader.read_exact(&mut padding[..self.padding])?;
            if padding[..self.padding].iter().any(|&b| b != 0) {
                return Err(malformed("nonzero padding"));
            }
        }
        expect_bytes(self.reader, b")")
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> u64 {
        self.len
    }
}

impl Read for FileReader<'_, '_> {
    fn read(&mut self, mut buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.is_empty() {
            return Ok(0);
        }

        if buf.len() as u64 > self.len {
            buf = &mut buf[..self.len as usize];
        }

        let n = self.reader.read(buf)?;
        if n == 0 {
            return Err(UnexpectedEof.into());
        }
        self.len -= n as u64;

        if self.is_empty() {
            self.finish()?;
        }

        Ok(n)
    }
}

/// Yields a directory's entries, in order.
pub struct DirReader<'a, 'r> {
    reader: &'a mut Reader<'r>,
    /// Name of the entry most recently handed out. Its closing token is
    /// still unread, and it lower-bounds the next legal name.
    last_name: Option<Vec<u8>>,
}

pub struct Entry<'a, 'r> {
    pub name: Vec<u8>,
    pub node: Node<'a, 'r>,
}

impl std::fmt::Debug for Entry<'_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("name", &self.name)
            .field("node", &self.node)
            .finish()
    }
}

impl<'a, 'r> DirReader<'a, 'r> {
    fn new(reader: &'a mut Reader<'r>) -> Self {
        Self {
            reader,
            last_name: None,
        }
    }

    /// Reads the next [Entry], or `None` at the end of the directory.
    ///
    /// This is not an [Iterator] on purpose: each entry borrows the
    /// stream, the previous entry has to be fully drained first, and
    /// hitting `None` (or any error) is final. Adapter-style iterator
    /// use would break all three expectations silently.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> io::Result<Option<Entry>> {
        // the previous entry's node held the stream until now; its
        // closing token is still in front of us
        if self.last_name.is_some() {
            expect_bytes(self.reader, b")")?;
        }

        let marker = read_bytes(self.reader, 5)?;
        match marker.as_slice() {
            b")" => return Ok(None),
            b"entry" => {}
            _ => return Err(malformed("unexpected token")),
        }

        expect_bytes(self.reader, b"(")?;
        expect_bytes(self.reader, b"name")?;

        let name = read_bytes(self.reader, wire::MAX_NAME_LEN)?;

        if name.is_empty()
            || name.contains(&0)
            || name.contains(&b'/')
            || name == b"."
            || name == b".."
        {
            return Err(malformed("invalid entry name"));
        }

        // ascending name order is the only canonical layout
        if let Some(last) = self.last_name.replace(name.clone()) {
            if last >= name {
                return Err(malformed("misordered entry names"));
            }
        }

        expect_bytes(self.reader, b"node")?;
        expect_bytes(self.reader, b"(")?;
        expect_bytes(self.reader, b"type")?;

        Ok(Some(Entry {
            name,
            node: Node::new(&mut self.reader)?,
        }))
    }
}
