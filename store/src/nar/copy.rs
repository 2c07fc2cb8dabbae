//! Copying a NAR between streams while validating it.

use std::io::{self, Read, Write};

use super::reader::{self, Node};

/// Copies exactly one NAR from `reader` to `writer`, parsing it along the
/// way. Consumes nothing past the end of the archive, and writes the
/// identical bytes (the encoding is canonical).
///
/// This is what lets `export` streams be framed without a length prefix:
/// the archive's own grammar delimits it.
pub fn copy(reader: &mut dyn Read, writer: &mut dyn Write) -> io::Result<()> {
    let mut tee = Tee {
        reader,
        writer,
        error: None,
    };
    let node = reader::open(&mut tee)?;
    consume(node)?;
    match tee.error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Drives a parsed node to completion, discarding file contents.
fn consume(node: Node) -> io::Result<()> {
    match node {
        Node::Symlink { .. } => Ok(()),
        Node::File { mut reader, .. } => {
            io::copy(&mut reader, &mut io::sink())?;
            Ok(())
        }
        Node::Directory(mut dir) => {
            while let Some(entry) = dir.next()? {
                consume(entry.node)?;
            }
            Ok(())
        }
    }
}

/// A reader that duplicates everything it reads into a writer.
///
/// Write errors are stashed rather than surfaced immediately, so the
/// parser's own framing errors take precedence; [copy] reports the stash
/// at the end.
struct Tee<'a> {
    reader: &'a mut dyn Read,
    writer: &'a mut dyn Write,
    error: Option<io::Error>,
}

impl Read for Tee<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.reader.read(buf)?;
        if n > 0 && self.error.is_none() {
            if let Err(e) = self.writer.write_all(&buf[..n]) {
                self.error = Some(e);
            }
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use std::io::BufReader;

    #[test]
    fn round_trip() {
        let mut nar = Vec::new();
        let node = crate::nar::writer::open(&mut nar).unwrap();
        let mut dir = node.directory().unwrap();
        dir.entry(b"hello")
            .unwrap()
            .file(false, 6, &mut BufReader::new(&b"world\n"[..]))
            .unwrap();
        dir.entry(b"link").unwrap().symlink(b"hello").unwrap();
        dir.close().unwrap();

        // trailing data must remain unconsumed
        let mut input = nar.clone();
        input.extend_from_slice(b"TRAILING");

        let mut out = Vec::new();
        let mut rd = &input[..];
        super::copy(&mut rd, &mut out).unwrap();
        assert_eq!(out, nar);
        assert_eq!(rd, b"TRAILING");
    }

    #[test]
    fn invalid_input_fails() {
        let mut out = Vec::new();
        let mut rd = &b"not a nar"[..];
        super::copy(&mut rd, &mut out).expect_err("must fail");
    }
}
