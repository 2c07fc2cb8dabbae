//! The `nix-store --export` framing: a stream of zero or more store
//! objects, each a NAR followed by a trailer naming the object.
//!
//! ```plain
//! repeat:
//!   "\x01\0\0\0\0\0\0\0"      -- object marker
//!   <NAR bytes of the object>
//!   "NIXE\0\0\0\0"            -- trailer marker
//!   <store-path: string>
//!   <ref-count: LE64> <ref-i: string>*
//!   <deriver: string>         -- possibly empty
//!   <ca-present: LE64 (0 or 1)>
//!   [ <ca: string> if present ]
//! "\0\0\0\0\0\0\0\0"          -- EOF marker
//! ```
//!
//! Strings use the same framing as NAR strings (LE64 length, bytes, zero
//! padding to 8 bytes).

use std::collections::BTreeSet;
use std::io::{self, ErrorKind::InvalidData, Read, Write};

use crate::ca::ContentAddress;
use crate::nar;
use crate::store_path::StorePath;

pub const OBJECT_MARKER: [u8; 8] = [1, 0, 0, 0, 0, 0, 0, 0];
pub const TRAILER_MARKER: [u8; 8] = *b"NIXE\0\0\0\0";
pub const EOF_MARKER: [u8; 8] = [0; 8];

/// Upper bound on string values in trailers.
const MAX_STRING_LEN: usize = 4096;
/// Upper bound on the number of references in a trailer.
const MAX_REFERENCES: u64 = 100_000;

/// Metadata of an exported store object, following its NAR in the stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Trailer {
    pub store_path: StorePath,
    pub references: BTreeSet<StorePath>,
    pub deriver: Option<StorePath>,
    pub content_address: Option<ContentAddress>,
}

impl Trailer {
    pub fn new(store_path: StorePath) -> Trailer {
        Trailer {
            store_path,
            references: BTreeSet::new(),
            deriver: None,
            content_address: None,
        }
    }
}

fn write_u64(w: &mut dyn Write, n: u64) -> io::Result<()> {
    w.write_all(&n.to_le_bytes())
}

fn write_string(w: &mut dyn Write, s: &[u8]) -> io::Result<()> {
    write_u64(w, s.len() as u64)?;
    w.write_all(s)?;
    let n = s.len() & 7;
    if n != 0 {
        w.write_all(&[0; 8][n..])?;
    }
    Ok(())
}

fn read_string(r: &mut dyn Read, what: &str) -> io::Result<Vec<u8>> {
    nar::reader::read_bytes(r, MAX_STRING_LEN)
        .map_err(|e| io::Error::new(e.kind(), format!("reading {}: {}", what, e)))
}

fn parse_store_path(raw: &[u8], what: &str) -> io::Result<StorePath> {
    let s = std::str::from_utf8(raw)
        .map_err(|_| io::Error::new(InvalidData, format!("{} is not valid UTF-8", what)))?;
    StorePath::parse(s).map_err(|e| io::Error::new(InvalidData, format!("{}: {}", what, e)))
}

enum WriterState {
    /// Between objects; an object or the EOF marker may come next.
    Ready,
    /// An object marker has been written; NAR bytes are being streamed
    /// and a trailer must follow before anything else.
    InObject,
    Finished,
}

/// Streaming writer for the export format.
///
/// Usage: call [Writer::object], stream the object's NAR into the writer
/// (it implements [Write] while an object is open), then call
/// [Writer::trailer]. Repeat for further objects and call
/// [Writer::finish] at the end; finishing with an unterminated object is
/// an error.
pub struct Writer<W: Write> {
    inner: W,
    state: WriterState,
}

impl<W: Write> Writer<W> {
    pub fn new(inner: W) -> Writer<W> {
        Writer {
            inner,
            state: WriterState::Ready,
        }
    }

    /// Begins a new store object. The caller must write the object's NAR
    /// through the [Write] impl next.
    pub fn object(&mut self) -> io::Result<()> {
        match self.state {
            WriterState::Ready => {
                self.inner.write_all(&OBJECT_MARKER)?;
                self.state = WriterState::InObject;
                Ok(())
            }
            _ => Err(io::Error::other("object started in wrong state")),
        }
    }

    /// Terminates the current object with its trailer.
    pub fn trailer(&mut self, t: &Trailer) -> io::Result<()> {
        match self.state {
            WriterState::InObject => {}
            _ => return Err(io::Error::other("trailer written without an object")),
        }

        self.inner.write_all(&TRAILER_MARKER)?;
        write_string(&mut self.inner, t.store_path.as_str().as_bytes())?;
        write_u64(&mut self.inner, t.references.len() as u64)?;
        for r in &t.references {
            write_string(&mut self.inner, r.as_str().as_bytes())?;
        }
        write_string(
            &mut self.inner,
            t.deriver.as_ref().map(|d| d.as_str()).unwrap_or("").as_bytes(),
        )?;
        match &t.content_address {
            None => write_u64(&mut self.inner, 0)?,
            Some(ca) => {
                write_u64(&mut self.inner, 1)?;
                write_string(&mut self.inner, ca.to_string().as_bytes())?;
            }
        }

        self.state = WriterState::Ready;
        Ok(())
    }

    /// Convenience: write a whole object from an in-memory NAR.
    pub fn write_object(&mut self, nar: &[u8], t: &Trailer) -> io::Result<()> {
        self.object()?;
        self.write_all(nar)?;
        self.trailer(t)
    }

    /// Writes the EOF marker and returns the underlying writer.
    ///
    /// Refuses to finish if a NAR has been written without a trailer.
    pub fn finish(mut self) -> io::Result<W> {
        match self.state {
            WriterState::Ready => {
                self.inner.write_all(&EOF_MARKER)?;
                self.inner.flush()?;
                self.state = WriterState::Finished;
                Ok(self.inner)
            }
            _ => Err(io::Error::other(
                "export stream finished with an unterminated object",
            )),
        }
    }
}

impl<W: Write> Write for Writer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.state {
            WriterState::InObject => self.inner.write(buf),
            _ => Err(io::Error::other("NAR bytes written outside an object")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Streaming reader for the export format.
///
/// The NAR of each object is pushed into the sink passed to
/// [Reader::next_object], since the trailer (and thus the object's
/// identity) only becomes known after the archive bytes.
///
/// Trailing data after the EOF marker is left unconsumed, so callers may
/// keep using the underlying stream.
pub struct Reader<R: Read> {
    inner: R,
    done: bool,
}

impl<R: Read> Reader<R> {
    pub fn new(inner: R) -> Reader<R> {
        Reader { inner, done: false }
    }

    /// Reads the next object, streaming its NAR into `nar_sink`, and
    /// returns its trailer. Returns `None` at the EOF marker.
    pub fn next_object(&mut self, nar_sink: &mut dyn Write) -> io::Result<Option<Trailer>> {
        if self.done {
            return Ok(None);
        }

        let mut marker = [0u8; 8];
        self.inner.read_exact(&mut marker)?;
        if marker == EOF_MARKER {
            self.done = true;
            return Ok(None);
        }
        if marker != OBJECT_MARKER {
            return Err(io::Error::new(InvalidData, "invalid object marker"));
        }

        nar::copy(&mut self.inner, nar_sink)?;

        let mut trailer_marker = [0u8; 8];
        self.inner.read_exact(&mut trailer_marker)?;
        if trailer_marker != TRAILER_MARKER {
            return Err(io::Error::new(InvalidData, "invalid trailer marker"));
        }

        self.read_trailer().map(Some)
    }

    fn read_trailer(&mut self) -> io::Result<Trailer> {
        let store_path = parse_store_path(&read_string(&mut self.inner, "store path")?, "store path")?;

        let ref_count = nar::reader::read_u64(&mut self.inner)?;
        if ref_count > MAX_REFERENCES {
            return Err(io::Error::new(InvalidData, "excessive reference count"));
        }
        let mut references = BTreeSet::new();
        for _ in 0..ref_count {
            references.insert(parse_store_path(
                &read_string(&mut self.inner, "reference")?,
                "reference",
            )?);
        }

        let deriver_raw = read_string(&mut self.inner, "deriver")?;
        let deriver = if deriver_raw.is_empty() {
            None
        } else {
            Some(parse_store_path(&deriver_raw, "deriver")?)
        };

        let content_address = match nar::reader::read_u64(&mut self.inner)? {
            0 => None,
            1 => {
                let raw = read_string(&mut self.inner, "content address")?;
                let s = std::str::from_utf8(&raw).map_err(|_| {
                    io::Error::new(InvalidData, "content address is not valid UTF-8")
                })?;
                Some(
                    ContentAddress::parse(s)
                        .map_err(|e| io::Error::new(InvalidData, e.to_string()))?,
                )
            }
            _ => return Err(io::Error::new(InvalidData, "invalid content address flag")),
        };

        Ok(Trailer {
            store_path,
            references,
            deriver,
            content_address,
        })
    }

    /// Returns the underlying reader, positioned just after the EOF
    /// marker.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;

    fn sample_nar(contents: &[u8]) -> Vec<u8> {
        let mut nar = Vec::new();
        let node = nar::writer::open(&mut nar).unwrap();
        node.file(false, contents.len() as u64, &mut BufReader::new(contents))
            .unwrap();
        nar
    }

    fn path(s: &str) -> StorePath {
        StorePath::parse(s).unwrap()
    }

    #[test]
    fn round_trip() {
        let p = path("/zb/store/00bgd045z0d4icpbc2yyz4gx48ak44la-p");
        let q = path("/zb/store/xp46jjlpnbvqzyqvcwpxlbdzlmzqc12c-q");
        let r = path("/zb/store/aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-r");

        let trailer = Trailer {
            store_path: p,
            references: [q, r].into_iter().collect(),
            deriver: None,
            content_address: None,
        };
        let nar = sample_nar(b"hi");

        let mut w = Writer::new(Vec::new());
        w.write_object(&nar, &trailer).unwrap();
        let mut stream = w.finish().unwrap();

        // keep bytes after the EOF marker to prove they stay unconsumed
        stream.extend_from_slice(b"AFTER");

        let mut r = Reader::new(&stream[..]);
        let mut nar_out = Vec::new();
        let got = r.next_object(&mut nar_out).unwrap().expect("one object");
        assert_eq!(got, trailer);
        assert_eq!(nar_out, nar);

        assert!(r.next_object(&mut Vec::new()).unwrap().is_none());
        assert_eq!(r.into_inner(), b"AFTER");
    }

    #[test]
    fn trailer_with_deriver_and_ca() {
        let trailer = Trailer {
            store_path: path("/zb/store/00bgd045z0d4icpbc2yyz4gx48ak44la-p"),
            references: BTreeSet::new(),
            deriver: Some(path("/zb/store/xp46jjlpnbvqzyqvcwpxlbdzlmzqc12c-p.drv")),
            content_address: Some(
                ContentAddress::Text(crate::hash::sha256_sum(b"hi")),
            ),
        };

        let mut w = Writer::new(Vec::new());
        w.write_object(&sample_nar(b"hi"), &trailer).unwrap();
        let stream = w.finish().unwrap();

        let mut r = Reader::new(&stream[..]);
        let got = r.next_object(&mut Vec::new()).unwrap().unwrap();
        assert_eq!(got, trailer);
    }

    #[test]
    fn empty_stream() {
        let w = Writer::new(Vec::new());
        let stream = w.finish().unwrap();
        assert_eq!(stream, EOF_MARKER);

        let mut r = Reader::new(&stream[..]);
        assert!(r.next_object(&mut Vec::new()).unwrap().is_none());
    }

    #[test]
    fn finish_requires_trailer() {
        let mut w = Writer::new(Vec::new());
        w.object().unwrap();
        std::io::Write::write_all(&mut w, &sample_nar(b"hi")).unwrap();
        w.finish().expect_err("must refuse to finish mid-object");
    }

    #[test]
    fn garbage_marker() {
        let mut r = Reader::new(&b"XXXXXXXX"[..]);
        r.next_object(&mut Vec::new()).expect_err("must fail");
    }
}
