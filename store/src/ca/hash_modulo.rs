//! A streaming filter that replaces every occurrence of a fixed byte
//! string and records where it did so.
//!
//! This is the scanning primitive behind self-reference detection: the
//! store object's own digest is the modulus, and the replacement is the
//! same number of zero bytes, so the hash of the filtered stream is
//! independent of the digest.

use std::io::{self, Read};

/// Replaces non-overlapping occurrences of `modulus` in `buf` with
/// `replacement` (same length), returning the ascending match offsets.
pub fn replace_all(buf: &mut [u8], modulus: &[u8], replacement: &[u8]) -> Vec<usize> {
    assert_eq!(modulus.len(), replacement.len());
    assert!(!modulus.is_empty());

    let mut offsets = Vec::new();
    let mut i = 0;
    while i + modulus.len() <= buf.len() {
        if &buf[i..i + modulus.len()] == modulus {
            buf[i..i + modulus.len()].copy_from_slice(replacement);
            offsets.push(i);
            i += modulus.len();
        } else {
            i += 1;
        }
    }
    offsets
}

/// A [Read] adapter whose output is its input with every occurrence of
/// `modulus` replaced by `replacement`, and whose side effect is the list
/// of output-stream offsets at which a replacement happened.
///
/// Matches spanning the caller's (or our own) buffer boundaries are
/// handled; the result is deterministic and independent of read sizes.
pub struct HashModuloReader<R> {
    inner: R,
    modulus: Box<[u8]>,
    replacement: Box<[u8]>,
    /// Processed bytes ready to hand out, and the read cursor into them.
    out: Vec<u8>,
    out_pos: usize,
    /// Unprocessed window; its first byte is at stream offset
    /// `tail_base`.
    tail: Vec<u8>,
    tail_base: u64,
    /// Leading bytes of `tail` that may not begin a match (they are the
    /// trailing part of an already-replaced occurrence).
    protected: usize,
    offsets: Vec<u64>,
    eof: bool,
}

impl<R: Read> HashModuloReader<R> {
    pub fn new(inner: R, modulus: impl Into<Vec<u8>>, replacement: impl Into<Vec<u8>>) -> Self {
        let modulus = modulus.into();
        let replacement = replacement.into();
        assert!(!modulus.is_empty(), "modulus must be non-empty");
        assert_eq!(
            modulus.len(),
            replacement.len(),
            "replacement must have the modulus' length"
        );

        HashModuloReader {
            inner,
            modulus: modulus.into_boxed_slice(),
            replacement: replacement.into_boxed_slice(),
            out: Vec::new(),
            out_pos: 0,
            tail: Vec::new(),
            tail_base: 0,
            protected: 0,
            offsets: Vec::new(),
            eof: false,
        }
    }

    /// Replaces occurrences with zero bytes of the same length.
    pub fn zeroing(inner: R, modulus: impl Into<Vec<u8>>) -> Self {
        let modulus = modulus.into();
        let replacement = vec![0u8; modulus.len()];
        Self::new(inner, modulus, replacement)
    }

    /// Output-stream offsets of the replacements made so far. Complete
    /// once the reader has returned EOF.
    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    pub fn into_offsets(self) -> Vec<u64> {
        self.offsets
    }

    /// Scans `self.tail`, replacing matches, and moves bytes that can no
    /// longer participate in a match into `self.out`.
    fn process_tail(&mut self, at_eof: bool) {
        let m = self.modulus.len();

        let mut i = self.protected;
        let mut replaced_end = self.protected;
        while i + m <= self.tail.len() {
            if self.tail[i..i + m] == *self.modulus {
                self.tail[i..i + m].copy_from_slice(&self.replacement);
                self.offsets.push(self.tail_base + i as u64);
                i += m;
                replaced_end = i;
            } else {
                i += 1;
            }
        }

        // Everything except the last m-1 bytes has either been replaced
        // or can no longer start a match.
        let keep_from = if at_eof {
            self.tail.len()
        } else {
            self.tail.len().saturating_sub(m - 1)
        };

        self.out.extend_from_slice(&self.tail[..keep_from]);
        self.tail.drain(..keep_from);
        self.tail_base += keep_from as u64;
        self.protected = replaced_end.saturating_sub(keep_from);
    }

    /// Refills `self.out`, reading from the underlying stream as needed.
    fn fill(&mut self) -> io::Result<()> {
        debug_assert!(self.out_pos >= self.out.len());
        self.out.clear();
        self.out_pos = 0;

        let mut chunk = [0u8; 8192];
        while self.out.is_empty() && !self.eof {
            let n = self.inner.read(&mut chunk)?;
            if n == 0 {
                self.eof = true;
                self.process_tail(true);
                break;
            }
            self.tail.extend_from_slice(&chunk[..n]);
            self.process_tail(false);
        }
        Ok(())
    }
}

impl<R: Read> Read for HashModuloReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.out_pos >= self.out.len() {
            if self.eof {
                return Ok(0);
            }
            self.fill()?;
            if self.out.is_empty() {
                return Ok(0);
            }
        }

        let n = buf.len().min(self.out.len() - self.out_pos);
        buf[..n].copy_from_slice(&self.out[self.out_pos..self.out_pos + n]);
        self.out_pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    /// Reader yielding its input in fixed-size pieces, to exercise
    /// boundary handling.
    struct Chunked<'a> {
        data: &'a [u8],
        chunk: usize,
    }

    impl Read for Chunked<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.chunk.min(self.data.len()).min(buf.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    fn run(input: &[u8], modulus: &[u8], chunk: usize) -> (Vec<u8>, Vec<u64>) {
        let mut r = HashModuloReader::zeroing(Chunked { data: input, chunk }, modulus);
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        let offsets = r.into_offsets();
        (out, offsets)
    }

    #[rstest]
    #[case::one_byte_reads(1)]
    #[case::tiny_reads(3)]
    #[case::mid_reads(7)]
    #[case::large_reads(8192)]
    fn matches_across_any_chunking(#[case] chunk: usize) {
        let input = b"xxABCyyABCABCzzAB";
        let (out, offsets) = run(input, b"ABC", chunk);
        assert_eq!(out, b"xx\0\0\0yy\0\0\0\0\0\0zzAB");
        assert_eq!(offsets, vec![2, 7, 10]);
    }

    #[test]
    fn no_matches() {
        let (out, offsets) = run(b"hello world", b"ABC", 4);
        assert_eq!(out, b"hello world");
        assert!(offsets.is_empty());
    }

    #[test]
    fn overlapping_occurrences_are_not_double_counted() {
        // "aaaa" contains "aa" at 0, 1, 2; non-overlapping matches are 0
        // and 2.
        let (out, offsets) = run(b"aaaa", b"aa", 1);
        assert_eq!(out, b"\0\0\0\0");
        assert_eq!(offsets, vec![0, 2]);
    }

    #[test]
    fn replacement_tail_does_not_start_a_match() {
        // modulus starting with zero bytes: the zeros written by a
        // replacement must not themselves be treated as a match start.
        let mut input = Vec::new();
        input.extend_from_slice(b"\0\0q");
        input.extend_from_slice(b"\0\0q");
        let (out, offsets) = run(&input, b"\0\0q", 2);
        assert_eq!(out, b"\0\0\0\0\0\0");
        assert_eq!(offsets, vec![0, 3]);
    }

    #[test]
    fn whole_input_is_modulus() {
        let (out, offsets) = run(b"ABC", b"ABC", 1);
        assert_eq!(out, b"\0\0\0");
        assert_eq!(offsets, vec![0]);
    }

    #[test]
    fn replace_all_in_place() {
        let mut buf = b"xxABCyyABC".to_vec();
        let offsets = replace_all(&mut buf, b"ABC", b"XYZ");
        assert_eq!(buf, b"xxXYZyyXYZ");
        assert_eq!(offsets, vec![2, 7]);
    }
}
