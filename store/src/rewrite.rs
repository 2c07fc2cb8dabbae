//! Applying self-reference rewrites to a serialized store object.
//!
//! A [SelfReferenceAnalysis](crate::ca::SelfReferenceAnalysis) records
//! *where* a temporary digest appears in a NAR; the rewriters here turn
//! that record into bytes: the final digest itself, and, for Mach-O
//! executables, the recomputed ad-hoc code-signature hash slots and
//! LC_UUID that cover those bytes.

use std::io::{self, Read, Seek, SeekFrom, Write};

use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Hash function used by a Mach-O code directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MachOHashType {
    Sha1,
    Sha256,
    /// sha256 truncated to the first 20 bytes.
    Sha256Truncated,
}

impl MachOHashType {
    /// Decodes the `hashType` field of a code directory.
    pub fn from_code_directory(value: u8) -> Option<MachOHashType> {
        match value {
            1 => Some(MachOHashType::Sha1),
            2 => Some(MachOHashType::Sha256),
            3 => Some(MachOHashType::Sha256Truncated),
            _ => None,
        }
    }

    pub fn digest_len(&self) -> usize {
        match self {
            MachOHashType::Sha1 => 20,
            MachOHashType::Sha256 => 32,
            MachOHashType::Sha256Truncated => 20,
        }
    }

    fn hash(&self, data: &[u8]) -> Vec<u8> {
        match self {
            MachOHashType::Sha1 => Sha1::digest(data).to_vec(),
            MachOHashType::Sha256 => Sha256::digest(data).to_vec(),
            MachOHashType::Sha256Truncated => Sha256::digest(data)[..20].to_vec(),
        }
    }
}

/// A single rewrite action against a NAR image.
///
/// Offsets are absolute byte offsets into the NAR stream the analysis was
/// computed over.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rewriter {
    /// An occurrence of the object's own digest; replaced with the new
    /// digest, whose length must equal the original's.
    SelfReferenceOffset(u64),
    /// The LC_UUID value of a Mach-O image, recomputed as a UUIDv8 from
    /// the hash of the rewritten image.
    MachOUuid {
        image_start: u64,
        uuid_start: u64,
        code_end: u64,
    },
    /// The code hash slots of an ad-hoc, linker-signed Mach-O code
    /// signature, recomputed over the rewritten image.
    MachOSignature {
        image_start: u64,
        code_end: u64,
        /// Bytes per page; `<= 1` means a single hash of the entire
        /// image.
        page_size: u64,
        hash_type: MachOHashType,
        /// Offset of the first code hash slot.
        hash_offset: u64,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum RewriteError {
    #[error("new digest is empty")]
    EmptyDigest,
    #[error("rewrite at offset {offset} lies before the buffer base {base}")]
    OutOfRange { offset: u64, base: u64 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Rewriter {
    /// First byte the rewriter replaces.
    pub fn write_offset(&self) -> u64 {
        match *self {
            Rewriter::SelfReferenceOffset(n) => n,
            Rewriter::MachOUuid { uuid_start, .. } => uuid_start,
            Rewriter::MachOSignature { hash_offset, .. } => hash_offset,
        }
    }

    /// Byte range (start inclusive, end exclusive) the rewriter needs as
    /// context to compute its replacement. An empty range means no
    /// context is required.
    pub fn read_range(&self) -> (u64, u64) {
        match *self {
            Rewriter::SelfReferenceOffset(n) => (n, n),
            Rewriter::MachOUuid {
                image_start,
                code_end,
                ..
            }
            | Rewriter::MachOSignature {
                image_start,
                code_end,
                ..
            } => (image_start, code_end),
        }
    }

    /// Computes the replacement payload. `context` yields exactly the
    /// bytes of [Rewriter::read_range].
    pub fn rewrite(&self, new_digest: &str, context: &mut dyn Read) -> io::Result<Vec<u8>> {
        match *self {
            Rewriter::SelfReferenceOffset(_) => Ok(new_digest.as_bytes().to_vec()),

            Rewriter::MachOUuid {
                image_start,
                uuid_start,
                ..
            } => {
                // Hash the image with the 16 UUID bytes treated as
                // zeros, then derive an RFC 9562 UUIDv8 from the digest.
                let mut hasher = Sha256::new();
                copy_n(context, &mut hasher, uuid_start - image_start)?;

                let mut uuid = [0u8; 16];
                context.read_exact(&mut uuid)?;
                hasher.update([0u8; 16]);

                io::copy(context, &mut HashWriter(&mut hasher))?;

                let digest = hasher.finalize();
                let mut uuid: [u8; 16] = digest[..16].try_into().unwrap();
                uuid[6] = (uuid[6] & 0x0f) | 0x80; // version 8
                uuid[8] = (uuid[8] & 0x3f) | 0x80; // variant 0b10
                Ok(uuid.to_vec())
            }

            Rewriter::MachOSignature {
                page_size,
                hash_type,
                ..
            } => {
                let mut out = Vec::new();
                if page_size <= 1 {
                    let mut image = Vec::new();
                    context.read_to_end(&mut image)?;
                    out.extend_from_slice(&hash_type.hash(&image));
                    return Ok(out);
                }

                let mut page = vec![0u8; page_size as usize];
                loop {
                    let n = read_full(context, &mut page)?;
                    if n == 0 {
                        break;
                    }
                    out.extend_from_slice(&hash_type.hash(&page[..n]));
                    if n < page.len() {
                        break;
                    }
                }
                Ok(out)
            }
        }
    }
}

/// Applies `rewriters`, in the given order, to a seekable buffer holding
/// NAR bytes starting at `base_offset` of the original stream.
///
/// Each rewriter's context is read back from the buffer, so a rewriter
/// observes the writes of the rewriters before it; the analysis orders a
/// Mach-O image's UUID and signature rewrites after the self references
/// they cover so the recomputed hashes span the final bytes.
pub fn rewrite<F: Read + Write + Seek>(
    buf: &mut F,
    base_offset: u64,
    new_digest: &str,
    rewriters: &[Rewriter],
) -> Result<(), RewriteError> {
    if new_digest.is_empty() {
        return Err(RewriteError::EmptyDigest);
    }

    for rw in rewriters {
        let (start, end) = rw.read_range();
        if start < base_offset || rw.write_offset() < base_offset {
            return Err(RewriteError::OutOfRange {
                offset: start.min(rw.write_offset()),
                base: base_offset,
            });
        }

        let payload = if start == end {
            rw.rewrite(new_digest, &mut io::empty())?
        } else {
            buf.seek(SeekFrom::Start(start - base_offset))?;
            let mut limited = LimitedRead {
                inner: buf,
                remaining: end - start,
            };
            rw.rewrite(new_digest, &mut limited)?
        };

        buf.seek(SeekFrom::Start(rw.write_offset() - base_offset))?;
        buf.write_all(&payload)?;
    }

    buf.flush()?;
    Ok(())
}

struct LimitedRead<'a, F> {
    inner: &'a mut F,
    remaining: u64,
}

impl<F: Read> Read for LimitedRead<'_, F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let cap = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let n = self.inner.read(&mut buf[..cap])?;
        self.remaining -= n as u64;
        Ok(n)
    }
}

struct HashWriter<'a>(&'a mut Sha256);

impl Write for HashWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn copy_n(r: &mut dyn Read, hasher: &mut Sha256, mut n: u64) -> io::Result<()> {
    let mut buf = [0u8; 8192];
    while n > 0 {
        let want = buf.len().min(n.min(usize::MAX as u64) as usize);
        let got = r.read(&mut buf[..want])?;
        if got == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        hasher.update(&buf[..got]);
        n -= got as u64;
    }
    Ok(())
}

/// Reads until `buf` is full or EOF; returns the number of bytes read.
fn read_full(r: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn self_reference_substitution() {
        let old = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        let new = "1w01xxn8f7s9s4n65ry6rwd7x9awf04s";
        let data = format!("prefix /zb/store/{}-x suffix", old);
        let mut buf = Cursor::new(data.clone().into_bytes());

        let offset = data.find(old).unwrap() as u64;
        rewrite(
            &mut buf,
            0,
            new,
            &[Rewriter::SelfReferenceOffset(offset)],
        )
        .unwrap();

        let got = String::from_utf8(buf.into_inner()).unwrap();
        assert_eq!(got, data.replace(old, new));
    }

    #[test]
    fn base_offset_shifts_the_buffer() {
        // buffer holds the stream starting at offset 100
        let mut buf = Cursor::new(b"0123456789".to_vec());
        rewrite(&mut buf, 100, "XX", &[Rewriter::SelfReferenceOffset(104)]).unwrap();
        assert_eq!(buf.into_inner(), b"0123XX6789");
    }

    #[test]
    fn empty_digest_rejected() {
        let mut buf = Cursor::new(Vec::new());
        assert!(matches!(
            rewrite(&mut buf, 0, "", &[]),
            Err(RewriteError::EmptyDigest)
        ));
    }

    #[test]
    fn uuid_is_version8_and_deterministic() {
        // image: 8 bytes preamble, 16 uuid bytes, 8 bytes tail
        let mut image = Vec::new();
        image.extend_from_slice(b"preamble");
        image.extend_from_slice(&[0xAA; 16]);
        image.extend_from_slice(b"tailtail");

        let rw = Rewriter::MachOUuid {
            image_start: 0,
            uuid_start: 8,
            code_end: 32,
        };

        let mut buf = Cursor::new(image.clone());
        rewrite(&mut buf, 0, "ignored", &[rw.clone()]).unwrap();
        let out = buf.into_inner();

        let uuid = &out[8..24];
        assert_eq!(uuid[6] >> 4, 8, "UUID version must be 8");
        assert_eq!(uuid[8] >> 6, 0b10, "UUID variant must be 0b10");

        // the existing UUID bytes don't affect the result
        let mut image2 = image.clone();
        image2[8..24].copy_from_slice(&[0x55; 16]);
        let mut buf2 = Cursor::new(image2);
        rewrite(&mut buf2, 0, "ignored", &[rw]).unwrap();
        assert_eq!(buf2.into_inner()[8..24], out[8..24]);

        // the hash input is the image with a zeroed uuid field
        let mut reference = image.clone();
        reference[8..24].copy_from_slice(&[0; 16]);
        let digest = sha2::Sha256::digest(&reference);
        let mut expect: [u8; 16] = digest[..16].try_into().unwrap();
        expect[6] = (expect[6] & 0x0f) | 0x80;
        expect[8] = (expect[8] & 0x3f) | 0x80;
        assert_eq!(out[8..24], expect);
    }

    #[test]
    fn signature_single_hash() {
        let image = b"0123456789abcdef".to_vec();
        let mut with_slots = image.clone();
        with_slots.extend_from_slice(&[0u8; 32]);

        let rw = Rewriter::MachOSignature {
            image_start: 0,
            code_end: 16,
            page_size: 0,
            hash_type: MachOHashType::Sha256,
            hash_offset: 16,
        };

        let mut buf = Cursor::new(with_slots);
        rewrite(&mut buf, 0, "ignored", &[rw]).unwrap();
        let out = buf.into_inner();
        assert_eq!(&out[16..48], sha2::Sha256::digest(&image).as_slice());
    }

    #[test]
    fn signature_pages_with_short_tail() {
        // 3 pages of 4 bytes, the last short (2 bytes)
        let image = b"aaaabbbbcc".to_vec();
        let mut with_slots = image.clone();
        with_slots.extend_from_slice(&[0u8; 60]);

        let rw = Rewriter::MachOSignature {
            image_start: 0,
            code_end: 10,
            page_size: 4,
            hash_type: MachOHashType::Sha256Truncated,
            hash_offset: 10,
        };

        let mut buf = Cursor::new(with_slots);
        rewrite(&mut buf, 0, "ignored", &[rw]).unwrap();
        let out = buf.into_inner();

        let mut expect = Vec::new();
        expect.extend_from_slice(&sha2::Sha256::digest(b"aaaa")[..20]);
        expect.extend_from_slice(&sha2::Sha256::digest(b"bbbb")[..20]);
        expect.extend_from_slice(&sha2::Sha256::digest(b"cc")[..20]);
        assert_eq!(&out[10..70], &expect[..]);
    }

    #[test]
    fn later_rewrites_observe_earlier_writes() {
        // a self-reference replacement inside the image must show up in
        // the signature hash computed afterwards
        let old = "OLD!";
        let mut image = Vec::new();
        image.extend_from_slice(b"head");
        image.extend_from_slice(old.as_bytes());
        image.extend_from_slice(&[0u8; 32]); // hash slot

        let rewriters = [
            Rewriter::SelfReferenceOffset(4),
            Rewriter::MachOSignature {
                image_start: 0,
                code_end: 8,
                page_size: 0,
                hash_type: MachOHashType::Sha256,
                hash_offset: 8,
            },
        ];

        let mut buf = Cursor::new(image);
        rewrite(&mut buf, 0, "NEW!", &rewriters).unwrap();
        let out = buf.into_inner();

        assert_eq!(&out[..8], b"headNEW!");
        assert_eq!(&out[8..40], sha2::Sha256::digest(b"headNEW!").as_slice());
    }
}
