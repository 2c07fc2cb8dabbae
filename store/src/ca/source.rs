//! The canonical hash algorithm for "source" store objects:
//! recursive-file sha256 with self-reference handling.
//!
//! When a store object is first produced it lives under a *temporary*
//! digest; any occurrence of that digest inside the object's own bytes is
//! a self reference. This module hashes the NAR serialization with those
//! occurrences zeroed, so the final path can be computed, and records a
//! [SelfReferenceAnalysis] so the bytes can later be patched to the final
//! digest without re-serializing — including recomputing the ad-hoc code
//! signature and LC_UUID of Mach-O executables whose pages cover the
//! patched bytes.
//!
//! To distinguish this algorithm from plain NAR hashing (and from Nix's
//! upstream variant), a single `|` byte is appended to the hash stream
//! after the archive, followed by `|<decimal offset>` for every self
//! reference found.

use std::io::{self, Cursor, ErrorKind::InvalidData, Read, Seek, SeekFrom, Write};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::ca::hash_modulo::{replace_all, HashModuloReader};
use crate::ca::{macho, ContentAddress};
use crate::hash::Hash;
use crate::nar::wire;
use crate::rewrite::Rewriter;

/// Seekable scratch storage used to analyze Mach-O images.
pub trait Spool: Read + Write + Seek + Send {}
impl<T: Read + Write + Seek + Send> Spool for T {}

/// Allocator for spool buffers; receives the upper size bound.
pub type CreateTemp = Box<dyn FnMut(u64) -> io::Result<Box<dyn Spool>> + Send>;

/// Options for [source_sha256_content_address].
#[derive(Default)]
pub struct SourceOptions {
    /// The temporary digest of the object being addressed. Empty means
    /// no self-reference handling: the result is then the sha256 of the
    /// NAR bytes followed by `|`.
    pub digest: String,
    /// Where to spool file contents that need look-back (Mach-O images
    /// can be multiple MB and should not be buffered in RAM
    /// unconditionally). In-memory buffers are used when absent.
    pub create_temp: Option<CreateTemp>,
    /// Diagnostics sink, in addition to `tracing`.
    pub log: Option<Box<dyn FnMut(&str) + Send>>,
}

impl SourceOptions {
    pub fn with_digest(digest: impl Into<String>) -> SourceOptions {
        SourceOptions {
            digest: digest.into(),
            ..Default::default()
        }
    }

    /// A [CreateTemp] backed by unlinked temporary files.
    pub fn temp_file_spool() -> CreateTemp {
        Box::new(|_size| {
            let f = tempfile::tempfile()?;
            Ok(Box::new(f) as Box<dyn Spool>)
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("store object digest occurs in entry name {path:?}")]
    DigestInName { path: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Metadata of a NAR entry involved in self-reference rewriting.
/// Symlink targets are deliberately not retained.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NarHeader {
    /// `/`-joined path of the entry inside the archive; empty for the
    /// root node.
    pub path: String,
    pub executable: bool,
    /// Content size in bytes (target length for symlinks).
    pub size: u64,
    /// NAR stream offset of the entry's content bytes.
    pub content_offset: u64,
}

/// Where a store object refers to itself, expressed as rewrite actions
/// against the NAR byte stream.
#[derive(Debug, Default)]
pub struct SelfReferenceAnalysis {
    /// Rewrites in application order: within each file, plain
    /// self-reference substitutions come first, then (for Mach-O images)
    /// the UUID and code-signature recomputations that must observe
    /// them. Apart from that, the list ascends by write offset.
    pub rewrites: Vec<Rewriter>,
    /// Headers of the NAR entries whose contents are involved in
    /// rewriting.
    pub paths: Vec<NarHeader>,
    /// Permutation of `rewrites` sorted by write offset.
    order: Vec<usize>,
}

impl SelfReferenceAnalysis {
    pub fn is_empty(&self) -> bool {
        self.rewrites.is_empty()
    }

    /// All rewrites whose write offset lies in `[start, end)`, in write
    /// offset order.
    pub fn rewrites_in_range(&self, start: u64, end: u64) -> Vec<&Rewriter> {
        let lo = self
            .order
            .partition_point(|&i| self.rewrites[i].write_offset() < start);
        let hi = self
            .order
            .partition_point(|&i| self.rewrites[i].write_offset() < end);
        self.order[lo..hi].iter().map(|&i| &self.rewrites[i]).collect()
    }

    /// Applies all rewrites to a buffer holding the NAR bytes starting
    /// at `base_offset`.
    pub fn apply<F: Read + Write + Seek>(
        &self,
        buf: &mut F,
        base_offset: u64,
        new_digest: &str,
    ) -> Result<(), crate::rewrite::RewriteError> {
        crate::rewrite::rewrite(buf, base_offset, new_digest, &self.rewrites)
    }

    fn finish(mut self) -> SelfReferenceAnalysis {
        let mut order: Vec<usize> = (0..self.rewrites.len()).collect();
        order.sort_by_key(|&i| self.rewrites[i].write_offset());
        self.order = order;
        self
    }
}

/// Computes the content address of a "source" store object from its NAR
/// serialization, detecting self references along the way.
///
/// Single-pass over `nar`: look-back for Mach-O analysis is spooled to
/// `opts.create_temp` buffers (or memory).
pub fn source_sha256_content_address(
    nar: &mut dyn Read,
    opts: SourceOptions,
) -> Result<(ContentAddress, SelfReferenceAnalysis), SourceError> {
    let mut analyzer = Analyzer {
        input: CountingRead {
            inner: nar,
            offset: 0,
        },
        hasher: Sha256::new(),
        digest: opts.digest.into_bytes(),
        create_temp: opts.create_temp,
        log: opts.log,
        analysis: SelfReferenceAnalysis::default(),
    };

    analyzer.expect_token(b"nix-archive-1")?;
    analyzer.expect_token(b"(")?;
    analyzer.expect_token(b"type")?;
    let mut path = Vec::new();
    analyzer.node(&mut path)?;

    // Trailing differentiator, then one reference text per self
    // reference. Mach-O rewrites never contribute reference text.
    analyzer.hasher.update(b"|");
    for rw in &analyzer.analysis.rewrites {
        if let Rewriter::SelfReferenceOffset(n) = rw {
            analyzer.hasher.update(b"|");
            analyzer.hasher.update(n.to_string().as_bytes());
        }
    }

    let hash = Hash::Sha256(analyzer.hasher.finalize().into());
    Ok((
        ContentAddress::Recursive(hash),
        analyzer.analysis.finish(),
    ))
}

struct CountingRead<'a> {
    inner: &'a mut dyn Read,
    offset: u64,
}

impl Read for CountingRead<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.offset += n as u64;
        Ok(n)
    }
}

struct Analyzer<'a> {
    input: CountingRead<'a>,
    hasher: Sha256,
    digest: Vec<u8>,
    create_temp: Option<CreateTemp>,
    log: Option<Box<dyn FnMut(&str) + Send>>,
    analysis: SelfReferenceAnalysis,
}

impl Analyzer<'_> {
    fn log(&mut self, msg: &str) {
        debug!("{}", msg);
        if let Some(log) = &mut self.log {
            log(msg);
        }
    }

    /// Reads a LE64, hashing its raw bytes.
    fn read_u64(&mut self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        self.input.read_exact(&mut buf)?;
        self.hasher.update(buf);
        Ok(u64::from_le_bytes(buf))
    }

    /// Reads a framed string of at most `max_len` bytes, hashing
    /// everything (length, data, padding) verbatim.
    fn read_string(&mut self, max_len: usize) -> io::Result<Vec<u8>> {
        let len = self.read_u64()?;
        if len > max_len as u64 {
            return Err(io::Error::new(InvalidData, "string exceeds length bound"));
        }

        let mut data = vec![0; len as usize];
        self.input.read_exact(&mut data)?;
        self.hasher.update(&data);
        self.read_padding(len)?;
        Ok(data)
    }

    fn expect_token(&mut self, expected: &[u8]) -> io::Result<()> {
        let actual = self.read_string(expected.len())?;
        if actual != expected {
            return Err(io::Error::new(InvalidData, "unexpected archive token"));
        }
        Ok(())
    }

    /// Hashes the padding for a content span of `len` bytes, verifying
    /// it is zero.
    fn read_padding(&mut self, len: u64) -> io::Result<()> {
        let pad = (8 - (len % 8) as usize) % 8;
        if pad != 0 {
            let mut buf = [0u8; 8];
            self.input.read_exact(&mut buf[..pad])?;
            if buf[..pad].iter().any(|&b| b != 0) {
                return Err(io::Error::new(InvalidData, "nonzero padding"));
            }
            self.hasher.update(&buf[..pad]);
        }
        Ok(())
    }

    /// Parses one node; the caller has consumed up to and including the
    /// `type` token.
    fn node(&mut self, path: &mut Vec<String>) -> Result<(), SourceError> {
        let kind = self.read_string(9)?;
        match kind.as_slice() {
            b"symlink" => {
                self.expect_token(b"target")?;
                self.symlink_target(path)?;
                self.expect_token(b")")?;
                Ok(())
            }
            b"regular" => {
                let marker = self.read_string(10)?;
                let executable = match marker.as_slice() {
                    b"contents" => false,
                    b"executable" => {
                        self.expect_token(b"")?;
                        self.expect_token(b"contents")?;
                        true
                    }
                    _ => {
                        return Err(
                            io::Error::new(InvalidData, "unexpected archive token").into()
                        )
                    }
                };
                let len = self.read_u64()?;
                self.file_contents(path, executable, len)?;
                self.read_padding(len)?;
                self.expect_token(b")")?;
                Ok(())
            }
            b"directory" => {
                let mut prev_name: Option<Vec<u8>> = None;
                loop {
                    let marker = self.read_string(5)?;
                    match marker.as_slice() {
                        b")" => return Ok(()),
                        b"entry" => {}
                        _ => {
                            return Err(
                                io::Error::new(InvalidData, "unexpected archive token").into()
                            )
                        }
                    }

                    self.expect_token(b"(")?;
                    self.expect_token(b"name")?;
                    let name = self.read_string(wire::MAX_NAME_LEN)?;
                    if name.is_empty()
                        || name.contains(&0)
                        || name.contains(&b'/')
                        || name == b"."
                        || name == b".."
                    {
                        return Err(io::Error::new(InvalidData, "invalid entry name").into());
                    }
                    if let Some(prev) = &prev_name {
                        if *prev >= name {
                            return Err(
                                io::Error::new(InvalidData, "misordered entry names").into()
                            );
                        }
                    }
                    prev_name = Some(name.clone());

                    let name_str = String::from_utf8_lossy(&name).into_owned();
                    if !self.digest.is_empty()
                        && name.windows(self.digest.len()).any(|w| w == self.digest)
                    {
                        path.push(name_str);
                        return Err(SourceError::DigestInName {
                            path: path.join("/"),
                        });
                    }

                    self.expect_token(b"node")?;
                    self.expect_token(b"(")?;
                    self.expect_token(b"type")?;
                    path.push(name_str);
                    self.node(path)?;
                    path.pop();
                    self.expect_token(b")")?;
                }
            }
            _ => Err(io::Error::new(InvalidData, "unknown node type").into()),
        }
    }

    /// Reads a symlink target, zeroing digest occurrences in the hash
    /// stream and recording them as rewrites.
    fn symlink_target(&mut self, path: &[String]) -> Result<(), SourceError> {
        let len = self.read_u64()?;
        if len > wire::MAX_TARGET_LEN as u64 {
            return Err(io::Error::new(InvalidData, "string exceeds length bound").into());
        }
        let content_offset = self.input.offset;

        let mut target = vec![0u8; len as usize];
        self.input.read_exact(&mut target)?;
        if target.is_empty() || target.contains(&0) {
            return Err(io::Error::new(InvalidData, "invalid symlink target").into());
        }

        if !self.digest.is_empty() {
            let zeros = vec![0u8; self.digest.len()];
            let offsets = replace_all(&mut target, &self.digest, &zeros);
            if !offsets.is_empty() {
                for off in &offsets {
                    self.analysis
                        .rewrites
                        .push(Rewriter::SelfReferenceOffset(content_offset + *off as u64));
                }
                self.analysis.paths.push(NarHeader {
                    path: path.join("/"),
                    executable: false,
                    size: len,
                    content_offset,
                });
            }
        }
        self.hasher.update(&target);
        self.read_padding(len)?;
        Ok(())
    }

    /// Processes the contents of a regular file.
    fn file_contents(
        &mut self,
        path: &[String],
        executable: bool,
        len: u64,
    ) -> Result<(), SourceError> {
        let content_offset = self.input.offset;

        // Without a digest there is nothing to detect; hash straight
        // through.
        if self.digest.is_empty() {
            let n = {
                let mut take = (&mut self.input).take(len);
                io::copy(&mut take, &mut HashWrite(&mut self.hasher))?
            };
            if n != len {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
            return Ok(());
        }

        // Sniff for a Mach-O magic; those files get spooled so the load
        // commands and code signature can be walked with look-back.
        let mut magic = [0u8; 4];
        let sniffed = if len >= 4 {
            let mut take = (&mut self.input).take(4);
            take.read_exact(&mut magic)?;
            true
        } else {
            false
        };

        if sniffed && macho::detect(magic).is_some() {
            self.macho_contents(path, executable, len, magic, content_offset)?;
            return Ok(());
        }

        // Opaque bytes: stream through the scanning filter.
        let mut offsets = Vec::new();
        {
            let prefix: &[u8] = if sniffed { &magic } else { &[] };
            let rest = (&mut self.input).take(len - prefix.len() as u64);
            let chained = prefix.chain(rest);
            let mut hm = HashModuloReader::zeroing(chained, self.digest.clone());
            let n = io::copy(&mut hm, &mut HashWrite(&mut self.hasher))?;
            if n != len {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
            offsets.extend_from_slice(hm.offsets());
        }

        self.record_file_offsets(path, executable, len, content_offset, &offsets);
        Ok(())
    }

    fn record_file_offsets(
        &mut self,
        path: &[String],
        executable: bool,
        len: u64,
        content_offset: u64,
        offsets: &[u64],
    ) {
        if offsets.is_empty() {
            return;
        }
        for off in offsets {
            self.analysis
                .rewrites
                .push(Rewriter::SelfReferenceOffset(content_offset + off));
        }
        self.analysis.paths.push(NarHeader {
            path: path.join("/"),
            executable,
            size: len,
            content_offset,
        });
    }

    /// Spools a (potential) Mach-O file and analyzes it. `magic` holds
    /// the four bytes already consumed from the input.
    fn macho_contents(
        &mut self,
        path: &[String],
        executable: bool,
        len: u64,
        magic: [u8; 4],
        content_offset: u64,
    ) -> Result<(), SourceError> {
        let mut spool: Box<dyn Spool> = match &mut self.create_temp {
            Some(create) => create(len)?,
            None => Box::new(Cursor::new(Vec::with_capacity((len as usize).min(1 << 20)))),
        };

        spool.write_all(&magic)?;
        let copied = {
            let mut take = (&mut self.input).take(len - 4);
            io::copy(&mut take, &mut spool)?
        };
        if copied != len - 4 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }

        // Work out which byte spans to zero in the hash stream, and
        // which rewrites to record. Offsets are relative to the file.
        let (zero_spans, rewrites, offsets) = match self.analyze_spool(&mut spool, len, magic) {
            Ok(v) => v,
            Err(macho::MachOError::Io(e)) => return Err(e.into()),
            Err(macho::MachOError::Unrecognized(why)) => {
                // Abandon structure recovery: replay the spooled bytes
                // with plain self-reference scanning.
                self.log(&format!(
                    "treating {:?} as opaque data: {}",
                    path.join("/"),
                    why
                ));
                let offsets = scan_spool(&mut *spool, 0, len, &self.digest)?;
                let spans = offsets
                    .iter()
                    .map(|&o| (o, self.digest.len() as u64))
                    .collect();
                (spans, Vec::new(), offsets)
            }
        };

        // Hash the spool with the spans zeroed.
        spool.seek(SeekFrom::Start(0))?;
        hash_with_zero_spans(&mut *spool, len, &zero_spans, &mut self.hasher)?;

        self.record_file_offsets(path, executable, len, content_offset, &offsets);
        for rw in rewrites {
            self.analysis.rewrites.push(rw.offset_by(content_offset));
        }
        Ok(())
    }

    /// Returns (spans to zero, Mach-O rewrites, self-reference offsets),
    /// all relative to the start of the file.
    #[allow(clippy::type_complexity)]
    fn analyze_spool(
        &mut self,
        spool: &mut Box<dyn Spool>,
        len: u64,
        magic: [u8; 4],
    ) -> Result<(Vec<(u64, u64)>, Vec<Rewriter>, Vec<u64>), macho::MachOError> {
        let mut zero_spans = Vec::new();
        let mut rewrites = Vec::new();
        let mut offsets = Vec::new();

        match macho::detect(magic) {
            Some(macho::Kind::Thin) => {
                self.analyze_slice(spool, 0, len, &mut zero_spans, &mut rewrites, &mut offsets)?;
            }
            Some(macho::Kind::Universal) => {
                let arches = macho::parse_universal(&mut *spool, 0, len)?;
                // gaps between slices (including the fat header) are
                // scanned as opaque bytes
                let mut cursor = 0;
                for arch in arches {
                    if arch.offset > cursor {
                        let gap =
                            scan_spool(&mut **spool, cursor, arch.offset - cursor, &self.digest)?;
                        for o in gap {
                            zero_spans.push((o, self.digest.len() as u64));
                            offsets.push(o);
                        }
                    }
                    self.analyze_slice(
                        spool,
                        arch.offset,
                        arch.size,
                        &mut zero_spans,
                        &mut rewrites,
                        &mut offsets,
                    )?;
                    cursor = arch.offset + arch.size;
                }
                if cursor < len {
                    let tail = scan_spool(&mut **spool, cursor, len - cursor, &self.digest)?;
                    for o in tail {
                        zero_spans.push((o, self.digest.len() as u64));
                        offsets.push(o);
                    }
                }
            }
            None => unreachable!("only called for Mach-O magic"),
        }

        Ok((zero_spans, rewrites, offsets))
    }

    /// Analyzes one single-architecture image inside the spool.
    /// All produced offsets are relative to the start of the file.
    fn analyze_slice(
        &mut self,
        spool: &mut Box<dyn Spool>,
        slice_offset: u64,
        slice_len: u64,
        zero_spans: &mut Vec<(u64, u64)>,
        rewrites: &mut Vec<Rewriter>,
        offsets: &mut Vec<u64>,
    ) -> Result<(), macho::MachOError> {
        let image = macho::parse_thin(&mut **spool, slice_offset, slice_len)?;

        let occurrences = scan_spool(&mut **spool, slice_offset, slice_len, &self.digest)
            .map_err(macho::MachOError::Io)?;

        for &o in &occurrences {
            zero_spans.push((o, self.digest.len() as u64));
            offsets.push(o);
        }

        // The signature machinery only engages when a self reference
        // appears in the signed region.
        let signature = match image.code_signature {
            Some(sig)
                if occurrences
                    .iter()
                    .any(|&o| o < slice_offset + sig.sig_offset) =>
            {
                sig
            }
            _ => return Ok(()),
        };

        if let Some(uuid_offset) = image.uuid_offset {
            zero_spans.push((slice_offset + uuid_offset, 16));
            rewrites.push(Rewriter::MachOUuid {
                image_start: slice_offset,
                uuid_start: slice_offset + uuid_offset,
                code_end: slice_offset + signature.code_limit,
            });
        }

        zero_spans.push((
            slice_offset + signature.hash_slots_offset,
            signature.hash_slots_len(),
        ));
        rewrites.push(Rewriter::MachOSignature {
            image_start: slice_offset,
            code_end: slice_offset + signature.code_limit,
            page_size: signature.page_size,
            hash_type: signature.hash_type,
            hash_offset: slice_offset + signature.hash_slots_offset,
        });

        Ok(())
    }
}

impl Rewriter {
    /// Shifts a file-relative rewriter to absolute NAR offsets.
    fn offset_by(self, base: u64) -> Rewriter {
        match self {
            Rewriter::SelfReferenceOffset(n) => Rewriter::SelfReferenceOffset(n + base),
            Rewriter::MachOUuid {
                image_start,
                uuid_start,
                code_end,
            } => Rewriter::MachOUuid {
                image_start: image_start + base,
                uuid_start: uuid_start + base,
                code_end: code_end + base,
            },
            Rewriter::MachOSignature {
                image_start,
                code_end,
                page_size,
                hash_type,
                hash_offset,
            } => Rewriter::MachOSignature {
                image_start: image_start + base,
                code_end: code_end + base,
                page_size,
                hash_type,
                hash_offset: hash_offset + base,
            },
        }
    }
}

/// Scans `[start, start+len)` of the spool for digest occurrences,
/// returning spool-relative offsets.
fn scan_spool(
    spool: &mut dyn Spool,
    start: u64,
    len: u64,
    digest: &[u8],
) -> io::Result<Vec<u64>> {
    spool.seek(SeekFrom::Start(start))?;
    let take = ReadAdapter(spool).take(len);
    let mut hm = HashModuloReader::zeroing(take, digest.to_vec());
    io::copy(&mut hm, &mut io::sink())?;
    Ok(hm.into_offsets().into_iter().map(|o| o + start).collect())
}

/// Streams `len` bytes from the reader into the hasher, zeroing the
/// given `(offset, len)` spans.
fn hash_with_zero_spans(
    r: &mut dyn Spool,
    len: u64,
    spans: &[(u64, u64)],
    hasher: &mut Sha256,
) -> io::Result<()> {
    let mut buf = [0u8; 8192];
    let mut pos = 0u64;
    while pos < len {
        let want = buf.len().min((len - pos).min(usize::MAX as u64) as usize);
        let n = r.read(&mut buf[..want])?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        let chunk = &mut buf[..n];
        for &(span_off, span_len) in spans {
            let span_end = span_off + span_len;
            let chunk_end = pos + n as u64;
            if span_end <= pos || span_off >= chunk_end {
                continue;
            }
            let from = span_off.max(pos) - pos;
            let to = span_end.min(chunk_end) - pos;
            chunk[from as usize..to as usize].fill(0);
        }
        hasher.update(&buf[..n]);
        pos += n as u64;
    }
    Ok(())
}

struct ReadAdapter<'a>(&'a mut dyn Spool);

impl Read for ReadAdapter<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

struct HashWrite<'a>(&'a mut Sha256);

impl Write for HashWrite<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;

    const TEMP_DIGEST: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    fn single_file_nar(contents: &[u8]) -> Vec<u8> {
        let mut nar = Vec::new();
        let node = crate::nar::writer::open(&mut nar).unwrap();
        node.file(false, contents.len() as u64, &mut BufReader::new(contents))
            .unwrap();
        nar
    }

    fn run(nar: &[u8], digest: &str) -> (ContentAddress, SelfReferenceAnalysis) {
        let mut rd = nar;
        source_sha256_content_address(&mut rd, SourceOptions::with_digest(digest)).unwrap()
    }

    #[test]
    fn no_digest_is_nar_hash_plus_differentiator() {
        let nar = single_file_nar(b"no references here\n");
        let (ca, analysis) = run(&nar, "");
        assert!(analysis.is_empty());

        // sha256(nar ++ "|")
        assert_eq!(
            ca.hash().to_plain_hex_string(),
            "37acc1f5f8bfb4d8b02ed39e7f781327b201dd081ec1badd387ba31dbdeb6cb4"
        );
        assert!(ca.is_source());
    }

    #[test]
    fn digest_free_nar_hashes_identically_with_digest() {
        let nar = single_file_nar(b"no references here\n");
        let (without, _) = run(&nar, "");
        let (with, analysis) = run(&nar, TEMP_DIGEST);
        assert_eq!(without, with);
        assert!(analysis.is_empty());
    }

    #[test]
    fn self_reference_in_file_contents() {
        // The canonical worked example: a single regular file whose
        // contents are the object's own store path. The digest starts
        // 106 bytes into the NAR, and the hash pre-image ends with
        // `||106`.
        let contents = format!("/zb/store/{}-path.txt\n", TEMP_DIGEST);
        let nar = single_file_nar(contents.as_bytes());

        let (ca, analysis) = run(&nar, TEMP_DIGEST);

        assert_eq!(
            analysis.rewrites,
            vec![Rewriter::SelfReferenceOffset(106)]
        );
        assert_eq!(analysis.paths.len(), 1);
        assert_eq!(analysis.paths[0].path, "");
        assert_eq!(analysis.paths[0].content_offset, 96);

        assert_eq!(
            ca.hash().to_plain_hex_string(),
            "e05d6613003438db0b4271ec8f4247425d0cc115fd26e84b8b0c072e564995ea"
        );
    }

    #[test]
    fn self_reference_in_symlink_target() {
        let mut nar = Vec::new();
        let node = crate::nar::writer::open(&mut nar).unwrap();
        let mut dir = node.directory().unwrap();
        dir.entry(b"link")
            .unwrap()
            .symlink(format!("/zb/store/{}-x/bin", TEMP_DIGEST).as_bytes())
            .unwrap();
        dir.close().unwrap();

        let (_, analysis) = run(&nar, TEMP_DIGEST);
        assert_eq!(analysis.rewrites.len(), 1);
        assert_eq!(analysis.paths.len(), 1);
        assert_eq!(analysis.paths[0].path, "link");

        // the recorded offset points at the digest within the NAR
        match analysis.rewrites[0] {
            Rewriter::SelfReferenceOffset(off) => {
                assert_eq!(
                    &nar[off as usize..off as usize + TEMP_DIGEST.len()],
                    TEMP_DIGEST.as_bytes()
                );
            }
            _ => panic!("expected a self reference"),
        }
    }

    #[test]
    fn digest_in_entry_name_is_rejected() {
        let mut nar = Vec::new();
        let node = crate::nar::writer::open(&mut nar).unwrap();
        let mut dir = node.directory().unwrap();
        dir.entry(format!("prefix-{}", TEMP_DIGEST).as_bytes())
            .unwrap()
            .symlink(b"x")
            .unwrap();
        dir.close().unwrap();

        let mut rd = &nar[..];
        let err = source_sha256_content_address(
            &mut rd,
            SourceOptions::with_digest(TEMP_DIGEST),
        )
        .unwrap_err();
        assert!(matches!(err, SourceError::DigestInName { .. }));
    }

    #[test]
    fn multiple_references_order_and_rewrite() {
        let p = format!("/zb/store/{}-x", TEMP_DIGEST);
        let contents = format!("A={} B={} end", p, p);
        let nar = single_file_nar(contents.as_bytes());
        let (_, analysis) = run(&nar, TEMP_DIGEST);

        let offsets: Vec<u64> = analysis
            .rewrites
            .iter()
            .map(|r| r.write_offset())
            .collect();
        assert_eq!(offsets.len(), 2);
        assert!(offsets[0] < offsets[1]);

        // range queries
        assert_eq!(analysis.rewrites_in_range(0, u64::MAX).len(), 2);
        assert_eq!(
            analysis.rewrites_in_range(offsets[0], offsets[0] + 1).len(),
            1
        );
        assert!(analysis.rewrites_in_range(0, offsets[0]).is_empty());

        // applying the rewrites with a new digest patches the NAR
        let new_digest = "1w01xxn8f7s9s4n65ry6rwd7x9awf04s";
        let mut buf = Cursor::new(nar.clone());
        analysis.apply(&mut buf, 0, new_digest).unwrap();
        let patched = buf.into_inner();
        let expected = single_file_nar(
            contents.replace(TEMP_DIGEST, new_digest).as_bytes(),
        );
        assert_eq!(patched, expected);

        // and re-addressing the patched NAR under the new digest gives
        // the same hash (the algorithm is digest-independent)
        let (ca_old, _) = run(&nar, TEMP_DIGEST);
        let (ca_new, _) = run(&expected, new_digest);
        assert_eq!(ca_old, ca_new);
    }

    mod macho {
        use super::*;
        use crate::ca::macho::testutil::{build_thin, build_universal, ImageSpec};
        use crate::rewrite::MachOHashType;

        fn executable_nar(contents: &[u8]) -> Vec<u8> {
            let mut nar = Vec::new();
            let node = crate::nar::writer::open(&mut nar).unwrap();
            node.file(true, contents.len() as u64, &mut BufReader::new(contents))
                .unwrap();
            nar
        }

        fn payload_with_self_reference() -> Vec<u8> {
            format!("code /zb/store/{}-tool code", TEMP_DIGEST).into_bytes()
        }

        #[test]
        fn signed_image_gets_signature_and_uuid_rewrites() {
            let image = build_thin(&ImageSpec {
                payload: payload_with_self_reference(),
                uuid: Some([9; 16]),
                sign: true,
                page_size_log2: 12,
            });
            let nar = executable_nar(&image);
            let (_, analysis) = run(&nar, TEMP_DIGEST);

            let kinds: Vec<&str> = analysis
                .rewrites
                .iter()
                .map(|r| match r {
                    Rewriter::SelfReferenceOffset(_) => "self",
                    Rewriter::MachOUuid { .. } => "uuid",
                    Rewriter::MachOSignature { .. } => "sig",
                })
                .collect();
            assert_eq!(kinds, vec!["self", "uuid", "sig"]);

            match &analysis.rewrites[2] {
                Rewriter::MachOSignature {
                    page_size,
                    hash_type,
                    ..
                } => {
                    assert_eq!(*page_size, 4096);
                    assert_eq!(*hash_type, MachOHashType::Sha256);
                }
                _ => unreachable!(),
            }
        }

        #[test]
        fn self_reference_after_signature_is_plain() {
            // digest occurs only inside the trailing region, past the
            // signature offset: no signature rewrite engages
            let image = build_thin(&ImageSpec {
                payload: b"no reference in code".to_vec(),
                uuid: Some([9; 16]),
                sign: true,
                page_size_log2: 12,
            });
            let mut padded = image.clone();
            padded.extend_from_slice(payload_with_self_reference().as_slice());

            let nar = executable_nar(&padded);
            let (_, analysis) = run(&nar, TEMP_DIGEST);
            assert!(analysis
                .rewrites
                .iter()
                .all(|r| matches!(r, Rewriter::SelfReferenceOffset(_))));
            assert_eq!(analysis.rewrites.len(), 1);
        }

        #[test]
        fn malformed_macho_falls_back_to_plain_scan() {
            // right magic, garbage structure
            let mut fake = Vec::new();
            fake.extend_from_slice(&crate::ca::macho::MAGIC_64_LE.to_le_bytes());
            fake.extend_from_slice(&[0xffu8; 64]);
            fake.extend_from_slice(payload_with_self_reference().as_slice());

            let nar = executable_nar(&fake);
            let (ca, analysis) = run(&nar, TEMP_DIGEST);
            assert_eq!(analysis.rewrites.len(), 1);
            assert!(matches!(
                analysis.rewrites[0],
                Rewriter::SelfReferenceOffset(_)
            ));

            // the hash equals the plain zeroed-digest hash: replaying a
            // fake Mach-O must give the same result as never sniffing it
            let plain: Vec<u8> = {
                let s = payload_with_self_reference();
                let mut v = Vec::new();
                v.extend_from_slice(&crate::ca::macho::MAGIC_64_LE.to_le_bytes());
                v.extend_from_slice(&[0xffu8; 64]);
                v.extend_from_slice(&s);
                v
            };
            let zeroed: Vec<u8> = {
                let mut v = plain.clone();
                crate::ca::hash_modulo::replace_all(
                    &mut v,
                    TEMP_DIGEST.as_bytes(),
                    &[0u8; 32],
                );
                v
            };
            let reference_nar = executable_nar(&zeroed);
            let mut hasher = sha2::Sha256::new();
            hasher.update(&reference_nar);
            hasher.update(b"|");
            hasher.update(b"|");
            hasher.update(
                analysis.rewrites[0].write_offset().to_string().as_bytes(),
            );
            assert_eq!(ca.hash().digest(), hasher.finalize().as_slice());
        }

        #[test]
        fn universal_image_recurses_into_slices() {
            let a = build_thin(&ImageSpec {
                payload: payload_with_self_reference(),
                uuid: Some([1; 16]),
                sign: true,
                page_size_log2: 12,
            });
            let b = build_thin(&ImageSpec {
                payload: payload_with_self_reference(),
                uuid: None,
                sign: true,
                page_size_log2: 0,
            });
            let fat = build_universal(&[a, b]);

            let nar = executable_nar(&fat);
            let (_, analysis) = run(&nar, TEMP_DIGEST);

            let selfs = analysis
                .rewrites
                .iter()
                .filter(|r| matches!(r, Rewriter::SelfReferenceOffset(_)))
                .count();
            let uuids = analysis
                .rewrites
                .iter()
                .filter(|r| matches!(r, Rewriter::MachOUuid { .. }))
                .count();
            let sigs = analysis
                .rewrites
                .iter()
                .filter(|r| matches!(r, Rewriter::MachOSignature { .. }))
                .count();
            assert_eq!((selfs, uuids, sigs), (2, 1, 2));
        }

        #[test]
        fn spools_to_create_temp() {
            use std::sync::atomic::{AtomicUsize, Ordering};
            use std::sync::Arc;

            let image = build_thin(&ImageSpec {
                payload: payload_with_self_reference(),
                uuid: None,
                sign: true,
                page_size_log2: 12,
            });
            let nar = executable_nar(&image);

            let calls = Arc::new(AtomicUsize::new(0));
            let calls2 = calls.clone();
            let opts = SourceOptions {
                digest: TEMP_DIGEST.to_string(),
                create_temp: Some(Box::new(move |_size| {
                    calls2.fetch_add(1, Ordering::SeqCst);
                    Ok(Box::new(Cursor::new(Vec::new())) as Box<dyn Spool>)
                })),
                log: None,
            };

            let mut rd = &nar[..];
            source_sha256_content_address(&mut rd, opts).unwrap();
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }
}
