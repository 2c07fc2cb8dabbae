//! Minimal Mach-O structure recovery for self-reference analysis.
//!
//! Only the pieces content addressing needs are parsed: enough of the
//! header and load commands to locate `LC_UUID` and `LC_CODE_SIGNATURE`,
//! and enough of the code signature to find the hash slots of an ad-hoc,
//! linker-signed code directory.
//!
//! Every malformation is reported as [MachOError::Unrecognized]; the
//! caller then falls back to treating the file as opaque bytes. Real I/O
//! errors from the spool buffer are kept apart, since those must abort
//! the whole content addressing run.

use std::io::{self, Read, Seek, SeekFrom};

use crate::ca::source::Spool;
use crate::rewrite::MachOHashType;

pub(crate) const MAGIC_32_LE: u32 = 0xfeedface;
pub(crate) const MAGIC_64_LE: u32 = 0xfeedfacf;
pub(crate) const MAGIC_32_BE: u32 = 0xcefaedfe;
pub(crate) const MAGIC_64_BE: u32 = 0xcffaedfe;
pub(crate) const FAT_MAGIC: u32 = 0xbebafeca;
pub(crate) const FAT_MAGIC_64: u32 = 0xbfbafeca;

const LC_UUID: u32 = 0x1b;
const LC_CODE_SIGNATURE: u32 = 0x1d;

const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xfade0cc0;
const CSMAGIC_CODEDIRECTORY: u32 = 0xfade0c02;
const CSSLOT_CODEDIRECTORY: u32 = 0;

const CS_ADHOC: u32 = 0x0000_0002;
const CS_LINKER_SIGNED: u32 = 0x0002_0000;

/// Sanity bounds; anything beyond these is not a file we can sign.
const MAX_LOAD_COMMANDS: u32 = 4096;
const MAX_FAT_ARCHES: u32 = 128;
const MAX_SUPERBLOB_ENTRIES: u32 = 64;

#[derive(Debug)]
pub(crate) enum MachOError {
    Io(io::Error),
    /// Not a (recognized) Mach-O structure; scan the bytes as opaque.
    Unrecognized(&'static str),
}

impl From<io::Error> for MachOError {
    fn from(e: io::Error) -> Self {
        // Short reads mean the claimed structure runs off the end of the
        // file, which is a malformation, not a spool failure.
        if e.kind() == io::ErrorKind::UnexpectedEof {
            MachOError::Unrecognized("truncated structure")
        } else {
            MachOError::Io(e)
        }
    }
}

/// Kind of Mach-O file, as determined from the first four bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    Thin,
    Universal,
}

/// Classifies the first four bytes of a file.
pub(crate) fn detect(magic: [u8; 4]) -> Option<Kind> {
    match u32::from_le_bytes(magic) {
        MAGIC_32_LE | MAGIC_64_LE | MAGIC_32_BE | MAGIC_64_BE => Some(Kind::Thin),
        FAT_MAGIC | FAT_MAGIC_64 => Some(Kind::Universal),
        _ => None,
    }
}

/// One architecture slice of a universal binary, in file offsets
/// relative to the start of the universal file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FatArch {
    pub offset: u64,
    pub size: u64,
}

/// Layout of a single-architecture image, offsets relative to the image
/// start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ThinImage {
    /// Offset of the 16 UUID bytes, if the image has exactly one
    /// LC_UUID command.
    pub uuid_offset: Option<u64>,
    pub code_signature: Option<CodeSignature>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CodeSignature {
    /// Start of the signature SuperBlob.
    pub sig_offset: u64,
    /// Bytes of the image covered by the code hashes.
    pub code_limit: u64,
    /// `0` means a single hash covers the whole range.
    pub page_size: u64,
    pub hash_type: MachOHashType,
    /// Offset of the first code hash slot.
    pub hash_slots_offset: u64,
    pub n_code_slots: u32,
}

impl CodeSignature {
    pub fn hash_slots_len(&self) -> u64 {
        self.n_code_slots as u64 * self.hash_type.digest_len() as u64
    }
}

struct Cursor<'a> {
    r: &'a mut dyn Spool,
    /// Image offset of the reader's current position.
    base: u64,
    little_endian: bool,
}

impl Cursor<'_> {
    fn seek_to(&mut self, image_offset: u64) -> Result<(), MachOError> {
        self.r.seek(SeekFrom::Start(self.base + image_offset))?;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), MachOError> {
        self.r.read_exact(buf)?;
        Ok(())
    }

    fn u32(&mut self) -> Result<u32, MachOError> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b)?;
        Ok(if self.little_endian {
            u32::from_le_bytes(b)
        } else {
            u32::from_be_bytes(b)
        })
    }
}

/// Parses the universal (fat) header of the file starting at `base` in
/// `r`, returning the architecture slices sorted by offset.
pub(crate) fn parse_universal(
    r: &mut dyn Spool,
    base: u64,
    size: u64,
) -> Result<Vec<FatArch>, MachOError> {
    // Fat headers are always big-endian.
    let mut c = Cursor {
        r,
        base,
        little_endian: false,
    };
    c.seek_to(0)?;

    let magic = {
        let mut b = [0u8; 4];
        c.read_exact(&mut b)?;
        u32::from_le_bytes(b)
    };
    let wide = match magic {
        FAT_MAGIC => false,
        FAT_MAGIC_64 => true,
        _ => return Err(MachOError::Unrecognized("not a universal header")),
    };

    let count = c.u32()?;
    if count == 0 || count > MAX_FAT_ARCHES {
        return Err(MachOError::Unrecognized("implausible arch count"));
    }

    let mut arches = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let _cputype = c.u32()?;
        let _cpusubtype = c.u32()?;
        let (offset, arch_size) = if wide {
            let hi = c.u32()? as u64;
            let lo = c.u32()? as u64;
            let offset = hi << 32 | lo;
            let hi = c.u32()? as u64;
            let lo = c.u32()? as u64;
            let arch_size = hi << 32 | lo;
            let _align = c.u32()?;
            let _reserved = c.u32()?;
            (offset, arch_size)
        } else {
            (c.u32()? as u64, c.u32()? as u64)
        };

        if arch_size == 0 || offset.checked_add(arch_size).map_or(true, |end| end > size) {
            return Err(MachOError::Unrecognized("arch slice out of bounds"));
        }
        arches.push(FatArch {
            offset,
            size: arch_size,
        });
    }

    arches.sort_by_key(|a| a.offset);

    // slices may not overlap each other (or the header, which lives
    // before the first slice)
    let mut prev_end = 0;
    for arch in &arches {
        if arch.offset < prev_end {
            return Err(MachOError::Unrecognized("overlapping arch slices"));
        }
        prev_end = arch.offset + arch.size;
    }

    Ok(arches)
}

/// Parses the header and load commands of a single-architecture image
/// starting at `base` in `r` and spanning `size` bytes.
pub(crate) fn parse_thin(
    r: &mut dyn Spool,
    base: u64,
    size: u64,
) -> Result<ThinImage, MachOError> {
    let mut c = Cursor {
        r,
        base,
        little_endian: true,
    };
    c.seek_to(0)?;

    let magic = {
        let mut b = [0u8; 4];
        c.read_exact(&mut b)?;
        u32::from_le_bytes(b)
    };
    let (is64, little_endian) = match magic {
        MAGIC_32_LE => (false, true),
        MAGIC_64_LE => (true, true),
        MAGIC_32_BE => (false, false),
        MAGIC_64_BE => (true, false),
        _ => return Err(MachOError::Unrecognized("not a Mach-O header")),
    };
    c.little_endian = little_endian;

    let _cputype = c.u32()?;
    let _cpusubtype = c.u32()?;
    let _filetype = c.u32()?;
    let ncmds = c.u32()?;
    let sizeofcmds = c.u32()?;
    let _flags = c.u32()?;
    if is64 {
        let _reserved = c.u32()?;
    }

    if ncmds > MAX_LOAD_COMMANDS {
        return Err(MachOError::Unrecognized("implausible load command count"));
    }
    let header_len: u64 = if is64 { 32 } else { 28 };
    if header_len + sizeofcmds as u64 > size {
        return Err(MachOError::Unrecognized("load commands out of bounds"));
    }

    let mut uuid_offsets = Vec::new();
    let mut code_signature_range: Option<(u64, u64)> = None;

    let mut cmd_offset = header_len;
    let cmds_end = header_len + sizeofcmds as u64;
    for _ in 0..ncmds {
        if cmd_offset + 8 > cmds_end {
            return Err(MachOError::Unrecognized("load command out of bounds"));
        }
        c.seek_to(cmd_offset)?;
        let cmd = c.u32()?;
        let cmdsize = c.u32()? as u64;
        if cmdsize < 8 || cmdsize % 4 != 0 || cmd_offset + cmdsize > cmds_end {
            return Err(MachOError::Unrecognized("invalid load command size"));
        }

        match cmd {
            LC_UUID => {
                if cmdsize != 24 {
                    return Err(MachOError::Unrecognized("invalid LC_UUID size"));
                }
                uuid_offsets.push(cmd_offset + 8);
            }
            LC_CODE_SIGNATURE => {
                if cmdsize != 16 {
                    return Err(MachOError::Unrecognized("invalid LC_CODE_SIGNATURE size"));
                }
                let dataoff = c.u32()? as u64;
                let datasize = c.u32()? as u64;
                if datasize == 0 || dataoff.checked_add(datasize).map_or(true, |end| end > size) {
                    return Err(MachOError::Unrecognized("code signature out of bounds"));
                }
                if code_signature_range.replace((dataoff, datasize)).is_some() {
                    return Err(MachOError::Unrecognized("multiple code signatures"));
                }
            }
            _ => {}
        }

        cmd_offset += cmdsize;
    }

    let code_signature = match code_signature_range {
        None => None,
        Some((sig_offset, sig_size)) => {
            Some(parse_code_signature(&mut c, sig_offset, sig_size)?)
        }
    };

    let uuid_offset = match uuid_offsets.as_slice() {
        [single] => Some(*single),
        _ => None,
    };

    Ok(ThinImage {
        uuid_offset,
        code_signature,
    })
}

/// Parses the code signature SuperBlob, requiring exactly one
/// CodeDirectory with the AdHoc and LinkerSigned flags.
fn parse_code_signature(
    c: &mut Cursor,
    sig_offset: u64,
    sig_size: u64,
) -> Result<CodeSignature, MachOError> {
    // Code signature blobs are big-endian regardless of image
    // endianness.
    let saved_endian = c.little_endian;
    c.little_endian = false;
    let result = parse_code_signature_inner(c, sig_offset, sig_size);
    c.little_endian = saved_endian;
    result
}

fn parse_code_signature_inner(
    c: &mut Cursor,
    sig_offset: u64,
    sig_size: u64,
) -> Result<CodeSignature, MachOError> {
    c.seek_to(sig_offset)?;
    if c.u32()? != CSMAGIC_EMBEDDED_SIGNATURE {
        return Err(MachOError::Unrecognized("not an embedded signature"));
    }
    let blob_len = c.u32()? as u64;
    if blob_len > sig_size {
        return Err(MachOError::Unrecognized("signature blob out of bounds"));
    }
    let count = c.u32()?;
    if count == 0 || count > MAX_SUPERBLOB_ENTRIES {
        return Err(MachOError::Unrecognized("implausible blob count"));
    }

    let mut cd_offset = None;
    for _ in 0..count {
        let slot_type = c.u32()?;
        let offset = c.u32()? as u64;
        if slot_type == CSSLOT_CODEDIRECTORY && cd_offset.replace(offset).is_some() {
            return Err(MachOError::Unrecognized("multiple code directories"));
        }
    }
    let cd_offset =
        cd_offset.ok_or(MachOError::Unrecognized("no code directory"))?;
    if cd_offset >= sig_size {
        return Err(MachOError::Unrecognized("code directory out of bounds"));
    }

    let cd_base = sig_offset + cd_offset;
    c.seek_to(cd_base)?;
    if c.u32()? != CSMAGIC_CODEDIRECTORY {
        return Err(MachOError::Unrecognized("bad code directory magic"));
    }
    let _length = c.u32()?;
    let _version = c.u32()?;
    let flags = c.u32()?;
    if flags & CS_ADHOC == 0 || flags & CS_LINKER_SIGNED == 0 {
        return Err(MachOError::Unrecognized("not an ad-hoc linker signature"));
    }
    let hash_offset = c.u32()? as u64;
    let _ident_offset = c.u32()?;
    let n_special_slots = c.u32()?;
    let n_code_slots = c.u32()?;
    let code_limit = c.u32()? as u64;

    let mut small = [0u8; 4];
    c.read_exact(&mut small)?;
    let [hash_size, hash_type_raw, _platform, page_size_log2] = small;

    if n_special_slots != 0 {
        // linker-signed directories hash no special slots
        return Err(MachOError::Unrecognized("unexpected special slots"));
    }
    let hash_type = MachOHashType::from_code_directory(hash_type_raw)
        .ok_or(MachOError::Unrecognized("unknown hash type"))?;
    if hash_size as usize != hash_type.digest_len() {
        return Err(MachOError::Unrecognized("hash size mismatch"));
    }

    let page_size = if page_size_log2 == 0 {
        0
    } else {
        1u64 << page_size_log2
    };
    let expected_slots = if page_size == 0 {
        1
    } else {
        code_limit.div_ceil(page_size)
    };
    if n_code_slots as u64 != expected_slots {
        return Err(MachOError::Unrecognized("code slot count mismatch"));
    }
    if code_limit > sig_offset {
        return Err(MachOError::Unrecognized("code limit crosses signature"));
    }

    let hash_slots_offset = cd_base + hash_offset;
    let slots_len = n_code_slots as u64 * hash_size as u64;
    if hash_offset
        .checked_add(slots_len)
        .map_or(true, |end| cd_offset + end > sig_size)
    {
        return Err(MachOError::Unrecognized("hash slots out of bounds"));
    }

    Ok(CodeSignature {
        sig_offset,
        code_limit,
        page_size,
        hash_type,
        hash_slots_offset,
        n_code_slots,
    })
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Builders for synthetic Mach-O images, small but structurally
    //! valid enough for the analyzer.

    use super::*;

    pub struct ImageSpec {
        pub payload: Vec<u8>,
        pub uuid: Option<[u8; 16]>,
        pub sign: bool,
        pub page_size_log2: u8,
    }

    /// Assembles a little-endian 64-bit Mach-O image: header, load
    /// commands, payload, then an ad-hoc linker-signed code signature
    /// covering everything before it.
    pub fn build_thin(spec: &ImageSpec) -> Vec<u8> {
        let ncmds = spec.uuid.is_some() as u32 + spec.sign as u32;
        let sizeofcmds = spec.uuid.map_or(0, |_| 24) + if spec.sign { 16 } else { 0 };

        let header_len = 32u64;
        let payload_off = header_len + sizeofcmds as u64;
        let code_limit = payload_off + spec.payload.len() as u64;

        let page_size = if spec.page_size_log2 == 0 {
            0
        } else {
            1u64 << spec.page_size_log2
        };
        let n_code_slots: u64 = if spec.sign {
            if page_size == 0 {
                1
            } else {
                code_limit.div_ceil(page_size)
            }
        } else {
            0
        };

        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC_64_LE.to_le_bytes());
        out.extend_from_slice(&0x0100000cu32.to_le_bytes()); // cputype arm64
        out.extend_from_slice(&0u32.to_le_bytes()); // cpusubtype
        out.extend_from_slice(&2u32.to_le_bytes()); // MH_EXECUTE
        out.extend_from_slice(&ncmds.to_le_bytes());
        out.extend_from_slice(&(sizeofcmds as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // flags
        out.extend_from_slice(&0u32.to_le_bytes()); // reserved

        if let Some(uuid) = spec.uuid {
            out.extend_from_slice(&LC_UUID.to_le_bytes());
            out.extend_from_slice(&24u32.to_le_bytes());
            out.extend_from_slice(&uuid);
        }

        // code directory: fixed 40-byte prefix + hashes
        let hash_size = 32u64;
        let cd_len = 44 + n_code_slots * hash_size;
        let superblob_len = 12 + 8 + cd_len;

        if spec.sign {
            out.extend_from_slice(&LC_CODE_SIGNATURE.to_le_bytes());
            out.extend_from_slice(&16u32.to_le_bytes());
            out.extend_from_slice(&(code_limit as u32).to_le_bytes()); // dataoff
            out.extend_from_slice(&(superblob_len as u32).to_le_bytes()); // datasize
        }

        out.extend_from_slice(&spec.payload);
        assert_eq!(out.len() as u64, code_limit);

        if spec.sign {
            // SuperBlob (big-endian)
            out.extend_from_slice(&CSMAGIC_EMBEDDED_SIGNATURE.to_be_bytes());
            out.extend_from_slice(&(superblob_len as u32).to_be_bytes());
            out.extend_from_slice(&1u32.to_be_bytes()); // count
            out.extend_from_slice(&CSSLOT_CODEDIRECTORY.to_be_bytes());
            out.extend_from_slice(&20u32.to_be_bytes()); // cd offset in superblob

            // CodeDirectory
            out.extend_from_slice(&CSMAGIC_CODEDIRECTORY.to_be_bytes());
            out.extend_from_slice(&(cd_len as u32).to_be_bytes());
            out.extend_from_slice(&0x20400u32.to_be_bytes()); // version
            out.extend_from_slice(&(CS_ADHOC | CS_LINKER_SIGNED).to_be_bytes());
            out.extend_from_slice(&44u32.to_be_bytes()); // hashOffset
            out.extend_from_slice(&0u32.to_be_bytes()); // identOffset
            out.extend_from_slice(&0u32.to_be_bytes()); // nSpecialSlots
            out.extend_from_slice(&(n_code_slots as u32).to_be_bytes());
            out.extend_from_slice(&(code_limit as u32).to_be_bytes());
            out.push(32); // hashSize
            out.push(2); // hashType sha256
            out.push(0); // platform
            out.push(spec.page_size_log2);
            out.extend_from_slice(&0u32.to_be_bytes()); // spare2
            // hash slots, zero-filled; the analyzer never trusts them
            out.extend(std::iter::repeat(0u8).take((n_code_slots * hash_size) as usize));
        }

        out
    }

    /// Assembles a universal binary from pre-built thin images.
    pub fn build_universal(images: &[Vec<u8>]) -> Vec<u8> {
        let header_len = 8 + images.len() * 20;
        // align slices to 8 bytes
        let mut offsets = Vec::new();
        let mut cursor = header_len;
        for img in images {
            cursor = (cursor + 7) & !7;
            offsets.push(cursor);
            cursor += img.len();
        }

        let mut out = Vec::new();
        out.extend_from_slice(&0xcafebabeu32.to_be_bytes());
        out.extend_from_slice(&(images.len() as u32).to_be_bytes());
        for (img, &off) in images.iter().zip(&offsets) {
            out.extend_from_slice(&0x0100000cu32.to_be_bytes()); // cputype
            out.extend_from_slice(&0u32.to_be_bytes()); // cpusubtype
            out.extend_from_slice(&(off as u32).to_be_bytes());
            out.extend_from_slice(&(img.len() as u32).to_be_bytes());
            out.extend_from_slice(&3u32.to_be_bytes()); // align
        }
        for (img, &off) in images.iter().zip(&offsets) {
            while out.len() < off {
                out.push(0);
            }
            out.extend_from_slice(img);
        }
        out
    }
}
