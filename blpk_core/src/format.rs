use crate::checksum::Checksum;
use crate::codec::Cname;
use crate::error::{Error, Result};
use crate::metadata::{MetaCodec, Serializer};

/// Magic bytes at the start of every container.
pub const MAGIC: &[u8; 4] = b"blpk";

/// The container format version this engine reads and writes.
pub const FORMAT_VERSION: u8 = 3;
pub const MAX_FORMAT_VERSION: u8 = u8::MAX;

/// File extension used by the CLI.
pub const EXTENSION: &str = "blp";

/// Fixed size of the container header in bytes.
///   magic[4] + version:u8 + options:u8 + checksum:u8 + typesize:u8
///   + chunk_size:i32 + last_chunk:i32 + nchunks:i64 + max_app_chunks:i64
///   = 4 + 1 + 1 + 1 + 1 + 4 + 4 + 8 + 8 = 32
pub const CONTAINER_HEADER_SIZE: usize = 32;

/// Fixed size of the metadata header in bytes.
///   magic_format[8] + options:u8 + checksum:u8 + codec:u8 + level:u8
///   + meta_size:u32 + max_meta_size:u32 + meta_comp_size:u32 + user_codec[8]
///   = 8 + 1 + 1 + 1 + 1 + 4 + 4 + 4 + 8 = 32
pub const METADATA_HEADER_SIZE: usize = 32;

/// Fixed size of the codec sub-header that opens every compressed chunk.
///   version:u8 + versionlz:u8 + flags:u8 + typesize:u8
///   + nbytes:u32 + blocksize:u32 + ctbytes:u32 = 16
pub const SUBHEADER_SIZE: usize = 16;

/// Size of one offset-table slot.
pub const OFFSET_SIZE: usize = 8;

/// Largest chunk count representable in the header (`i64::MAX`).
pub const MAX_CHUNKS: u64 = i64::MAX as u64;

/// Largest metadata slot representable in the metadata header.
pub const MAX_META_SIZE: u64 = u32::MAX as u64;

/// Largest raw buffer the codec accepts in one call.
pub const MAX_BUFFER_SIZE: u64 = i32::MAX as u64 - SUBHEADER_SIZE as u64;

/// Offset-table sentinel for slots reserved for future appends.
pub const UNUSED_OFFSET: i64 = -1;

/// On-disk `typesize` of a container whose chunks disagree: `-1` as a
/// signed byte.
pub const NON_UNIFORM_TYPESIZE: u8 = -1i8 as u8;

// ── Option bits ────────────────────────────────────────────────────────────

pub const OPTION_OFFSETS: u8 = 1 << 0;
pub const OPTION_METADATA: u8 = 1 << 1;
const CONTAINER_OPTIONS_MASK: u8 = OPTION_OFFSETS | OPTION_METADATA;

// ── Container header ───────────────────────────────────────────────────────

/// Decoded representation of the 32-byte container header.
///
/// `None` marks a field as unknown, stored on disk as `-1` (for `typesize`
/// the byte `0xff`, so an element size of 255 cannot be recorded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHeader {
    pub format_version: u8,
    pub offsets: bool,
    pub metadata: bool,
    pub checksum: Checksum,
    /// Element size shared by every chunk; `None` when chunks disagree.
    pub typesize: Option<u8>,
    /// Nominal raw bytes per chunk (the last chunk may be smaller).
    pub chunk_size: Option<u32>,
    pub last_chunk: Option<u32>,
    pub nchunks: Option<u64>,
    /// Reserved, still unused offset-table slots.
    pub max_app_chunks: u64,
}

impl Default for ContainerHeader {
    fn default() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            offsets: false,
            metadata: false,
            checksum: Checksum::None,
            typesize: None,
            chunk_size: None,
            last_chunk: None,
            nchunks: None,
            max_app_chunks: 0,
        }
    }
}

impl ContainerHeader {
    /// Check the cross-field invariants.
    pub fn validate(&self) -> Result<()> {
        if let Some(typesize @ (0 | NON_UNIFORM_TYPESIZE)) = self.typesize {
            return Err(Error::FieldOutOfRange {
                field: "typesize",
                value: typesize as i64,
            });
        }
        check_i32("chunk_size", self.chunk_size)?;
        check_i32("last_chunk", self.last_chunk)?;
        if let (Some(chunk_size), Some(last_chunk)) = (self.chunk_size, self.last_chunk) {
            if last_chunk > chunk_size {
                return Err(Error::FieldOutOfRange {
                    field: "last_chunk",
                    value: last_chunk as i64,
                });
            }
        }
        match self.nchunks {
            None if self.max_app_chunks != 0 => Err(Error::FieldOutOfRange {
                field: "max_app_chunks",
                value: self.max_app_chunks as i64,
            }),
            None => Ok(()),
            Some(nchunks) if nchunks > MAX_CHUNKS => Err(Error::TooManyChunks {
                nchunks,
                max: MAX_CHUNKS,
            }),
            Some(nchunks) if self.max_app_chunks > MAX_CHUNKS - nchunks => Err(Error::TooManyChunks {
                nchunks: nchunks.saturating_add(self.max_app_chunks),
                max: MAX_CHUNKS,
            }),
            Some(_) => Ok(()),
        }
    }

    /// Total offset-table slots: written chunks plus reserved ones.
    pub fn total_slots(&self) -> u64 {
        self.nchunks.unwrap_or(0) + self.max_app_chunks
    }

    /// Serialize to exactly [`CONTAINER_HEADER_SIZE`] bytes.
    pub fn encode(&self) -> Result<[u8; CONTAINER_HEADER_SIZE]> {
        self.validate()?;
        let mut options = 0u8;
        if self.offsets {
            options |= OPTION_OFFSETS;
        }
        if self.metadata {
            options |= OPTION_METADATA;
        }

        let mut buf = [0u8; CONTAINER_HEADER_SIZE];
        buf[..4].copy_from_slice(MAGIC);
        buf[4] = self.format_version;
        buf[5] = options;
        buf[6] = self.checksum.id();
        buf[7] = self.typesize.unwrap_or(NON_UNIFORM_TYPESIZE);
        buf[8..12].copy_from_slice(&opt_i32(self.chunk_size).to_le_bytes());
        buf[12..16].copy_from_slice(&opt_i32(self.last_chunk).to_le_bytes());
        buf[16..24].copy_from_slice(&opt_i64(self.nchunks).to_le_bytes());
        buf[24..32].copy_from_slice(&(self.max_app_chunks as i64).to_le_bytes());
        Ok(buf)
    }

    /// Deserialize from exactly [`CONTAINER_HEADER_SIZE`] bytes, checking the
    /// magic, the options bitfield and every range constraint.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_len("container header", buf, CONTAINER_HEADER_SIZE)?;
        if &buf[..4] != MAGIC {
            let mut found = [0u8; 4];
            found.copy_from_slice(&buf[..4]);
            return Err(Error::InvalidMagic { found });
        }
        let options = buf[5];
        if options & !CONTAINER_OPTIONS_MASK != 0 {
            return Err(Error::InvalidOptions {
                what: "container options",
                bits: options,
            });
        }
        let max_app_chunks = le_i64(&buf[24..32]);
        if max_app_chunks < 0 {
            return Err(Error::FieldOutOfRange {
                field: "max_app_chunks",
                value: max_app_chunks,
            });
        }

        let header = Self {
            format_version: buf[4],
            offsets: options & OPTION_OFFSETS != 0,
            metadata: options & OPTION_METADATA != 0,
            checksum: Checksum::from_id(buf[6])?,
            typesize: (buf[7] != NON_UNIFORM_TYPESIZE).then_some(buf[7]),
            chunk_size: decode_u32_field("chunk_size", le_i32(&buf[8..12]))?,
            last_chunk: decode_u32_field("last_chunk", le_i32(&buf[12..16]))?,
            nchunks: decode_u64_field("nchunks", le_i64(&buf[16..24]))?,
            max_app_chunks: max_app_chunks as u64,
        };
        header.validate()?;
        Ok(header)
    }
}

// ── Metadata header ────────────────────────────────────────────────────────

/// Decoded representation of the 32-byte metadata header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataHeader {
    pub serializer: Serializer,
    pub checksum: Checksum,
    pub codec: MetaCodec,
    pub level: u8,
    /// Serialized (uncompressed) payload length.
    pub meta_size: u32,
    /// Size of the reserved payload slot.
    pub max_meta_size: u32,
    /// Stored payload length, at most `max_meta_size`.
    pub meta_comp_size: u32,
    pub user_codec: [u8; 8],
}

impl MetadataHeader {
    pub fn validate(&self) -> Result<()> {
        if self.meta_comp_size > self.max_meta_size {
            return Err(Error::FieldOutOfRange {
                field: "meta_comp_size",
                value: self.meta_comp_size as i64,
            });
        }
        Ok(())
    }

    /// Bytes the whole section occupies on disk: header, slot and digest.
    pub fn section_len(&self) -> u64 {
        METADATA_HEADER_SIZE as u64 + self.max_meta_size as u64 + self.checksum.size() as u64
    }

    pub fn encode(&self) -> Result<[u8; METADATA_HEADER_SIZE]> {
        self.validate()?;
        let mut buf = [0u8; METADATA_HEADER_SIZE];
        buf[..8].copy_from_slice(&self.serializer.tag());
        // buf[8] = options, reserved and zero
        buf[9] = self.checksum.id();
        buf[10] = self.codec.id();
        buf[11] = self.level;
        buf[12..16].copy_from_slice(&self.meta_size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.max_meta_size.to_le_bytes());
        buf[20..24].copy_from_slice(&self.meta_comp_size.to_le_bytes());
        buf[24..32].copy_from_slice(&self.user_codec);
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_len("metadata header", buf, METADATA_HEADER_SIZE)?;
        if buf[8] != 0 {
            return Err(Error::InvalidOptions {
                what: "metadata options",
                bits: buf[8],
            });
        }
        let mut user_codec = [0u8; 8];
        user_codec.copy_from_slice(&buf[24..32]);
        let header = Self {
            serializer: Serializer::from_tag(&buf[..8])?,
            checksum: Checksum::from_id(buf[9])?,
            codec: MetaCodec::from_id(buf[10])?,
            level: buf[11],
            meta_size: le_u32(&buf[12..16]),
            max_meta_size: le_u32(&buf[16..20]),
            meta_comp_size: le_u32(&buf[20..24]),
            user_codec,
        };
        header.validate()?;
        Ok(header)
    }
}

// ── Chunk sub-header ───────────────────────────────────────────────────────

pub const FLAG_BYTE_SHUFFLE: u8 = 1 << 0;
pub const FLAG_PURE_MEMCPY: u8 = 1 << 1;
pub const FLAG_BIT_SHUFFLE: u8 = 1 << 2;
pub const FLAG_SPLIT_BLOCKS: u8 = 1 << 4;
const CODEC_FORMAT_SHIFT: u8 = 5;

/// The 16-byte preamble the codec writes in front of every compressed chunk.
///
/// The container never compresses anything itself, but it must know how long
/// each chunk is (`ctbytes`) to walk the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSubHeader {
    pub version: u8,
    pub versionlz: u8,
    pub flags: u8,
    pub typesize: u8,
    /// Uncompressed length.
    pub nbytes: u32,
    pub blocksize: u32,
    /// Compressed length including this sub-header.
    pub ctbytes: u32,
}

impl ChunkSubHeader {
    /// Pack the flag bits; `codec_format` occupies bits 5..7.
    pub fn pack_flags(
        byte_shuffle: bool,
        pure_memcpy: bool,
        bit_shuffle: bool,
        split_blocks: bool,
        codec_format: u8,
    ) -> u8 {
        let mut flags = (codec_format & 0x07) << CODEC_FORMAT_SHIFT;
        if byte_shuffle {
            flags |= FLAG_BYTE_SHUFFLE;
        }
        if pure_memcpy {
            flags |= FLAG_PURE_MEMCPY;
        }
        if bit_shuffle {
            flags |= FLAG_BIT_SHUFFLE;
        }
        if split_blocks {
            flags |= FLAG_SPLIT_BLOCKS;
        }
        flags
    }

    pub fn byte_shuffle(&self) -> bool {
        self.flags & FLAG_BYTE_SHUFFLE != 0
    }

    pub fn pure_memcpy(&self) -> bool {
        self.flags & FLAG_PURE_MEMCPY != 0
    }

    pub fn bit_shuffle(&self) -> bool {
        self.flags & FLAG_BIT_SHUFFLE != 0
    }

    pub fn split_blocks(&self) -> bool {
        self.flags & FLAG_SPLIT_BLOCKS != 0
    }

    /// 3-bit compressor format id.
    pub fn codec_format(&self) -> u8 {
        self.flags >> CODEC_FORMAT_SHIFT
    }

    /// Compressor that produced the chunk, if it is one we know.
    pub fn cname(&self) -> Option<Cname> {
        Cname::from_format_id(self.codec_format())
    }

    pub fn encode(&self) -> [u8; SUBHEADER_SIZE] {
        let mut buf = [0u8; SUBHEADER_SIZE];
        buf[0] = self.version;
        buf[1] = self.versionlz;
        buf[2] = self.flags;
        buf[3] = self.typesize;
        buf[4..8].copy_from_slice(&self.nbytes.to_le_bytes());
        buf[8..12].copy_from_slice(&self.blocksize.to_le_bytes());
        buf[12..16].copy_from_slice(&self.ctbytes.to_le_bytes());
        buf
    }

    /// Decode the first [`SUBHEADER_SIZE`] bytes of `buf`; trailing payload is
    /// ignored.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < SUBHEADER_SIZE {
            return Err(Error::BufferLength {
                what: "chunk sub-header",
                expected: SUBHEADER_SIZE,
                found: buf.len(),
            });
        }
        let header = Self {
            version: buf[0],
            versionlz: buf[1],
            flags: buf[2],
            typesize: buf[3],
            nbytes: le_u32(&buf[4..8]),
            blocksize: le_u32(&buf[8..12]),
            ctbytes: le_u32(&buf[12..16]),
        };
        if (header.ctbytes as usize) < SUBHEADER_SIZE {
            return Err(Error::InvalidSubHeader {
                reason: format!("ctbytes {} smaller than the sub-header", header.ctbytes),
            });
        }
        if header.ctbytes as u64 > MAX_BUFFER_SIZE + SUBHEADER_SIZE as u64 {
            return Err(Error::InvalidSubHeader {
                reason: format!("ctbytes {} exceeds the maximum chunk size", header.ctbytes),
            });
        }
        if header.nbytes as u64 > MAX_BUFFER_SIZE {
            return Err(Error::InvalidSubHeader {
                reason: format!("nbytes {} exceeds the maximum chunk size", header.nbytes),
            });
        }
        Ok(header)
    }
}

// ── Offset table ───────────────────────────────────────────────────────────

/// Encode offset-table entries as little-endian `i64`s.
pub fn encode_offsets(offsets: &[i64]) -> Vec<u8> {
    offsets.iter().flat_map(|o| o.to_le_bytes()).collect()
}

/// Decode a buffer of little-endian `i64` offsets. Entries below `-1` are
/// rejected.
pub fn decode_offsets(buf: &[u8]) -> Result<Vec<i64>> {
    if buf.len() % OFFSET_SIZE != 0 {
        return Err(Error::BufferLength {
            what: "offset table",
            expected: buf.len() / OFFSET_SIZE * OFFSET_SIZE,
            found: buf.len(),
        });
    }
    buf.chunks_exact(OFFSET_SIZE)
        .map(|slot| {
            let offset = le_i64(slot);
            if offset < UNUSED_OFFSET {
                Err(Error::FieldOutOfRange {
                    field: "offset",
                    value: offset,
                })
            } else {
                Ok(offset)
            }
        })
        .collect()
}

// ── helpers ────────────────────────────────────────────────────────────────

fn check_len(what: &'static str, buf: &[u8], expected: usize) -> Result<()> {
    if buf.len() != expected {
        return Err(Error::BufferLength {
            what,
            expected,
            found: buf.len(),
        });
    }
    Ok(())
}

fn check_i32(field: &'static str, value: Option<u32>) -> Result<()> {
    match value {
        Some(v) if v > i32::MAX as u32 => Err(Error::FieldOutOfRange {
            field,
            value: v as i64,
        }),
        _ => Ok(()),
    }
}

fn opt_i32(value: Option<u32>) -> i32 {
    value.map_or(-1, |v| v as i32)
}

fn opt_i64(value: Option<u64>) -> i64 {
    value.map_or(-1, |v| v as i64)
}

fn decode_u32_field(field: &'static str, raw: i32) -> Result<Option<u32>> {
    match raw {
        -1 => Ok(None),
        v if v < -1 => Err(Error::FieldOutOfRange {
            field,
            value: v as i64,
        }),
        v => Ok(Some(v as u32)),
    }
}

fn decode_u64_field(field: &'static str, raw: i64) -> Result<Option<u64>> {
    match raw {
        -1 => Ok(None),
        v if v < -1 => Err(Error::FieldOutOfRange { field, value: v }),
        v => Ok(Some(v as u64)),
    }
}

#[inline]
fn le_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

#[inline]
fn le_i32(b: &[u8]) -> i32 {
    i32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

#[inline]
fn le_i64(b: &[u8]) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&b[..8]);
    i64::from_le_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packed_header() -> ContainerHeader {
        ContainerHeader {
            offsets: true,
            metadata: true,
            checksum: Checksum::Sha256,
            typesize: Some(8),
            chunk_size: Some(4),
            last_chunk: Some(1),
            nchunks: Some(3),
            max_app_chunks: 30,
            ..ContainerHeader::default()
        }
    }

    #[test]
    fn container_header_layout() {
        let buf = packed_header().encode().unwrap();
        assert_eq!(buf.len(), CONTAINER_HEADER_SIZE);
        assert_eq!(&buf[..4], b"blpk");
        assert_eq!(buf[4], FORMAT_VERSION);
        assert_eq!(buf[5], 0b11);
        assert_eq!(buf[6], 6);
        assert_eq!(buf[7], 8);
        assert_eq!(&buf[8..12], &4i32.to_le_bytes());
        assert_eq!(&buf[12..16], &1i32.to_le_bytes());
        assert_eq!(&buf[16..24], &3i64.to_le_bytes());
        assert_eq!(&buf[24..32], &30i64.to_le_bytes());
        assert_eq!(ContainerHeader::decode(&buf).unwrap(), packed_header());
    }

    #[test]
    fn unknown_fields_roundtrip_as_minus_one() {
        let header = ContainerHeader::default();
        let buf = header.encode().unwrap();
        assert_eq!(buf[7], 0xff);
        assert_eq!(&buf[8..12], &(-1i32).to_le_bytes());
        assert_eq!(&buf[16..24], &(-1i64).to_le_bytes());
        assert_eq!(ContainerHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn corrupted_magic_is_a_format_error() {
        let mut buf = packed_header().encode().unwrap();
        buf[0] = b'x';
        let err = ContainerHeader::decode(&buf).unwrap_err();
        assert!(matches!(err, Error::InvalidMagic { found } if &found == b"xlpk"));
        assert_eq!(err.kind(), crate::ErrorKind::Format);
    }

    #[test]
    fn rejects_wrong_length_and_garbage_bits() {
        let buf = packed_header().encode().unwrap();
        assert!(matches!(
            ContainerHeader::decode(&buf[..31]),
            Err(Error::BufferLength { found: 31, .. })
        ));
        let mut bad = buf;
        bad[5] |= 0b100;
        assert!(matches!(
            ContainerHeader::decode(&bad),
            Err(Error::InvalidOptions { .. })
        ));
    }

    #[test]
    fn rejects_range_violations() {
        let mut header = packed_header();
        header.last_chunk = Some(5);
        assert!(matches!(header.encode(), Err(Error::FieldOutOfRange { field: "last_chunk", .. })));

        let mut header = packed_header();
        header.nchunks = None;
        assert!(matches!(header.encode(), Err(Error::FieldOutOfRange { field: "max_app_chunks", .. })));

        let mut header = packed_header();
        header.max_app_chunks = MAX_CHUNKS;
        assert!(matches!(header.encode(), Err(Error::TooManyChunks { .. })));

        let mut buf = packed_header().encode().unwrap();
        buf[8..12].copy_from_slice(&(-2i32).to_le_bytes());
        assert!(matches!(
            ContainerHeader::decode(&buf),
            Err(Error::FieldOutOfRange { field: "chunk_size", value: -2 })
        ));
    }

    #[test]
    fn metadata_header_roundtrip() {
        let header = MetadataHeader {
            serializer: Serializer::Json,
            checksum: Checksum::Adler32,
            codec: MetaCodec::Zlib,
            level: 6,
            meta_size: 120,
            max_meta_size: 1200,
            meta_comp_size: 80,
            user_codec: [0; 8],
        };
        let buf = header.encode().unwrap();
        assert_eq!(&buf[..8], b"JSON\0\0\0\0");
        assert_eq!(buf[8], 0);
        assert_eq!(MetadataHeader::decode(&buf).unwrap(), header);
        assert_eq!(header.section_len(), 32 + 1200 + 4);

        let mut bad = buf;
        bad[8] = 1;
        assert!(matches!(MetadataHeader::decode(&bad), Err(Error::InvalidOptions { .. })));

        let overfull = MetadataHeader {
            meta_comp_size: 1201,
            ..header
        };
        assert!(overfull.encode().is_err());
    }

    #[test]
    fn subheader_flags() {
        let flags = ChunkSubHeader::pack_flags(true, false, false, true, 4);
        let header = ChunkSubHeader {
            version: 2,
            versionlz: 1,
            flags,
            typesize: 8,
            nbytes: 1024,
            blocksize: 1024,
            ctbytes: 300,
        };
        let decoded = ChunkSubHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.byte_shuffle());
        assert!(!decoded.pure_memcpy());
        assert!(!decoded.bit_shuffle());
        assert!(decoded.split_blocks());
        assert_eq!(decoded.codec_format(), 4);
        assert_eq!(decoded.cname(), Some(Cname::Zstd));
    }

    #[test]
    fn subheader_rejects_short_ctbytes() {
        let mut buf = [0u8; SUBHEADER_SIZE];
        buf[12..16].copy_from_slice(&15u32.to_le_bytes());
        assert!(matches!(
            ChunkSubHeader::decode(&buf),
            Err(Error::InvalidSubHeader { .. })
        ));
    }

    #[test]
    fn typesize_zero_and_255_are_rejected() {
        let mut buf = packed_header().encode().unwrap();
        buf[7] = 0;
        assert!(matches!(
            ContainerHeader::decode(&buf),
            Err(Error::FieldOutOfRange { field: "typesize", value: 0 })
        ));
        let mut header = packed_header();
        header.typesize = Some(255);
        assert!(header.encode().is_err());
    }

    #[test]
    fn subheader_rejects_oversized_lengths() {
        let header = ChunkSubHeader {
            version: 2,
            versionlz: 1,
            flags: 0,
            typesize: 1,
            nbytes: 16,
            blocksize: 16,
            ctbytes: i32::MAX as u32 + 1,
        };
        assert!(matches!(
            ChunkSubHeader::decode(&header.encode()),
            Err(Error::InvalidSubHeader { .. })
        ));
        let header = ChunkSubHeader {
            ctbytes: 32,
            nbytes: u32::MAX,
            ..header
        };
        assert!(matches!(
            ChunkSubHeader::decode(&header.encode()),
            Err(Error::InvalidSubHeader { .. })
        ));
    }

    #[test]
    fn offsets_encode_and_reject_garbage() {
        let offsets = vec![96, 200, -1, -1];
        assert_eq!(decode_offsets(&encode_offsets(&offsets)).unwrap(), offsets);
        assert!(decode_offsets(&encode_offsets(&[-7])).is_err());
        assert!(decode_offsets(&[0u8; 7]).is_err());
    }
}
