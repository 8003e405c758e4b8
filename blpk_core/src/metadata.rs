//! The optional metadata section: serializer and codec registries, the
//! opportunistic-compression write path, and in-place rewriting.
//!
//! On disk the section is
//! `[header: 32][payload: meta_comp_size][zero padding up to max_meta_size][digest]`.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use log::{debug, info};

use crate::args::{MaxMetaSize, MetadataArgs};
use crate::checksum::Checksum;
use crate::error::{Error, Result};
use crate::format::{MetadataHeader, METADATA_HEADER_SIZE};
use crate::source::{read_bounded, read_container_header};

/// Structured metadata stored alongside the chunks.
pub type Metadata = serde_json::Value;

// ── Codec registry ─────────────────────────────────────────────────────────

/// Compressors for the metadata payload. The discriminant is the on-disk id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MetaCodec {
    None = 0,
    Zlib = 1,
}

impl MetaCodec {
    pub const ALL: [MetaCodec; 2] = [MetaCodec::None, MetaCodec::Zlib];

    pub fn from_name(name: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::NoSuchCodec(name.to_string()))
    }

    pub fn from_id(id: u8) -> Result<Self> {
        Self::ALL
            .get(id as usize)
            .copied()
            .ok_or_else(|| Error::NoSuchCodec(format!("metadata codec id {id}")))
    }

    #[inline]
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            MetaCodec::None => "none",
            MetaCodec::Zlib => "zlib",
        }
    }

    pub fn compress(self, data: &[u8], level: u8) -> Result<Vec<u8>> {
        match self {
            MetaCodec::None => Ok(data.to_vec()),
            MetaCodec::Zlib => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level as u32));
                encoder.write_all(data)?;
                Ok(encoder.finish()?)
            }
        }
    }

    pub fn decompress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            MetaCodec::None => Ok(data.to_vec()),
            MetaCodec::Zlib => {
                let mut out = Vec::new();
                ZlibDecoder::new(data)
                    .read_to_end(&mut out)
                    .map_err(|e| Error::Codec(format!("zlib metadata: {e}")))?;
                Ok(out)
            }
        }
    }
}

impl std::fmt::Display for MetaCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ── Serializer registry ────────────────────────────────────────────────────

/// Formats the metadata value can be serialized with, keyed by an 8-byte tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Serializer {
    Json,
}

impl Serializer {
    pub const ALL: [Serializer; 1] = [Serializer::Json];

    pub fn name(self) -> &'static str {
        match self {
            Serializer::Json => "JSON",
        }
    }

    /// The name, zero-padded to 8 bytes.
    pub fn tag(self) -> [u8; 8] {
        let mut tag = [0u8; 8];
        let name = self.name().as_bytes();
        tag[..name.len()].copy_from_slice(name);
        tag
    }

    pub fn from_name(name: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|s| s.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::NoSuchSerializer(name.to_string()))
    }

    pub fn from_tag(tag: &[u8]) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|s| s.tag()[..] == *tag)
            .ok_or_else(|| Error::NoSuchSerializer(String::from_utf8_lossy(tag).trim_end_matches('\0').to_string()))
    }

    pub fn dumps(self, value: &Metadata) -> Result<Vec<u8>> {
        match self {
            Serializer::Json => Ok(serde_json::to_vec(value)?),
        }
    }

    pub fn loads(self, data: &[u8]) -> Result<Metadata> {
        match self {
            Serializer::Json => Ok(serde_json::from_slice(data)?),
        }
    }
}

impl std::fmt::Display for Serializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ── Write path ─────────────────────────────────────────────────────────────

/// A fully prepared metadata section, ready to be written.
#[derive(Debug, Clone)]
pub struct EncodedMetadata {
    pub header: MetadataHeader,
    pub payload: Vec<u8>,
    pub digest: Vec<u8>,
}

impl EncodedMetadata {
    /// Serialize, opportunistically compress and checksum `metadata`.
    ///
    /// The compressed form is kept only when it is strictly smaller than the
    /// serialized one; otherwise the payload is stored raw and the header
    /// records [`MetaCodec::None`]. Fails with `MetadataSectionTooSmall`
    /// before anything is written.
    pub fn new(metadata: &Metadata, args: &MetadataArgs) -> Result<Self> {
        args.validate()?;
        let serialized = args.serializer.dumps(metadata)?;
        let meta_size = u32::try_from(serialized.len()).map_err(|_| Error::MetadataSectionTooSmall {
            required: serialized.len(),
            max_meta_size: u32::MAX,
        })?;

        let (codec, payload) = match args.codec {
            MetaCodec::None => (MetaCodec::None, serialized),
            codec => {
                let compressed = codec.compress(&serialized, args.level)?;
                if compressed.len() < serialized.len() {
                    (codec, compressed)
                } else {
                    debug!(
                        "{codec} metadata {} >= raw {} bytes, storing uncompressed",
                        compressed.len(),
                        serialized.len()
                    );
                    (MetaCodec::None, serialized)
                }
            }
        };

        let max_meta_size = args.max_meta_size.resolve(meta_size as u64)?;
        if payload.len() > max_meta_size as usize {
            return Err(Error::MetadataSectionTooSmall {
                required: payload.len(),
                max_meta_size,
            });
        }

        let header = MetadataHeader {
            serializer: args.serializer,
            checksum: args.checksum,
            codec,
            level: args.level,
            meta_size,
            max_meta_size,
            meta_comp_size: payload.len() as u32,
            user_codec: [0; 8],
        };
        let digest = args.checksum.digest(&payload);
        Ok(Self {
            header,
            payload,
            digest,
        })
    }

    /// The complete on-disk section.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.header.section_len() as usize);
        buf.extend_from_slice(&self.header.encode()?);
        buf.extend_from_slice(&self.payload);
        buf.resize(METADATA_HEADER_SIZE + self.header.max_meta_size as usize, 0);
        buf.extend_from_slice(&self.digest);
        Ok(buf)
    }
}

/// Write a metadata section at the current position. Returns the bytes
/// written.
pub fn write_metadata<W: Write + ?Sized>(writer: &mut W, metadata: &Metadata, args: &MetadataArgs) -> Result<u64> {
    let encoded = EncodedMetadata::new(metadata, args)?;
    let bytes = encoded.to_bytes()?;
    writer.write_all(&bytes)?;
    debug!(
        "metadata: {} raw, {} stored ({}), slot {}, total {} bytes",
        encoded.header.meta_size,
        encoded.header.meta_comp_size,
        encoded.header.codec,
        encoded.header.max_meta_size,
        bytes.len()
    );
    Ok(bytes.len() as u64)
}

// ── Read path ──────────────────────────────────────────────────────────────

/// Read the metadata section at the current position, verifying its
/// checksum before decompressing it.
pub fn read_metadata<R: Read + ?Sized>(reader: &mut R) -> Result<(Metadata, MetadataHeader)> {
    let mut header_buf = [0u8; METADATA_HEADER_SIZE];
    reader.read_exact(&mut header_buf)?;
    let header = MetadataHeader::decode(&header_buf)?;

    let mut slot = read_bounded(reader, header.max_meta_size as u64, "metadata section")?;
    slot.truncate(header.meta_comp_size as usize);

    let mut digest = vec![0u8; header.checksum.size()];
    reader.read_exact(&mut digest)?;
    header.checksum.verify(&slot, &digest, || "metadata".to_string())?;

    let serialized = header.codec.decompress(&slot)?;
    if serialized.len() != header.meta_size as usize {
        return Err(Error::Codec(format!(
            "metadata decompressed to {} bytes but header says {}",
            serialized.len(),
            header.meta_size
        )));
    }
    let metadata = header.serializer.loads(&serialized)?;
    Ok((metadata, header))
}

// ── Rewrite ────────────────────────────────────────────────────────────────

/// Header fields a metadata rewrite may change; everything else is inherited.
#[derive(Debug, Clone, Default)]
pub struct MetadataOverrides {
    pub serializer: Option<Serializer>,
    pub checksum: Option<Checksum>,
    pub codec: Option<MetaCodec>,
    pub level: Option<u8>,
}

/// Replace the metadata section that starts at the current position.
///
/// The reserved slot keeps its size. Identical metadata fails with
/// `NoChangeInMetadata`, and a payload that no longer fits fails with
/// `MetadataSectionTooSmall`; in both cases the section is left untouched.
/// Returns the section length.
pub fn rewrite_metadata<F: Read + Write + Seek + ?Sized>(
    file: &mut F,
    new_metadata: &Metadata,
    overrides: &MetadataOverrides,
) -> Result<u64> {
    let start = file.stream_position()?;
    let (old_metadata, old_header) = read_metadata(file)?;
    if old_metadata == *new_metadata {
        return Err(Error::NoChangeInMetadata);
    }

    let checksum = overrides.checksum.unwrap_or(old_header.checksum);
    if checksum.size() != old_header.checksum.size() {
        return Err(Error::ChecksumLengthMismatch {
            old: old_header.checksum.name(),
            old_size: old_header.checksum.size(),
            new: checksum.name(),
            new_size: checksum.size(),
        });
    }
    let args = MetadataArgs {
        serializer: overrides.serializer.unwrap_or(old_header.serializer),
        checksum,
        codec: overrides.codec.unwrap_or(old_header.codec),
        level: overrides.level.unwrap_or(old_header.level),
        max_meta_size: MaxMetaSize::Fixed(old_header.max_meta_size),
    };

    let encoded = EncodedMetadata::new(new_metadata, &args)?;
    let bytes = encoded.to_bytes()?;
    file.seek(SeekFrom::Start(start))?;
    file.write_all(&bytes)?;
    info!(
        "rewrote metadata at {start}: {} -> {} stored bytes of {}",
        old_header.meta_comp_size, encoded.header.meta_comp_size, encoded.header.max_meta_size
    );
    Ok(bytes.len() as u64)
}

/// Replace the metadata of the container in `file`, which must have been
/// packed with metadata.
pub fn rewrite_container_metadata<F: Read + Write + Seek + ?Sized>(
    file: &mut F,
    new_metadata: &Metadata,
    overrides: &MetadataOverrides,
) -> Result<u64> {
    file.seek(SeekFrom::Start(0))?;
    let header = read_container_header(file)?;
    if !header.metadata {
        return Err(Error::invalid_argument("metadata", "container has no metadata section"));
    }
    let written = rewrite_metadata(file, new_metadata, overrides)?;
    file.flush()?;
    Ok(written)
}

pub fn rewrite_metadata_in_file(
    path: impl AsRef<Path>,
    new_metadata: &Metadata,
    overrides: &MetadataOverrides,
) -> Result<u64> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    rewrite_container_metadata(&mut file, new_metadata, overrides)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use serde_json::json;

    use super::*;

    fn sample() -> Metadata {
        json!({"dtype": "float64", "shape": [1000], "order": "C", "container": "numpy"})
    }

    #[test]
    fn section_roundtrip() {
        let mut buf = Vec::new();
        let written = write_metadata(&mut buf, &sample(), &MetadataArgs::default()).unwrap();
        assert_eq!(written as usize, buf.len());

        let (metadata, header) = read_metadata(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(metadata, sample());
        assert_eq!(header.serializer, Serializer::Json);
        assert_eq!(header.meta_size as usize, serde_json::to_vec(&sample()).unwrap().len());
        assert_eq!(header.max_meta_size, header.meta_size * 10);
        assert_eq!(header.section_len(), written);
    }

    #[test]
    fn incompressible_payload_falls_back_to_none() {
        // too short for zlib to win
        let encoded = EncodedMetadata::new(&json!(1), &MetadataArgs::default()).unwrap();
        assert_eq!(encoded.header.codec, MetaCodec::None);
        assert_eq!(encoded.payload, b"1");

        let repetitive = json!({"values": vec![0u8; 500]});
        let encoded = EncodedMetadata::new(&repetitive, &MetadataArgs::default()).unwrap();
        assert_eq!(encoded.header.codec, MetaCodec::Zlib);
        assert!(encoded.header.meta_comp_size < encoded.header.meta_size);
    }

    #[test]
    fn slot_too_small() {
        let args = MetadataArgs {
            max_meta_size: MaxMetaSize::Fixed(3),
            codec: MetaCodec::None,
            ..MetadataArgs::default()
        };
        let err = EncodedMetadata::new(&sample(), &args).unwrap_err();
        assert!(matches!(err, Error::MetadataSectionTooSmall { max_meta_size: 3, .. }));
    }

    #[test]
    fn corrupted_payload_is_detected() {
        let mut buf = Vec::new();
        write_metadata(&mut buf, &sample(), &MetadataArgs::default()).unwrap();
        buf[METADATA_HEADER_SIZE] ^= 0xff;
        let err = read_metadata(&mut Cursor::new(&buf)).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
    }

    #[test]
    fn rewrite_in_place() {
        let mut buf = Vec::new();
        write_metadata(&mut buf, &sample(), &MetadataArgs::default()).unwrap();
        let len = buf.len();

        let mut updated = sample();
        updated["shape"] = json!([2000]);
        let mut cursor = Cursor::new(buf);
        rewrite_metadata(&mut cursor, &updated, &MetadataOverrides::default()).unwrap();
        let buf = cursor.into_inner();
        assert_eq!(buf.len(), len);
        let (metadata, _) = read_metadata(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(metadata, updated);
    }

    #[test]
    fn rewrite_refuses_noop_and_mismatched_checksum() {
        let mut buf = Vec::new();
        write_metadata(&mut buf, &sample(), &MetadataArgs::default()).unwrap();
        let original = buf.clone();
        let mut cursor = Cursor::new(buf);

        let err = rewrite_metadata(&mut cursor, &sample(), &MetadataOverrides::default()).unwrap_err();
        assert!(matches!(err, Error::NoChangeInMetadata));

        cursor.set_position(0);
        let overrides = MetadataOverrides {
            checksum: Some(Checksum::Sha256),
            ..MetadataOverrides::default()
        };
        let err = rewrite_metadata(&mut cursor, &json!({"a": 1}), &overrides).unwrap_err();
        assert!(matches!(err, Error::ChecksumLengthMismatch { .. }));

        cursor.set_position(0);
        let overrides = MetadataOverrides {
            checksum: Some(Checksum::Crc32),
            ..MetadataOverrides::default()
        };
        rewrite_metadata(&mut cursor, &json!({"a": 1}), &overrides).unwrap();
        assert_ne!(cursor.get_ref(), &original);
    }

    #[test]
    fn rewrite_too_large_leaves_section_intact() {
        let mut buf = Vec::new();
        let args = MetadataArgs {
            max_meta_size: MaxMetaSize::Fixed(64),
            ..MetadataArgs::default()
        };
        write_metadata(&mut buf, &json!({"k": "v"}), &args).unwrap();
        let original = buf.clone();

        let mut state = 0x2545_f491u64;
        let huge: String = (0..500)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                char::from(b'a' + ((state >> 33) % 26) as u8)
            })
            .collect();
        let mut cursor = Cursor::new(buf);
        let err = rewrite_metadata(&mut cursor, &json!({ "k": huge }), &MetadataOverrides::default()).unwrap_err();
        assert!(matches!(err, Error::MetadataSectionTooSmall { max_meta_size: 64, .. }));
        assert_eq!(cursor.into_inner(), original);
    }

    #[test]
    fn unknown_serializer_tag() {
        assert!(matches!(
            Serializer::from_tag(b"YAML\0\0\0\0"),
            Err(Error::NoSuchSerializer(ref n)) if n == "YAML"
        ));
        assert_eq!(Serializer::from_tag(b"JSON\0\0\0\0").unwrap(), Serializer::Json);
    }
}
