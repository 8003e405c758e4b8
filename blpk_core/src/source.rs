use std::borrow::Cow;
use std::fs::File;
use std::io::{BufReader, ErrorKind as IoErrorKind, Read};
use std::path::Path;

use log::debug;

use crate::checksum::Checksum;
use crate::error::{Error, Result};
use crate::format::{
    decode_offsets, ChunkSubHeader, ContainerHeader, MetadataHeader, CONTAINER_HEADER_SIZE, FORMAT_VERSION,
    OFFSET_SIZE, SUBHEADER_SIZE,
};
use crate::metadata::{read_metadata, Metadata};

// ── Plain sources ──────────────────────────────────────────────────────────

/// Producer of raw chunk payloads.
///
/// The orchestrator asks for exactly the sizes its [`ChunkPlan`] dictates, in
/// order. Sources are single-pass.
///
/// [`ChunkPlan`]: crate::plan::ChunkPlan
pub trait PlainSource {
    /// The next `len` raw bytes. Running out early is an I/O error.
    fn next_chunk(&mut self, len: usize) -> Result<Cow<'_, [u8]>>;
}

/// Plain source over any reader; every chunk is a fresh buffer.
pub struct PlainReaderSource<R: Read> {
    reader: R,
}

pub type PlainFileSource = PlainReaderSource<BufReader<File>>;

impl<R: Read> PlainReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl PlainFileSource {
    /// Open `path`, returning the source and the file length.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, u64)> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok((Self::new(BufReader::new(file)), len))
    }
}

impl<R: Read> PlainSource for PlainReaderSource<R> {
    fn next_chunk(&mut self, len: usize) -> Result<Cow<'_, [u8]>> {
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf)?;
        Ok(Cow::Owned(buf))
    }
}

/// Element types whose in-memory representation is plain bytes with no
/// padding, so a slice of them can be viewed as `&[u8]`.
pub trait Element: Copy + sealed::Sealed {}

mod sealed {
    pub trait Sealed {}
}

macro_rules! impl_element {
    ($($t:ty),*) => {
        $(
            impl sealed::Sealed for $t {}
            impl Element for $t {}
        )*
    };
}

impl_element!(u8, i8, u16, i16, u32, i32, u64, i64, u128, i128, f32, f64);

/// Zero-copy source over borrowed memory; chunks are sub-slices of the input.
pub struct PlainSliceSource<'a> {
    data: &'a [u8],
    pos: usize,
    typesize: Option<u8>,
}

impl<'a> PlainSliceSource<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            typesize: None,
        }
    }

    /// View a typed array as bytes. The element size is kept as a typesize
    /// hint for the codec.
    pub fn from_elements<T: Element>(elements: &'a [T]) -> Self {
        let len = std::mem::size_of_val(elements);
        // SAFETY: `Element` is only implemented for padding-free primitives,
        // and the byte view borrows `elements` for the same lifetime.
        let data = unsafe { std::slice::from_raw_parts(elements.as_ptr().cast::<u8>(), len) };
        Self {
            data,
            pos: 0,
            typesize: u8::try_from(std::mem::size_of::<T>()).ok(),
        }
    }

    /// Build a source over raw memory owned elsewhere.
    ///
    /// # Safety
    /// `ptr` must be valid for reads of `len` bytes for the whole lifetime
    /// `'a`, and the memory must not be mutated during that time.
    pub unsafe fn from_raw_parts(ptr: *const u8, len: usize) -> Self {
        Self::new(std::slice::from_raw_parts(ptr, len))
    }

    /// Total length of the underlying buffer.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Element size of the typed input, if built with `from_elements`.
    pub fn typesize_hint(&self) -> Option<u8> {
        self.typesize
    }
}

impl PlainSource for PlainSliceSource<'_> {
    fn next_chunk(&mut self, len: usize) -> Result<Cow<'_, [u8]>> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    IoErrorKind::UnexpectedEof,
                    format!("source exhausted: {} bytes requested at {} of {}", len, self.pos, self.data.len()),
                ))
            })?;
        let chunk = &self.data[self.pos..end];
        self.pos = end;
        Ok(Cow::Borrowed(chunk))
    }
}

// ── Container beginning ────────────────────────────────────────────────────

/// Everything in front of the first chunk.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub header: ContainerHeader,
    pub metadata: Option<Metadata>,
    pub metadata_header: Option<MetadataHeader>,
    /// Every offset-table slot, reserved ones included; empty without offsets.
    pub offsets: Vec<i64>,
    /// Byte position where the offset table starts (or would start).
    pub offsets_pos: u64,
}

impl ContainerInfo {
    /// Byte position of the first chunk.
    pub fn chunks_pos(&self) -> u64 {
        self.offsets_pos + self.offsets.len() as u64 * OFFSET_SIZE as u64
    }

    /// Offsets of chunks that have been written.
    pub fn used_offsets(&self) -> &[i64] {
        let n = self.header.nchunks.unwrap_or(0) as usize;
        &self.offsets[..n.min(self.offsets.len())]
    }
}

/// Read and validate the container header. The format version must match
/// [`FORMAT_VERSION`] exactly.
pub fn read_container_header<R: Read + ?Sized>(reader: &mut R) -> Result<ContainerHeader> {
    let mut buf = [0u8; CONTAINER_HEADER_SIZE];
    reader.read_exact(&mut buf)?;
    let header = ContainerHeader::decode(&buf)?;
    if header.format_version != FORMAT_VERSION {
        return Err(Error::FormatVersionMismatch {
            expected: FORMAT_VERSION,
            found: header.format_version,
        });
    }
    debug!("container header: {header:?}");
    Ok(header)
}

/// Read header, metadata section and offset table from the start of a
/// container.
pub fn read_container_info<R: Read + ?Sized>(reader: &mut R) -> Result<ContainerInfo> {
    let header = read_container_header(reader)?;
    let mut pos = CONTAINER_HEADER_SIZE as u64;

    let (metadata, metadata_header) = if header.metadata {
        let (metadata, metadata_header) = read_metadata(reader)?;
        pos += metadata_header.section_len();
        (Some(metadata), Some(metadata_header))
    } else {
        (None, None)
    };

    let offsets = if header.offsets {
        let slots = header.total_slots();
        let table_len = slots.checked_mul(OFFSET_SIZE as u64).ok_or(Error::TooManyChunks {
            nchunks: slots,
            max: u64::MAX / OFFSET_SIZE as u64,
        })?;
        let buf = read_bounded(reader, table_len, "offset table")?;
        decode_offsets(&buf)?
    } else {
        Vec::new()
    };

    Ok(ContainerInfo {
        header,
        metadata,
        metadata_header,
        offsets,
        offsets_pos: pos,
    })
}

/// Read one compressed chunk (sub-header, payload and digest) and verify its
/// checksum. Returns `None` on a clean end of stream when `allow_eof` is set.
pub(crate) fn read_compressed_chunk<R: Read + ?Sized>(
    reader: &mut R,
    checksum: Checksum,
    index: u64,
    allow_eof: bool,
) -> Result<Option<Vec<u8>>> {
    let mut subheader = [0u8; SUBHEADER_SIZE];
    let filled = read_fully(reader, &mut subheader)?;
    if filled == 0 && allow_eof {
        return Ok(None);
    }
    if filled < SUBHEADER_SIZE {
        return Err(Error::Io(std::io::Error::new(
            IoErrorKind::UnexpectedEof,
            format!("chunk {index}: truncated sub-header ({filled} bytes)"),
        )));
    }
    let sub = ChunkSubHeader::decode(&subheader)?;

    let payload = read_bounded(reader, (sub.ctbytes as usize - SUBHEADER_SIZE) as u64, "chunk payload")?;
    let mut chunk = Vec::with_capacity(sub.ctbytes as usize);
    chunk.extend_from_slice(&subheader);
    chunk.extend_from_slice(&payload);

    let mut digest = vec![0u8; checksum.size()];
    reader.read_exact(&mut digest)?;
    checksum.verify(&chunk, &digest, || format!("chunk {index}"))?;
    Ok(Some(chunk))
}

/// Read exactly `len` bytes. The buffer grows with the data actually read,
/// so a corrupt length field cannot force a huge allocation; a short read is
/// a [`Error::BufferLength`].
pub(crate) fn read_bounded<R: Read + ?Sized>(reader: &mut R, len: u64, what: &'static str) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    (&mut *reader).take(len).read_to_end(&mut buf)?;
    if (buf.len() as u64) < len {
        return Err(Error::BufferLength {
            what,
            expected: usize::try_from(len).unwrap_or(usize::MAX),
            found: buf.len(),
        });
    }
    Ok(buf)
}

fn read_fully<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == IoErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

// ── Compressed sources ─────────────────────────────────────────────────────

/// Producer of checksum-verified compressed chunks from an existing container.
pub trait CompressedSource {
    fn info(&self) -> &ContainerInfo;

    /// The next compressed chunk (sub-header included, digest stripped), or
    /// `None` once every chunk has been produced.
    fn next_compressed(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Compressed source over any reader positioned at the start of a container.
///
/// # Open sequence
/// 1. Read and validate the 32-byte container header.
/// 2. Read the metadata section if present, verifying its checksum.
/// 3. Read the offset table if present.
///
/// Chunks are then read strictly in order; no seeking is needed.
pub struct CompressedReaderSource<R: Read> {
    reader: R,
    info: ContainerInfo,
    next_index: u64,
    exhausted: bool,
}

pub type CompressedFileSource = CompressedReaderSource<BufReader<File>>;

impl<R: Read> CompressedReaderSource<R> {
    pub fn new(mut reader: R) -> Result<Self> {
        let info = read_container_info(&mut reader)?;
        Ok(Self {
            reader,
            info,
            next_index: 0,
            exhausted: false,
        })
    }
}

impl CompressedFileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(BufReader::new(File::open(path)?))
    }
}

impl<R: Read> CompressedSource for CompressedReaderSource<R> {
    fn info(&self) -> &ContainerInfo {
        &self.info
    }

    fn next_compressed(&mut self) -> Result<Option<Vec<u8>>> {
        if self.exhausted {
            return Ok(None);
        }
        let header = &self.info.header;
        if header.nchunks.is_some_and(|n| self.next_index >= n) {
            self.exhausted = true;
            return Ok(None);
        }
        let allow_eof = header.nchunks.is_none();
        let chunk = read_compressed_chunk(&mut self.reader, header.checksum, self.next_index, allow_eof)?;
        match chunk {
            Some(chunk) => {
                self.next_index += 1;
                Ok(Some(chunk))
            }
            None => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_source_is_zero_copy() {
        let data = b"0123456789".to_vec();
        let mut source = PlainSliceSource::new(&data);
        let first = source.next_chunk(4).unwrap();
        assert!(matches!(first, Cow::Borrowed(b"0123")));
        assert_eq!(&*source.next_chunk(6).unwrap(), b"456789");
        assert!(source.next_chunk(1).is_err());
    }

    #[test]
    fn typed_source_reports_typesize() {
        let values = [1.0f64, 2.0, 3.0];
        let mut source = PlainSliceSource::from_elements(&values);
        assert_eq!(source.len(), 24);
        assert_eq!(source.typesize_hint(), Some(8));
        assert_eq!(&*source.next_chunk(8).unwrap(), &1.0f64.to_ne_bytes());
    }

    #[test]
    fn raw_parts_source() {
        let data = vec![7u8; 16];
        let mut source = unsafe { PlainSliceSource::from_raw_parts(data.as_ptr(), data.len()) };
        assert_eq!(source.next_chunk(16).unwrap().len(), 16);
    }

    #[test]
    fn bounded_read_rejects_short_input() {
        let mut reader = &b"abc"[..];
        assert_eq!(read_bounded(&mut reader, 2, "test").unwrap(), b"ab");
        let err = read_bounded(&mut reader, 1 << 40, "test").unwrap_err();
        assert!(matches!(err, Error::BufferLength { found: 1, .. }));
    }

    #[test]
    fn reader_source_reports_short_input() {
        let mut source = PlainReaderSource::new(&b"abc"[..]);
        assert_eq!(&*source.next_chunk(2).unwrap(), b"ab");
        assert!(matches!(source.next_chunk(2), Err(Error::Io(_))));
    }
}
