use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::Path;

use log::debug;

use crate::checksum::Checksum;
use crate::error::{Error, Result};
use crate::format::{encode_offsets, ContainerHeader, OFFSET_SIZE, UNUSED_OFFSET};
use crate::metadata::EncodedMetadata;

// ── Plain sinks ────────────────────────────────────────────────────────────

/// Consumer of decompressed chunks, in order.
///
/// Every [`Write`] is a plain sink, so files, stdout and `Vec<u8>` buffers
/// can all receive unpacked data directly.
pub trait PlainSink {
    fn put(&mut self, raw: &[u8]) -> Result<()>;
}

impl<W: Write + ?Sized> PlainSink for W {
    fn put(&mut self, raw: &[u8]) -> Result<()> {
        self.write_all(raw)?;
        Ok(())
    }
}

// ── Compressed sinks ───────────────────────────────────────────────────────

/// Consumer of a container being written: header, metadata, offset table
/// placeholder, then compressed chunks in strict index order.
pub trait CompressedSink {
    fn write_container_header(&mut self, header: &ContainerHeader) -> Result<()>;

    fn write_metadata(&mut self, metadata: &EncodedMetadata) -> Result<()>;

    /// Reserve an offset table of `slots` entries, all unused.
    fn init_offsets(&mut self, slots: u64) -> Result<()>;

    /// Persist chunk `index`, followed by its digest, and record its offset.
    fn put(&mut self, index: u64, compressed: &[u8]) -> Result<()>;

    /// Write back every offset recorded since the table was created or
    /// resumed, then flush.
    fn finalize(&mut self) -> Result<()>;
}

/// In-memory view of the offset table and the entries changed by this writer.
#[derive(Debug)]
struct OffsetTable {
    /// Byte position of slot 0.
    pos: u64,
    entries: Vec<i64>,
    dirty: Option<Range<usize>>,
}

/// Compressed sink over any seekable writer.
///
/// # Write contract
/// ```text
/// [CONTAINER HEADER: 32 bytes]
/// [METADATA SECTION]                         ← optional
/// [OFFSET TABLE: 8 bytes × slots, all -1]    ← optional placeholder
/// [CHUNK 0 + digest] ... [CHUNK N-1 + digest]
/// ← finalize: seek back, overwrite the changed offset slots
/// ```
pub struct CompressedWriterSink<W: Write + Seek> {
    writer: W,
    checksum: Checksum,
    /// Current write position (mirrors the writer's cursor).
    position: u64,
    offsets: Option<OffsetTable>,
    next_index: u64,
}

pub type CompressedFileSink = CompressedWriterSink<BufWriter<File>>;

impl<W: Write + Seek> CompressedWriterSink<W> {
    /// A sink for a fresh container starting at the writer's current position.
    pub fn new(mut writer: W) -> Result<Self> {
        let position = writer.stream_position()?;
        Ok(Self {
            writer,
            checksum: Checksum::None,
            position,
            offsets: None,
            next_index: 0,
        })
    }

    /// A sink continuing an existing container: new chunks go at `position`,
    /// numbered from `next_index`, and their offsets land in the table that
    /// starts at `offsets_pos`.
    pub fn resume(
        mut writer: W,
        checksum: Checksum,
        position: u64,
        offsets_pos: u64,
        offsets: Vec<i64>,
        next_index: u64,
    ) -> Result<Self> {
        writer.seek(SeekFrom::Start(position))?;
        Ok(Self {
            writer,
            checksum,
            position,
            offsets: Some(OffsetTable {
                pos: offsets_pos,
                entries: offsets,
                dirty: None,
            }),
            next_index,
        })
    }

    /// Current end of the written data.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Offsets of every slot, including unused ones.
    pub fn offsets(&self) -> Option<&[i64]> {
        self.offsets.as_ref().map(|t| t.entries.as_slice())
    }

    pub fn writer_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)?;
        self.position += bytes.len() as u64;
        Ok(())
    }
}

impl CompressedFileSink {
    /// Create (or truncate) `path` and write a container into it.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(BufWriter::new(File::create(path)?))
    }
}

impl<W: Write + Seek> CompressedSink for CompressedWriterSink<W> {
    fn write_container_header(&mut self, header: &ContainerHeader) -> Result<()> {
        self.checksum = header.checksum;
        let buf = header.encode()?;
        self.write_bytes(&buf)
    }

    fn write_metadata(&mut self, metadata: &EncodedMetadata) -> Result<()> {
        let buf = metadata.to_bytes()?;
        self.write_bytes(&buf)
    }

    fn init_offsets(&mut self, slots: u64) -> Result<()> {
        let slots = usize::try_from(slots)
            .map_err(|_| Error::invalid_argument("offsets", format!("{slots} slots do not fit in memory")))?;
        let entries = vec![UNUSED_OFFSET; slots];
        let pos = self.position;
        self.write_bytes(&encode_offsets(&entries))?;
        debug!("reserved {slots} offset slots at {pos}");
        self.offsets = Some(OffsetTable {
            pos,
            entries,
            dirty: None,
        });
        Ok(())
    }

    fn put(&mut self, index: u64, compressed: &[u8]) -> Result<()> {
        if index != self.next_index {
            return Err(Error::invalid_argument(
                "index",
                format!("chunk {index} written out of order, expected {}", self.next_index),
            ));
        }
        let offset = self.position;
        let digest = self.checksum.digest(compressed);
        self.write_bytes(compressed)?;
        self.write_bytes(&digest)?;

        if let Some(table) = self.offsets.as_mut() {
            let slot = index as usize;
            let available = table.entries.len() as u64;
            let entry = table.entries.get_mut(slot).ok_or(Error::NotEnoughSpace {
                needed: index + 1,
                available,
            })?;
            *entry = offset as i64;
            table.dirty = Some(match table.dirty.take() {
                Some(range) => range.start..slot + 1,
                None => slot..slot + 1,
            });
        }
        debug!(
            "chunk {index}: {} compressed bytes + {} digest at offset {offset}",
            compressed.len(),
            digest.len()
        );
        self.next_index += 1;
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        if let Some(table) = self.offsets.as_mut() {
            if let Some(range) = table.dirty.take() {
                let at = table.pos + (range.start * OFFSET_SIZE) as u64;
                self.writer.seek(SeekFrom::Start(at))?;
                self.writer.write_all(&encode_offsets(&table.entries[range.clone()]))?;
                self.writer.seek(SeekFrom::Start(self.position))?;
                debug!("wrote offsets {}..{} at {at}", range.start, range.end);
            }
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::format::{decode_offsets, CONTAINER_HEADER_SIZE};

    #[test]
    fn offsets_are_backfilled_on_finalize() {
        let header = ContainerHeader {
            offsets: true,
            checksum: Checksum::Crc32,
            typesize: Some(1),
            chunk_size: Some(4),
            last_chunk: Some(4),
            nchunks: Some(2),
            max_app_chunks: 2,
            ..ContainerHeader::default()
        };
        let mut sink = CompressedWriterSink::new(Cursor::new(Vec::new())).unwrap();
        sink.write_container_header(&header).unwrap();
        sink.init_offsets(header.total_slots()).unwrap();
        sink.put(0, &[1u8; 20]).unwrap();
        sink.put(1, &[2u8; 20]).unwrap();
        sink.finalize().unwrap();

        let buf = sink.into_inner().into_inner();
        let table = &buf[CONTAINER_HEADER_SIZE..CONTAINER_HEADER_SIZE + 4 * OFFSET_SIZE];
        let first = (CONTAINER_HEADER_SIZE + 4 * OFFSET_SIZE) as i64;
        assert_eq!(decode_offsets(table).unwrap(), vec![first, first + 24, -1, -1]);
        assert_eq!(buf.len() as i64, first + 48);
    }

    #[test]
    fn out_of_order_put_is_rejected() {
        let mut sink = CompressedWriterSink::new(Cursor::new(Vec::new())).unwrap();
        sink.init_offsets(2).unwrap();
        assert!(sink.put(1, b"x").is_err());
    }

    #[test]
    fn put_past_the_reserved_table_fails() {
        let mut sink = CompressedWriterSink::new(Cursor::new(Vec::new())).unwrap();
        sink.init_offsets(1).unwrap();
        sink.put(0, b"first").unwrap();
        let err = sink.put(1, b"second").unwrap_err();
        assert!(matches!(err, Error::NotEnoughSpace { needed: 2, available: 1 }));
    }

    #[test]
    fn vec_is_a_plain_sink() {
        let mut out = Vec::new();
        PlainSink::put(&mut out, b"ab").unwrap();
        PlainSink::put(&mut out, b"c").unwrap();
        assert_eq!(out, b"abc");
    }
}
