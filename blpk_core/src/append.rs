//! In-place append to an existing container.
//!
//! The last chunk is topped up to `chunk_size` first, then whatever remains
//! is written as new chunks into slots reserved by `max_app_chunks`.
//!
//! Mutations are not transactional. When the new content overflows the last
//! chunk, the top-up (last chunk and header) is committed before the reserved
//! capacity is checked, so a `NotEnoughSpace` failure leaves the container
//! holding the original data plus the bytes that fit into the last chunk.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::{debug, info};

use crate::args::{BloscArgs, BloscOverrides, PackOptions};
use crate::codec::BlockCodec;
use crate::error::{Error, Result};
use crate::format::{ChunkSubHeader, ContainerHeader, UNUSED_OFFSET};
use crate::pack::write_chunks;
use crate::plan::ChunkPlan;
use crate::sink::{CompressedSink, CompressedWriterSink};
use crate::source::{read_compressed_chunk, read_container_info, PlainReaderSource};

/// A seekable, writable container that can also be shrunk.
pub trait ContainerFile: Read + Write + Seek {
    fn truncate_to(&mut self, len: u64) -> std::io::Result<()>;
}

impl ContainerFile for File {
    fn truncate_to(&mut self, len: u64) -> std::io::Result<()> {
        self.set_len(len)
    }
}

impl ContainerFile for Cursor<Vec<u8>> {
    fn truncate_to(&mut self, len: u64) -> std::io::Result<()> {
        self.get_mut().truncate(len as usize);
        Ok(())
    }
}

impl ContainerFile for Cursor<&mut Vec<u8>> {
    fn truncate_to(&mut self, len: u64) -> std::io::Result<()> {
        self.get_mut().truncate(len as usize);
        Ok(())
    }
}

impl<F: ContainerFile + ?Sized> ContainerFile for &mut F {
    fn truncate_to(&mut self, len: u64) -> std::io::Result<()> {
        (**self).truncate_to(len)
    }
}

/// Appends new content to containers in place.
pub struct Appender<'a> {
    codec: &'a dyn BlockCodec,
    pub overrides: BloscOverrides,
    pub options: PackOptions,
}

impl<'a> Appender<'a> {
    pub fn new(codec: &'a dyn BlockCodec) -> Self {
        Self {
            codec,
            overrides: BloscOverrides::default(),
            options: PackOptions::default(),
        }
    }

    pub fn overrides(mut self, overrides: BloscOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn options(mut self, options: PackOptions) -> Self {
        self.options = options;
        self
    }

    /// Append `new_size` bytes read from `new_content` to the container in
    /// `file`. Returns the number of chunks added (0 when everything fit into
    /// the last chunk).
    pub fn append<F, R>(&self, file: &mut F, new_content: &mut R, new_size: u64) -> Result<u64>
    where
        F: ContainerFile + ?Sized,
        R: Read + ?Sized,
    {
        file.seek(SeekFrom::Start(0))?;
        let info = read_container_info(file)?;
        let mut header = info.header.clone();
        if !header.offsets {
            return Err(Error::NoOffsets);
        }
        let nchunks = header.nchunks.ok_or(Error::FieldOutOfRange {
            field: "nchunks",
            value: -1,
        })?;
        let chunk_size = header.chunk_size.ok_or(Error::FieldOutOfRange {
            field: "chunk_size",
            value: -1,
        })? as u64;
        let typesize = match (self.overrides.typesize, header.typesize) {
            (Some(typesize), _) | (None, Some(typesize)) => typesize,
            (None, None) => return Err(Error::NonUniformTypesize),
        };

        if new_size == 0 {
            return Ok(0);
        }

        // ── Load the last chunk ────────────────────────────────────────────
        let last_index = nchunks.checked_sub(1).ok_or(Error::FieldOutOfRange {
            field: "nchunks",
            value: 0,
        })?;
        let last_offset = match info.offsets.get(last_index as usize) {
            Some(&offset) if offset != UNUSED_OFFSET => offset as u64,
            other => {
                return Err(Error::FieldOutOfRange {
                    field: "offset",
                    value: other.copied().unwrap_or(UNUSED_OFFSET),
                })
            }
        };
        file.seek(SeekFrom::Start(last_offset))?;
        let last_compressed = read_compressed_chunk(file, header.checksum, last_index, false)?
            .ok_or_else(|| Error::invalid_argument("offset", "last chunk missing"))?;
        let subheader = self.codec.subheader(&last_compressed)?;
        let mut last_raw = self.codec.decompress(&last_compressed)?;

        let args = self.effective_args(typesize, &subheader)?;
        debug!(
            "appending {new_size} bytes to a container of {nchunks} chunk(s), last chunk {} of {chunk_size} bytes, args {args:?}",
            last_raw.len()
        );
        if header.typesize != Some(typesize) {
            header.typesize = None;
        }

        let bytes_to_read = chunk_size.saturating_sub(last_raw.len() as u64);

        // ── Case A: everything fits into the last chunk ────────────────────
        if new_size <= bytes_to_read {
            read_into(new_content, &mut last_raw, new_size)?;
            self.rewrite_last_chunk(file, &header, last_offset, &last_raw, &args)?;
            header.last_chunk = Some(last_raw.len() as u32);
            write_header(file, &header)?;
            file.flush()?;
            info!("appended {new_size} bytes into the last chunk");
            return Ok(0);
        }

        // ── Case B: top up the last chunk, then add new chunks ─────────────
        if bytes_to_read > 0 {
            read_into(new_content, &mut last_raw, bytes_to_read)?;
            self.rewrite_last_chunk(file, &header, last_offset, &last_raw, &args)?;
            header.last_chunk = Some(chunk_size as u32);
            write_header(file, &header)?;
        }

        let remaining = new_size - bytes_to_read;
        let plan = ChunkPlan::new(remaining, chunk_size)?;
        if plan.nchunks > header.max_app_chunks {
            file.flush()?;
            return Err(Error::NotEnoughSpace {
                needed: plan.nchunks,
                available: header.max_app_chunks,
            });
        }

        let end = file.seek(SeekFrom::End(0))?;
        let mut sink = CompressedWriterSink::resume(
            &mut *file,
            header.checksum,
            end,
            info.offsets_pos,
            info.offsets.clone(),
            nchunks,
        )?;
        let mut source = PlainReaderSource::new(new_content);
        write_chunks(self.codec, &mut source, &mut sink, &plan, nchunks, &args, &self.options)?;

        header.nchunks = Some(nchunks + plan.nchunks);
        header.max_app_chunks -= plan.nchunks;
        header.last_chunk = Some(plan.last_chunk_size as u32);
        write_header(sink.writer_mut(), &header)?;
        sink.finalize()?;

        info!(
            "appended {new_size} bytes: {bytes_to_read} into the last chunk, {} new chunk(s), {} slot(s) left",
            plan.nchunks, header.max_app_chunks
        );
        Ok(plan.nchunks)
    }

    /// Append the whole file at `new_content` to the container at `container`.
    pub fn append_to_file(&self, container: impl AsRef<Path>, new_content: impl AsRef<Path>) -> Result<u64> {
        let mut file = OpenOptions::new().read(true).write(true).open(container)?;
        let new_file = File::open(new_content)?;
        let new_size = new_file.metadata()?.len();
        self.append(&mut file, &mut BufReader::new(new_file), new_size)
    }

    /// Append an in-memory buffer to the container at `container`.
    pub fn append_bytes_to_file(&self, container: impl AsRef<Path>, data: &[u8]) -> Result<u64> {
        let mut file = OpenOptions::new().read(true).write(true).open(container)?;
        self.append(&mut file, &mut &data[..], data.len() as u64)
    }

    /// Explicit overrides win; otherwise shuffle and compressor come from the
    /// last chunk and the level from the defaults.
    fn effective_args(&self, typesize: u8, subheader: &ChunkSubHeader) -> Result<BloscArgs> {
        let defaults = BloscArgs::default();
        let (shuffle, cname) = if subheader.pure_memcpy() {
            (defaults.shuffle, defaults.cname)
        } else {
            (
                subheader.byte_shuffle(),
                subheader.cname().unwrap_or(defaults.cname),
            )
        };
        let args = BloscArgs {
            typesize,
            clevel: self.overrides.clevel.unwrap_or(defaults.clevel),
            shuffle: self.overrides.shuffle.unwrap_or(shuffle),
            cname: self.overrides.cname.unwrap_or(cname),
        };
        args.validate()?;
        Ok(args)
    }

    /// Recompress `raw` and overwrite the last chunk at `offset`, truncating
    /// whatever followed the old chunk.
    fn rewrite_last_chunk<F: ContainerFile + ?Sized>(
        &self,
        file: &mut F,
        header: &ContainerHeader,
        offset: u64,
        raw: &[u8],
        args: &BloscArgs,
    ) -> Result<()> {
        let compressed = self.codec.compress(raw, args)?;
        let digest = header.checksum.digest(&compressed);
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&compressed)?;
        file.write_all(&digest)?;
        let end = offset + (compressed.len() + digest.len()) as u64;
        file.truncate_to(end)?;
        debug!(
            "rewrote last chunk at {offset}: {} raw, {} compressed bytes",
            raw.len(),
            compressed.len()
        );
        Ok(())
    }
}

fn write_header<W: Write + Seek + ?Sized>(writer: &mut W, header: &ContainerHeader) -> Result<()> {
    let buf = header.encode()?;
    let pos = writer.stream_position()?;
    writer.seek(SeekFrom::Start(0))?;
    writer.write_all(&buf)?;
    writer.seek(SeekFrom::Start(pos))?;
    Ok(())
}

fn read_into<R: Read + ?Sized>(reader: &mut R, buf: &mut Vec<u8>, len: u64) -> Result<()> {
    let start = buf.len();
    buf.resize(start + len as usize, 0);
    reader.read_exact(&mut buf[start..])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::{AppendCapacity, BloscpackArgs};
    use crate::format::SUBHEADER_SIZE;
    use crate::pack::{Packer, Unpacker};

    /// Stores every chunk verbatim behind a `pure_memcpy` sub-header.
    struct StoreCodec;

    impl BlockCodec for StoreCodec {
        fn compress(&self, raw: &[u8], args: &BloscArgs) -> Result<Vec<u8>> {
            let header = ChunkSubHeader {
                version: 2,
                versionlz: 1,
                flags: ChunkSubHeader::pack_flags(false, true, false, false, args.cname.format_id()),
                typesize: args.typesize,
                nbytes: raw.len() as u32,
                blocksize: raw.len() as u32,
                ctbytes: (SUBHEADER_SIZE + raw.len()) as u32,
            };
            let mut out = header.encode().to_vec();
            out.extend_from_slice(raw);
            Ok(out)
        }

        fn decompress(&self, compressed: &[u8]) -> Result<Vec<u8>> {
            let header = ChunkSubHeader::decode(compressed)?;
            Ok(compressed[SUBHEADER_SIZE..header.ctbytes as usize].to_vec())
        }
    }

    fn packed(data: &[u8], chunk_size: u64, capacity: u64) -> Cursor<Vec<u8>> {
        let container = Packer::new(&StoreCodec)
            .bloscpack_args(BloscpackArgs {
                max_app_chunks: AppendCapacity::Fixed(capacity),
                ..BloscpackArgs::default()
            })
            .pack_bytes_to_bytes(data, chunk_size, None)
            .unwrap();
        Cursor::new(container)
    }

    fn contents(file: &Cursor<Vec<u8>>) -> Vec<u8> {
        Unpacker::new(&StoreCodec).unpack_bytes_from_bytes(file.get_ref()).unwrap().0
    }

    #[test]
    fn tops_up_then_adds_chunks() {
        let mut file = packed(b"0123456789", 4, 4);
        let added = Appender::new(&StoreCodec).append(&mut file, &mut &b"abcdefg"[..], 7).unwrap();
        assert_eq!(added, 2);
        assert_eq!(contents(&file), b"0123456789abcdefg");

        file.set_position(0);
        let info = read_container_info(&mut file).unwrap();
        assert_eq!(info.header.nchunks, Some(5));
        assert_eq!(info.header.last_chunk, Some(1));
        assert_eq!(info.header.max_app_chunks, 2);
    }

    #[test]
    fn inherits_from_last_chunk_unless_overridden() {
        let appender = Appender::new(&StoreCodec);
        let sub = ChunkSubHeader {
            version: 2,
            versionlz: 1,
            flags: ChunkSubHeader::pack_flags(false, false, false, false, 3),
            typesize: 4,
            nbytes: 0,
            blocksize: 0,
            ctbytes: 16,
        };
        let args = appender.effective_args(4, &sub).unwrap();
        assert_eq!(args.cname, crate::codec::Cname::Zlib);
        assert!(!args.shuffle);
        assert_eq!(args.clevel, BloscArgs::default().clevel);

        let stored = ChunkSubHeader {
            flags: ChunkSubHeader::pack_flags(false, true, false, false, 4),
            ..sub
        };
        assert_eq!(appender.effective_args(4, &stored).unwrap().cname, BloscArgs::default().cname);

        let appender = appender.overrides(BloscOverrides {
            clevel: Some(1),
            shuffle: Some(true),
            ..BloscOverrides::default()
        });
        let args = appender.effective_args(2, &sub).unwrap();
        assert_eq!((args.typesize, args.clevel, args.shuffle), (2, 1, true));
    }

    #[test]
    fn empty_container_cannot_grow() {
        let mut file = packed(b"", 4, 4);
        let err = Appender::new(&StoreCodec).append(&mut file, &mut &b"x"[..], 1).unwrap_err();
        assert!(matches!(err, Error::ChunkSizeOutOfRange { .. }));
    }
}
