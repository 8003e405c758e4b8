//! Pack/unpack orchestration: drives a source and a sink through the full
//! container protocol.

use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Write};
use std::path::Path;

use log::{debug, info};
use rayon::prelude::*;

use crate::args::{BloscArgs, BloscpackArgs, MetadataArgs, PackOptions};
use crate::codec::BlockCodec;
use crate::error::{Error, Result};
use crate::format::{ContainerHeader, FORMAT_VERSION};
use crate::metadata::{EncodedMetadata, Metadata};
use crate::plan::ChunkPlan;
use crate::sink::{CompressedFileSink, CompressedSink, CompressedWriterSink, PlainSink};
use crate::source::{
    CompressedFileSource, CompressedReaderSource, CompressedSource, Element, PlainFileSource, PlainSliceSource,
    PlainSource,
};

/// Writes containers with a fixed set of codec, container and metadata
/// arguments.
pub struct Packer<'a> {
    codec: &'a dyn BlockCodec,
    pub blosc_args: BloscArgs,
    pub bloscpack_args: BloscpackArgs,
    pub metadata_args: MetadataArgs,
    pub options: PackOptions,
}

impl<'a> Packer<'a> {
    pub fn new(codec: &'a dyn BlockCodec) -> Self {
        Self {
            codec,
            blosc_args: BloscArgs::default(),
            bloscpack_args: BloscpackArgs::default(),
            metadata_args: MetadataArgs::default(),
            options: PackOptions::default(),
        }
    }

    pub fn blosc_args(mut self, args: BloscArgs) -> Self {
        self.blosc_args = args;
        self
    }

    pub fn bloscpack_args(mut self, args: BloscpackArgs) -> Self {
        self.bloscpack_args = args;
        self
    }

    pub fn metadata_args(mut self, args: MetadataArgs) -> Self {
        self.metadata_args = args;
        self
    }

    pub fn options(mut self, options: PackOptions) -> Self {
        self.options = options;
        self
    }

    /// Build the container header for `plan` without writing anything.
    pub fn header_for(&self, plan: &ChunkPlan, with_metadata: bool) -> Result<ContainerHeader> {
        self.header_with(&self.blosc_args, plan, with_metadata)
    }

    fn header_with(&self, blosc_args: &BloscArgs, plan: &ChunkPlan, with_metadata: bool) -> Result<ContainerHeader> {
        let args = &self.bloscpack_args;
        let max_app_chunks = if args.offsets {
            args.max_app_chunks.resolve(plan.nchunks)
        } else {
            debug!("offsets disabled, no append capacity reserved");
            0
        };
        let header = ContainerHeader {
            format_version: FORMAT_VERSION,
            offsets: args.offsets,
            metadata: with_metadata,
            checksum: args.checksum,
            typesize: Some(blosc_args.typesize),
            chunk_size: Some(chunk_field("chunk_size", plan.chunk_size)?),
            last_chunk: Some(chunk_field("last_chunk", plan.last_chunk_size)?),
            nchunks: Some(plan.nchunks),
            max_app_chunks,
        };
        header.validate()?;
        Ok(header)
    }

    /// Validate the arguments, build the header and encode the metadata.
    /// Nothing is written, so a failure here leaves any output untouched.
    fn prepare(&self, blosc_args: &BloscArgs, plan: &ChunkPlan, metadata: Option<&Metadata>) -> Result<Prepared> {
        blosc_args.validate()?;
        let header = self.header_with(blosc_args, plan, metadata.is_some())?;
        let metadata = metadata
            .map(|m| EncodedMetadata::new(m, &self.metadata_args))
            .transpose()?;
        Ok(Prepared { header, metadata })
    }

    /// Pack everything `source` yields according to `plan` into `sink`.
    ///
    /// All argument validation, header construction and metadata encoding
    /// happen before the first byte reaches the sink.
    pub fn pack<S, K>(
        &self,
        source: &mut S,
        sink: &mut K,
        plan: &ChunkPlan,
        metadata: Option<&Metadata>,
    ) -> Result<ContainerHeader>
    where
        S: PlainSource + ?Sized,
        K: CompressedSink + ?Sized,
    {
        let prepared = self.prepare(&self.blosc_args, plan, metadata)?;
        self.write_prepared(&self.blosc_args, prepared, source, sink, plan)
    }

    fn write_prepared<S, K>(
        &self,
        blosc_args: &BloscArgs,
        prepared: Prepared,
        source: &mut S,
        sink: &mut K,
        plan: &ChunkPlan,
    ) -> Result<ContainerHeader>
    where
        S: PlainSource + ?Sized,
        K: CompressedSink + ?Sized,
    {
        let Prepared { header, metadata } = prepared;
        sink.write_container_header(&header)?;
        if let Some(encoded) = &metadata {
            sink.write_metadata(encoded)?;
        }
        if header.offsets {
            sink.init_offsets(header.total_slots())?;
        }
        write_chunks(self.codec, source, sink, plan, 0, blosc_args, &self.options)?;
        sink.finalize()?;

        info!(
            "packed {} bytes into {} chunk(s) ({} reserved for append, checksum {})",
            plan.total_size(),
            plan.nchunks,
            header.max_app_chunks,
            header.checksum
        );
        Ok(header)
    }

    /// Pack an in-memory buffer into a new in-memory container.
    pub fn pack_bytes_to_bytes(&self, data: &[u8], chunk_size: u64, metadata: Option<&Metadata>) -> Result<Vec<u8>> {
        let plan = ChunkPlan::new(data.len() as u64, chunk_size)?;
        let mut source = PlainSliceSource::new(data);
        let mut sink = CompressedWriterSink::new(Cursor::new(Vec::new()))?;
        self.pack(&mut source, &mut sink, &plan, metadata)?;
        Ok(sink.into_inner().into_inner())
    }

    /// Pack a typed slice into a new in-memory container. `chunk_size` is in
    /// bytes; the typesize is taken from `T` rather than from the packer's
    /// [`BloscArgs`].
    pub fn pack_elements_to_bytes<T: Element>(
        &self,
        elements: &[T],
        chunk_size: u64,
        metadata: Option<&Metadata>,
    ) -> Result<Vec<u8>> {
        let mut source = PlainSliceSource::from_elements(elements);
        let blosc_args = BloscArgs {
            typesize: source.typesize_hint().unwrap_or(self.blosc_args.typesize),
            ..self.blosc_args.clone()
        };
        let plan = ChunkPlan::new(std::mem::size_of_val(elements) as u64, chunk_size)?;
        let prepared = self.prepare(&blosc_args, &plan, metadata)?;
        let mut sink = CompressedWriterSink::new(Cursor::new(Vec::new()))?;
        self.write_prepared(&blosc_args, prepared, &mut source, &mut sink, &plan)?;
        Ok(sink.into_inner().into_inner())
    }

    /// Pack an in-memory buffer into the file at `path`. The file is only
    /// created once the arguments and metadata have been validated.
    pub fn pack_bytes_to_file(
        &self,
        data: &[u8],
        path: impl AsRef<Path>,
        chunk_size: u64,
        metadata: Option<&Metadata>,
    ) -> Result<ContainerHeader> {
        let plan = ChunkPlan::new(data.len() as u64, chunk_size)?;
        let prepared = self.prepare(&self.blosc_args, &plan, metadata)?;
        let mut source = PlainSliceSource::new(data);
        let mut sink = CompressedFileSink::create(path)?;
        self.write_prepared(&self.blosc_args, prepared, &mut source, &mut sink, &plan)
    }

    /// Pack the file at `input` into a new container at `output`, created
    /// only after validation succeeds.
    pub fn pack_file_to_file(
        &self,
        input: impl AsRef<Path>,
        output: impl AsRef<Path>,
        chunk_size: u64,
        metadata: Option<&Metadata>,
    ) -> Result<ContainerHeader> {
        let (mut source, len) = PlainFileSource::open(input)?;
        let plan = ChunkPlan::new(len, chunk_size)?;
        let prepared = self.prepare(&self.blosc_args, &plan, metadata)?;
        let mut sink = CompressedFileSink::create(output)?;
        self.write_prepared(&self.blosc_args, prepared, &mut source, &mut sink, &plan)
    }
}

/// Header and metadata section checked and encoded ahead of any output.
struct Prepared {
    header: ContainerHeader,
    metadata: Option<EncodedMetadata>,
}

fn chunk_field(field: &'static str, value: u64) -> Result<u32> {
    u32::try_from(value)
        .ok()
        .filter(|v| *v <= i32::MAX as u32)
        .ok_or(Error::FieldOutOfRange {
            field,
            value: value as i64,
        })
}

/// Compress the chunks described by `plan` and hand them to `sink`, numbered
/// from `first_index`.
///
/// With more than one thread, up to `threads` chunks are compressed in
/// parallel; they are still written one by one in index order.
pub(crate) fn write_chunks<S, K>(
    codec: &dyn BlockCodec,
    source: &mut S,
    sink: &mut K,
    plan: &ChunkPlan,
    first_index: u64,
    args: &BloscArgs,
    options: &PackOptions,
) -> Result<()>
where
    S: PlainSource + ?Sized,
    K: CompressedSink + ?Sized,
{
    if options.threads <= 1 {
        for i in 0..plan.nchunks {
            let raw = source.next_chunk(plan.chunk_len(i) as usize)?;
            let compressed = codec.compress(&raw, args)?;
            sink.put(first_index + i, &compressed)?;
        }
        return Ok(());
    }

    let pool = thread_pool(options.threads)?;
    let batch = options.threads as u64;
    let mut i = 0;
    while i < plan.nchunks {
        let end = (i + batch).min(plan.nchunks);
        let raws = (i..end)
            .map(|j| source.next_chunk(plan.chunk_len(j) as usize).map(|c| c.into_owned()))
            .collect::<Result<Vec<_>>>()?;
        let compressed: Vec<Result<Vec<u8>>> =
            pool.install(|| raws.par_iter().map(|raw| codec.compress(raw, args)).collect());
        for (j, chunk) in (i..end).zip(compressed) {
            sink.put(first_index + j, &chunk?)?;
        }
        i = end;
    }
    Ok(())
}

fn thread_pool(threads: usize) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .map_err(|e| Error::invalid_argument("threads", e.to_string()))
}

// ── Unpack ─────────────────────────────────────────────────────────────────

/// Reads containers back into raw bytes.
pub struct Unpacker<'a> {
    codec: &'a dyn BlockCodec,
    pub options: PackOptions,
}

impl<'a> Unpacker<'a> {
    pub fn new(codec: &'a dyn BlockCodec) -> Self {
        Self {
            codec,
            options: PackOptions::default(),
        }
    }

    pub fn options(mut self, options: PackOptions) -> Self {
        self.options = options;
        self
    }

    /// Decompress every chunk of `source` into `sink`, in order. Each chunk's
    /// checksum is verified by the source before it is decompressed.
    ///
    /// Returns the container's metadata, if any.
    pub fn unpack<C, P>(&self, source: &mut C, sink: &mut P) -> Result<Option<Metadata>>
    where
        C: CompressedSource + ?Sized,
        P: PlainSink + ?Sized,
    {
        let threads = self.options.threads.max(1);
        let pool = if threads > 1 { Some(thread_pool(threads)?) } else { None };

        let mut nchunks = 0u64;
        let mut total = 0u64;
        loop {
            let mut batch = Vec::with_capacity(threads);
            while batch.len() < threads {
                match source.next_compressed()? {
                    Some(chunk) => batch.push(chunk),
                    None => break,
                }
            }
            if batch.is_empty() {
                break;
            }
            let done = batch.len() < threads;

            let raws: Vec<Result<Vec<u8>>> = match &pool {
                Some(pool) => pool.install(|| batch.par_iter().map(|c| self.codec.decompress(c)).collect()),
                None => batch.iter().map(|c| self.codec.decompress(c)).collect(),
            };
            for raw in raws {
                let raw = raw?;
                total += raw.len() as u64;
                sink.put(&raw)?;
                nchunks += 1;
            }
            if done {
                break;
            }
        }

        let info = source.info();
        if let Some(expected) = info.header.nchunks {
            if nchunks != expected {
                return Err(Error::FieldOutOfRange {
                    field: "nchunks",
                    value: nchunks as i64,
                });
            }
        }
        info!("unpacked {nchunks} chunk(s), {total} bytes");
        Ok(info.metadata.clone())
    }

    pub fn unpack_bytes_from_bytes(&self, container: &[u8]) -> Result<(Vec<u8>, Option<Metadata>)> {
        let mut source = CompressedReaderSource::new(container)?;
        let mut out = Vec::new();
        let metadata = self.unpack(&mut source, &mut out)?;
        Ok((out, metadata))
    }

    pub fn unpack_bytes_from_file(&self, path: impl AsRef<Path>) -> Result<(Vec<u8>, Option<Metadata>)> {
        let mut source = CompressedFileSource::open(path)?;
        let mut out = Vec::new();
        let metadata = self.unpack(&mut source, &mut out)?;
        Ok((out, metadata))
    }

    pub fn unpack_file_to_file(&self, input: impl AsRef<Path>, output: impl AsRef<Path>) -> Result<Option<Metadata>> {
        let mut source = CompressedReaderSource::new(BufReader::new(File::open(input)?))?;
        let mut sink = BufWriter::new(File::create(output)?);
        let metadata = self.unpack(&mut source, &mut sink)?;
        sink.flush()?;
        Ok(metadata)
    }
}
