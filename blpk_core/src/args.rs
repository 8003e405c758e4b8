//! Tunables for the codec, the container and the metadata section.
//!
//! Every struct has a `Default` matching the CLI defaults, and a `validate`
//! that runs before any I/O is attempted.

use log::warn;

use crate::checksum::Checksum;
use crate::codec::Cname;
use crate::error::{Error, Result};
use crate::format::{MAX_CHUNKS, MAX_META_SIZE};
use crate::metadata::{MetaCodec, Serializer};

pub const DEFAULT_TYPESIZE: u8 = 8;
pub const DEFAULT_CLEVEL: u8 = 7;
pub const MAX_CLEVEL: u8 = 9;
pub const DEFAULT_SHUFFLE: bool = true;
pub const DEFAULT_CNAME: Cname = Cname::Lz4;

pub const DEFAULT_OFFSETS: bool = true;
pub const DEFAULT_CHECKSUM: Checksum = Checksum::Adler32;

pub const DEFAULT_META_CODEC: MetaCodec = MetaCodec::Zlib;
pub const DEFAULT_META_LEVEL: u8 = 6;
pub const DEFAULT_META_CHECKSUM: Checksum = Checksum::Adler32;

/// Default chunk size: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 1 << 20;

/// Arguments handed to the block codec for every chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloscArgs {
    pub typesize: u8,
    pub clevel: u8,
    pub shuffle: bool,
    pub cname: Cname,
}

impl Default for BloscArgs {
    fn default() -> Self {
        Self {
            typesize: DEFAULT_TYPESIZE,
            clevel: DEFAULT_CLEVEL,
            shuffle: DEFAULT_SHUFFLE,
            cname: DEFAULT_CNAME,
        }
    }
}

impl BloscArgs {
    pub fn validate(&self) -> Result<()> {
        if self.typesize == 0 {
            return Err(Error::invalid_argument("typesize", "must be at least 1"));
        }
        if self.typesize == u8::MAX {
            return Err(Error::invalid_argument("typesize", "255 marks a non-uniform container"));
        }
        if self.clevel > MAX_CLEVEL {
            return Err(Error::invalid_argument(
                "clevel",
                format!("{} is above the maximum of {MAX_CLEVEL}", self.clevel),
            ));
        }
        Ok(())
    }
}

/// Partial [`BloscArgs`] used by append: unset fields are inherited from the
/// container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BloscOverrides {
    pub typesize: Option<u8>,
    pub clevel: Option<u8>,
    pub shuffle: Option<bool>,
    pub cname: Option<Cname>,
}

/// How many offset-table slots to reserve for future appends.
#[derive(Debug, Clone, Copy)]
pub enum AppendCapacity {
    Fixed(u64),
    /// Computed from the number of chunks written by the initial pack.
    Computed(fn(u64) -> u64),
}

impl Default for AppendCapacity {
    fn default() -> Self {
        AppendCapacity::Computed(|nchunks| nchunks.saturating_mul(10))
    }
}

impl AppendCapacity {
    /// Resolve the policy for `nchunks`, clamped so the table never holds
    /// more than [`MAX_CHUNKS`] slots.
    pub fn resolve(&self, nchunks: u64) -> u64 {
        let wanted = match self {
            AppendCapacity::Fixed(n) => *n,
            AppendCapacity::Computed(f) => f(nchunks),
        };
        let room = MAX_CHUNKS.saturating_sub(nchunks);
        if wanted > room {
            warn!("max_app_chunks {wanted} clamped to {room} to stay within {MAX_CHUNKS} chunks");
            room
        } else {
            wanted
        }
    }
}

/// Container-level switches.
#[derive(Debug, Clone)]
pub struct BloscpackArgs {
    pub offsets: bool,
    pub checksum: Checksum,
    pub max_app_chunks: AppendCapacity,
}

impl Default for BloscpackArgs {
    fn default() -> Self {
        Self {
            offsets: DEFAULT_OFFSETS,
            checksum: DEFAULT_CHECKSUM,
            max_app_chunks: AppendCapacity::default(),
        }
    }
}

/// Size of the reserved metadata slot.
#[derive(Debug, Clone, Copy)]
pub enum MaxMetaSize {
    Fixed(u32),
    /// Computed from the serialized (uncompressed) metadata length.
    Computed(fn(u64) -> u64),
}

impl Default for MaxMetaSize {
    fn default() -> Self {
        MaxMetaSize::Computed(|meta_size| meta_size.saturating_mul(10))
    }
}

impl MaxMetaSize {
    pub fn resolve(&self, meta_size: u64) -> Result<u32> {
        let size = match self {
            MaxMetaSize::Fixed(n) => *n as u64,
            MaxMetaSize::Computed(f) => f(meta_size),
        };
        if size > MAX_META_SIZE {
            return Err(Error::invalid_argument(
                "max_meta_size",
                format!("{size} exceeds the maximum of {MAX_META_SIZE}"),
            ));
        }
        Ok(size as u32)
    }
}

/// How the metadata section is serialized, compressed and protected.
#[derive(Debug, Clone)]
pub struct MetadataArgs {
    pub serializer: Serializer,
    pub checksum: Checksum,
    pub codec: MetaCodec,
    pub level: u8,
    pub max_meta_size: MaxMetaSize,
}

impl Default for MetadataArgs {
    fn default() -> Self {
        Self {
            serializer: Serializer::Json,
            checksum: DEFAULT_META_CHECKSUM,
            codec: DEFAULT_META_CODEC,
            level: DEFAULT_META_LEVEL,
            max_meta_size: MaxMetaSize::default(),
        }
    }
}

impl MetadataArgs {
    pub fn validate(&self) -> Result<()> {
        if self.level > MAX_CLEVEL {
            return Err(Error::invalid_argument(
                "meta_level",
                format!("{} is above the maximum of {MAX_CLEVEL}", self.level),
            ));
        }
        Ok(())
    }
}

/// Execution knobs that do not affect the bytes written.
#[derive(Debug, Clone)]
pub struct PackOptions {
    /// Chunks compressed or decompressed concurrently; 1 runs inline.
    pub threads: usize,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self { threads: 1 }
    }
}
