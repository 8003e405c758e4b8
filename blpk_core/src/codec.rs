use crate::args::BloscArgs;
use crate::error::{Error, Result};
use crate::format::ChunkSubHeader;

/// Compressors the block codec can be asked to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cname {
    Lz4,
    Lz4hc,
    Zlib,
    Zstd,
}

impl Cname {
    pub const ALL: [Cname; 4] = [Cname::Lz4, Cname::Lz4hc, Cname::Zlib, Cname::Zstd];

    pub fn from_name(name: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.name() == name)
            .ok_or_else(|| Error::NoSuchCodec(name.to_string()))
    }

    pub fn name(self) -> &'static str {
        match self {
            Cname::Lz4 => "lz4",
            Cname::Lz4hc => "lz4hc",
            Cname::Zlib => "zlib",
            Cname::Zstd => "zstd",
        }
    }

    /// The 3-bit format id recorded in the chunk sub-header flags.
    ///
    /// Ids 0 (blosclz) and 2 (snappy) belong to compressors this crate does
    /// not ship; lz4 and lz4hc share a stream format.
    pub fn format_id(self) -> u8 {
        match self {
            Cname::Lz4 | Cname::Lz4hc => 1,
            Cname::Zlib => 3,
            Cname::Zstd => 4,
        }
    }

    pub fn from_format_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Cname::Lz4),
            3 => Some(Cname::Zlib),
            4 => Some(Cname::Zstd),
            _ => None,
        }
    }
}

impl std::fmt::Display for Cname {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Cname {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s)
    }
}

/// The block compressor the container frames around.
///
/// Each implementation:
/// - Compresses one chunk at a time; no state may cross chunk boundaries.
/// - Opens every compressed buffer with a [`ChunkSubHeader`] whose `ctbytes`
///   is the full compressed length, so a reader can walk the file without
///   decompressing anything.
pub trait BlockCodec: Send + Sync {
    /// Compress `raw` with the given typesize, level, shuffle and compressor.
    fn compress(&self, raw: &[u8], args: &BloscArgs) -> Result<Vec<u8>>;

    /// Decompress a buffer produced by [`BlockCodec::compress`], sub-header
    /// included.
    fn decompress(&self, compressed: &[u8]) -> Result<Vec<u8>>;

    /// Decode the sub-header of a compressed buffer without decompressing it.
    fn subheader(&self, compressed: &[u8]) -> Result<ChunkSubHeader> {
        ChunkSubHeader::decode(compressed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_and_format_ids() {
        for c in Cname::ALL {
            assert_eq!(Cname::from_name(c.name()).unwrap(), c);
        }
        assert_eq!(Cname::from_format_id(Cname::Lz4hc.format_id()), Some(Cname::Lz4));
        assert_eq!(Cname::from_format_id(0), None);
        assert!(matches!(Cname::from_name("blosclz"), Err(Error::NoSuchCodec(_))));
    }
}
