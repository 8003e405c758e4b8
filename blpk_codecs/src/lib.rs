//! The block codec bundled with Bloscpack containers.
//!
//! [`BloscCodec`] frames every chunk with the 16-byte sub-header, optionally
//! byte-shuffles it by `typesize`, and hands the result to one of the
//! compressor backends. Chunks that do not shrink are stored verbatim with
//! the `pure_memcpy` flag set.

mod frame;
mod lz4_codec;
mod passthrough;
mod shuffle;
mod zlib_codec;
mod zstd_codec;

pub use frame::{BloscCodec, SUBHEADER_VERSION};
pub use shuffle::{shuffle, unshuffle};

use blpk_core::{Cname, Result};

/// One compressor behind the sub-header.
///
/// Backends see already-shuffled bytes and never write their own framing;
/// the uncompressed length is known from the sub-header on decompress.
pub(crate) trait Backend: Send + Sync {
    /// Format version recorded in the sub-header's `versionlz` byte.
    fn version(&self) -> u8;

    fn compress(&self, raw: &[u8], clevel: u8) -> Result<Vec<u8>>;

    fn decompress(&self, compressed: &[u8], nbytes: usize) -> Result<Vec<u8>>;
}

pub(crate) fn backend_for(cname: Cname) -> &'static dyn Backend {
    match cname {
        Cname::Lz4 => &lz4_codec::Lz4Backend { high: false },
        Cname::Lz4hc => &lz4_codec::Lz4Backend { high: true },
        Cname::Zlib => &zlib_codec::ZlibBackend,
        Cname::Zstd => &zstd_codec::ZstdBackend,
    }
}
