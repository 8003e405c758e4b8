use blpk_core::{Error, Result};
use lz4_flex::block::{compress, decompress};

/// LZ4 block backend.
///
/// Fastest decompression of all bundled backends. `lz4hc` shares the stream
/// format; lz4_flex has no high-compression mode, so both produce the same
/// bytes.
pub(crate) struct Lz4Backend {
    pub high: bool,
}

impl crate::Backend for Lz4Backend {
    fn version(&self) -> u8 {
        1
    }

    fn compress(&self, raw: &[u8], _clevel: u8) -> Result<Vec<u8>> {
        Ok(compress(raw))
    }

    fn decompress(&self, compressed: &[u8], nbytes: usize) -> Result<Vec<u8>> {
        decompress(compressed, nbytes).map_err(|e| {
            let name = if self.high { "lz4hc" } else { "lz4" };
            Error::Codec(format!("{name} decompress error: {e}"))
        })
    }
}
