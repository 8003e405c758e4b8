use std::io::{Read, Write};

use blpk_core::{Error, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

/// zlib (deflate) block backend. Slow but universally readable.
pub(crate) struct ZlibBackend;

impl crate::Backend for ZlibBackend {
    fn version(&self) -> u8 {
        1
    }

    fn compress(&self, raw: &[u8], clevel: u8) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::new(clevel as u32));
        encoder.write_all(raw)?;
        Ok(encoder.finish()?)
    }

    fn decompress(&self, compressed: &[u8], nbytes: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(nbytes);
        ZlibDecoder::new(compressed)
            .read_to_end(&mut out)
            .map_err(|e| Error::Codec(format!("zlib decompress error: {e}")))?;
        Ok(out)
    }
}
