use blpk_core::{Error, Result};

/// Zstandard block backend.
///
/// The 0..=9 level scale is stretched onto zstd's 1..=19 so that the
/// highest level picks a slow, strong setting.
pub(crate) struct ZstdBackend;

fn zstd_level(clevel: u8) -> i32 {
    (clevel as i32 * 2).clamp(1, 19)
}

impl crate::Backend for ZstdBackend {
    fn version(&self) -> u8 {
        1
    }

    fn compress(&self, raw: &[u8], clevel: u8) -> Result<Vec<u8>> {
        zstd::bulk::compress(raw, zstd_level(clevel)).map_err(|e| Error::Codec(format!("zstd compress error: {e}")))
    }

    fn decompress(&self, compressed: &[u8], nbytes: usize) -> Result<Vec<u8>> {
        zstd::bulk::decompress(compressed, nbytes).map_err(|e| Error::Codec(format!("zstd decompress error: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_mapping() {
        assert_eq!(zstd_level(1), 2);
        assert_eq!(zstd_level(9), 18);
        assert_eq!(zstd_level(0), 1);
    }
}
