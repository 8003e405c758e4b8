use blpk_core::format::{ChunkSubHeader, SUBHEADER_SIZE};
use blpk_core::{Error, Result};

/// Frame `raw` verbatim behind a sub-header flagged `pure_memcpy`.
///
/// Used for empty chunks, level 0, and data the backend could not shrink
/// (already-compressed media, high-entropy input).
pub(crate) fn store(raw: &[u8], typesize: u8, codec_format: u8, version: u8) -> Result<Vec<u8>> {
    let nbytes = frame_len(raw.len())?;
    let header = ChunkSubHeader {
        version: crate::SUBHEADER_VERSION,
        versionlz: version,
        flags: ChunkSubHeader::pack_flags(false, true, false, false, codec_format),
        typesize,
        nbytes,
        blocksize: nbytes,
        ctbytes: nbytes + SUBHEADER_SIZE as u32,
    };
    let mut out = Vec::with_capacity(SUBHEADER_SIZE + raw.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(raw);
    Ok(out)
}

/// Check that a payload of `len` bytes still fits a sub-header-framed chunk.
pub(crate) fn frame_len(len: usize) -> Result<u32> {
    u32::try_from(len)
        .ok()
        .filter(|n| *n as u64 + SUBHEADER_SIZE as u64 <= i32::MAX as u64)
        .ok_or_else(|| Error::Codec(format!("buffer of {len} bytes exceeds the codec limit")))
}
