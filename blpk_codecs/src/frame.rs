use blpk_core::format::{ChunkSubHeader, SUBHEADER_SIZE};
use blpk_core::{BlockCodec, BloscArgs, Cname, Error, Result};
use log::trace;

use crate::passthrough::{frame_len, store};
use crate::shuffle::{shuffle, unshuffle};
use crate::{backend_for, Backend};

/// Sub-header format version written by this codec.
pub const SUBHEADER_VERSION: u8 = 2;

/// The bundled [`BlockCodec`]: byte shuffle, then lz4, lz4hc, zlib or zstd.
///
/// Stateless; one instance can be shared by every worker thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct BloscCodec;

impl BloscCodec {
    pub fn new() -> Self {
        Self
    }
}

impl BlockCodec for BloscCodec {
    fn compress(&self, raw: &[u8], args: &BloscArgs) -> Result<Vec<u8>> {
        args.validate()?;
        let nbytes = frame_len(raw.len())?;
        let backend = backend_for(args.cname);
        let format = args.cname.format_id();

        if raw.is_empty() || args.clevel == 0 {
            return store(raw, args.typesize, format, backend.version());
        }

        let byte_shuffle = args.shuffle && args.typesize > 1;
        let payload = if byte_shuffle {
            backend.compress(&shuffle(raw, args.typesize as usize), args.clevel)?
        } else {
            backend.compress(raw, args.clevel)?
        };
        if payload.len() >= raw.len() {
            trace!("{} did not shrink {} bytes, storing", args.cname, raw.len());
            return store(raw, args.typesize, format, backend.version());
        }

        let header = ChunkSubHeader {
            version: SUBHEADER_VERSION,
            versionlz: backend.version(),
            flags: ChunkSubHeader::pack_flags(byte_shuffle, false, false, false, format),
            typesize: args.typesize,
            nbytes,
            blocksize: nbytes,
            ctbytes: SUBHEADER_SIZE as u32 + payload.len() as u32,
        };
        let mut out = Vec::with_capacity(SUBHEADER_SIZE + payload.len());
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    fn decompress(&self, compressed: &[u8]) -> Result<Vec<u8>> {
        let header = ChunkSubHeader::decode(compressed)?;
        let ctbytes = header.ctbytes as usize;
        if compressed.len() < ctbytes {
            return Err(Error::InvalidSubHeader {
                reason: format!("ctbytes {ctbytes} exceeds the {} bytes available", compressed.len()),
            });
        }
        let payload = &compressed[SUBHEADER_SIZE..ctbytes];
        let nbytes = header.nbytes as usize;

        if header.pure_memcpy() {
            if payload.len() != nbytes {
                return Err(Error::InvalidSubHeader {
                    reason: format!("stored chunk holds {} bytes, nbytes is {nbytes}", payload.len()),
                });
            }
            return Ok(payload.to_vec());
        }
        if header.bit_shuffle() {
            return Err(Error::Codec("bit-shuffled chunks are not supported".into()));
        }
        let cname = header.cname().ok_or_else(|| {
            Error::Codec(format!("unsupported compressor format {}", header.codec_format()))
        })?;

        let raw = decompress_with(backend_for(cname), cname, payload, nbytes)?;
        if header.byte_shuffle() {
            Ok(unshuffle(&raw, header.typesize as usize))
        } else {
            Ok(raw)
        }
    }
}

fn decompress_with(backend: &dyn Backend, cname: Cname, payload: &[u8], nbytes: usize) -> Result<Vec<u8>> {
    let raw = backend.decompress(payload, nbytes)?;
    if raw.len() != nbytes {
        return Err(Error::Codec(format!(
            "{cname} produced {} bytes, sub-header promised {nbytes}",
            raw.len()
        )));
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(cname: Cname) -> BloscArgs {
        BloscArgs {
            cname,
            ..BloscArgs::default()
        }
    }

    fn ramp(n: usize) -> Vec<u8> {
        (0..n as u64).flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn roundtrip_all_compressors() {
        let raw = ramp(4096);
        for cname in Cname::ALL {
            let compressed = BloscCodec.compress(&raw, &args(cname)).unwrap();
            assert!(compressed.len() < raw.len(), "{cname} did not compress");
            let header = BloscCodec.subheader(&compressed).unwrap();
            assert_eq!(header.ctbytes as usize, compressed.len());
            assert_eq!(header.nbytes as usize, raw.len());
            assert_eq!(header.typesize, 8);
            assert!(header.byte_shuffle());
            assert!(!header.pure_memcpy());
            assert_eq!(header.codec_format(), cname.format_id());
            assert_eq!(BloscCodec.decompress(&compressed).unwrap(), raw, "{cname}");
        }
    }

    #[test]
    fn empty_chunk_is_header_only() {
        let compressed = BloscCodec.compress(&[], &BloscArgs::default()).unwrap();
        assert_eq!(compressed.len(), SUBHEADER_SIZE);
        assert!(BloscCodec.subheader(&compressed).unwrap().pure_memcpy());
        assert!(BloscCodec.decompress(&compressed).unwrap().is_empty());
    }

    #[test]
    fn level_zero_stores_verbatim() {
        let raw = ramp(64);
        let a = BloscArgs {
            clevel: 0,
            ..BloscArgs::default()
        };
        let compressed = BloscCodec.compress(&raw, &a).unwrap();
        assert_eq!(&compressed[SUBHEADER_SIZE..], &raw[..]);
        assert_eq!(BloscCodec.decompress(&compressed).unwrap(), raw);
    }

    #[test]
    fn incompressible_data_is_stored() {
        let mut state = 0x2545_f491u32;
        let raw: Vec<u8> = (0..512)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 24) as u8
            })
            .collect();
        let compressed = BloscCodec.compress(&raw, &args(Cname::Lz4)).unwrap();
        let header = BloscCodec.subheader(&compressed).unwrap();
        assert!(header.pure_memcpy());
        assert!(!header.byte_shuffle());
        assert_eq!(compressed.len(), SUBHEADER_SIZE + raw.len());
        assert_eq!(BloscCodec.decompress(&compressed).unwrap(), raw);
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        let compressed = BloscCodec.compress(&ramp(1024), &BloscArgs::default()).unwrap();
        let cut = &compressed[..compressed.len() - 1];
        assert!(matches!(BloscCodec.decompress(cut), Err(Error::InvalidSubHeader { .. })));
        assert!(BloscCodec.decompress(&compressed[..8]).is_err());
    }

    #[test]
    fn without_shuffle_flag_is_clear() {
        let a = BloscArgs {
            shuffle: false,
            ..BloscArgs::default()
        };
        let raw = ramp(1024);
        let compressed = BloscCodec.compress(&raw, &a).unwrap();
        assert!(!BloscCodec.subheader(&compressed).unwrap().byte_shuffle());
        assert_eq!(BloscCodec.decompress(&compressed).unwrap(), raw);
    }
}
