use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{Error, Result};

/// Digest algorithms that can protect chunks and metadata sections.
///
/// The discriminant is the on-disk checksum id, so the declaration order is
/// part of the file format. New algorithms go at the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Checksum {
    None = 0,
    Adler32 = 1,
    Crc32 = 2,
    Md5 = 3,
    Sha1 = 4,
    Sha224 = 5,
    Sha256 = 6,
    Sha384 = 7,
    Sha512 = 8,
    Xxh3 = 9,
}

impl Checksum {
    /// Every registered checksum, indexed by its on-disk id.
    pub const ALL: [Checksum; 10] = [
        Checksum::None,
        Checksum::Adler32,
        Checksum::Crc32,
        Checksum::Md5,
        Checksum::Sha1,
        Checksum::Sha224,
        Checksum::Sha256,
        Checksum::Sha384,
        Checksum::Sha512,
        Checksum::Xxh3,
    ];

    pub fn from_name(name: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::NoSuchChecksum(name.to_string()))
    }

    pub fn from_id(id: u8) -> Result<Self> {
        Self::ALL
            .get(id as usize)
            .copied()
            .ok_or_else(|| Error::NoSuchChecksum(format!("id {id}")))
    }

    #[inline]
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Checksum::None => "none",
            Checksum::Adler32 => "adler32",
            Checksum::Crc32 => "crc32",
            Checksum::Md5 => "md5",
            Checksum::Sha1 => "sha1",
            Checksum::Sha224 => "sha224",
            Checksum::Sha256 => "sha256",
            Checksum::Sha384 => "sha384",
            Checksum::Sha512 => "sha512",
            Checksum::Xxh3 => "xxh3",
        }
    }

    /// Number of digest bytes appended after each protected section.
    pub fn size(self) -> usize {
        match self {
            Checksum::None => 0,
            Checksum::Adler32 | Checksum::Crc32 => 4,
            Checksum::Md5 => 16,
            Checksum::Sha1 => 20,
            Checksum::Sha224 => 28,
            Checksum::Sha256 => 32,
            Checksum::Sha384 => 48,
            Checksum::Sha512 => 64,
            Checksum::Xxh3 => 8,
        }
    }

    /// Compute the digest of `data`; always exactly [`Checksum::size`] bytes.
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            Checksum::None => Vec::new(),
            Checksum::Adler32 => adler2::adler32_slice(data).to_le_bytes().to_vec(),
            Checksum::Crc32 => crc32fast::hash(data).to_le_bytes().to_vec(),
            Checksum::Md5 => Md5::digest(data).to_vec(),
            Checksum::Sha1 => Sha1::digest(data).to_vec(),
            Checksum::Sha224 => Sha224::digest(data).to_vec(),
            Checksum::Sha256 => Sha256::digest(data).to_vec(),
            Checksum::Sha384 => Sha384::digest(data).to_vec(),
            Checksum::Sha512 => Sha512::digest(data).to_vec(),
            Checksum::Xxh3 => xxh3_64(data).to_le_bytes().to_vec(),
        }
    }

    /// Recompute the digest of `data` and compare it with `expected`.
    pub fn verify(self, data: &[u8], expected: &[u8], what: impl FnOnce() -> String) -> Result<()> {
        let computed = self.digest(data);
        if computed != expected {
            return Err(Error::ChecksumMismatch {
                what: what(),
                expected: hex(expected),
                computed: hex(&computed),
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Checksum {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s)
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
