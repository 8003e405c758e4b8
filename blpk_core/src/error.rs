use thiserror::Error;

/// Coarse classification of [`Error`] variants.
///
/// Format and integrity errors mean the file is foreign or corrupt. Capacity
/// errors are detected before bytes are written, except for the append
/// engine's documented top-up ordering. Configuration errors are raised
/// before any I/O happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Format,
    Integrity,
    Capacity,
    Configuration,
    NoChange,
    Codec,
    Io,
}

#[derive(Error, Debug)]
pub enum Error {
    // ── format ─────────────────────────────────────────────────────────────
    #[error("invalid magic bytes {found:?}, not a bloscpack file")]
    InvalidMagic { found: [u8; 4] },

    #[error("format version mismatch: this engine reads version {expected}, file has {found}")]
    FormatVersionMismatch { expected: u8, found: u8 },

    #[error("{what} must be exactly {expected} bytes, got {found}")]
    BufferLength {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("invalid {what} bitfield {bits:#010b}: unused bits must be zero")]
    InvalidOptions { what: &'static str, bits: u8 },

    #[error("header field '{field}' out of range: {value}")]
    FieldOutOfRange { field: &'static str, value: i64 },

    #[error("invalid chunk sub-header: {reason}")]
    InvalidSubHeader { reason: String },

    // ── integrity ──────────────────────────────────────────────────────────
    #[error("{what} checksum mismatch: expected {expected}, computed {computed}")]
    ChecksumMismatch {
        what: String,
        expected: String,
        computed: String,
    },

    // ── capacity ───────────────────────────────────────────────────────────
    #[error("not enough space: {needed} new chunks required but only {available} reserved")]
    NotEnoughSpace { needed: u64, available: u64 },

    #[error("metadata section too small: payload of {required} bytes does not fit into {max_meta_size}")]
    MetadataSectionTooSmall { required: usize, max_meta_size: u32 },

    #[error("chunk size {chunk_size} out of range (1..={max})")]
    ChunkSizeOutOfRange { chunk_size: u64, max: u64 },

    #[error("{nchunks} chunks exceed the maximum of {max}")]
    TooManyChunks { nchunks: u64, max: u64 },

    // ── configuration ──────────────────────────────────────────────────────
    #[error("no such checksum: '{0}'")]
    NoSuchChecksum(String),

    #[error("no such codec: '{0}'")]
    NoSuchCodec(String),

    #[error("no such serializer: '{0}'")]
    NoSuchSerializer(String),

    #[error("checksum '{new}' ({new_size} bytes) cannot replace '{old}' ({old_size} bytes)")]
    ChecksumLengthMismatch {
        old: &'static str,
        old_size: usize,
        new: &'static str,
        new_size: usize,
    },

    #[error("container typesize is non-uniform; pass an explicit typesize")]
    NonUniformTypesize,

    #[error("container has no offset table; appending requires offsets")]
    NoOffsets,

    #[error("invalid argument '{name}': {reason}")]
    InvalidArgument { name: &'static str, reason: String },

    // ── benign ─────────────────────────────────────────────────────────────
    #[error("new metadata is identical to the stored metadata")]
    NoChangeInMetadata,

    // ── collaborators ──────────────────────────────────────────────────────
    #[error("codec error: {0}")]
    Codec(String),

    #[error("metadata serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidMagic { .. }
            | Error::FormatVersionMismatch { .. }
            | Error::BufferLength { .. }
            | Error::InvalidOptions { .. }
            | Error::FieldOutOfRange { .. }
            | Error::InvalidSubHeader { .. } => ErrorKind::Format,
            Error::ChecksumMismatch { .. } => ErrorKind::Integrity,
            Error::NotEnoughSpace { .. }
            | Error::MetadataSectionTooSmall { .. }
            | Error::ChunkSizeOutOfRange { .. }
            | Error::TooManyChunks { .. } => ErrorKind::Capacity,
            Error::NoSuchChecksum(_)
            | Error::NoSuchCodec(_)
            | Error::NoSuchSerializer(_)
            | Error::ChecksumLengthMismatch { .. }
            | Error::NonUniformTypesize
            | Error::NoOffsets
            | Error::InvalidArgument { .. } => ErrorKind::Configuration,
            Error::NoChangeInMetadata => ErrorKind::NoChange,
            Error::Codec(_) | Error::Serialization(_) => ErrorKind::Codec,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    pub(crate) fn invalid_argument(name: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidArgument {
            name,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
