pub mod append;
pub mod args;
pub mod checksum;
pub mod codec;
pub mod error;
pub mod format;
pub mod metadata;
pub mod pack;
pub mod plan;
pub mod sink;
pub mod source;

pub use append::{Appender, ContainerFile};
pub use args::{AppendCapacity, BloscArgs, BloscOverrides, BloscpackArgs, MaxMetaSize, MetadataArgs, PackOptions};
pub use checksum::Checksum;
pub use codec::{BlockCodec, Cname};
pub use error::{Error, ErrorKind, Result};
pub use format::{ChunkSubHeader, ContainerHeader, MetadataHeader, FORMAT_VERSION, MAGIC};
pub use metadata::{
    rewrite_container_metadata, rewrite_metadata_in_file, MetaCodec, Metadata, MetadataOverrides, Serializer,
};
pub use pack::{Packer, Unpacker};
pub use plan::ChunkPlan;
pub use sink::{CompressedFileSink, CompressedSink, CompressedWriterSink, PlainSink};
pub use source::{
    read_container_info, CompressedFileSource, CompressedReaderSource, CompressedSource, ContainerInfo,
    Element, PlainFileSource, PlainReaderSource, PlainSliceSource, PlainSource,
};
