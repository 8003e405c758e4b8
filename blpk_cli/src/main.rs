use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::{debug, info};

use blpk_codecs::BloscCodec;
use blpk_core::args::{AppendCapacity, DEFAULT_CLEVEL, DEFAULT_TYPESIZE};
use blpk_core::format::{ChunkSubHeader, EXTENSION, MAX_BUFFER_SIZE, SUBHEADER_SIZE};
use blpk_core::{
    read_container_info, rewrite_metadata_in_file, Appender, BloscArgs, BloscpackArgs, Checksum, Cname, Error,
    Metadata, MetadataOverrides, PackOptions, Packer, Unpacker,
};

// ── CLI definition ─────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "blpk",
    about = "Compress, decompress, append to and inspect Bloscpack containers",
    version
)]
struct Cli {
    /// Log operation summaries
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Log per-chunk detail
    #[arg(long, global = true)]
    debug: bool,
    /// Overwrite existing output files
    #[arg(short, long, global = true)]
    force: bool,
    /// Worker threads used for (de)compression
    #[arg(short, long, global = true, default_value_t = 1)]
    nthreads: usize,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compress a file into a container
    #[command(visible_alias = "c")]
    Compress {
        /// File to compress
        input: PathBuf,
        /// Destination container (default: INPUT.blp)
        output: Option<PathBuf>,
        /// Element size used for shuffling
        #[arg(short, long, default_value_t = DEFAULT_TYPESIZE)]
        typesize: u8,
        /// Compression level, 0 (store) to 9
        #[arg(short, long, default_value_t = DEFAULT_CLEVEL)]
        clevel: u8,
        /// Disable byte shuffling
        #[arg(long)]
        no_shuffle: bool,
        /// Compressor: lz4 | lz4hc | zlib | zstd
        #[arg(long, default_value = "lz4")]
        cname: Cname,
        /// Raw bytes per chunk; accepts K/M/G suffixes or "max"
        #[arg(short = 'z', long, default_value = "1M", value_parser = parse_chunk_size)]
        chunk_size: u64,
        /// Per-chunk checksum: none | adler32 | crc32 | md5 | sha1 | sha224 | sha256 | sha384 | sha512 | xxh3
        #[arg(short = 'k', long, default_value = "adler32")]
        checksum: Checksum,
        /// Do not write an offset table (the container cannot be appended to)
        #[arg(long)]
        no_offsets: bool,
        /// Offset slots reserved for appends (default: 10 per chunk)
        #[arg(long)]
        max_app_chunks: Option<u64>,
        /// JSON file stored as the container's metadata
        #[arg(short, long)]
        metadata: Option<PathBuf>,
    },
    /// Decompress a container back to raw bytes
    #[command(visible_alias = "d")]
    Decompress {
        /// Container to decompress
        input: PathBuf,
        /// Destination file (default: INPUT without .blp)
        output: Option<PathBuf>,
        /// Accept inputs without the .blp extension
        #[arg(short = 'e', long)]
        no_check_extension: bool,
    },
    /// Append a file's bytes to an existing container
    #[command(visible_alias = "a")]
    Append {
        /// Container to extend in place
        original: PathBuf,
        /// File whose bytes are appended
        new: PathBuf,
        /// JSON file replacing the container's metadata afterwards
        #[arg(short, long)]
        metadata: Option<PathBuf>,
    },
    /// Print headers, metadata and offsets of a container
    #[command(visible_alias = "i")]
    Info {
        /// Container to inspect
        file: PathBuf,
    },
}

// ── Helpers ────────────────────────────────────────────────────────────────

/// Parse a chunk size: plain bytes, a `K`/`M`/`G` binary suffix, or `max`.
fn parse_chunk_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("max") {
        return Ok(MAX_BUFFER_SIZE);
    }
    let (digits, shift) = match s.chars().last().map(|c| c.to_ascii_uppercase()) {
        Some('K') => (&s[..s.len() - 1], 10),
        Some('M') => (&s[..s.len() - 1], 20),
        Some('G') => (&s[..s.len() - 1], 30),
        _ => (s, 0),
    };
    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid chunk size '{s}', expected e.g. 512K, 1M or max"))?;
    let bytes = value
        .checked_mul(1u64 << shift)
        .filter(|b| *b > 0 && *b <= MAX_BUFFER_SIZE)
        .ok_or_else(|| format!("chunk size '{s}' out of range 1..={MAX_BUFFER_SIZE}"))?;
    Ok(bytes)
}

fn human_bytes(n: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut v = n as f64;
    let mut unit = 0;
    while v >= 1024.0 && unit < UNITS.len() - 1 {
        v /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", n)
    } else {
        format!("{:.2} {}", v, UNITS[unit])
    }
}

fn compressed_name(input: &Path) -> PathBuf {
    let mut name = input.as_os_str().to_owned();
    name.push(".");
    name.push(EXTENSION);
    PathBuf::from(name)
}

fn decompressed_name(input: &Path, check_extension: bool) -> anyhow::Result<Option<PathBuf>> {
    let has_extension = input.extension().is_some_and(|e| e == EXTENSION);
    if check_extension && !has_extension {
        bail!("{input:?} does not end in .{EXTENSION} (use --no-check-extension to override)");
    }
    Ok(has_extension.then(|| input.with_extension("")))
}

fn check_output(output: &Path, force: bool) -> anyhow::Result<()> {
    if output.exists() && !force {
        bail!("output file {output:?} exists (use --force to overwrite)");
    }
    Ok(())
}

fn check_input(input: &Path) -> anyhow::Result<()> {
    if !input.is_file() {
        bail!("input file {input:?} does not exist");
    }
    Ok(())
}

fn load_metadata(path: &Path) -> anyhow::Result<Metadata> {
    let raw = std::fs::read(path).with_context(|| format!("reading metadata file {path:?}"))?;
    serde_json::from_slice(&raw).with_context(|| format!("parsing metadata file {path:?} as JSON"))
}

fn init_logging(cli: &Cli) {
    let level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

// ── Subcommand implementations ─────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
fn run_compress(
    input: PathBuf,
    output: Option<PathBuf>,
    blosc_args: BloscArgs,
    bloscpack_args: BloscpackArgs,
    chunk_size: u64,
    metadata: Option<PathBuf>,
    options: PackOptions,
    force: bool,
) -> anyhow::Result<()> {
    check_input(&input)?;
    let output = output.unwrap_or_else(|| compressed_name(&input));
    check_output(&output, force)?;
    let metadata = metadata.as_deref().map(load_metadata).transpose()?;
    debug!("compressing {input:?} -> {output:?} with {blosc_args:?}, {bloscpack_args:?}");

    let codec = BloscCodec::new();
    let t0 = Instant::now();
    let header = Packer::new(&codec)
        .blosc_args(blosc_args)
        .bloscpack_args(bloscpack_args)
        .options(options)
        .pack_file_to_file(&input, &output, chunk_size, metadata.as_ref())
        .with_context(|| format!("compressing {input:?} into {output:?}"))?;
    let elapsed = t0.elapsed();

    let raw_size = std::fs::metadata(&input)?.len();
    let compressed_size = std::fs::metadata(&output)?.len();
    info!(
        "{} chunk(s), {} -> {} ({:.2}x) in {:.3}s",
        header.nchunks.unwrap_or(0),
        human_bytes(raw_size),
        human_bytes(compressed_size),
        raw_size as f64 / compressed_size.max(1) as f64,
        elapsed.as_secs_f64()
    );
    Ok(())
}

fn run_decompress(
    input: PathBuf,
    output: Option<PathBuf>,
    no_check_extension: bool,
    options: PackOptions,
    force: bool,
) -> anyhow::Result<()> {
    check_input(&input)?;
    let derived = decompressed_name(&input, !no_check_extension)?;
    let output = match output.or(derived) {
        Some(output) => output,
        None => bail!("cannot derive an output name from {input:?}, pass one explicitly"),
    };
    check_output(&output, force)?;

    let codec = BloscCodec::new();
    let t0 = Instant::now();
    Unpacker::new(&codec)
        .options(options)
        .unpack_file_to_file(&input, &output)
        .with_context(|| format!("decompressing {input:?} into {output:?}"))?;
    let raw_size = std::fs::metadata(&output)?.len();
    info!(
        "{} written to {output:?} in {:.3}s",
        human_bytes(raw_size),
        t0.elapsed().as_secs_f64()
    );
    Ok(())
}

fn run_append(original: PathBuf, new: PathBuf, metadata: Option<PathBuf>, options: PackOptions) -> anyhow::Result<()> {
    check_input(&original)?;
    check_input(&new)?;
    let metadata = metadata.as_deref().map(load_metadata).transpose()?;

    let codec = BloscCodec::new();
    let added = Appender::new(&codec)
        .options(options)
        .append_to_file(&original, &new)
        .with_context(|| format!("appending {new:?} to {original:?}"))?;
    info!("appended {new:?} to {original:?}, {added} new chunk(s)");

    if let Some(metadata) = metadata {
        match rewrite_metadata_in_file(&original, &metadata, &MetadataOverrides::default()) {
            Ok(written) => info!("rewrote metadata ({written} bytes)"),
            Err(Error::NoChangeInMetadata) => info!("metadata unchanged, not rewritten"),
            Err(e) => return Err(e).with_context(|| format!("rewriting metadata of {original:?}")),
        }
    }
    Ok(())
}

fn run_info(file: PathBuf) -> anyhow::Result<()> {
    check_input(&file)?;
    let mut reader = BufReader::new(File::open(&file).with_context(|| format!("opening {file:?}"))?);
    let info = read_container_info(&mut reader).with_context(|| format!("reading {file:?}"))?;
    let header = &info.header;
    let opt = |v: Option<u64>| v.map_or_else(|| "unknown".to_string(), |v| v.to_string());

    println!("=== Bloscpack container: {:?} ===", file);
    println!();
    println!("  format version : {}", header.format_version);
    println!("  offsets        : {}", header.offsets);
    println!("  metadata       : {}", header.metadata);
    println!("  checksum       : {}", header.checksum);
    println!(
        "  typesize       : {}",
        header.typesize.map_or_else(|| "non-uniform".to_string(), |t| t.to_string())
    );
    println!("  chunk size     : {}", opt(header.chunk_size.map(u64::from)));
    println!("  last chunk     : {}", opt(header.last_chunk.map(u64::from)));
    println!("  nchunks        : {}", opt(header.nchunks));
    println!("  max app chunks : {}", header.max_app_chunks);
    println!("  file on disk   : {}", human_bytes(std::fs::metadata(&file)?.len()));

    if let (Some(meta_header), Some(metadata)) = (&info.metadata_header, &info.metadata) {
        println!();
        println!("  metadata serializer : {}", meta_header.serializer.name());
        println!("  metadata checksum   : {}", meta_header.checksum);
        println!("  metadata codec      : {} (level {})", meta_header.codec.name(), meta_header.level);
        println!("  metadata size       : {}", meta_header.meta_size);
        println!("  metadata comp size  : {}", meta_header.meta_comp_size);
        println!("  metadata max size   : {}", meta_header.max_meta_size);
        println!("  metadata value      : {}", serde_json::to_string_pretty(metadata)?);
    }

    let first = info.used_offsets().first().map_or(info.chunks_pos(), |o| *o as u64);
    reader.seek(SeekFrom::Start(first))?;
    let mut buf = [0u8; SUBHEADER_SIZE];
    if reader.read_exact(&mut buf).is_ok() {
        let sub = ChunkSubHeader::decode(&buf)?;
        println!();
        println!("  first chunk:");
        println!("    version      : {} (lz {})", sub.version, sub.versionlz);
        println!(
            "    compressor   : {}",
            sub.cname().map_or_else(|| format!("format {}", sub.codec_format()), |c| c.to_string())
        );
        println!("    byte shuffle : {}", sub.byte_shuffle());
        println!("    bit shuffle  : {}", sub.bit_shuffle());
        println!("    pure memcpy  : {}", sub.pure_memcpy());
        println!("    typesize     : {}", sub.typesize);
        println!("    nbytes       : {}", sub.nbytes);
        println!("    blocksize    : {}", sub.blocksize);
        println!("    ctbytes      : {}", sub.ctbytes);
    }

    if header.offsets {
        let used = info.used_offsets();
        println!();
        println!("  offsets: {} used, {} reserved", used.len(), info.offsets.len() - used.len());
        for (i, offset) in used.iter().enumerate() {
            println!("    {:>8}  {:>14}", i, offset);
        }
    }
    Ok(())
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let options = PackOptions {
        threads: cli.nthreads.max(1),
    };
    match cli.command {
        Commands::Compress {
            input,
            output,
            typesize,
            clevel,
            no_shuffle,
            cname,
            chunk_size,
            checksum,
            no_offsets,
            max_app_chunks,
            metadata,
        } => {
            let blosc_args = BloscArgs {
                typesize,
                clevel,
                shuffle: !no_shuffle,
                cname,
            };
            let mut bloscpack_args = BloscpackArgs {
                offsets: !no_offsets,
                checksum,
                ..BloscpackArgs::default()
            };
            if let Some(n) = max_app_chunks {
                bloscpack_args.max_app_chunks = AppendCapacity::Fixed(n);
            }
            run_compress(input, output, blosc_args, bloscpack_args, chunk_size, metadata, options, cli.force)
        }
        Commands::Decompress {
            input,
            output,
            no_check_extension,
        } => run_decompress(input, output, no_check_extension, options, cli.force),
        Commands::Append {
            original,
            new,
            metadata,
        } => run_append(original, new, metadata, options),
        Commands::Info { file } => run_info(file),
    }
}

// ── Entry point ────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);
    run(cli)
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    fn run_args(args: &[&str]) -> anyhow::Result<()> {
        run(Cli::try_parse_from(std::iter::once("blpk").chain(args.iter().copied()))?)
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn chunk_sizes() {
        assert_eq!(parse_chunk_size("4096").unwrap(), 4096);
        assert_eq!(parse_chunk_size("512K").unwrap(), 512 << 10);
        assert_eq!(parse_chunk_size("1m").unwrap(), 1 << 20);
        assert_eq!(parse_chunk_size("1G").unwrap(), 1 << 30);
        assert_eq!(parse_chunk_size("max").unwrap(), MAX_BUFFER_SIZE);
        assert!(parse_chunk_size("0").is_err());
        assert!(parse_chunk_size("2G").is_err());
        assert!(parse_chunk_size("lots").is_err());
    }

    #[test]
    fn output_names() {
        assert_eq!(compressed_name(Path::new("data.bin")), PathBuf::from("data.bin.blp"));
        assert_eq!(
            decompressed_name(Path::new("data.bin.blp"), true).unwrap(),
            Some(PathBuf::from("data.bin"))
        );
        assert!(decompressed_name(Path::new("data.bin"), true).is_err());
        assert_eq!(decompressed_name(Path::new("data.bin"), false).unwrap(), None);
    }

    #[test]
    fn aliases_parse() {
        let cli = Cli::try_parse_from(["blpk", "c", "in", "--cname", "zstd", "-k", "xxh3"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Compress {
                cname: Cname::Zstd,
                checksum: Checksum::Xxh3,
                ..
            }
        ));
        assert!(Cli::try_parse_from(["blpk", "c", "in", "--cname", "snappy"]).is_err());
        assert!(matches!(
            Cli::try_parse_from(["blpk", "i", "x.blp"]).unwrap().command,
            Commands::Info { .. }
        ));
    }

    #[test]
    fn compress_append_decompress() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("data.bin");
        let extra = dir.path().join("extra.bin");
        let meta = dir.path().join("meta.json");
        let packed = dir.path().join("data.bin.blp");
        let restored = dir.path().join("restored.bin");
        let first: Vec<u8> = (0..10_000u32).flat_map(|v| v.to_le_bytes()).collect();
        let second: Vec<u8> = (0..3_000u32).flat_map(|v| (v * 7).to_le_bytes()).collect();
        std::fs::write(&input, &first).unwrap();
        std::fs::write(&extra, &second).unwrap();
        std::fs::write(&meta, br#"{"dtype": "<u4"}"#).unwrap();

        let input_s = input.to_str().unwrap();
        let packed_s = packed.to_str().unwrap();
        run_args(&["compress", input_s, "-z", "8K", "-t", "4", "-m", meta.to_str().unwrap()]).unwrap();
        assert!(packed.exists());
        assert!(run_args(&["compress", input_s]).is_err(), "existing output needs --force");

        run_args(&["append", packed_s, extra.to_str().unwrap(), "-m", meta.to_str().unwrap()]).unwrap();
        run_args(&["info", packed_s]).unwrap();
        run_args(&["d", packed_s, restored.to_str().unwrap()]).unwrap();

        let mut expected = first;
        expected.extend_from_slice(&second);
        assert_eq!(std::fs::read(&restored).unwrap(), expected);
    }

    #[test]
    fn missing_input_and_bad_extension() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.bin");
        assert!(run_args(&["compress", missing.to_str().unwrap()]).is_err());
        let plain = dir.path().join("plain.bin");
        std::fs::write(&plain, b"abc").unwrap();
        assert!(run_args(&["decompress", plain.to_str().unwrap()]).is_err());
    }
}
