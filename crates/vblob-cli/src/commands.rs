use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context};
use colored::Colorize;
use serde::Serialize;
use tracing::{debug, info};
use vblob_archive::{
    ChunkedDecompressor, SeekTableEntry, SeekableDecompressor, StreamingCompressor, MAX_CHUNK_SIZE,
};
use vblob_crypto::{ContentVerifier, MerkleTree};
use vblob_loader::LoaderConfig;
use vblob_types::Digest;

use crate::cli::*;

const READ_CHUNK: usize = 64 * 1024;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => LoaderConfig::load(path)?,
        None => LoaderConfig::default(),
    };
    match cli.command {
        Command::Compress(args) => cmd_compress(args, &config),
        Command::Decompress(args) => cmd_decompress(args),
        Command::Inspect(args) => cmd_inspect(args, cli.format),
        Command::Digest(args) => cmd_digest(args, cli.format),
        Command::Verify(args) => cmd_verify(args),
    }
}

fn read_file(path: &Path) -> anyhow::Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn write_file(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}

fn cmd_compress(args: CompressArgs, config: &LoaderConfig) -> anyhow::Result<()> {
    let level = args.level.unwrap_or(config.compression_level);
    let mut input = File::open(&args.input)
        .with_context(|| format!("failed to open {}", args.input.display()))?;
    let size = input.metadata()?.len();

    let limit = StreamingCompressor::with_level(level).compute_output_limit(size)?;
    let mut out = vec![0u8; usize::try_from(limit).context("input too large")?];
    let written = {
        let mut compressor = StreamingCompressor::with_level(level);
        compressor.set_progress_callback(Box::new(|read, total, written| {
            debug!(read, total, written, "frame compressed");
        }));
        compressor.init(size, &mut out)?;
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = input.read(&mut buf)?;
            if n == 0 {
                break;
            }
            compressor.update(&buf[..n])?;
        }
        compressor.finalize()?
    };
    out.truncate(written as usize);
    write_file(&args.output, &out)?;

    info!(input = size, output = written, level, "archive written");
    let ratio = if size == 0 {
        1.0
    } else {
        written as f64 / size as f64
    };
    println!(
        "{} {} → {} ({} → {} bytes, {:.1}%)",
        "✓".green().bold(),
        args.input.display(),
        args.output.display().to_string().bold(),
        size,
        written,
        ratio * 100.0
    );
    Ok(())
}

/// Zeroed output buffer of `length` bytes.
///
/// The seek table is untrusted, so frames larger than the compressor ever
/// writes are refused and the allocation itself may fail without aborting.
fn output_buffer(decompressor: &ChunkedDecompressor, length: u64) -> anyhow::Result<Vec<u8>> {
    if let Some(entry) = decompressor
        .header()
        .entries()
        .iter()
        .find(|e| e.decompressed_length > MAX_CHUNK_SIZE as u64)
    {
        bail!(
            "frame at offset {} claims {} bytes, more than the {MAX_CHUNK_SIZE}-byte chunk limit",
            entry.decompressed_offset,
            entry.decompressed_length
        );
    }
    let len = usize::try_from(length).context("output too large")?;
    let mut out = Vec::new();
    out.try_reserve_exact(len)
        .with_context(|| format!("cannot allocate {len} bytes of output"))?;
    out.resize(len, 0);
    Ok(out)
}

/// Fill `out` with the bytes starting at `offset`, touching only the frames
/// that cover them.
fn extract_range(
    decompressor: &ChunkedDecompressor,
    src: &[u8],
    offset: u64,
    out: &mut [u8],
) -> anyhow::Result<()> {
    let mut frame = Vec::new();
    let mut done = 0usize;
    while done < out.len() {
        let pos = offset + done as u64;
        let mapping = decompressor.mapping_for_decompressed_address(pos)?;
        frame.resize(mapping.decompressed_length as usize, 0);
        let n = decompressor.decompress_range(&mut frame, src, pos)?;
        let skip = (pos - mapping.decompressed_offset) as usize;
        let take = (out.len() - done).min(n - skip);
        out[done..done + take].copy_from_slice(&frame[skip..skip + take]);
        done += take;
    }
    Ok(())
}

fn cmd_decompress(args: DecompressArgs) -> anyhow::Result<()> {
    let src = read_file(&args.input)?;
    let decompressor = ChunkedDecompressor::new(&src)?;
    let total = decompressor.decompressed_size();
    if args.offset > total {
        bail!("offset {} is past the end of the data ({total} bytes)", args.offset);
    }
    let length = args.length.unwrap_or(total - args.offset);
    if length > total - args.offset {
        bail!(
            "range {}..{} is past the end of the data ({total} bytes)",
            args.offset,
            args.offset.saturating_add(length)
        );
    }

    let mut out = output_buffer(&decompressor, length)?;
    if args.offset == 0 && length == total {
        decompressor.decompress_full(&mut out, &src)?;
    } else {
        extract_range(&decompressor, &src, args.offset, &mut out)?;
    }
    write_file(&args.output, &out)?;
    println!(
        "{} {} bytes from offset {} → {}",
        "✓".green().bold(),
        out.len(),
        args.offset,
        args.output.display().to_string().bold()
    );
    Ok(())
}

#[derive(Serialize)]
struct InspectReport<'a> {
    header_size: u64,
    compressed_size: u64,
    decompressed_size: u64,
    frames: &'a [SeekTableEntry],
}

fn cmd_inspect(args: InspectArgs, format: OutputFormat) -> anyhow::Result<()> {
    let src = read_file(&args.archive)?;
    let decompressor = ChunkedDecompressor::new(&src)?;
    let header = decompressor.header();
    if (src.len() as u64) < header.compressed_size() {
        bail!(
            "archive is truncated: {} bytes, seek table needs {}",
            src.len(),
            header.compressed_size()
        );
    }

    if format == OutputFormat::Json {
        let report = InspectReport {
            header_size: header.size(),
            compressed_size: header.compressed_size(),
            decompressed_size: header.decompressed_size(),
            frames: header.entries(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{}", args.archive.display().to_string().bold());
    println!("  Frames: {}", header.frame_count().to_string().cyan());
    println!("  Header: {} bytes", header.size());
    println!(
        "  Size: {} compressed, {} decompressed",
        header.compressed_size(),
        header.decompressed_size()
    );
    for (i, entry) in header.entries().iter().enumerate() {
        println!(
            "  {:>5}  {:>12} +{:<9} ← {:>12} +{}",
            format!("#{i}").yellow(),
            entry.decompressed_offset,
            entry.decompressed_length,
            entry.compressed_offset,
            entry.compressed_length
        );
    }
    Ok(())
}

fn cmd_digest(args: DigestArgs, format: OutputFormat) -> anyhow::Result<()> {
    let data = read_file(&args.file)?;
    let tree = MerkleTree::from_data(&data);
    if let Some(path) = &args.tree {
        write_file(path, tree.as_bytes())?;
    }

    if format == OutputFormat::Json {
        let report = serde_json::json!({
            "root": tree.root().to_hex(),
            "size": tree.data_size(),
            "tree_blocks": tree.block_count(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}  {}", tree.root().to_hex().cyan(), args.file.display());
        println!("  Size: {} bytes, tree: {} blocks", tree.data_size(), tree.block_count());
    }
    Ok(())
}

fn cmd_verify(args: VerifyArgs) -> anyhow::Result<()> {
    let root = Digest::from_hex(args.root.trim()).context("invalid root")?;
    let data = read_file(&args.file)?;
    let tree = read_file(&args.tree)?;

    let verifier = ContentVerifier::create(root, &tree, data.len() as u64)
        .context("merkle tree does not match root")?;
    verifier
        .verify(&data)
        .with_context(|| format!("{} does not match its tree", args.file.display()))?;

    println!(
        "{} {} matches {}",
        "✓".green().bold(),
        args.file.display(),
        root.short_hex().cyan()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8 ^ (i >> 13) as u8).collect()
    }

    fn file(dir: &TempDir, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn compress_then_decompress() {
        let dir = TempDir::new().unwrap();
        let data = sample(300_000);
        let input = file(&dir, "in", &data);
        let archive = dir.path().join("in.vbz");
        let output = dir.path().join("out");

        cmd_compress(
            CompressArgs {
                input,
                output: archive.clone(),
                level: Some(1),
            },
            &LoaderConfig::default(),
        )
        .unwrap();
        cmd_decompress(DecompressArgs {
            input: archive.clone(),
            output: output.clone(),
            offset: 0,
            length: None,
        })
        .unwrap();
        assert_eq!(fs::read(&output).unwrap(), data);

        cmd_inspect(InspectArgs { archive }, OutputFormat::Json).unwrap();
    }

    #[test]
    fn decompress_range_spanning_frames() {
        let dir = TempDir::new().unwrap();
        let data = sample(400_000);
        let archive = file(&dir, "a.vbz", &vblob_archive::compress_bytes(&data, 3).unwrap());
        let output = dir.path().join("slice");

        cmd_decompress(DecompressArgs {
            input: archive.clone(),
            output: output.clone(),
            offset: 130_000,
            length: Some(10_000),
        })
        .unwrap();
        assert_eq!(fs::read(&output).unwrap(), &data[130_000..140_000]);

        let past_end = cmd_decompress(DecompressArgs {
            input: archive,
            output,
            offset: 399_000,
            length: Some(5_000),
        });
        assert!(past_end.is_err());
    }

    #[test]
    fn digest_then_verify() {
        let dir = TempDir::new().unwrap();
        let data = sample(50_000);
        let input = file(&dir, "blob", &data);
        let tree_path = dir.path().join("blob.tree");
        cmd_digest(
            DigestArgs {
                file: input.clone(),
                tree: Some(tree_path.clone()),
            },
            OutputFormat::Text,
        )
        .unwrap();

        let root = MerkleTree::from_data(&data).root().to_hex();
        cmd_verify(VerifyArgs {
            file: input.clone(),
            tree: tree_path.clone(),
            root: root.clone(),
        })
        .unwrap();

        let mut tampered = data.clone();
        tampered[40_000] ^= 1;
        fs::write(&input, &tampered).unwrap();
        assert!(cmd_verify(VerifyArgs {
            file: input,
            tree: tree_path,
            root,
        })
        .is_err());
    }

    #[test]
    fn oversized_frame_claim_is_refused() {
        let header = vblob_archive::ArchiveHeader::new(vec![SeekTableEntry {
            decompressed_offset: 0,
            decompressed_length: 1 << 62,
            compressed_offset: vblob_archive::header_size(1),
            compressed_length: 1,
        }]);
        let mut bytes = vec![0u8; header.size() as usize + 1];
        header.write_to(&mut bytes).unwrap();

        let dir = TempDir::new().unwrap();
        let archive = file(&dir, "huge.vbz", &bytes);
        for (offset, length) in [(0, None), (5, Some(10))] {
            let result = cmd_decompress(DecompressArgs {
                input: archive.clone(),
                output: dir.path().join("out"),
                offset,
                length,
            });
            assert!(result.is_err());
        }
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn inspect_rejects_non_archive() {
        let dir = TempDir::new().unwrap();
        let path = file(&dir, "junk", &[7u8; 64]);
        assert!(cmd_inspect(InspectArgs { archive: path }, OutputFormat::Text).is_err());
    }
}
