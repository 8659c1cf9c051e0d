use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "vblob",
    about = "Seekable archives and Merkle trees for verified blobs",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Loader configuration file (TOML)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Compress a file into a seekable archive
    Compress(CompressArgs),
    /// Decompress an archive, whole or from an offset
    Decompress(DecompressArgs),
    /// Show an archive's seek table
    Inspect(InspectArgs),
    /// Compute a file's Merkle root
    Digest(DigestArgs),
    /// Verify a file against a stored tree and root
    Verify(VerifyArgs),
}

#[derive(Args)]
pub struct CompressArgs {
    pub input: PathBuf,
    pub output: PathBuf,
    /// zstd level; defaults to the configured level
    #[arg(short, long)]
    pub level: Option<i32>,
}

#[derive(Args)]
pub struct DecompressArgs {
    pub input: PathBuf,
    pub output: PathBuf,
    /// First decompressed byte to write
    #[arg(long, default_value = "0")]
    pub offset: u64,
    /// Number of bytes to write; defaults to the rest of the archive
    #[arg(long)]
    pub length: Option<u64>,
}

#[derive(Args)]
pub struct InspectArgs {
    pub archive: PathBuf,
}

#[derive(Args)]
pub struct DigestArgs {
    pub file: PathBuf,
    /// Write the serialized Merkle tree here
    #[arg(long)]
    pub tree: Option<PathBuf>,
}

#[derive(Args)]
pub struct VerifyArgs {
    pub file: PathBuf,
    /// Serialized Merkle tree produced by `digest --tree`
    #[arg(long)]
    pub tree: PathBuf,
    /// Expected root, hex encoded
    #[arg(long)]
    pub root: String,
}
