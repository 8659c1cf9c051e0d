//! Seekable chunked compression for vblob objects.
//!
//! An archive is a small header with a seek table followed by independent
//! zstd frames, one per fixed-size chunk of the input. Because frames are
//! independent, any decompressed range can be produced by inflating only
//! the frames that cover it, which is what lets compressed objects be
//! paged in on demand.
//!
//! # Key Types
//!
//! - [`StreamingCompressor`]: incremental archive producer
//! - [`ChunkedDecompressor`]: full and per-frame archive reader
//! - [`ArchiveHeader`]: parsed header and seek table
//! - [`CompressionMapping`]: frame lookup result for a decompressed offset

pub mod compressor;
pub mod decompressor;
pub mod error;
pub mod format;
pub mod params;

pub use compressor::{compress_bytes, ProgressCallback, StreamingCompressor};
pub use decompressor::{ChunkedDecompressor, SeekableDecompressor};
pub use error::{ArchiveError, ArchiveResult};
pub use format::{
    header_size, ArchiveHeader, CompressionMapping, SeekTableEntry, ARCHIVE_MAGIC,
    HEADER_PREFIX_SIZE, SEEK_TABLE_ENTRY_SIZE,
};
pub use params::{
    chunk_size_for, compute_output_limit, CompressionParams, DEFAULT_LEVEL, MAX_CHUNK_SIZE,
    MIN_CHUNK_SIZE,
};
