use thiserror::Error;

/// Errors from producing or consuming a seekable archive.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArchiveError {
    /// The buffer ends before the header or seek table does.
    #[error("archive truncated: header needs {needed} bytes, have {actual}")]
    ArchiveTruncated { needed: u64, actual: u64 },

    /// The header or seek table is internally inconsistent.
    #[error("archive corrupt: {0}")]
    ArchiveCorrupt(String),

    /// An output buffer cannot hold the worst-case result.
    #[error("buffer too small: need {needed} bytes, have {actual}")]
    BufferTooSmall { needed: u64, actual: u64 },

    /// The input is too large to describe in one archive.
    #[error("input of {size} bytes is too large to archive")]
    InputTooLarge { size: u64 },

    /// A decompressed offset lies beyond the archived data.
    #[error("offset {offset} out of range for {size} decompressed bytes")]
    OutOfRange { offset: u64, size: u64 },

    /// The compressor was driven out of order.
    #[error("compressor in wrong state: {0}")]
    BadState(&'static str),

    #[error("compression failed: {0}")]
    Compression(String),

    #[error("decompression failed: {0}")]
    Decompression(String),
}

pub type ArchiveResult<T> = Result<T, ArchiveError>;
