use vblob_archive::ArchiveError;
use vblob_crypto::MerkleError;
use vblob_store::StoreError;
use vblob_types::{CompressionKind, Digest, NodeIndex};

/// Errors from loading or paging an object.
///
/// Failures from the verifier, the archive codec, and the storage layer
/// pass through unchanged so callers can tell corruption from I/O trouble.
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    /// The directory slot does not hold an allocated record.
    #[error("record for node {0} is not well formed")]
    InvalidRecord(NodeIndex),

    /// The record describes data blocks but no Merkle tree to check them.
    #[error("object {0} has data blocks but no merkle tree")]
    NoMerkleTree(Digest),

    /// A size derived from the record does not fit in memory arithmetic.
    #[error("size of object {0} overflows")]
    SizeOverflow(Digest),

    /// Memory for a region could not be reserved.
    #[error("cannot allocate {size} bytes for region {name}")]
    AllocationFailed { name: String, size: u64 },

    /// The record's counts are inconsistent with each other.
    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    /// Decompression produced a different number of bytes than recorded.
    #[error("decompressed {actual} bytes, expected {expected}")]
    DecompressedSizeMismatch { expected: u64, actual: u64 },

    /// The object's encoding does not allow paging individual ranges.
    #[error("{0} objects cannot be paged")]
    PagingUnsupported(CompressionKind),

    /// A staging buffer cannot hold what a fault needs.
    #[error("staging buffer too small: need {needed} bytes, have {actual}")]
    BufferTooSmall { needed: u64, actual: u64 },

    /// A fault or read lies outside the region.
    #[error("range at offset {offset} with length {length} outside region of {size} bytes")]
    FaultOutOfRange { offset: u64, length: u64, size: u64 },

    /// The fault handler returned without making a page resident.
    #[error("page at offset {offset} was not supplied")]
    PageNotSupplied { offset: u64 },

    /// The pager no longer accepts work.
    #[error("pager is shut down")]
    Shutdown,

    /// A pager worker task did not complete.
    #[error("pager worker failed: {0}")]
    Worker(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Verification(#[from] MerkleError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Io(#[from] StoreError),
}

impl LoaderError {
    /// Returns `true` if the stored bytes failed an integrity check.
    pub fn is_integrity_failure(&self) -> bool {
        match self {
            Self::Verification(e) => e.is_corruption(),
            Self::Archive(ArchiveError::ArchiveCorrupt(_) | ArchiveError::Decompression(_)) => {
                true
            }
            Self::DecompressedSizeMismatch { .. } => true,
            _ => false,
        }
    }
}

/// Result alias for loader operations.
pub type LoaderResult<T> = Result<T, LoaderError>;
