use thiserror::Error;
use vblob_types::Digest;

/// Errors from building or checking a Merkle tree.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MerkleError {
    /// The supplied tree buffer is shorter than the tree for this data size.
    #[error("merkle tree too small: need {expected} bytes, have {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// The stored tree does not reduce to the trusted root.
    #[error("merkle tree does not reduce to root {root}")]
    TreeCorrupt { root: Digest },

    /// A data block hashed to something other than its stored leaf digest.
    #[error("data integrity check failed for block at offset {offset}")]
    DataIntegrity { offset: u64 },

    /// The range does not start on a block boundary, or ends mid-block
    /// before the end of the data.
    #[error("range at offset {offset} with length {length} is not block aligned")]
    Unaligned { offset: u64, length: u64 },

    /// The range extends past the end of the data.
    #[error("range at offset {offset} with length {length} exceeds data size {data_size}")]
    OutOfRange {
        offset: u64,
        length: u64,
        data_size: u64,
    },

    /// A whole-object check was handed the wrong number of bytes.
    #[error("verified length {actual} does not match data size {expected}")]
    LengthMismatch { expected: u64, actual: u64 },
}

impl MerkleError {
    /// Returns `true` for failures that mean the stored bytes are wrong,
    /// as opposed to the caller asking a malformed question.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::TreeCorrupt { .. } | Self::DataIntegrity { .. } | Self::SizeMismatch { .. }
        )
    }
}

pub type MerkleResult<T> = Result<T, MerkleError>;
