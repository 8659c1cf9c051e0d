use std::fmt;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::TypeError;

/// Directory slot of an object record.
pub type NodeIndex = u32;

/// Encoding of an object's data blocks on the device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompressionKind {
    /// Data blocks hold the raw object bytes.
    #[default]
    None,
    /// Data blocks hold a single zstd frame. Only loadable eagerly.
    FullFrame,
    /// Data blocks hold a seekable chunked archive. Loadable eagerly or paged.
    ChunkedSeekable,
}

impl CompressionKind {
    /// On-disk tag byte.
    pub fn tag(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::FullFrame => 1,
            Self::ChunkedSeekable => 2,
        }
    }

    /// Parse an on-disk tag byte.
    pub fn from_tag(tag: u8) -> Result<Self, TypeError> {
        match tag {
            0 => Ok(Self::None),
            1 => Ok(Self::FullFrame),
            2 => Ok(Self::ChunkedSeekable),
            other => Err(TypeError::UnknownCompression(other)),
        }
    }

    /// Returns `true` if the data blocks must be decompressed before use.
    pub fn is_compressed(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// Returns `true` if individual pages can be produced without touching
    /// the rest of the object.
    pub fn is_pageable(&self) -> bool {
        matches!(self, Self::None | Self::ChunkedSeekable)
    }
}

impl fmt::Display for CompressionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::FullFrame => write!(f, "full-frame"),
            Self::ChunkedSeekable => write!(f, "chunked"),
        }
    }
}

/// Immutable metadata for one stored object.
///
/// Created by the directory layer and handed out read-only. `block_count`
/// covers both the Merkle tree blocks and the (possibly compressed) data
/// blocks; the Merkle tree always comes first in the object's block order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    /// Directory slot, used to look up the object's extents.
    pub node: NodeIndex,
    /// Merkle root naming the object.
    pub root: Digest,
    /// Uncompressed size in bytes.
    pub blob_size: u64,
    /// Total blocks: merkle blocks followed by data blocks.
    pub block_count: u64,
    /// Encoding of the data blocks.
    pub compression: CompressionKind,
    /// Whether the slot holds an allocated object record.
    pub allocated: bool,
}

impl ObjectRecord {
    /// Returns `true` if the record describes an allocated object.
    pub fn is_well_formed(&self) -> bool {
        self.allocated
    }
}
