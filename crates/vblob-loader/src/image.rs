//! Assembly of in-memory device images holding vblob objects.
//!
//! Each object is laid out as its Merkle tree blocks followed by its
//! stored data blocks, encoded with the requested compression.

use std::sync::Arc;

use vblob_archive::compress_bytes;
use vblob_crypto::MerkleTree;
use vblob_store::{Extent, InMemoryBlockDevice, InMemoryDirectory};
use vblob_types::{
    blocks_for, CompressionKind, NodeIndex, ObjectRecord, BLOCK_SIZE, BLOCK_SIZE_U64,
};

use crate::error::{LoaderError, LoaderResult};

/// Builds a device and directory from object contents.
pub struct ImageBuilder {
    blocks: Vec<u8>,
    objects: Vec<(ObjectRecord, Vec<Extent>)>,
    level: i32,
    fragment: bool,
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            objects: Vec::new(),
            level: vblob_archive::DEFAULT_LEVEL,
            fragment: false,
        }
    }

    /// zstd level for compressed objects.
    pub fn level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }

    /// Scatter each object over two-block extents separated by one unused
    /// block.
    pub fn fragmented(mut self, fragment: bool) -> Self {
        self.fragment = fragment;
        self
    }

    /// Store `data` with the given encoding and return its record.
    ///
    /// Empty objects are always stored uncompressed.
    pub fn add(&mut self, data: &[u8], compression: CompressionKind) -> LoaderResult<ObjectRecord> {
        let compression = if data.is_empty() {
            CompressionKind::None
        } else {
            compression
        };
        let tree = MerkleTree::from_data(data);
        let stored = match compression {
            CompressionKind::None => data.to_vec(),
            CompressionKind::FullFrame => zstd::bulk::compress(data, self.level)
                .map_err(|e| vblob_archive::ArchiveError::Compression(e.to_string()))?,
            CompressionKind::ChunkedSeekable => compress_bytes(data, self.level)?,
        };

        let mut object = tree.as_bytes().to_vec();
        object.extend_from_slice(&stored);
        let block_count = tree.block_count() + blocks_for(stored.len() as u64);
        object.resize(block_count as usize * BLOCK_SIZE, 0);

        let node = NodeIndex::try_from(self.objects.len())
            .map_err(|_| LoaderError::CorruptRecord("too many objects".into()))?;
        let extents = self.place(&object);
        let record = ObjectRecord {
            node,
            root: tree.root(),
            blob_size: data.len() as u64,
            block_count,
            compression,
            allocated: true,
        };
        self.objects.push((record.clone(), extents));
        Ok(record)
    }

    fn place(&mut self, object: &[u8]) -> Vec<Extent> {
        let run = if self.fragment { 2 } else { usize::MAX };
        let mut extents = Vec::new();
        for piece in object.chunks(run.saturating_mul(BLOCK_SIZE)) {
            if self.fragment {
                self.blocks.extend_from_slice(&[0xEE; BLOCK_SIZE]);
            }
            let start = self.blocks.len() as u64 / BLOCK_SIZE_U64;
            self.blocks.extend_from_slice(piece);
            extents.push(Extent::new(start, piece.len() as u64 / BLOCK_SIZE_U64));
        }
        extents
    }

    /// Finish the image.
    pub fn build(self) -> Image {
        let directory = InMemoryDirectory::new();
        for (record, extents) in &self.objects {
            directory.insert(record.clone(), extents.clone());
        }
        Image {
            device: Arc::new(InMemoryBlockDevice::from_bytes(self.blocks)),
            directory: Arc::new(directory),
            objects: self.objects,
        }
    }
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A built image.
pub struct Image {
    pub device: Arc<InMemoryBlockDevice>,
    pub directory: Arc<InMemoryDirectory>,
    objects: Vec<(ObjectRecord, Vec<Extent>)>,
}

impl Image {
    /// Device byte offset of byte `offset` of the object's stored data
    /// (the bytes after its Merkle tree).
    pub fn data_device_offset(&self, node: NodeIndex, offset: u64) -> Option<u64> {
        let (record, extents) = self.objects.get(node as usize)?;
        let merkle_blocks = vblob_crypto::merkle_block_count(record.blob_size);
        let object_offset = merkle_blocks * BLOCK_SIZE_U64 + offset;
        let mut block = object_offset / BLOCK_SIZE_U64;
        for extent in extents {
            if block < extent.length {
                return Some((extent.start + block) * BLOCK_SIZE_U64 + object_offset % BLOCK_SIZE_U64);
            }
            block -= extent.length;
        }
        None
    }
}
