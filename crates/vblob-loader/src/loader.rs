use std::sync::Arc;

use tracing::{debug, error, warn};
use vblob_archive::{ArchiveError, ArchiveHeader, ChunkedDecompressor};
use zstd::zstd_safe;
use vblob_crypto::{merkle_block_count, ContentVerifier};
use vblob_store::{
    stream_blocks, AttachId, BlockDevice, BlockIterator, Extent, ObjectDirectory, ReadTxn,
};
use vblob_types::{
    blocks_for, round_up, CompressionKind, Digest, NodeIndex, ObjectRecord, BLOCK_SIZE_U64,
};

use crate::error::{LoaderError, LoaderResult};
use crate::region::MemoryRegion;

/// Block and byte counts derived from a record, all overflow-checked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectLayout {
    /// Blocks holding the Merkle tree, at the start of the object.
    pub merkle_blocks: u64,
    /// Blocks holding the (possibly compressed) data, after the tree.
    pub data_blocks: u64,
    /// `merkle_blocks` in bytes.
    pub merkle_bytes: usize,
    /// `data_blocks` in bytes.
    pub stored_bytes: usize,
    /// Uncompressed size.
    pub blob_size: usize,
    /// Uncompressed size rounded up to whole blocks.
    pub data_region_bytes: usize,
}

impl ObjectLayout {
    /// Derive the layout of `record`, rejecting inconsistent or
    /// unrepresentable records.
    pub fn of(record: &ObjectRecord) -> LoaderResult<Self> {
        if !record.is_well_formed() {
            return Err(LoaderError::InvalidRecord(record.node));
        }
        let overflow = || LoaderError::SizeOverflow(record.root);
        let to_bytes = |blocks: u64| {
            blocks
                .checked_mul(BLOCK_SIZE_U64)
                .and_then(|b| usize::try_from(b).ok())
                .ok_or_else(overflow)
        };

        let merkle_blocks = merkle_block_count(record.blob_size);
        let data_blocks = record.block_count.checked_sub(merkle_blocks).ok_or_else(|| {
            LoaderError::CorruptRecord(format!(
                "node {} has {} blocks but needs {merkle_blocks} for its merkle tree",
                record.node, record.block_count
            ))
        })?;
        if data_blocks > 0 && merkle_blocks == 0 {
            return Err(LoaderError::NoMerkleTree(record.root));
        }

        let layout = Self {
            merkle_blocks,
            data_blocks,
            merkle_bytes: to_bytes(merkle_blocks)?,
            stored_bytes: to_bytes(data_blocks)?,
            blob_size: usize::try_from(record.blob_size).map_err(|_| overflow())?,
            data_region_bytes: round_up(record.blob_size, BLOCK_SIZE_U64)
                .and_then(|b| usize::try_from(b).ok())
                .ok_or_else(overflow)?,
        };

        let expected = blocks_for(record.blob_size);
        match record.compression {
            CompressionKind::None if data_blocks != expected => {
                Err(LoaderError::CorruptRecord(format!(
                    "node {} stores {data_blocks} data blocks for {} bytes, expected {expected}",
                    record.node, record.blob_size
                )))
            }
            kind if kind.is_compressed() && record.blob_size > 0 && data_blocks == 0 => {
                Err(LoaderError::CorruptRecord(format!(
                    "compressed node {} has no data blocks",
                    record.node
                )))
            }
            _ => Ok(layout),
        }
    }
}

/// The regions produced by an eager load. Both are fully verified.
#[derive(Debug)]
pub struct LoadedBlob {
    pub data: Arc<MemoryRegion>,
    pub merkle: Arc<MemoryRegion>,
}

/// Everything the pager needs to produce pages of one object.
#[derive(Debug)]
pub struct PagedObject {
    pub record: ObjectRecord,
    pub layout: ObjectLayout,
    pub extents: Vec<Extent>,
    pub verifier: ContentVerifier,
    /// Present for chunked objects.
    pub decompressor: Option<ChunkedDecompressor>,
}

/// Detaches a target from its device when dropped.
pub(crate) struct Attachment<'a> {
    device: &'a dyn BlockDevice,
    id: AttachId,
}

impl<'a> Attachment<'a> {
    pub(crate) fn new(device: &'a dyn BlockDevice, region: &Arc<MemoryRegion>) -> LoaderResult<Self> {
        let id = device.attach(region.clone())?;
        Ok(Self { device, id })
    }

    pub(crate) fn id(&self) -> AttachId {
        self.id
    }
}

impl Drop for Attachment<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.device.detach(self.id) {
            warn!(attach = self.id, error = %e, "failed to detach region");
        }
    }
}

/// Read `count` object blocks starting at `object_block` into block
/// `target_block` of an attached region, in one transaction.
pub(crate) fn read_object_blocks(
    device: &dyn BlockDevice,
    node: NodeIndex,
    extents: &[Extent],
    attach: AttachId,
    object_block: u64,
    target_block: u64,
    count: u64,
) -> LoaderResult<()> {
    let mut iter = BlockIterator::new(node, extents.to_vec());
    iter.skip(object_block)?;
    let mut txn = ReadTxn::new(device);
    stream_blocks(&mut iter, target_block, count, |target, dev, len| {
        txn.enqueue(attach, target, dev, len);
        Ok(())
    })?;
    txn.transact()?;
    Ok(())
}

/// Loads objects from a block device and verifies them before handing them
/// out.
pub struct BlobLoader {
    device: Arc<dyn BlockDevice>,
    directory: Arc<dyn ObjectDirectory>,
}

impl BlobLoader {
    pub fn new(device: Arc<dyn BlockDevice>, directory: Arc<dyn ObjectDirectory>) -> Self {
        Self { device, directory }
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    pub fn directory(&self) -> &Arc<dyn ObjectDirectory> {
        &self.directory
    }

    /// Look up the record for `node`.
    pub fn record(&self, node: NodeIndex) -> LoaderResult<ObjectRecord> {
        let record = self.directory.get_object_record(node)?;
        if !record.is_well_formed() {
            return Err(LoaderError::InvalidRecord(node));
        }
        Ok(record)
    }

    /// Read, decompress, and verify the whole object.
    ///
    /// Nothing is returned unless every byte matched the record's root.
    pub fn load(&self, record: &ObjectRecord) -> LoaderResult<LoadedBlob> {
        self.load_inner(record).inspect_err(|e| {
            error!(
                node = record.node,
                root = %record.root.short_hex(),
                error = %e,
                "object load failed"
            );
        })
    }

    /// Load only what paging needs: the verified Merkle tree and, for
    /// chunked objects, the archive header.
    pub fn load_paged(&self, record: &ObjectRecord) -> LoaderResult<PagedObject> {
        self.load_paged_inner(record).inspect_err(|e| {
            error!(
                node = record.node,
                root = %record.root.short_hex(),
                error = %e,
                "paged object setup failed"
            );
        })
    }

    fn load_inner(&self, record: &ObjectRecord) -> LoaderResult<LoadedBlob> {
        let layout = ObjectLayout::of(record)?;
        let extents = self.directory.extents(record.node)?;
        let short = record.root.short_hex();

        let merkle = Arc::new(MemoryRegion::new_owned(
            format!("blob-merkle-{short}"),
            layout.merkle_bytes,
        )?);
        self.load_merkle(record, &layout, &extents, &merkle)?;

        let data = Arc::new(MemoryRegion::new_owned_padded(
            format!("blob-{short}"),
            layout.blob_size,
        )?);
        self.load_data(record, &layout, &extents, &data)?;
        data.with_bytes_mut(|bytes| bytes[layout.blob_size..].fill(0));

        let verifier = merkle.with_bytes(|tree| {
            ContentVerifier::create(record.root, tree, record.blob_size)
        })?;
        data.with_bytes(|bytes| verifier.verify(&bytes[..layout.blob_size]))?;

        debug!(
            node = record.node,
            root = %short,
            size = record.blob_size,
            compression = %record.compression,
            "object loaded"
        );
        Ok(LoadedBlob { data, merkle })
    }

    fn load_merkle(
        &self,
        record: &ObjectRecord,
        layout: &ObjectLayout,
        extents: &[Extent],
        merkle: &Arc<MemoryRegion>,
    ) -> LoaderResult<()> {
        if layout.merkle_blocks == 0 {
            return Ok(());
        }
        let attachment = Attachment::new(self.device.as_ref(), merkle)?;
        read_object_blocks(
            self.device.as_ref(),
            record.node,
            extents,
            attachment.id(),
            0,
            0,
            layout.merkle_blocks,
        )
    }

    fn load_data(
        &self,
        record: &ObjectRecord,
        layout: &ObjectLayout,
        extents: &[Extent],
        data: &Arc<MemoryRegion>,
    ) -> LoaderResult<()> {
        if layout.data_blocks == 0 {
            return Ok(());
        }
        if !record.compression.is_compressed() {
            let attachment = Attachment::new(self.device.as_ref(), data)?;
            return read_object_blocks(
                self.device.as_ref(),
                record.node,
                extents,
                attachment.id(),
                layout.merkle_blocks,
                0,
                layout.data_blocks,
            );
        }

        let staged = Arc::new(MemoryRegion::new_owned(
            format!("blob-compressed-{}", record.root.short_hex()),
            layout.stored_bytes,
        )?);
        {
            let attachment = Attachment::new(self.device.as_ref(), &staged)?;
            read_object_blocks(
                self.device.as_ref(),
                record.node,
                extents,
                attachment.id(),
                layout.merkle_blocks,
                0,
                layout.data_blocks,
            )?;
        }

        let produced = staged.with_bytes(|src| {
            data.with_bytes_mut(|dst| decompress_object(record, src, &mut dst[..layout.blob_size]))
        })?;
        if produced != layout.blob_size {
            return Err(LoaderError::DecompressedSizeMismatch {
                expected: record.blob_size,
                actual: produced as u64,
            });
        }
        Ok(())
    }

    fn load_paged_inner(&self, record: &ObjectRecord) -> LoaderResult<PagedObject> {
        if !record.compression.is_pageable() {
            return Err(LoaderError::PagingUnsupported(record.compression));
        }
        let layout = ObjectLayout::of(record)?;
        let extents = self.directory.extents(record.node)?;
        let short = record.root.short_hex();

        let merkle = Arc::new(MemoryRegion::new_owned(
            format!("blob-merkle-{short}"),
            layout.merkle_bytes,
        )?);
        self.load_merkle(record, &layout, &extents, &merkle)?;
        let verifier = merkle.with_bytes(|tree| {
            ContentVerifier::create(record.root, tree, record.blob_size)
        })?;

        let decompressor = match record.compression {
            CompressionKind::ChunkedSeekable if layout.data_blocks > 0 => {
                Some(self.load_archive_header(record, &layout, &extents)?)
            }
            _ => None,
        };

        debug!(
            node = record.node,
            root = %short,
            size = record.blob_size,
            compression = %record.compression,
            "object prepared for paging"
        );
        Ok(PagedObject {
            record: record.clone(),
            layout,
            extents,
            verifier,
            decompressor,
        })
    }

    /// Read just enough leading data blocks to parse the seek table.
    fn load_archive_header(
        &self,
        record: &ObjectRecord,
        layout: &ObjectLayout,
        extents: &[Extent],
    ) -> LoaderResult<ChunkedDecompressor> {
        let read_header = |blocks: u64| -> LoaderResult<Arc<MemoryRegion>> {
            let region = Arc::new(MemoryRegion::new_owned(
                format!("blob-header-{}", record.root.short_hex()),
                (blocks * BLOCK_SIZE_U64) as usize,
            )?);
            let attachment = Attachment::new(self.device.as_ref(), &region)?;
            read_object_blocks(
                self.device.as_ref(),
                record.node,
                extents,
                attachment.id(),
                layout.merkle_blocks,
                0,
                blocks,
            )?;
            Ok(region)
        };

        let first = read_header(1)?;
        let header_size = first.with_bytes(ArchiveHeader::declared_size)?;
        let header_blocks = blocks_for(header_size);
        if header_blocks > layout.data_blocks {
            return Err(LoaderError::CorruptRecord(format!(
                "archive header of node {} needs {header_blocks} blocks, object has {}",
                record.node, layout.data_blocks
            )));
        }
        let region = if header_blocks > 1 {
            read_header(header_blocks)?
        } else {
            first
        };
        let decompressor = region.with_bytes(ChunkedDecompressor::new)?;

        let decompressed = decompressor.header().decompressed_size();
        if decompressed != record.blob_size {
            return Err(LoaderError::DecompressedSizeMismatch {
                expected: record.blob_size,
                actual: decompressed,
            });
        }
        if decompressor.compressed_size() > layout.stored_bytes as u64 {
            return Err(LoaderError::CorruptRecord(format!(
                "archive of node {} is {} bytes but only {} are stored",
                record.node,
                decompressor.compressed_size(),
                layout.stored_bytes
            )));
        }
        Ok(decompressor)
    }
}

/// Inflate the stored bytes of a compressed object into `dst`, which is
/// exactly the recorded size. Returns the number of bytes produced.
fn decompress_object(record: &ObjectRecord, src: &[u8], dst: &mut [u8]) -> LoaderResult<usize> {
    let inflate_failed = |reason: String| LoaderError::Archive(ArchiveError::Decompression(reason));
    let expected = dst.len() as u64;
    let mismatch = |actual: u64| LoaderError::DecompressedSizeMismatch { expected, actual };
    match record.compression {
        CompressionKind::None => Err(LoaderError::CorruptRecord(format!(
            "node {} is stored uncompressed",
            record.node
        ))),
        CompressionKind::ChunkedSeekable => {
            let decompressor = ChunkedDecompressor::new(src)?;
            let size = decompressor.header().decompressed_size();
            if size != expected {
                return Err(mismatch(size));
            }
            Ok(decompressor.decompress_full(dst, src)?)
        }
        CompressionKind::FullFrame => {
            let frame_len = zstd_safe::find_frame_compressed_size(src)
                .map_err(|code| inflate_failed(zstd_safe::get_error_name(code).to_string()))?;
            let frame = &src[..frame_len];
            match zstd_safe::get_frame_content_size(frame) {
                Ok(Some(size)) if size != expected => return Err(mismatch(size)),
                Ok(_) => {}
                Err(_) => return Err(inflate_failed("unreadable frame header".into())),
            }
            zstd::bulk::decompress_to_buffer(frame, dst).map_err(|e| inflate_failed(e.to_string()))
        }
    }
}

/// Root of an empty object.
pub fn empty_root() -> Digest {
    vblob_crypto::MerkleTree::from_data(&[]).root()
}
