//! Demand paging of verified object data.
//!
//! A [`PagingCoordinator`] owns a fixed set of transfer slots. Each slot is
//! a device-attached staging buffer plus a scratch buffer for decompressed
//! frames. Servicing a fault leases one slot, reads exactly the blocks the
//! fault needs into it, inflates them if the object is compressed, checks
//! the result against the object's Merkle leaves, and only then copies the
//! pages into the faulting region. Dropping the lease zeroes whatever part
//! of the slot was used, on success and on failure alike.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use tracing::{debug, error, warn};
use vblob_archive::{ChunkedDecompressor, SeekableDecompressor};
use vblob_store::{AttachId, BlockDevice};
use vblob_types::{blocks_for, round_down, round_up, BLOCK_SIZE_U64};

use crate::config::LoaderConfig;
use crate::error::{LoaderError, LoaderResult};
use crate::loader::{read_object_blocks, PagedObject};
use crate::region::{MemoryRegion, PageFaultHandler};

/// Counters describing pager activity.
#[derive(Debug, Default)]
pub struct PagerStats {
    faults_serviced: AtomicU64,
    faults_failed: AtomicU64,
    bytes_supplied: AtomicU64,
    decommits: AtomicU64,
}

/// Point-in-time copy of [`PagerStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PagerStatsSnapshot {
    pub faults_serviced: u64,
    pub faults_failed: u64,
    pub bytes_supplied: u64,
    pub decommits: u64,
}

impl PagerStats {
    pub fn snapshot(&self) -> PagerStatsSnapshot {
        PagerStatsSnapshot {
            faults_serviced: self.faults_serviced.load(Ordering::Relaxed),
            faults_failed: self.faults_failed.load(Ordering::Relaxed),
            bytes_supplied: self.bytes_supplied.load(Ordering::Relaxed),
            decommits: self.decommits.load(Ordering::Relaxed),
        }
    }
}

struct TransferSlot {
    transfer: Arc<MemoryRegion>,
    scratch: MemoryRegion,
    attach: AttachId,
}

/// Fixed pool of staging slots shared by every fault.
struct TransferBuffer {
    slots: Vec<TransferSlot>,
    free: Mutex<Vec<usize>>,
    available: Condvar,
}

impl TransferBuffer {
    fn new(device: &dyn BlockDevice, config: &LoaderConfig) -> LoaderResult<Self> {
        let mut slots = Vec::with_capacity(config.transfer_slots);
        for i in 0..config.transfer_slots {
            match Self::new_slot(device, config, i) {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    detach_all(device, &slots);
                    return Err(e);
                }
            }
        }
        Ok(Self {
            free: Mutex::new((0..slots.len()).rev().collect()),
            available: Condvar::new(),
            slots,
        })
    }

    fn new_slot(
        device: &dyn BlockDevice,
        config: &LoaderConfig,
        index: usize,
    ) -> LoaderResult<TransferSlot> {
        let transfer = Arc::new(MemoryRegion::new_owned(
            format!("pager-transfer-{index}"),
            config.transfer_slot_size,
        )?);
        let scratch = MemoryRegion::new_owned(format!("pager-scratch-{index}"), config.scratch_size)?;
        let attach = device.attach(transfer.clone())?;
        Ok(TransferSlot {
            transfer,
            scratch,
            attach,
        })
    }

    /// Block until a slot is free and lease it.
    fn acquire<'a>(&'a self, stats: &'a PagerStats) -> TransferLease<'a> {
        let mut free = self.free.lock().expect("lock poisoned");
        loop {
            if let Some(index) = free.pop() {
                return TransferLease {
                    buffer: self,
                    stats,
                    index,
                    transfer_used: 0,
                    scratch_used: 0,
                };
            }
            free = self.available.wait(free).expect("lock poisoned");
        }
    }
}

fn detach_all(device: &dyn BlockDevice, slots: &[TransferSlot]) {
    for slot in slots {
        if let Err(e) = device.detach(slot.attach) {
            warn!(attach = slot.attach, error = %e, "failed to detach transfer slot");
        }
    }
}

/// Exclusive use of one transfer slot.
///
/// Records how much of the slot was written so that exactly that range is
/// zeroed when the lease ends.
struct TransferLease<'a> {
    buffer: &'a TransferBuffer,
    stats: &'a PagerStats,
    index: usize,
    transfer_used: u64,
    scratch_used: u64,
}

impl TransferLease<'_> {
    fn slot(&self) -> &TransferSlot {
        &self.buffer.slots[self.index]
    }

    fn transfer_capacity(&self) -> u64 {
        self.slot().transfer.size()
    }

    fn scratch_capacity(&self) -> u64 {
        self.slot().scratch.size()
    }

    fn mark_transfer_used(&mut self, bytes: u64) {
        self.transfer_used = self.transfer_used.max(bytes);
    }

    fn mark_scratch_used(&mut self, bytes: u64) {
        self.scratch_used = self.scratch_used.max(bytes);
    }
}

impl Drop for TransferLease<'_> {
    fn drop(&mut self) {
        let slot = &self.buffer.slots[self.index];
        if self.transfer_used > 0 {
            slot.transfer.decommit(0, self.transfer_used);
            self.stats.decommits.fetch_add(1, Ordering::Relaxed);
        }
        if self.scratch_used > 0 {
            slot.scratch.decommit(0, self.scratch_used);
        }
        self.buffer
            .free
            .lock()
            .expect("lock poisoned")
            .push(self.index);
        self.buffer.available.notify_one();
    }
}

/// Services page faults for paged objects.
///
/// Faults may be serviced concurrently from any number of threads; each
/// one holds a transfer slot for its duration.
pub struct PagingCoordinator {
    device: Arc<dyn BlockDevice>,
    config: LoaderConfig,
    buffer: TransferBuffer,
    stats: PagerStats,
    shut_down: AtomicBool,
}

impl PagingCoordinator {
    /// Allocate the transfer slots and attach them to `device`.
    pub fn init(device: Arc<dyn BlockDevice>, config: LoaderConfig) -> LoaderResult<Self> {
        config.validate()?;
        let buffer = TransferBuffer::new(device.as_ref(), &config)?;
        debug!(
            slots = config.transfer_slots,
            slot_size = config.transfer_slot_size,
            scratch_size = config.scratch_size,
            "pager initialized"
        );
        Ok(Self {
            device,
            config,
            buffer,
            stats: PagerStats::default(),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn stats(&self) -> PagerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop accepting faults. Faults already in flight complete normally.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Returns `true` if no transfer slot or scratch area holds any
    /// non-zero byte.
    pub fn staging_is_clean(&self) -> bool {
        self.buffer.slots.iter().all(|slot| {
            slot.transfer.with_bytes(|b| b.iter().all(|&x| x == 0))
                && slot.scratch.with_bytes(|b| b.iter().all(|&x| x == 0))
        })
    }

    /// Widen `[offset, offset + length)` to the smallest range that can be
    /// verified on its own: whole blocks, and for compressed objects whole
    /// frames. The result is clamped to the object's size.
    pub fn align_for_verification(
        &self,
        object: &PagedObject,
        offset: u64,
        length: u64,
    ) -> LoaderResult<(u64, u64)> {
        let size = object.record.blob_size;
        if length == 0 || offset >= size {
            return Err(LoaderError::FaultOutOfRange {
                offset,
                length,
                size,
            });
        }
        let end = offset.saturating_add(length).min(size);

        match &object.decompressor {
            Some(decompressor) => {
                let first = decompressor.mapping_for_decompressed_address(offset)?;
                let last = decompressor.mapping_for_decompressed_address(end - 1)?;
                let start = first.decompressed_offset;
                let end = last.decompressed_offset + last.decompressed_length;
                Ok((start, end - start))
            }
            None => {
                let start = round_down(offset, BLOCK_SIZE_U64);
                let end = round_up(end, BLOCK_SIZE_U64).unwrap_or(size).min(size);
                Ok((start, end - start))
            }
        }
    }

    /// Make `[offset, offset + length)` of `region` resident with verified
    /// contents of `object`.
    pub fn service_fault(
        &self,
        region: &MemoryRegion,
        object: &PagedObject,
        offset: u64,
        length: u64,
    ) -> LoaderResult<()> {
        if self.is_shut_down() {
            return Err(LoaderError::Shutdown);
        }
        let result = self
            .align_for_verification(object, offset, length)
            .and_then(|(start, len)| {
                let mut lease = self.buffer.acquire(&self.stats);
                match &object.decompressor {
                    Some(decompressor) => {
                        self.service_compressed(&mut lease, region, object, decompressor, start, len)
                    }
                    None => self.service_uncompressed(&mut lease, region, object, start, len),
                }
            });

        match &result {
            Ok(()) => {
                self.stats.faults_serviced.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.faults_failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    region = region.name(),
                    root = %object.record.root.short_hex(),
                    offset,
                    length,
                    error = %e,
                    "page fault failed"
                );
            }
        }
        result
    }

    fn service_uncompressed(
        &self,
        lease: &mut TransferLease<'_>,
        region: &MemoryRegion,
        object: &PagedObject,
        start: u64,
        length: u64,
    ) -> LoaderResult<()> {
        let window_max = lease.transfer_capacity();
        let end = start + length;
        let mut pos = start;
        while pos < end {
            let window = window_max.min(end - pos);
            let blocks = blocks_for(window);
            let staged = blocks * BLOCK_SIZE_U64;

            lease.mark_transfer_used(staged);
            read_object_blocks(
                self.device.as_ref(),
                object.record.node,
                &object.extents,
                lease.slot().attach,
                object.layout.merkle_blocks + pos / BLOCK_SIZE_U64,
                0,
                blocks,
            )?;

            let transfer = &lease.slot().transfer;
            transfer.with_bytes_mut(|buf| buf[window as usize..staged as usize].fill(0));
            transfer.with_bytes(|buf| -> LoaderResult<()> {
                object.verifier.verify_partial(&buf[..window as usize], pos)?;
                region.supply_pages(pos, &buf[..staged as usize])
            })?;

            self.stats.bytes_supplied.fetch_add(window, Ordering::Relaxed);
            pos += window;
        }
        Ok(())
    }

    /// Every frame overlapping the range is read, inflated, and verified on
    /// its own, so a fault spanning frames touches each frame once.
    fn service_compressed(
        &self,
        lease: &mut TransferLease<'_>,
        region: &MemoryRegion,
        object: &PagedObject,
        decompressor: &ChunkedDecompressor,
        start: u64,
        length: u64,
    ) -> LoaderResult<()> {
        let end = start + length;
        let mut pos = start;
        while pos < end {
            let mapping = decompressor.mapping_for_decompressed_address(pos)?;
            let lead = mapping.compressed_offset % BLOCK_SIZE_U64;
            let first_block = mapping.compressed_offset / BLOCK_SIZE_U64;
            let read_blocks = blocks_for(lead + mapping.compressed_length);
            let staged = read_blocks * BLOCK_SIZE_U64;
            if staged > lease.transfer_capacity() {
                return Err(LoaderError::BufferTooSmall {
                    needed: staged,
                    actual: lease.transfer_capacity(),
                });
            }
            let inflated = blocks_for(mapping.decompressed_length) * BLOCK_SIZE_U64;
            if inflated > lease.scratch_capacity() {
                return Err(LoaderError::BufferTooSmall {
                    needed: inflated,
                    actual: lease.scratch_capacity(),
                });
            }

            lease.mark_transfer_used(staged);
            read_object_blocks(
                self.device.as_ref(),
                object.record.node,
                &object.extents,
                lease.slot().attach,
                object.layout.merkle_blocks + first_block,
                0,
                read_blocks,
            )?;

            lease.mark_scratch_used(inflated);
            let slot = lease.slot();
            let frame_start = lead as usize;
            let frame_end = frame_start + mapping.compressed_length as usize;
            let produced = slot.transfer.with_bytes(|src| {
                slot.scratch.with_bytes_mut(|dst| {
                    let n = decompressor.decompress_frame(
                        mapping.frame,
                        &src[frame_start..frame_end],
                        dst,
                    )?;
                    dst[n..inflated as usize].fill(0);
                    Ok::<_, vblob_archive::ArchiveError>(n)
                })
            })?;
            if produced as u64 != mapping.decompressed_length {
                return Err(LoaderError::DecompressedSizeMismatch {
                    expected: mapping.decompressed_length,
                    actual: produced as u64,
                });
            }

            slot.scratch.with_bytes(|buf| -> LoaderResult<()> {
                object
                    .verifier
                    .verify_partial(&buf[..produced], mapping.decompressed_offset)?;
                region.supply_pages(mapping.decompressed_offset, &buf[..inflated as usize])
            })?;

            self.stats
                .bytes_supplied
                .fetch_add(mapping.decompressed_length, Ordering::Relaxed);
            pos = mapping.decompressed_offset + mapping.decompressed_length;
        }
        Ok(())
    }
}

impl Drop for PagingCoordinator {
    fn drop(&mut self) {
        detach_all(self.device.as_ref(), &self.buffer.slots);
    }
}

/// Routes faults on one object's region to a shared coordinator.
pub struct PagedBlobHandler {
    pager: Arc<PagingCoordinator>,
    object: Arc<PagedObject>,
}

impl PagedBlobHandler {
    pub fn new(pager: Arc<PagingCoordinator>, object: Arc<PagedObject>) -> Self {
        Self { pager, object }
    }

    pub fn object(&self) -> &Arc<PagedObject> {
        &self.object
    }
}

impl PageFaultHandler for PagedBlobHandler {
    fn on_fault(&self, region: &MemoryRegion, offset: u64, length: u64) -> LoaderResult<()> {
        self.pager.service_fault(region, &self.object, offset, length)
    }
}
