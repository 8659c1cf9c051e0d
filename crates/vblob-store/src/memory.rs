use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::warn;
use vblob_types::{NodeIndex, ObjectRecord, BLOCK_SIZE, BLOCK_SIZE_U64};

use crate::error::{StoreError, StoreResult};
use crate::extent::Extent;
use crate::traits::{AttachId, BlockDevice, BlockTarget, ObjectDirectory, ReadRequest};

/// Registry of attached targets shared by the device implementations.
#[derive(Default)]
pub(crate) struct Attachments {
    targets: Mutex<HashMap<AttachId, Arc<dyn BlockTarget>>>,
    next: AtomicU64,
}

impl Attachments {
    pub(crate) fn attach(&self, target: Arc<dyn BlockTarget>) -> AttachId {
        let id = self.next.fetch_add(1, Ordering::Relaxed) as AttachId;
        self.targets.lock().expect("lock poisoned").insert(id, target);
        id
    }

    pub(crate) fn detach(&self, id: AttachId) -> StoreResult<()> {
        self.targets
            .lock()
            .expect("lock poisoned")
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::UnknownAttachment(id))
    }

    pub(crate) fn get(&self, id: AttachId) -> StoreResult<Arc<dyn BlockTarget>> {
        self.targets
            .lock()
            .expect("lock poisoned")
            .get(&id)
            .cloned()
            .ok_or(StoreError::UnknownAttachment(id))
    }

    pub(crate) fn len(&self) -> usize {
        self.targets.lock().expect("lock poisoned").len()
    }
}

/// Copy the device bytes each request names into its target.
pub(crate) fn execute(
    attachments: &Attachments,
    device: &[u8],
    requests: &[ReadRequest],
) -> StoreResult<()> {
    let device_blocks = device.len() as u64 / BLOCK_SIZE_U64;
    for request in requests {
        let end = request
            .device_block
            .checked_add(request.block_count)
            .filter(|&end| end <= device_blocks)
            .ok_or(StoreError::DeviceOutOfBounds {
                block: request.device_block,
                count: request.block_count,
                device_blocks,
            })?;
        let target = attachments.get(request.attach)?;
        let start = (request.device_block * BLOCK_SIZE_U64) as usize;
        let end = (end * BLOCK_SIZE_U64) as usize;
        target.write_at(request.target_block * BLOCK_SIZE_U64, &device[start..end])?;
    }
    Ok(())
}

/// Block device backed by a byte vector.
///
/// Supports fault injection for exercising error paths: a one-shot
/// transaction failure and in-place byte corruption.
pub struct InMemoryBlockDevice {
    blocks: RwLock<Vec<u8>>,
    attachments: Attachments,
    fail_next: AtomicBool,
    submissions: AtomicU64,
}

impl InMemoryBlockDevice {
    /// Zeroed device of `block_count` blocks.
    pub fn new(block_count: u64) -> Self {
        Self::from_bytes(vec![0u8; block_count as usize * BLOCK_SIZE])
    }

    /// Device holding `bytes`, zero-padded to a whole block.
    pub fn from_bytes(mut bytes: Vec<u8>) -> Self {
        let padded = bytes.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
        bytes.resize(padded, 0);
        Self {
            blocks: RwLock::new(bytes),
            attachments: Attachments::default(),
            fail_next: AtomicBool::new(false),
            submissions: AtomicU64::new(0),
        }
    }

    /// Overwrite device contents starting at `block`.
    pub fn write_blocks(&self, block: u64, data: &[u8]) -> StoreResult<()> {
        let mut blocks = self.blocks.write().expect("lock poisoned");
        let start = (block * BLOCK_SIZE_U64) as usize;
        let end = start + data.len();
        if end > blocks.len() {
            return Err(StoreError::DeviceOutOfBounds {
                block,
                count: data.len().div_ceil(BLOCK_SIZE) as u64,
                device_blocks: blocks.len() as u64 / BLOCK_SIZE_U64,
            });
        }
        blocks[start..end].copy_from_slice(data);
        Ok(())
    }

    /// Flip every bit of the byte at device `offset`.
    pub fn corrupt_byte(&self, offset: u64) {
        let mut blocks = self.blocks.write().expect("lock poisoned");
        if let Some(byte) = blocks.get_mut(offset as usize) {
            *byte ^= 0xff;
        }
    }

    /// Make the next `submit` fail without touching any target.
    pub fn fail_next_submit(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Number of `submit` calls so far.
    pub fn submissions(&self) -> u64 {
        self.submissions.load(Ordering::Relaxed)
    }

    /// Number of live attachments.
    pub fn attachment_count(&self) -> usize {
        self.attachments.len()
    }
}

impl BlockDevice for InMemoryBlockDevice {
    fn block_count(&self) -> u64 {
        self.blocks.read().expect("lock poisoned").len() as u64 / BLOCK_SIZE_U64
    }

    fn attach(&self, target: Arc<dyn BlockTarget>) -> StoreResult<AttachId> {
        Ok(self.attachments.attach(target))
    }

    fn detach(&self, id: AttachId) -> StoreResult<()> {
        self.attachments.detach(id)
    }

    fn submit(&self, requests: &[ReadRequest]) -> StoreResult<()> {
        self.submissions.fetch_add(1, Ordering::Relaxed);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            warn!(requests = requests.len(), "injected device failure");
            return Err(StoreError::Device("injected failure".into()));
        }
        let blocks = self.blocks.read().expect("lock poisoned");
        execute(&self.attachments, &blocks, requests)
    }
}

/// Object directory held in memory.
#[derive(Default)]
pub struct InMemoryDirectory {
    entries: RwLock<HashMap<NodeIndex, (ObjectRecord, Vec<Extent>)>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the record for `record.node`.
    pub fn insert(&self, record: ObjectRecord, extents: Vec<Extent>) {
        self.entries
            .write()
            .expect("lock poisoned")
            .insert(record.node, (record, extents));
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.entries.read().expect("lock poisoned").len()
    }

    /// Returns `true` if no records are present.
    pub fn is_empty(&self) -> bool {
        self.entries.read().expect("lock poisoned").is_empty()
    }
}

impl ObjectDirectory for InMemoryDirectory {
    fn get_object_record(&self, node: NodeIndex) -> StoreResult<ObjectRecord> {
        self.entries
            .read()
            .expect("lock poisoned")
            .get(&node)
            .map(|(record, _)| record.clone())
            .ok_or(StoreError::NotFound(node))
    }

    fn extents(&self, node: NodeIndex) -> StoreResult<Vec<Extent>> {
        self.entries
            .read()
            .expect("lock poisoned")
            .get(&node)
            .map(|(_, extents)| extents.clone())
            .ok_or(StoreError::NotFound(node))
    }
}
