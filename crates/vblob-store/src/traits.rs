use std::sync::Arc;

use vblob_types::{NodeIndex, ObjectRecord};

use crate::error::StoreResult;
use crate::extent::Extent;

/// Handle returned when a target is attached to a device.
pub type AttachId = u32;

/// Memory that device reads land in.
pub trait BlockTarget: Send + Sync {
    /// Size of the target in bytes.
    fn size(&self) -> u64;

    /// Copy `src` into the target at byte `offset`.
    fn write_at(&self, offset: u64, src: &[u8]) -> StoreResult<()>;
}

/// One block-granular read from the device into an attached target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadRequest {
    pub attach: AttachId,
    /// First block of the target to fill.
    pub target_block: u64,
    /// First device block to read.
    pub device_block: u64,
    pub block_count: u64,
}

impl ReadRequest {
    /// Returns `true` if `next` continues this request in both the target
    /// and on the device.
    pub fn is_followed_by(&self, next: &ReadRequest) -> bool {
        self.attach == next.attach
            && self.target_block + self.block_count == next.target_block
            && self.device_block + self.block_count == next.device_block
    }
}

/// Block storage that reads into attached memory targets.
///
/// Implementations must either complete every request of a
/// [`submit`](Self::submit) call or return an error; callers treat any
/// error as leaving the targets' contents unspecified.
pub trait BlockDevice: Send + Sync {
    /// Size of the device in blocks.
    fn block_count(&self) -> u64;

    /// Register a target so reads can be directed at it.
    fn attach(&self, target: Arc<dyn BlockTarget>) -> StoreResult<AttachId>;

    /// Unregister a target.
    fn detach(&self, id: AttachId) -> StoreResult<()>;

    /// Execute a batch of reads.
    fn submit(&self, requests: &[ReadRequest]) -> StoreResult<()>;
}

/// Lookup of object records and their on-device placement.
pub trait ObjectDirectory: Send + Sync {
    /// Record for `node`, or `NotFound`.
    fn get_object_record(&self, node: NodeIndex) -> StoreResult<ObjectRecord>;

    /// Device extents holding the object's blocks, in object order: Merkle
    /// blocks first, then data blocks.
    fn extents(&self, node: NodeIndex) -> StoreResult<Vec<Extent>>;
}
