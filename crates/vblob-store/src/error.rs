use vblob_types::NodeIndex;

use crate::traits::AttachId;

/// Errors from the block device and object directory layers.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No allocated record exists for the node.
    #[error("object not found: node {0}")]
    NotFound(NodeIndex),

    /// A read referenced an attachment that was never made or already
    /// detached.
    #[error("unknown attachment {0}")]
    UnknownAttachment(AttachId),

    /// A read reaches past the end of the device.
    #[error("read of {count} blocks at block {block} exceeds device of {device_blocks} blocks")]
    DeviceOutOfBounds {
        block: u64,
        count: u64,
        device_blocks: u64,
    },

    /// A read would write past the end of its target.
    #[error("write of {length} bytes at offset {offset} exceeds target of {size} bytes")]
    TargetOutOfBounds { offset: u64, length: u64, size: u64 },

    /// The object's extents end before the requested block.
    #[error("extents of node {node} end before block {block}")]
    ExtentsExhausted { node: NodeIndex, block: u64 },

    /// The device reported a failed transaction.
    #[error("device failure: {0}")]
    Device(String),

    /// I/O error from the underlying storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
