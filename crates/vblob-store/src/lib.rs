//! Storage interfaces consumed by the vblob loader.
//!
//! The loader never touches storage directly. It reads through a
//! [`BlockDevice`], which copies device blocks into attached memory
//! targets in batched transactions, and it finds objects through an
//! [`ObjectDirectory`], which hands out read-only records and the device
//! extents an object occupies.
//!
//! # Backends
//!
//! - [`InMemoryBlockDevice`]: vector-backed device with fault injection
//! - [`InMemoryDirectory`]: map-backed directory
//!
//! Offsets and lengths at this layer are in blocks unless named otherwise.

pub mod error;
pub mod extent;
pub mod memory;
pub mod traits;
pub mod txn;

pub use error::{StoreError, StoreResult};
pub use extent::{stream_blocks, BlockIterator, Extent};
pub use memory::{InMemoryBlockDevice, InMemoryDirectory};
pub use traits::{AttachId, BlockDevice, BlockTarget, ObjectDirectory, ReadRequest};
pub use txn::ReadTxn;
