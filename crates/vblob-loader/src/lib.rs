//! Verified loading of vblob objects.
//!
//! Objects live on a block device as a Merkle tree followed by their data,
//! which may be raw, a single zstd frame, or a seekable chunked archive.
//! Nothing leaves this crate until it has been checked against the
//! object's root digest.
//!
//! Two paths are provided:
//!
//! - [`BlobLoader::load`] reads, decompresses, and verifies a whole object.
//! - [`PagingCoordinator`] produces verified pages on demand for paged
//!   [`MemoryRegion`]s, touching only the blocks and frames a fault needs.
//!
//! [`LazyHandle`] chooses between them per object and caches the result.

pub mod config;
pub mod error;
#[cfg(any(test, feature = "test-util"))]
pub mod image;
pub mod lazy;
pub mod loader;
pub mod pager;
pub mod region;
pub mod workers;

pub use config::LoaderConfig;
pub use error::{LoaderError, LoaderResult};
#[cfg(any(test, feature = "test-util"))]
pub use image::{Image, ImageBuilder};
pub use lazy::{EagerLazyHandle, LazyHandle, PagedLazyHandle};
pub use loader::{empty_root, BlobLoader, LoadedBlob, ObjectLayout, PagedObject};
pub use pager::{PagedBlobHandler, PagerStats, PagerStatsSnapshot, PagingCoordinator};
pub use region::{MemoryRegion, PageFaultHandler};
pub use workers::PagerWorkers;
