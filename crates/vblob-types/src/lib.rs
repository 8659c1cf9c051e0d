//! Foundation types for vblob.
//!
//! Every other vblob crate depends on `vblob-types`. It defines the names and
//! sizes the loader speaks in: the content digest that names an object, the
//! read-only record the directory hands out for it, and the overflow-checked
//! block arithmetic shared by the verifier, the archive codec, and the pager.
//!
//! # Key Types
//!
//! - [`Digest`]: 32-byte content hash naming an object (Merkle root)
//! - [`ObjectRecord`]: immutable metadata for one stored object
//! - [`CompressionKind`]: how the object's data blocks are encoded
//! - [`NodeIndex`]: directory slot of an object record

pub mod block;
pub mod digest;
pub mod error;
pub mod record;

pub use block::{
    block_offset, blocks_for, round_down, round_up, BLOCK_SIZE, BLOCK_SIZE_U64, PAGE_SIZE,
};
pub use digest::{Digest, DIGEST_LENGTH};
pub use error::TypeError;
pub use record::{CompressionKind, NodeIndex, ObjectRecord};
