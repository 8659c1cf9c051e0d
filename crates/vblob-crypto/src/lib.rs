//! Content verification for vblob objects.
//!
//! Provides domain-separated BLAKE3 node hashing, construction of the
//! block-level Merkle tree stored alongside every object, and the
//! [`ContentVerifier`] that checks whole or partial data ranges against a
//! trusted root.
//!
//! Hashing is delegated to BLAKE3; this crate only decides what gets hashed.

pub mod error;
pub mod hasher;
pub mod merkle;

pub use error::{MerkleError, MerkleResult};
pub use hasher::NodeHasher;
pub use merkle::{
    merkle_block_count, tree_length, ContentVerifier, MerkleTree, DIGESTS_PER_NODE,
};
