use tracing::warn;
use vblob_types::{blocks_for, Digest, BLOCK_SIZE, BLOCK_SIZE_U64, DIGEST_LENGTH};

use crate::error::{MerkleError, MerkleResult};
use crate::hasher::NodeHasher;

/// Number of digests that fit in one tree node.
pub const DIGESTS_PER_NODE: usize = BLOCK_SIZE / DIGEST_LENGTH;

/// Byte length of each stored level of the tree, bottom-up.
///
/// Level 0 holds one digest per data block. Each level is zero-padded to a
/// whole block, and levels are added until one fits in a single block.
fn level_lengths(data_size: u64) -> Vec<u64> {
    let mut levels = Vec::new();
    if data_size == 0 {
        return levels;
    }
    let mut input_len = data_size;
    loop {
        let nodes = blocks_for(input_len);
        let level_len = blocks_for(nodes * DIGEST_LENGTH as u64) * BLOCK_SIZE_U64;
        levels.push(level_len);
        if level_len == BLOCK_SIZE_U64 {
            return levels;
        }
        input_len = level_len;
    }
}

/// Size in bytes of the Merkle tree stored for `data_size` bytes of data.
pub fn tree_length(data_size: u64) -> u64 {
    level_lengths(data_size).iter().sum()
}

/// Number of blocks occupied by the Merkle tree for `data_size` bytes.
pub fn merkle_block_count(data_size: u64) -> u64 {
    tree_length(data_size) / BLOCK_SIZE_U64
}

fn hash_level(level: u32, input: &[u8], out: &mut Vec<u8>) {
    for (n, chunk) in input.chunks(BLOCK_SIZE).enumerate() {
        let digest = NodeHasher::MERKLE.digest(level, (n * BLOCK_SIZE) as u64, chunk);
        out.extend_from_slice(digest.as_bytes());
    }
}

/// Block-level Merkle tree over an object's data.
///
/// The serialized tree is what gets stored in the object's leading blocks;
/// the root is the object's name.
#[derive(Clone, Debug)]
pub struct MerkleTree {
    root: Digest,
    tree: Vec<u8>,
    data_size: u64,
}

impl MerkleTree {
    /// Build the tree for `data`.
    ///
    /// An empty input produces an empty tree whose root is the digest of the
    /// empty block.
    pub fn from_data(data: &[u8]) -> Self {
        let lengths = level_lengths(data.len() as u64);
        let total: u64 = lengths.iter().sum();
        let mut tree = Vec::with_capacity(total as usize);

        let mut previous: Option<Vec<u8>> = None;
        for (level, &len) in lengths.iter().enumerate() {
            let input = previous.as_deref().unwrap_or(data);
            let mut out = Vec::with_capacity(len as usize);
            hash_level(level as u32, input, &mut out);
            out.resize(len as usize, 0);
            tree.extend_from_slice(&out);
            previous = Some(out);
        }

        let root = match previous {
            Some(top) => NodeHasher::MERKLE.digest(lengths.len() as u32, 0, &top),
            None => NodeHasher::MERKLE.digest(0, 0, &[]),
        };

        Self {
            root,
            tree,
            data_size: data.len() as u64,
        }
    }

    /// The root digest naming the data.
    pub fn root(&self) -> Digest {
        self.root
    }

    /// Serialized tree, levels bottom-up.
    pub fn as_bytes(&self) -> &[u8] {
        &self.tree
    }

    /// Consume the tree, returning its serialized bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.tree
    }

    /// Size of the data the tree covers.
    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    /// Number of blocks the serialized tree occupies.
    pub fn block_count(&self) -> u64 {
        self.tree.len() as u64 / BLOCK_SIZE_U64
    }
}

/// Checks object data against a trusted root.
///
/// The whole tree is validated against the root once, at construction.
/// After that, any data block can be checked by comparing its digest with
/// the corresponding leaf, which is what makes partial verification of
/// individual page ranges possible.
#[derive(Clone, Debug)]
pub struct ContentVerifier {
    root: Digest,
    data_size: u64,
    /// Leaf level of the validated tree: one digest per data block.
    leaves: Vec<u8>,
}

impl ContentVerifier {
    /// Load and validate a tree for `data_size` bytes of data.
    ///
    /// `merkle` may be longer than the tree (it is usually a whole number of
    /// blocks read from disk); trailing bytes are ignored.
    pub fn create(root: Digest, merkle: &[u8], data_size: u64) -> MerkleResult<Self> {
        let lengths = level_lengths(data_size);
        let expected: u64 = lengths.iter().sum();
        if expected > merkle.len() as u64 {
            warn!(
                root = %root.short_hex(),
                expected,
                actual = merkle.len(),
                "merkle tree smaller than data requires"
            );
            return Err(MerkleError::SizeMismatch {
                expected,
                actual: merkle.len() as u64,
            });
        }

        let corrupt = || {
            warn!(root = %root.short_hex(), "merkle tree does not match root");
            MerkleError::TreeCorrupt { root }
        };

        let mut levels = Vec::with_capacity(lengths.len());
        let mut start = 0usize;
        for &len in &lengths {
            levels.push(&merkle[start..start + len as usize]);
            start += len as usize;
        }

        let mut scratch = Vec::with_capacity(BLOCK_SIZE);
        for (i, level) in levels.iter().enumerate() {
            let input_len = if i == 0 { data_size } else { lengths[i - 1] };
            let used = (blocks_for(input_len) * DIGEST_LENGTH as u64) as usize;
            if level[used..].iter().any(|&b| b != 0) {
                return Err(corrupt());
            }
            if let Some(parent) = levels.get(i + 1) {
                scratch.clear();
                hash_level(i as u32 + 1, level, &mut scratch);
                if parent[..scratch.len()] != scratch[..] {
                    return Err(corrupt());
                }
            }
        }

        let computed = match levels.last() {
            Some(top) => NodeHasher::MERKLE.digest(levels.len() as u32, 0, top),
            None => NodeHasher::MERKLE.digest(0, 0, &[]),
        };
        if computed != root {
            return Err(corrupt());
        }

        let leaves = levels.first().map(|l| l.to_vec()).unwrap_or_default();
        Ok(Self {
            root,
            data_size,
            leaves,
        })
    }

    /// The trusted root.
    pub fn root(&self) -> Digest {
        self.root
    }

    /// Size of the data this verifier covers.
    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    /// Verify the whole object. `data` must be exactly `data_size` bytes.
    pub fn verify(&self, data: &[u8]) -> MerkleResult<()> {
        if data.len() as u64 != self.data_size {
            return Err(MerkleError::LengthMismatch {
                expected: self.data_size,
                actual: data.len() as u64,
            });
        }
        self.verify_partial(data, 0)
    }

    /// Verify `data`, which holds the object bytes starting at `offset`.
    ///
    /// `offset` must be block-aligned and the range must either be a whole
    /// number of blocks or end exactly at the end of the data.
    pub fn verify_partial(&self, data: &[u8], offset: u64) -> MerkleResult<()> {
        let length = data.len() as u64;
        if offset % BLOCK_SIZE_U64 != 0 {
            return Err(MerkleError::Unaligned { offset, length });
        }
        let end = offset
            .checked_add(length)
            .filter(|&end| end <= self.data_size)
            .ok_or(MerkleError::OutOfRange {
                offset,
                length,
                data_size: self.data_size,
            })?;
        if length % BLOCK_SIZE_U64 != 0 && end != self.data_size {
            return Err(MerkleError::Unaligned { offset, length });
        }

        for (n, chunk) in data.chunks(BLOCK_SIZE).enumerate() {
            let block_offset = offset + (n * BLOCK_SIZE) as u64;
            let leaf = (block_offset / BLOCK_SIZE_U64) as usize * DIGEST_LENGTH;
            let digest = NodeHasher::MERKLE.digest(0, block_offset, chunk);
            if digest.as_bytes()[..] != self.leaves[leaf..leaf + DIGEST_LENGTH] {
                warn!(
                    root = %self.root.short_hex(),
                    offset = block_offset,
                    "block failed verification"
                );
                return Err(MerkleError::DataIntegrity {
                    offset: block_offset,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn empty_data_has_empty_tree() {
        assert_eq!(tree_length(0), 0);
        let tree = MerkleTree::from_data(&[]);
        assert!(tree.as_bytes().is_empty());
        let verifier = ContentVerifier::create(tree.root(), &[], 0).unwrap();
        verifier.verify(&[]).unwrap();
    }

    #[test]
    fn tree_length_boundaries() {
        assert_eq!(tree_length(1), 4096);
        assert_eq!(tree_length(4096), 4096);
        assert_eq!(tree_length(8192), 4096);
        // 128 leaves fill exactly one node.
        assert_eq!(tree_length(128 * 4096), 4096);
        // 129 leaves spill into a second leaf node plus a parent.
        assert_eq!(tree_length(129 * 4096), 3 * 4096);
        assert_eq!(merkle_block_count(129 * 4096), 3);
    }

    #[test]
    fn built_tree_matches_tree_length() {
        for len in [1usize, 100, 4096, 8192, 9000, 129 * 4096 + 17] {
            let tree = MerkleTree::from_data(&patterned(len));
            assert_eq!(tree.as_bytes().len() as u64, tree_length(len as u64));
            assert_eq!(tree.data_size(), len as u64);
        }
    }

    #[test]
    fn two_block_object_has_one_merkle_block() {
        let data = patterned(8192);
        let tree = MerkleTree::from_data(&data);
        assert_eq!(tree.block_count(), 1);
        let verifier = ContentVerifier::create(tree.root(), tree.as_bytes(), 8192).unwrap();
        verifier.verify(&data).unwrap();
    }

    #[test]
    fn create_rejects_short_tree() {
        let data = patterned(129 * 4096);
        let tree = MerkleTree::from_data(&data);
        let err = ContentVerifier::create(tree.root(), &tree.as_bytes()[..4096], data.len() as u64)
            .unwrap_err();
        assert_eq!(
            err,
            MerkleError::SizeMismatch {
                expected: 3 * 4096,
                actual: 4096
            }
        );
    }

    #[test]
    fn create_rejects_wrong_root() {
        let tree = MerkleTree::from_data(&patterned(5000));
        let other = Digest::from_hash([9; 32]);
        let err = ContentVerifier::create(other, tree.as_bytes(), 5000).unwrap_err();
        assert_eq!(err, MerkleError::TreeCorrupt { root: other });
    }

    #[test]
    fn create_rejects_tampered_leaf() {
        let data = patterned(129 * 4096);
        let tree = MerkleTree::from_data(&data);
        let mut bytes = tree.as_bytes().to_vec();
        bytes[5] ^= 0x01;
        let err = ContentVerifier::create(tree.root(), &bytes, data.len() as u64).unwrap_err();
        assert!(matches!(err, MerkleError::TreeCorrupt { .. }));
    }

    #[test]
    fn create_rejects_nonzero_padding() {
        let data = patterned(8192);
        let tree = MerkleTree::from_data(&data);
        let mut bytes = tree.as_bytes().to_vec();
        // Two leaves use 64 bytes; everything after must be zero.
        bytes[100] = 1;
        let err = ContentVerifier::create(tree.root(), &bytes, 8192).unwrap_err();
        assert!(matches!(err, MerkleError::TreeCorrupt { .. }));
    }

    #[test]
    fn create_ignores_trailing_bytes() {
        let data = patterned(10);
        let tree = MerkleTree::from_data(&data);
        let mut bytes = tree.as_bytes().to_vec();
        bytes.extend_from_slice(&[0xff; 4096]);
        let verifier = ContentVerifier::create(tree.root(), &bytes, 10).unwrap();
        verifier.verify(&data).unwrap();
    }

    #[test]
    fn verify_rejects_wrong_length() {
        let data = patterned(5000);
        let tree = MerkleTree::from_data(&data);
        let verifier = ContentVerifier::create(tree.root(), tree.as_bytes(), 5000).unwrap();
        let err = verifier.verify(&data[..4096]).unwrap_err();
        assert_eq!(
            err,
            MerkleError::LengthMismatch {
                expected: 5000,
                actual: 4096
            }
        );
    }

    #[test]
    fn verify_reports_offending_block() {
        let mut data = patterned(3 * 4096);
        let tree = MerkleTree::from_data(&data);
        let verifier =
            ContentVerifier::create(tree.root(), tree.as_bytes(), data.len() as u64).unwrap();
        data[2 * 4096 + 7] ^= 0xff;
        assert_eq!(
            verifier.verify(&data).unwrap_err(),
            MerkleError::DataIntegrity { offset: 8192 }
        );
    }

    #[test]
    fn verify_partial_alignment_rules() {
        let data = patterned(3 * 4096 + 100);
        let tree = MerkleTree::from_data(&data);
        let verifier =
            ContentVerifier::create(tree.root(), tree.as_bytes(), data.len() as u64).unwrap();

        // Block-aligned middle range.
        verifier.verify_partial(&data[4096..8192], 4096).unwrap();
        // Short tail block ending at the data size.
        verifier.verify_partial(&data[3 * 4096..], 3 * 4096).unwrap();

        assert!(matches!(
            verifier.verify_partial(&data[1..4097], 1),
            Err(MerkleError::Unaligned { .. })
        ));
        assert!(matches!(
            verifier.verify_partial(&data[0..100], 0),
            Err(MerkleError::Unaligned { .. })
        ));
        assert!(matches!(
            verifier.verify_partial(&data[..8192], 3 * 4096),
            Err(MerkleError::OutOfRange { .. })
        ));
    }

    #[test]
    fn verify_partial_rejects_block_at_wrong_offset() {
        let data = patterned(2 * 4096);
        let tree = MerkleTree::from_data(&data);
        let verifier = ContentVerifier::create(tree.root(), tree.as_bytes(), 8192).unwrap();
        // The first block presented as if it were the second.
        let err = verifier.verify_partial(&data[..4096], 4096).unwrap_err();
        assert_eq!(err, MerkleError::DataIntegrity { offset: 4096 });
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn single_byte_mutation_fails(
            data in prop::collection::vec(any::<u8>(), 1..20_000),
            index in any::<prop::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let tree = MerkleTree::from_data(&data);
            let verifier = ContentVerifier::create(tree.root(), tree.as_bytes(), data.len() as u64).unwrap();
            prop_assert!(verifier.verify(&data).is_ok());

            let mut mutated = data.clone();
            let i = index.index(mutated.len());
            mutated[i] ^= flip;
            let is_integrity_error = matches!(
                verifier.verify(&mutated),
                Err(MerkleError::DataIntegrity { .. })
            );
            prop_assert!(is_integrity_error);
        }

        #[test]
        fn partial_matches_whole_on_aligned_ranges(
            data in prop::collection::vec(any::<u8>(), 1..40_000),
            start_block in 0usize..10,
            block_len in 1usize..10,
            corrupt in prop::option::of(any::<prop::sample::Index>()),
        ) {
            let tree = MerkleTree::from_data(&data);
            let verifier = ContentVerifier::create(tree.root(), tree.as_bytes(), data.len() as u64).unwrap();

            let mut candidate = data.clone();
            if let Some(index) = corrupt {
                let i = index.index(candidate.len());
                candidate[i] ^= 0x80;
            }

            let blocks = blocks_for(data.len() as u64) as usize;
            let first = start_block.min(blocks - 1);
            let last = (first + block_len).min(blocks);
            let start = first * BLOCK_SIZE;
            let end = (last * BLOCK_SIZE).min(data.len());

            let partial = verifier.verify_partial(&candidate[start..end], start as u64).is_ok();
            let range_clean = candidate[start..end] == data[start..end];
            prop_assert_eq!(partial, range_clean);
        }
    }
}
