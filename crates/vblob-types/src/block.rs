//! Block geometry shared by every layer.
//!
//! Device blocks, Merkle nodes, and memory pages are all the same size, so a
//! block-aligned range is also page-aligned and hash-aligned.

/// Size of a device block, a Merkle tree node, and a page.
pub const BLOCK_SIZE: usize = 4096;

/// [`BLOCK_SIZE`] as a `u64`, for device and object offsets.
pub const BLOCK_SIZE_U64: u64 = BLOCK_SIZE as u64;

/// Granularity at which paged regions become resident.
pub const PAGE_SIZE: usize = BLOCK_SIZE;

/// Number of blocks needed to hold `bytes`.
pub const fn blocks_for(bytes: u64) -> u64 {
    bytes / BLOCK_SIZE_U64 + (bytes % BLOCK_SIZE_U64 != 0) as u64
}

/// Byte offset of `block`, or `None` if it does not fit in a `u64`.
pub const fn block_offset(block: u64) -> Option<u64> {
    block.checked_mul(BLOCK_SIZE_U64)
}

/// Round `value` up to a multiple of `align`, or `None` on overflow.
///
/// `align` must be non-zero.
pub const fn round_up(value: u64, align: u64) -> Option<u64> {
    let rem = value % align;
    if rem == 0 {
        Some(value)
    } else {
        value.checked_add(align - rem)
    }
}

/// Round `value` down to a multiple of `align`. `align` must be non-zero.
pub const fn round_down(value: u64, align: u64) -> u64 {
    value - value % align
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn blocks_for_boundaries() {
        assert_eq!(blocks_for(0), 0);
        assert_eq!(blocks_for(1), 1);
        assert_eq!(blocks_for(4096), 1);
        assert_eq!(blocks_for(4097), 2);
        assert_eq!(blocks_for(u64::MAX), u64::MAX / 4096 + 1);
    }

    #[test]
    fn block_offset_overflow() {
        assert_eq!(block_offset(2), Some(8192));
        assert_eq!(block_offset(u64::MAX), None);
    }

    #[test]
    fn round_up_overflow_is_none() {
        assert_eq!(round_up(u64::MAX, BLOCK_SIZE_U64), None);
        assert_eq!(round_up(0, BLOCK_SIZE_U64), Some(0));
        assert_eq!(round_up(1, BLOCK_SIZE_U64), Some(4096));
    }

    proptest! {
        #[test]
        fn rounding_brackets_value(value in 0u64..(u64::MAX / 2)) {
            let down = round_down(value, BLOCK_SIZE_U64);
            let up = round_up(value, BLOCK_SIZE_U64).unwrap();
            prop_assert!(down <= value && value <= up);
            prop_assert_eq!(down % BLOCK_SIZE_U64, 0);
            prop_assert_eq!(up % BLOCK_SIZE_U64, 0);
            prop_assert!(up - down <= BLOCK_SIZE_U64);
            prop_assert_eq!(blocks_for(value) * BLOCK_SIZE_U64, up);
        }
    }
}
