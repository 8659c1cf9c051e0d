use serde::{Deserialize, Serialize};
use vblob_types::NodeIndex;

use crate::error::{StoreError, StoreResult};

/// A run of contiguous device blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub start: u64,
    pub length: u64,
}

impl Extent {
    pub fn new(start: u64, length: u64) -> Self {
        Self { start, length }
    }
}

/// Walks an object's blocks in object order, yielding contiguous device
/// runs.
#[derive(Clone, Debug)]
pub struct BlockIterator {
    node: NodeIndex,
    extents: Vec<Extent>,
    extent: usize,
    within: u64,
    object_block: u64,
}

impl BlockIterator {
    pub fn new(node: NodeIndex, extents: Vec<Extent>) -> Self {
        Self {
            node,
            extents,
            extent: 0,
            within: 0,
            object_block: 0,
        }
    }

    /// Object block the iterator is positioned at.
    pub fn position(&self) -> u64 {
        self.object_block
    }

    /// Advance past `blocks` object blocks.
    pub fn skip(&mut self, mut blocks: u64) -> StoreResult<()> {
        while blocks > 0 {
            let (_, run) = self.next_run(blocks)?;
            blocks -= run;
        }
        Ok(())
    }

    /// Next contiguous run of at most `max_blocks` blocks, as
    /// `(device_block, length)`.
    pub fn next_run(&mut self, max_blocks: u64) -> StoreResult<(u64, u64)> {
        loop {
            let Some(extent) = self.extents.get(self.extent) else {
                return Err(StoreError::ExtentsExhausted {
                    node: self.node,
                    block: self.object_block,
                });
            };
            let left = extent.length - self.within;
            if left == 0 {
                self.extent += 1;
                self.within = 0;
                continue;
            }
            let run = left.min(max_blocks);
            let device_block = extent.start + self.within;
            self.within += run;
            self.object_block += run;
            return Ok((device_block, run));
        }
    }
}

/// Feed `block_count` blocks from `iter` to `emit` as
/// `(target_block, device_block, length)` runs, starting at `target_block`.
pub fn stream_blocks<F>(
    iter: &mut BlockIterator,
    mut target_block: u64,
    mut block_count: u64,
    mut emit: F,
) -> StoreResult<()>
where
    F: FnMut(u64, u64, u64) -> StoreResult<()>,
{
    while block_count > 0 {
        let (device_block, run) = iter.next_run(block_count)?;
        emit(target_block, device_block, run)?;
        target_block += run;
        block_count -= run;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fragmented() -> Vec<Extent> {
        vec![Extent::new(10, 3), Extent::new(0, 0), Extent::new(50, 2)]
    }

    #[test]
    fn runs_respect_extent_boundaries() {
        let mut iter = BlockIterator::new(1, fragmented());
        assert_eq!(iter.next_run(10).unwrap(), (10, 3));
        assert_eq!(iter.next_run(10).unwrap(), (50, 2));
        assert_eq!(iter.position(), 5);
        assert!(matches!(
            iter.next_run(1),
            Err(StoreError::ExtentsExhausted { node: 1, block: 5 })
        ));
    }

    #[test]
    fn skip_lands_inside_extent() {
        let mut iter = BlockIterator::new(1, fragmented());
        iter.skip(4).unwrap();
        assert_eq!(iter.next_run(10).unwrap(), (51, 1));
    }

    #[test]
    fn stream_splits_across_extents() {
        let mut iter = BlockIterator::new(1, fragmented());
        iter.skip(1).unwrap();
        let mut runs = Vec::new();
        stream_blocks(&mut iter, 7, 3, |t, d, n| {
            runs.push((t, d, n));
            Ok(())
        })
        .unwrap();
        assert_eq!(runs, vec![(7, 11, 2), (9, 50, 1)]);
    }

    #[test]
    fn stream_past_end_fails() {
        let mut iter = BlockIterator::new(4, vec![Extent::new(0, 2)]);
        let err = stream_blocks(&mut iter, 0, 3, |_, _, _| Ok(())).unwrap_err();
        assert!(matches!(err, StoreError::ExtentsExhausted { node: 4, .. }));
    }

    proptest! {
        #[test]
        fn streamed_runs_match_flat_layout(
            lengths in prop::collection::vec(0u64..6, 1..8),
            skip in 0u64..10,
            count in 0u64..10,
        ) {
            let mut extents = Vec::new();
            let mut flat = Vec::new();
            let mut next_start = 100;
            for len in lengths {
                extents.push(Extent::new(next_start, len));
                flat.extend(next_start..next_start + len);
                next_start += len + 7;
            }
            let total = flat.len() as u64;
            let skip = skip.min(total);
            let count = count.min(total - skip);

            let mut iter = BlockIterator::new(0, extents);
            iter.skip(skip).unwrap();
            let mut seen = Vec::new();
            stream_blocks(&mut iter, skip, count, |t, d, n| {
                for i in 0..n {
                    seen.push((t + i, d + i));
                }
                Ok(())
            })
            .unwrap();

            let expected: Vec<(u64, u64)> = (skip..skip + count)
                .map(|b| (b, flat[b as usize]))
                .collect();
            prop_assert_eq!(seen, expected);
        }
    }
}
