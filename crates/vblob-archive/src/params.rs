use serde::{Deserialize, Serialize};

use crate::format::header_size;

/// Default zstd compression level.
pub const DEFAULT_LEVEL: i32 = 3;

/// Smallest chunk size the policy picks.
pub const MIN_CHUNK_SIZE: usize = 128 * 1024;

/// Largest chunk size the policy picks.
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

/// Chunk size for an input of `input_size` bytes.
///
/// Larger inputs use larger chunks so the seek table stays small; smaller
/// inputs use smaller chunks so a page fault inflates less data.
pub fn chunk_size_for(input_size: u64) -> usize {
    match input_size {
        s if s <= MIB => MIN_CHUNK_SIZE,
        s if s <= 16 * MIB => 256 * KIB as usize,
        s if s <= 64 * MIB => 512 * KIB as usize,
        _ => MAX_CHUNK_SIZE,
    }
}

/// Number of frames an input of `input_size` bytes is split into.
pub fn frame_count(input_size: u64, chunk_size: usize) -> u64 {
    input_size.div_ceil(chunk_size as u64)
}

/// Tunables for the chunked compressor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionParams {
    /// zstd level.
    pub level: i32,
    /// Decompressed size of every frame but the last.
    pub chunk_size: usize,
}

impl CompressionParams {
    /// Parameters for `input_size` bytes at the default level.
    pub fn for_input_size(input_size: u64) -> Self {
        Self {
            level: DEFAULT_LEVEL,
            chunk_size: chunk_size_for(input_size),
        }
    }

    /// Same parameters at a different level.
    pub fn with_level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }

    /// Worst-case archive size for `input_size` bytes with these parameters.
    ///
    /// Returns `None` if the bound does not fit in a `u64`.
    pub fn output_limit(&self, input_size: u64) -> Option<u64> {
        let frames = frame_count(input_size, self.chunk_size);
        let frames_u32 = u32::try_from(frames).ok()?;
        let per_frame = zstd::zstd_safe::compress_bound(self.chunk_size) as u64;
        per_frame
            .checked_mul(frames)?
            .checked_add(header_size(frames_u32))
    }
}

/// Worst-case archive size for `input_size` bytes under the default policy.
pub fn compute_output_limit(input_size: u64) -> Option<u64> {
    CompressionParams::for_input_size(input_size).output_limit(input_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::HEADER_PREFIX_SIZE;

    #[test]
    fn chunk_policy_thresholds() {
        assert_eq!(chunk_size_for(0), 128 * 1024);
        assert_eq!(chunk_size_for(MIB), 128 * 1024);
        assert_eq!(chunk_size_for(MIB + 1), 256 * 1024);
        assert_eq!(chunk_size_for(16 * MIB), 256 * 1024);
        assert_eq!(chunk_size_for(16 * MIB + 1), 512 * 1024);
        assert_eq!(chunk_size_for(64 * MIB), 512 * 1024);
        assert_eq!(chunk_size_for(64 * MIB + 1), 1024 * 1024);
        assert_eq!(chunk_size_for(u64::MAX), MAX_CHUNK_SIZE);
    }

    #[test]
    fn empty_input_limit_is_bare_header() {
        assert_eq!(compute_output_limit(0), Some(HEADER_PREFIX_SIZE as u64));
    }

    #[test]
    fn limit_grows_with_frames() {
        let one = compute_output_limit(1).unwrap();
        let two = compute_output_limit(MIN_CHUNK_SIZE as u64 + 1).unwrap();
        assert!(one > MIN_CHUNK_SIZE as u64);
        assert!(two > one);
    }

    #[test]
    fn absurd_input_has_no_limit() {
        assert_eq!(compute_output_limit(u64::MAX), None);
    }
}
