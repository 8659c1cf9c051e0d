//! On-disk layout of a seekable archive.
//!
//! ```text
//! 0        8          12           16                 16+32n
//! | magic  | reserved | frame count | seek table ...   | frames ...
//! ```
//!
//! All integers are little-endian. Each seek table entry is four `u64`s:
//! decompressed offset, decompressed length, compressed offset (absolute
//! from the start of the archive), compressed length.

use serde::{Deserialize, Serialize};
use vblob_types::BLOCK_SIZE_U64;

use crate::error::{ArchiveError, ArchiveResult};

/// Archive magic number.
pub const ARCHIVE_MAGIC: u64 = 0x6042_7041_6240_7140;

/// Bytes before the first seek table entry.
pub const HEADER_PREFIX_SIZE: usize = 16;

/// Encoded size of one seek table entry.
pub const SEEK_TABLE_ENTRY_SIZE: usize = 32;

const MAGIC_OFFSET: usize = 0;
const FRAME_COUNT_OFFSET: usize = 12;

/// Size of the header plus seek table for `frames` frames.
pub fn header_size(frames: u32) -> u64 {
    HEADER_PREFIX_SIZE as u64 + SEEK_TABLE_ENTRY_SIZE as u64 * frames as u64
}

/// Location of one frame in both address spaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeekTableEntry {
    pub decompressed_offset: u64,
    pub decompressed_length: u64,
    pub compressed_offset: u64,
    pub compressed_length: u64,
}

impl SeekTableEntry {
    fn encode_into(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.decompressed_offset.to_le_bytes());
        out[8..16].copy_from_slice(&self.decompressed_length.to_le_bytes());
        out[16..24].copy_from_slice(&self.compressed_offset.to_le_bytes());
        out[24..32].copy_from_slice(&self.compressed_length.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Self {
        Self {
            decompressed_offset: read_u64(bytes, 0),
            decompressed_length: read_u64(bytes, 8),
            compressed_offset: read_u64(bytes, 16),
            compressed_length: read_u64(bytes, 24),
        }
    }

    fn decompressed_end(&self) -> Option<u64> {
        self.decompressed_offset.checked_add(self.decompressed_length)
    }

    fn compressed_end(&self) -> Option<u64> {
        self.compressed_offset.checked_add(self.compressed_length)
    }
}

/// Where a decompressed address lives in the compressed stream.
///
/// Returned by lookups; `compressed_offset` is absolute from the start of
/// the archive, so a reader can fetch exactly this frame's bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionMapping {
    pub frame: usize,
    pub compressed_offset: u64,
    pub compressed_length: u64,
    pub decompressed_offset: u64,
    pub decompressed_length: u64,
}

/// Parsed header and seek table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveHeader {
    entries: Vec<SeekTableEntry>,
}

impl ArchiveHeader {
    /// Header over the given seek table entries. Entries are not validated.
    pub fn new(entries: Vec<SeekTableEntry>) -> Self {
        Self { entries }
    }

    /// Size of the header and seek table that `buf` declares, reading only
    /// the fixed prefix.
    pub fn declared_size(buf: &[u8]) -> ArchiveResult<u64> {
        if buf.len() < HEADER_PREFIX_SIZE {
            return Err(ArchiveError::ArchiveTruncated {
                needed: HEADER_PREFIX_SIZE as u64,
                actual: buf.len() as u64,
            });
        }
        check_magic(buf)?;
        Ok(header_size(read_u32(buf, FRAME_COUNT_OFFSET)))
    }

    /// Parse and validate the header at the start of `buf`.
    ///
    /// `buf` needs to hold only the header and seek table, not the frames.
    pub fn parse(buf: &[u8]) -> ArchiveResult<Self> {
        let needed = Self::declared_size(buf)?;
        if needed > buf.len() as u64 {
            return Err(ArchiveError::ArchiveTruncated {
                needed,
                actual: buf.len() as u64,
            });
        }
        let frames = read_u32(buf, FRAME_COUNT_OFFSET) as usize;

        let mut entries = Vec::with_capacity(frames);
        let mut next_decompressed = 0u64;
        let mut next_compressed = needed;
        for i in 0..frames {
            let start = HEADER_PREFIX_SIZE + i * SEEK_TABLE_ENTRY_SIZE;
            let entry = SeekTableEntry::decode(&buf[start..start + SEEK_TABLE_ENTRY_SIZE]);

            if entry.decompressed_length == 0 || entry.compressed_length == 0 {
                return Err(corrupt(format!("frame {i} is empty")));
            }
            if i + 1 < frames && entry.decompressed_length % BLOCK_SIZE_U64 != 0 {
                return Err(corrupt(format!(
                    "frame {i} inflates to {} bytes, not a multiple of {BLOCK_SIZE_U64}",
                    entry.decompressed_length
                )));
            }
            if entry.decompressed_offset != next_decompressed {
                return Err(corrupt(format!(
                    "frame {i} starts at decompressed offset {}, expected {next_decompressed}",
                    entry.decompressed_offset
                )));
            }
            if entry.compressed_offset != next_compressed {
                return Err(corrupt(format!(
                    "frame {i} starts at compressed offset {}, expected {next_compressed}",
                    entry.compressed_offset
                )));
            }
            next_decompressed = entry
                .decompressed_end()
                .ok_or_else(|| corrupt(format!("frame {i} decompressed range overflows")))?;
            next_compressed = entry
                .compressed_end()
                .ok_or_else(|| corrupt(format!("frame {i} compressed range overflows")))?;
            entries.push(entry);
        }

        Ok(Self { entries })
    }

    /// Encode the header and seek table into the front of `out`.
    pub fn write_to(&self, out: &mut [u8]) -> ArchiveResult<usize> {
        let frames = u32::try_from(self.entries.len())
            .map_err(|_| ArchiveError::ArchiveCorrupt("too many frames".into()))?;
        let size = header_size(frames) as usize;
        if out.len() < size {
            return Err(ArchiveError::BufferTooSmall {
                needed: size as u64,
                actual: out.len() as u64,
            });
        }
        out[MAGIC_OFFSET..8].copy_from_slice(&ARCHIVE_MAGIC.to_le_bytes());
        out[8..FRAME_COUNT_OFFSET].fill(0);
        out[FRAME_COUNT_OFFSET..HEADER_PREFIX_SIZE].copy_from_slice(&frames.to_le_bytes());
        for (i, entry) in self.entries.iter().enumerate() {
            let start = HEADER_PREFIX_SIZE + i * SEEK_TABLE_ENTRY_SIZE;
            entry.encode_into(&mut out[start..start + SEEK_TABLE_ENTRY_SIZE]);
        }
        Ok(size)
    }

    /// Seek table entries in frame order.
    pub fn entries(&self) -> &[SeekTableEntry] {
        &self.entries
    }

    /// Number of frames.
    pub fn frame_count(&self) -> usize {
        self.entries.len()
    }

    /// Size of the encoded header and seek table.
    pub fn size(&self) -> u64 {
        header_size(self.entries.len() as u32)
    }

    /// Total size of the data once decompressed.
    pub fn decompressed_size(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.decompressed_offset + e.decompressed_length)
            .unwrap_or(0)
    }

    /// Total size of the archive: header, table, and every frame.
    pub fn compressed_size(&self) -> u64 {
        self.size() + self.entries.iter().map(|e| e.compressed_length).sum::<u64>()
    }

    /// Find the frame containing decompressed byte `offset`.
    pub fn lookup(&self, offset: u64) -> Option<CompressionMapping> {
        let index = self
            .entries
            .partition_point(|e| e.decompressed_offset + e.decompressed_length <= offset);
        let entry = self.entries.get(index)?;
        Some(CompressionMapping {
            frame: index,
            compressed_offset: entry.compressed_offset,
            compressed_length: entry.compressed_length,
            decompressed_offset: entry.decompressed_offset,
            decompressed_length: entry.decompressed_length,
        })
    }
}

fn check_magic(buf: &[u8]) -> ArchiveResult<()> {
    let magic = read_u64(buf, MAGIC_OFFSET);
    if magic != ARCHIVE_MAGIC {
        return Err(corrupt(format!("bad magic {magic:#018x}")));
    }
    Ok(())
}

fn corrupt(reason: String) -> ArchiveError {
    ArchiveError::ArchiveCorrupt(reason)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_frames() -> ArchiveHeader {
        let base = header_size(2);
        ArchiveHeader::new(vec![
            SeekTableEntry {
                decompressed_offset: 0,
                decompressed_length: 8192,
                compressed_offset: base,
                compressed_length: 10,
            },
            SeekTableEntry {
                decompressed_offset: 8192,
                decompressed_length: 50,
                compressed_offset: base + 10,
                compressed_length: 7,
            },
        ])
    }

    fn encoded(header: &ArchiveHeader) -> Vec<u8> {
        let mut buf = vec![0u8; header.size() as usize];
        header.write_to(&mut buf).unwrap();
        buf
    }

    #[test]
    fn layout_is_little_endian() {
        let buf = encoded(&two_frames());
        assert_eq!(&buf[0..8], &ARCHIVE_MAGIC.to_le_bytes());
        assert_eq!(&buf[8..12], &[0, 0, 0, 0]);
        assert_eq!(&buf[12..16], &2u32.to_le_bytes());
        assert_eq!(&buf[16 + 8..16 + 16], &8192u64.to_le_bytes());
        assert_eq!(&buf[16 + 16..16 + 24], &header_size(2).to_le_bytes());
    }

    #[test]
    fn parse_encoded_header() {
        let header = two_frames();
        let parsed = ArchiveHeader::parse(&encoded(&header)).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.decompressed_size(), 8242);
        assert_eq!(parsed.compressed_size(), header_size(2) + 17);
    }

    #[test]
    fn empty_archive_is_bare_header() {
        let header = ArchiveHeader::new(Vec::new());
        let buf = encoded(&header);
        assert_eq!(buf.len(), HEADER_PREFIX_SIZE);
        let parsed = ArchiveHeader::parse(&buf).unwrap();
        assert_eq!(parsed.frame_count(), 0);
        assert_eq!(parsed.decompressed_size(), 0);
        assert!(parsed.lookup(0).is_none());
    }

    #[test]
    fn truncated_seek_table_is_rejected() {
        let buf = encoded(&two_frames());
        let err = ArchiveHeader::parse(&buf[..40]).unwrap_err();
        assert_eq!(
            err,
            ArchiveError::ArchiveTruncated {
                needed: header_size(2),
                actual: 40
            }
        );
    }

    #[test]
    fn huge_frame_count_does_not_read_out_of_bounds() {
        let mut buf = encoded(&two_frames());
        buf[12..16].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            ArchiveHeader::parse(&buf),
            Err(ArchiveError::ArchiveTruncated { .. })
        ));
    }

    #[test]
    fn short_prefix_is_truncated() {
        assert!(matches!(
            ArchiveHeader::parse(&[0u8; 8]),
            Err(ArchiveError::ArchiveTruncated { .. })
        ));
    }

    #[test]
    fn bad_magic_is_corrupt() {
        let mut buf = encoded(&two_frames());
        buf[0] ^= 0xff;
        assert!(matches!(
            ArchiveHeader::parse(&buf),
            Err(ArchiveError::ArchiveCorrupt(_))
        ));
    }

    #[test]
    fn gap_in_decompressed_range_is_corrupt() {
        let mut header = two_frames();
        header.entries[1].decompressed_offset = 8193;
        assert!(matches!(
            ArchiveHeader::parse(&encoded(&header)),
            Err(ArchiveError::ArchiveCorrupt(_))
        ));
    }

    #[test]
    fn overlapping_compressed_range_is_corrupt() {
        let mut header = two_frames();
        header.entries[1].compressed_offset -= 1;
        assert!(matches!(
            ArchiveHeader::parse(&encoded(&header)),
            Err(ArchiveError::ArchiveCorrupt(_))
        ));
    }

    #[test]
    fn overflowing_entry_is_corrupt() {
        let mut header = two_frames();
        header.entries[1].decompressed_length = u64::MAX;
        assert!(matches!(
            ArchiveHeader::parse(&encoded(&header)),
            Err(ArchiveError::ArchiveCorrupt(_))
        ));
    }

    #[test]
    fn unaligned_inner_frame_is_corrupt() {
        let mut header = two_frames();
        header.entries[0].decompressed_length = 100;
        header.entries[1].decompressed_offset = 100;
        header.entries[1].decompressed_length = 12188;
        assert!(matches!(
            ArchiveHeader::parse(&encoded(&header)),
            Err(ArchiveError::ArchiveCorrupt(_))
        ));
    }

    #[test]
    fn short_last_frame_is_allowed() {
        let mut header = two_frames();
        header.entries[1].decompressed_length = 1;
        assert_eq!(ArchiveHeader::parse(&encoded(&header)).unwrap().decompressed_size(), 8193);
    }

    #[test]
    fn empty_frame_is_corrupt() {
        let mut header = two_frames();
        header.entries[0].compressed_length = 0;
        assert!(matches!(
            ArchiveHeader::parse(&encoded(&header)),
            Err(ArchiveError::ArchiveCorrupt(_))
        ));
    }

    #[test]
    fn lookup_finds_covering_frame() {
        let header = two_frames();
        assert_eq!(header.lookup(0).unwrap().frame, 0);
        assert_eq!(header.lookup(8191).unwrap().frame, 0);
        let second = header.lookup(8192).unwrap();
        assert_eq!(second.frame, 1);
        assert_eq!(second.compressed_offset, header_size(2) + 10);
        assert_eq!(header.lookup(8241).unwrap().frame, 1);
        assert!(header.lookup(8242).is_none());
    }

    #[test]
    fn write_to_small_buffer_fails() {
        let mut buf = [0u8; 20];
        assert!(matches!(
            two_frames().write_to(&mut buf),
            Err(ArchiveError::BufferTooSmall { .. })
        ));
    }
}
