use tracing::warn;

use crate::error::{ArchiveError, ArchiveResult};
use crate::format::{ArchiveHeader, CompressionMapping, SeekTableEntry};

/// Random access into compressed data.
pub trait SeekableDecompressor: Send + Sync {
    /// Decompress the frame covering `offset` into `dst`, given the whole
    /// archive in `src`. Returns the number of bytes written, which is the
    /// frame's decompressed length.
    fn decompress_range(&self, dst: &mut [u8], src: &[u8], offset: u64) -> ArchiveResult<usize>;

    /// Where decompressed byte `offset` lives in the compressed stream.
    fn mapping_for_decompressed_address(&self, offset: u64) -> ArchiveResult<CompressionMapping>;

    /// Total decompressed size.
    fn decompressed_size(&self) -> u64;
}

/// Reader for archives produced by
/// [`StreamingCompressor`](crate::StreamingCompressor).
#[derive(Clone, Debug)]
pub struct ChunkedDecompressor {
    header: ArchiveHeader,
}

impl ChunkedDecompressor {
    /// Parse the header at the front of `header_bytes`.
    ///
    /// Only the header and seek table need to be present.
    pub fn new(header_bytes: &[u8]) -> ArchiveResult<Self> {
        Ok(Self {
            header: ArchiveHeader::parse(header_bytes)?,
        })
    }

    /// Wrap an already parsed header.
    pub fn from_header(header: ArchiveHeader) -> Self {
        Self { header }
    }

    /// The parsed header.
    pub fn header(&self) -> &ArchiveHeader {
        &self.header
    }

    /// Size of the whole archive, header included.
    pub fn compressed_size(&self) -> u64 {
        self.header.compressed_size()
    }

    /// Decompress every frame of `src` into `dst`. Returns the number of
    /// bytes written.
    pub fn decompress_full(&self, dst: &mut [u8], src: &[u8]) -> ArchiveResult<usize> {
        let compressed_size = self.header.compressed_size();
        if (src.len() as u64) < compressed_size {
            return Err(ArchiveError::ArchiveTruncated {
                needed: compressed_size,
                actual: src.len() as u64,
            });
        }
        let size = self.header.decompressed_size();
        if (dst.len() as u64) < size {
            return Err(ArchiveError::BufferTooSmall {
                needed: size,
                actual: dst.len() as u64,
            });
        }

        for (index, entry) in self.header.entries().iter().enumerate() {
            let (co, cl) = (entry.compressed_offset as usize, entry.compressed_length as usize);
            let (dof, dl) = (
                entry.decompressed_offset as usize,
                entry.decompressed_length as usize,
            );
            self.decompress_frame(index, &src[co..co + cl], &mut dst[dof..dof + dl])?;
        }
        Ok(size as usize)
    }

    /// Decompress a whole archive into a new buffer.
    pub fn decompress_bytes(src: &[u8]) -> ArchiveResult<Vec<u8>> {
        let decompressor = Self::new(src)?;
        let mut out = vec![0u8; decompressor.decompressed_size() as usize];
        decompressor.decompress_full(&mut out, src)?;
        Ok(out)
    }

    /// Decompress frame `index` from its compressed bytes alone.
    ///
    /// `frame_src` must start at the frame; bytes past its compressed length
    /// are ignored. Returns the frame's decompressed length.
    pub fn decompress_frame(
        &self,
        index: usize,
        frame_src: &[u8],
        dst: &mut [u8],
    ) -> ArchiveResult<usize> {
        let entry = self.entry(index)?;
        let cl = entry.compressed_length as usize;
        let dl = entry.decompressed_length as usize;
        if frame_src.len() < cl {
            return Err(ArchiveError::ArchiveTruncated {
                needed: cl as u64,
                actual: frame_src.len() as u64,
            });
        }
        if dst.len() < dl {
            return Err(ArchiveError::BufferTooSmall {
                needed: dl as u64,
                actual: dst.len() as u64,
            });
        }

        let n = zstd::bulk::decompress_to_buffer(&frame_src[..cl], &mut dst[..dl]).map_err(|e| {
            warn!(frame = index, error = %e, "frame failed to decompress");
            ArchiveError::Decompression(e.to_string())
        })?;
        if n != dl {
            warn!(frame = index, expected = dl, actual = n, "frame size mismatch");
            return Err(ArchiveError::ArchiveCorrupt(format!(
                "frame {index} inflated to {n} bytes, expected {dl}"
            )));
        }
        Ok(n)
    }

    fn entry(&self, index: usize) -> ArchiveResult<&SeekTableEntry> {
        self.header
            .entries()
            .get(index)
            .ok_or_else(|| ArchiveError::ArchiveCorrupt(format!("no frame {index}")))
    }
}

impl SeekableDecompressor for ChunkedDecompressor {
    fn decompress_range(&self, dst: &mut [u8], src: &[u8], offset: u64) -> ArchiveResult<usize> {
        let mapping = self.mapping_for_decompressed_address(offset)?;
        let start = mapping.compressed_offset as usize;
        let end = start + mapping.compressed_length as usize;
        if src.len() < end {
            return Err(ArchiveError::ArchiveTruncated {
                needed: end as u64,
                actual: src.len() as u64,
            });
        }
        self.decompress_frame(mapping.frame, &src[start..end], dst)
    }

    fn mapping_for_decompressed_address(&self, offset: u64) -> ArchiveResult<CompressionMapping> {
        self.header.lookup(offset).ok_or(ArchiveError::OutOfRange {
            offset,
            size: self.header.decompressed_size(),
        })
    }

    fn decompressed_size(&self) -> u64 {
        self.header.decompressed_size()
    }
}
