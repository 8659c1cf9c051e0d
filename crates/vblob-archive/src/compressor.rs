use tracing::debug;

use crate::error::{ArchiveError, ArchiveResult};
use crate::format::{header_size, ArchiveHeader, SeekTableEntry};
use crate::params::{frame_count, CompressionParams, DEFAULT_LEVEL};

/// Receives `(bytes_read, bytes_total, bytes_written)` after each frame.
pub type ProgressCallback<'a> = Box<dyn FnMut(u64, u64, u64) + Send + 'a>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Uninitialized,
    Initialized,
    Accumulating,
    Finalized,
}

/// Incremental producer of a seekable archive.
///
/// Input is cut into fixed-size chunks and each chunk becomes an
/// independent zstd frame, so the bytes produced depend only on the input
/// and the parameters, never on how the input was split across `update`
/// calls. Frames are written after room reserved for the header, which is
/// filled in by [`finalize`](Self::finalize).
pub struct StreamingCompressor<'a> {
    state: State,
    level: i32,
    params: CompressionParams,
    dst: Option<&'a mut [u8]>,
    compressor: Option<zstd::bulk::Compressor<'static>>,
    input_size: u64,
    bytes_read: u64,
    written: u64,
    pending: Vec<u8>,
    entries: Vec<SeekTableEntry>,
    progress: Option<ProgressCallback<'a>>,
}

impl<'a> StreamingCompressor<'a> {
    /// Compressor at the default level.
    pub fn new() -> Self {
        Self::with_level(DEFAULT_LEVEL)
    }

    /// Compressor at a specific zstd level.
    pub fn with_level(level: i32) -> Self {
        Self {
            state: State::Uninitialized,
            level,
            params: CompressionParams::for_input_size(0).with_level(level),
            dst: None,
            compressor: None,
            input_size: 0,
            bytes_read: 0,
            written: 0,
            pending: Vec::new(),
            entries: Vec::new(),
            progress: None,
        }
    }

    /// Install a progress callback.
    pub fn set_progress_callback(&mut self, callback: ProgressCallback<'a>) {
        self.progress = Some(callback);
    }

    /// Worst-case output size for `input_size` bytes at this level.
    pub fn compute_output_limit(&self, input_size: u64) -> ArchiveResult<u64> {
        CompressionParams::for_input_size(input_size)
            .with_level(self.level)
            .output_limit(input_size)
            .ok_or(ArchiveError::InputTooLarge { size: input_size })
    }

    /// Prepare to compress exactly `input_size` bytes into `dst`.
    pub fn init(&mut self, input_size: u64, dst: &'a mut [u8]) -> ArchiveResult<()> {
        if self.state != State::Uninitialized {
            return Err(ArchiveError::BadState("init called twice"));
        }
        let limit = self.compute_output_limit(input_size)?;
        if (dst.len() as u64) < limit {
            return Err(ArchiveError::BufferTooSmall {
                needed: limit,
                actual: dst.len() as u64,
            });
        }

        let params = CompressionParams::for_input_size(input_size).with_level(self.level);
        let compressor = zstd::bulk::Compressor::new(params.level)
            .map_err(|e| ArchiveError::Compression(e.to_string()))?;
        let frames = frame_count(input_size, params.chunk_size);

        self.params = params;
        self.compressor = Some(compressor);
        self.dst = Some(dst);
        self.input_size = input_size;
        self.written = header_size(frames as u32);
        self.pending = Vec::with_capacity(params.chunk_size.min(input_size as usize));
        self.entries = Vec::with_capacity(frames as usize);
        self.state = State::Initialized;
        Ok(())
    }

    /// Feed the next `data` bytes of input.
    pub fn update(&mut self, mut data: &[u8]) -> ArchiveResult<()> {
        match self.state {
            State::Initialized | State::Accumulating => {}
            State::Uninitialized => return Err(ArchiveError::BadState("update before init")),
            State::Finalized => return Err(ArchiveError::BadState("update after finalize")),
        }
        let remaining = self.input_size - self.bytes_read;
        if data.len() as u64 > remaining {
            return Err(ArchiveError::BadState("more input than declared"));
        }
        self.state = State::Accumulating;

        while !data.is_empty() {
            let frame_target = self.current_frame_len();
            let take = (frame_target - self.pending.len()).min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            self.bytes_read += take as u64;
            data = &data[take..];
            if self.pending.len() == frame_target {
                self.flush_frame()?;
            }
        }
        Ok(())
    }

    /// Write the header and seek table. Returns the total archive size.
    pub fn finalize(&mut self) -> ArchiveResult<u64> {
        match self.state {
            State::Initialized | State::Accumulating => {}
            State::Uninitialized => return Err(ArchiveError::BadState("finalize before init")),
            State::Finalized => return Err(ArchiveError::BadState("finalize called twice")),
        }
        if self.bytes_read != self.input_size {
            return Err(ArchiveError::BadState("finalize before all input arrived"));
        }
        let dst = self
            .dst
            .as_deref_mut()
            .ok_or(ArchiveError::BadState("no output buffer"))?;
        let header = ArchiveHeader::new(std::mem::take(&mut self.entries));
        header.write_to(dst)?;
        self.state = State::Finalized;

        debug!(
            input = self.input_size,
            output = self.written,
            frames = header.frame_count(),
            chunk_size = self.params.chunk_size,
            "archive finalized"
        );
        Ok(self.written)
    }

    /// Decompressed length of the frame currently being filled.
    fn current_frame_len(&self) -> usize {
        let frame_start = self.bytes_read - self.pending.len() as u64;
        (self.input_size - frame_start).min(self.params.chunk_size as u64) as usize
    }

    fn flush_frame(&mut self) -> ArchiveResult<()> {
        let (Some(compressor), Some(dst)) = (self.compressor.as_mut(), self.dst.as_deref_mut())
        else {
            return Err(ArchiveError::BadState("compressor not initialized"));
        };
        let out = &mut dst[self.written as usize..];
        let n = compressor
            .compress_to_buffer(&self.pending, out)
            .map_err(|e| ArchiveError::Compression(e.to_string()))?;

        let decompressed_offset = self.bytes_read - self.pending.len() as u64;
        self.entries.push(SeekTableEntry {
            decompressed_offset,
            decompressed_length: self.pending.len() as u64,
            compressed_offset: self.written,
            compressed_length: n as u64,
        });
        self.written += n as u64;
        self.pending.clear();

        if let Some(progress) = self.progress.as_mut() {
            progress(self.bytes_read, self.input_size, self.written);
        }
        Ok(())
    }
}

impl Default for StreamingCompressor<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Compress `data` into a new archive at `level`.
pub fn compress_bytes(data: &[u8], level: i32) -> ArchiveResult<Vec<u8>> {
    let limit = StreamingCompressor::with_level(level).compute_output_limit(data.len() as u64)?;
    let mut out = vec![0u8; limit as usize];
    let size = {
        let mut compressor = StreamingCompressor::with_level(level);
        compressor.init(data.len() as u64, &mut out)?;
        compressor.update(data)?;
        compressor.finalize()?
    };
    out.truncate(size as usize);
    Ok(out)
}
