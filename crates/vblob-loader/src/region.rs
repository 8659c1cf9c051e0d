use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use tracing::trace;
use vblob_store::{BlockTarget, StoreError, StoreResult};
use vblob_types::{blocks_for, round_down, BLOCK_SIZE, BLOCK_SIZE_U64, PAGE_SIZE};

use crate::error::{LoaderError, LoaderResult};

/// Supplies pages of a paged region on first access.
///
/// Called with the page-aligned range of non-resident pages a read
/// touched. On success every page of that range must be resident.
pub trait PageFaultHandler: Send + Sync {
    fn on_fault(&self, region: &MemoryRegion, offset: u64, length: u64) -> LoaderResult<()>;
}

enum Backing {
    Owned,
    Paged {
        resident: Mutex<Vec<bool>>,
        handler: Arc<dyn PageFaultHandler>,
    },
}

/// A named byte buffer the loader fills and hands out.
///
/// Owned regions are plain memory. Paged regions start with no resident
/// pages; reading a non-resident page invokes the region's
/// [`PageFaultHandler`], which must supply verified contents before the
/// read proceeds.
pub struct MemoryRegion {
    name: String,
    size: u64,
    bytes: RwLock<Vec<u8>>,
    backing: Backing,
}

impl MemoryRegion {
    /// Zeroed owned region of `size` bytes.
    ///
    /// Fails with `AllocationFailed` if the memory cannot be reserved.
    pub fn new_owned(name: impl Into<String>, size: usize) -> LoaderResult<Self> {
        let name = name.into();
        Ok(Self {
            bytes: RwLock::new(zeroed(size).ok_or_else(|| alloc_failed(&name, size as u64))?),
            size: size as u64,
            name,
            backing: Backing::Owned,
        })
    }

    /// Owned region of `size` bytes backed by whole pages, so block reads
    /// can land in it. Bytes past `size` are not part of its contents.
    pub fn new_owned_padded(name: impl Into<String>, size: usize) -> LoaderResult<Self> {
        let name = name.into();
        let capacity = page_aligned(size);
        Ok(Self {
            bytes: RwLock::new(zeroed(capacity).ok_or_else(|| alloc_failed(&name, size as u64))?),
            size: size as u64,
            name,
            backing: Backing::Owned,
        })
    }

    /// Paged region of `size` bytes, backed by whole pages, with nothing
    /// resident.
    pub fn new_paged(
        name: impl Into<String>,
        size: u64,
        handler: Arc<dyn PageFaultHandler>,
    ) -> LoaderResult<Self> {
        let name = name.into();
        let pages = blocks_for(size);
        let capacity = usize::try_from(pages)
            .ok()
            .and_then(|p| p.checked_mul(PAGE_SIZE))
            .ok_or_else(|| alloc_failed(&name, size))?;
        Ok(Self {
            bytes: RwLock::new(zeroed(capacity).ok_or_else(|| alloc_failed(&name, size))?),
            size,
            backing: Backing::Paged {
                resident: Mutex::new(vec![false; pages as usize]),
                handler,
            },
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Logical size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns `true` if the region is served by a fault handler.
    pub fn is_paged(&self) -> bool {
        matches!(self.backing, Backing::Paged { .. })
    }

    /// Run `f` over the raw buffer without faulting anything in.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.bytes.read().expect("lock poisoned"))
    }

    /// Run `f` over the raw buffer mutably.
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.bytes.write().expect("lock poisoned"))
    }

    /// Copy of the logical contents. Faults in every page of a paged region.
    pub fn to_vec(&self) -> LoaderResult<Vec<u8>> {
        let mut out = vec![0u8; self.size as usize];
        self.read_at(0, &mut out)?;
        Ok(out)
    }

    /// Copy `buf.len()` bytes starting at `offset` into `buf`, faulting in
    /// any non-resident pages first.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> LoaderResult<()> {
        let length = buf.len() as u64;
        let end = offset
            .checked_add(length)
            .filter(|&end| end <= self.size)
            .ok_or(LoaderError::FaultOutOfRange {
                offset,
                length,
                size: self.size,
            })?;
        if length == 0 {
            return Ok(());
        }

        if let Backing::Paged { resident, handler } = &self.backing {
            let first = offset / BLOCK_SIZE_U64;
            let last = blocks_for(end);
            let runs = missing_runs(&resident.lock().expect("lock poisoned"), first, last);
            for (start, count) in runs {
                trace!(region = %self.name, page = start, count, "page fault");
                handler.on_fault(self, start * BLOCK_SIZE_U64, count * BLOCK_SIZE_U64)?;
            }
            let resident = resident.lock().expect("lock poisoned");
            if let Some(page) = (first..last).find(|&p| !resident[p as usize]) {
                return Err(LoaderError::PageNotSupplied {
                    offset: page * BLOCK_SIZE_U64,
                });
            }
        }

        let bytes = self.bytes.read().expect("lock poisoned");
        buf.copy_from_slice(&bytes[offset as usize..end as usize]);
        Ok(())
    }

    /// Install verified contents at page-aligned `offset` and mark the
    /// pages they cover resident.
    ///
    /// A trailing partial page is marked resident only if it is the last
    /// page of the region.
    pub fn supply_pages(&self, offset: u64, data: &[u8]) -> LoaderResult<()> {
        let length = data.len() as u64;
        let mut bytes = self.bytes.write().expect("lock poisoned");
        let capacity = bytes.len() as u64;
        let end = offset
            .checked_add(length)
            .filter(|&end| offset % BLOCK_SIZE_U64 == 0 && end <= capacity)
            .ok_or(LoaderError::FaultOutOfRange {
                offset,
                length,
                size: self.size,
            })?;
        bytes[offset as usize..end as usize].copy_from_slice(data);

        if let Backing::Paged { resident, .. } = &self.backing {
            let mut resident = resident.lock().expect("lock poisoned");
            let full_end = if end >= self.size {
                resident.len() as u64
            } else {
                end / BLOCK_SIZE_U64
            };
            for page in offset / BLOCK_SIZE_U64..full_end {
                resident[page as usize] = true;
            }
        }
        Ok(())
    }

    /// Zero the pages overlapping `[offset, offset + length)`. Paged regions
    /// also drop those pages from the resident set.
    pub fn decommit(&self, offset: u64, length: u64) {
        let mut bytes = self.bytes.write().expect("lock poisoned");
        let capacity = bytes.len() as u64;
        let start = round_down(offset, BLOCK_SIZE_U64).min(capacity);
        let end = offset
            .saturating_add(length)
            .div_ceil(BLOCK_SIZE_U64)
            .saturating_mul(BLOCK_SIZE_U64)
            .min(capacity);
        if start >= end {
            return;
        }
        bytes[start as usize..end as usize].fill(0);

        if let Backing::Paged { resident, .. } = &self.backing {
            let mut resident = resident.lock().expect("lock poisoned");
            for page in start / BLOCK_SIZE_U64..blocks_for(end) {
                resident[page as usize] = false;
            }
        }
    }

    /// Number of resident pages. Owned regions are fully resident.
    pub fn resident_pages(&self) -> u64 {
        match &self.backing {
            Backing::Owned => blocks_for(self.size),
            Backing::Paged { resident, .. } => resident
                .lock()
                .expect("lock poisoned")
                .iter()
                .filter(|&&r| r)
                .count() as u64,
        }
    }

    /// Returns `true` if the page holding `offset` is resident.
    pub fn is_resident(&self, offset: u64) -> bool {
        match &self.backing {
            Backing::Owned => offset < self.size,
            Backing::Paged { resident, .. } => resident
                .lock()
                .expect("lock poisoned")
                .get((offset / BLOCK_SIZE_U64) as usize)
                .copied()
                .unwrap_or(false),
        }
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("paged", &self.is_paged())
            .finish()
    }
}

impl BlockTarget for MemoryRegion {
    fn size(&self) -> u64 {
        self.bytes.read().expect("lock poisoned").len() as u64
    }

    fn write_at(&self, offset: u64, src: &[u8]) -> StoreResult<()> {
        let mut bytes = self.bytes.write().expect("lock poisoned");
        let length = src.len() as u64;
        let end = offset
            .checked_add(length)
            .filter(|&end| end <= bytes.len() as u64)
            .ok_or(StoreError::TargetOutOfBounds {
                offset,
                length,
                size: bytes.len() as u64,
            })?;
        bytes[offset as usize..end as usize].copy_from_slice(src);
        Ok(())
    }
}

/// Runs of non-resident pages in `[first, last)` as `(start, count)`.
fn missing_runs(resident: &[bool], first: u64, last: u64) -> Vec<(u64, u64)> {
    let mut runs: Vec<(u64, u64)> = Vec::new();
    for page in first..last {
        if resident[page as usize] {
            continue;
        }
        match runs.last_mut() {
            Some((start, count)) if *start + *count == page => *count += 1,
            _ => runs.push((page, 1)),
        }
    }
    runs
}

fn zeroed(size: usize) -> Option<Vec<u8>> {
    let mut bytes = Vec::new();
    bytes.try_reserve_exact(size).ok()?;
    bytes.resize(size, 0);
    Some(bytes)
}

fn alloc_failed(name: &str, size: u64) -> LoaderError {
    LoaderError::AllocationFailed {
        name: name.to_string(),
        size,
    }
}

fn page_aligned(size: usize) -> usize {
    size.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}
