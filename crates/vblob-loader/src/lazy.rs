use std::sync::{Arc, Mutex};

use tracing::debug;
use vblob_types::{NodeIndex, ObjectRecord};

use crate::error::LoaderResult;
use crate::loader::BlobLoader;
use crate::pager::{PagedBlobHandler, PagingCoordinator};
use crate::region::MemoryRegion;

/// Loads the object whole on first access.
pub struct EagerLazyHandle {
    loader: Arc<BlobLoader>,
    record: ObjectRecord,
    mapped: Mutex<Option<Arc<MemoryRegion>>>,
}

impl EagerLazyHandle {
    pub fn new(loader: Arc<BlobLoader>, record: ObjectRecord) -> Self {
        Self {
            loader,
            record,
            mapped: Mutex::new(None),
        }
    }

    /// The verified data region, loading it if needed.
    pub fn get_region(&self) -> LoaderResult<Arc<MemoryRegion>> {
        let mut mapped = self.mapped.lock().expect("lock poisoned");
        if let Some(region) = mapped.as_ref() {
            return Ok(Arc::clone(region));
        }
        let loaded = self.loader.load(&self.record)?;
        *mapped = Some(Arc::clone(&loaded.data));
        Ok(loaded.data)
    }

    pub fn reset(&self) {
        self.mapped.lock().expect("lock poisoned").take();
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.lock().expect("lock poisoned").is_some()
    }
}

/// Builds a pager-backed region on first access. Pages become resident as
/// they are read.
pub struct PagedLazyHandle {
    loader: Arc<BlobLoader>,
    pager: Arc<PagingCoordinator>,
    record: ObjectRecord,
    mapped: Mutex<Option<Arc<MemoryRegion>>>,
}

impl PagedLazyHandle {
    pub fn new(loader: Arc<BlobLoader>, pager: Arc<PagingCoordinator>, record: ObjectRecord) -> Self {
        Self {
            loader,
            pager,
            record,
            mapped: Mutex::new(None),
        }
    }

    /// The paged region, creating it if needed. Only the Merkle tree (and
    /// the archive header for chunked objects) is read here.
    pub fn get_region(&self) -> LoaderResult<Arc<MemoryRegion>> {
        let mut mapped = self.mapped.lock().expect("lock poisoned");
        if let Some(region) = mapped.as_ref() {
            return Ok(Arc::clone(region));
        }
        let object = Arc::new(self.loader.load_paged(&self.record)?);
        let handler = Arc::new(PagedBlobHandler::new(Arc::clone(&self.pager), object));
        let region = Arc::new(MemoryRegion::new_paged(
            format!("blob-{}", self.record.root.short_hex()),
            self.record.blob_size,
            handler,
        )?);
        *mapped = Some(Arc::clone(&region));
        Ok(region)
    }

    pub fn reset(&self) {
        self.mapped.lock().expect("lock poisoned").take();
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.lock().expect("lock poisoned").is_some()
    }
}

/// Per-object cache of the readable region.
///
/// Starts unmapped; the first [`get_region`](Self::get_region) maps it and
/// later calls return the same region until [`reset`](Self::reset).
pub enum LazyHandle {
    Eager(EagerLazyHandle),
    Paged(PagedLazyHandle),
}

impl LazyHandle {
    /// Handle for `node`. Objects whose encoding allows it are paged when a
    /// pager is supplied and its configuration enables paging; everything
    /// else loads eagerly.
    pub fn open(
        node: NodeIndex,
        loader: Arc<BlobLoader>,
        pager: Option<Arc<PagingCoordinator>>,
    ) -> LoaderResult<Self> {
        let record = loader.record(node)?;
        let handle = match pager {
            Some(pager) if pager.config().paging_enabled && record.compression.is_pageable() => {
                Self::Paged(PagedLazyHandle::new(loader, pager, record))
            }
            _ => Self::Eager(EagerLazyHandle::new(loader, record)),
        };
        debug!(node, paged = handle.is_paged(), "lazy handle opened");
        Ok(handle)
    }

    pub fn get_region(&self) -> LoaderResult<Arc<MemoryRegion>> {
        match self {
            Self::Eager(h) => h.get_region(),
            Self::Paged(h) => h.get_region(),
        }
    }

    /// Drop the cached region. The next access maps it again.
    pub fn reset(&self) {
        match self {
            Self::Eager(h) => h.reset(),
            Self::Paged(h) => h.reset(),
        }
    }

    pub fn is_mapped(&self) -> bool {
        match self {
            Self::Eager(h) => h.is_mapped(),
            Self::Paged(h) => h.is_mapped(),
        }
    }

    pub fn is_paged(&self) -> bool {
        matches!(self, Self::Paged(_))
    }
}
