use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::{LoaderError, LoaderResult};
use crate::loader::PagedObject;
use crate::pager::PagingCoordinator;
use crate::region::MemoryRegion;

/// Async front end to a [`PagingCoordinator`].
///
/// Faults run on tokio's blocking threads, at most `pager_workers` at a
/// time. Servicing is synchronous underneath; a fault that has started
/// runs to completion even if the awaiting task is dropped.
#[derive(Clone)]
pub struct PagerWorkers {
    pager: Arc<PagingCoordinator>,
    permits: Arc<Semaphore>,
    workers: usize,
}

impl PagerWorkers {
    pub fn new(pager: Arc<PagingCoordinator>) -> Self {
        let workers = pager.config().pager_workers;
        Self {
            pager,
            permits: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    pub fn pager(&self) -> &Arc<PagingCoordinator> {
        &self.pager
    }

    /// Workers currently servicing a request.
    pub fn busy(&self) -> usize {
        self.workers - self.permits.available_permits()
    }

    /// Service a fault on `region` for `object`.
    pub async fn fault(
        &self,
        region: Arc<MemoryRegion>,
        object: Arc<PagedObject>,
        offset: u64,
        length: u64,
    ) -> LoaderResult<()> {
        let pager = Arc::clone(&self.pager);
        self.run(move || pager.service_fault(&region, &object, offset, length))
            .await
    }

    /// Read from `region` on a worker, faulting in whatever is missing.
    pub async fn read(
        &self,
        region: Arc<MemoryRegion>,
        offset: u64,
        length: usize,
    ) -> LoaderResult<Vec<u8>> {
        self.run(move || {
            let mut buf = vec![0u8; length];
            region.read_at(offset, &mut buf)?;
            Ok(buf)
        })
        .await
    }

    /// Stop accepting requests. Requests already running complete.
    pub fn close(&self) {
        self.permits.close();
        self.pager.shutdown();
        debug!("pager workers closed");
    }

    async fn run<T, F>(&self, f: F) -> LoaderResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> LoaderResult<T> + Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| LoaderError::Shutdown)?;
        tokio::task::spawn_blocking(move || {
            let result = f();
            drop(permit);
            result
        })
        .await
        .map_err(|e| LoaderError::Worker(e.to_string()))?
    }
}
