mod common;

use std::sync::Arc;

use common::{loader, pager, text_like};
use vblob_loader::{ImageBuilder, LazyHandle, LoaderConfig, LoaderError, PagerWorkers};
use vblob_store::StoreError;
use vblob_types::{CompressionKind, BLOCK_SIZE};

#[test]
fn eager_handle_maps_once_until_reset() {
    let data = text_like(30_000);
    let mut builder = ImageBuilder::new();
    let record = builder.add(&data, CompressionKind::FullFrame).unwrap();
    let image = builder.build();
    let pager = pager(&image, LoaderConfig::default());

    let handle = LazyHandle::open(record.node, loader(&image), Some(pager)).unwrap();
    assert!(!handle.is_paged());
    assert!(!handle.is_mapped());

    let first = handle.get_region().unwrap();
    assert!(handle.is_mapped());
    assert!(!first.is_paged());
    assert_eq!(first.to_vec().unwrap(), data);
    assert!(Arc::ptr_eq(&first, &handle.get_region().unwrap()));

    handle.reset();
    assert!(!handle.is_mapped());
    let second = handle.get_region().unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(second.to_vec().unwrap(), data);
}

#[test]
fn paged_handle_reads_on_demand() {
    let data = text_like(300_000);
    let mut builder = ImageBuilder::new();
    let record = builder.add(&data, CompressionKind::ChunkedSeekable).unwrap();
    let image = builder.build();
    let pager = pager(&image, LoaderConfig::default());

    let handle = LazyHandle::open(record.node, loader(&image), Some(Arc::clone(&pager))).unwrap();
    assert!(handle.is_paged());
    let region = handle.get_region().unwrap();
    assert!(region.is_paged());
    assert_eq!(region.size(), data.len() as u64);
    assert_eq!(region.resident_pages(), 0);

    let mut buf = [0u8; 32];
    region.read_at(290_000, &mut buf).unwrap();
    assert_eq!(&buf[..], &data[290_000..290_032]);
    assert_eq!(pager.stats().faults_serviced, 1);
    assert!(Arc::ptr_eq(&region, &handle.get_region().unwrap()));

    handle.reset();
    let fresh = handle.get_region().unwrap();
    assert_eq!(fresh.resident_pages(), 0);
}

#[test]
fn paging_falls_back_to_eager() {
    let mut builder = ImageBuilder::new();
    let record = builder.add(&text_like(9000), CompressionKind::None).unwrap();
    let image = builder.build();

    let no_pager = LazyHandle::open(record.node, loader(&image), None).unwrap();
    assert!(!no_pager.is_paged());

    let disabled = LoaderConfig {
        paging_enabled: false,
        ..LoaderConfig::default()
    };
    let handle =
        LazyHandle::open(record.node, loader(&image), Some(pager(&image, disabled))).unwrap();
    assert!(!handle.is_paged());
    assert_eq!(handle.get_region().unwrap().resident_pages(), 3);
}

#[test]
fn empty_object_maps_in_both_modes() {
    let mut builder = ImageBuilder::new();
    let record = builder.add(&[], CompressionKind::None).unwrap();
    let image = builder.build();
    let pager = pager(&image, LoaderConfig::default());

    for pager in [None, Some(pager)] {
        let handle = LazyHandle::open(record.node, loader(&image), pager).unwrap();
        let region = handle.get_region().unwrap();
        assert_eq!(region.size(), 0);
        assert!(region.to_vec().unwrap().is_empty());
    }
}

#[test]
fn failed_load_leaves_handle_unmapped() {
    let mut builder = ImageBuilder::new();
    let record = builder.add(&text_like(8192), CompressionKind::None).unwrap();
    let image = builder.build();
    image
        .device
        .corrupt_byte(image.data_device_offset(record.node, 100).unwrap());

    let handle = LazyHandle::open(record.node, loader(&image), None).unwrap();
    let err = handle.get_region().unwrap_err();
    assert!(err.is_integrity_failure());
    assert!(!handle.is_mapped());
}

#[test]
fn unknown_node_cannot_be_opened() {
    let image = ImageBuilder::new().build();
    assert!(matches!(
        LazyHandle::open(7, loader(&image), None),
        Err(LoaderError::Io(StoreError::NotFound(7)))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn workers_service_reads_concurrently() {
    let data = Arc::new(text_like(5 * 128 * 1024));
    let mut builder = ImageBuilder::new().fragmented(true);
    let record = builder.add(&data, CompressionKind::ChunkedSeekable).unwrap();
    let image = builder.build();
    let pager = pager(
        &image,
        LoaderConfig {
            pager_workers: 2,
            ..LoaderConfig::default()
        },
    );
    let workers = PagerWorkers::new(Arc::clone(&pager));
    let handle = LazyHandle::open(record.node, loader(&image), Some(pager)).unwrap();
    let region = handle.get_region().unwrap();

    let mut tasks = Vec::new();
    for i in 0..10u64 {
        let workers = workers.clone();
        let region = Arc::clone(&region);
        let data = Arc::clone(&data);
        tasks.push(tokio::spawn(async move {
            let offset = i * 60_000;
            let got = workers.read(region, offset, 100).await.unwrap();
            assert_eq!(got, &data[offset as usize..offset as usize + 100]);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(workers.busy(), 0);
    assert!(workers.pager().staging_is_clean());
}

#[tokio::test]
async fn worker_fault_then_close() {
    let data = text_like(4 * BLOCK_SIZE);
    let mut builder = ImageBuilder::new();
    let record = builder.add(&data, CompressionKind::None).unwrap();
    let image = builder.build();
    let loader = loader(&image);
    let pager = pager(&image, LoaderConfig::default());
    let workers = PagerWorkers::new(Arc::clone(&pager));

    let object = Arc::new(loader.load_paged(&record).unwrap());
    let handler = Arc::new(vblob_loader::PagedBlobHandler::new(
        Arc::clone(&pager),
        Arc::clone(&object),
    ));
    let region = Arc::new(
        vblob_loader::MemoryRegion::new_paged("blob-workers", record.blob_size, handler).unwrap(),
    );

    workers
        .fault(Arc::clone(&region), Arc::clone(&object), 0, 1)
        .await
        .unwrap();
    assert!(region.is_resident(0));
    assert!(!region.is_resident(BLOCK_SIZE as u64));

    workers.close();
    assert!(pager.is_shut_down());
    assert!(matches!(
        workers.read(Arc::clone(&region), 0, 10).await,
        Err(LoaderError::Shutdown)
    ));
    assert!(matches!(
        workers.fault(region, object, BLOCK_SIZE as u64, 1).await,
        Err(LoaderError::Shutdown)
    ));
}
