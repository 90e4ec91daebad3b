//! Memory stays bounded by frame size, not archive size
//!
//! A 64 MiB archive is generated one frame at a time and ingested into a store
//! that discards payloads, while a counting allocator tracks peak heap use. This
//! file holds a single test so nothing else allocates concurrently.

use std::alloc::{GlobalAlloc, Layout, System};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::task::{Context, Poll};

use bytes::Bytes;
use carport::car::write_car_bytes;
use carport::cid::RAW;
use carport::store::StoreError;
use carport::varint::encode_uvarint;
use carport::{ClusterStore, ContentId, HashAlgorithm, IngestOptions, ingest};
use tokio::io::{AsyncRead, ReadBuf};

struct CountingAlloc;

static CURRENT: AtomicUsize = AtomicUsize::new(0);
static PEAK: AtomicUsize = AtomicUsize::new(0);

unsafe impl GlobalAlloc for CountingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { System.alloc(layout) };
        if !ptr.is_null() {
            let now = CURRENT.fetch_add(layout.size(), Ordering::SeqCst) + layout.size();
            PEAK.fetch_max(now, Ordering::SeqCst);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) };
        CURRENT.fetch_sub(layout.size(), Ordering::SeqCst);
    }
}

#[global_allocator]
static ALLOC: CountingAlloc = CountingAlloc;

const BLOCK_SIZE: usize = 64 * 1024;
const BLOCK_COUNT: u64 = 1024;
const ARCHIVE_SIZE: usize = BLOCK_SIZE * BLOCK_COUNT as usize;

fn block_payload(index: u64) -> Vec<u8> {
    let mut data = vec![0u8; BLOCK_SIZE];
    data[..8].copy_from_slice(&index.to_be_bytes());
    data
}

/// Produces the archive lazily, holding at most one frame
struct SyntheticCar {
    frame: Vec<u8>,
    pos: usize,
    next_block: u64,
}

impl SyntheticCar {
    async fn new(root: ContentId) -> Self {
        let header = write_car_bytes(vec![root], Vec::new()).await.unwrap();
        Self {
            frame: header,
            pos: 0,
            next_block: 0,
        }
    }
}

impl AsyncRead for SyntheticCar {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos == this.frame.len() {
            if this.next_block == BLOCK_COUNT {
                return Poll::Ready(Ok(()));
            }
            let data = block_payload(this.next_block);
            let cid = ContentId::for_data(RAW, HashAlgorithm::Sha2_256, &data)
                .unwrap()
                .to_bytes();
            this.frame.clear();
            encode_uvarint((cid.len() + data.len()) as u64, &mut this.frame);
            this.frame.extend_from_slice(&cid);
            this.frame.extend_from_slice(&data);
            this.pos = 0;
            this.next_block += 1;
        }

        let n = buf.remaining().min(this.frame.len() - this.pos);
        buf.put_slice(&this.frame[this.pos..this.pos + n]);
        this.pos += n;
        Poll::Ready(Ok(()))
    }
}

/// Accepts everything and keeps only counts
#[derive(Clone, Default)]
struct DiscardStore {
    blocks: Arc<AtomicU64>,
    pins: Arc<AtomicU64>,
}

impl ClusterStore for DiscardStore {
    async fn put(&self, _cid: &ContentId, _data: Bytes) -> Result<(), StoreError> {
        self.blocks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn pin(&self, _root: &ContentId) -> Result<(), StoreError> {
        self.pins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, _cid: &ContentId) -> Result<Option<Bytes>, StoreError> {
        Ok(None)
    }

    async fn has(&self, _cid: &ContentId) -> Result<bool, StoreError> {
        Ok(false)
    }

    async fn is_pinned(&self, _root: &ContentId) -> Result<bool, StoreError> {
        Ok(self.pins.load(Ordering::SeqCst) > 0)
    }
}

#[tokio::test]
async fn peak_heap_is_independent_of_archive_size() {
    let root = ContentId::for_data(RAW, HashAlgorithm::Sha2_256, &block_payload(0)).unwrap();
    let reader = SyntheticCar::new(root).await;
    let store = DiscardStore::default();
    let options = IngestOptions::new().concurrency(8).build();

    let baseline = CURRENT.load(Ordering::SeqCst);
    PEAK.store(baseline, Ordering::SeqCst);

    let result = ingest(reader, &options, &store).await;

    let peak = PEAK.load(Ordering::SeqCst) - baseline;
    assert!(result.accepted, "{:?}", result.failure);
    assert_eq!(result.block_count, BLOCK_COUNT);
    assert_eq!(result.byte_count, ARCHIVE_SIZE as u64);
    assert_eq!(store.pins.load(Ordering::SeqCst), 1);
    assert!(
        peak < ARCHIVE_SIZE / 8,
        "peak heap {} bytes for a {} byte archive",
        peak,
        ARCHIVE_SIZE
    );
}
