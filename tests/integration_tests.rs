//! End-to-end tests: device faults, reset, profiles and file-backed images.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rom_block_cache::cache::block::{PinClass, Tier, BLOCK_SIZE};
use rom_block_cache::cache::loader::DeviceLink;
use rom_block_cache::cache::stream::{CopyPoll, CopyState};
use rom_block_cache::cache::{CacheError, ImageCache, LoadMode};
use rom_block_cache::config::{Config, RetryConfig};
use rom_block_cache::host::{LoadObserver, NeverReset, ResetFlag, ResetSignal, TracingObserver};
use rom_block_cache::image::{swap_pairs, ByteRange, ImageProfile};
use rom_block_cache::memory::SystemHeap;
use rom_block_cache::transfer::aux_dma::HostAuxMemory;
use rom_block_cache::transfer::disk_io::{
    BackingStore, CompletionSender, DeviceError, DeviceStatus, FileBackingStore, MemoryBackingStore,
    ReadCompletion, ReadRequest, StoreControl,
};
use tempfile::NamedTempFile;

const IMAGE_LEN: usize = 0x40_0000;

fn image(len: usize, code: &[u8; 4]) -> Vec<u8> {
    let mut data: Vec<u8> = (0..len).map(|i| (i.wrapping_mul(7) >> 3) as u8).collect();
    data[..4].copy_from_slice(&[0x80, 0x37, 0x12, 0x40]);
    data[0x3B..0x3F].copy_from_slice(code);
    data
}

fn part_config() -> Config {
    let mut config = Config::default();
    config.cache.size = 0x10_0000;
    config.secondary.capacity = 16 * BLOCK_SIZE;
    config
}

fn open_with(
    store: Box<dyn BackingStore>,
    config: Config,
    observer: Box<dyn LoadObserver>,
    reset: Box<dyn ResetSignal>,
) -> ImageCache {
    let aux = HostAuxMemory::new(config.secondary.capacity, config.secondary.max_transfer, 32);
    ImageCache::open(config, store, Box::new(aux), &mut SystemHeap::new(), observer, reset).unwrap()
}

fn open_memory(data: &[u8], config: Config) -> (ImageCache, Arc<StoreControl>) {
    let store = MemoryBackingStore::new("game.z64", data.to_vec());
    let control = store.control();
    let cache = open_with(Box::new(store), config, Box::new(TracingObserver::new()), Box::new(NeverReset));
    (cache, control)
}

fn drive(cache: &mut ImageCache, max_steps: usize) -> Vec<u8> {
    for _ in 0..max_steps {
        if let CopyPoll::Ready(bytes) = cache.advance().unwrap() {
            return bytes;
        }
    }
    panic!("copy did not finish in {max_steps} steps");
}

/// Step the copy until it fails.
fn drive_to_error(cache: &mut ImageCache, max_steps: usize) -> CacheError {
    for _ in 0..max_steps {
        match cache.advance() {
            Ok(CopyPoll::Ready(_)) => panic!("copy finished despite the fault"),
            Ok(_) => {}
            Err(e) => return e,
        }
    }
    panic!("copy did not fail in {max_steps} steps");
}

/// Observer that answers every prompt with "retry" and counts prompts.
struct RetryingObserver {
    prompts: Arc<AtomicUsize>,
}

impl LoadObserver for RetryingObserver {
    fn show_error(&mut self, _status: DeviceStatus, _name: &str) -> bool {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        true
    }
}

#[test]
fn test_transient_busy_then_success_runs_hook_once() {
    let data = image(IMAGE_LEN, b"BUSY");
    let (mut cache, control) = open_memory(&data, part_config());
    cache.ensure_loaded().unwrap();

    control.push_statuses(DeviceStatus::Waiting, 4);
    control.push_statuses(DeviceStatus::Busy, 3);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    cache
        .begin_copy(
            0x2_1000,
            0x800,
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
        )
        .unwrap();

    let bytes = drive(&mut cache, 100);
    assert_eq!(bytes, &data[0x2_1000..0x2_1800]);
    for _ in 0..5 {
        assert_eq!(cache.advance().unwrap(), CopyPoll::Idle);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats().reissues, 0);
}

#[test]
fn test_copy_spanning_secondary_and_unresident_block() {
    let data = image(IMAGE_LEN, b"SPAN");
    let (mut cache, _control) = open_memory(&data, part_config());

    // Block 10 first, then enough others to push it out of the primary tier.
    cache.read((10 * BLOCK_SIZE) as u64, 1).unwrap();
    for block in 20..148usize {
        cache.read((block * BLOCK_SIZE) as u64, 1).unwrap();
    }
    let table = cache.pager().unwrap().table();
    assert!(table.get(10).is_resident_in(Tier::Secondary));
    assert!(!table.get(11).is_resident());

    let start = 10 * BLOCK_SIZE + 0x321;
    cache.begin_copy(start as u64, BLOCK_SIZE, None).unwrap();
    let bytes = drive(&mut cache, 100);
    assert_eq!(bytes, &data[start..start + BLOCK_SIZE]);

    let stats = cache.stats();
    assert!(stats.secondary_hits >= 1);
    assert!(stats.promotions >= 1);
    cache.check_invariants().unwrap();
}

#[test]
fn test_recoverable_fault_reissues_then_fails() {
    let data = image(IMAGE_LEN, b"RTRY");
    let (mut cache, control) = open_memory(&data, part_config());
    cache.ensure_loaded().unwrap();

    control.push_statuses(DeviceStatus::Retry, 3);
    assert_eq!(cache.read(0x1_0000, 4).unwrap(), &data[0x1_0000..0x1_0004]);
    assert_eq!(cache.stats().reissues, 3);

    control.push_statuses(DeviceStatus::Revalidate, 9);
    let err = cache.read(0x3_0000, 4).unwrap_err();
    assert!(matches!(err, CacheError::MediaUnavailable { status: DeviceStatus::Revalidate }));
    assert_eq!(cache.stats().reissues, 3 + 8);
}

#[test]
fn test_fatal_status_surfaces_media_unavailable() {
    let data = image(IMAGE_LEN, b"FATL");
    let (mut cache, control) = open_memory(&data, part_config());
    cache.ensure_loaded().unwrap();

    control.push_statuses(DeviceStatus::NoMedia, 3);
    let err = cache.read(0x5_0000, 16).unwrap_err();
    assert!(matches!(err, CacheError::MediaUnavailable { status: DeviceStatus::NoMedia }));
    assert!(!cache.pager().unwrap().table().get(0x28).is_resident());
    cache.check_invariants().unwrap();

    // The medium is back: the same read now succeeds.
    assert_eq!(cache.read(0x5_0000, 16).unwrap(), &data[0x5_0000..0x5_0010]);
}

#[test]
fn test_streaming_copy_reissues_then_succeeds() {
    let data = image(IMAGE_LEN, b"SRTY");
    let (mut cache, control) = open_memory(&data, part_config());
    cache.ensure_loaded().unwrap();

    control.push_statuses(DeviceStatus::Retry, 3);
    cache.begin_copy(0x1_0000, 0x40, None).unwrap();
    let bytes = drive(&mut cache, 100);
    assert_eq!(bytes, &data[0x1_0000..0x1_0040]);
    assert_eq!(cache.stats().reissues, 3);
    assert_eq!(cache.copy_state(), CopyState::Done);
}

#[test]
fn test_streaming_copy_escalates_then_recovers() {
    let data = image(IMAGE_LEN, b"SESC");
    let (mut cache, control) = open_memory(&data, part_config());
    cache.ensure_loaded().unwrap();

    control.push_statuses(DeviceStatus::Revalidate, 9);
    cache.begin_copy(0x3_0000, 0x40, None).unwrap();
    let err = drive_to_error(&mut cache, 100);
    assert!(matches!(err, CacheError::MediaUnavailable { status: DeviceStatus::Revalidate }));
    assert_eq!(cache.stats().reissues, 8);
    assert_eq!(cache.copy_state(), CopyState::Failed);

    cache.begin_copy(0x3_0000, 0x40, None).unwrap();
    assert_eq!(drive(&mut cache, 100), &data[0x3_0000..0x3_0040]);
    cache.check_invariants().unwrap();
}

#[test]
fn test_streaming_copy_completes_after_fatal_status() {
    let data = image(IMAGE_LEN, b"SFTL");
    let (mut cache, control) = open_memory(&data, part_config());
    cache.ensure_loaded().unwrap();

    control.push_statuses(DeviceStatus::NoMedia, 3);
    cache.begin_copy(0x5_0000, 16, None).unwrap();
    let err = drive_to_error(&mut cache, 100);
    assert!(matches!(err, CacheError::MediaUnavailable { status: DeviceStatus::NoMedia }));
    assert!(!cache.pager().unwrap().table().get(0x28).is_resident());
    cache.check_invariants().unwrap();

    // A different block, then the one that failed.
    cache.begin_copy(0x9_0000, 16, None).unwrap();
    assert_eq!(drive(&mut cache, 200), &data[0x9_0000..0x9_0010]);
    cache.begin_copy(0x5_0000, 16, None).unwrap();
    assert_eq!(drive(&mut cache, 200), &data[0x5_0000..0x5_0010]);
}

#[test]
fn test_operator_retry_resumes_read() {
    let data = image(IMAGE_LEN, b"PRMT");
    let store = MemoryBackingStore::new("prompt.z64", data.clone());
    let control = store.control();
    let prompts = Arc::new(AtomicUsize::new(0));
    let observer = RetryingObserver {
        prompts: prompts.clone(),
    };
    let mut cache = open_with(Box::new(store), part_config(), Box::new(observer), Box::new(NeverReset));
    cache.ensure_loaded().unwrap();

    control.push_statuses(DeviceStatus::CoverOpen, 3);
    assert_eq!(cache.read(0x7_0000, 8).unwrap(), &data[0x7_0000..0x7_0008]);
    assert_eq!(prompts.load(Ordering::SeqCst), 1);
}

#[test]
fn test_reset_cancels_copy_in_flight() {
    let data = image(IMAGE_LEN, b"RSET");
    let store = MemoryBackingStore::new("reset.z64", data.clone());
    let control = store.control();
    let reset = ResetFlag::new();
    let mut cache = open_with(
        Box::new(store),
        part_config(),
        Box::new(TracingObserver::new()),
        Box::new(reset.clone()),
    );
    cache.ensure_loaded().unwrap();

    control.push_statuses(DeviceStatus::Waiting, 6);
    cache.begin_copy((50 * BLOCK_SIZE) as u64, 0x100, None).unwrap();
    assert_eq!(cache.advance().unwrap(), CopyPoll::Pending);

    reset.request();
    assert!(matches!(cache.advance(), Err(CacheError::Cancelled)));
    assert_eq!(cache.copy_state(), CopyState::Failed);
    assert!(control.cancels() >= 1);
    assert!(!cache.pager().unwrap().table().get(50).is_resident());
    cache.check_invariants().unwrap();

    reset.clear();
    cache.begin_copy((50 * BLOCK_SIZE) as u64, 0x100, None).unwrap();
    let bytes = drive(&mut cache, 100);
    assert_eq!(bytes, &data[50 * BLOCK_SIZE..50 * BLOCK_SIZE + 0x100]);
}

/// Delivers every submitted read, cancelled or not.
struct LeakyStore {
    data: Vec<u8>,
    jobs: Vec<(ReadRequest, CompletionSender)>,
}

impl BackingStore for LeakyStore {
    fn name(&self) -> &str {
        "leaky"
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn submit(&mut self, request: ReadRequest, completion: CompletionSender) -> Result<(), DeviceError> {
        self.jobs.push((request, completion));
        Ok(())
    }

    fn status(&mut self) -> DeviceStatus {
        for (request, completion) in self.jobs.drain(..) {
            let start = request.offset as usize;
            let data = self.data[start..start + request.len].to_vec().into();
            let _ = completion.send(ReadCompletion {
                ticket: request.ticket,
                data,
            });
        }
        DeviceStatus::Idle
    }

    fn cancel(&mut self) {}
}

#[test]
fn test_stale_completion_is_discarded() {
    let data: Vec<u8> = (0..0x400u32).map(|i| i as u8).collect();
    let store = LeakyStore {
        data: data.clone(),
        jobs: Vec::new(),
    };
    let mut link = DeviceLink::new(Box::new(store), 0, RetryConfig::default());

    link.issue(0, 0x40).unwrap();
    link.issue(0x100, 0x40).unwrap();
    let bytes = link.wait(&mut TracingObserver::new(), &NeverReset).unwrap();

    assert_eq!(&bytes[..], &data[0x100..0x140]);
    assert_eq!(link.stats().stale_completions, 1);
    assert!(!link.is_busy());
}

#[test]
fn test_profile_pins_ranges_and_prefetches_hot_blocks() {
    let data = image(IMAGE_LEN, b"PROF");
    let mut config = part_config();
    config.profiles.push(ImageProfile {
        codes: vec!["prof".to_string()],
        pinned: vec![ByteRange::new(0, (3 * BLOCK_SIZE) as u64)],
        hot: vec![ByteRange::inclusive(0x8_0000, 0x8_0000 + (4 * BLOCK_SIZE) as u64 - 1)],
    });
    let (mut cache, _control) = open_memory(&data, config);
    assert!(cache.profile().is_some());

    cache.ensure_loaded().unwrap();
    {
        let table = cache.pager().unwrap().table();
        for block in 0..3 {
            assert!(table.get(block).is_resident());
            assert_eq!(table.get(block).pin, PinClass::Kept);
        }
        assert_eq!(table.get(3).pin, PinClass::Normal);
    }

    cache.begin_copy(0x8_0000, 16, None).unwrap();
    assert_eq!(drive(&mut cache, 10), &data[0x8_0000..0x8_0010]);
    for _ in 0..20 {
        cache.advance().unwrap();
    }

    let table = cache.pager().unwrap().table();
    for block in 64..68 {
        assert!(table.get(block).is_resident(), "block {block} not prefetched");
    }
    assert_eq!(cache.stats().prefetched, 3);
}

#[test]
fn test_file_backed_byte_swapped_image() {
    let mut data = image(0x3_0000, b"SWAP");
    let native = data.clone();
    swap_pairs(&mut data, 0x3_0000);

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&data).unwrap();
    file.flush().unwrap();

    let store = FileBackingStore::open(file.path()).unwrap();
    let mut cache = open_with(
        Box::new(store),
        Config::default(),
        Box::new(TracingObserver::new()),
        Box::new(NeverReset),
    );
    assert_eq!(cache.mode(), LoadMode::Full);
    assert!(cache.test_code("swap"));

    assert_eq!(cache.read_u32(0).unwrap(), 0x8037_1240);
    assert_eq!(cache.read(0x1_2345, 0x99).unwrap(), &native[0x1_2345..0x1_23DE]);
}

#[test]
fn test_file_backed_image_preloaded_into_both_tiers() {
    let data = image(0x12_0000, b"PRLD");
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&data).unwrap();
    file.flush().unwrap();

    let mut config = Config::default();
    config.cache.size = 0x10_0000;
    let store = FileBackingStore::open(file.path()).unwrap();
    let mut cache = open_with(Box::new(store), config, Box::new(TracingObserver::new()), Box::new(NeverReset));
    assert_eq!(cache.mode(), LoadMode::Part);

    cache.ensure_loaded().unwrap();
    let stats = cache.stats();
    assert_eq!(stats.blocks_loaded, 144);
    assert_eq!(stats.primary_resident, 128);
    assert_eq!(stats.secondary_resident, 16);
    assert!(cache.pager().unwrap().table().get(0).is_resident_in(Tier::Primary));

    let mut dest = vec![0u8; 0x4_0000];
    assert_eq!(cache.copy_now(&mut dest, 0xE_0000).unwrap(), 0x4_0000);
    assert_eq!(dest, &data[0xE_0000..]);
    assert_eq!(cache.read(0x11_FFF0, 0x100).unwrap(), &data[0x11_FFF0..]);
    assert_eq!(cache.stats().blocks_loaded, 144);
    cache.check_invariants().unwrap();
}

#[test]
fn test_missing_image_file() {
    let err = FileBackingStore::open(std::path::Path::new("/nonexistent/rom.z64")).err().unwrap();
    assert!(matches!(err, DeviceError::FileNotFound(_)));
}
