//! Backing-store I/O: the slow, read-only device holding the image.
//!
//! Reads are submitted one at a time and complete asynchronously. The
//! completion source (a device worker, an interrupt handler, a test script)
//! only ever pushes a [`ReadCompletion`] into the completion queue; it never
//! touches cache state.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread::JoinHandle;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default minimum transfer granularity of the device, in bytes.
pub const DEFAULT_GRANULARITY: usize = 32;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Image file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Read of {len:#x} bytes at {offset:#x} is not a multiple of the {granularity}-byte granularity")]
    Misaligned {
        offset: u64,
        len: usize,
        granularity: usize,
    },

    #[error("Read at {offset:#x} starts past the end of the {size:#x}-byte store")]
    OutOfRange { offset: u64, size: u64 },

    #[error("Device worker has shut down")]
    WorkerGone,
}

/// One read submitted to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    /// Identifies this submission; completions for stale tickets are ignored.
    pub ticket: u64,
    /// Absolute byte offset within the backing file.
    pub offset: u64,
    /// Bytes to read; a multiple of the device granularity.
    pub len: usize,
}

/// Result of a finished read, as reported by the completion source.
#[derive(Debug, Clone)]
pub struct ReadCompletion {
    pub ticket: u64,
    /// Bytes transferred. Its length is the device's result code.
    pub data: Bytes,
}

pub type CompletionSender = mpsc::UnboundedSender<ReadCompletion>;
pub type CompletionReceiver = mpsc::UnboundedReceiver<ReadCompletion>;

/// Create the single-producer/single-consumer completion queue.
pub fn completion_queue() -> (CompletionSender, CompletionReceiver) {
    mpsc::unbounded_channel()
}

/// Drive status reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceStatus {
    /// No command in flight, or the last one finished.
    Idle,
    /// A read is in progress.
    Busy,
    /// Drive is spinning up, seeking or otherwise not ready yet.
    Waiting,
    /// No disc in the drive.
    NoMedia,
    /// Drive cover is open.
    CoverOpen,
    /// A disc other than the expected one is inserted.
    WrongMedia,
    /// Sector could not be read; the command can be reissued.
    Retry,
    /// Drive state must be revalidated; the command can be reissued.
    Revalidate,
    /// A code this interface does not know.
    Unknown(i32),
}

/// How the retry policy treats a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Normal,
    Transient,
    Recoverable,
    Fatal,
}

impl DeviceStatus {
    /// Decode a raw drive status code.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => DeviceStatus::Idle,
            1 => DeviceStatus::Busy,
            2 | 3 | 7 | 8 | 9 | 10 => DeviceStatus::Waiting,
            4 => DeviceStatus::NoMedia,
            5 => DeviceStatus::CoverOpen,
            6 => DeviceStatus::WrongMedia,
            11 => DeviceStatus::Retry,
            -1 => DeviceStatus::Revalidate,
            other => DeviceStatus::Unknown(other),
        }
    }

    pub fn code(&self) -> i32 {
        match *self {
            DeviceStatus::Idle => 0,
            DeviceStatus::Busy => 1,
            DeviceStatus::Waiting => 2,
            DeviceStatus::NoMedia => 4,
            DeviceStatus::CoverOpen => 5,
            DeviceStatus::WrongMedia => 6,
            DeviceStatus::Retry => 11,
            DeviceStatus::Revalidate => -1,
            DeviceStatus::Unknown(code) => code,
        }
    }

    pub fn class(&self) -> StatusClass {
        match self {
            DeviceStatus::Idle | DeviceStatus::Busy => StatusClass::Normal,
            DeviceStatus::Waiting => StatusClass::Transient,
            DeviceStatus::Retry | DeviceStatus::Revalidate => StatusClass::Recoverable,
            DeviceStatus::NoMedia
            | DeviceStatus::CoverOpen
            | DeviceStatus::WrongMedia
            | DeviceStatus::Unknown(_) => StatusClass::Fatal,
        }
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceStatus::Idle => write!(f, "idle"),
            DeviceStatus::Busy => write!(f, "busy"),
            DeviceStatus::Waiting => write!(f, "waiting"),
            DeviceStatus::NoMedia => write!(f, "no media"),
            DeviceStatus::CoverOpen => write!(f, "cover open"),
            DeviceStatus::WrongMedia => write!(f, "wrong media"),
            DeviceStatus::Retry => write!(f, "retry"),
            DeviceStatus::Revalidate => write!(f, "revalidate"),
            DeviceStatus::Unknown(code) => write!(f, "unknown status {code}"),
        }
    }
}

/// The slow, read-only device holding the image.
pub trait BackingStore: Send {
    /// Name of the backing file, for logs and error prompts.
    fn name(&self) -> &str;

    /// Size of the backing file in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Minimum transfer granularity; read lengths must be a multiple of it.
    fn granularity(&self) -> usize {
        DEFAULT_GRANULARITY
    }

    /// Issue a read. Returns once the read is queued; the data arrives
    /// through `completion`. Bytes past the end of the store read as zero.
    fn submit(&mut self, request: ReadRequest, completion: CompletionSender) -> Result<(), DeviceError>;

    /// Current drive status. Polled once per caller iteration.
    fn status(&mut self) -> DeviceStatus;

    /// Abandon the in-flight read, if any. Its completion will not be delivered.
    fn cancel(&mut self);
}

fn check_request(request: &ReadRequest, size: u64, granularity: usize) -> Result<(), DeviceError> {
    if request.len % granularity != 0 {
        return Err(DeviceError::Misaligned {
            offset: request.offset,
            len: request.len,
            granularity,
        });
    }
    if request.offset >= size && request.len != 0 {
        return Err(DeviceError::OutOfRange {
            offset: request.offset,
            size,
        });
    }
    Ok(())
}

/// Copy `[offset, offset + len)` out of `data`, zero-padding past its end.
fn padded_slice(data: &[u8], offset: u64, len: usize) -> Bytes {
    let mut buf = BytesMut::zeroed(len);
    let start = (offset as usize).min(data.len());
    let end = (start + len).min(data.len());
    buf[..end - start].copy_from_slice(&data[start..end]);
    buf.freeze()
}

struct Job {
    request: ReadRequest,
    completion: CompletionSender,
}

struct WorkerState {
    status: AtomicI32,
    /// Every ticket at or below this value has been cancelled.
    cancelled_through: AtomicU64,
}

/// Backing store over a host file, read by a dedicated worker thread.
///
/// The worker plays the role of the drive: it reports `Busy` while a read
/// is in progress and pushes the completion from its own thread.
pub struct FileBackingStore {
    name: String,
    len: u64,
    granularity: usize,
    jobs: Option<std_mpsc::Sender<Job>>,
    state: Arc<WorkerState>,
    last_ticket: u64,
    worker: Option<JoinHandle<()>>,
}

impl FileBackingStore {
    pub fn open(path: &Path) -> Result<Self, DeviceError> {
        if !path.exists() {
            return Err(DeviceError::FileNotFound(path.to_path_buf()));
        }
        let file = File::open(path)?;
        let len = file.metadata()?.len();

        let state = Arc::new(WorkerState {
            status: AtomicI32::new(DeviceStatus::Idle.code()),
            cancelled_through: AtomicU64::new(0),
        });
        let (tx, rx) = std_mpsc::channel::<Job>();
        let worker_state = state.clone();
        let worker = std::thread::Builder::new()
            .name("rom-dvd".to_string())
            .spawn(move || run_worker(file, len, rx, worker_state))?;

        debug!(path = %path.display(), len, "Opened backing file");

        Ok(Self {
            name: path.display().to_string(),
            len,
            granularity: DEFAULT_GRANULARITY,
            jobs: Some(tx),
            state,
            last_ticket: 0,
            worker: Some(worker),
        })
    }
}

fn run_worker(mut file: File, len: u64, jobs: std_mpsc::Receiver<Job>, state: Arc<WorkerState>) {
    while let Ok(job) = jobs.recv() {
        let ticket = job.request.ticket;
        let cancelled = |state: &WorkerState| ticket <= state.cancelled_through.load(Ordering::Acquire);
        if cancelled(&state) {
            continue;
        }

        let result = read_at(&mut file, len, job.request.offset, job.request.len);
        if cancelled(&state) {
            continue;
        }

        match result {
            Ok(data) => {
                // The completion must be queued before the drive reports idle.
                let _ = job.completion.send(ReadCompletion { ticket, data });
                state.status.store(DeviceStatus::Idle.code(), Ordering::Release);
            }
            Err(e) => {
                warn!(ticket, error = %e, "Backing read failed");
                state.status.store(DeviceStatus::Retry.code(), Ordering::Release);
            }
        }
    }
}

fn read_at(file: &mut File, size: u64, offset: u64, len: usize) -> std::io::Result<Bytes> {
    let mut buf = BytesMut::zeroed(len);
    let available = size.saturating_sub(offset).min(len as u64) as usize;
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut buf[..available])?;
    Ok(buf.freeze())
}

impl BackingStore for FileBackingStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn granularity(&self) -> usize {
        self.granularity
    }

    fn submit(&mut self, request: ReadRequest, completion: CompletionSender) -> Result<(), DeviceError> {
        check_request(&request, self.len, self.granularity)?;
        let jobs = self.jobs.as_ref().ok_or(DeviceError::WorkerGone)?;

        self.last_ticket = self.last_ticket.max(request.ticket);
        self.state.status.store(DeviceStatus::Busy.code(), Ordering::Release);
        jobs.send(Job { request, completion })
            .map_err(|_| DeviceError::WorkerGone)?;
        Ok(())
    }

    fn status(&mut self) -> DeviceStatus {
        DeviceStatus::from_code(self.state.status.load(Ordering::Acquire))
    }

    fn cancel(&mut self) {
        self.state
            .cancelled_through
            .fetch_max(self.last_ticket, Ordering::AcqRel);
        self.state.status.store(DeviceStatus::Idle.code(), Ordering::Release);
    }
}

impl Drop for FileBackingStore {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Shared handle for scripting a [`MemoryBackingStore`] after it has been
/// handed to a cache.
#[derive(Debug, Default)]
pub struct StoreControl {
    statuses: Mutex<VecDeque<DeviceStatus>>,
    short_reads: AtomicUsize,
    submissions: AtomicUsize,
    cancels: AtomicUsize,
}

impl StoreControl {
    /// Report `status` on the next status poll while a read is pending.
    pub fn push_status(&self, status: DeviceStatus) {
        self.statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(status);
    }

    pub fn push_statuses(&self, status: DeviceStatus, count: usize) {
        for _ in 0..count {
            self.push_status(status);
        }
    }

    /// Deliver the next completion with half of the requested bytes.
    pub fn push_short_read(&self) {
        self.short_reads.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads submitted so far, including reissues.
    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::Relaxed)
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::Relaxed)
    }

    fn next_status(&self) -> Option<DeviceStatus> {
        self.statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    fn take_short_read(&self) -> bool {
        self.short_reads
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Backing store over an in-memory image.
///
/// A pending read completes on the first status poll that has no scripted
/// status left to report, so scripted faults surface before the data.
pub struct MemoryBackingStore {
    name: String,
    data: Bytes,
    granularity: usize,
    pending: Option<Job>,
    control: Arc<StoreControl>,
}

impl MemoryBackingStore {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
            granularity: DEFAULT_GRANULARITY,
            pending: None,
            control: Arc::new(StoreControl::default()),
        }
    }

    pub fn with_granularity(mut self, granularity: usize) -> Self {
        self.granularity = granularity.max(1);
        self
    }

    pub fn control(&self) -> Arc<StoreControl> {
        self.control.clone()
    }
}

impl BackingStore for MemoryBackingStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn granularity(&self) -> usize {
        self.granularity
    }

    fn submit(&mut self, request: ReadRequest, completion: CompletionSender) -> Result<(), DeviceError> {
        check_request(&request, self.len(), self.granularity)?;
        self.control.submissions.fetch_add(1, Ordering::Relaxed);
        self.pending = Some(Job { request, completion });
        Ok(())
    }

    fn status(&mut self) -> DeviceStatus {
        if self.pending.is_none() {
            return DeviceStatus::Idle;
        }
        if let Some(status) = self.control.next_status() {
            return status;
        }

        if let Some(job) = self.pending.take() {
            let mut data = padded_slice(&self.data, job.request.offset, job.request.len);
            if self.control.take_short_read() {
                data.truncate(job.request.len / 2);
            }
            let _ = job.completion.send(ReadCompletion {
                ticket: job.request.ticket,
                data,
            });
        }
        DeviceStatus::Idle
    }

    fn cancel(&mut self) {
        self.control.cancels.fetch_add(1, Ordering::Relaxed);
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn wait_for_completion(store: &mut dyn BackingStore, rx: &mut CompletionReceiver) -> ReadCompletion {
        loop {
            if let Ok(done) = rx.try_recv() {
                return done;
            }
            assert_ne!(store.status().class(), StatusClass::Fatal);
            std::thread::yield_now();
        }
    }

    #[test]
    fn test_status_codes_round_trip() {
        for code in [-1, 0, 1, 2, 4, 5, 6, 11, 42] {
            assert_eq!(DeviceStatus::from_code(code).code(), code);
        }
        assert_eq!(DeviceStatus::from_code(8), DeviceStatus::Waiting);
        assert_eq!(DeviceStatus::Retry.class(), StatusClass::Recoverable);
        assert_eq!(DeviceStatus::WrongMedia.class(), StatusClass::Fatal);
        assert_eq!(DeviceStatus::Unknown(42).class(), StatusClass::Fatal);
    }

    #[test]
    fn test_memory_store_scripted_statuses() {
        let data: Vec<u8> = (0..128u8).collect();
        let mut store = MemoryBackingStore::new("mem", data);
        let control = store.control();
        let (tx, mut rx) = completion_queue();

        control.push_status(DeviceStatus::Busy);
        control.push_status(DeviceStatus::Waiting);
        store.submit(ReadRequest { ticket: 1, offset: 96, len: 64 }, tx).unwrap();

        assert_eq!(store.status(), DeviceStatus::Busy);
        assert_eq!(store.status(), DeviceStatus::Waiting);
        assert!(rx.try_recv().is_err());
        assert_eq!(store.status(), DeviceStatus::Idle);

        let done = rx.try_recv().unwrap();
        assert_eq!(done.ticket, 1);
        assert_eq!(done.data.len(), 64);
        assert_eq!(&done.data[..32], &(96..128u8).collect::<Vec<_>>()[..]);
        assert!(done.data[32..].iter().all(|&b| b == 0));
        assert_eq!(control.submissions(), 1);
    }

    #[test]
    fn test_misaligned_request_rejected() {
        let mut store = MemoryBackingStore::new("mem", vec![0u8; 256]);
        let (tx, _rx) = completion_queue();
        let result = store.submit(ReadRequest { ticket: 1, offset: 0, len: 33 }, tx);
        assert!(matches!(result, Err(DeviceError::Misaligned { .. })));
    }

    #[test]
    fn test_file_store_reads_through_worker() {
        let mut file = NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        let mut store = FileBackingStore::open(file.path()).unwrap();
        assert_eq!(store.len(), 4096);

        let (tx, mut rx) = completion_queue();
        store.submit(ReadRequest { ticket: 1, offset: 1024, len: 512 }, tx).unwrap();
        let done = wait_for_completion(&mut store, &mut rx);
        assert_eq!(done.ticket, 1);
        assert_eq!(&done.data[..], &data[1024..1536]);
    }

    #[test]
    fn test_file_store_missing_file() {
        let result = FileBackingStore::open(Path::new("/nonexistent/rom.z64"));
        assert!(matches!(result, Err(DeviceError::FileNotFound(_))));
    }
}
