//! Block loader: reads blocks off the backing store into primary slots.
//!
//! [`DeviceLink`] owns the backing store and the completion queue. It keeps
//! at most one read in flight, classifies drive status and applies the
//! retry policy. [`BlockLoader`] turns completed reads into resident blocks.

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::cache::block::{BlockTable, Tier, BLOCK_SIZE};
use crate::cache::pager::Pager;
use crate::cache::CacheError;
use crate::config::RetryConfig;
use crate::host::{LoadObserver, ResetSignal};
use crate::image::swap_pairs;
use crate::transfer::disk_io::{
    completion_queue, BackingStore, CompletionReceiver, CompletionSender, DeviceStatus, ReadRequest,
    StatusClass,
};

/// Device link counters.
#[derive(Debug, Clone, Default)]
pub struct LinkStats {
    pub reads: u64,
    pub reissues: u64,
    pub short_reads: u64,
    pub stale_completions: u64,
}

/// Single-outstanding-read connection to the backing store.
pub struct DeviceLink {
    store: Box<dyn BackingStore>,

    /// Offset of the image within the backing file.
    base_offset: u64,

    tx: CompletionSender,
    rx: CompletionReceiver,

    next_ticket: u64,
    in_flight: Option<ReadRequest>,

    /// Consecutive recoverable faults on the current read.
    reissues: u32,
    /// Consecutive fatal status polls on the current read.
    fatal_polls: u32,

    retry: RetryConfig,
    stats: LinkStats,
}

impl DeviceLink {
    pub fn new(store: Box<dyn BackingStore>, base_offset: u64, retry: RetryConfig) -> Self {
        let (tx, rx) = completion_queue();
        Self {
            store,
            base_offset,
            tx,
            rx,
            next_ticket: 0,
            in_flight: None,
            reissues: 0,
            fatal_polls: 0,
            retry,
            stats: LinkStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        self.store.name()
    }

    /// Bytes of image available behind the base offset.
    pub fn image_len(&self) -> u64 {
        self.store.len().saturating_sub(self.base_offset)
    }

    pub fn granularity(&self) -> usize {
        self.store.granularity().max(1)
    }

    /// Round `len` up to the device granularity.
    pub fn read_len(&self, len: usize) -> usize {
        len.next_multiple_of(self.granularity())
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    /// Submit a read of `len` bytes at image offset `offset`. `len` must
    /// already be a multiple of the granularity.
    pub fn issue(&mut self, offset: u64, len: usize) -> Result<(), CacheError> {
        if self.in_flight.is_some() {
            self.cancel();
        }
        self.next_ticket += 1;
        let request = ReadRequest {
            ticket: self.next_ticket,
            offset: self.base_offset + offset,
            len,
        };
        self.store.submit(request, self.tx.clone())?;
        self.in_flight = Some(request);
        self.stats.reads += 1;
        Ok(())
    }

    /// Cancel the current read and submit it again under a fresh ticket.
    fn reissue(&mut self, request: ReadRequest) -> Result<(), CacheError> {
        self.store.cancel();
        self.stats.reissues += 1;
        self.next_ticket += 1;
        let request = ReadRequest {
            ticket: self.next_ticket,
            ..request
        };
        if let Err(e) = self.store.submit(request, self.tx.clone()) {
            self.in_flight = None;
            self.reissues = 0;
            self.fatal_polls = 0;
            return Err(e.into());
        }
        self.in_flight = Some(request);
        Ok(())
    }

    /// Abandon the read in flight. Its completion, if it still arrives, is
    /// discarded as stale.
    pub fn cancel(&mut self) {
        if self.in_flight.take().is_some() {
            self.store.cancel();
        }
        self.reissues = 0;
        self.fatal_polls = 0;
    }

    /// Pull the completion for `request` out of the queue, dropping stale ones.
    fn take_completion(&mut self, request: ReadRequest) -> Option<Bytes> {
        while let Ok(done) = self.rx.try_recv() {
            if done.ticket == request.ticket {
                return Some(done.data);
            }
            self.stats.stale_completions += 1;
        }
        None
    }

    /// One polling step: drain the completion queue, then poll drive status
    /// once. Returns the data of the read in flight once it has completed.
    pub fn service(&mut self, observer: &mut dyn LoadObserver) -> Result<Option<Bytes>, CacheError> {
        let Some(request) = self.in_flight else {
            return Ok(None);
        };

        if let Some(data) = self.take_completion(request) {
            return self.finish(request, data);
        }

        let status = self.store.status();
        match status.class() {
            StatusClass::Normal => {
                self.fatal_polls = 0;
                if let Some(data) = self.take_completion(request) {
                    return self.finish(request, data);
                }
            }
            StatusClass::Transient => {
                self.fatal_polls = 0;
                observer.show_reading();
            }
            StatusClass::Recoverable => {
                self.reissues += 1;
                if self.reissues > self.retry.max_reissues {
                    warn!(%status, reissues = self.reissues, "Recoverable fault persists, escalating");
                    self.escalate(request, status, observer)?;
                } else {
                    debug!(%status, ticket = request.ticket, "Reissuing read");
                    self.reissue(request)?;
                }
            }
            StatusClass::Fatal => {
                self.fatal_polls += 1;
                if self.fatal_polls >= self.retry.fatal_threshold.max(1) {
                    self.escalate(request, status, observer)?;
                }
            }
        }
        Ok(None)
    }

    fn finish(&mut self, request: ReadRequest, data: Bytes) -> Result<Option<Bytes>, CacheError> {
        if data.len() != request.len {
            warn!(
                expected = request.len,
                got = data.len(),
                offset = request.offset,
                "Short read, reissuing"
            );
            self.stats.short_reads += 1;
            self.reissue(request)?;
            return Ok(None);
        }
        self.in_flight = None;
        self.reissues = 0;
        self.fatal_polls = 0;
        Ok(Some(data))
    }

    /// Put the fault in front of the operator.
    fn escalate(
        &mut self,
        request: ReadRequest,
        status: DeviceStatus,
        observer: &mut dyn LoadObserver,
    ) -> Result<(), CacheError> {
        self.reissues = 0;
        self.fatal_polls = 0;
        if observer.show_error(status, self.store.name()) {
            info!(%status, "Operator requested retry");
            self.reissue(request)
        } else {
            self.cancel();
            Err(CacheError::MediaUnavailable { status })
        }
    }

    /// Wait for the read in flight, servicing the device until it completes.
    pub fn wait(
        &mut self,
        observer: &mut dyn LoadObserver,
        reset: &dyn ResetSignal,
    ) -> Result<Bytes, CacheError> {
        loop {
            if reset.reset_requested() {
                self.cancel();
                return Err(CacheError::Cancelled);
            }
            if let Some(data) = self.service(observer)? {
                return Ok(data);
            }
            if !self.is_busy() {
                return Err(CacheError::Cancelled);
            }
            std::thread::yield_now();
        }
    }

    /// Read `len` bytes at image offset `offset` and wait for them.
    pub fn fetch_blocking(
        &mut self,
        offset: u64,
        len: usize,
        observer: &mut dyn LoadObserver,
        reset: &dyn ResetSignal,
    ) -> Result<Bytes, CacheError> {
        self.issue(offset, self.read_len(len))?;
        self.wait(observer, reset)
    }
}

/// Who is waiting on a block load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadWaiter {
    /// The streaming copy, which resumes on its next step.
    Copy,
    /// The prefetch loop.
    Prefetch,
    /// A caller blocked inside the load.
    Blocking,
}

/// One block read in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOperation {
    pub block: usize,
    /// Primary slot the block lands in.
    pub slot: usize,
    /// Image bytes covered by the block.
    pub len: usize,
    /// Bytes actually read, rounded to the device granularity.
    pub read_len: usize,
    pub waiter: LoadWaiter,
}

/// Loads whole blocks through a [`DeviceLink`].
pub struct BlockLoader {
    link: DeviceLink,
    pending: Option<LoadOperation>,

    /// Pair-swap loaded data into native order.
    flip: bool,

    blocks_loaded: u64,
}

impl BlockLoader {
    pub fn new(link: DeviceLink) -> Self {
        Self {
            link,
            pending: None,
            flip: false,
            blocks_loaded: 0,
        }
    }

    pub fn set_flip(&mut self, flip: bool) {
        self.flip = flip;
    }

    pub fn flip(&self) -> bool {
        self.flip
    }

    pub fn link(&self) -> &DeviceLink {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut DeviceLink {
        &mut self.link
    }

    pub fn pending(&self) -> Option<&LoadOperation> {
        self.pending.as_ref()
    }

    pub fn blocks_loaded(&self) -> u64 {
        self.blocks_loaded
    }

    /// Issue the read for `block` into primary slot `slot`.
    pub fn start(
        &mut self,
        table: &BlockTable,
        block: usize,
        slot: usize,
        waiter: LoadWaiter,
    ) -> Result<(), CacheError> {
        let len = table.block_len(block);
        let read_len = self.link.read_len(len).min(BLOCK_SIZE);

        self.link.issue(BlockTable::block_offset(block), read_len)?;
        self.pending = Some(LoadOperation {
            block,
            slot,
            len,
            read_len,
            waiter,
        });
        debug!(block, slot, ?waiter, "Block load issued");
        Ok(())
    }

    /// Service the device. Returns the load that completed during this step.
    pub fn poll(
        &mut self,
        pager: &mut Pager,
        observer: &mut dyn LoadObserver,
    ) -> Result<Option<LoadOperation>, CacheError> {
        if self.pending.is_none() {
            return Ok(None);
        }
        let data = match self.link.service(observer) {
            Ok(Some(data)) => data,
            Ok(None) => return Ok(None),
            Err(e) => {
                if let Some(op) = self.pending.take() {
                    debug!(block = op.block, error = %e, "Block load failed");
                }
                return Err(e);
            }
        };
        let Some(op) = self.pending.take() else {
            return Ok(None);
        };
        self.complete(pager, &op, &data);
        Ok(Some(op))
    }

    fn complete(&mut self, pager: &mut Pager, op: &LoadOperation, data: &[u8]) {
        let slot = pager.primary_slot_mut(op.slot);
        let n = data.len().min(slot.len());
        slot[..n].copy_from_slice(&data[..n]);
        if self.flip {
            swap_pairs(slot, op.len);
        }
        pager.mark_resident(op.block, op.slot, op.len);
        self.blocks_loaded += 1;
    }

    /// Load `block` into `slot` and wait for it.
    pub fn load_blocking(
        &mut self,
        pager: &mut Pager,
        block: usize,
        slot: usize,
        observer: &mut dyn LoadObserver,
        reset: &dyn ResetSignal,
    ) -> Result<(), CacheError> {
        self.start(pager.table(), block, slot, LoadWaiter::Blocking)?;
        self.wait_pending(pager, observer, reset)?;
        Ok(())
    }

    /// Block until the load in flight, if any, has completed.
    pub fn wait_pending(
        &mut self,
        pager: &mut Pager,
        observer: &mut dyn LoadObserver,
        reset: &dyn ResetSignal,
    ) -> Result<Option<LoadOperation>, CacheError> {
        if self.pending.is_none() {
            return Ok(None);
        }
        let data = match self.link.wait(observer, reset) {
            Ok(data) => data,
            Err(e) => {
                self.pending = None;
                return Err(e);
            }
        };
        let op = self.pending.take();
        if let Some(op) = &op {
            self.complete(pager, op, &data);
        }
        Ok(op)
    }

    /// Make room in the primary tier for `block` and load it, waiting.
    pub fn fetch_block(
        &mut self,
        pager: &mut Pager,
        block: usize,
        observer: &mut dyn LoadObserver,
        reset: &dyn ResetSignal,
    ) -> Result<usize, CacheError> {
        let slot = pager.ensure_free_slot(Tier::Primary, &[block])?;
        self.load_blocking(pager, block, slot, observer, reset)?;
        Ok(slot)
    }

    /// Drop the load in flight. Nothing was claimed for it.
    pub fn cancel(&mut self) {
        if let Some(op) = self.pending.take() {
            debug!(block = op.block, "Block load cancelled");
        }
        self.link.cancel();
    }
}
