//! Streaming copy: a multi-block read advanced cooperatively, one step per
//! caller iteration.
//!
//! Each step copies at most one block. A block that is not resident is
//! loaded asynchronously and the step returns `Pending`; the copy resumes on
//! the step after the load completes.

use tracing::{debug, trace};

use crate::cache::block::{BlockTable, Tier, BLOCK_SIZE};
use crate::cache::loader::{BlockLoader, LoadWaiter};
use crate::cache::pager::Pager;
use crate::cache::CacheError;
use crate::host::{LoadObserver, ResetSignal};

/// Runs once after the last byte of a copy has been delivered.
pub type CopyHook = Box<dyn FnOnce() -> Result<(), CacheError> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyState {
    Idle,
    AwaitingLoad,
    Copying,
    Done,
    Failed,
}

/// Outcome of one step.
#[derive(Debug, PartialEq, Eq)]
pub enum CopyPoll {
    /// No copy has been started.
    Idle,
    /// More steps are needed.
    Pending,
    /// The copy finished; these are its bytes.
    Ready(Vec<u8>),
}

impl CopyPoll {
    pub fn is_ready(&self) -> bool {
        matches!(self, CopyPoll::Ready(_))
    }
}

/// Lookup outcomes seen by the copy.
#[derive(Debug, Clone, Default)]
pub struct StreamStats {
    pub primary_hits: u64,
    pub secondary_hits: u64,
    pub misses: u64,
}

/// The copy in progress.
pub struct CopyOp {
    /// Image offset of the next byte to deliver.
    offset: u64,
    remaining: usize,
    out: Vec<u8>,
    hook: Option<CopyHook>,
    /// Load missing blocks synchronously instead of yielding.
    blocking: bool,
}

impl CopyOp {
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
}

pub struct StreamCopy {
    state: CopyState,
    op: Option<CopyOp>,
    stats: StreamStats,
}

impl Default for StreamCopy {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamCopy {
    pub fn new() -> Self {
        Self {
            state: CopyState::Idle,
            op: None,
            stats: StreamStats::default(),
        }
    }

    pub fn state(&self) -> CopyState {
        self.state
    }

    pub fn op(&self) -> Option<&CopyOp> {
        self.op.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.op.is_some()
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    /// Start copying `[offset, offset + size)`, clamped to the image end.
    pub fn begin(
        &mut self,
        image_size: u64,
        offset: u64,
        size: usize,
        hook: Option<CopyHook>,
        blocking: bool,
    ) -> Result<(), CacheError> {
        if self.is_active() {
            return Err(CacheError::CopyInProgress);
        }
        let remaining = image_size.saturating_sub(offset).min(size as u64) as usize;

        self.op = Some(CopyOp {
            offset,
            remaining,
            out: Vec::with_capacity(remaining),
            hook,
            blocking,
        });
        self.state = CopyState::Copying;
        trace!(offset, size = remaining, blocking, "Copy started");
        Ok(())
    }

    /// Drop the copy and mark it failed.
    pub fn abort(&mut self) {
        if self.op.take().is_some() {
            debug!("Copy aborted");
        }
        self.state = CopyState::Failed;
    }

    /// Advance the copy by at most one block.
    pub fn step(
        &mut self,
        pager: &mut Pager,
        loader: &mut BlockLoader,
        observer: &mut dyn LoadObserver,
        reset: &dyn ResetSignal,
    ) -> Result<CopyPoll, CacheError> {
        match self.step_inner(pager, loader, observer, reset) {
            Ok(poll) => Ok(poll),
            Err(e) => {
                self.op = None;
                self.state = CopyState::Failed;
                Err(e)
            }
        }
    }

    fn step_inner(
        &mut self,
        pager: &mut Pager,
        loader: &mut BlockLoader,
        observer: &mut dyn LoadObserver,
        reset: &dyn ResetSignal,
    ) -> Result<CopyPoll, CacheError> {
        let Some(op) = self.op.as_mut() else {
            return Ok(CopyPoll::Idle);
        };

        while op.remaining > 0 {
            if loader.pending().is_some() {
                if !op.blocking {
                    self.state = CopyState::AwaitingLoad;
                    return Ok(CopyPoll::Pending);
                }
                loader.wait_pending(pager, observer, reset)?;
            }

            let block = BlockTable::block_for_offset(op.offset);
            let previous = pager.touch(block);
            let meta = pager.table().get(block);
            let (resident, in_secondary) = (meta.is_resident(), meta.is_resident_in(Tier::Secondary));

            if !resident {
                self.stats.misses += 1;
                if op.blocking {
                    loader.fetch_block(pager, block, observer, reset)?;
                } else {
                    let slot = pager.ensure_free_slot(Tier::Primary, &[block])?;
                    pager.rollback_touch(block, previous);
                    loader.start(pager.table(), block, slot, LoadWaiter::Copy)?;
                    self.state = CopyState::AwaitingLoad;
                    return Ok(CopyPoll::Pending);
                }
            } else if in_secondary {
                self.stats.secondary_hits += 1;
                pager.move_to(Tier::Primary, block, &[])?;
            } else {
                self.stats.primary_hits += 1;
            }

            let bytes = pager
                .primary_bytes(block)
                .ok_or(CacheError::NotResident { block })?;
            let intra = (op.offset % BLOCK_SIZE as u64) as usize;
            let n = op.remaining.min(bytes.len().saturating_sub(intra));
            if n == 0 {
                return Err(CacheError::NotResident { block });
            }
            op.out.extend_from_slice(&bytes[intra..intra + n]);
            op.offset += n as u64;
            op.remaining -= n;

            if op.remaining > 0 && !op.blocking {
                self.state = CopyState::Copying;
                return Ok(CopyPoll::Pending);
            }
        }

        let Some(mut op) = self.op.take() else {
            return Ok(CopyPoll::Idle);
        };
        if let Some(hook) = op.hook.take() {
            hook()?;
        }
        self.state = CopyState::Done;
        Ok(CopyPoll::Ready(op.out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::loader::DeviceLink;
    use crate::config::RetryConfig;
    use crate::host::{NeverReset, TracingObserver};
    use crate::transfer::aux_dma::HostAuxMemory;
    use crate::transfer::disk_io::MemoryBackingStore;

    fn image(blocks: usize) -> Vec<u8> {
        (0..blocks * BLOCK_SIZE).map(|i| (i / 7) as u8).collect()
    }

    fn parts(data: &[u8], primary: usize) -> (Pager, BlockLoader) {
        let aux = HostAuxMemory::new(4 * BLOCK_SIZE, BLOCK_SIZE, 32);
        let pager = Pager::new(data.len() as u64, vec![0u8; primary * BLOCK_SIZE], Box::new(aux), 4);
        let store = MemoryBackingStore::new("mem", data.to_vec());
        let loader = BlockLoader::new(DeviceLink::new(Box::new(store), 0, RetryConfig::default()));
        (pager, loader)
    }

    fn run(copy: &mut StreamCopy, pager: &mut Pager, loader: &mut BlockLoader) -> (Vec<u8>, usize) {
        let mut observer = TracingObserver::new();
        for steps in 1..100 {
            loader.poll(pager, &mut observer).unwrap();
            if let CopyPoll::Ready(bytes) = copy.step(pager, loader, &mut observer, &NeverReset).unwrap() {
                return (bytes, steps);
            }
        }
        panic!("copy did not finish");
    }

    #[test]
    fn test_copy_spanning_blocks() {
        let data = image(4);
        let (mut pager, mut loader) = parts(&data, 4);
        let mut copy = StreamCopy::new();

        copy.begin(data.len() as u64, 100, BLOCK_SIZE * 2, None, false).unwrap();
        let (bytes, steps) = run(&mut copy, &mut pager, &mut loader);

        assert_eq!(bytes, &data[100..100 + 2 * BLOCK_SIZE]);
        assert!(steps >= 3);
        assert_eq!(copy.state(), CopyState::Done);
        assert_eq!(copy.stats().misses, 3);
        pager.check_invariants().unwrap();
    }

    #[test]
    fn test_copy_clamped_at_image_end() {
        let data = image(2);
        let (mut pager, mut loader) = parts(&data, 2);
        let mut copy = StreamCopy::new();

        copy.begin(data.len() as u64, (2 * BLOCK_SIZE - 10) as u64, 100, None, false).unwrap();
        let (bytes, _) = run(&mut copy, &mut pager, &mut loader);
        assert_eq!(bytes.len(), 10);
    }

    #[test]
    fn test_empty_copy_is_ready_immediately() {
        let data = image(1);
        let (mut pager, mut loader) = parts(&data, 1);
        let mut copy = StreamCopy::new();

        copy.begin(data.len() as u64, 0x10_0000, 64, None, false).unwrap();
        let poll = copy
            .step(&mut pager, &mut loader, &mut TracingObserver::new(), &NeverReset)
            .unwrap();
        assert_eq!(poll, CopyPoll::Ready(Vec::new()));
    }

    #[test]
    fn test_second_begin_rejected_while_active() {
        let mut copy = StreamCopy::new();
        copy.begin(0x4000, 0, 0x100, None, false).unwrap();
        assert!(matches!(copy.begin(0x4000, 0, 0x100, None, false), Err(CacheError::CopyInProgress)));
    }

    #[test]
    fn test_hook_failure_fails_copy() {
        let data = image(1);
        let (mut pager, mut loader) = parts(&data, 1);
        let mut copy = StreamCopy::new();

        let hook: CopyHook = Box::new(|| Err(CacheError::Hook("consumer rejected".into())));
        copy.begin(data.len() as u64, 0, 16, Some(hook), true).unwrap();
        let err = copy
            .step(&mut pager, &mut loader, &mut TracingObserver::new(), &NeverReset)
            .unwrap_err();
        assert!(matches!(err, CacheError::Hook(_)));
        assert_eq!(copy.state(), CopyState::Failed);
        assert!(!copy.is_active());
    }

    #[test]
    fn test_blocking_copy_finishes_in_one_step() {
        let data = image(3);
        let (mut pager, mut loader) = parts(&data, 2);
        let mut copy = StreamCopy::new();

        copy.begin(data.len() as u64, 0, data.len(), None, true).unwrap();
        let poll = copy
            .step(&mut pager, &mut loader, &mut TracingObserver::new(), &NeverReset)
            .unwrap();
        assert_eq!(poll, CopyPoll::Ready(data.clone()));
        pager.check_invariants().unwrap();
    }
}
