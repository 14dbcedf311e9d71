//! Prefetching: stages the blocks of a hot range before the consumer reads
//! them.
//!
//! A streaming read whose start offset falls inside a hot range arms the
//! prefetch window with that range. The window is then walked a block at a
//! time whenever the device is otherwise idle: resident blocks are refreshed,
//! the first missing one is loaded asynchronously.

use std::ops::Range;

use tracing::debug;

use crate::cache::block::{BlockTable, Tier};
use crate::cache::loader::{BlockLoader, LoadWaiter};
use crate::cache::pager::Pager;
use crate::cache::CacheError;

/// Sorted, non-overlapping table of hot byte ranges.
#[derive(Debug, Clone, Default)]
pub struct HotRangeTable {
    ranges: Vec<Range<u64>>,
}

impl HotRangeTable {
    /// Build from arbitrary half-open ranges. Empty ranges are dropped and
    /// overlapping or touching ones merged.
    pub fn new(mut ranges: Vec<Range<u64>>) -> Self {
        ranges.retain(|r| r.start < r.end);
        ranges.sort_by_key(|r| r.start);

        let mut merged: Vec<Range<u64>> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match merged.last_mut() {
                Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
                _ => merged.push(range),
            }
        }
        Self { ranges: merged }
    }

    /// Build from a flat list of inclusive `first, last` pairs.
    pub fn from_inclusive_pairs(pairs: &[u64]) -> Self {
        Self::new(pairs.chunks_exact(2).map(|p| p[0]..p[1] + 1).collect())
    }

    /// The hot range containing `offset`, if any.
    pub fn lookup(&self, offset: u64) -> Option<Range<u64>> {
        let idx = self.ranges.partition_point(|r| r.start <= offset);
        let candidate = self.ranges.get(idx.checked_sub(1)?)?;
        candidate.contains(&offset).then(|| candidate.clone())
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Walks the armed prefetch window.
#[derive(Debug, Default)]
pub struct Prefetcher {
    /// Blocks still to visit.
    window: Option<Range<usize>>,
    enabled: bool,
    issued: u64,
}

impl Prefetcher {
    pub fn new(enabled: bool) -> Self {
        Self {
            window: None,
            enabled,
            issued: 0,
        }
    }

    /// Arm the window with the blocks covering `bytes`.
    pub fn arm(&mut self, table: &BlockTable, bytes: Range<u64>) {
        if !self.enabled {
            return;
        }
        let blocks = table.blocks_in_range(bytes.start, bytes.end);
        if !blocks.is_empty() {
            debug!(first = blocks.start, last = blocks.end - 1, "Prefetch window armed");
            self.window = Some(blocks);
        }
    }

    pub fn window(&self) -> Option<&Range<usize>> {
        self.window.as_ref()
    }

    pub fn clear(&mut self) {
        self.window = None;
    }

    /// Prefetch loads issued so far.
    pub fn issued(&self) -> u64 {
        self.issued
    }

    /// Advance the window. Does nothing while any load is in flight.
    pub fn step(&mut self, pager: &mut Pager, loader: &mut BlockLoader) -> Result<(), CacheError> {
        if loader.pending().is_some() {
            return Ok(());
        }
        let Some(window) = self.window.as_mut() else {
            return Ok(());
        };

        while window.start < window.end {
            let block = window.start;
            pager.touch(block);
            if !pager.table().get(block).is_resident() {
                let slot = match pager.ensure_free_slot(Tier::Primary, &[block]) {
                    Ok(slot) => slot,
                    Err(CacheError::NoEvictableSlot { .. }) => {
                        debug!(block, "No room to prefetch, dropping window");
                        self.window = None;
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                };
                loader.start(pager.table(), block, slot, LoadWaiter::Prefetch)?;
                self.issued += 1;
                return Ok(());
            }
            window.start += 1;
        }

        self.window = None;
        Ok(())
    }
}
