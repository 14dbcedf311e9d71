//! Two-tier ROM block cache.
//!
//! This module contains the core cache data structures and algorithms:
//! - [`block`]: BlockMeta, BlockTable, Tier and TierSlot definitions
//! - [`slots`]: per-tier slot occupancy bitmaps
//! - [`evictor`]: recency-based candidate selection with pin filtering
//! - [`pager`]: tier buffers, slot allocation and tier migration
//! - [`loader`]: backing-store reads, retry policy and block completion
//! - [`prefetcher`]: hot-range table and the prefetch window
//! - [`stream`]: cooperative multi-block copy state machine
//! - [`immediate`]: synchronous copy out of resident blocks
//! - [`manager`]: the `ImageCache` facade tying it all together

pub mod block;
pub mod evictor;
pub mod immediate;
pub mod loader;
pub mod manager;
pub mod pager;
pub mod prefetcher;
pub mod slots;
pub mod stream;

use thiserror::Error;

use crate::cache::block::Tier;
use crate::memory::HeapError;
use crate::transfer::aux_dma::AuxError;
use crate::transfer::disk_io::{DeviceError, DeviceStatus};

pub use manager::{ImageCache, LoadMode};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("No evictable slot in the {tier} tier")]
    NoEvictableSlot { tier: Tier },

    #[error("Block {block} is not resident")]
    NotResident { block: usize },

    #[error("Media unavailable: drive reports {status}")]
    MediaUnavailable { status: DeviceStatus },

    #[error("Operation cancelled by reset")]
    Cancelled,

    #[error("A streaming copy is already in progress")]
    CopyInProgress,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Cache state is inconsistent: {0}")]
    Invariant(String),

    #[error("Completion hook failed: {0}")]
    Hook(String),

    #[error("Backing store error: {0}")]
    Device(#[from] DeviceError),

    #[error("Secondary memory error: {0}")]
    Aux(#[from] AuxError),

    #[error("Buffer reservation failed: {0}")]
    Heap(#[from] HeapError),
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub blocks_loaded: u64,
    pub demotions: u64,
    pub promotions: u64,
    pub evictions: u64,
    pub reissues: u64,
    pub short_reads: u64,
    pub primary_hits: u64,
    pub secondary_hits: u64,
    pub misses: u64,
    pub prefetched: u64,
    pub primary_resident: usize,
    pub secondary_resident: usize,
}

impl CacheStats {
    /// Fraction of block lookups served without touching the backing store.
    pub fn hit_rate(&self) -> f64 {
        let total = self.primary_hits + self.secondary_hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        (self.primary_hits + self.secondary_hits) as f64 / total as f64
    }
}
