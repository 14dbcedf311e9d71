//! Block metadata and the per-image block table.
//!
//! The image is divided into fixed-size blocks. Blocks are the unit of
//! residency: they are loaded, demoted, promoted and evicted as whole units.

use serde::{Deserialize, Serialize};

/// Size of one image block in bytes.
pub const BLOCK_SIZE: usize = 0x2000;

/// Identifies one of the two cache tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Main-memory cache, directly addressable by the consumer.
    Primary,
    /// Auxiliary memory, reachable only through chunked transfers.
    Secondary,
}

impl Tier {
    /// Returns the tier a block is pushed to when it leaves this one,
    /// or None if leaving this tier means dropping the data.
    pub fn demote(&self) -> Option<Tier> {
        match self {
            Tier::Primary => Some(Tier::Secondary),
            Tier::Secondary => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Primary => write!(f, "primary"),
            Tier::Secondary => write!(f, "secondary"),
        }
    }
}

/// A slot index tagged with the tier it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TierSlot {
    Primary(usize),
    Secondary(usize),
}

impl TierSlot {
    pub fn new(tier: Tier, index: usize) -> Self {
        match tier {
            Tier::Primary => TierSlot::Primary(index),
            Tier::Secondary => TierSlot::Secondary(index),
        }
    }

    pub fn tier(&self) -> Tier {
        match self {
            TierSlot::Primary(_) => Tier::Primary,
            TierSlot::Secondary(_) => Tier::Secondary,
        }
    }

    pub fn index(&self) -> usize {
        match *self {
            TierSlot::Primary(i) | TierSlot::Secondary(i) => i,
        }
    }

    /// Byte offset of this slot within its tier buffer.
    pub fn byte_offset(&self) -> usize {
        self.index() * BLOCK_SIZE
    }
}

/// Whether a block may be chosen by ordinary eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PinClass {
    /// Normal eviction candidate.
    #[default]
    Normal,
    /// Protected ("kept") block; never evicted outright, only demoted.
    Kept,
}

/// Per-block residency metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockMeta {
    /// Bytes of the image held by this block (0 = not cached).
    pub resident_size: usize,

    /// Slot currently holding the block's bytes.
    pub slot: Option<TierSlot>,

    /// Tick of the most recent access.
    pub last_used_tick: u32,

    /// Eviction protection class.
    pub pin: PinClass,
}

impl BlockMeta {
    pub fn is_resident(&self) -> bool {
        self.resident_size != 0
    }

    /// Whether this block's bytes currently live in the given tier.
    pub fn is_resident_in(&self, tier: Tier) -> bool {
        self.is_resident() && self.slot.map(|s| s.tier()) == Some(tier)
    }

    /// Drop residency. The caller is responsible for the slot bitmap.
    pub fn clear(&mut self) {
        self.resident_size = 0;
        self.slot = None;
    }
}

/// Fixed-capacity table holding one entry per block of the image.
#[derive(Debug)]
pub struct BlockTable {
    blocks: Vec<BlockMeta>,

    /// Total image size in bytes.
    image_size: u64,
}

impl BlockTable {
    /// Create a table covering an image of `image_size` bytes.
    pub fn new(image_size: u64) -> Self {
        let count = image_size.div_ceil(BLOCK_SIZE as u64) as usize;
        Self {
            blocks: vec![BlockMeta::default(); count],
            image_size,
        }
    }

    /// Index of the block containing byte `offset`.
    pub fn block_for_offset(offset: u64) -> usize {
        (offset / BLOCK_SIZE as u64) as usize
    }

    /// Byte offset of a block within the image.
    pub fn block_offset(index: usize) -> u64 {
        index as u64 * BLOCK_SIZE as u64
    }

    /// Number of image bytes covered by block `index` (short for the last block).
    pub fn block_len(&self, index: usize) -> usize {
        let start = Self::block_offset(index);
        self.image_size.saturating_sub(start).min(BLOCK_SIZE as u64) as usize
    }

    /// Indices of all blocks overlapping `[start, end)`.
    pub fn blocks_in_range(&self, start: u64, end: u64) -> std::ops::Range<usize> {
        let end = end.min(self.image_size);
        if start >= end {
            return 0..0;
        }
        Self::block_for_offset(start)..Self::block_for_offset(end - 1) + 1
    }

    pub fn get(&self, index: usize) -> &BlockMeta {
        &self.blocks[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut BlockMeta {
        &mut self.blocks[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &BlockMeta)> {
        self.blocks.iter().enumerate()
    }

    /// Forget every block's residency and recency.
    pub fn reset(&mut self) {
        for block in &mut self.blocks {
            *block = BlockMeta::default();
        }
    }

    /// Number of blocks in the image.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn image_size(&self) -> u64 {
        self.image_size
    }

    /// Number of blocks resident in the given tier.
    pub fn resident_in(&self, tier: Tier) -> usize {
        self.blocks.iter().filter(|b| b.is_resident_in(tier)).count()
    }
}
