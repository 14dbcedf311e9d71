//! Slot occupancy bitmaps, one per tier.
//!
//! A set bit means the slot's bytes belong to some resident block.

/// Fixed-size occupancy bitmap over the slots of one tier.
#[derive(Debug, Clone)]
pub struct SlotBitmap {
    words: Vec<u64>,
    slots: usize,
}

impl SlotBitmap {
    pub fn new(slots: usize) -> Self {
        Self {
            words: vec![0; slots.div_ceil(64)],
            slots,
        }
    }

    /// Total number of slots tracked.
    pub fn capacity(&self) -> usize {
        self.slots
    }

    pub fn is_set(&self, slot: usize) -> bool {
        slot < self.slots && self.words[slot / 64] & (1 << (slot % 64)) != 0
    }

    pub fn set(&mut self, slot: usize) {
        debug_assert!(slot < self.slots);
        self.words[slot / 64] |= 1 << (slot % 64);
    }

    pub fn clear(&mut self, slot: usize) {
        debug_assert!(slot < self.slots);
        self.words[slot / 64] &= !(1 << (slot % 64));
    }

    pub fn clear_all(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    /// Lowest-numbered free slot, if any.
    pub fn find_free(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .find(|(_, w)| **w != u64::MAX)
            .map(|(i, w)| i * 64 + (!*w).trailing_zeros() as usize)
            .filter(|&slot| slot < self.slots)
    }

    /// Number of occupied slots.
    pub fn count_set(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Iterate over occupied slot indices.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.slots).filter(move |&s| self.is_set(s))
    }
}
