//! Pager: owns both tier buffers and moves blocks between them.
//!
//! The pager is the only place that mutates residency. It:
//! - Hands out primary and secondary slots, making room when a tier is full
//! - Demotes primary blocks into the secondary tier before dropping anything
//! - Promotes secondary blocks back through the aux transfer channel
//! - Keeps the slot bitmaps and the block table in agreement

use tracing::{debug, trace};

use crate::cache::block::{BlockTable, PinClass, Tier, TierSlot, BLOCK_SIZE};
use crate::cache::evictor::{find_eviction_candidate, PinFilter};
use crate::cache::slots::SlotBitmap;
use crate::cache::CacheError;
use crate::transfer::aux_dma::AuxMemory;

/// Block movement counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PagerStats {
    /// Primary blocks pushed down into the secondary tier.
    pub demotions: u64,
    /// Secondary blocks brought back into the primary tier.
    pub promotions: u64,
    /// Blocks dropped from the cache entirely.
    pub evictions: u64,
}

pub struct Pager {
    table: BlockTable,

    /// Primary tier buffer, one `BLOCK_SIZE` slot after another.
    primary: Vec<u8>,
    primary_slots: SlotBitmap,

    /// Secondary tier, reachable only through its transfer channel.
    secondary: Box<dyn AuxMemory>,
    secondary_slots: SlotBitmap,

    /// Image clock. Wraps.
    tick: u32,

    stats: PagerStats,
}

impl Pager {
    /// Create a pager for an image of `image_size` bytes.
    ///
    /// The primary tier gets one slot per whole block of `primary`; the
    /// secondary tier gets `secondary_slots` slots, capped by what the aux
    /// memory can hold.
    pub fn new(
        image_size: u64,
        primary: Vec<u8>,
        secondary: Box<dyn AuxMemory>,
        secondary_slots: usize,
    ) -> Self {
        let primary_count = primary.len() / BLOCK_SIZE;
        let secondary_count = secondary_slots.min(secondary.capacity() / BLOCK_SIZE);

        debug!(
            blocks = image_size.div_ceil(BLOCK_SIZE as u64),
            primary_slots = primary_count,
            secondary_slots = secondary_count,
            "Pager created"
        );

        Self {
            table: BlockTable::new(image_size),
            primary,
            primary_slots: SlotBitmap::new(primary_count),
            secondary,
            secondary_slots: SlotBitmap::new(secondary_count),
            tick: 0,
            stats: PagerStats::default(),
        }
    }

    pub fn table(&self) -> &BlockTable {
        &self.table
    }

    pub fn tick(&self) -> u32 {
        self.tick
    }

    pub fn set_tick(&mut self, tick: u32) {
        self.tick = tick;
    }

    pub fn stats(&self) -> &PagerStats {
        &self.stats
    }

    pub fn slot_count(&self, tier: Tier) -> usize {
        self.bitmap(tier).capacity()
    }

    pub fn used_slots(&self, tier: Tier) -> usize {
        self.bitmap(tier).count_set()
    }

    fn bitmap(&self, tier: Tier) -> &SlotBitmap {
        match tier {
            Tier::Primary => &self.primary_slots,
            Tier::Secondary => &self.secondary_slots,
        }
    }

    fn bitmap_mut(&mut self, tier: Tier) -> &mut SlotBitmap {
        match tier {
            Tier::Primary => &mut self.primary_slots,
            Tier::Secondary => &mut self.secondary_slots,
        }
    }

    /// Stamp `block` with a fresh tick. Returns the stamp it had before, for
    /// [`Pager::rollback_touch`].
    pub fn touch(&mut self, block: usize) -> u32 {
        self.tick = self.tick.wrapping_add(1);
        let meta = self.table.get_mut(block);
        let previous = meta.last_used_tick;
        meta.last_used_tick = self.tick;
        previous
    }

    /// Undo the most recent [`Pager::touch`] of `block`.
    pub fn rollback_touch(&mut self, block: usize, previous: u32) {
        self.table.get_mut(block).last_used_tick = previous;
        self.tick = self.tick.wrapping_sub(1);
    }

    pub fn set_last_used(&mut self, block: usize, tick: u32) {
        self.table.get_mut(block).last_used_tick = tick;
    }

    pub fn set_pin(&mut self, block: usize, pin: PinClass) {
        self.table.get_mut(block).pin = pin;
    }

    /// Lowest free slot of `tier`.
    pub fn find_free(&self, tier: Tier) -> Option<usize> {
        self.bitmap(tier).find_free()
    }

    /// Return a free slot of `tier`, making room if necessary.
    ///
    /// A full primary tier first demotes its least-recently-used block of any
    /// pin class into the secondary tier; if that is impossible it drops its
    /// least-recently-used unpinned block. A full secondary tier drops its
    /// least-recently-used unpinned block. Blocks in `protected` are never
    /// chosen.
    pub fn ensure_free_slot(&mut self, tier: Tier, protected: &[usize]) -> Result<usize, CacheError> {
        if let Some(slot) = self.find_free(tier) {
            return Ok(slot);
        }

        if let Some(next) = tier.demote() {
            if let Some(victim) =
                find_eviction_candidate(&self.table, tier, PinFilter::Any, self.tick, protected)
            {
                let freed = self.slot_of(victim.block)?;
                match self.move_to(next, victim.block, protected) {
                    Ok(()) => {
                        self.stats.demotions += 1;
                        return Ok(freed.index());
                    }
                    Err(CacheError::NoEvictableSlot { .. }) => {
                        trace!(block = victim.block, "Demotion impossible, evicting instead");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let victim = find_eviction_candidate(
            &self.table,
            tier,
            PinFilter::ExcludePinned,
            self.tick,
            protected,
        )
        .ok_or(CacheError::NoEvictableSlot { tier })?;

        let freed = self.slot_of(victim.block)?;
        self.evict(victim.block);
        Ok(freed.index())
    }

    fn slot_of(&self, block: usize) -> Result<TierSlot, CacheError> {
        self.table
            .get(block)
            .slot
            .ok_or(CacheError::NotResident { block })
    }

    /// Drop `block` from whichever tier holds it.
    pub fn evict(&mut self, block: usize) {
        let meta = self.table.get_mut(block);
        if let Some(slot) = meta.slot.take() {
            meta.clear();
            self.bitmap_mut(slot.tier()).clear(slot.index());
            self.stats.evictions += 1;
            debug!(block, tier = %slot.tier(), slot = slot.index(), "Evicted block");
        }
    }

    /// Move a resident block into `tier`.
    ///
    /// Does nothing if the block is already there. The block itself is never
    /// chosen to make room, and a failed allocation leaves the block where it
    /// was.
    pub fn move_to(&mut self, tier: Tier, block: usize, protected: &[usize]) -> Result<(), CacheError> {
        let source = self.slot_of(block)?;
        if source.tier() == tier {
            return Ok(());
        }

        let mut guard = Vec::with_capacity(protected.len() + 1);
        guard.extend_from_slice(protected);
        guard.push(block);

        let dest = TierSlot::new(tier, self.ensure_free_slot(tier, &guard)?);
        self.transfer(source, dest)?;

        self.bitmap_mut(dest.tier()).set(dest.index());
        self.bitmap_mut(source.tier()).clear(source.index());
        self.table.get_mut(block).slot = Some(dest);

        if tier == Tier::Primary {
            self.stats.promotions += 1;
        }
        debug!(
            block,
            from = %source.tier(),
            to = %tier,
            slot = dest.index(),
            "Moved block"
        );
        Ok(())
    }

    /// Copy one slot's bytes across the aux channel in aligned chunks.
    fn transfer(&mut self, source: TierSlot, dest: TierSlot) -> Result<(), CacheError> {
        let alignment = self.secondary.alignment().max(1);
        let chunk = (self.secondary.max_transfer().min(BLOCK_SIZE) / alignment * alignment).max(alignment);

        let (primary_slot, aux_slot, to_aux) = match (source, dest) {
            (TierSlot::Primary(p), TierSlot::Secondary(s)) => (p, s, true),
            (TierSlot::Secondary(s), TierSlot::Primary(p)) => (p, s, false),
            _ => return Ok(()),
        };

        let base = primary_slot * BLOCK_SIZE;
        let aux_base = aux_slot * BLOCK_SIZE;
        let mut done = 0;
        while done < BLOCK_SIZE {
            let len = chunk.min(BLOCK_SIZE - done);
            let window = base + done..base + done + len;

            self.secondary.wait_idle();
            if to_aux {
                self.secondary.start_write(aux_base + done, &self.primary[window])?;
            } else {
                self.secondary.start_read(aux_base + done, &mut self.primary[window])?;
            }
            done += len;
        }
        self.secondary.wait_idle();
        Ok(())
    }

    /// Writable view of a primary slot, for the loader.
    pub fn primary_slot_mut(&mut self, slot: usize) -> &mut [u8] {
        let start = slot * BLOCK_SIZE;
        &mut self.primary[start..start + BLOCK_SIZE]
    }

    /// Record that `block` now holds `len` bytes in primary slot `slot`.
    pub fn mark_resident(&mut self, block: usize, slot: usize, len: usize) {
        let meta = self.table.get_mut(block);
        meta.resident_size = len;
        meta.slot = Some(TierSlot::Primary(slot));
        meta.pin = PinClass::Normal;
        self.primary_slots.set(slot);
        trace!(block, slot, len, "Block resident");
    }

    /// Resident bytes of a primary-resident block.
    pub fn primary_bytes(&self, block: usize) -> Option<&[u8]> {
        let meta = self.table.get(block);
        match meta.slot {
            Some(TierSlot::Primary(slot)) if meta.is_resident() => {
                let start = slot * BLOCK_SIZE;
                Some(&self.primary[start..start + meta.resident_size])
            }
            _ => None,
        }
    }

    pub fn secondary_mut(&mut self) -> &mut dyn AuxMemory {
        self.secondary.as_mut()
    }

    /// Check that the bitmaps and the block table describe the same state.
    pub fn check_invariants(&self) -> Result<(), CacheError> {
        let mut owners = [
            vec![None; self.primary_slots.capacity()],
            vec![None; self.secondary_slots.capacity()],
        ];

        for (index, meta) in self.table.iter() {
            match (meta.is_resident(), meta.slot) {
                (false, None) => {}
                (true, Some(slot)) => {
                    let tier = match slot.tier() {
                        Tier::Primary => 0,
                        Tier::Secondary => 1,
                    };
                    let owner = owners[tier]
                        .get_mut(slot.index())
                        .ok_or_else(|| {
                            CacheError::Invariant(format!("block {index} holds out-of-range {slot:?}"))
                        })?;
                    if let Some(other) = owner.replace(index) {
                        return Err(CacheError::Invariant(format!(
                            "blocks {other} and {index} share {slot:?}"
                        )));
                    }
                    if !self.bitmap(slot.tier()).is_set(slot.index()) {
                        return Err(CacheError::Invariant(format!(
                            "block {index} holds {slot:?} but its bit is clear"
                        )));
                    }
                }
                (resident, slot) => {
                    return Err(CacheError::Invariant(format!(
                        "block {index}: resident={resident} with slot {slot:?}"
                    )));
                }
            }
        }

        for (tier, claimed) in [(Tier::Primary, &owners[0]), (Tier::Secondary, &owners[1])] {
            if let Some(slot) = self.bitmap(tier).iter_set().find(|&s| claimed[s].is_none()) {
                return Err(CacheError::Invariant(format!(
                    "{tier} slot {slot} is set but owned by no block"
                )));
            }
        }
        Ok(())
    }
}
