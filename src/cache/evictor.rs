//! Eviction policy: decides which resident block leaves a tier.
//!
//! Candidates are ranked purely by recency: the block whose last access is
//! furthest behind the image tick wins. The tick wraps, so ages are computed
//! with wrapping subtraction.

use crate::cache::block::{BlockTable, PinClass, Tier};

/// Which pin classes a candidate search may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinFilter {
    /// Only `PinClass::Normal` blocks.
    ExcludePinned,
    /// Only `PinClass::Kept` blocks.
    OnlyPinned,
    /// Either class.
    Any,
}

impl PinFilter {
    pub fn admits(&self, pin: PinClass) -> bool {
        match self {
            PinFilter::ExcludePinned => pin == PinClass::Normal,
            PinFilter::OnlyPinned => pin == PinClass::Kept,
            PinFilter::Any => true,
        }
    }
}

/// An eviction candidate with its age in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub block: usize,
    pub tick_delta: u32,
    pub tier: Tier,
}

/// Age of an access stamped at `last_used`, seen from `now`.
pub fn tick_delta(now: u32, last_used: u32) -> u32 {
    now.wrapping_sub(last_used)
}

/// The least-recently-used block resident in `tier` that passes `filter`.
///
/// Blocks touched at the current tick (age 0) never qualify, and neither do
/// blocks listed in `protected`. Equal ages resolve to the lowest index.
pub fn find_eviction_candidate(
    table: &BlockTable,
    tier: Tier,
    filter: PinFilter,
    now: u32,
    protected: &[usize],
) -> Option<EvictionCandidate> {
    let mut oldest: Option<EvictionCandidate> = None;

    for (index, block) in table.iter() {
        if !block.is_resident_in(tier) || !filter.admits(block.pin) {
            continue;
        }
        if protected.contains(&index) {
            continue;
        }

        let delta = tick_delta(now, block.last_used_tick);
        let best = oldest.map(|c| c.tick_delta).unwrap_or(0);
        if delta > best {
            oldest = Some(EvictionCandidate {
                block: index,
                tick_delta: delta,
                tier,
            });
        }
    }

    oldest
}
