//! `ImageCache`: the public face of the block cache.
//!
//! An image is served in one of two modes. When it fits in the primary tier
//! it is read whole on first use ("full" mode) and every copy is a plain
//! memory copy. Otherwise it is paged through both tiers block by block
//! ("part" mode).

use std::ops::Range;

use tracing::{debug, info, warn};

use crate::cache::block::{BlockTable, PinClass, Tier, BLOCK_SIZE};
use crate::cache::immediate::ImmediateReader;
use crate::cache::loader::{BlockLoader, DeviceLink, LoadWaiter};
use crate::cache::pager::Pager;
use crate::cache::prefetcher::{HotRangeTable, Prefetcher};
use crate::cache::stream::{CopyHook, CopyPoll, CopyState, StreamCopy};
use crate::cache::{CacheError, CacheStats};
use crate::config::Config;
use crate::host::{LoadObserver, ResetSignal};
use crate::image::{boot_address, select_profile, swap_pairs, ImageHeader, ImageProfile, ADDRESS_MASK, HEADER_SIZE};
use crate::memory::HeapReserve;
use crate::transfer::aux_dma::AuxMemory;
use crate::transfer::disk_io::BackingStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// The whole image lives in the primary buffer.
    Full,
    /// Blocks are paged through both tiers on demand.
    Part,
}

impl std::fmt::Display for LoadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadMode::Full => write!(f, "full"),
            LoadMode::Part => write!(f, "part"),
        }
    }
}

enum Backing {
    Full {
        image: Vec<u8>,
        /// Result of the last `begin_copy`, handed out by `advance`.
        ready: Option<Vec<u8>>,
    },
    Part {
        pager: Pager,
        stream: StreamCopy,
        /// Drives blocking reads without disturbing `stream`.
        reader: StreamCopy,
        prefetcher: Prefetcher,
        immediate: ImmediateReader,
    },
}

pub struct ImageCache {
    name: String,
    image_size: u64,
    header: ImageHeader,
    config: Config,
    loader: BlockLoader,
    backing: Backing,
    hot: HotRangeTable,
    profile: Option<ImageProfile>,
    observer: Box<dyn LoadObserver>,
    reset: Box<dyn ResetSignal>,

    /// First-use load (full image or preload, plus pinned ranges) done.
    loaded: bool,
    prefetched: u64,
}

impl ImageCache {
    /// Open the image behind `store`.
    ///
    /// Reads the header, reserves the primary buffer from `heap` and picks
    /// the load mode. The image itself is not read until first use.
    pub fn open(
        config: Config,
        store: Box<dyn BackingStore>,
        secondary: Box<dyn AuxMemory>,
        heap: &mut dyn HeapReserve,
        mut observer: Box<dyn LoadObserver>,
        reset: Box<dyn ResetSignal>,
    ) -> Result<Self, CacheError> {
        let granularity = store.granularity().max(1);
        if BLOCK_SIZE % granularity != 0 {
            return Err(CacheError::InvalidConfig(format!(
                "device granularity {granularity} does not divide the block size"
            )));
        }
        if BLOCK_SIZE % secondary.alignment().max(1) != 0 {
            return Err(CacheError::InvalidConfig(format!(
                "aux alignment {} does not divide the block size",
                secondary.alignment()
            )));
        }
        if secondary.max_transfer() < secondary.alignment().max(1) {
            return Err(CacheError::InvalidConfig(format!(
                "aux max transfer {} is smaller than its alignment {}",
                secondary.max_transfer(),
                secondary.alignment()
            )));
        }

        let name = store.name().to_string();
        let mut link = DeviceLink::new(store, config.device.image_offset, config.retry.clone());
        let image_size = link.image_len();
        if image_size == 0 {
            return Err(CacheError::InvalidConfig(format!("image {name} is empty")));
        }

        let header_len = (image_size as usize).min(HEADER_SIZE);
        let raw = link.fetch_blocking(0, header_len, observer.as_mut(), reset.as_ref())?;
        let header = ImageHeader::from_raw(&raw[..header_len]);

        let primary_size = config.cache.primary_size();
        let buffer = heap.reserve(primary_size, "rom cache")?;

        let mode = if image_size > primary_size as u64 {
            LoadMode::Part
        } else {
            LoadMode::Full
        };

        let profiles = config.all_profiles();
        let profile = select_profile(&profiles, &header).cloned();
        let hot = HotRangeTable::new(
            profile
                .iter()
                .flat_map(|p| p.hot.iter().map(|r| r.resolve(image_size)))
                .collect(),
        );

        let alignment = secondary.alignment();
        let backing = match mode {
            LoadMode::Full => Backing::Full {
                image: buffer,
                ready: None,
            },
            LoadMode::Part => Backing::Part {
                pager: Pager::new(image_size, buffer, secondary, config.secondary.slots()),
                stream: StreamCopy::new(),
                reader: StreamCopy::new(),
                prefetcher: Prefetcher::new(config.cache.prefetch),
                immediate: ImmediateReader::new(alignment),
            },
        };

        let mut loader = BlockLoader::new(link);
        loader.set_flip(header.needs_flip());

        info!(
            image = %name,
            size = image_size,
            code = %header.code(),
            %mode,
            cache_size = primary_size,
            flip = header.needs_flip(),
            profile = profile.is_some(),
            "Image opened"
        );

        Ok(Self {
            name,
            image_size,
            header,
            config,
            loader,
            backing,
            hot,
            profile,
            observer,
            reset,
            loaded: false,
            prefetched: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image_size(&self) -> u64 {
        self.image_size
    }

    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    /// Four-character image code from the header.
    pub fn image_code(&self) -> String {
        self.header.code()
    }

    pub fn test_code(&self, code: &str) -> bool {
        self.header.test_code(code)
    }

    pub fn profile(&self) -> Option<&ImageProfile> {
        self.profile.as_ref()
    }

    pub fn mode(&self) -> LoadMode {
        match self.backing {
            Backing::Full { .. } => LoadMode::Full,
            Backing::Part { .. } => LoadMode::Part,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// The pager, in part mode.
    pub fn pager(&self) -> Option<&Pager> {
        match &self.backing {
            Backing::Part { pager, .. } => Some(pager),
            Backing::Full { .. } => None,
        }
    }

    /// State of the streaming copy.
    pub fn copy_state(&self) -> CopyState {
        match &self.backing {
            Backing::Part { stream, .. } => stream.state(),
            Backing::Full { ready: Some(_), .. } => CopyState::Copying,
            Backing::Full { .. } => CopyState::Idle,
        }
    }

    /// Perform the first-use load if it has not happened yet.
    pub fn ensure_loaded(&mut self) -> Result<(), CacheError> {
        if self.loaded {
            return Ok(());
        }
        self.load_full_or_part()?;

        let pinned: Vec<Range<u64>> = self
            .profile
            .iter()
            .flat_map(|p| p.pinned.iter().map(|r| r.resolve(self.image_size)))
            .collect();
        for range in pinned {
            self.pin_range(range)?;
        }

        self.loaded = true;
        Ok(())
    }

    fn load_full_or_part(&mut self) -> Result<(), CacheError> {
        let image_size = self.image_size;
        match &mut self.backing {
            Backing::Full { image, .. } => {
                let chunks = self.config.device.full_load_chunks.max(1) as u64;
                let granularity = self.loader.link().granularity() as u64;
                let chunk = image_size.div_ceil(chunks).next_multiple_of(granularity);

                let mut offset = 0u64;
                while offset < image_size {
                    let len = chunk.min(image_size - offset);
                    let data = self.loader.link_mut().fetch_blocking(
                        offset,
                        len as usize,
                        self.observer.as_mut(),
                        self.reset.as_ref(),
                    )?;
                    let start = offset as usize;
                    image[start..start + len as usize].copy_from_slice(&data[..len as usize]);
                    offset += len;
                    self.observer.show_progress(offset as f32 / image_size as f32);
                }

                if self.loader.flip() {
                    swap_pairs(image, image_size as usize);
                }
                info!(size = image_size, "Image loaded in full");
            }
            Backing::Part { pager, .. } => {
                let secondary_bytes = (pager.slot_count(Tier::Secondary) * BLOCK_SIZE) as u64;
                let primary_bytes = (pager.slot_count(Tier::Primary) * BLOCK_SIZE) as u64;
                if !self.config.cache.preload_when_fits || image_size >= primary_bytes + secondary_bytes {
                    return Ok(());
                }

                let count = pager.table().len();
                let last = (count - 1) as u32;
                pager.set_tick(count as u32);
                for block in 0..count {
                    if self.reset.reset_requested() {
                        self.loader.cancel();
                        return Err(CacheError::Cancelled);
                    }
                    pager.set_last_used(block, last - block as u32);
                    self.loader
                        .fetch_block(pager, block, self.observer.as_mut(), self.reset.as_ref())?;
                    self.observer.show_progress((block + 1) as f32 / count as f32);
                }
                info!(blocks = count, "Image preloaded into both tiers");
            }
        }
        Ok(())
    }

    /// Load every block overlapping `range` and pin it.
    ///
    /// Pinned blocks are never dropped by ordinary eviction, only demoted.
    /// Does nothing in full mode, where every byte is always resident.
    pub fn pin_range(&mut self, range: Range<u64>) -> Result<usize, CacheError> {
        let Backing::Part { pager, .. } = &mut self.backing else {
            return Ok(0);
        };

        let blocks = pager.table().blocks_in_range(range.start, range.end);
        let total = blocks.len().max(1);
        for (n, block) in blocks.clone().enumerate() {
            if self.reset.reset_requested() {
                self.loader.cancel();
                return Err(CacheError::Cancelled);
            }
            self.observer.show_progress(n as f32 / total as f32);

            if !pager.table().get(block).is_resident() {
                self.loader
                    .fetch_block(pager, block, self.observer.as_mut(), self.reset.as_ref())?;
            }
            pager.set_pin(block, PinClass::Kept);
            pager.touch(block);
        }
        self.observer.show_progress(1.0);

        debug!(start = range.start, end = range.end, blocks = blocks.len(), "Pinned range");
        Ok(blocks.len())
    }

    /// Pin one resident block.
    pub fn pin_block(&mut self, block: usize) -> Result<(), CacheError> {
        let Backing::Part { pager, .. } = &mut self.backing else {
            return Ok(());
        };
        if block >= pager.table().len() || !pager.table().get(block).is_resident() {
            return Err(CacheError::NotResident { block });
        }
        pager.set_pin(block, PinClass::Kept);
        Ok(())
    }

    /// Start a streaming copy of `size` bytes at `offset`.
    ///
    /// The bytes are delivered by a later [`ImageCache::advance`]. `hook`
    /// runs once, after the last byte, and its failure fails the copy.
    pub fn begin_copy(&mut self, offset: u64, size: usize, hook: Option<CopyHook>) -> Result<(), CacheError> {
        let offset = offset & ADDRESS_MASK;
        self.ensure_loaded()?;

        let image_size = self.image_size;
        match &mut self.backing {
            Backing::Full { image, ready } => {
                if ready.is_some() {
                    return Err(CacheError::CopyInProgress);
                }
                let range = clamp(offset, size, image_size);
                let bytes = image[range].to_vec();
                if let Some(hook) = hook {
                    hook()?;
                }
                *ready = Some(bytes);
            }
            Backing::Part {
                pager,
                stream,
                prefetcher,
                ..
            } => {
                stream.begin(image_size, offset, size, hook, false)?;
                if let Some(range) = self.hot.lookup(offset) {
                    prefetcher.arm(pager.table(), range);
                }
            }
        }
        Ok(())
    }

    /// One cooperative step: service the device, advance the copy by at
    /// most one block, then let the prefetcher use an idle device.
    pub fn advance(&mut self) -> Result<CopyPoll, CacheError> {
        let (pager, stream, prefetcher) = match &mut self.backing {
            Backing::Full { ready, .. } => {
                return Ok(ready.take().map_or(CopyPoll::Idle, CopyPoll::Ready));
            }
            Backing::Part {
                pager,
                stream,
                prefetcher,
                ..
            } => (pager, stream, prefetcher),
        };

        match self.loader.poll(pager, self.observer.as_mut()) {
            Ok(Some(op)) if op.waiter == LoadWaiter::Prefetch => self.prefetched += 1,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Block load failed");
                stream.abort();
                prefetcher.clear();
                return Err(e);
            }
        }

        if self.reset.reset_requested() && (stream.is_active() || self.loader.pending().is_some()) {
            self.loader.cancel();
            stream.abort();
            prefetcher.clear();
            return Err(CacheError::Cancelled);
        }

        let poll = stream.step(pager, &mut self.loader, self.observer.as_mut(), self.reset.as_ref())?;
        if self.loader.pending().is_none() {
            if let Err(e) = prefetcher.step(pager, &mut self.loader) {
                prefetcher.clear();
                return Err(e);
            }
        }
        Ok(poll)
    }

    /// Read `size` bytes at `offset`, loading as needed and waiting for the
    /// device. Runs alongside any streaming copy in progress.
    pub fn read(&mut self, offset: u64, size: usize) -> Result<Vec<u8>, CacheError> {
        let offset = offset & ADDRESS_MASK;
        self.ensure_loaded()?;

        let image_size = self.image_size;
        match &mut self.backing {
            Backing::Full { image, .. } => Ok(image[clamp(offset, size, image_size)].to_vec()),
            Backing::Part {
                pager,
                reader,
                prefetcher,
                ..
            } => {
                if let Some(range) = self.hot.lookup(offset) {
                    prefetcher.arm(pager.table(), range);
                }
                reader.begin(image_size, offset, size, None, true)?;
                loop {
                    match reader.step(pager, &mut self.loader, self.observer.as_mut(), self.reset.as_ref())? {
                        CopyPoll::Ready(bytes) => return Ok(bytes),
                        CopyPoll::Idle => return Ok(Vec::new()),
                        CopyPoll::Pending => {}
                    }
                }
            }
        }
    }

    /// Copy resident bytes at `offset` into `dest` without touching the
    /// device. Returns the bytes copied, short at the image end.
    pub fn copy_now(&mut self, dest: &mut [u8], offset: u64) -> Result<usize, CacheError> {
        let offset = offset & ADDRESS_MASK;
        self.ensure_loaded()?;

        let image_size = self.image_size;
        match &mut self.backing {
            Backing::Full { image, .. } => {
                let range = clamp(offset, dest.len(), image_size);
                let n = range.len();
                dest[..n].copy_from_slice(&image[range]);
                Ok(n)
            }
            Backing::Part { pager, immediate, .. } => immediate.copy(pager, dest, offset),
        }
    }

    fn read_word<const N: usize>(&mut self, address: u64) -> Result<[u8; N], CacheError> {
        let address = address & ADDRESS_MASK;
        let mut word = [0u8; N];
        if address < self.image_size {
            let bytes = self.read(address, N)?;
            word[..bytes.len()].copy_from_slice(&bytes);
        }
        Ok(word)
    }

    /// Big-endian byte at `address`; zero outside the image.
    pub fn read_u8(&mut self, address: u64) -> Result<u8, CacheError> {
        Ok(u8::from_be_bytes(self.read_word(address)?))
    }

    pub fn read_u16(&mut self, address: u64) -> Result<u16, CacheError> {
        Ok(u16::from_be_bytes(self.read_word(address)?))
    }

    pub fn read_u32(&mut self, address: u64) -> Result<u32, CacheError> {
        Ok(u32::from_be_bytes(self.read_word(address)?))
    }

    pub fn read_u64(&mut self, address: u64) -> Result<u64, CacheError> {
        Ok(u64::from_be_bytes(self.read_word(address)?))
    }

    /// Entry address of the executor, derived from the boot code.
    pub fn boot_address(&mut self) -> Result<Option<u64>, CacheError> {
        let boot = self.read(0, 0x1000)?;
        Ok(boot_address(&boot))
    }

    /// Abandon the streaming copy, any load in flight and the prefetch window.
    pub fn cancel(&mut self) {
        self.loader.cancel();
        match &mut self.backing {
            Backing::Full { ready, .. } => *ready = None,
            Backing::Part { stream, prefetcher, .. } => {
                stream.abort();
                prefetcher.clear();
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let link = self.loader.link().stats();
        let mut stats = CacheStats {
            blocks_loaded: self.loader.blocks_loaded(),
            reissues: link.reissues,
            short_reads: link.short_reads,
            prefetched: self.prefetched,
            ..Default::default()
        };

        if let Backing::Part { pager, stream, reader, .. } = &self.backing {
            let moves = pager.stats();
            stats.demotions = moves.demotions;
            stats.promotions = moves.promotions;
            stats.evictions = moves.evictions;
            for lookups in [stream.stats(), reader.stats()] {
                stats.primary_hits += lookups.primary_hits;
                stats.secondary_hits += lookups.secondary_hits;
                stats.misses += lookups.misses;
            }
            stats.primary_resident = pager.used_slots(Tier::Primary);
            stats.secondary_resident = pager.used_slots(Tier::Secondary);
        }
        stats
    }

    /// Check the bitmap / block table agreement.
    pub fn check_invariants(&self) -> Result<(), CacheError> {
        match &self.backing {
            Backing::Part { pager, .. } => pager.check_invariants(),
            Backing::Full { .. } => Ok(()),
        }
    }

    /// Block index containing `offset`.
    pub fn block_for_offset(&self, offset: u64) -> usize {
        BlockTable::block_for_offset(offset & ADDRESS_MASK)
    }
}

fn clamp(offset: u64, size: usize, image_size: u64) -> Range<usize> {
    let start = offset.min(image_size) as usize;
    let end = (offset.saturating_add(size as u64)).min(image_size) as usize;
    start..end
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{NeverReset, TracingObserver};
    use crate::memory::SystemHeap;
    use crate::transfer::aux_dma::HostAuxMemory;
    use crate::transfer::disk_io::MemoryBackingStore;

    fn open(image: Vec<u8>, config: Config) -> ImageCache {
        let aux = HostAuxMemory::new(config.secondary.capacity, config.secondary.max_transfer, 32);
        ImageCache::open(
            config,
            Box::new(MemoryBackingStore::new("test.z64", image)),
            Box::new(aux),
            &mut SystemHeap::new(),
            Box::new(TracingObserver::new()),
            Box::new(NeverReset),
        )
        .unwrap()
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    #[test]
    fn test_small_image_uses_full_mode() {
        let image = pattern(0x3000);
        let mut cache = open(image.clone(), Config::default());
        assert_eq!(cache.mode(), LoadMode::Full);

        cache.begin_copy(0x100, 0x20, None).unwrap();
        assert_eq!(cache.advance().unwrap(), CopyPoll::Ready(image[0x100..0x120].to_vec()));
        assert_eq!(cache.advance().unwrap(), CopyPoll::Idle);
    }

    #[test]
    fn test_large_image_uses_part_mode() {
        let mut config = Config::default();
        config.cache.size = 0x10_0000;
        config.secondary.capacity = 0x4_0000;
        let image = pattern(0x20_0000);
        let mut cache = open(image.clone(), config);
        assert_eq!(cache.mode(), LoadMode::Part);

        let bytes = cache.read(0x1F_FFF0, 0x40).unwrap();
        assert_eq!(bytes, image[0x1F_FFF0..]);
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_word_accessors_big_endian_and_masked() {
        let mut image = pattern(0x3000);
        image[0x40..0x48].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let mut cache = open(image, Config::default());

        assert_eq!(cache.read_u8(0x40).unwrap(), 1);
        assert_eq!(cache.read_u16(0x40).unwrap(), 0x0102);
        assert_eq!(cache.read_u32(0x1000_0040).unwrap(), 0x0102_0304);
        assert_eq!(cache.read_u64(0x40).unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(cache.read_u32(0x10_0000).unwrap(), 0);
    }

    #[test]
    fn test_aux_transfer_below_alignment_rejected() {
        let mut config = Config::default();
        config.cache.size = 0x10_0000;
        config.secondary.capacity = 0x4_0000;
        let aux = HostAuxMemory::new(config.secondary.capacity, 16, 32);
        let result = ImageCache::open(
            config,
            Box::new(MemoryBackingStore::new("test.z64", pattern(0x20_0000))),
            Box::new(aux),
            &mut SystemHeap::new(),
            Box::new(TracingObserver::new()),
            Box::new(NeverReset),
        );
        assert!(matches!(result, Err(CacheError::InvalidConfig(_))));
    }

    #[test]
    fn test_byte_swapped_image_is_flipped() {
        let mut image = vec![0u8; 0x2000];
        image[..4].copy_from_slice(&[0x80, 0x37, 0x12, 0x40]);
        image[0x3B..0x3F].copy_from_slice(b"NABE");
        swap_pairs(&mut image, 0x2000);

        let mut cache = open(image, Config::default());
        assert!(cache.header().needs_flip());
        assert_eq!(cache.image_code(), "NABE");
        assert_eq!(cache.read_u32(0).unwrap(), 0x8037_1240);
    }
}
