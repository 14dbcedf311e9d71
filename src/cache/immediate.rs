//! Immediate copy: synchronous reads out of blocks that are already resident.
//!
//! Never loads, never allocates, never moves a block. Secondary-resident
//! bytes are pulled through a small scratch buffer in aligned chunks.

use crate::cache::block::{BlockTable, TierSlot, BLOCK_SIZE};
use crate::cache::pager::Pager;
use crate::cache::CacheError;

/// Largest secondary read issued per chunk.
pub const SCRATCH_CHUNK: usize = 0x200;

/// Reusable scratch state for immediate copies.
pub struct ImmediateReader {
    scratch: Vec<u8>,
}

impl ImmediateReader {
    pub fn new(alignment: usize) -> Self {
        Self {
            scratch: vec![0u8; SCRATCH_CHUNK + 2 * alignment.max(1)],
        }
    }

    /// Copy `dest.len()` bytes starting at image offset `offset` into `dest`.
    ///
    /// Reads past the image end are truncated; returns the bytes copied.
    /// Fails with `NotResident` before copying anything if any touched block
    /// is not cached.
    pub fn copy(&mut self, pager: &mut Pager, dest: &mut [u8], offset: u64) -> Result<usize, CacheError> {
        let image_size = pager.table().image_size();
        let len = image_size.saturating_sub(offset).min(dest.len() as u64) as usize;
        if len == 0 {
            return Ok(0);
        }

        let table = pager.table();
        let mut blocks = table.blocks_in_range(offset, offset + len as u64);
        if let Some(block) = blocks.find(|&b| !table.get(b).is_resident()) {
            return Err(CacheError::NotResident { block });
        }

        let mut done = 0;
        while done < len {
            let pos = offset + done as u64;
            let block = BlockTable::block_for_offset(pos);
            let meta = pager.table().get(block);
            let (resident_size, slot) = (meta.resident_size, meta.slot);
            let intra = (pos % BLOCK_SIZE as u64) as usize;
            let n = (len - done).min(resident_size.saturating_sub(intra));
            if n == 0 {
                return Err(CacheError::NotResident { block });
            }

            match slot {
                Some(TierSlot::Primary(_)) => {
                    let bytes = pager
                        .primary_bytes(block)
                        .ok_or(CacheError::NotResident { block })?;
                    dest[done..done + n].copy_from_slice(&bytes[intra..intra + n]);
                }
                Some(TierSlot::Secondary(slot)) => {
                    let address = TierSlot::Secondary(slot).byte_offset() + intra;
                    self.read_secondary(pager, address, &mut dest[done..done + n])?;
                }
                None => return Err(CacheError::NotResident { block }),
            }
            done += n;
        }
        Ok(len)
    }

    /// Read `dest.len()` bytes from aux address `address` via the scratch
    /// buffer, widening each chunk to the channel alignment.
    fn read_secondary(&mut self, pager: &mut Pager, address: usize, dest: &mut [u8]) -> Result<(), CacheError> {
        let aux = pager.secondary_mut();
        let alignment = aux.alignment().max(1);
        let limit = aux.max_transfer().min(SCRATCH_CHUNK + alignment);
        let chunk = (limit.saturating_sub(alignment) / alignment * alignment).max(alignment);

        let mut done = 0;
        while done < dest.len() {
            let n = chunk.min(dest.len() - done);
            let src = address + done;
            let start = src / alignment * alignment;
            let slack = src - start;
            let read_len = (slack + n).next_multiple_of(alignment);
            if self.scratch.len() < read_len {
                self.scratch.resize(read_len, 0);
            }

            aux.wait_idle();
            aux.start_read(start, &mut self.scratch[..read_len])?;
            aux.wait_idle();

            dest[done..done + n].copy_from_slice(&self.scratch[slack..slack + n]);
            done += n;
        }
        Ok(())
    }
}
