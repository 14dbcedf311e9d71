//! Auxiliary (secondary tier) memory and its DMA channel.
//!
//! The secondary tier is not directly addressable: bytes move in and out of
//! it through a single transfer channel that imposes a maximum transfer
//! length and an address/length alignment. Only one transfer may be in
//! flight at a time; callers wait for the channel to go idle before issuing
//! the next one.

use thiserror::Error;
use tracing::trace;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuxError {
    #[error("Aux channel busy: a previous transfer has not finished")]
    ChannelBusy,

    #[error("Misaligned aux transfer: address {address:#x}, length {len:#x} (alignment {alignment})")]
    Misaligned {
        address: usize,
        len: usize,
        alignment: usize,
    },

    #[error("Aux transfer of {len:#x} bytes exceeds channel maximum {max:#x}")]
    TooLong { len: usize, max: usize },

    #[error("Aux transfer [{address:#x}, +{len:#x}) outside memory of {capacity:#x} bytes")]
    OutOfRange {
        address: usize,
        len: usize,
        capacity: usize,
    },
}

/// Secondary-tier memory reachable only through a DMA-style channel.
pub trait AuxMemory: Send {
    /// Total bytes of auxiliary memory available to the cache.
    fn capacity(&self) -> usize;

    /// Largest single transfer the channel accepts.
    fn max_transfer(&self) -> usize;

    /// Required alignment of transfer addresses and lengths.
    fn alignment(&self) -> usize;

    /// Start copying `dst.len()` bytes from aux address `address` into `dst`.
    /// `dst` holds the data once the channel reports idle.
    fn start_read(&mut self, address: usize, dst: &mut [u8]) -> Result<(), AuxError>;

    /// Start copying `src` into aux memory at `address`.
    fn start_write(&mut self, address: usize, src: &[u8]) -> Result<(), AuxError>;

    /// Whether a transfer is still in flight.
    fn is_busy(&mut self) -> bool;

    /// Block until the channel is idle.
    fn wait_idle(&mut self) {
        while self.is_busy() {
            std::hint::spin_loop();
        }
    }
}

/// Channel statistics.
#[derive(Debug, Default, Clone)]
pub struct DmaStats {
    pub reads: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Auxiliary memory backed by host RAM.
///
/// Transfers complete immediately, but the channel stays busy for
/// `busy_polls` calls to [`AuxMemory::is_busy`] afterwards, so callers that
/// forget to wait are caught by [`AuxError::ChannelBusy`].
pub struct HostAuxMemory {
    memory: Vec<u8>,
    max_transfer: usize,
    alignment: usize,
    busy_polls: u32,
    remaining_busy: u32,
    in_flight: bool,
    stats: DmaStats,
}

impl HostAuxMemory {
    pub fn new(capacity: usize, max_transfer: usize, alignment: usize) -> Self {
        Self {
            memory: vec![0u8; capacity],
            max_transfer,
            alignment: alignment.max(1),
            busy_polls: 0,
            remaining_busy: 0,
            in_flight: false,
            stats: DmaStats::default(),
        }
    }

    /// Keep the channel busy for `polls` status checks after each transfer.
    pub fn with_latency(mut self, polls: u32) -> Self {
        self.busy_polls = polls;
        self
    }

    pub fn stats(&self) -> &DmaStats {
        &self.stats
    }

    fn check(&self, address: usize, len: usize) -> Result<(), AuxError> {
        if self.in_flight {
            return Err(AuxError::ChannelBusy);
        }
        if address % self.alignment != 0 || len % self.alignment != 0 {
            return Err(AuxError::Misaligned {
                address,
                len,
                alignment: self.alignment,
            });
        }
        if len > self.max_transfer {
            return Err(AuxError::TooLong {
                len,
                max: self.max_transfer,
            });
        }
        if address + len > self.memory.len() {
            return Err(AuxError::OutOfRange {
                address,
                len,
                capacity: self.memory.len(),
            });
        }
        Ok(())
    }

    fn begin(&mut self) {
        self.in_flight = true;
        self.remaining_busy = self.busy_polls;
    }
}

impl AuxMemory for HostAuxMemory {
    fn capacity(&self) -> usize {
        self.memory.len()
    }

    fn max_transfer(&self) -> usize {
        self.max_transfer
    }

    fn alignment(&self) -> usize {
        self.alignment
    }

    fn start_read(&mut self, address: usize, dst: &mut [u8]) -> Result<(), AuxError> {
        self.check(address, dst.len())?;
        dst.copy_from_slice(&self.memory[address..address + dst.len()]);
        trace!(address, len = dst.len(), "aux read");

        self.stats.reads += 1;
        self.stats.bytes_read += dst.len() as u64;
        self.begin();
        Ok(())
    }

    fn start_write(&mut self, address: usize, src: &[u8]) -> Result<(), AuxError> {
        self.check(address, src.len())?;
        self.memory[address..address + src.len()].copy_from_slice(src);
        trace!(address, len = src.len(), "aux write");

        self.stats.writes += 1;
        self.stats.bytes_written += src.len() as u64;
        self.begin();
        Ok(())
    }

    fn is_busy(&mut self) -> bool {
        if !self.in_flight {
            return false;
        }
        if self.remaining_busy == 0 {
            self.in_flight = false;
            return false;
        }
        self.remaining_busy -= 1;
        true
    }
}
