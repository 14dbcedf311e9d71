//! Reservation of the large cache buffers.
//!
//! The primary tier and the full-image buffer are taken once, up front, from
//! a [`HeapReserve`]. Reservation is fallible: a host that cannot spare the
//! memory reports it instead of aborting.

use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum HeapError {
    #[error("Out of memory: cannot reserve {size:#x} bytes for {tag}")]
    OutOfMemory { size: usize, tag: &'static str },

    #[error("Reservation limit exceeded: {tag} wants {size:#x} bytes, {available:#x} left")]
    LimitExceeded {
        size: usize,
        available: usize,
        tag: &'static str,
    },
}

/// Source of zero-filled buffers.
pub trait HeapReserve: Send {
    /// Reserve a zero-filled buffer of exactly `size` bytes. `tag` names the
    /// consumer in errors and logs.
    fn reserve(&mut self, size: usize, tag: &'static str) -> Result<Vec<u8>, HeapError>;
}

/// Host heap with an optional overall limit.
#[derive(Debug, Default)]
pub struct SystemHeap {
    limit: Option<usize>,
    reserved: usize,
}

impl SystemHeap {
    pub fn new() -> Self {
        Self::default()
    }

    /// A heap that refuses to hand out more than `limit` bytes in total.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            reserved: 0,
        }
    }

    /// Total bytes handed out so far.
    pub fn reserved(&self) -> usize {
        self.reserved
    }
}

impl HeapReserve for SystemHeap {
    fn reserve(&mut self, size: usize, tag: &'static str) -> Result<Vec<u8>, HeapError> {
        if let Some(limit) = self.limit {
            let available = limit.saturating_sub(self.reserved);
            if size > available {
                return Err(HeapError::LimitExceeded {
                    size,
                    available,
                    tag,
                });
            }
        }

        let mut buf = Vec::new();
        buf.try_reserve_exact(size)
            .map_err(|_| HeapError::OutOfMemory { size, tag })?;
        buf.resize(size, 0);

        self.reserved += size;
        debug!(size, tag, "Reserved buffer");
        Ok(buf)
    }
}
