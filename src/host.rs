//! Host-side collaborators: load progress / error UI and the reset line.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::transfer::disk_io::DeviceStatus;

/// Receives load progress and device problems.
///
/// `show_error` is the blocking operator prompt: it returns once the
/// operator has decided, `true` meaning "retry the read".
pub trait LoadObserver: Send {
    /// Fraction of a long load (full image or pinned range) completed, 0.0 to 1.0.
    fn show_progress(&mut self, _fraction: f32) {}

    /// The drive is busy spinning up or seeking.
    fn show_reading(&mut self) {}

    /// The drive reported a fatal status while reading `name`.
    fn show_error(&mut self, status: DeviceStatus, name: &str) -> bool;
}

/// Observer that only logs. Never asks for a retry.
#[derive(Debug, Default)]
pub struct TracingObserver {
    last_decile: Option<u32>,
    reading: bool,
}

impl TracingObserver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadObserver for TracingObserver {
    fn show_progress(&mut self, fraction: f32) {
        let decile = (fraction.clamp(0.0, 1.0) * 10.0) as u32;
        if self.last_decile != Some(decile) {
            self.last_decile = Some(decile);
            info!(percent = decile * 10, "Loading image");
        }
        self.reading = false;
    }

    fn show_reading(&mut self) {
        if !self.reading {
            self.reading = true;
            warn!("Drive not ready, waiting");
        }
    }

    fn show_error(&mut self, status: DeviceStatus, name: &str) -> bool {
        error!(%status, file = name, "Cannot read image");
        false
    }
}

/// Host reset / cancel line, checked between steps of long operations.
pub trait ResetSignal: Send {
    fn reset_requested(&self) -> bool;
}

/// A reset line that is never asserted.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverReset;

impl ResetSignal for NeverReset {
    fn reset_requested(&self) -> bool {
        false
    }
}

/// Reset line backed by a shared flag; clones observe the same flag.
#[derive(Debug, Default, Clone)]
pub struct ResetFlag(Arc<AtomicBool>);

impl ResetFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ResetSignal for ResetFlag {
    fn reset_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
