//! Runtime configuration for rom-block-cache.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Tier capacities, device geometry, retry limits and per-image profiles live here.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::cache::block::BLOCK_SIZE;
use crate::image::{builtin_profiles, ImageProfile};

/// Smallest primary tier the cache accepts.
pub const MIN_CACHE_SIZE: usize = 0x10_0000;

/// Largest primary tier the cache accepts.
pub const MAX_CACHE_SIZE: usize = 0x80_0000;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "rom-block-cache", about = "Stream a ROM image through a two-tier block cache")]
pub struct Cli {
    /// ROM image to open.
    pub image: PathBuf,

    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Primary cache size in bytes, overriding the configuration.
    #[arg(long)]
    pub cache_size: Option<usize>,

    /// Number of frames to drive the cache for.
    #[arg(long, default_value_t = 600)]
    pub frames: u64,

    /// Bytes requested per streaming read.
    #[arg(long, default_value_t = 0x4000)]
    pub read_size: usize,

    /// Frame rate of the pacing loop.
    #[arg(long, default_value_t = 60)]
    pub fps: u32,

    /// Print the metrics registry in text format on exit.
    #[arg(long)]
    pub metrics: bool,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Primary tier and load-mode settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Backing store geometry.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Secondary tier geometry.
    #[serde(default)]
    pub secondary: SecondaryConfig,

    /// Device fault handling.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Per-image profiles, consulted before the built-in ones.
    #[serde(default)]
    pub profiles: Vec<ImageProfile>,
}

/// Primary tier and load-mode settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Requested primary tier size in bytes. Clamped to 1–8 MiB and rounded
    /// up to whole blocks.
    pub size: usize,

    /// Load every block up front when the image fits in both tiers.
    pub preload_when_fits: bool,

    /// Stage hot-range blocks in the background.
    pub prefetch: bool,

    /// Also consult the built-in image profiles.
    pub builtin_profiles: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size: MAX_CACHE_SIZE,
            preload_when_fits: true,
            prefetch: true,
            builtin_profiles: true,
        }
    }
}

impl CacheConfig {
    /// Primary tier size actually used for a requested size.
    pub fn primary_size(&self) -> usize {
        clamp_cache_size(self.size)
    }
}

/// Clamp a requested primary size to the supported range, rounding up to
/// whole blocks.
pub fn clamp_cache_size(requested: usize) -> usize {
    if requested < MIN_CACHE_SIZE {
        MIN_CACHE_SIZE
    } else if requested > MAX_CACHE_SIZE {
        MAX_CACHE_SIZE
    } else {
        requested.next_multiple_of(BLOCK_SIZE)
    }
}

/// Backing store geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Byte offset of the image within the backing file.
    pub image_offset: u64,

    /// Number of reads a whole-image load is split into.
    pub full_load_chunks: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            image_offset: 0,
            full_load_chunks: 32,
        }
    }
}

/// Secondary tier geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecondaryConfig {
    /// Bytes of auxiliary memory given to the cache.
    pub capacity: usize,

    /// Largest single transfer over the aux channel.
    pub max_transfer: usize,

    /// Address and length alignment of aux transfers.
    pub alignment: usize,

    /// Status polls an aux transfer stays busy for (host emulation only).
    pub latency_polls: u32,
}

impl Default for SecondaryConfig {
    fn default() -> Self {
        Self {
            capacity: 0xFF_A000,
            max_transfer: BLOCK_SIZE,
            alignment: 32,
            latency_polls: 0,
        }
    }
}

impl SecondaryConfig {
    pub fn slots(&self) -> usize {
        self.capacity / BLOCK_SIZE
    }
}

/// Device fault handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Consecutive cancel-and-reissue attempts before a recoverable fault
    /// is treated as fatal.
    pub max_reissues: u32,

    /// Consecutive fatal status polls before the operator is prompted.
    pub fatal_threshold: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_reissues: 8,
            fatal_threshold: 3,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Configured profiles followed by the built-in ones, if enabled.
    pub fn all_profiles(&self) -> Vec<ImageProfile> {
        let mut profiles = self.profiles.clone();
        if self.cache.builtin_profiles {
            profiles.extend(builtin_profiles());
        }
        profiles
    }
}
