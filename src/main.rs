//! rom-block-cache: drive a ROM image through the two-tier block cache.
//!
//! Opens an image file, then streams it sequentially at a fixed frame rate
//! the way an emulated executor would, reporting cache statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{debug, info, warn};

use rom_block_cache::cache::stream::{CopyPoll, CopyState};
use rom_block_cache::cache::{CacheError, ImageCache};
use rom_block_cache::config::{Cli, Config};
use rom_block_cache::host::{ResetFlag, TracingObserver};
use rom_block_cache::memory::SystemHeap;
use rom_block_cache::metrics::CacheMetrics;
use rom_block_cache::transfer::aux_dma::HostAuxMemory;
use rom_block_cache::transfer::disk_io::FileBackingStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "rom_block_cache=debug"
    } else {
        "rom_block_cache=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("rom-block-cache v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(size) = cli.cache_size {
        config.cache.size = size;
    }

    info!(
        cache_size = config.cache.primary_size(),
        secondary = config.secondary.capacity,
        max_reissues = config.retry.max_reissues,
        "Configuration loaded"
    );

    let store = FileBackingStore::open(&cli.image)?;
    let aux = HostAuxMemory::new(
        config.secondary.capacity,
        config.secondary.max_transfer,
        config.secondary.alignment,
    )
    .with_latency(config.secondary.latency_polls);

    // Ctrl-C asserts the reset line.
    let reset = ResetFlag::new();
    let line = reset.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            line.request();
        }
    });

    let mut cache = ImageCache::open(
        config,
        Box::new(store),
        Box::new(aux),
        &mut SystemHeap::new(),
        Box::new(TracingObserver::new()),
        Box::new(reset),
    )?;

    tokio::task::block_in_place(|| cache.ensure_loaded())?;
    let boot = tokio::task::block_in_place(|| cache.boot_address())?;
    info!(
        code = %cache.image_code(),
        mode = %cache.mode(),
        boot = ?boot.map(|a| format!("{a:#010x}")),
        "Image ready"
    );

    let metrics = CacheMetrics::new()?;
    let completed = Arc::new(AtomicU64::new(0));
    let fps = cli.fps.max(1);
    let mut interval = tokio::time::interval(Duration::from_secs_f64(1.0 / fps as f64));
    let mut offset = 0u64;

    for frame in 0..cli.frames {
        interval.tick().await;

        if matches!(cache.copy_state(), CopyState::Idle | CopyState::Done | CopyState::Failed) {
            let counter = completed.clone();
            cache.begin_copy(
                offset,
                cli.read_size,
                Some(Box::new(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                })),
            )?;
        }

        match cache.advance() {
            Ok(CopyPoll::Ready(bytes)) => {
                offset = (offset + bytes.len().max(1) as u64) % cache.image_size();
            }
            Ok(_) => {}
            Err(CacheError::Cancelled) => {
                warn!(frame, "Reset requested, stopping");
                break;
            }
            Err(e) => return Err(e.into()),
        }

        if frame % fps as u64 == 0 {
            let stats = cache.stats();
            metrics.update(&stats);
            debug!(
                frame,
                offset,
                loaded = stats.blocks_loaded,
                hit_rate = stats.hit_rate(),
                "Frame"
            );
        }
    }

    let stats = cache.stats();
    metrics.update(&stats);
    info!(
        copies = completed.load(Ordering::Relaxed),
        blocks_loaded = stats.blocks_loaded,
        demotions = stats.demotions,
        promotions = stats.promotions,
        evictions = stats.evictions,
        reissues = stats.reissues,
        hit_rate = stats.hit_rate(),
        "Run complete"
    );

    if cli.metrics {
        print!("{}", metrics.render()?);
    }

    Ok(())
}
