//! Prometheus export of cache statistics.

use prometheus::{IntCounter, IntGauge, Opts, Registry, TextEncoder};

use crate::cache::CacheStats;

/// Cache metrics registered in a private registry.
pub struct CacheMetrics {
    registry: Registry,
    blocks_loaded: IntCounter,
    demotions: IntCounter,
    promotions: IntCounter,
    evictions: IntCounter,
    reissues: IntCounter,
    short_reads: IntCounter,
    primary_hits: IntCounter,
    secondary_hits: IntCounter,
    misses: IntCounter,
    prefetched: IntCounter,
    primary_resident: IntGauge,
    secondary_resident: IntGauge,
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(name, help).namespace("rom_cache"))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGauge> {
    let gauge = IntGauge::with_opts(Opts::new(name, help).namespace("rom_cache"))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

/// Advance a counter to an absolute value taken from a snapshot.
fn catch_up(counter: &IntCounter, value: u64) {
    let current = counter.get();
    if value > current {
        counter.inc_by(value - current);
    }
}

impl CacheMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        Ok(Self {
            blocks_loaded: counter(&registry, "blocks_loaded_total", "Blocks read from the backing store")?,
            demotions: counter(&registry, "demotions_total", "Blocks moved from primary to secondary")?,
            promotions: counter(&registry, "promotions_total", "Blocks moved from secondary to primary")?,
            evictions: counter(&registry, "evictions_total", "Blocks dropped from the cache")?,
            reissues: counter(&registry, "reissues_total", "Device reads cancelled and reissued")?,
            short_reads: counter(&registry, "short_reads_total", "Device reads that returned too few bytes")?,
            primary_hits: counter(&registry, "primary_hits_total", "Block lookups served by the primary tier")?,
            secondary_hits: counter(&registry, "secondary_hits_total", "Block lookups served by the secondary tier")?,
            misses: counter(&registry, "misses_total", "Block lookups that needed a device read")?,
            prefetched: counter(&registry, "prefetched_total", "Blocks staged by the prefetcher")?,
            primary_resident: gauge(&registry, "primary_resident_blocks", "Blocks resident in the primary tier")?,
            secondary_resident: gauge(&registry, "secondary_resident_blocks", "Blocks resident in the secondary tier")?,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Bring every metric up to date with `stats`.
    pub fn update(&self, stats: &CacheStats) {
        catch_up(&self.blocks_loaded, stats.blocks_loaded);
        catch_up(&self.demotions, stats.demotions);
        catch_up(&self.promotions, stats.promotions);
        catch_up(&self.evictions, stats.evictions);
        catch_up(&self.reissues, stats.reissues);
        catch_up(&self.short_reads, stats.short_reads);
        catch_up(&self.primary_hits, stats.primary_hits);
        catch_up(&self.secondary_hits, stats.secondary_hits);
        catch_up(&self.misses, stats.misses);
        catch_up(&self.prefetched, stats.prefetched);
        self.primary_resident.set(stats.primary_resident as i64);
        self.secondary_resident.set(stats.secondary_resident as i64);
    }

    /// Text exposition of the registry.
    pub fn render(&self) -> prometheus::Result<String> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_and_render() {
        let metrics = CacheMetrics::new().unwrap();
        let mut stats = CacheStats {
            blocks_loaded: 5,
            primary_resident: 3,
            ..Default::default()
        };
        metrics.update(&stats);
        stats.blocks_loaded = 7;
        metrics.update(&stats);

        let text = metrics.render().unwrap();
        assert!(text.contains("rom_cache_blocks_loaded_total 7"));
        assert!(text.contains("rom_cache_primary_resident_blocks 3"));
    }
}
