//! Global atomic counters for cache and bisection activity.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a session).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    artifacts_stored: AtomicU64,
    extractions: AtomicU64,
    working_copy_hits: AtomicU64,
    cached_picks: AtomicU64,
    compiles: AtomicU64,
    compile_failures: AtomicU64,
    bundles_sealed: AtomicU64,
    duplicates_removed: AtomicU64,
    evictions: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            artifacts_stored: AtomicU64::new(0),
            extractions: AtomicU64::new(0),
            working_copy_hits: AtomicU64::new(0),
            cached_picks: AtomicU64::new(0),
            compiles: AtomicU64::new(0),
            compile_failures: AtomicU64::new(0),
            bundles_sealed: AtomicU64::new(0),
            duplicates_removed: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn inc_artifacts_stored(&self) {
        self.artifacts_stored.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "artifacts_stored", "counter incremented");
    }

    pub fn inc_extractions(&self) {
        self.extractions.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "extractions", "counter incremented");
    }

    /// A working copy was already on disk and reused as-is.
    pub fn inc_working_copy_hits(&self) {
        self.working_copy_hits.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "working_copy_hits", "counter incremented");
    }

    /// The engine picked a candidate that needed no compile.
    pub fn inc_cached_picks(&self) {
        self.cached_picks.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "cached_picks", "counter incremented");
    }

    pub fn inc_compiles(&self) {
        self.compiles.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "compiles", "counter incremented");
    }

    pub fn inc_compile_failures(&self) {
        self.compile_failures.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "compile_failures", "counter incremented");
    }

    pub fn inc_bundles_sealed(&self) {
        self.bundles_sealed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "bundles_sealed", "counter incremented");
    }

    pub fn add_duplicates_removed(&self, n: u64) {
        if n > 0 {
            self.duplicates_removed.fetch_add(n, Ordering::Relaxed);
            tracing::trace!(metric = "duplicates_removed", n, "counter incremented");
        }
    }

    pub fn add_evictions(&self, n: u64) {
        if n > 0 {
            self.evictions.fetch_add(n, Ordering::Relaxed);
            tracing::trace!(metric = "evictions", n, "counter incremented");
        }
    }

    /// Emit all current counter values as a single `info!` event.
    ///
    /// Call this at natural boundaries (end of a session, end of a
    /// precompile run) rather than on every increment.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            artifacts_stored = self.artifacts_stored(),
            extractions = self.extractions(),
            working_copy_hits = self.working_copy_hits(),
            cached_picks = self.cached_picks(),
            compiles = self.compiles(),
            compile_failures = self.compile_failures(),
            bundles_sealed = self.bundles_sealed(),
            duplicates_removed = self.duplicates_removed(),
            evictions = self.evictions(),
        );
    }

    pub fn artifacts_stored(&self) -> u64 {
        self.artifacts_stored.load(Ordering::Relaxed)
    }

    pub fn extractions(&self) -> u64 {
        self.extractions.load(Ordering::Relaxed)
    }

    pub fn working_copy_hits(&self) -> u64 {
        self.working_copy_hits.load(Ordering::Relaxed)
    }

    pub fn cached_picks(&self) -> u64 {
        self.cached_picks.load(Ordering::Relaxed)
    }

    pub fn compiles(&self) -> u64 {
        self.compiles.load(Ordering::Relaxed)
    }

    pub fn compile_failures(&self) -> u64 {
        self.compile_failures.load(Ordering::Relaxed)
    }

    pub fn bundles_sealed(&self) -> u64 {
        self.bundles_sealed.load(Ordering::Relaxed)
    }

    pub fn duplicates_removed(&self) -> u64 {
        self.duplicates_removed.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.artifacts_stored,
            &self.extractions,
            &self.working_copy_hits,
            &self.cached_picks,
            &self.compiles,
            &self.compile_failures,
            &self.bundles_sealed,
            &self.duplicates_removed,
            &self.evictions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        assert_eq!(m.compiles(), 0);
        m.inc_compiles();
        m.inc_compiles();
        assert_eq!(m.compiles(), 2);

        m.inc_bundles_sealed();
        assert_eq!(m.bundles_sealed(), 1);

        m.add_evictions(3);
        m.add_evictions(0);
        assert_eq!(m.evictions(), 3);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_extractions();
        m.inc_cached_picks();
        m.add_duplicates_removed(4);
        m.reset();
        assert_eq!(m.extractions(), 0);
        assert_eq!(m.cached_picks(), 0);
        assert_eq!(m.duplicates_removed(), 0);
    }
}
