//! Out-of-band collection: the worker never pays collection cost inside a
//! request. Automatic collection is disabled outright and a full pass runs
//! between requests instead, once enough cumulative in-request time has
//! accrued. Idle workers never collect; busy workers collect on a
//! predictable cadence.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;

use crate::metrics::MetricsSink;
use crate::policy::RequestHandler;

/// Binding to whatever managed-memory reclaimer the host embeds: a
/// scripting runtime's GC, an allocator purge, a cache sweep.
pub trait Collector: Send + Sync {
    fn enable(&self);
    fn disable(&self);
    /// Force one full collection cycle. Called with collection enabled.
    fn collect(&self);
}

/// Scheduler for deferred collection passes. Single-writer: only the
/// pipeline thread that crossed the threshold updates the mark.
pub struct OutOfBandGc {
    collector: Arc<dyn Collector>,
    threshold: Duration,
    last_collection_micros: AtomicU64,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl OutOfBandGc {
    /// Disables automatic collection immediately. From here on the worker
    /// collects only through `after_request`.
    pub fn new(
        collector: Arc<dyn Collector>,
        threshold: Duration,
        metrics: Option<Arc<dyn MetricsSink>>,
    ) -> Self {
        collector.disable();
        info!(
            "Garbage collecting after {:.1}s of request processing time",
            threshold.as_secs_f64()
        );
        Self {
            collector,
            threshold,
            last_collection_micros: AtomicU64::new(0),
            metrics,
        }
    }

    pub(crate) fn last_collection_at(&self) -> Duration {
        Duration::from_micros(self.last_collection_micros.load(Ordering::Relaxed))
    }
}

impl RequestHandler for OutOfBandGc {
    fn after_request(&self, _requests: u64, request_time: Duration) {
        if request_time.saturating_sub(self.last_collection_at()) < self.threshold {
            return;
        }
        // the mark advances to the triggering time, never backwards
        self.last_collection_micros
            .store(request_time.as_micros() as u64, Ordering::Relaxed);

        let started = Instant::now();
        self.collector.enable();
        self.collector.collect();
        self.collector.disable();
        let ms = (started.elapsed().as_secs_f64() * 1000.0).round() as u64;

        if let Some(metrics) = &self.metrics {
            metrics.increment("warden.oobgc.runs", &[]);
            metrics.timing("warden.oobgc.time", ms);
        }
        info!("Garbage collecting: took {}ms", ms);
    }
}
