use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Per-worker request accounting, shared across however many threads the
/// host serves requests on. Both counters only ever grow; they reset to zero
/// because worker recycling replaces the whole process.
#[derive(Debug, Default)]
pub struct RequestCounters {
    requests: AtomicU64,
    request_time_micros: AtomicU64,
}

impl RequestCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account one finished request and return the post-increment snapshot.
    /// The snapshot always includes the request that was just recorded.
    pub fn record(&self, elapsed: Duration) -> (u64, Duration) {
        let requests = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
        let micros = elapsed.as_micros() as u64;
        let total = self.request_time_micros.fetch_add(micros, Ordering::Relaxed) + micros;
        (requests, Duration::from_micros(total))
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn request_time(&self) -> Duration {
        Duration::from_micros(self.request_time_micros.load(Ordering::Relaxed))
    }
}
