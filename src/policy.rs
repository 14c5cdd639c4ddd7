//! Recycling policies, invoked after every request with the worker's
//! counters. Killing a worker resets whatever memory it leaked or
//! fragmented; the host's supervision replaces it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::MemoryLimit;
use crate::metrics::MetricsSink;
use crate::rss;

/// A policy handler invoked after each request with the post-request
/// counters. Handlers are pure in the counters: identical counter values
/// produce identical decisions no matter how often they are called.
pub trait RequestHandler: Send + Sync {
    fn after_request(&self, requests: u64, request_time: Duration);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    Requests,
    Memory,
}

impl KillReason {
    pub fn as_str(self) -> &'static str {
        match self {
            KillReason::Requests => "requests",
            KillReason::Memory => "memory",
        }
    }
}

impl fmt::Display for KillReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Carries out a recycling decision. Split from the policies so the
/// decision logic stays testable without delivering real signals.
pub trait Terminator: Send + Sync {
    fn terminate(&self, reason: KillReason, memory_mb: u64, requests: u64, request_time: Duration);
}

/// Production terminator: reports the kill, then asks the worker to die
/// through the signal coordinator rather than a raw kill, so self-initiated
/// shutdown stays distinguishable from externally delivered signals.
pub(crate) struct SelfTerminator {
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl SelfTerminator {
    pub(crate) fn new(metrics: Option<Arc<dyn MetricsSink>>) -> Self {
        Self { metrics }
    }
}

impl Terminator for SelfTerminator {
    fn terminate(&self, reason: KillReason, memory_mb: u64, requests: u64, request_time: Duration) {
        if let Some(metrics) = &self.metrics {
            metrics.increment("warden.kill", &[("reason", reason.as_str())]);
            metrics.distribution("warden.kill.memory", memory_mb as f64);
            metrics.distribution("warden.kill.total_requests", requests as f64);
            metrics.distribution("warden.kill.total_request_time", request_time.as_secs_f64());
        }
        info!(
            "Killing worker {} for {}. Requests: {}, Time: {:.3}s, Memory: {}MB",
            std::process::id(),
            reason,
            requests,
            request_time.as_secs_f64(),
            memory_mb
        );
        #[cfg(unix)]
        crate::signals::request_self_termination();
        #[cfg(not(unix))]
        tracing::warn!("Worker recycling requires a Unix host; termination request dropped");
    }
}

pub(crate) type Probe = Box<dyn Fn() -> u64 + Send + Sync>;

fn rss_probe() -> Probe {
    Box::new(|| rss::rss_mb(std::process::id()))
}

/// Recycles a worker once it has served a fixed number of requests.
pub struct RequestCountPolicy {
    max_requests: u64,
    probe: Probe,
    terminator: Arc<dyn Terminator>,
}

impl RequestCountPolicy {
    pub fn new(max_requests: u64, terminator: Arc<dyn Terminator>) -> Self {
        info!("Recycling workers after {} requests", max_requests);
        Self {
            max_requests,
            probe: rss_probe(),
            terminator,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_probe(
        max_requests: u64,
        terminator: Arc<dyn Terminator>,
        probe: Probe,
    ) -> Self {
        Self {
            max_requests,
            probe,
            terminator,
        }
    }
}

impl RequestHandler for RequestCountPolicy {
    fn after_request(&self, requests: u64, request_time: Duration) {
        if requests >= self.max_requests {
            // memory is sampled only for the kill report, never on the hot path
            self.terminator
                .terminate(KillReason::Requests, (self.probe)(), requests, request_time);
        }
    }
}

/// Recycles a worker whose RSS grew past the limit. Probing may fork `ps`
/// on the portable path, so it runs every `check_every` requests only.
pub struct MemoryPolicy {
    max_mb: u64,
    check_every: u64,
    probe: Probe,
    terminator: Arc<dyn Terminator>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl MemoryPolicy {
    pub fn new(
        limit: &MemoryLimit,
        terminator: Arc<dyn Terminator>,
        metrics: Option<Arc<dyn MetricsSink>>,
    ) -> Self {
        info!(
            "Recycling workers using more than {}MB, checked every {} requests",
            limit.max, limit.check_every
        );
        Self {
            max_mb: limit.max,
            check_every: limit.check_every,
            probe: rss_probe(),
            terminator,
            metrics,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_probe(
        limit: &MemoryLimit,
        terminator: Arc<dyn Terminator>,
        metrics: Option<Arc<dyn MetricsSink>>,
        probe: Probe,
    ) -> Self {
        Self {
            max_mb: limit.max,
            check_every: limit.check_every,
            probe,
            terminator,
            metrics,
        }
    }
}

impl RequestHandler for MemoryPolicy {
    fn after_request(&self, requests: u64, request_time: Duration) {
        if requests % self.check_every != 0 {
            return;
        }
        let memory = (self.probe)();
        if memory > self.max_mb {
            self.terminator
                .terminate(KillReason::Memory, memory, requests, request_time);
        } else {
            // a "kept" observation so operators can see the policy is live
            if let Some(metrics) = &self.metrics {
                metrics.distribution("warden.memory", memory as f64);
            }
            debug!(
                "Worker {} kept at {}MB after {} requests",
                std::process::id(),
                memory,
                requests
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTerminator {
        kills: Mutex<Vec<(KillReason, u64, u64)>>,
    }

    impl Terminator for RecordingTerminator {
        fn terminate(&self, reason: KillReason, memory_mb: u64, requests: u64, _time: Duration) {
            self.kills.lock().unwrap().push((reason, memory_mb, requests));
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        distributions: Mutex<Vec<(String, f64)>>,
    }

    impl MetricsSink for RecordingSink {
        fn increment(&self, _name: &str, _tags: &[(&str, &str)]) {}
        fn distribution(&self, name: &str, value: f64) {
            self.distributions.lock().unwrap().push((name.to_string(), value));
        }
        fn timing(&self, _name: &str, _ms: u64) {}
    }

    fn counting_probe(mb: u64) -> (Probe, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let probe: Probe = Box::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
            mb
        });
        (probe, calls)
    }

    #[test]
    fn request_count_policy_kills_at_the_threshold() {
        let terminator = Arc::new(RecordingTerminator::default());
        let (probe, _) = counting_probe(42);
        let policy = RequestCountPolicy::with_probe(1000, terminator.clone(), probe);

        policy.after_request(999, Duration::from_secs(100));
        assert!(terminator.kills.lock().unwrap().is_empty());

        policy.after_request(1000, Duration::from_secs(100));
        assert_eq!(
            *terminator.kills.lock().unwrap(),
            vec![(KillReason::Requests, 42, 1000)]
        );

        // beyond the threshold still terminates
        policy.after_request(1001, Duration::from_secs(100));
        assert_eq!(terminator.kills.lock().unwrap().len(), 2);
    }

    #[test]
    fn decisions_are_a_pure_function_of_the_counters() {
        let terminator = Arc::new(RecordingTerminator::default());
        let (probe, _) = counting_probe(0);
        let policy = RequestCountPolicy::with_probe(1000, terminator.clone(), probe);

        policy.after_request(999, Duration::from_secs(1));
        policy.after_request(999, Duration::from_secs(1));
        assert!(terminator.kills.lock().unwrap().is_empty());
    }

    #[test]
    fn memory_policy_probes_only_on_the_sampling_cadence() {
        let terminator = Arc::new(RecordingTerminator::default());
        let (probe, calls) = counting_probe(0);
        let limit = MemoryLimit { max: 20, check_every: 250 };
        let policy = MemoryPolicy::with_probe(&limit, terminator.clone(), None, probe);

        for requests in 1..250 {
            policy.after_request(requests, Duration::from_secs(1));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        policy.after_request(250, Duration::from_secs(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(terminator.kills.lock().unwrap().is_empty());
    }

    #[test]
    fn memory_policy_kills_above_the_limit() {
        let terminator = Arc::new(RecordingTerminator::default());
        let (probe, _) = counting_probe(30);
        let limit = MemoryLimit { max: 20, check_every: 250 };
        let policy = MemoryPolicy::with_probe(&limit, terminator.clone(), None, probe);

        policy.after_request(250, Duration::from_secs(100));
        assert_eq!(
            *terminator.kills.lock().unwrap(),
            vec![(KillReason::Memory, 30, 250)]
        );
    }

    #[test]
    fn memory_policy_reports_a_kept_worker() {
        let terminator = Arc::new(RecordingTerminator::default());
        let sink = Arc::new(RecordingSink::default());
        let (probe, _) = counting_probe(10);
        let limit = MemoryLimit { max: 20, check_every: 250 };
        let policy =
            MemoryPolicy::with_probe(&limit, terminator.clone(), Some(sink.clone()), probe);

        policy.after_request(500, Duration::from_secs(100));
        assert!(terminator.kills.lock().unwrap().is_empty());
        assert_eq!(
            *sink.distributions.lock().unwrap(),
            vec![("warden.memory".to_string(), 10.0)]
        );
    }

    #[test]
    fn memory_policy_works_without_a_metrics_sink() {
        let terminator = Arc::new(RecordingTerminator::default());
        let (probe, _) = counting_probe(10);
        let limit = MemoryLimit { max: 20, check_every: 1 };
        let policy = MemoryPolicy::with_probe(&limit, terminator, None, probe);
        policy.after_request(1, Duration::from_secs(1));
    }

    #[test]
    fn a_sample_equal_to_the_limit_is_kept() {
        let terminator = Arc::new(RecordingTerminator::default());
        let (probe, _) = counting_probe(20);
        let limit = MemoryLimit { max: 20, check_every: 1 };
        let policy = MemoryPolicy::with_probe(&limit, terminator.clone(), None, probe);
        policy.after_request(1, Duration::from_secs(1));
        assert!(terminator.kills.lock().unwrap().is_empty());
    }
}
