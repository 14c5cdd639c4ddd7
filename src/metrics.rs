/// Metrics sink supplied by the host, typically backed by a statsd or
/// dogstatsd client carrying the app's own namespace. All supervisor
/// metrics are emitted under the `warden.` prefix.
///
/// The sink is optional everywhere it is consumed: without one, every
/// emission is skipped silently while logging still happens.
pub trait MetricsSink: Send + Sync {
    /// Count an event, tagged (e.g. the kill reason).
    fn increment(&self, name: &str, tags: &[(&str, &str)]);
    /// Record one sample of a value distribution.
    fn distribution(&self, name: &str, value: f64);
    /// Record a measured duration in milliseconds.
    fn timing(&self, name: &str, ms: u64);
}
