//! Server metrics.
//!
//! Counters and gauges are kept in-process so the admin surface can serve
//! `/stats/<key>`, and forwarded to a pluggable sink (the binary wires a
//! statsd UDP emitter).

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

/// Destination for metric updates.
pub trait MetricsSink: Send + Sync + 'static {
    /// Set a gauge to an absolute value.
    fn gauge(&self, key: &str, value: i64);
    /// Increment a counter.
    fn counter(&self, key: &str, amount: i64);
}

/// No-op sink used when no emitter is configured.
pub struct NullSink;

impl MetricsSink for NullSink {
    fn gauge(&self, _key: &str, _value: i64) {}
    fn counter(&self, _key: &str, _amount: i64) {}
}

/// Handle for recording metrics.
#[derive(Clone)]
pub struct Metrics {
    counters: Arc<DashMap<String, i64>>,
    gauges: Arc<DashMap<String, i64>>,
    sink: Arc<dyn MetricsSink>,
}

impl Metrics {
    /// Create a metrics handle forwarding to the given sink.
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            counters: Arc::new(DashMap::new()),
            gauges: Arc::new(DashMap::new()),
            sink,
        }
    }

    /// Create a metrics handle with no emitter.
    pub fn disabled() -> Self {
        Self::new(Arc::new(NullSink))
    }

    /// Set a gauge to an absolute value.
    pub fn set_gauge(&self, key: &str, value: i64) {
        debug!(key, value, "gauge");
        self.gauges.insert(key.to_string(), value);
        self.sink.gauge(key, value);
    }

    /// Increment a counter by one.
    pub fn update_counter(&self, key: &str) {
        self.update_counter_by(key, 1);
    }

    /// Increment a counter by an amount.
    pub fn update_counter_by(&self, key: &str, amount: i64) {
        debug!(key, amount, "counter");
        *self.counters.entry(key.to_string()).or_insert(0) += amount;
        self.sink.counter(key, amount);
    }

    /// Read a counter or gauge value, counters first.
    pub fn get(&self, key: &str) -> Option<i64> {
        self.counters
            .get(key)
            .map(|v| *v)
            .or_else(|| self.gauges.get(key).map(|v| *v))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::disabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::disabled();
        metrics.update_counter("turn.transfers");
        metrics.update_counter_by("turn.bytes", 1500);
        metrics.update_counter_by("turn.bytes", 500);
        assert_eq!(metrics.get("turn.transfers"), Some(1));
        assert_eq!(metrics.get("turn.bytes"), Some(2000));
        assert_eq!(metrics.get("missing"), None);
    }

    #[test]
    fn gauges_overwrite() {
        let metrics = Metrics::disabled();
        metrics.set_gauge("muc.room.count", 3);
        metrics.set_gauge("muc.room.count", 2);
        assert_eq!(metrics.get("muc.room.count"), Some(2));
    }
}
