//! Prometheus-style metrics for the coordination managers
//!
//! Every manager owns its own metric set, so several managers (or test
//! instances) can live in one process without sharing counters.

use std::fmt::Write;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

const BUCKETS: usize = 11;

/// Upper bounds of the latency histogram buckets, in seconds
const LATENCY_BOUNDS: [f64; BUCKETS] = [0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

/// Name and help text shared by every metric kind
#[derive(Debug, Clone, Copy)]
struct Desc {
    name: &'static str,
    help: &'static str,
}

impl Desc {
    fn header(&self, out: &mut String, kind: &str) {
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} {}", self.name, kind);
    }
}

/// Monotonically increasing count
#[derive(Debug)]
pub struct Counter {
    desc: Desc,
    value: AtomicU64,
}

impl Counter {
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            desc: Desc { name, help },
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Prometheus text exposition with `labels` (e.g. `{shard_set="3"}`)
    pub fn to_prometheus(&self, labels: &str) -> String {
        let mut out = String::new();
        self.desc.header(&mut out, "counter");
        let _ = writeln!(out, "{}{} {}", self.desc.name, labels, self.get());
        out
    }
}

/// Point-in-time value
#[derive(Debug)]
pub struct Gauge {
    desc: Desc,
    value: AtomicI64,
}

impl Gauge {
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            desc: Desc { name, help },
            value: AtomicI64::new(0),
        }
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn to_prometheus(&self, labels: &str) -> String {
        let mut out = String::new();
        self.desc.header(&mut out, "gauge");
        let _ = writeln!(out, "{}{} {}", self.desc.name, labels, self.get());
        out
    }
}

/// Cumulative latency histogram
#[derive(Debug)]
pub struct Histogram {
    desc: Desc,
    buckets: [AtomicU64; BUCKETS],
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            desc: Desc { name, help },
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        for (bound, bucket) in LATENCY_BOUNDS.iter().zip(&self.buckets) {
            if secs <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.sum_micros.fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn to_prometheus(&self, labels: &str) -> String {
        let mut out = String::new();
        self.desc.header(&mut out, "histogram");

        // Bucket lines merge the caller's labels with `le`
        let inner = labels.trim_start_matches('{').trim_end_matches('}');
        let prefix = if inner.is_empty() { String::new() } else { format!("{},", inner) };
        for (bound, bucket) in LATENCY_BOUNDS.iter().zip(&self.buckets) {
            let _ = writeln!(
                out,
                "{}_bucket{{{}le=\"{}\"}} {}",
                self.desc.name,
                prefix,
                bound,
                bucket.load(Ordering::Relaxed)
            );
        }

        let sum = self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        let _ = writeln!(out, "{}_sum{} {}", self.desc.name, labels, sum);
        let _ = writeln!(out, "{}_count{} {}", self.desc.name, labels, self.count());
        out
    }
}

fn shard_set_labels(shard_set_id: u32) -> String {
    format!("{{shard_set=\"{}\"}}", shard_set_id)
}

/// Metrics reported by a keyed watcher
#[derive(Debug)]
pub struct WatchMetrics {
    pub upstream_watches: Counter,
    pub reconnects: Counter,
    pub decode_errors: Counter,
}

impl WatchMetrics {
    pub fn new() -> Self {
        Self {
            upstream_watches: Counter::new("flushcoord_watch_upstream_total", "Upstream store subscriptions opened"),
            reconnects: Counter::new("flushcoord_watch_reconnects_total", "Upstream watch reconnect attempts"),
            decode_errors: Counter::new("flushcoord_watch_decode_errors_total", "Watched values that failed to decode"),
        }
    }

    pub fn to_prometheus(&self) -> String {
        let mut output = self.upstream_watches.to_prometheus("");
        output.push_str(&self.reconnects.to_prometheus(""));
        output.push_str(&self.decode_errors.to_prometheus(""));
        output
    }
}

impl Default for WatchMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Metrics reported by the placement manager
#[derive(Debug)]
pub struct PlacementMetrics {
    pub updates: Counter,
    pub decode_errors: Counter,
    pub placement_version: Gauge,
}

impl PlacementMetrics {
    pub fn new() -> Self {
        Self {
            updates: Counter::new("flushcoord_placement_updates_total", "Placement snapshots installed"),
            decode_errors: Counter::new("flushcoord_placement_decode_errors_total", "Placement payloads rejected"),
            placement_version: Gauge::new("flushcoord_placement_version", "Version of the active placement"),
        }
    }

    pub fn to_prometheus(&self) -> String {
        let mut output = self.updates.to_prometheus("");
        output.push_str(&self.decode_errors.to_prometheus(""));
        output.push_str(&self.placement_version.to_prometheus(""));
        output
    }
}

impl Default for PlacementMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Metrics reported by an election manager
#[derive(Debug)]
pub struct ElectionMetrics {
    labels: String,
    /// 0 = unknown, 1 = follower, 2 = leader
    pub state: Gauge,
    pub leadership_gained: Counter,
    pub leadership_lost: Counter,
    pub store_errors: Counter,
}

impl ElectionMetrics {
    pub fn new(shard_set_id: u32) -> Self {
        Self {
            labels: shard_set_labels(shard_set_id),
            state: Gauge::new("flushcoord_election_state", "Election state (0 unknown, 1 follower, 2 leader)"),
            leadership_gained: Counter::new("flushcoord_election_gained_total", "Times leadership was acquired"),
            leadership_lost: Counter::new("flushcoord_election_lost_total", "Times leadership was lost or resigned"),
            store_errors: Counter::new("flushcoord_election_store_errors_total", "Campaign store errors"),
        }
    }

    pub fn to_prometheus(&self) -> String {
        let mut output = self.state.to_prometheus(&self.labels);
        output.push_str(&self.leadership_gained.to_prometheus(&self.labels));
        output.push_str(&self.leadership_lost.to_prometheus(&self.labels));
        output.push_str(&self.store_errors.to_prometheus(&self.labels));
        output
    }
}

/// Metrics reported by a flush times manager
#[derive(Debug)]
pub struct FlushTimesMetrics {
    labels: String,
    pub writes: Counter,
    pub write_errors: Counter,
    pub write_conflicts: Counter,
    pub rejected_updates: Counter,
    pub write_latency: Histogram,
}

impl FlushTimesMetrics {
    pub fn new(shard_set_id: u32) -> Self {
        Self {
            labels: shard_set_labels(shard_set_id),
            writes: Counter::new("flushcoord_flush_times_writes_total", "Flush time snapshots persisted"),
            write_errors: Counter::new("flushcoord_flush_times_write_errors_total", "Failed flush time writes"),
            write_conflicts: Counter::new("flushcoord_flush_times_conflicts_total", "Compare-and-swap conflicts"),
            rejected_updates: Counter::new("flushcoord_flush_times_rejected_total", "Non-monotonic updates rejected"),
            write_latency: Histogram::new("flushcoord_flush_times_write_seconds", "Flush time write latency"),
        }
    }

    pub fn to_prometheus(&self) -> String {
        let mut output = self.writes.to_prometheus(&self.labels);
        output.push_str(&self.write_errors.to_prometheus(&self.labels));
        output.push_str(&self.write_conflicts.to_prometheus(&self.labels));
        output.push_str(&self.rejected_updates.to_prometheus(&self.labels));
        output.push_str(&self.write_latency.to_prometheus(&self.labels));
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_and_gauge_export() {
        let counter = Counter::new("writes_total", "Writes");
        counter.inc();
        counter.inc_by(5);
        assert_eq!(counter.get(), 6);
        assert_eq!(
            counter.to_prometheus(""),
            "# HELP writes_total Writes\n# TYPE writes_total counter\nwrites_total 6\n"
        );

        let gauge = Gauge::new("state", "State");
        gauge.set(-1);
        assert!(gauge.to_prometheus("{a=\"b\"}").ends_with("state{a=\"b\"} -1\n"));
    }

    #[test]
    fn test_histogram_labels() {
        let histogram = Histogram::new("test_histogram", "Test histogram");
        histogram.observe(Duration::from_millis(1));
        histogram.observe(Duration::from_millis(100));

        let prometheus = histogram.to_prometheus("{shard_set=\"3\"}");
        assert!(prometheus.contains("test_histogram_count{shard_set=\"3\"} 2"));
        assert!(prometheus.contains("test_histogram_bucket{shard_set=\"3\",le=\"0.001\"} 1"));
    }

    #[test]
    fn test_election_metrics_export() {
        let metrics = ElectionMetrics::new(7);
        metrics.state.set(2);
        assert!(metrics.to_prometheus().contains("flushcoord_election_state{shard_set=\"7\"} 2"));
    }
}
