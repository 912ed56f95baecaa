//! Thread-safe metrics aggregation, overall and per topic.
//!
//! Counters are raw sums; every derived figure (ratios, averages,
//! throughput) is computed at snapshot time so recording stays a handful of
//! integer additions under one short-lived lock.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Default, Clone)]
struct Counters {
    messages: u64,
    bytes_in: u64,
    bytes_out: u64,
    flush_count: u64,
    total_flush_duration: Duration,
    compression_errors: u64,
    network_errors: u64,
    last_flush: Option<DateTime<Utc>>,
}

impl Counters {
    fn record_batch(&mut self, count: u64, raw: u64, compressed: u64, duration: Duration) {
        self.messages += count;
        self.bytes_in += raw;
        self.bytes_out += compressed;
        self.flush_count += 1;
        self.total_flush_duration += duration;
        self.last_flush = Some(Utc::now());
    }
}

struct MetricsInner {
    overall: Counters,
    topics: HashMap<String, Counters>,
    started: Instant,
}

/// Shared metrics sink for one process (agent or collector).
pub struct MetricsCollector {
    inner: Mutex<MetricsInner>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of one counter set with the derived figures filled in.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub messages: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// compressed/raw; 0.0 until any bytes flow.
    pub compression_ratio: f64,
    pub flush_count: u64,
    pub avg_flush_duration_ms: f64,
    pub compression_errors: u64,
    pub network_errors: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_flush: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessSnapshot {
    pub uptime_seconds: f64,
    pub throughput_mbps: f64,
    pub messages_per_second: f64,
    pub overall: MetricsSnapshot,
    pub topics: HashMap<String, MetricsSnapshot>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MetricsInner {
                overall: Counters::default(),
                topics: HashMap::new(),
                started: Instant::now(),
            }),
        }
    }

    /// Record one successfully shipped (or received) batch.
    pub fn record_batch(
        &self,
        topic: &str,
        count: u64,
        raw_bytes: u64,
        compressed_bytes: u64,
        duration: Duration,
    ) {
        let mut inner = self.inner.lock();
        inner.overall.record_batch(count, raw_bytes, compressed_bytes, duration);
        inner
            .topics
            .entry(topic.to_string())
            .or_default()
            .record_batch(count, raw_bytes, compressed_bytes, duration);
    }

    pub fn record_compression_error(&self, topic: &str) {
        let mut inner = self.inner.lock();
        inner.overall.compression_errors += 1;
        inner.topics.entry(topic.to_string()).or_default().compression_errors += 1;
    }

    pub fn record_network_error(&self, topic: &str) {
        let mut inner = self.inner.lock();
        inner.overall.network_errors += 1;
        inner.topics.entry(topic.to_string()).or_default().network_errors += 1;
    }

    pub fn snapshot(&self) -> ProcessSnapshot {
        let inner = self.inner.lock();
        let uptime = inner.started.elapsed().as_secs_f64();
        let overall = snapshot_of(&inner.overall);
        ProcessSnapshot {
            uptime_seconds: uptime,
            throughput_mbps: if uptime > 0.0 {
                (inner.overall.bytes_in as f64 / 1024.0 / 1024.0) / uptime
            } else {
                0.0
            },
            messages_per_second: if uptime > 0.0 {
                inner.overall.messages as f64 / uptime
            } else {
                0.0
            },
            overall,
            topics: inner.topics.iter().map(|(t, c)| (t.clone(), snapshot_of(c))).collect(),
        }
    }

    /// Zero every counter and restart the uptime clock.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.overall = Counters::default();
        inner.topics.clear();
        inner.started = Instant::now();
    }
}

fn snapshot_of(c: &Counters) -> MetricsSnapshot {
    MetricsSnapshot {
        messages: c.messages,
        bytes_in: c.bytes_in,
        bytes_out: c.bytes_out,
        compression_ratio: if c.bytes_in > 0 {
            c.bytes_out as f64 / c.bytes_in as f64
        } else {
            0.0
        },
        flush_count: c.flush_count,
        avg_flush_duration_ms: if c.flush_count > 0 {
            c.total_flush_duration.as_secs_f64() * 1000.0 / c.flush_count as f64
        } else {
            0.0
        },
        compression_errors: c.compression_errors,
        network_errors: c.network_errors,
        last_flush: c.last_flush,
    }
}
