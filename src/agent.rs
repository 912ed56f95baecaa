//! Edge agent: enqueue, batch, compress, frame, ship.
//!
//! The enqueue path is synchronous up to the flush decision; a flush that
//! trips on enqueue is dispatched inline on the caller's task, while aged
//! batches are picked up by the sweeper task. All network failures are
//! absorbed here: a batch that cannot ship is counted, logged, and dropped,
//! and the enqueue path never sees the error.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::breaker::{BreakerError, BreakerStats, CircuitBreaker};
use crate::buffer::TopicBufferSet;
use crate::compress::CompressorSet;
use crate::config::Settings;
use crate::dict;
use crate::frame::{self, FrameHeader, PROTOCOL_VERSION};
use crate::metrics::{MetricsCollector, ProcessSnapshot};
use crate::pool::{ConnectionPool, PoolError, PoolStats};
use crate::validate::{self, ValidationError};

/// Header keys removed from messages before serialization. These change on
/// every request and would poison dictionary compression.
const VOLATILE_HEADERS: &[&str] = &["X-Amzn-Trace-Id"];

const SCHEMA_ID: &str = "s1";

#[derive(Error, Debug)]
pub enum EnqueueError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("message serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
enum SendError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("frame write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Strip volatile headers and serialize to compact JSON bytes. Key order is
/// deterministic, so identical messages always produce identical bytes.
pub fn normalize_message(mut msg: serde_json::Value) -> Result<Bytes, serde_json::Error> {
    if let Some(headers) = msg.get_mut("headers").and_then(|h| h.as_object_mut()) {
        for key in VOLATILE_HEADERS {
            headers.remove(*key);
        }
    }
    serde_json::to_vec(&msg).map(Bytes::from)
}

#[derive(Debug, Serialize)]
pub struct AgentStats {
    pub metrics: ProcessSnapshot,
    pub breaker: BreakerStats,
    pub pool: PoolStats,
}

pub struct EdgeAgent {
    buffers: TopicBufferSet,
    compressors: CompressorSet,
    pool: ConnectionPool,
    breaker: CircuitBreaker,
    metrics: MetricsCollector,
}

impl EdgeAgent {
    pub fn new(settings: &Settings) -> Self {
        let dictionaries = dict::load(&settings.dict_dir);
        let compressors =
            CompressorSet::new(settings.codec, settings.compression_level, &dictionaries);
        info!(
            collector = %settings.collector_addr(),
            batch_max = settings.batch_max,
            batch_ms = settings.batch_ms,
            codec = settings.codec.as_str(),
            dict_topics = compressors.topic_count(),
            "edge agent initialized"
        );
        Self {
            buffers: TopicBufferSet::new(settings.batch_max, settings.batch_age),
            compressors,
            pool: ConnectionPool::new(settings.pool_config()),
            breaker: CircuitBreaker::new("collector", settings.breaker_config()),
            metrics: MetricsCollector::new(),
        }
    }

    /// Validate, normalize, and buffer one message. Dispatches the batch
    /// inline when this message trips a flush trigger.
    ///
    /// Validation and serialization problems surface here; delivery
    /// problems never do.
    pub async fn enqueue(
        &self,
        topic: &str,
        msg: serde_json::Value,
    ) -> Result<(), EnqueueError> {
        let topic = validate::topic(topic)?;
        let data = normalize_message(msg)?;
        if let Some(batch) = self.buffers.push(topic, data) {
            self.flush_batch(topic, &batch).await;
        }
        Ok(())
    }

    /// Flush every buffer whose oldest message reached the age limit.
    pub async fn sweep_aged(&self) {
        for batch in self.buffers.detach_aged() {
            self.flush_batch(&batch.topic, &batch.messages).await;
        }
    }

    /// Flush everything regardless of age, then close pooled connections.
    /// Shutdown path.
    pub async fn shutdown(&self) {
        info!("edge agent stopping, flushing remaining buffers");
        for batch in self.buffers.detach_all() {
            self.flush_batch(&batch.topic, &batch.messages).await;
        }
        self.pool.close_all();
        info!("edge agent stopped");
    }

    /// Buffered message count for one topic; test and introspection hook.
    pub fn pending(&self, topic: &str) -> usize {
        self.buffers.pending(topic)
    }

    pub fn stats(&self) -> AgentStats {
        AgentStats {
            metrics: self.metrics.snapshot(),
            breaker: self.breaker.stats(),
            pool: self.pool.stats(),
        }
    }

    /// Spawn the periodic sweeper; ticks at the batch age so a buffered
    /// message waits at most about two age intervals.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let agent = Arc::clone(self);
        let period = agent.buffers.batch_age();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => agent.sweep_aged().await,
                    () = cancel.cancelled() => break,
                }
            }
            debug!("sweeper stopped");
        })
    }

    async fn flush_batch(&self, topic: &str, messages: &[Bytes]) {
        let started = Instant::now();
        let t0 = Utc::now().timestamp_micros() as f64 / 1_000_000.0;

        let mut raw = Vec::with_capacity(
            messages.iter().map(Bytes::len).sum::<usize>() + messages.len(),
        );
        for message in messages {
            raw.extend_from_slice(message);
            raw.push(b'\n');
        }

        let batch = match self.compressors.compress(topic, &raw) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(topic, error = %e, "compression failed, batch dropped");
                self.metrics.record_compression_error(topic);
                return;
            }
        };

        let header = FrameHeader {
            v: PROTOCOL_VERSION,
            topic: topic.to_string(),
            codec: batch.codec.as_str().to_string(),
            level: batch.level,
            dict_id: batch.dict_id.clone(),
            schema_id: Some(SCHEMA_ID.to_string()),
            count: messages.len() as u64,
            raw_len: raw.len() as u64,
            comp_len: batch.payload.len() as u64,
            t0: Some(t0),
            t1: Some(Utc::now().timestamp_micros() as f64 / 1_000_000.0),
        };
        let frame = match frame::encode(&header, &batch.payload) {
            Ok(frame) => frame,
            Err(e) => {
                // Header serialization cannot realistically fail for these
                // field types; counted rather than silently swallowed.
                warn!(topic, error = %e, "frame encoding failed, batch dropped");
                self.metrics.record_compression_error(topic);
                return;
            }
        };

        match self.breaker.call(|| self.send_frame(&frame)).await {
            Ok(()) => {
                self.metrics.record_batch(
                    topic,
                    messages.len() as u64,
                    raw.len() as u64,
                    batch.payload.len() as u64,
                    started.elapsed(),
                );
                debug!(
                    topic,
                    count = messages.len(),
                    raw_bytes = raw.len(),
                    compressed_bytes = batch.payload.len(),
                    "batch shipped"
                );
            }
            Err(BreakerError::Open { retry_in, .. }) => {
                self.metrics.record_network_error(topic);
                warn!(topic, ?retry_in, "circuit open, batch dropped without send");
            }
            Err(BreakerError::Inner(e)) => {
                self.metrics.record_network_error(topic);
                warn!(topic, error = %e, "send failed, batch dropped");
            }
        }
    }

    async fn send_frame(&self, frame: &[u8]) -> Result<(), SendError> {
        let mut conn = self.pool.acquire().await?;
        let result = conn.stream_mut().write_all(frame).await;
        // Released in both cases: the release-side liveness check closes a
        // connection the failed write left unusable.
        self.pool.release(conn);
        result?;
        Ok(())
    }
}
