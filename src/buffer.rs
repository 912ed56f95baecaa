//! Per-topic message buffers with dual flush triggers.
//!
//! One mutex guards the whole table; every critical section is a few queue
//! operations, and the flush decision plus detach-and-clear happen inside
//! the same section, so a message can never be observed both in a detached
//! batch and in the buffer that remains. Compression and network I/O never
//! run under this lock.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

/// A batch detached from its buffer, ready for assembly and dispatch.
#[derive(Debug)]
pub struct DetachedBatch {
    pub topic: String,
    pub messages: Vec<Bytes>,
}

struct TopicBuffer {
    queue: VecDeque<Bytes>,
    /// Enqueue time of the oldest unflushed message.
    origin: Option<Instant>,
}

impl TopicBuffer {
    fn new() -> Self {
        Self { queue: VecDeque::new(), origin: None }
    }

    fn detach(&mut self) -> Vec<Bytes> {
        self.origin = None;
        self.queue.drain(..).collect()
    }

    fn aged(&self, now: Instant, limit: Duration) -> bool {
        self.origin.is_some_and(|origin| now.duration_since(origin) >= limit)
    }
}

pub struct TopicBufferSet {
    batch_max: usize,
    batch_age: Duration,
    buffers: Mutex<HashMap<String, TopicBuffer>>,
}

impl TopicBufferSet {
    pub fn new(batch_max: usize, batch_age: Duration) -> Self {
        Self { batch_max, batch_age, buffers: Mutex::new(HashMap::new()) }
    }

    pub fn batch_age(&self) -> Duration {
        self.batch_age
    }

    /// Append one serialized message to its topic buffer. The buffer is
    /// created lazily on first use; an empty buffer records the current
    /// time as the batch's age origin.
    ///
    /// Returns the detached batch when the append tripped a flush trigger
    /// (count or age), `None` otherwise.
    pub fn push(&self, topic: &str, message: Bytes) -> Option<Vec<Bytes>> {
        let now = Instant::now();
        let mut buffers = self.buffers.lock();
        let buffer = buffers.entry(topic.to_string()).or_insert_with(TopicBuffer::new);
        if buffer.queue.is_empty() {
            buffer.origin = Some(now);
        }
        buffer.queue.push_back(message);

        if buffer.queue.len() >= self.batch_max || buffer.aged(now, self.batch_age) {
            Some(buffer.detach())
        } else {
            None
        }
    }

    /// Detach every buffer whose oldest message has reached the age limit.
    /// Called by the periodic sweep so a slow trickle still flushes within
    /// a bounded age even without new arrivals.
    pub fn detach_aged(&self) -> Vec<DetachedBatch> {
        let now = Instant::now();
        let mut buffers = self.buffers.lock();
        buffers
            .iter_mut()
            .filter(|(_, buffer)| !buffer.queue.is_empty() && buffer.aged(now, self.batch_age))
            .map(|(topic, buffer)| DetachedBatch { topic: topic.clone(), messages: buffer.detach() })
            .collect()
    }

    /// Detach every non-empty buffer regardless of age. Shutdown path.
    pub fn detach_all(&self) -> Vec<DetachedBatch> {
        let mut buffers = self.buffers.lock();
        buffers
            .iter_mut()
            .filter(|(_, buffer)| !buffer.queue.is_empty())
            .map(|(topic, buffer)| DetachedBatch { topic: topic.clone(), messages: buffer.detach() })
            .collect()
    }

    /// Number of buffered (unflushed) messages for a topic.
    pub fn pending(&self, topic: &str) -> usize {
        self.buffers.lock().get(topic).map_or(0, |buffer| buffer.queue.len())
    }
}
