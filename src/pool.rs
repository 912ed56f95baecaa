//! Bounded pool of reusable TCP connections to the collector.
//!
//! Sockets are expensive to set up relative to the frames they carry, so
//! the sender path checks connections out, writes, and checks them back in.
//! Invariants: the live count (pooled + checked out) never exceeds
//! `max_size`, and a connection is owned by exactly one of {pool, caller}
//! at any instant.

use std::collections::VecDeque;
use std::io;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::debug;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("timed out connecting to {addr}")]
    ConnectTimeout { addr: String },
    #[error("timed out waiting for a pooled connection")]
    AcquireTimeout,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Collector endpoint, `host:port`.
    pub addr: String,
    pub max_size: usize,
    pub connect_timeout: Duration,
    /// Upper bound on waiting for a checked-out connection when at capacity.
    pub acquire_timeout: Duration,
    /// Idle connections older than this are closed and replaced.
    pub max_idle: Duration,
}

/// Non-destructive liveness capability, kept as a seam so the pool logic
/// stays portable across transport implementations.
pub trait Liveness {
    fn is_alive(&self) -> bool;
}

impl Liveness for TcpStream {
    fn is_alive(&self) -> bool {
        // The collector never writes back, so a readable byte is either EOF
        // or protocol garbage; in both cases the connection is unusable and
        // gets discarded, so nothing meaningful is ever consumed here.
        let mut probe = [0u8; 1];
        match self.try_read(&mut probe) {
            Ok(0) => false,
            Ok(_) => false,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
            Err(_) => false,
        }
    }
}

/// A connection checked out of the pool. Owned by the caller until passed
/// back through `release`; dropping it without releasing closes the socket
/// but leaks a live-count slot, so the sender path always releases.
#[derive(Debug)]
pub struct PooledConnection {
    stream: TcpStream,
}

impl PooledConnection {
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}

struct IdleConnection {
    stream: TcpStream,
    since: Instant,
}

struct PoolInner {
    idle: VecDeque<IdleConnection>,
    live: usize,
    created: u64,
    reused: u64,
}

pub struct ConnectionPool {
    config: PoolConfig,
    inner: Mutex<PoolInner>,
    released: Notify,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub addr: String,
    pub live: usize,
    pub idle: usize,
    pub max_size: usize,
    pub created: u64,
    pub reused: u64,
    pub reuse_rate: f64,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(PoolInner {
                idle: VecDeque::new(),
                live: 0,
                created: 0,
                reused: 0,
            }),
            released: Notify::new(),
        }
    }

    /// Check a usable connection out of the pool: a validated idle one if
    /// available, a fresh one if below capacity, otherwise wait for a
    /// release up to the acquire timeout.
    pub async fn acquire(&self) -> Result<PooledConnection, PoolError> {
        let deadline = Instant::now() + self.config.acquire_timeout;
        loop {
            let candidate = self.inner.lock().idle.pop_front();
            if let Some(idle) = candidate {
                if idle.since.elapsed() <= self.config.max_idle && idle.stream.is_alive() {
                    self.inner.lock().reused += 1;
                    return Ok(PooledConnection { stream: idle.stream });
                }
                // Stale or dead: close it and fall through to create/wait.
                drop(idle);
                self.decrement_live();
                self.released.notify_one();
                continue;
            }

            let below_capacity = {
                let mut inner = self.inner.lock();
                if inner.live < self.config.max_size {
                    inner.live += 1; // reserve the slot before connecting
                    true
                } else {
                    false
                }
            };
            if below_capacity {
                match self.connect().await {
                    Ok(stream) => {
                        self.inner.lock().created += 1;
                        return Ok(PooledConnection { stream });
                    }
                    Err(e) => {
                        self.decrement_live();
                        self.released.notify_one();
                        return Err(e);
                    }
                }
            }

            // At capacity: block until a release, bounded by the deadline.
            // No fairness guarantee among waiters.
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Err(PoolError::AcquireTimeout);
            };
            if timeout(remaining, self.released.notified()).await.is_err() {
                return Err(PoolError::AcquireTimeout);
            }
        }
    }

    /// Return a connection. A live one goes back with a fresh idle
    /// timestamp; a dead one is closed; a surplus one (pool already full)
    /// is closed rather than growing the pool.
    pub fn release(&self, conn: PooledConnection) {
        let alive = conn.stream.is_alive();
        let mut inner = self.inner.lock();
        if alive && inner.idle.len() < self.config.max_size {
            inner.idle.push_back(IdleConnection { stream: conn.stream, since: Instant::now() });
        } else {
            debug!(alive, "closing connection on release");
            inner.live = inner.live.saturating_sub(1);
        }
        drop(inner);
        self.released.notify_one();
    }

    // The count can already be zero when `close_all` ran while this
    // connection was checked out; saturate rather than underflow.
    fn decrement_live(&self) {
        let mut inner = self.inner.lock();
        inner.live = inner.live.saturating_sub(1);
    }

    /// Drain and close every pooled connection; shutdown path.
    pub fn close_all(&self) {
        let mut inner = self.inner.lock();
        inner.idle.clear();
        inner.live = 0;
        drop(inner);
        self.released.notify_one();
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        let handed_out = inner.created + inner.reused;
        PoolStats {
            addr: self.config.addr.clone(),
            live: inner.live,
            idle: inner.idle.len(),
            max_size: self.config.max_size,
            created: inner.created,
            reused: inner.reused,
            reuse_rate: if handed_out == 0 {
                0.0
            } else {
                inner.reused as f64 / handed_out as f64
            },
        }
    }

    async fn connect(&self) -> Result<TcpStream, PoolError> {
        match timeout(self.config.connect_timeout, TcpStream::connect(&self.config.addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(PoolError::Connect { addr: self.config.addr.clone(), source }),
            Err(_) => Err(PoolError::ConnectTimeout { addr: self.config.addr.clone() }),
        }
    }
}
