//! Collector server: accept loop, frame handling, per-topic sinks.
//!
//! One spawned task per accepted connection. A connection carries any
//! number of frames; a clean EOF between frames ends it normally (that is
//! how the agent's pooled connections close), while any protocol violation
//! aborts that connection alone. The accept loop is never taken down by a
//! misbehaving peer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::compress::{Codec, DecompressorSet};
use crate::config::Settings;
use crate::dict;
use crate::flush_log::{FlushLog, FlushLogError, FlushRecord};
use crate::frame::{self, FrameHeader};
use crate::metrics::{MetricsCollector, ProcessSnapshot};
use crate::sink::TopicSinkSet;

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("failed to prepare output directory {path}: {source}")]
    OutDir {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    FlushLog(#[from] FlushLogError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Serialize)]
pub struct CollectorStats {
    pub metrics: ProcessSnapshot,
    pub dict_count: usize,
}

pub struct CollectorServer {
    decompressors: DecompressorSet,
    sinks: TopicSinkSet,
    flush_log: FlushLog,
    metrics: MetricsCollector,
}

impl CollectorServer {
    pub fn new(settings: &Settings) -> Result<Self, CollectorError> {
        std::fs::create_dir_all(&settings.out_dir).map_err(|source| CollectorError::OutDir {
            path: settings.out_dir.clone(),
            source,
        })?;
        let dictionaries = dict::load(&settings.dict_dir);
        let decompressors = DecompressorSet::new(&dictionaries);
        info!(
            out_dir = %settings.out_dir.display(),
            dict_count = decompressors.dict_count(),
            "collector initialized"
        );
        Ok(Self {
            decompressors,
            sinks: TopicSinkSet::new(&settings.out_dir),
            flush_log: FlushLog::open(&settings.metrics_file)?,
            metrics: MetricsCollector::new(),
        })
    }

    pub async fn bind(settings: &Settings) -> Result<TcpListener, CollectorError> {
        let addr = settings.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| CollectorError::Bind { addr: addr.clone(), source })?;
        info!(%addr, "collector listening");
        Ok(listener)
    }

    /// Accept until cancelled. Returns once the cancel token fires; spawned
    /// connection handlers drain on their own.
    pub async fn run(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&self);
                        tokio::spawn(async move {
                            server.handle_connection(stream, peer).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                () = cancel.cancelled() => {
                    info!("collector accept loop stopped");
                    return;
                }
            }
        }
    }

    pub fn stats(&self) -> CollectorStats {
        CollectorStats {
            metrics: self.metrics.snapshot(),
            dict_count: self.decompressors.dict_count(),
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream, peer: SocketAddr) {
        debug!(%peer, "connection accepted");
        loop {
            let started = Instant::now();
            let (header, payload) = match frame::read(&mut stream).await {
                Ok(Some(received)) => received,
                Ok(None) => {
                    debug!(%peer, "connection closed cleanly");
                    return;
                }
                Err(e) => {
                    error!(%peer, error = %e, "frame error, closing connection");
                    return;
                }
            };
            if let Err(e) = self.handle_frame(&header, &payload, started).await {
                error!(%peer, topic = %header.topic, error = %e, "frame handling failed, closing connection");
                return;
            }
        }
    }

    async fn handle_frame(
        &self,
        header: &FrameHeader,
        payload: &[u8],
        started: Instant,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let Some(codec) = Codec::parse(&header.codec) else {
            return Err(format!("unsupported codec {:?}", header.codec).into());
        };

        let decompressed = match self.decompressors.decompress(
            codec,
            &header.dict_id,
            payload,
            header.raw_len as usize,
        ) {
            Ok(data) => data,
            Err(e) => {
                self.metrics.record_compression_error(&header.topic);
                return Err(e.into());
            }
        };

        self.sinks.append(&header.topic, &decompressed).await?;

        self.metrics.record_batch(
            &header.topic,
            header.count,
            header.raw_len,
            header.comp_len,
            started.elapsed(),
        );
        // A failed CSV row is not worth the connection.
        if let Err(e) = self.flush_log.append(&FlushRecord {
            topic: &header.topic,
            count: header.count,
            raw_bytes: header.raw_len,
            compressed_bytes: header.comp_len,
            dict_id: &header.dict_id,
        }) {
            error!(error = %e, "flush log append failed");
        }

        info!(
            topic = %header.topic,
            count = header.count,
            raw_bytes = header.raw_len,
            compressed_bytes = header.comp_len,
            duration_ms = started.elapsed().as_secs_f64() * 1000.0,
            "batch received"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PROTOCOL_VERSION;
    use tokio::io::AsyncWriteExt;

    struct Harness {
        _dir: tempfile::TempDir,
        out_dir: std::path::PathBuf,
        metrics_file: std::path::PathBuf,
        addr: String,
        server: Arc<CollectorServer>,
        cancel: CancellationToken,
    }

    async fn start_collector() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            dict_dir: dir.path().join("dicts"),
            out_dir: dir.path().join("out"),
            metrics_file: dir.path().join("metrics.csv"),
            bind_host: "127.0.0.1".to_string(),
            ..Settings::default()
        };
        let server = Arc::new(CollectorServer::new(&settings).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&server).run(listener, cancel.clone()));
        Harness {
            _dir: dir,
            out_dir: settings.out_dir.clone(),
            metrics_file: settings.metrics_file.clone(),
            addr,
            server,
            cancel,
        }
    }

    fn plain_frame(topic: &str, lines: &[&str]) -> bytes::Bytes {
        let payload: Vec<u8> = lines.iter().flat_map(|l| [l.as_bytes(), b"\n"].concat()).collect();
        let header = FrameHeader {
            v: PROTOCOL_VERSION,
            topic: topic.to_string(),
            codec: "none".to_string(),
            level: None,
            dict_id: String::new(),
            schema_id: Some("s1".to_string()),
            count: lines.len() as u64,
            raw_len: payload.len() as u64,
            comp_len: payload.len() as u64,
            t0: None,
            t1: None,
        };
        frame::encode(&header, &payload).unwrap()
    }

    async fn wait_for_flushes(server: &CollectorServer, n: u64) {
        for _ in 0..100 {
            if server.stats().metrics.overall.flush_count >= n {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("collector never recorded {n} flushes");
    }

    #[tokio::test]
    async fn frames_on_one_connection_land_in_topic_files() {
        let harness = start_collector().await;

        let mut client = TcpStream::connect(&harness.addr).await.unwrap();
        client.write_all(&plain_frame("files.json", &["{\"a\":1}"])).await.unwrap();
        client.write_all(&plain_frame("files.json", &["{\"b\":2}"])).await.unwrap();
        drop(client);

        wait_for_flushes(&harness.server, 2).await;
        let content =
            std::fs::read_to_string(harness.out_dir.join("files.json.jsonl")).unwrap();
        assert_eq!(content, "{\"a\":1}\n{\"b\":2}\n");

        let stats = harness.server.stats();
        assert_eq!(stats.metrics.overall.messages, 2);
        assert_eq!(stats.metrics.topics["files.json"].flush_count, 2);

        let csv = std::fs::read_to_string(&harness.metrics_file).unwrap();
        assert_eq!(csv.lines().count(), 3); // header + 2 rows

        harness.cancel.cancel();
    }

    #[tokio::test]
    async fn bad_frame_aborts_only_its_connection() {
        let harness = start_collector().await;

        // Header length announcing more than the cap.
        let mut bad = TcpStream::connect(&harness.addr).await.unwrap();
        bad.write_all(&(1024u32 * 1024).to_be_bytes()).await.unwrap();
        drop(bad);

        // The accept loop still serves the next client.
        let mut good = TcpStream::connect(&harness.addr).await.unwrap();
        good.write_all(&plain_frame("files.txt", &["ok"])).await.unwrap();
        drop(good);

        wait_for_flushes(&harness.server, 1).await;
        assert!(harness.out_dir.join("files.txt.jsonl").exists());
        harness.cancel.cancel();
    }

    #[tokio::test]
    async fn zstd_frame_without_known_dict_still_lands() {
        let harness = start_collector().await;

        let raw = b"{\"path\":\"/var/a\"}\n".repeat(50);
        let payload = zstd::bulk::Compressor::new(3).unwrap().compress(&raw).unwrap();
        let header = FrameHeader {
            v: PROTOCOL_VERSION,
            topic: "files.csv".to_string(),
            codec: "zstd".to_string(),
            level: Some(3),
            dict_id: "d:files.csv:feed".to_string(),
            schema_id: None,
            count: 50,
            raw_len: raw.len() as u64,
            comp_len: payload.len() as u64,
            t0: None,
            t1: None,
        };
        let mut client = TcpStream::connect(&harness.addr).await.unwrap();
        client.write_all(&frame::encode(&header, &payload).unwrap()).await.unwrap();
        drop(client);

        wait_for_flushes(&harness.server, 1).await;
        let content = std::fs::read(harness.out_dir.join("files.csv.jsonl")).unwrap();
        assert_eq!(content, raw);
        harness.cancel.cancel();
    }
}
