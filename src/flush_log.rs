//! Record-per-flush CSV log.
//!
//! One row per received batch, cheap enough to keep always-on. The fields
//! never contain commas (topic and dict id charsets forbid them), so the
//! rows are written with plain formatting instead of a CSV library.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::info;

const HEADER_ROW: &str = "timestamp,topic,count,raw_bytes,compressed_bytes,ratio,dict_id\n";

#[derive(Error, Debug)]
pub enum FlushLogError {
    #[error("flush log i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug)]
pub struct FlushRecord<'a> {
    pub topic: &'a str,
    pub count: u64,
    pub raw_bytes: u64,
    pub compressed_bytes: u64,
    pub dict_id: &'a str,
}

pub struct FlushLog {
    path: PathBuf,
    // Serializes appends; each row is one small buffered write.
    lock: Mutex<()>,
}

impl FlushLog {
    /// Open (or create) the log. A fresh file gets the header row; an
    /// existing one is appended to across restarts.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, FlushLogError> {
        let path = path.into();
        if !path.exists() {
            std::fs::write(&path, HEADER_ROW)
                .map_err(|source| FlushLogError::Io { path: path.clone(), source })?;
            info!(path = %path.display(), "flush log created");
        }
        Ok(Self { path, lock: Mutex::new(()) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &FlushRecord<'_>) -> Result<(), FlushLogError> {
        let ratio = record.compressed_bytes as f64 / record.raw_bytes.max(1) as f64;
        let timestamp = Utc::now().timestamp_micros() as f64 / 1_000_000.0;
        let row = format!(
            "{timestamp:.6},{},{},{},{},{ratio:.6},{}\n",
            record.topic, record.count, record.raw_bytes, record.compressed_bytes, record.dict_id,
        );

        let _guard = self.lock.lock();
        OpenOptions::new()
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(row.as_bytes()))
            .map_err(|source| FlushLogError::Io { path: self.path.clone(), source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> FlushRecord<'static> {
        FlushRecord {
            topic: "files.json",
            count: 12,
            raw_bytes: 4096,
            compressed_bytes: 1024,
            dict_id: "d:files.json:ab12",
        }
    }

    #[test]
    fn fresh_log_starts_with_the_header_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flush.csv");
        let log = FlushLog::open(&path).unwrap();
        log.append(&record()).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], HEADER_ROW.trim_end());
        assert!(lines[1].contains(",files.json,12,4096,1024,0.250000,d:files.json:ab12"));
    }

    #[test]
    fn reopening_does_not_duplicate_the_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flush.csv");
        FlushLog::open(&path).unwrap().append(&record()).unwrap();
        FlushLog::open(&path).unwrap().append(&record()).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 3);
        assert_eq!(content.matches("timestamp,").count(), 1);
    }

    #[test]
    fn zero_raw_bytes_does_not_divide_by_zero() {
        let dir = tempfile::tempdir().unwrap();
        let log = FlushLog::open(dir.path().join("flush.csv")).unwrap();
        log.append(&FlushRecord { raw_bytes: 0, ..record() }).unwrap();
    }
}
