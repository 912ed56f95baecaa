//! Per-topic append-only output sinks.
//!
//! Each topic lands in `<out_root>/<topic>.jsonl`. The file name is derived
//! from an already-validated topic and still goes through path confinement,
//! so a header crafted to escape the output root fails here even if an
//! earlier check regresses.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::validate::{self, ValidationError};

#[derive(Error, Debug)]
pub enum SinkError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("failed to append to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Append-only sinks rooted at one output directory.
pub struct TopicSinkSet {
    root: PathBuf,
}

impl TopicSinkSet {
    /// `root` must already exist; the bins create it at startup.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Append one decompressed batch to the topic's file. Batches are
    /// newline-delimited records, so plain appends keep the file valid
    /// JSONL without any sink-side framing.
    pub async fn append(&self, topic: &str, data: &[u8]) -> Result<PathBuf, SinkError> {
        let path = validate::confine_path(&self.root, &format!("{topic}.jsonl"))?;
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .await
            .map_err(|source| SinkError::Io { path: path.clone(), source })?;
        file.write_all(data)
            .await
            .map_err(|source| SinkError::Io { path: path.clone(), source })?;
        debug!(topic, path = %path.display(), size = data.len(), "batch appended");
        Ok(path)
    }
}
