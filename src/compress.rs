//! Compression adapter: zstd (dictionary-capable), zlib, or passthrough.
//!
//! The agent holds one prepared encoder dictionary per topic; the collector
//! holds one prepared decoder dictionary per dict id. Per-call state lives
//! in short-lived bulk contexts, so both sets are `Send + Sync` and shared
//! freely across tasks.

use std::collections::HashMap;
use std::io::Read;
use std::io::Write;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use zstd::dict::{DecoderDictionary, EncoderDictionary};

use crate::dict::DictionaryEntry;
use crate::frame::MAX_PAYLOAD_LEN;

/// Wire codec identifier carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// Zstandard, optionally dictionary-biased. The only codec that uses
    /// per-topic dictionaries.
    Zstd,
    /// zlib/DEFLATE, no dictionary support here.
    Zlib,
    /// No compression.
    None,
}

impl Codec {
    pub fn as_str(self) -> &'static str {
        match self {
            Codec::Zstd => "zstd",
            Codec::Zlib => "zlib",
            Codec::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Codec> {
        match s {
            "zstd" => Some(Codec::Zstd),
            "zlib" => Some(Codec::Zlib),
            "none" => Some(Codec::None),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("{codec} compression failed: {source}")]
    Codec {
        codec: &'static str,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum DecompressionError {
    #[error("{codec} decompression failed: {source}")]
    Codec {
        codec: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("decompressed size exceeds cap of {cap} bytes")]
    TooLarge { cap: usize },
}

/// Result of compressing one batch: the payload that actually goes on the
/// wire plus the codec, level, and dict identifiers the header must carry.
#[derive(Debug)]
pub struct CompressedBatch {
    pub payload: Vec<u8>,
    pub codec: Codec,
    /// Level actually applied, after any codec-specific clamping.
    /// `None` when the payload went out uncompressed.
    pub level: Option<i32>,
    pub dict_id: String,
}

struct TopicDictionary {
    dict_id: String,
    prepared: EncoderDictionary<'static>,
}

/// Agent-side compressor set, keyed by topic.
pub struct CompressorSet {
    codec: Codec,
    level: i32,
    by_topic: HashMap<String, TopicDictionary>,
}

impl CompressorSet {
    pub fn new(codec: Codec, level: i32, dictionaries: &[DictionaryEntry]) -> Self {
        let mut by_topic = HashMap::new();
        if codec == Codec::Zstd {
            for entry in dictionaries {
                by_topic.insert(
                    entry.topic.clone(),
                    TopicDictionary {
                        dict_id: entry.dict_id.clone(),
                        prepared: EncoderDictionary::copy(&entry.bytes, level),
                    },
                );
            }
        }
        Self { codec, level, by_topic }
    }

    pub fn topic_count(&self) -> usize {
        self.by_topic.len()
    }

    /// Compress one assembled batch for `topic`.
    ///
    /// With the zstd codec, a topic that has no trained dictionary passes
    /// through uncompressed with `codec="none"`, `dict_id=""` — the batch
    /// still ships, just without the bandwidth win.
    pub fn compress(&self, topic: &str, raw: &[u8]) -> Result<CompressedBatch, CompressionError> {
        match self.codec {
            Codec::None => Ok(CompressedBatch {
                payload: raw.to_vec(),
                codec: Codec::None,
                level: None,
                dict_id: String::new(),
            }),
            Codec::Zlib => {
                // zlib levels top out at 9; the configured (zstd-scale) level
                // is clamped rather than rejected.
                let clamped = self.level.clamp(1, 9);
                let mut encoder = flate2::write::ZlibEncoder::new(
                    Vec::new(),
                    flate2::Compression::new(clamped as u32),
                );
                encoder
                    .write_all(raw)
                    .and_then(|()| encoder.finish())
                    .map(|payload| CompressedBatch {
                        payload,
                        codec: Codec::Zlib,
                        level: Some(clamped),
                        dict_id: String::new(),
                    })
                    .map_err(|source| CompressionError::Codec { codec: "zlib", source })
            }
            Codec::Zstd => match self.by_topic.get(topic) {
                None => Ok(CompressedBatch {
                    payload: raw.to_vec(),
                    codec: Codec::None,
                    level: None,
                    dict_id: String::new(),
                }),
                Some(dictionary) => {
                    let payload = zstd::bulk::Compressor::with_prepared_dictionary(
                        &dictionary.prepared,
                    )
                    .and_then(|mut compressor| compressor.compress(raw))
                    .map_err(|source| CompressionError::Codec { codec: "zstd", source })?;
                    Ok(CompressedBatch {
                        payload,
                        codec: Codec::Zstd,
                        level: Some(self.level),
                        dict_id: dictionary.dict_id.clone(),
                    })
                }
            },
        }
    }
}

/// Collector-side decompressor set, keyed by dict id.
pub struct DecompressorSet {
    by_id: HashMap<String, DecoderDictionary<'static>>,
}

impl DecompressorSet {
    pub fn new(dictionaries: &[DictionaryEntry]) -> Self {
        let by_id = dictionaries
            .iter()
            .map(|entry| (entry.dict_id.clone(), DecoderDictionary::copy(&entry.bytes)))
            .collect();
        Self { by_id }
    }

    pub fn dict_count(&self) -> usize {
        self.by_id.len()
    }

    /// Decompress one payload. `raw_len_hint` is the sender's announced
    /// uncompressed length and bounds the output allocation.
    ///
    /// An unknown dict id falls back to dictionary-less decompression
    /// (best effort, logged) instead of aborting — the payload may not have
    /// needed the dictionary at all.
    pub fn decompress(
        &self,
        codec: Codec,
        dict_id: &str,
        payload: &[u8],
        raw_len_hint: usize,
    ) -> Result<Vec<u8>, DecompressionError> {
        let cap = raw_len_hint.min(MAX_PAYLOAD_LEN);
        match codec {
            Codec::None => Ok(payload.to_vec()),
            Codec::Zlib => {
                let mut out = Vec::with_capacity(cap);
                let mut decoder =
                    flate2::read::ZlibDecoder::new(payload).take(MAX_PAYLOAD_LEN as u64 + 1);
                decoder
                    .read_to_end(&mut out)
                    .map_err(|source| DecompressionError::Codec { codec: "zlib", source })?;
                if out.len() > MAX_PAYLOAD_LEN {
                    return Err(DecompressionError::TooLarge { cap: MAX_PAYLOAD_LEN });
                }
                Ok(out)
            }
            Codec::Zstd => {
                let dictionary = if dict_id.is_empty() {
                    None
                } else {
                    let found = self.by_id.get(dict_id);
                    if found.is_none() {
                        warn!(dict_id = %dict_id, "unknown dict id, decompressing without dictionary");
                    }
                    found
                };
                let mut decompressor = match dictionary {
                    Some(prepared) => {
                        zstd::bulk::Decompressor::with_prepared_dictionary(prepared)
                    }
                    None => zstd::bulk::Decompressor::new(),
                }
                .map_err(|source| DecompressionError::Codec { codec: "zstd", source })?;
                decompressor
                    .decompress(payload, cap)
                    .map_err(|source| DecompressionError::Codec { codec: "zstd", source })
            }
        }
    }
}
