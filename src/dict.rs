//! Dictionary index loading.
//!
//! Offline training (a separate batch job) leaves `dict_index.json` in the
//! dictionary directory, mapping each topic to `{dict_id, path, size}`.
//! Both the agent and the collector load the same index at startup; for a
//! given `dict_id` the two sides must hold byte-identical blobs or
//! decompression fails.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::validate;

pub const INDEX_FILE: &str = "dict_index.json";

#[derive(Debug, Deserialize)]
struct IndexRecord {
    dict_id: String,
    path: PathBuf,
    #[allow(dead_code)]
    size: u64,
}

/// One loaded dictionary: topic, its id, and the raw blob.
#[derive(Debug, Clone)]
pub struct DictionaryEntry {
    pub topic: String,
    pub dict_id: String,
    pub bytes: Vec<u8>,
}

/// Load every usable dictionary listed in `dict_dir/dict_index.json`.
///
/// A missing or unreadable index degrades to "no dictionaries" with a
/// warning rather than failing startup: topics without a dictionary ship
/// uncompressed, which is slower but correct.
pub fn load(dict_dir: &Path) -> Vec<DictionaryEntry> {
    let index_path = dict_dir.join(INDEX_FILE);
    let raw = match fs::read(&index_path) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(path = %index_path.display(), error = %e, "dictionary index not found");
            return Vec::new();
        }
    };

    let index: std::collections::BTreeMap<String, IndexRecord> =
        match serde_json::from_slice(&raw) {
            Ok(index) => index,
            Err(e) => {
                error!(path = %index_path.display(), error = %e, "failed to parse dictionary index");
                return Vec::new();
            }
        };

    let mut entries = Vec::new();
    for (topic, record) in index {
        if let Err(e) = validate::topic(&topic) {
            warn!(topic = %topic, error = %e, "skipping dictionary with invalid topic");
            continue;
        }
        if let Err(e) = validate::dict_id(&record.dict_id) {
            warn!(topic = %topic, error = %e, "skipping dictionary with invalid id");
            continue;
        }
        // Relative blob paths are resolved against the dictionary directory.
        let blob_path = if record.path.is_absolute() {
            record.path.clone()
        } else {
            dict_dir.join(&record.path)
        };
        let bytes = match fs::read(&blob_path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(topic = %topic, path = %blob_path.display(), error = %e,
                      "dictionary blob not found");
                continue;
            }
        };
        debug!(topic = %topic, dict_id = %record.dict_id, size = bytes.len(), "dictionary loaded");
        entries.push(DictionaryEntry { topic, dict_id: record.dict_id, bytes });
    }

    info!(count = entries.len(), path = %index_path.display(), "dictionaries loaded");
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_index_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(dir.path()).is_empty());
    }

    #[test]
    fn loads_entries_and_skips_missing_blobs() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("files.json.zdict"), b"sample dictionary bytes").unwrap();
        fs::write(
            dir.path().join(INDEX_FILE),
            br#"{
                "files.json": {"dict_id": "d:files.json:ab12cd34", "path": "files.json.zdict", "size": 23},
                "files.csv": {"dict_id": "d:files.csv:ffff0000", "path": "files.csv.zdict", "size": 10}
            }"#,
        )
        .unwrap();

        let entries = load(dir.path());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].topic, "files.json");
        assert_eq!(entries[0].dict_id, "d:files.json:ab12cd34");
        assert_eq!(entries[0].bytes, b"sample dictionary bytes");
    }

    #[test]
    fn unparsable_index_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(INDEX_FILE), b"not json").unwrap();
        assert!(load(dir.path()).is_empty());
    }
}
