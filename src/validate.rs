//! Input validation for topics, dictionary ids, and sink paths.
//!
//! Everything crossing a trust boundary (producer input, wire headers,
//! filenames derived from wire data) passes through here before it is
//! buffered, sent, or written.

use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

pub const MAX_TOPIC_LEN: usize = 255;
pub const MAX_DICT_ID_LEN: usize = 128;

static TOPIC_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("topic pattern is valid"));
// Trained ids look like `d:<topic>:<sha16>`, so dots from topic names appear here too.
static DICT_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9.:_-]+$").expect("dict id pattern is valid"));

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("topic cannot be empty")]
    EmptyTopic,
    #[error("topic exceeds maximum length of {MAX_TOPIC_LEN} characters")]
    TopicTooLong,
    #[error("path traversal detected in topic {0:?}")]
    TopicTraversal(String),
    #[error("topic cannot start with a path separator: {0:?}")]
    TopicLeadingSeparator(String),
    #[error("topic cannot end with a dot: {0:?}")]
    TopicTrailingDot(String),
    #[error("topic must contain only alphanumerics, dots, dashes, and underscores: {0:?}")]
    TopicInvalidChars(String),
    #[error("dict id exceeds maximum length of {MAX_DICT_ID_LEN} characters")]
    DictIdTooLong,
    #[error("dict id contains invalid characters: {0:?}")]
    DictIdInvalidChars(String),
    #[error("header missing or malformed: {0}")]
    Header(String),
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u32),
    #[error("message count must be at least 1")]
    ZeroCount,
    #[error("header length {got} exceeds cap of {cap} bytes")]
    HeaderTooLarge { got: usize, cap: usize },
    #[error("payload length {got} exceeds cap of {cap} bytes")]
    PayloadTooLarge { got: usize, cap: usize },
    #[error("path {0:?} escapes the output root")]
    PathEscape(String),
}

/// Validate a topic name against the wire contract.
///
/// Accepted: `[A-Za-z0-9._-]{1,255}`, no `..`, no leading separator, no
/// trailing dot. The same rule applies on both the enqueue path and the
/// collector's header validation so the two ends agree on what a topic is.
pub fn topic(name: &str) -> Result<&str, ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::EmptyTopic);
    }
    if name.len() > MAX_TOPIC_LEN {
        return Err(ValidationError::TopicTooLong);
    }
    if name.contains("..") {
        return Err(ValidationError::TopicTraversal(name.to_string()));
    }
    if name.starts_with('/') || name.starts_with('\\') {
        return Err(ValidationError::TopicLeadingSeparator(name.to_string()));
    }
    if !TOPIC_PATTERN.is_match(name) {
        return Err(ValidationError::TopicInvalidChars(name.to_string()));
    }
    if name.ends_with('.') {
        return Err(ValidationError::TopicTrailingDot(name.to_string()));
    }
    Ok(name)
}

/// Validate a dictionary id. Empty means "no dictionary" and is allowed.
pub fn dict_id(id: &str) -> Result<&str, ValidationError> {
    if id.is_empty() {
        return Ok(id);
    }
    if id.len() > MAX_DICT_ID_LEN {
        return Err(ValidationError::DictIdTooLong);
    }
    if !DICT_ID_PATTERN.is_match(id) {
        return Err(ValidationError::DictIdInvalidChars(id.to_string()));
    }
    Ok(id)
}

/// Join `file_name` onto `root`, rejecting any result that would resolve
/// outside `root`. The check is purely lexical (no filesystem access) so it
/// also covers files that do not exist yet.
pub fn confine_path(root: &Path, file_name: &str) -> Result<PathBuf, ValidationError> {
    let candidate = Path::new(file_name);
    for component in candidate.components() {
        match component {
            Component::Normal(_) => {}
            _ => return Err(ValidationError::PathEscape(file_name.to_string())),
        }
    }
    Ok(root.join(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_topics() {
        for name in ["sensors.temp", "a.b-c_d", "files.json", "x", "A-1_b.2"] {
            assert!(topic(name).is_ok(), "{name:?} should be accepted");
        }
    }

    #[test]
    fn rejects_malformed_topics() {
        for name in ["../x", "/etc/passwd", "bad topic", "", "a/b", "dot.", "a..b"] {
            assert!(topic(name).is_err(), "{name:?} should be rejected");
        }
        let too_long = "a".repeat(256);
        assert!(matches!(topic(&too_long), Err(ValidationError::TopicTooLong)));
        let max_len = "a".repeat(255);
        assert!(topic(&max_len).is_ok());
    }

    #[test]
    fn dict_id_rules() {
        assert!(dict_id("").is_ok());
        assert!(dict_id("d:files.json:ab12").is_ok());
        assert!(dict_id(&"x".repeat(129)).is_err());
        assert!(dict_id("bad id").is_err());
    }

    #[test]
    fn confine_path_stays_under_root() {
        let root = Path::new("/var/out");
        assert_eq!(
            confine_path(root, "files.json.jsonl").unwrap(),
            Path::new("/var/out/files.json.jsonl")
        );
        assert!(confine_path(root, "../escape.jsonl").is_err());
        assert!(confine_path(root, "/abs.jsonl").is_err());
        assert!(confine_path(root, "a/../../b").is_err());
    }
}
