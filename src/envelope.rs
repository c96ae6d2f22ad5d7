//! Job envelope — the canonical JSON representation of a unit of work.
//!
//! Jobs are plain JSON objects that travel through Redis lists and sorted
//! sets unmodified. This module owns the struct, its (de)serialization, and
//! the backtrace compression scheme used when a handler's retry policy asks
//! for a stack trace to be recorded.

use std::io::{Read, Write};

use base64::Engine;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Maximum length, in bytes, of a stored `error_message`.
pub const MAX_ERROR_MESSAGE_BYTES: usize = 10_000;

/// Errors raised while loading, dumping, or transforming a [`Job`].
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("job payload must be a JSON object")]
    NotAnObject,

    #[error("invalid job payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("backtrace compression failed: {0}")]
    Compression(#[from] std::io::Error),

    #[error("compressed backtrace is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Retry policy carried on a job envelope.
///
/// `retry` is `false`/`0` to disable retries entirely, `true` to accept the
/// default attempt cap, or an explicit integer cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    Disabled,
    Default,
    MaxAttempts(u32),
}

impl RetryPolicy {
    /// Resolves the policy to a concrete attempt cap, given the handler's
    /// declared default (consulted only when the envelope carries no
    /// explicit policy of its own).
    pub fn max_attempts(self, default: u32) -> Option<u32> {
        match self {
            RetryPolicy::Disabled => None,
            RetryPolicy::Default => Some(default),
            RetryPolicy::MaxAttempts(n) => Some(n),
        }
    }
}

/// A unit of work, serialized as canonical JSON for storage and transport,
/// including the fields that are only ever read or written by the
/// retry/death engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub class: String,
    #[serde(default)]
    pub args: Vec<Value>,
    pub jid: String,
    pub queue: String,

    #[serde(default = "default_retry", deserialize_with = "deserialize_retry")]
    pub retry: RetryField,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_queue: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retried_at: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<BacktracePolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_backtrace: Option<String>,

    /// `None` means "unset" (place in dead set); `Some(false)` means
    /// "explicitly suppress dead-letter placement". Checked by equality to
    /// `Some(false)`, never by truthiness.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<f64>,
}

/// Serialized form of the `retry` field: Sidekiq-compatible wire
/// representation (`false`, `true`, or an integer), kept distinct from
/// [`RetryPolicy`] so the wire shape survives round-trips unmodified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum RetryField {
    Bool(bool),
    Count(u32),
}

fn default_retry() -> RetryField {
    RetryField::Bool(true)
}

fn deserialize_retry<'de, D>(deserializer: D) -> Result<RetryField, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bool(bool),
        Count(u32),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Bool(b) => RetryField::Bool(b),
        Raw::Count(n) => RetryField::Count(n),
    })
}

impl RetryField {
    pub fn to_policy(self) -> RetryPolicy {
        match self {
            RetryField::Bool(false) => RetryPolicy::Disabled,
            RetryField::Bool(true) => RetryPolicy::Default,
            RetryField::Count(0) => RetryPolicy::Disabled,
            RetryField::Count(n) => RetryPolicy::MaxAttempts(n),
        }
    }
}

/// Backtrace recording policy: `false` to omit, `true` for the full stack,
/// or an integer to cap the number of frames recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BacktracePolicy {
    Enabled(bool),
    Frames(usize),
}

impl BacktracePolicy {
    /// Number of leading frames to keep, or `None` to keep all of them.
    pub fn frame_limit(self) -> Option<usize> {
        match self {
            BacktracePolicy::Enabled(false) => Some(0),
            BacktracePolicy::Enabled(true) => None,
            BacktracePolicy::Frames(n) => Some(n),
        }
    }
}

impl Job {
    /// Builds a new job envelope for `class` with the given arguments,
    /// targeting `queue`. `jid` is a fresh 24-hex identifier.
    pub fn new(class: impl Into<String>, args: Vec<Value>, queue: impl Into<String>) -> Self {
        let now = now_epoch();
        Self {
            class: class.into(),
            args,
            jid: generate_jid(),
            queue: queue.into(),
            retry: RetryField::Bool(true),
            retry_queue: None,
            retry_count: None,
            failed_at: None,
            retried_at: None,
            error_class: None,
            error_message: None,
            backtrace: None,
            error_backtrace: None,
            dead: None,
            created_at: Some(now),
            enqueued_at: Some(now),
        }
    }

    /// Parses a job from its canonical JSON payload. Rejects any payload
    /// whose root is not a JSON object.
    pub fn load(payload: &str) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_str(payload)?;
        if !value.is_object() {
            return Err(EnvelopeError::NotAnObject);
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Serializes the job to its canonical JSON payload.
    pub fn dump(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Whether this job explicitly suppresses dead-letter placement.
    /// Checked by equality to `Some(false)`, not truthiness.
    pub fn suppresses_dead_letter(&self) -> bool {
        self.dead == Some(false)
    }

    /// Returns the effective retry policy, falling back to `handler_default`
    /// only when the envelope carries no explicit `retry` override. `retry`
    /// once set by the client is never overwritten by the retry engine, so
    /// this never mutates `self`.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.to_policy()
    }

    /// Queue the retry engine should target: `retry_queue` if set, else
    /// the job's current `queue`.
    pub fn effective_retry_queue(&self) -> &str {
        self.retry_queue.as_deref().unwrap_or(&self.queue)
    }
}

/// Generates a unique 24-hex job identifier.
pub fn generate_jid() -> String {
    let mut bytes = [0u8; 12];
    rand::Rng::fill(&mut rand::rng(), &mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn now_epoch() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Truncates `message` to [`MAX_ERROR_MESSAGE_BYTES`] bytes (at a char
/// boundary) and scrubs any invalid UTF-8 byte sequences to the Unicode
/// replacement character.
pub fn scrub_error_message(message: &str) -> String {
    let truncated = if message.len() > MAX_ERROR_MESSAGE_BYTES {
        let mut end = MAX_ERROR_MESSAGE_BYTES;
        while end > 0 && !message.is_char_boundary(end) {
            end -= 1;
        }
        &message[..end]
    } else {
        message
    };
    // `message` is already a Rust `&str`, hence already valid UTF-8; the
    // scrub step matters when the text originated from raw exception bytes
    // upstream (e.g. a handler that formatted non-UTF-8 data into its
    // error). Re-validating here keeps the invariant enforced at the one
    // place it is persisted.
    String::from_utf8_lossy(truncated.as_bytes()).into_owned()
}

/// Compresses an array of backtrace frames: JSON-encode, zlib-deflate at
/// the default compression level, then base64-encode.
pub fn compress_backtrace(frames: &[String]) -> Result<String, EnvelopeError> {
    let json = serde_json::to_vec(frames)?;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    let compressed = encoder.finish()?;
    Ok(base64::engine::general_purpose::STANDARD.encode(compressed))
}

/// Reverses [`compress_backtrace`] exactly.
pub fn decompress_backtrace(encoded: &str) -> Result<Vec<String>, EnvelopeError> {
    let compressed = base64::engine::general_purpose::STANDARD.decode(encoded)?;
    let mut decoder = ZlibDecoder::new(compressed.as_slice());
    let mut json = Vec::new();
    decoder.read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_rejects_non_object_root() {
        assert!(matches!(
            Job::load("[1,2,3]"),
            Err(EnvelopeError::NotAnObject)
        ));
        assert!(matches!(Job::load("42"), Err(EnvelopeError::NotAnObject)));
    }

    #[test]
    fn jid_is_24_hex_chars() {
        let jid = generate_jid();
        assert_eq!(jid.len(), 24);
        assert!(jid.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn round_trips_through_json() {
        let job = Job::new("SomeWorker", vec![Value::from(1)], "default");
        let dumped = job.dump().unwrap();
        let loaded = Job::load(&dumped).unwrap();
        assert_eq!(loaded.jid, job.jid);
        assert_eq!(loaded.class, "SomeWorker");
        assert_eq!(loaded.queue, "default");
        assert!(matches!(loaded.retry, RetryField::Bool(true)));
    }

    #[test]
    fn retry_field_defaults_to_true_when_absent() {
        let job: Job = serde_json::from_str(
            r#"{"class":"W","args":[],"jid":"abc123abc123abc123abc123","queue":"default"}"#,
        )
        .unwrap();
        assert!(matches!(job.retry, RetryField::Bool(true)));
    }

    #[test]
    fn retry_false_disables() {
        let job: Job = serde_json::from_str(
            r#"{"class":"W","args":[],"jid":"abc123abc123abc123abc123","queue":"default","retry":false}"#,
        )
        .unwrap();
        assert_eq!(job.retry_policy(), RetryPolicy::Disabled);
    }

    #[test]
    fn retry_integer_is_max_attempts() {
        let job: Job = serde_json::from_str(
            r#"{"class":"W","args":[],"jid":"abc123abc123abc123abc123","queue":"default","retry":5}"#,
        )
        .unwrap();
        assert_eq!(job.retry_policy(), RetryPolicy::MaxAttempts(5));
    }

    #[test]
    fn dead_false_checked_by_equality_not_truthiness() {
        let mut job = Job::new("W", vec![], "default");
        assert!(!job.suppresses_dead_letter());
        job.dead = Some(false);
        assert!(job.suppresses_dead_letter());
        job.dead = Some(true);
        assert!(!job.suppresses_dead_letter());
    }

    #[test]
    fn message_truncated_to_10000_bytes_and_valid_utf8() {
        let long = "é".repeat(6000); // 2 bytes each = 12000 bytes
        let scrubbed = scrub_error_message(&long);
        assert!(scrubbed.len() <= MAX_ERROR_MESSAGE_BYTES);
        assert!(String::from_utf8(scrubbed.into_bytes()).is_ok());
    }

    #[test]
    fn scrub_replaces_invalid_sequences() {
        let invalid = unsafe { String::from_utf8_unchecked(vec![0xff, 0xfe, b'h', b'i']) };
        let scrubbed = scrub_error_message(&invalid);
        assert!(scrubbed.contains('\u{FFFD}'));
        assert!(scrubbed.ends_with("hi"));
    }

    #[test]
    fn backtrace_round_trip() {
        let frames: Vec<String> = vec!["frame1".into(), "frame2".into(), "frame3".into()];
        let compressed = compress_backtrace(&frames).unwrap();
        let decompressed = decompress_backtrace(&compressed).unwrap();
        assert_eq!(frames, decompressed);
    }

    #[test]
    fn empty_backtrace_compresses_to_nonempty_valid_string() {
        let frames: Vec<String> = Vec::new();
        let compressed = compress_backtrace(&frames).unwrap();
        assert!(!compressed.is_empty());
        let decompressed = decompress_backtrace(&compressed).unwrap();
        assert!(decompressed.is_empty());
    }

    #[test]
    fn backtrace_policy_frame_limit() {
        assert_eq!(BacktracePolicy::Enabled(true).frame_limit(), None);
        assert_eq!(BacktracePolicy::Enabled(false).frame_limit(), Some(0));
        assert_eq!(BacktracePolicy::Frames(10).frame_limit(), Some(10));
    }

    #[test]
    fn effective_retry_queue_falls_back_to_queue() {
        let mut job = Job::new("W", vec![], "default");
        assert_eq!(job.effective_retry_queue(), "default");
        job.retry_queue = Some("retry_queue".to_string());
        assert_eq!(job.effective_retry_queue(), "retry_queue");
    }
}
