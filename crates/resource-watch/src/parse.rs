//! Parser for newline-delimited watch streams.
//!
//! Each line of a watch response body is one JSON object shaped as
//! `{"type": "ADDED", "object": {...}}`. Lines that do not match are dropped
//! rather than treated as stream failures.

use bytes::{Buf, Bytes, BytesMut};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::types::{WatchEvent, WatchEventType, WatchStatus};

const LF: u8 = b'\n';
const CR: u8 = b'\r';

#[derive(Deserialize)]
struct RawWatchEvent {
    #[serde(rename = "type")]
    event_type: WatchEventType,
    object: Value,
}

/// Parse one line of a watch stream.
///
/// Returns `None` for blank lines, invalid JSON, unrecognised event types and
/// payloads that are not JSON objects.
pub fn parse_line(line: &[u8]) -> Option<WatchEvent> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return None;
    }

    let raw: RawWatchEvent = match serde_json::from_slice(line) {
        Ok(raw) => raw,
        Err(err) => {
            debug!(error = %err, len = line.len(), "Dropping unparseable watch line");
            return None;
        }
    };

    if !raw.object.is_object() {
        debug!(event_type = %raw.event_type, "Dropping watch line without object payload");
        return None;
    }

    let event = match raw.event_type {
        WatchEventType::Added => WatchEvent::Added(raw.object),
        WatchEventType::Modified => WatchEvent::Modified(raw.object),
        WatchEventType::Deleted => WatchEvent::Deleted(raw.object),
        WatchEventType::Bookmark => WatchEvent::Bookmark(raw.object),
        WatchEventType::Error => {
            WatchEvent::Error(WatchStatus::deserialize(&raw.object).unwrap_or_default())
        }
    };
    Some(event)
}

/// Extract `metadata.resourceVersion` from a resource payload.
///
/// Missing or empty versions yield `None`.
pub fn extract_resource_version(object: &Value) -> Option<&str> {
    object
        .pointer("/metadata/resourceVersion")
        .and_then(Value::as_str)
        .filter(|version| !version.is_empty())
}

/// Accumulates body chunks and hands out complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: BytesMut,
}

impl LineBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk read from the response body.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Pop the next complete line, without its `\n` or `\r\n` terminator.
    pub fn next_line(&mut self) -> Option<Bytes> {
        let eol = memchr::memchr(LF, &self.buffer)?;
        let mut line = self.buffer.split_to(eol);
        self.buffer.advance(1);
        if line.last() == Some(&CR) {
            line.truncate(line.len() - 1);
        }
        Some(line.freeze())
    }

    /// Take whatever is left once the stream has ended.
    pub fn take_remainder(&mut self) -> Option<Bytes> {
        if self.buffer.is_empty() {
            return None;
        }
        Some(self.buffer.split().freeze())
    }

    /// Number of buffered bytes not yet returned as a line.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns true if no partial line is buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
