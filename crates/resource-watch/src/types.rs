//! Core type definitions for watch events.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The `type` field of a watch stream line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    /// A resource was created.
    Added,
    /// A resource was updated.
    Modified,
    /// A resource was removed.
    Deleted,
    /// Progress marker carrying only a new resource version.
    Bookmark,
    /// The server reported a problem with the watch.
    Error,
}

impl WatchEventType {
    /// Returns true for `BOOKMARK`.
    pub fn is_bookmark(&self) -> bool {
        matches!(self, Self::Bookmark)
    }

    /// Returns true for `ERROR`.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error)
    }
}

impl fmt::Display for WatchEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Added => write!(f, "ADDED"),
            Self::Modified => write!(f, "MODIFIED"),
            Self::Deleted => write!(f, "DELETED"),
            Self::Bookmark => write!(f, "BOOKMARK"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Reason attached to the synthetic error sent once reconnection gives up.
pub const RECONNECT_FAILED_REASON: &str = "ReconnectFailed";

/// Payload of an `ERROR` event, a subset of a Kubernetes `Status` object.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchStatus {
    /// HTTP-like status code, e.g. `410`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    /// Machine-readable reason, e.g. `"Expired"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl WatchStatus {
    /// Returns true if the server no longer recognises the resource version
    /// the watch was started from, meaning it must restart from `"0"`.
    pub fn is_expired(&self) -> bool {
        self.code == Some(410) || self.reason.as_deref() == Some("Expired")
    }

    /// Returns true for the synthetic status sent after reconnection gave up.
    pub fn is_reconnect_failure(&self) -> bool {
        self.reason.as_deref() == Some(RECONNECT_FAILED_REASON)
    }

    pub(crate) fn reconnect_failed(attempts: u32, cause: &str) -> Self {
        Self {
            code: None,
            reason: Some(RECONNECT_FAILED_REASON.to_string()),
            message: Some(format!(
                "giving up after {attempts} failed attempts: {cause}"
            )),
        }
    }
}

/// One notification from a watch stream.
#[derive(Clone, Debug, PartialEq)]
pub enum WatchEvent {
    /// A resource was created.
    Added(Value),
    /// A resource was updated.
    Modified(Value),
    /// A resource was removed.
    Deleted(Value),
    /// Resource-version checkpoint; the object carries nothing else of use.
    Bookmark(Value),
    /// The server (or the manager, after giving up) reported an error.
    Error(WatchStatus),
}

impl WatchEvent {
    /// The wire type of this event.
    pub fn event_type(&self) -> WatchEventType {
        match self {
            Self::Added(_) => WatchEventType::Added,
            Self::Modified(_) => WatchEventType::Modified,
            Self::Deleted(_) => WatchEventType::Deleted,
            Self::Bookmark(_) => WatchEventType::Bookmark,
            Self::Error(_) => WatchEventType::Error,
        }
    }

    /// The resource payload, `None` for errors.
    pub fn object(&self) -> Option<&Value> {
        match self {
            Self::Added(object)
            | Self::Modified(object)
            | Self::Deleted(object)
            | Self::Bookmark(object) => Some(object),
            Self::Error(_) => None,
        }
    }

    /// Resource version carried by the payload, if any.
    pub fn resource_version(&self) -> Option<&str> {
        self.object()
            .and_then(crate::parse::extract_resource_version)
    }

    /// Returns true for an `ERROR` signalling a stale resource version.
    pub fn is_expired(&self) -> bool {
        matches!(self, Self::Error(status) if status.is_expired())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_event_type_display() {
        assert_eq!(WatchEventType::Added.to_string(), "ADDED");
        assert_eq!(WatchEventType::Modified.to_string(), "MODIFIED");
        assert_eq!(WatchEventType::Deleted.to_string(), "DELETED");
        assert_eq!(WatchEventType::Bookmark.to_string(), "BOOKMARK");
        assert_eq!(WatchEventType::Error.to_string(), "ERROR");
    }

    #[test]
    fn test_event_type_predicates() {
        assert!(WatchEventType::Bookmark.is_bookmark());
        assert!(!WatchEventType::Added.is_bookmark());
        assert!(WatchEventType::Error.is_error());
        assert!(!WatchEventType::Deleted.is_error());
    }

    #[test]
    fn test_status_expired() {
        let by_code = WatchStatus {
            code: Some(410),
            ..Default::default()
        };
        let by_reason = WatchStatus {
            reason: Some("Expired".to_string()),
            ..Default::default()
        };
        let other = WatchStatus {
            code: Some(500),
            reason: Some("InternalError".to_string()),
            message: None,
        };

        assert!(by_code.is_expired());
        assert!(by_reason.is_expired());
        assert!(!other.is_expired());
    }

    #[test]
    fn test_reconnect_failed_status() {
        let status = WatchStatus::reconnect_failed(5, "connection refused");
        assert!(status.is_reconnect_failure());
        assert!(!status.is_expired());
        assert_eq!(
            status.message.as_deref(),
            Some("giving up after 5 failed attempts: connection refused")
        );
    }

    #[test]
    fn test_event_accessors() {
        let event = WatchEvent::Modified(json!({
            "metadata": {"name": "x", "resourceVersion": "42"}
        }));
        assert_eq!(event.event_type(), WatchEventType::Modified);
        assert_eq!(event.resource_version(), Some("42"));
        assert!(!event.is_expired());

        let error = WatchEvent::Error(WatchStatus {
            code: Some(410),
            ..Default::default()
        });
        assert!(error.object().is_none());
        assert!(error.resource_version().is_none());
        assert!(error.is_expired());
    }
}
