//! Connection registry owned by the manager task.
//!
//! Each entry is one physical watch connection. Every subscriber of the key
//! gets its own unbounded queue, so a burst such as the initial `ADDED` sync
//! reaches each of them in full no matter how slowly they read. The entry
//! knows when its last subscriber leaves so the manager can start the cleanup
//! grace timer.

use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    options::{WatchKey, WatchOptions},
    request::ResourcePath,
    types::WatchEvent,
};

/// Lifecycle state of one watch connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the response to a watch request.
    Connecting,
    /// Streaming events.
    Connected,
    /// Waiting out a delay before the next request.
    Reconnecting {
        /// Consecutive failed attempts so far.
        attempt: u32,
    },
    /// Stopped while the page is hidden.
    Paused,
    /// Gave up after too many failures; only a visibility change or a new
    /// connection restarts it.
    Closed,
}

impl ConnectionState {
    /// Returns `true` if the connection is actively streaming.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Returns `true` if the connection gave up reconnecting.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Diagnostic snapshot of one connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionStatus {
    /// Subscription key of the connection.
    pub key: WatchKey,
    /// Current lifecycle state.
    pub state: ConnectionState,
    /// Time since data was last received (or the last connect began).
    pub idle: Duration,
    /// Whether a watch request is in flight.
    pub connecting: bool,
    /// Number of attached subscribers.
    pub subscribers: usize,
    /// Consecutive failed attempts.
    pub attempts: u32,
    /// Resource version the next request resumes from.
    pub resource_version: String,
}

/// A pending timer task, aborted when dropped.
#[derive(Debug)]
pub(crate) struct Timer {
    id: u64,
    handle: JoinHandle<()>,
}

impl Timer {
    pub(crate) fn new(id: u64, handle: JoinHandle<()>) -> Self {
        Self { id, handle }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// One physical watch connection and its subscribers.
pub(crate) struct WatchConnection {
    /// Registry-unique id; unsubscribe requests carry it so that a stale
    /// handle cannot detach from a newer connection under the same key.
    pub(crate) id: u64,
    pub(crate) options: WatchOptions,
    pub(crate) path: ResourcePath,
    pub(crate) resource_version: String,
    pub(crate) attempts: u32,
    pub(crate) state: ConnectionState,
    /// Id of the driver run whose messages are currently accepted.
    pub(crate) generation: u64,
    pub(crate) token: CancellationToken,
    pub(crate) last_activity: Instant,
    pub(crate) cleanup: Option<Timer>,
    pub(crate) reconnect: Option<Timer>,
    /// Per-subscriber queues keyed by subscriber id, in attach order.
    subscribers: BTreeMap<u64, mpsc::UnboundedSender<WatchEvent>>,
}

impl WatchConnection {
    pub(crate) fn new(id: u64, options: WatchOptions, path: ResourcePath) -> Self {
        let resource_version = options
            .resource_version
            .clone()
            .filter(|version| !version.is_empty())
            .unwrap_or_else(|| "0".to_string());

        Self {
            id,
            options,
            path,
            resource_version,
            attempts: 0,
            state: ConnectionState::Connecting,
            generation: 0,
            token: CancellationToken::new(),
            last_activity: Instant::now(),
            cleanup: None,
            reconnect: None,
            subscribers: BTreeMap::new(),
        }
    }

    /// Add a subscriber under `subscriber_id`, cancelling any pending cleanup.
    pub(crate) fn attach(&mut self, subscriber_id: u64) -> mpsc::UnboundedReceiver<WatchEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.cleanup = None;
        self.subscribers.insert(subscriber_id, tx);
        rx
    }

    /// Remove a subscriber. Returns `true` if it was attached and none remain.
    pub(crate) fn detach(&mut self, subscriber_id: u64) -> bool {
        self.subscribers.remove(&subscriber_id).is_some() && self.subscribers.is_empty()
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Queue an event for every current subscriber. Returns how many got it.
    ///
    /// Events are not kept for subscribers that attach later.
    pub(crate) fn publish(&self, event: &WatchEvent) -> usize {
        let mut delivered = 0;
        for tx in self.subscribers.values() {
            // A closed queue belongs to a subscriber whose unsubscribe is in flight.
            if tx.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Store a newer resource version. Numeric versions never move backwards.
    pub(crate) fn advance_resource_version(&mut self, version: &str) -> bool {
        if version == self.resource_version {
            return false;
        }
        if let (Ok(current), Ok(incoming)) =
            (self.resource_version.parse::<u64>(), version.parse::<u64>())
            && incoming < current
        {
            return false;
        }
        self.resource_version = version.to_string();
        true
    }

    pub(crate) fn reset_resource_version(&mut self) {
        self.resource_version = "0".to_string();
    }

    pub(crate) fn is_connecting(&self) -> bool {
        matches!(self.state, ConnectionState::Connecting)
    }

    /// Trigger cancellation and drop every pending timer.
    pub(crate) fn cancel(&mut self) {
        self.token.cancel();
        self.cleanup = None;
        self.reconnect = None;
    }

    pub(crate) fn status(&self, key: &WatchKey, now: Instant) -> ConnectionStatus {
        ConnectionStatus {
            key: key.clone(),
            state: self.state.clone(),
            idle: now.saturating_duration_since(self.last_activity),
            connecting: self.is_connecting(),
            subscribers: self.subscriber_count(),
            attempts: self.attempts,
            resource_version: self.resource_version.clone(),
        }
    }
}

/// Map from subscription key to its single live connection.
#[derive(Default)]
pub(crate) struct ConnectionRegistry {
    connections: HashMap<WatchKey, WatchConnection>,
    next_id: u64,
}

impl ConnectionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Allocate an id for a connection, driver run or timer.
    pub(crate) fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub(crate) fn get(&self, key: &WatchKey) -> Option<&WatchConnection> {
        self.connections.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: &WatchKey) -> Option<&mut WatchConnection> {
        self.connections.get_mut(key)
    }

    pub(crate) fn insert(&mut self, key: WatchKey, connection: WatchConnection) {
        self.connections.insert(key, connection);
    }

    pub(crate) fn remove(&mut self, key: &WatchKey) -> Option<WatchConnection> {
        self.connections.remove(key)
    }

    pub(crate) fn keys(&self) -> Vec<WatchKey> {
        self.connections.keys().cloned().collect()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&WatchKey, &WatchConnection)> {
        self.connections.iter()
    }

    /// Remove every connection.
    pub(crate) fn drain(&mut self) -> Vec<(WatchKey, WatchConnection)> {
        self.connections.drain().collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Status of every connection, ordered by key.
    pub(crate) fn statuses(&self, now: Instant) -> Vec<ConnectionStatus> {
        let mut statuses: Vec<_> = self
            .connections
            .iter()
            .map(|(key, connection)| connection.status(key, now))
            .collect();
        statuses.sort_by(|a, b| a.key.cmp(&b.key));
        statuses
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn connection(options: WatchOptions) -> WatchConnection {
        WatchConnection::new(1, options, ResourcePath::collection("/pods"))
    }

    #[test]
    fn resource_version_seeded_from_options() {
        assert_eq!(connection(WatchOptions::new("pods")).resource_version, "0");
        assert_eq!(
            connection(WatchOptions::new("pods").resource_version("55")).resource_version,
            "55"
        );
        assert_eq!(
            connection(WatchOptions::new("pods").resource_version("")).resource_version,
            "0"
        );
    }

    #[test]
    fn attach_and_detach_count_subscribers() {
        let mut conn = connection(WatchOptions::new("pods"));
        let _a = conn.attach(1);
        let _b = conn.attach(2);
        assert_eq!(conn.subscriber_count(), 2);

        assert!(!conn.detach(1));
        assert!(!conn.detach(1));
        assert!(conn.detach(2));
        assert!(!conn.detach(2));
        assert_eq!(conn.subscriber_count(), 0);
    }

    #[test]
    fn publish_fans_out_in_order() {
        let mut conn = connection(WatchOptions::new("pods"));
        let mut a = conn.attach(1);
        let mut b = conn.attach(2);

        conn.publish(&WatchEvent::Added(json!({"n": 1})));
        conn.publish(&WatchEvent::Deleted(json!({"n": 2})));

        for rx in [&mut a, &mut b] {
            assert_eq!(rx.try_recv().expect("first"), WatchEvent::Added(json!({"n": 1})));
            assert_eq!(
                rx.try_recv().expect("second"),
                WatchEvent::Deleted(json!({"n": 2}))
            );
        }
    }

    #[test]
    fn publish_keeps_every_event_of_a_burst() {
        let mut conn = connection(WatchOptions::new("pods"));
        let mut rx = conn.attach(1);

        for n in 0..1000 {
            assert_eq!(conn.publish(&WatchEvent::Added(json!({"n": n}))), 1);
        }
        for n in 0..1000 {
            assert_eq!(rx.try_recv().expect("queued"), WatchEvent::Added(json!({"n": n})));
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn publish_skips_dropped_receivers() {
        let mut conn = connection(WatchOptions::new("pods"));
        let gone = conn.attach(1);
        let mut kept = conn.attach(2);
        drop(gone);

        assert_eq!(conn.publish(&WatchEvent::Added(json!({}))), 1);
        assert_eq!(kept.try_recv().expect("queued"), WatchEvent::Added(json!({})));
        assert_eq!(conn.subscriber_count(), 2);
    }

    #[test]
    fn publish_without_subscribers_is_dropped() {
        let conn = connection(WatchOptions::new("pods"));
        assert_eq!(conn.publish(&WatchEvent::Added(json!({}))), 0);
    }

    #[test]
    fn resource_version_only_moves_forward() {
        let mut conn = connection(WatchOptions::new("pods"));
        assert!(conn.advance_resource_version("42"));
        assert!(!conn.advance_resource_version("40"));
        assert_eq!(conn.resource_version, "42");
        assert!(!conn.advance_resource_version("42"));
        assert!(conn.advance_resource_version("43"));

        conn.reset_resource_version();
        assert_eq!(conn.resource_version, "0");
        assert!(conn.advance_resource_version("7"));
    }

    #[test]
    fn opaque_resource_versions_are_accepted() {
        let mut conn = connection(WatchOptions::new("pods").resource_version("abc"));
        assert!(conn.advance_resource_version("abd"));
        assert_eq!(conn.resource_version, "abd");
    }

    #[test]
    fn registry_statuses_are_sorted() {
        let mut registry = ConnectionRegistry::new();
        for ns in ["b", "a"] {
            let options = WatchOptions::new("pods").namespace(ns);
            let key = options.key();
            let id = registry.next_id();
            registry.insert(
                key,
                WatchConnection::new(id, options, ResourcePath::collection("/pods")),
            );
        }

        let statuses = registry.statuses(Instant::now());
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].key.as_str(), "pods|ns=a");
        assert_eq!(statuses[1].key.as_str(), "pods|ns=b");
        assert!(statuses[0].connecting);
    }

    #[test]
    fn cancel_triggers_token() {
        let mut conn = connection(WatchOptions::new("pods"));
        let token = conn.token.clone();
        conn.cancel();
        assert!(token.is_cancelled());
    }
}
