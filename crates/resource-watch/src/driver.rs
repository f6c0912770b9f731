//! Per-connection stream driver.
//!
//! A driver task performs one watch request, splits the body into lines,
//! parses them and reports batches of events to the manager. It never decides
//! whether or when to reconnect; it only reports how the stream ended.

use std::{sync::Arc, time::Duration};

use futures_util::StreamExt;
use tokio::{
    sync::mpsc,
    time::{Instant, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::WatchConfig,
    error::WatchError,
    manager::Command,
    options::WatchKey,
    parse::{LineBuffer, parse_line},
    request::WatchRequest,
    transport::WatchTransport,
    types::WatchEvent,
};

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Progress reported by a driver to the manager.
#[derive(Debug)]
pub(crate) enum DriverMessage {
    /// Response headers arrived; the stream is open.
    Connected,
    /// Events parsed from one body chunk, possibly none.
    Chunk { events: Vec<WatchEvent> },
    /// The driver finished.
    Exited(DriverExit),
}

/// How a stream ended.
#[derive(Debug)]
pub(crate) enum DriverExit {
    /// The body ended normally.
    Ended {
        received_data: bool,
        open_for: Duration,
    },
    /// The server reported that the resource version is too old.
    Expired,
    /// No data arrived within the idle timeout.
    IdleTimeout,
    /// The request or the body failed.
    Failed(WatchError),
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

pub(crate) struct Driver {
    pub(crate) key: WatchKey,
    pub(crate) generation: u64,
    pub(crate) request: WatchRequest,
    pub(crate) transport: Arc<dyn WatchTransport>,
    pub(crate) config: Arc<WatchConfig>,
    pub(crate) token: CancellationToken,
    pub(crate) cmd_tx: mpsc::WeakSender<Command>,
}

impl Driver {
    pub(crate) fn spawn(self) {
        tokio::spawn(self.run());
    }

    async fn run(self) {
        let token = self.token.clone();
        let exit = tokio::select! {
            biased;

            () = token.cancelled() => {
                debug!(key = %self.key, generation = self.generation, "Watch driver cancelled");
                return;
            }
            exit = self.drive() => exit,
        };

        if token.is_cancelled() {
            return;
        }
        self.report(DriverMessage::Exited(exit)).await;
    }

    /// Send a message to the manager. Returns `false` once the manager is gone.
    async fn report(&self, message: DriverMessage) -> bool {
        let Some(cmd_tx) = self.cmd_tx.upgrade() else {
            return false;
        };
        cmd_tx
            .send(Command::Driver {
                key: self.key.clone(),
                generation: self.generation,
                message,
            })
            .await
            .is_ok()
    }

    async fn drive(&self) -> DriverExit {
        info!(
            key = %self.key,
            path = %self.request.path,
            resource_version = self.request.query_value("resourceVersion").unwrap_or_default(),
            "Watch connecting"
        );

        let started = Instant::now();
        let connect_timeout = self.config.connect_timeout;
        let mut body = match timeout(connect_timeout, self.transport.open(&self.request)).await {
            Ok(Ok(body)) => body,
            Ok(Err(err)) => return DriverExit::Failed(err),
            Err(_) => return DriverExit::Failed(WatchError::timeout(connect_timeout)),
        };

        if !self.report(DriverMessage::Connected).await {
            return DriverExit::Failed(WatchError::ManagerClosed);
        }

        let mut lines = LineBuffer::new();
        let mut received_data = false;

        loop {
            match timeout(self.config.idle_timeout, body.next()).await {
                Err(_) => {
                    warn!(
                        key = %self.key,
                        idle_ms = self.config.idle_timeout.as_millis() as u64,
                        "Watch stream idle"
                    );
                    return DriverExit::IdleTimeout;
                }
                Ok(Some(Ok(chunk))) => {
                    received_data = true;
                    lines.extend(&chunk);
                    let (events, expired) = drain_lines(&mut lines, false);
                    if !self.report(DriverMessage::Chunk { events }).await {
                        return DriverExit::Failed(WatchError::ManagerClosed);
                    }
                    if expired {
                        return DriverExit::Expired;
                    }
                }
                Ok(Some(Err(err))) => return DriverExit::Failed(err),
                Ok(None) => {
                    let (events, expired) = drain_lines(&mut lines, true);
                    if !events.is_empty() && !self.report(DriverMessage::Chunk { events }).await {
                        return DriverExit::Failed(WatchError::ManagerClosed);
                    }
                    if expired {
                        return DriverExit::Expired;
                    }

                    let open_for = started.elapsed();
                    debug!(
                        key = %self.key,
                        received_data,
                        open_ms = open_for.as_millis() as u64,
                        "Watch stream ended"
                    );
                    return DriverExit::Ended {
                        received_data,
                        open_for,
                    };
                }
            }
        }
    }
}

/// Parse every complete line in `lines`, plus the trailing partial line when
/// `at_end` is set.
///
/// Stops at the first expiry notice: events before it are returned, the
/// notice itself and anything after it are discarded.
fn drain_lines(lines: &mut LineBuffer, at_end: bool) -> (Vec<WatchEvent>, bool) {
    let mut events = Vec::new();

    while let Some(line) = lines.next_line() {
        if let Some(event) = parse_line(&line) {
            if event.is_expired() {
                return (events, true);
            }
            events.push(event);
        }
    }

    if at_end
        && let Some(rest) = lines.take_remainder()
        && let Some(event) = parse_line(&rest)
    {
        if event.is_expired() {
            return (events, true);
        }
        events.push(event);
    }

    (events, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WatchEventType;

    fn buffer(data: &[u8]) -> LineBuffer {
        let mut lines = LineBuffer::new();
        lines.extend(data);
        lines
    }

    #[test]
    fn drains_complete_lines_and_keeps_partial() {
        let mut lines = buffer(
            b"{\"type\":\"ADDED\",\"object\":{}}\ngarbage\n{\"type\":\"DELETED\",\"object\":{}}\n{\"type\"",
        );
        let (events, expired) = drain_lines(&mut lines, false);

        assert!(!expired);
        let types: Vec<_> = events.iter().map(WatchEvent::event_type).collect();
        assert_eq!(types, [WatchEventType::Added, WatchEventType::Deleted]);
        assert_eq!(lines.len(), 7);
    }

    #[test]
    fn flushes_trailing_line_at_end() {
        let mut lines = buffer(b"{\"type\":\"MODIFIED\",\"object\":{}}");
        let (events, _) = drain_lines(&mut lines, false);
        assert!(events.is_empty());

        let (events, expired) = drain_lines(&mut lines, true);
        assert!(!expired);
        assert_eq!(events.len(), 1);
        assert!(lines.is_empty());
    }

    #[test]
    fn stops_at_expiry_notice() {
        let mut lines = buffer(
            b"{\"type\":\"ADDED\",\"object\":{}}\n\
              {\"type\":\"ERROR\",\"object\":{\"code\":410,\"reason\":\"Expired\"}}\n\
              {\"type\":\"ADDED\",\"object\":{}}\n",
        );
        let (events, expired) = drain_lines(&mut lines, false);

        assert!(expired);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn other_errors_are_delivered() {
        let mut lines = buffer(b"{\"type\":\"ERROR\",\"object\":{\"code\":500}}\n");
        let (events, expired) = drain_lines(&mut lines, false);

        assert!(!expired);
        assert_eq!(events[0].event_type(), WatchEventType::Error);
    }
}
