//! Subscriber handle returned by [`WatchManager::subscribe`](crate::WatchManager::subscribe).

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use crate::{manager::Command, options::WatchKey, types::WatchEvent};

/// A subscriber's attachment to a shared watch connection.
///
/// Yields every event of the connection from the moment of subscription, in
/// stream order. Dropping the handle detaches it; the connection is closed
/// once no subscriber has re-attached within the cleanup grace period.
///
/// Each subscription has its own unbounded queue, so a slow reader never
/// loses events; it only holds them in memory until read.
///
/// `None` means the connection was closed by the manager.
pub struct Subscription {
    key: WatchKey,
    connection_id: u64,
    subscriber_id: u64,
    stream: UnboundedReceiverStream<WatchEvent>,
    cmd_tx: mpsc::Sender<Command>,
}

impl Subscription {
    pub(crate) fn new(
        key: WatchKey,
        connection_id: u64,
        subscriber_id: u64,
        rx: mpsc::UnboundedReceiver<WatchEvent>,
        cmd_tx: mpsc::Sender<Command>,
    ) -> Self {
        Self {
            key,
            connection_id,
            subscriber_id,
            stream: UnboundedReceiverStream::new(rx),
            cmd_tx,
        }
    }

    /// Key of the connection this subscription is attached to.
    pub fn key(&self) -> &WatchKey {
        &self.key
    }

    /// Receive the next event.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.next().await
    }

    /// Detach from the connection.
    pub fn unsubscribe(self) {}
}

impl Stream for Subscription {
    type Item = WatchEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().stream).poll_next(cx)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("connection_id", &self.connection_id)
            .field("subscriber_id", &self.subscriber_id)
            .finish_non_exhaustive()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let unsubscribe = Command::Unsubscribe {
            key: self.key.clone(),
            connection_id: self.connection_id,
            subscriber_id: self.subscriber_id,
        };

        match self.cmd_tx.try_send(unsubscribe) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(key = %self.key, "Watch manager closed while dropping Subscription");
            }
            Err(mpsc::error::TrySendError::Full(unsubscribe)) => {
                let cmd_tx = self.cmd_tx.clone();
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn(async move {
                            if cmd_tx.send(unsubscribe).await.is_err() {
                                debug!("Watch manager closed while sending unsubscribe on drop");
                            }
                        });
                    }
                    Err(_) => {
                        if cmd_tx.blocking_send(unsubscribe).is_err() {
                            debug!("Watch manager closed while blocking_send unsubscribe on drop");
                        }
                    }
                }
            }
        }
    }
}
