//! Push fan-out of appended messages to waiting readers.
//!
//! Polling via `ChannelStore::read` stays available; subscribing just removes
//! the poll latency. Every message appended to a channel is delivered in
//! append order to each active subscriber whose filter matches. A subscriber
//! that is dropped or lags out is pruned without affecting the others.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures::Stream;
use tokio::sync::mpsc;

use crate::protocol::{Message, MessageType};

struct SubscriberEntry {
    id: u64,
    filter: Option<MessageType>,
    tx: mpsc::UnboundedSender<Arc<Message>>,
}

/// Fan-out hub, one subscriber list per channel name.
#[derive(Default)]
pub struct SubscriptionBroker {
    subscribers: DashMap<String, Vec<SubscriberEntry>>,
    next_id: AtomicU64,
}

impl SubscriptionBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to new messages on `channel`, optionally filtered by type.
    ///
    /// The returned [`Subscription`] is cancellable: dropping it detaches the
    /// subscriber immediately.
    pub fn subscribe(
        self: &Arc<Self>,
        channel: &str,
        filter: Option<MessageType>,
    ) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.subscribers
            .entry(channel.to_string())
            .or_default()
            .push(SubscriberEntry { id, filter, tx });

        log::debug!("subscriber {id} attached to channel '{channel}'");

        Subscription {
            broker: Arc::clone(self),
            channel: channel.to_string(),
            id,
            rx,
        }
    }

    /// Deliver a newly appended message to matching subscribers.
    ///
    /// Called by the Channel Store inside its serialized append path, so
    /// subscribers observe messages in append order. Closed subscribers are
    /// pruned here.
    pub fn publish(&self, channel: &str, message: &Arc<Message>) {
        let Some(mut entries) = self.subscribers.get_mut(channel) else {
            return;
        };

        entries.retain(|entry| {
            if let Some(filter) = entry.filter {
                if filter != message.message_type {
                    return true;
                }
            }
            entry.tx.send(Arc::clone(message)).is_ok()
        });
    }

    /// Number of active subscribers across all channels.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.iter().map(|e| e.value().len()).sum()
    }

    fn detach(&self, channel: &str, id: u64) {
        if let Some(mut entries) = self.subscribers.get_mut(channel) {
            entries.retain(|e| e.id != id);
        }
    }
}

/// A live subscription to one channel.
///
/// Receive with [`recv`](Self::recv) or consume it as a [`futures::Stream`].
pub struct Subscription {
    broker: Arc<SubscriptionBroker>,
    channel: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<Arc<Message>>,
}

impl Subscription {
    /// Wait for the next matching message. Returns `None` once the
    /// subscription has been detached and drained.
    pub async fn recv(&mut self) -> Option<Arc<Message>> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Arc<Message>> {
        self.rx.try_recv().ok()
    }

    /// Channel this subscription is attached to.
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl Stream for Subscription {
    type Item = Arc<Message>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broker.detach(&self.channel, self.id);
        log::debug!("subscriber {} detached from channel '{}'", self.id, self.channel);
    }
}
