//! Async message bus between chat transports and the chat bridge.
//!
//! Transports push [`InboundMessage`]s through a `tokio::sync::mpsc`
//! sender; the bridge publishes [`OutboundMessage`]s, which a dispatch
//! task fans out to the callbacks registered for their channel.
//!
//! Subscribers are stored in a shared `Arc<RwLock>` map so the outbound
//! dispatch loop can run without holding the bus.

pub mod events;

pub use events::{InboundMessage, OutboundMessage};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error};

/// Upper bound for one subscriber callback.
const DISPATCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Callback type for outbound message subscribers.
type OutboundCallback =
    Box<dyn Fn(OutboundMessage) -> futures::future::BoxFuture<'static, ()> + Send + Sync>;

/// Shared subscriber map: can be cloned and read without locking the bus.
pub type SubscriberMap = Arc<RwLock<HashMap<String, Vec<OutboundCallback>>>>;

pub struct MessageBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    subscribers: SubscriberMap,
}

pub struct MessageBusReceivers {
    pub inbound_rx: mpsc::Receiver<InboundMessage>,
    pub outbound_rx: mpsc::Receiver<OutboundMessage>,
}

impl MessageBus {
    /// Create a new message bus with the given channel capacity.
    pub fn new(capacity: usize) -> (Self, MessageBusReceivers) {
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);

        (
            Self {
                inbound_tx,
                outbound_tx,
                subscribers: Arc::new(RwLock::new(HashMap::new())),
            },
            MessageBusReceivers {
                inbound_rx,
                outbound_rx,
            },
        )
    }

    /// Get a cloneable sender for publishing inbound messages.
    pub fn inbound_sender(&self) -> mpsc::Sender<InboundMessage> {
        self.inbound_tx.clone()
    }

    /// Publish an outbound message.
    pub async fn publish_outbound(&self, msg: OutboundMessage) {
        if let Err(e) = self.outbound_tx.send(msg).await {
            error!("Failed to publish outbound message: {}", e);
        }
    }

    /// Get a clone of the subscriber map for use in dispatch or registration.
    pub fn subscribers(&self) -> SubscriberMap {
        Arc::clone(&self.subscribers)
    }

    /// Subscribe to outbound messages for a specific channel.
    ///
    /// Takes `&self`: the subscriber map carries its own `RwLock`, so any
    /// task may register.
    pub async fn subscribe_outbound<F, Fut>(&self, channel: &str, callback: F)
    where
        F: Fn(OutboundMessage) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let boxed: OutboundCallback = Box::new(move |msg| Box::pin(callback(msg)));
        let mut subs = self.subscribers.write().await;
        subs.entry(channel.to_string()).or_default().push(boxed);
    }
}

/// Dispatch outbound messages to subscribers until every sender is gone.
///
/// A free function holding only the shared subscriber map. Run it as a
/// background task via `tokio::spawn`.
pub async fn dispatch_outbound(
    subscribers: SubscriberMap,
    mut outbound_rx: mpsc::Receiver<OutboundMessage>,
) {
    while let Some(msg) = outbound_rx.recv().await {
        let subs = subscribers.read().await;
        match subs.get(msg.channel()) {
            Some(callbacks) => {
                for callback in callbacks {
                    if tokio::time::timeout(DISPATCH_TIMEOUT, callback(msg.clone()))
                        .await
                        .is_err()
                    {
                        error!(channel = msg.channel(), "Outbound dispatch timed out");
                    }
                }
            }
            None => debug!(channel = msg.channel(), "No subscribers for outbound message"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inbound_send_receive() {
        let (bus, mut receivers) = MessageBus::new(16);
        let tx = bus.inbound_sender();

        tx.send(InboundMessage::new("telegram", "1", "7", "hello"))
            .await
            .unwrap();

        let msg = receivers.inbound_rx.recv().await.unwrap();
        assert_eq!(msg.content, "hello");
        assert_eq!(msg.channel, "telegram");
    }

    #[tokio::test]
    async fn test_outbound_dispatch_to_subscriber() {
        let (bus, receivers) = MessageBus::new(16);

        let received = Arc::new(RwLock::new(Vec::<String>::new()));
        let received_clone = Arc::clone(&received);

        bus.subscribe_outbound("test_channel", move |msg| {
            let captured = Arc::clone(&received_clone);
            async move {
                if let OutboundMessage::Reply { content, .. } = msg {
                    captured.write().await.push(content);
                }
            }
        })
        .await;

        let subs = bus.subscribers();
        let dispatch_handle = tokio::spawn(dispatch_outbound(subs, receivers.outbound_rx));

        bus.publish_outbound(OutboundMessage::typing("test_channel", "chat1"))
            .await;
        bus.publish_outbound(OutboundMessage::reply("test_channel", "chat1", "hello subscriber"))
            .await;
        bus.publish_outbound(OutboundMessage::reply("elsewhere", "chat1", "dropped"))
            .await;

        // Dropping the bus closes the outbound channel; dispatch drains and exits.
        drop(bus);
        dispatch_handle.await.unwrap();

        let msgs = received.read().await;
        assert_eq!(*msgs, vec!["hello subscriber".to_string()]);
    }

    #[tokio::test]
    async fn test_subscribe_after_dispatch_started() {
        let (bus, receivers) = MessageBus::new(16);
        let subs = bus.subscribers();

        let dispatch_handle = tokio::spawn(dispatch_outbound(
            Arc::clone(&subs),
            receivers.outbound_rx,
        ));

        let received = Arc::new(RwLock::new(false));
        let received_clone = Arc::clone(&received);
        bus.subscribe_outbound("late_channel", move |_msg| {
            let flag = Arc::clone(&received_clone);
            async move {
                *flag.write().await = true;
            }
        })
        .await;

        bus.publish_outbound(OutboundMessage::reply("late_channel", "c1", "late message"))
            .await;

        drop(bus);
        dispatch_handle.await.unwrap();
        assert!(*received.read().await);
    }
}
