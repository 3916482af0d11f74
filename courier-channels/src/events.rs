//! Listener registration and dispatch shared by all adapters.
//!
//! Listeners are invoked in registration order. A failing listener is logged
//! and never aborts the remaining listeners; dispatch runs on a spawned task
//! so a slow listener cannot stall the adapter's inbound loop.

use futures_util::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::types::{ConnectionStatus, NormalizedMessage};

pub type MessageListener =
    Arc<dyn Fn(NormalizedMessage) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub type ConnectionListener =
    Arc<dyn Fn(ConnectionStatus) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct ListenerSet {
    message: Arc<RwLock<Vec<MessageListener>>>,
    connection: Arc<RwLock<Vec<ConnectionListener>>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_message_listener(&self, listener: MessageListener) {
        self.message.write().await.push(listener);
    }

    pub async fn add_connection_listener(&self, listener: ConnectionListener) {
        self.connection.write().await.push(listener);
    }

    /// Fire-and-forget dispatch used from inbound loops.
    pub fn dispatch_message(&self, message: NormalizedMessage) {
        let this = self.clone();
        tokio::spawn(async move {
            this.notify_message(message).await;
        });
    }

    pub fn dispatch_connection_update(&self, status: ConnectionStatus) {
        let this = self.clone();
        tokio::spawn(async move {
            this.notify_connection_update(status).await;
        });
    }

    pub async fn notify_message(&self, message: NormalizedMessage) {
        let listeners = self.message.read().await.clone();
        for listener in listeners {
            if let Err(error) = (listener)(message.clone()).await {
                tracing::warn!(
                    %error,
                    message_id = %message.id,
                    channel = %message.channel,
                    "message listener failed"
                );
            }
        }
    }

    pub async fn notify_connection_update(&self, status: ConnectionStatus) {
        let listeners = self.connection.read().await.clone();
        for listener in listeners {
            if let Err(error) = (listener)(status).await {
                tracing::warn!(%error, ?status, "connection listener failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ListenerSet, MessageListener};
    use crate::types::{ChannelKind, MessageId, NormalizedMessage, RecipientId};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    fn sample_message() -> NormalizedMessage {
        NormalizedMessage {
            id: MessageId::new("m1"),
            channel: ChannelKind::WebChat,
            from: RecipientId::new("visitor"),
            to: RecipientId::new("agent"),
            body: "hi".to_string(),
            timestamp_millis: 0,
            from_me: false,
            media_type: None,
            media_url: None,
            caption: None,
            delivery_ack: None,
            is_group: false,
            participant_id: None,
        }
    }

    #[tokio::test]
    async fn listeners_run_in_registration_order() {
        let set = ListenerSet::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for index in 0..3usize {
            let order = order.clone();
            let listener: MessageListener = Arc::new(move |_message| {
                let order = order.clone();
                Box::pin(async move {
                    order.lock().await.push(index);
                    Ok(())
                })
            });
            set.add_message_listener(listener).await;
        }

        set.notify_message(sample_message()).await;
        assert_eq!(*order.lock().await, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn failing_listener_does_not_abort_the_rest() {
        let set = ListenerSet::new();
        let delivered = Arc::new(AtomicUsize::new(0));

        let failing: MessageListener =
            Arc::new(|_message| Box::pin(async { Err(anyhow::anyhow!("listener exploded")) }));
        set.add_message_listener(failing).await;

        let counting = delivered.clone();
        let listener: MessageListener = Arc::new(move |_message| {
            let counting = counting.clone();
            Box::pin(async move {
                counting.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        set.add_message_listener(listener).await;

        set.notify_message(sample_message()).await;
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }
}
