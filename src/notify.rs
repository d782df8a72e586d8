//! Lossy in-process fan-out of newly captured messages.
//!
//! Live capture publishes a [`MessageEvent`] for every message it stores;
//! interested consumers (the event stream endpoint, mostly) subscribe here.
//! Delivery is best effort on purpose: a slow or absent consumer never slows
//! down or blocks ingestion, and a lagging subscriber simply misses events.
//! The store remains the source of truth — anything missed on this channel is
//! still durably queryable.

use tokio::sync::broadcast;

use crate::models::MessageEvent;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct Notifier {
    sender: broadcast::Sender<MessageEvent>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish one event. Never fails; with no subscribers the event is
    /// dropped on the floor.
    pub fn publish(&self, event: MessageEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MessageEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;

    fn event(ts: &str) -> MessageEvent {
        let message = Message {
            channel_id: "C1".to_string(),
            ts: ts.to_string(),
            user_id: Some("U1".to_string()),
            text: "hello".to_string(),
            thread_ts: None,
            reply_count: 0,
            reactions_json: None,
            attachments_json: None,
            blocks_json: None,
            permalink: None,
            edited: false,
        };
        MessageEvent::from(&message)
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let notifier = Notifier::new();
        notifier.publish(event("1.000001"));
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let notifier = Notifier::new();
        let mut rx = notifier.subscribe();
        notifier.publish(event("1.000001"));
        notifier.publish(event("1.000002"));
        assert_eq!(rx.recv().await.unwrap().ts, "1.000001");
        assert_eq!(rx.recv().await.unwrap().ts, "1.000002");
    }
}
