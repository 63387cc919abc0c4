use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for change notifications. Channels are keyed by the
/// affected entity — a provider id for calendar changes, an enrollment id
/// for lifecycle changes.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notifications for a channel. Creates it if needed.
    pub fn subscribe(&self, channel: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(channel)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, channel: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&channel) {
            let _ = sender.send(event.clone());
        }
    }

    /// Remove a channel (e.g. when the entity is deleted).
    #[allow(dead_code)]
    pub fn remove(&self, channel: &Ulid) {
        self.channels.remove(channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let pid = Ulid::new();
        let mut rx = hub.subscribe(pid);

        let event = Event::ProviderRegistered {
            id: pid,
            name: "Coach".into(),
            active: true,
        };
        hub.send(pid, &event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let pid = Ulid::new();
        // No subscriber — should not panic
        hub.send(
            pid,
            &Event::ProviderUpdated {
                id: pid,
                name: "Coach".into(),
                active: false,
            },
        );
    }
}
