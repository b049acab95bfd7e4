use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub: every committed event is fanned out to subscribers of each room it touched.
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

    pub fn subscribe(&self, room_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(room_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op when nobody listens on `room_id`.
    pub fn send(&self, room_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&room_id)
            && sender.send(event.clone()).is_err()
        {
            drop(sender);
            // every receiver is gone
            self.channels
                .remove_if(&room_id, |_, s| s.receiver_count() == 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let room_id = Ulid::new();
        let mut rx = hub.subscribe(room_id);

        let event = Event::BedRemoved {
            id: Ulid::new(),
            room_id,
        };
        hub.send(room_id, &event);

        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let room_id = Ulid::new();
        hub.send(
            room_id,
            &Event::BedRemoved {
                id: Ulid::new(),
                room_id,
            },
        );
    }

    #[tokio::test]
    async fn dropped_receivers_release_channel() {
        let hub = NotifyHub::new();
        let room_id = Ulid::new();
        drop(hub.subscribe(room_id));
        hub.send(
            room_id,
            &Event::BedRemoved {
                id: Ulid::new(),
                room_id,
            },
        );
        assert!(hub.channels.get(&room_id).is_none());
    }
}
