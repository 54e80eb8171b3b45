use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for per-facility change feeds. Clients treat their booking
/// list as a read-through cache; a committed event tells them to refetch.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to events for a facility. Creates the channel if needed.
    pub fn subscribe(&self, facility_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(facility_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, facility_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&facility_id) {
            let _ = sender.send(event.clone());
        }
    }
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}
