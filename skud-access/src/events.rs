//! Live events
//!
//! Fire-and-forget notifications for dashboards. Publishing never blocks the
//! decision path and delivery is best-effort.

use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};

use log::{debug, warn};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::card::{AccessLog, Card};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CardAction {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareIdAction {
    Confirmed,
    Rejected,
    Cleared,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveEvent {
    AccessLog(AccessLog),
    CardUpdate {
        action: CardAction,
        card: Card,
    },
    CloneAlert {
        device_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        card_uid: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        presented_hardware_id: Option<String>,
    },
    /// A new hardware id awaits operator confirmation
    HardwareIdPending {
        device_id: Uuid,
        hardware_id: String,
    },
    HardwareIdChanged {
        device_id: Uuid,
        action: HardwareIdAction,
    },
}

impl LiveEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LiveEvent::AccessLog(_) => "access_log",
            LiveEvent::CardUpdate { .. } => "card_update",
            LiveEvent::CloneAlert { .. } => "clone_alert",
            LiveEvent::HardwareIdPending { .. } => "hardware_id_pending",
            LiveEvent::HardwareIdChanged { .. } => "hardware_id_changed",
        }
    }
}

/// Live-event broadcaster collaborator
pub trait EventSink: Send + Sync {
    fn publish(&self, event: LiveEvent);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEvents;

impl EventSink for NullEvents {
    fn publish(&self, _event: LiveEvent) {}
}

/// Events a subscriber may have queued before new ones are dropped for it
pub const SUBSCRIBER_QUEUE: usize = 256;

struct Subscriber {
    tx: SyncSender<LiveEvent>,
    dropped: u64,
}

/// In-process fan-out over bounded channels
///
/// A subscriber that stops reading loses events once its queue is full; the
/// others are unaffected.
pub struct EventHub {
    capacity: usize,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::with_capacity(SUBSCRIBER_QUEUE)
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> Receiver<LiveEvent> {
        let (tx, rx) = mpsc::sync_channel(self.capacity);
        self.subscribers.lock().push(Subscriber { tx, dropped: 0 });
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl EventSink for EventHub {
    fn publish(&self, event: LiveEvent) {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain_mut(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => {
                if sub.dropped > 0 {
                    debug!("Event subscriber caught up after losing {} events", sub.dropped);
                    sub.dropped = 0;
                }
                true
            }
            Err(TrySendError::Full(_)) => {
                if sub.dropped == 0 {
                    warn!("Event subscriber queue full, dropping {} events", event.name());
                }
                sub.dropped += 1;
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
        let pruned = before - subscribers.len();
        if pruned > 0 {
            debug!("Dropped {} disconnected event subscribers", pruned);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::LogAction;

    #[test]
    fn test_fan_out() {
        let hub = EventHub::new();
        let a = hub.subscribe();
        let b = hub.subscribe();

        let device_id = Uuid::new_v4();
        hub.publish(LiveEvent::HardwareIdChanged { device_id, action: HardwareIdAction::Cleared });

        for rx in [a, b] {
            match rx.try_recv().unwrap() {
                LiveEvent::HardwareIdChanged { device_id: id, action } => {
                    assert_eq!(id, device_id);
                    assert_eq!(action, HardwareIdAction::Cleared);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[test]
    fn test_disconnected_subscribers_dropped() {
        let hub = EventHub::new();
        let kept = hub.subscribe();
        drop(hub.subscribe());
        assert_eq!(hub.subscriber_count(), 2);

        hub.publish(LiveEvent::AccessLog(AccessLog::new(LogAction::Verify, "active", true)));
        assert_eq!(hub.subscriber_count(), 1);
        assert!(kept.try_recv().is_ok());
    }

    #[test]
    fn test_slow_subscriber_is_bounded() {
        let hub = EventHub::with_capacity(4);
        let stalled = hub.subscribe();
        let reader = hub.subscribe();

        let mut seen = 0;
        for i in 0..10 {
            hub.publish(LiveEvent::AccessLog(AccessLog::new(LogAction::Verify, &i.to_string(), true)));
            seen += reader.try_iter().count();
        }
        assert_eq!(seen, 10);
        assert_eq!(hub.subscriber_count(), 2);

        let queued: Vec<LiveEvent> = stalled.try_iter().collect();
        assert_eq!(queued.len(), 4);
        match &queued[0] {
            LiveEvent::AccessLog(entry) => assert_eq!(entry.status, "0"),
            other => panic!("unexpected event {:?}", other),
        }

        // Drained, it receives again
        hub.publish(LiveEvent::AccessLog(AccessLog::new(LogAction::Verify, "late", true)));
        assert_eq!(stalled.try_iter().count(), 1);

        drop(stalled);
        hub.publish(LiveEvent::AccessLog(AccessLog::new(LogAction::Verify, "after", true)));
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[test]
    fn test_wire_shape() {
        let event = LiveEvent::CloneAlert {
            device_id: Uuid::nil(),
            card_uid: None,
            presented_hardware_id: Some("CHIP-B".into()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "clone_alert");
        assert_eq!(json["presented_hardware_id"], "CHIP-B");
        assert!(json.get("card_uid").is_none());
        assert_eq!(event.name(), "clone_alert");
    }
}
