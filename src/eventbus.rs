//! In-process publish/subscribe bus
//!
//! Handlers are invoked synchronously on the publisher's task, in
//! subscription order. They must return quickly and must not block: a slow
//! handler delays the publisher (for inbound frames, the serial read loop).
//! Handlers that need to do real work should forward the event into a
//! channel.
//!
//! A subscription lives until the [`CancellationToken`] it was registered with
//! is cancelled. Dead entries are pruned on the next publish or subscribe.

use raybot_shared::{AckFrame, CargoSync, CommandId, CommandStatus, DistanceSensorSync};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Topic names
pub mod topics {
    pub const PIC_CMD_ACK: &str = "pic:cmd:ack";
    pub const ESP_CMD_ACK: &str = "esp:cmd:ack";
    pub const PIC_SERIAL_CONNECTED: &str = "pic:serial:connected";
    pub const PIC_SERIAL_DISCONNECTED: &str = "pic:serial:disconnected";
    pub const ESP_SERIAL_CONNECTED: &str = "esp:serial:connected";
    pub const ESP_SERIAL_DISCONNECTED: &str = "esp:serial:disconnected";
    pub const DISTANCE_SENSOR_UPDATED: &str = "distance_sensor:updated";
    pub const CARGO_DOOR_UPDATED: &str = "cargo:door:updated";
    pub const CARGO_QR_CODE_UPDATED: &str = "cargo:qr_code:updated";
    pub const CARGO_BOTTOM_DISTANCE_UPDATED: &str = "cargo:bottom_distance:updated";
    pub const CARGO_UPDATED: &str = "cargo:updated";
    pub const LOCATION_UPDATED: &str = "location:updated";
    pub const COMMAND_CREATED: &str = "command:created";
    pub const COMMAND_OUTCOME: &str = "command:outcome";
}

/// Payloads carried on the bus
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Ack(AckFrame),
    SerialConnected,
    SerialDisconnected { error: Option<String> },
    DistanceSensorUpdated(DistanceSensorSync),
    CargoUpdated(CargoSync),
    CargoDoorUpdated { open: bool },
    CargoQrCodeUpdated { qr_code: String },
    CargoBottomDistanceUpdated { distance: u16 },
    LocationUpdated { location: String },
    CommandCreated { id: CommandId },
    CommandOutcome {
        id: CommandId,
        status: CommandStatus,
        error: Option<String>,
    },
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

struct Subscriber {
    id: u64,
    token: CancellationToken,
    handler: Handler,
}

#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    topics: Mutex<HashMap<String, Vec<Subscriber>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to every live subscriber of `topic`
    pub fn publish(&self, topic: &str, event: Event) {
        let handlers: Vec<(u64, Handler)> = {
            let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(subscribers) = topics.get_mut(topic) else {
                trace!(topic, "no subscribers");
                return;
            };
            subscribers.retain(|s| !s.token.is_cancelled());
            subscribers
                .iter()
                .map(|s| (s.id, s.handler.clone()))
                .collect()
        };

        // Lock released: handlers may publish or subscribe themselves
        for (id, handler) in handlers {
            trace!(topic, subscriber = id, "deliver");
            handler(&event);
        }
    }

    /// Register `handler` on `topic` until `token` is cancelled
    pub fn subscribe<F>(&self, token: &CancellationToken, topic: &str, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        if token.is_cancelled() {
            return;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let subscribers = topics.entry(topic.to_string()).or_default();
        subscribers.retain(|s| !s.token.is_cancelled());
        subscribers.push(Subscriber {
            id,
            token: token.clone(),
            handler: Arc::new(handler),
        });
    }

    /// Number of live subscriptions on `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics
            .get(topic)
            .map(|subs| subs.iter().filter(|s| !s.token.is_cancelled()).count())
            .unwrap_or(0)
    }
}
