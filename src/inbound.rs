//! Inbound serial frames
//!
//! Turns lines read from either microcontroller into bus events: ACKs are
//! republished on the device's ACK topic, sync frames update robot state.

use bytes::Bytes;
use raybot_shared::InboundFrame;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::eventbus::{Event, EventBus};
use crate::serial::Device;
use crate::state::RobotStateService;

pub struct InboundHandler {
    bus: Arc<EventBus>,
    state: Arc<RobotStateService>,
}

impl InboundHandler {
    pub fn new(bus: Arc<EventBus>, state: Arc<RobotStateService>) -> Self {
        Self { bus, state }
    }

    pub fn handle_line(&self, device: Device, line: &[u8]) {
        let parsed = match device {
            Device::Pic => InboundFrame::parse_pic(line),
            Device::Esp => InboundFrame::parse_esp(line),
        };

        match parsed {
            Ok(InboundFrame::Ack(ack)) => {
                if ack.success {
                    debug!(%device, id = %ack.id, "ACK received");
                } else {
                    warn!(%device, id = %ack.id, "ACK reported an error");
                }
                self.bus.publish(device.ack_topic(), Event::Ack(ack));
            }
            Ok(InboundFrame::DistanceSensor(sync)) => self.state.apply_distance_sensor(sync),
            Ok(InboundFrame::Cargo(sync)) => self.state.apply_cargo(sync),
            Err(e) => {
                warn!(
                    %device,
                    error = %e,
                    line = %String::from_utf8_lossy(line),
                    "failed to parse inbound frame"
                );
            }
        }
    }

    /// Drain lines from one serial client until the channel closes or `token` fires
    pub async fn run(
        self: Arc<Self>,
        device: Device,
        token: CancellationToken,
        mut lines: mpsc::Receiver<Bytes>,
    ) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                line = lines.recv() => match line {
                    Some(line) => self.handle_line(device, &line),
                    None => break,
                },
            }
        }
        info!(%device, "inbound handler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventbus::topics;
    use raybot_shared::AckFrame;
    use std::sync::Mutex;

    fn setup() -> (Arc<EventBus>, Arc<RobotStateService>, InboundHandler) {
        let bus = Arc::new(EventBus::new());
        let state = Arc::new(RobotStateService::new(bus.clone()));
        let handler = InboundHandler::new(bus.clone(), state.clone());
        (bus, state, handler)
    }

    #[test]
    fn test_ack_published_on_device_topic() {
        let (bus, _, handler) = setup();
        let token = CancellationToken::new();
        let acks = Arc::new(Mutex::new(Vec::new()));

        let a = acks.clone();
        bus.subscribe(&token, topics::ESP_CMD_ACK, move |event| {
            a.lock().unwrap().push(event.clone());
        });

        handler.handle_line(Device::Pic, br#"{"id":"pic1","status":1}"#);
        handler.handle_line(Device::Esp, br#"{"id":"esp1","status":0}"#);

        assert_eq!(
            *acks.lock().unwrap(),
            vec![Event::Ack(AckFrame {
                id: "esp1".into(),
                success: false
            })]
        );
    }

    #[test]
    fn test_distance_sync_updates_state() {
        let (_, state, handler) = setup();
        handler.handle_line(
            Device::Pic,
            br#"{"type":0,"data":{"front_distance":10,"back_distance":20,"down_distance":30}}"#,
        );
        assert_eq!(state.distance_sensor().down_distance, 30);
    }

    #[test]
    fn test_garbage_is_ignored() {
        let (_, state, handler) = setup();
        handler.handle_line(Device::Esp, b"not json");
        assert_eq!(state.cargo(), Default::default());
    }

    #[tokio::test]
    async fn test_run_drains_channel() {
        let (_, state, handler) = setup();
        let (tx, rx) = mpsc::channel(4);
        tx.send(Bytes::from_static(
            br#"{"type":0,"data":{"door_open":1,"qr_code":"Q","bottom_distance":5,"has_item":1}}"#,
        ))
        .await
        .unwrap();
        drop(tx);

        Arc::new(handler)
            .run(Device::Esp, CancellationToken::new(), rx)
            .await;
        assert!(state.cargo().has_item);
    }
}
