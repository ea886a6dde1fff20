use async_trait::async_trait;
use bytes::Bytes;
use raybot_shared::{
    DoorDirection, EspCommand, EspCommandData, MoveDirection, PicCommand, PicCommandData,
};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::id::{IdGenerator, RandomIdGenerator};
use super::{BatteryController, CargoDoorController, DriveMotorController, LiftMotorController};
use crate::config::DeviceConfig;
use crate::error::HardwareError;
use crate::eventbus::{Event, EventBus};
use crate::serial::SerialLink;
use crate::state::{DriveMotorState, RobotStateService};

/// Per-link acknowledgement policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckSettings {
    pub enable_ack: bool,
    pub timeout: Duration,
}

impl From<&DeviceConfig> for AckSettings {
    fn from(cfg: &DeviceConfig) -> Self {
        Self {
            enable_ack: cfg.enable_ack,
            timeout: cfg.ack_timeout(),
        }
    }
}

struct Link {
    serial: Arc<dyn SerialLink>,
    ack: AckSettings,
}

pub struct HardwareController {
    bus: Arc<EventBus>,
    state: Arc<RobotStateService>,
    pic: Link,
    esp: Link,
    ids: Arc<dyn IdGenerator>,
}

impl HardwareController {
    pub fn new(
        bus: Arc<EventBus>,
        state: Arc<RobotStateService>,
        pic: Arc<dyn SerialLink>,
        pic_ack: AckSettings,
        esp: Arc<dyn SerialLink>,
        esp_ack: AckSettings,
    ) -> Self {
        Self {
            bus,
            state,
            pic: Link {
                serial: pic,
                ack: pic_ack,
            },
            esp: Link {
                serial: esp,
                ack: esp_ack,
            },
            ids: Arc::new(RandomIdGenerator),
        }
    }

    /// Replace the random correlation IDs, mainly for tests
    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    async fn send_pic(
        &self,
        token: &CancellationToken,
        data: PicCommandData,
        wait_ack: bool,
    ) -> Result<(), HardwareError> {
        let id = self.ids.next_id();
        let frame = PicCommand::new(id.clone(), data).encode()?;
        self.dispatch(&self.pic, token, id, frame, wait_ack).await
    }

    async fn send_esp(
        &self,
        token: &CancellationToken,
        data: EspCommandData,
    ) -> Result<(), HardwareError> {
        let id = self.ids.next_id();
        let frame = EspCommand::new(id.clone(), data).encode()?;
        self.dispatch(&self.esp, token, id, frame, true).await
    }

    /// Write `frame` and, in ACK mode, wait for the matching acknowledgement
    ///
    /// The ACK listener is bound to a child of `token` that is cancelled when
    /// this function returns, whatever the outcome.
    async fn dispatch(
        &self,
        link: &Link,
        token: &CancellationToken,
        id: String,
        frame: Bytes,
        wait_ack: bool,
    ) -> Result<(), HardwareError> {
        let device = link.serial.device();

        if !(wait_ack && link.ack.enable_ack) {
            link.serial.write(token, &frame).await?;
            debug!(%device, %id, "command sent without ACK");
            return Ok(());
        }

        let listener = token.child_token();
        let _unsubscribe = listener.clone().drop_guard();
        let (tx, rx) = oneshot::channel::<bool>();
        let tx = Mutex::new(Some(tx));
        let expected = id.clone();
        self.bus.subscribe(&listener, device.ack_topic(), move |event| {
            let Event::Ack(ack) = event else {
                warn!(%device, ?event, "unexpected event on ACK topic");
                return;
            };
            if ack.id != expected {
                return;
            }
            if let Some(tx) = tx.lock().unwrap_or_else(PoisonError::into_inner).take() {
                let _ = tx.send(ack.success);
            }
        });
        debug!(%device, %id, "start tracking command ACK");

        link.serial.write(token, &frame).await?;

        tokio::select! {
            result = rx => match result {
                Ok(true) => {
                    debug!(%device, %id, "command ACK received");
                    Ok(())
                }
                Ok(false) => {
                    error!(%device, %id, "command ACK failed");
                    Err(HardwareError::AckRejected { device, id })
                }
                Err(_) => Err(HardwareError::Cancelled),
            },
            _ = tokio::time::sleep(link.ack.timeout) => {
                error!(%device, %id, timeout_ms = link.ack.timeout.as_millis() as u64, "command ACK timeout");
                Err(HardwareError::AckTimeout { device, id })
            }
            _ = token.cancelled() => Err(HardwareError::Cancelled),
        }
    }

    async fn drive(
        &self,
        token: &CancellationToken,
        direction: MoveDirection,
        speed: u8,
    ) -> Result<(), HardwareError> {
        self.send_pic(
            token,
            PicCommandData::DriveMotor {
                direction,
                speed,
                enable: true,
            },
            true,
        )
        .await?;
        self.state.set_drive_motor(DriveMotorState {
            direction,
            speed,
            running: true,
        });
        Ok(())
    }
}

#[async_trait]
impl DriveMotorController for HardwareController {
    async fn move_forward(&self, token: &CancellationToken, speed: u8) -> Result<(), HardwareError> {
        self.drive(token, MoveDirection::Forward, speed).await
    }

    async fn move_backward(&self, token: &CancellationToken, speed: u8) -> Result<(), HardwareError> {
        self.drive(token, MoveDirection::Backward, speed).await
    }

    async fn stop_drive_motor(&self, token: &CancellationToken) -> Result<(), HardwareError> {
        let direction = self.state.drive_motor().direction;
        self.send_pic(
            token,
            PicCommandData::DriveMotor {
                direction,
                speed: 0,
                enable: false,
            },
            true,
        )
        .await?;
        self.state.set_drive_motor(DriveMotorState {
            direction,
            speed: 0,
            running: false,
        });
        Ok(())
    }
}

#[async_trait]
impl LiftMotorController for HardwareController {
    async fn set_cargo_position(
        &self,
        token: &CancellationToken,
        speed: u8,
        position: u16,
    ) -> Result<(), HardwareError> {
        self.send_pic(
            token,
            PicCommandData::LiftMotor {
                target_position: position,
                speed,
                enable: true,
            },
            true,
        )
        .await
    }

    async fn stop_lift_motor(&self, token: &CancellationToken) -> Result<(), HardwareError> {
        self.send_pic(
            token,
            PicCommandData::LiftMotor {
                target_position: 0,
                speed: 0,
                enable: false,
            },
            true,
        )
        .await
    }
}

#[async_trait]
impl CargoDoorController for HardwareController {
    async fn open_cargo_door(&self, token: &CancellationToken, speed: u8) -> Result<(), HardwareError> {
        self.send_esp(
            token,
            EspCommandData::CargoDoor {
                state: DoorDirection::Open,
                speed,
                enable: true,
            },
        )
        .await
    }

    async fn close_cargo_door(&self, token: &CancellationToken, speed: u8) -> Result<(), HardwareError> {
        self.send_esp(
            token,
            EspCommandData::CargoDoor {
                state: DoorDirection::Close,
                speed,
                enable: true,
            },
        )
        .await
    }
}

#[async_trait]
impl BatteryController for HardwareController {
    async fn config_battery_charge(
        &self,
        token: &CancellationToken,
        current_limit: u16,
        enable: bool,
    ) -> Result<(), HardwareError> {
        self.send_pic(
            token,
            PicCommandData::BatteryCharge {
                current_limit,
                enable,
            },
            false,
        )
        .await
    }

    async fn config_battery_discharge(
        &self,
        token: &CancellationToken,
        current_limit: u16,
        enable: bool,
    ) -> Result<(), HardwareError> {
        self.send_pic(
            token,
            PicCommandData::BatteryDischarge {
                current_limit,
                enable,
            },
            false,
        )
        .await
    }
}
