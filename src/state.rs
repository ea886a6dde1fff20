//! Live robot state
//!
//! Last known sensor readings and actuator state, fed by inbound sync frames
//! and the location reader. Every update is also published on the bus so
//! closed-loop executors can track it.

use raybot_shared::{CargoSync, DistanceSensorSync, MoveDirection};
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

use crate::eventbus::{topics, Event, EventBus};

/// Last reported cargo door, QR code and bottom sensor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CargoState {
    pub door_open: bool,
    pub qr_code: String,
    pub bottom_distance: u16,
    pub has_item: bool,
}

/// Drive direction and speed last commanded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DriveMotorState {
    pub direction: MoveDirection,
    pub speed: u8,
    pub running: bool,
}

/// Everything the robot last reported about itself
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RobotState {
    pub distance_sensor: DistanceSensorSync,
    pub cargo: CargoState,
    pub drive_motor: DriveMotorState,
    pub location: Option<String>,
}

/// Last-known robot state; every change is published on the bus
pub struct RobotStateService {
    bus: Arc<EventBus>,
    state: RwLock<RobotState>,
}

impl RobotStateService {
    /// Empty state publishing to `bus`
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            state: RwLock::new(RobotState::default()),
        }
    }

    /// Copy of the whole state
    pub fn snapshot(&self) -> RobotState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Latest front, back and down distances
    pub fn distance_sensor(&self) -> DistanceSensorSync {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .distance_sensor
    }

    /// Latest cargo state
    pub fn cargo(&self) -> CargoState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .cargo
            .clone()
    }

    /// Last location tag read, if any
    pub fn location(&self) -> Option<String> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .location
            .clone()
    }

    /// Current drive motor state
    pub fn drive_motor(&self) -> DriveMotorState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .drive_motor
    }

    /// Record a drive motor change
    pub fn set_drive_motor(&self, drive: DriveMotorState) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drive_motor = drive;
    }

    /// Store a distance sync frame and publish it
    pub fn apply_distance_sensor(&self, sync: DistanceSensorSync) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .distance_sensor = sync;
        debug!(
            front = sync.front_distance,
            back = sync.back_distance,
            down = sync.down_distance,
            "distance sensor updated"
        );
        self.bus
            .publish(topics::DISTANCE_SENSOR_UPDATED, Event::DistanceSensorUpdated(sync));
    }

    /// Store a cargo sync frame and publish each of its fields
    pub fn apply_cargo(&self, sync: CargoSync) {
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            state.cargo = CargoState {
                door_open: sync.door_open,
                qr_code: sync.qr_code.clone(),
                bottom_distance: sync.bottom_distance,
                has_item: sync.has_item,
            };
        }

        self.bus.publish(
            topics::CARGO_DOOR_UPDATED,
            Event::CargoDoorUpdated {
                open: sync.door_open,
            },
        );
        self.bus.publish(
            topics::CARGO_QR_CODE_UPDATED,
            Event::CargoQrCodeUpdated {
                qr_code: sync.qr_code.clone(),
            },
        );
        self.bus.publish(
            topics::CARGO_BOTTOM_DISTANCE_UPDATED,
            Event::CargoBottomDistanceUpdated {
                distance: sync.bottom_distance,
            },
        );
        self.bus.publish(topics::CARGO_UPDATED, Event::CargoUpdated(sync));
    }

    /// Called by the location reader whenever a tag is read
    pub fn update_location(&self, location: impl Into<String>) {
        let location = location.into();
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .location = Some(location.clone());
        debug!(%location, "location updated");
        self.bus
            .publish(topics::LOCATION_UPDATED, Event::LocationUpdated { location });
    }
}
