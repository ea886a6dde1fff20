//! Hardware controller
//!
//! Typed actuator operations on top of the two serial links. Each operation
//! becomes one framed command; in ACK mode the call resolves only once the
//! microcontroller acknowledges that frame's ID.

mod controller;
mod id;

pub use controller::{AckSettings, HardwareController};
pub use id::{IdGenerator, RandomIdGenerator};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::HardwareError;

#[async_trait]
pub trait DriveMotorController: Send + Sync {
    async fn move_forward(&self, token: &CancellationToken, speed: u8) -> Result<(), HardwareError>;

    async fn move_backward(&self, token: &CancellationToken, speed: u8)
        -> Result<(), HardwareError>;

    /// Stop while keeping the last direction, so the robot does not jerk
    async fn stop_drive_motor(&self, token: &CancellationToken) -> Result<(), HardwareError>;
}

#[async_trait]
pub trait LiftMotorController: Send + Sync {
    async fn set_cargo_position(
        &self,
        token: &CancellationToken,
        speed: u8,
        position: u16,
    ) -> Result<(), HardwareError>;

    async fn stop_lift_motor(&self, token: &CancellationToken) -> Result<(), HardwareError>;
}

#[async_trait]
pub trait CargoDoorController: Send + Sync {
    async fn open_cargo_door(&self, token: &CancellationToken, speed: u8)
        -> Result<(), HardwareError>;

    async fn close_cargo_door(&self, token: &CancellationToken, speed: u8)
        -> Result<(), HardwareError>;
}

/// Battery configuration is always sent without waiting for an ACK
#[async_trait]
pub trait BatteryController: Send + Sync {
    async fn config_battery_charge(
        &self,
        token: &CancellationToken,
        current_limit: u16,
        enable: bool,
    ) -> Result<(), HardwareError>;

    async fn config_battery_discharge(
        &self,
        token: &CancellationToken,
        current_limit: u16,
        enable: bool,
    ) -> Result<(), HardwareError>;
}

/// Everything the executors drive
pub trait Controller:
    DriveMotorController + LiftMotorController + CargoDoorController + BatteryController
{
}

impl<T> Controller for T where
    T: DriveMotorController + LiftMotorController + CargoDoorController + BatteryController
{
}
