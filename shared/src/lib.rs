//! Raybot Shared Types
//!
//! This crate provides the command model and the serial wire codec shared by
//! the supervisor and its test tooling.

pub mod codec;
pub mod command;
pub mod state_machine;

use chrono::{DateTime, Utc};

pub use codec::{
    AckFrame, CargoSync, CodecError, DistanceSensorSync, DoorDirection, EspCommand,
    EspCommandData, FrameDecoder, InboundFrame, PicCommand, PicCommandData,
};
pub use command::{
    Command, CommandId, CommandSource, CommandStatus, CommandType, Inputs, MoveDirection,
    Outputs, StoredPayload, ValidationError,
};

/// Current wall-clock time, used for every command timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Tuning parameters for hardware and command execution
pub mod limits {
    /// Default ACK timeout for both microcontrollers in milliseconds
    pub const DEFAULT_COMMAND_ACK_TIMEOUT_MS: u64 = 1000;

    /// Tolerance band applied to lift/lower target positions
    pub const POSITION_TOLERANCE_PERCENT: u16 = 10;

    /// Maximum motor speed accepted in command inputs
    pub const MAX_MOTOR_SPEED: u8 = 100;

    /// Maximum length of an idempotency request ID
    pub const MAX_REQUEST_ID_LEN: usize = 64;

    /// Default obstacle enter distance (cm)
    pub const DEFAULT_OBSTACLE_ENTER_DISTANCE: u16 = 10;

    /// Default obstacle exit distance (cm)
    pub const DEFAULT_OBSTACLE_EXIT_DISTANCE: u16 = 20;
}
