//! Command model
//!
//! A command is queued with type-specific [`Inputs`] and, once it succeeds,
//! carries [`Outputs`] of the matching variant. Both are closed enums; for
//! persistence they are flattened into a [`StoredPayload`] (type discriminant
//! plus JSON bytes).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::limits;

/// Monotonic command identifier assigned by the repository
pub type CommandId = i64;

/// Every command type the robot understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    StopMovement,
    MoveTo,
    MoveForward,
    MoveBackward,
    CargoOpen,
    CargoClose,
    CargoLift,
    CargoLower,
    CargoCheckQr,
    ScanLocation,
    Wait,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::StopMovement => "STOP_MOVEMENT",
            CommandType::MoveTo => "MOVE_TO",
            CommandType::MoveForward => "MOVE_FORWARD",
            CommandType::MoveBackward => "MOVE_BACKWARD",
            CommandType::CargoOpen => "CARGO_OPEN",
            CommandType::CargoClose => "CARGO_CLOSE",
            CommandType::CargoLift => "CARGO_LIFT",
            CommandType::CargoLower => "CARGO_LOWER",
            CommandType::CargoCheckQr => "CARGO_CHECK_QR",
            CommandType::ScanLocation => "SCAN_LOCATION",
            CommandType::Wait => "WAIT",
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a command
///
/// See [`crate::state_machine`] for the allowed transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Queued,
    Processing,
    Canceling,
    Succeeded,
    Failed,
    Canceled,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Queued => "QUEUED",
            CommandStatus::Processing => "PROCESSING",
            CommandStatus::Canceling => "CANCELING",
            CommandStatus::Succeeded => "SUCCEEDED",
            CommandStatus::Failed => "FAILED",
            CommandStatus::Canceled => "CANCELED",
        }
    }

    /// No further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Succeeded | CommandStatus::Failed | CommandStatus::Canceled
        )
    }

    /// The command currently owns the execution slot
    pub fn is_in_progress(&self) -> bool {
        matches!(self, CommandStatus::Processing | CommandStatus::Canceling)
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "QUEUED" => Ok(CommandStatus::Queued),
            "PROCESSING" => Ok(CommandStatus::Processing),
            "CANCELING" => Ok(CommandStatus::Canceling),
            "SUCCEEDED" => Ok(CommandStatus::Succeeded),
            "FAILED" => Ok(CommandStatus::Failed),
            "CANCELED" => Ok(CommandStatus::Canceled),
            other => Err(ValidationError::new("status", format!("unknown status {other}"))),
        }
    }
}

/// Who asked for the command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandSource {
    App,
    Cloud,
}

impl fmt::Display for CommandSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandSource::App => f.write_str("APP"),
            CommandSource::Cloud => f.write_str("CLOUD"),
        }
    }
}

/// Drive direction, shared by command inputs and the drive motor frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MoveDirection {
    #[default]
    Forward,
    Backward,
}

/// Caller-fixable problem with command inputs
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

fn validate_motor_speed(speed: u8) -> Result<(), ValidationError> {
    if speed > limits::MAX_MOTOR_SPEED {
        return Err(ValidationError::new(
            "motor_speed",
            format!("must be between 0 and {}", limits::MAX_MOTOR_SPEED),
        ));
    }
    Ok(())
}

fn validate_not_blank(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopMovementInputs {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveToInputs {
    pub location: String,
    pub direction: MoveDirection,
    pub motor_speed: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveForwardInputs {
    pub motor_speed: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveBackwardInputs {
    pub motor_speed: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CargoOpenInputs {
    pub motor_speed: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CargoCloseInputs {
    pub motor_speed: u8,
}

/// Raise the cargo platform until the down distance is at most `position`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CargoLiftInputs {
    pub motor_speed: u8,
    pub position: u16,
}

/// Lower the cargo platform until the down distance is at least `position`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CargoLowerInputs {
    pub motor_speed: u8,
    pub position: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CargoCheckQrInputs {
    pub qr_code: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanLocationInputs {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitInputs {
    pub duration_ms: u64,
}

/// Type-specific command parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "inputs", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Inputs {
    StopMovement(StopMovementInputs),
    MoveTo(MoveToInputs),
    MoveForward(MoveForwardInputs),
    MoveBackward(MoveBackwardInputs),
    CargoOpen(CargoOpenInputs),
    CargoClose(CargoCloseInputs),
    CargoLift(CargoLiftInputs),
    CargoLower(CargoLowerInputs),
    CargoCheckQr(CargoCheckQrInputs),
    ScanLocation(ScanLocationInputs),
    Wait(WaitInputs),
}

impl Inputs {
    pub fn command_type(&self) -> CommandType {
        match self {
            Inputs::StopMovement(_) => CommandType::StopMovement,
            Inputs::MoveTo(_) => CommandType::MoveTo,
            Inputs::MoveForward(_) => CommandType::MoveForward,
            Inputs::MoveBackward(_) => CommandType::MoveBackward,
            Inputs::CargoOpen(_) => CommandType::CargoOpen,
            Inputs::CargoClose(_) => CommandType::CargoClose,
            Inputs::CargoLift(_) => CommandType::CargoLift,
            Inputs::CargoLower(_) => CommandType::CargoLower,
            Inputs::CargoCheckQr(_) => CommandType::CargoCheckQr,
            Inputs::ScanLocation(_) => CommandType::ScanLocation,
            Inputs::Wait(_) => CommandType::Wait,
        }
    }

    /// Check the type-specific constraints on the parameters
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Inputs::StopMovement(_) | Inputs::ScanLocation(_) => Ok(()),
            Inputs::MoveTo(i) => {
                validate_not_blank("location", &i.location)?;
                validate_motor_speed(i.motor_speed)
            }
            Inputs::MoveForward(MoveForwardInputs { motor_speed })
            | Inputs::MoveBackward(MoveBackwardInputs { motor_speed })
            | Inputs::CargoOpen(CargoOpenInputs { motor_speed })
            | Inputs::CargoClose(CargoCloseInputs { motor_speed })
            | Inputs::CargoLift(CargoLiftInputs { motor_speed, .. })
            | Inputs::CargoLower(CargoLowerInputs { motor_speed, .. }) => {
                validate_motor_speed(*motor_speed)
            }
            Inputs::CargoCheckQr(i) => validate_not_blank("qr_code", &i.qr_code),
            Inputs::Wait(i) => {
                if i.duration_ms == 0 {
                    return Err(ValidationError::new("duration_ms", "must be greater than 0"));
                }
                Ok(())
            }
        }
    }

    pub fn to_stored(&self) -> Result<StoredPayload, serde_json::Error> {
        let bytes = match self {
            Inputs::StopMovement(i) => serde_json::to_vec(i)?,
            Inputs::MoveTo(i) => serde_json::to_vec(i)?,
            Inputs::MoveForward(i) => serde_json::to_vec(i)?,
            Inputs::MoveBackward(i) => serde_json::to_vec(i)?,
            Inputs::CargoOpen(i) => serde_json::to_vec(i)?,
            Inputs::CargoClose(i) => serde_json::to_vec(i)?,
            Inputs::CargoLift(i) => serde_json::to_vec(i)?,
            Inputs::CargoLower(i) => serde_json::to_vec(i)?,
            Inputs::CargoCheckQr(i) => serde_json::to_vec(i)?,
            Inputs::ScanLocation(i) => serde_json::to_vec(i)?,
            Inputs::Wait(i) => serde_json::to_vec(i)?,
        };
        Ok(StoredPayload {
            kind: self.command_type(),
            bytes,
        })
    }

    pub fn from_stored(payload: &StoredPayload) -> Result<Self, serde_json::Error> {
        let b = payload.bytes.as_slice();
        Ok(match payload.kind {
            CommandType::StopMovement => Inputs::StopMovement(serde_json::from_slice(b)?),
            CommandType::MoveTo => Inputs::MoveTo(serde_json::from_slice(b)?),
            CommandType::MoveForward => Inputs::MoveForward(serde_json::from_slice(b)?),
            CommandType::MoveBackward => Inputs::MoveBackward(serde_json::from_slice(b)?),
            CommandType::CargoOpen => Inputs::CargoOpen(serde_json::from_slice(b)?),
            CommandType::CargoClose => Inputs::CargoClose(serde_json::from_slice(b)?),
            CommandType::CargoLift => Inputs::CargoLift(serde_json::from_slice(b)?),
            CommandType::CargoLower => Inputs::CargoLower(serde_json::from_slice(b)?),
            CommandType::CargoCheckQr => Inputs::CargoCheckQr(serde_json::from_slice(b)?),
            CommandType::ScanLocation => Inputs::ScanLocation(serde_json::from_slice(b)?),
            CommandType::Wait => Inputs::Wait(serde_json::from_slice(b)?),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopMovementOutputs {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveToOutputs {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveForwardOutputs {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveBackwardOutputs {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CargoOpenOutputs {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CargoCloseOutputs {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CargoLiftOutputs {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CargoLowerOutputs {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CargoCheckQrOutputs {}

/// The location reported by the reader during the scan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanLocationOutputs {
    pub location: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitOutputs {}

/// Results of a succeeded command, variant-matched to its [`Inputs`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "outputs", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outputs {
    StopMovement(StopMovementOutputs),
    MoveTo(MoveToOutputs),
    MoveForward(MoveForwardOutputs),
    MoveBackward(MoveBackwardOutputs),
    CargoOpen(CargoOpenOutputs),
    CargoClose(CargoCloseOutputs),
    CargoLift(CargoLiftOutputs),
    CargoLower(CargoLowerOutputs),
    CargoCheckQr(CargoCheckQrOutputs),
    ScanLocation(ScanLocationOutputs),
    Wait(WaitOutputs),
}

impl Outputs {
    pub fn command_type(&self) -> CommandType {
        match self {
            Outputs::StopMovement(_) => CommandType::StopMovement,
            Outputs::MoveTo(_) => CommandType::MoveTo,
            Outputs::MoveForward(_) => CommandType::MoveForward,
            Outputs::MoveBackward(_) => CommandType::MoveBackward,
            Outputs::CargoOpen(_) => CommandType::CargoOpen,
            Outputs::CargoClose(_) => CommandType::CargoClose,
            Outputs::CargoLift(_) => CommandType::CargoLift,
            Outputs::CargoLower(_) => CommandType::CargoLower,
            Outputs::CargoCheckQr(_) => CommandType::CargoCheckQr,
            Outputs::ScanLocation(_) => CommandType::ScanLocation,
            Outputs::Wait(_) => CommandType::Wait,
        }
    }

    pub fn to_stored(&self) -> Result<StoredPayload, serde_json::Error> {
        let bytes = match self {
            Outputs::StopMovement(o) => serde_json::to_vec(o)?,
            Outputs::MoveTo(o) => serde_json::to_vec(o)?,
            Outputs::MoveForward(o) => serde_json::to_vec(o)?,
            Outputs::MoveBackward(o) => serde_json::to_vec(o)?,
            Outputs::CargoOpen(o) => serde_json::to_vec(o)?,
            Outputs::CargoClose(o) => serde_json::to_vec(o)?,
            Outputs::CargoLift(o) => serde_json::to_vec(o)?,
            Outputs::CargoLower(o) => serde_json::to_vec(o)?,
            Outputs::CargoCheckQr(o) => serde_json::to_vec(o)?,
            Outputs::ScanLocation(o) => serde_json::to_vec(o)?,
            Outputs::Wait(o) => serde_json::to_vec(o)?,
        };
        Ok(StoredPayload {
            kind: self.command_type(),
            bytes,
        })
    }

    pub fn from_stored(payload: &StoredPayload) -> Result<Self, serde_json::Error> {
        let b = payload.bytes.as_slice();
        Ok(match payload.kind {
            CommandType::StopMovement => Outputs::StopMovement(serde_json::from_slice(b)?),
            CommandType::MoveTo => Outputs::MoveTo(serde_json::from_slice(b)?),
            CommandType::MoveForward => Outputs::MoveForward(serde_json::from_slice(b)?),
            CommandType::MoveBackward => Outputs::MoveBackward(serde_json::from_slice(b)?),
            CommandType::CargoOpen => Outputs::CargoOpen(serde_json::from_slice(b)?),
            CommandType::CargoClose => Outputs::CargoClose(serde_json::from_slice(b)?),
            CommandType::CargoLift => Outputs::CargoLift(serde_json::from_slice(b)?),
            CommandType::CargoLower => Outputs::CargoLower(serde_json::from_slice(b)?),
            CommandType::CargoCheckQr => Outputs::CargoCheckQr(serde_json::from_slice(b)?),
            CommandType::ScanLocation => Outputs::ScanLocation(serde_json::from_slice(b)?),
            CommandType::Wait => Outputs::Wait(serde_json::from_slice(b)?),
        })
    }
}

/// Persisted form of [`Inputs`] or [`Outputs`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPayload {
    pub kind: CommandType,
    pub bytes: Vec<u8>,
}

/// A queued or executed command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: CommandId,
    pub status: CommandStatus,
    pub source: CommandSource,
    #[serde(flatten)]
    pub inputs: Inputs,
    pub outputs: Option<Outputs>,
    pub error: Option<String>,
    pub request_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Command {
    /// Build a QUEUED command; the repository assigns the ID on insert
    pub fn queued(
        source: CommandSource,
        inputs: Inputs,
        request_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            status: CommandStatus::Queued,
            source,
            inputs,
            outputs: None,
            error: None,
            request_id,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn command_type(&self) -> CommandType {
        self.inputs.command_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_motor_speed_out_of_range_is_rejected() {
        let inputs = Inputs::CargoLift(CargoLiftInputs {
            motor_speed: 101,
            position: 40,
        });
        let err = inputs.validate().unwrap_err();
        assert_eq!(err.field, "motor_speed");

        let inputs = Inputs::CargoLift(CargoLiftInputs {
            motor_speed: 100,
            position: 40,
        });
        assert!(inputs.validate().is_ok());
    }

    #[test]
    fn test_blank_strings_are_rejected() {
        let qr = Inputs::CargoCheckQr(CargoCheckQrInputs {
            qr_code: "  ".into(),
        });
        assert_eq!(qr.validate().unwrap_err().field, "qr_code");

        let move_to = Inputs::MoveTo(MoveToInputs {
            location: String::new(),
            direction: MoveDirection::Forward,
            motor_speed: 50,
        });
        assert_eq!(move_to.validate().unwrap_err().field, "location");
    }

    #[test]
    fn test_wait_requires_positive_duration() {
        let wait = Inputs::Wait(WaitInputs { duration_ms: 0 });
        assert!(wait.validate().is_err());
    }

    #[test]
    fn test_stored_payload_keeps_discriminant() {
        let inputs = Inputs::MoveTo(MoveToInputs {
            location: "dock-3".into(),
            direction: MoveDirection::Backward,
            motor_speed: 80,
        });
        let stored = inputs.to_stored().expect("encode");
        assert_eq!(stored.kind, CommandType::MoveTo);
        assert_eq!(
            std::str::from_utf8(&stored.bytes).unwrap(),
            r#"{"location":"dock-3","direction":"BACKWARD","motorSpeed":80}"#
        );
        assert_eq!(Inputs::from_stored(&stored).expect("decode"), inputs);
    }

    #[test]
    fn test_stored_payload_with_wrong_kind_fails() {
        let stored = StoredPayload {
            kind: CommandType::Wait,
            bytes: br#"{"qrCode":"abc"}"#.to_vec(),
        };
        assert!(Inputs::from_stored(&stored).is_err());
    }

    #[test]
    fn test_inputs_json_is_adjacently_tagged() {
        let inputs = Inputs::CargoCheckQr(CargoCheckQrInputs {
            qr_code: "QR-1".into(),
        });
        let json = serde_json::to_value(&inputs).unwrap();
        assert_eq!(json["type"], "CARGO_CHECK_QR");
        assert_eq!(json["inputs"]["qrCode"], "QR-1");
    }

    #[test]
    fn test_status_parsing_is_case_insensitive() {
        assert_eq!("queued".parse::<CommandStatus>().unwrap(), CommandStatus::Queued);
        assert!("DONE".parse::<CommandStatus>().is_err());
    }
}
