//! Line codec for the microcontroller serial links
//!
//! Outbound frames are a single JSON object between a start marker and a
//! line terminator:
//! ```text
//! >{"id":"<short id>","type":<u8>,"data":{...}}\r\n
//! ```
//!
//! Booleans inside `data` travel as `0`/`1` bytes to match the firmware layout.
//! Inbound lines are either acknowledgements (`{"id","status"}`) or periodic
//! sync frames (`{"type","data"}`).

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::MoveDirection;

/// Start-of-frame marker written before every outbound frame
pub const START_MARKER: u8 = b'>';

/// Line terminator
pub const END_MARKER: &[u8] = b"\r\n";

/// Maximum length of a single line before the decoder gives up on it
pub const MAX_LINE_SIZE: usize = 4 * 1024;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Line too large: {0} bytes (max: {MAX_LINE_SIZE})")]
    LineTooLarge(usize),

    #[error("Empty frame")]
    Empty,

    #[error("Unknown {device} frame type: {kind}")]
    UnknownType { device: &'static str, kind: u8 },

    #[error("Invalid value for {field}: {value}")]
    InvalidField { field: &'static str, value: u64 },

    #[error("Unrecognized frame: {0}")]
    Unrecognized(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn flag(enable: bool) -> u8 {
    u8::from(enable)
}

fn direction_code(direction: MoveDirection) -> u8 {
    match direction {
        MoveDirection::Forward => 0,
        MoveDirection::Backward => 1,
    }
}

fn direction_from_code(code: u8) -> Result<MoveDirection, CodecError> {
    match code {
        0 => Ok(MoveDirection::Forward),
        1 => Ok(MoveDirection::Backward),
        other => Err(CodecError::InvalidField {
            field: "direction",
            value: other.into(),
        }),
    }
}

/// Cargo door motor target state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoorDirection {
    Close,
    Open,
}

impl DoorDirection {
    fn code(self) -> u8 {
        match self {
            DoorDirection::Close => 0,
            DoorDirection::Open => 1,
        }
    }

    fn from_code(code: u8) -> Result<Self, CodecError> {
        match code {
            0 => Ok(DoorDirection::Close),
            1 => Ok(DoorDirection::Open),
            other => Err(CodecError::InvalidField {
                field: "state",
                value: other.into(),
            }),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WireFrame<T> {
    id: String,
    #[serde(rename = "type")]
    kind: u8,
    data: T,
}

#[derive(Deserialize)]
struct RawFrame {
    id: String,
    #[serde(rename = "type")]
    kind: u8,
    data: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
struct BatteryWire {
    current_limit: u16,
    enable: u8,
}

#[derive(Serialize, Deserialize)]
struct LiftMotorWire {
    target_position: u16,
    max_output: u16,
    enable: u8,
}

#[derive(Serialize, Deserialize)]
struct DriveMotorWire {
    direction: u8,
    speed: u8,
    enable: u8,
}

#[derive(Serialize, Deserialize)]
struct CargoDoorWire {
    state: u8,
    speed: u8,
    enable: u8,
}

fn write_line(json: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(json.len() + 1 + END_MARKER.len());
    buf.put_u8(START_MARKER);
    buf.extend_from_slice(json);
    buf.extend_from_slice(END_MARKER);
    buf.freeze()
}

/// Strip the optional start marker, surrounding whitespace and terminator
fn frame_body(line: &[u8]) -> &[u8] {
    let mut body = line;
    while let [rest @ .., b'\r' | b'\n' | b' '] = body {
        body = rest;
    }
    while let [b' ', rest @ ..] = body {
        body = rest;
    }
    match body {
        [START_MARKER, rest @ ..] => rest,
        _ => body,
    }
}

/// Data carried by a motion/power controller (PIC) frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PicCommandData {
    BatteryCharge { current_limit: u16, enable: bool },
    BatteryDischarge { current_limit: u16, enable: bool },
    LiftMotor { target_position: u16, speed: u8, enable: bool },
    DriveMotor { direction: MoveDirection, speed: u8, enable: bool },
}

impl PicCommandData {
    pub fn type_code(&self) -> u8 {
        match self {
            PicCommandData::BatteryCharge { .. } => 0,
            PicCommandData::BatteryDischarge { .. } => 1,
            PicCommandData::LiftMotor { .. } => 2,
            PicCommandData::DriveMotor { .. } => 3,
        }
    }
}

/// Outbound frame for the motion/power controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PicCommand {
    pub id: String,
    pub data: PicCommandData,
}

impl PicCommand {
    pub fn new(id: impl Into<String>, data: PicCommandData) -> Self {
        Self { id: id.into(), data }
    }

    /// Serialize to a framed line ready for the serial link
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let kind = self.data.type_code();
        let id = self.id.clone();
        let json = match self.data {
            PicCommandData::BatteryCharge {
                current_limit,
                enable,
            }
            | PicCommandData::BatteryDischarge {
                current_limit,
                enable,
            } => serde_json::to_vec(&WireFrame {
                id,
                kind,
                data: BatteryWire {
                    current_limit,
                    enable: flag(enable),
                },
            })?,
            PicCommandData::LiftMotor {
                target_position,
                speed,
                enable,
            } => serde_json::to_vec(&WireFrame {
                id,
                kind,
                data: LiftMotorWire {
                    target_position,
                    max_output: speed.into(),
                    enable: flag(enable),
                },
            })?,
            PicCommandData::DriveMotor {
                direction,
                speed,
                enable,
            } => serde_json::to_vec(&WireFrame {
                id,
                kind,
                data: DriveMotorWire {
                    direction: direction_code(direction),
                    speed,
                    enable: flag(enable),
                },
            })?,
        };
        Ok(write_line(&json))
    }

    /// Parse a framed line back into a command
    pub fn decode(line: &[u8]) -> Result<Self, CodecError> {
        let body = frame_body(line);
        if body.is_empty() {
            return Err(CodecError::Empty);
        }
        let raw: RawFrame = serde_json::from_slice(body)?;
        let data = match raw.kind {
            0 | 1 => {
                let w: BatteryWire = serde_json::from_value(raw.data)?;
                if raw.kind == 0 {
                    PicCommandData::BatteryCharge {
                        current_limit: w.current_limit,
                        enable: w.enable != 0,
                    }
                } else {
                    PicCommandData::BatteryDischarge {
                        current_limit: w.current_limit,
                        enable: w.enable != 0,
                    }
                }
            }
            2 => {
                let w: LiftMotorWire = serde_json::from_value(raw.data)?;
                let speed = u8::try_from(w.max_output).map_err(|_| CodecError::InvalidField {
                    field: "max_output",
                    value: w.max_output.into(),
                })?;
                PicCommandData::LiftMotor {
                    target_position: w.target_position,
                    speed,
                    enable: w.enable != 0,
                }
            }
            3 => {
                let w: DriveMotorWire = serde_json::from_value(raw.data)?;
                PicCommandData::DriveMotor {
                    direction: direction_from_code(w.direction)?,
                    speed: w.speed,
                    enable: w.enable != 0,
                }
            }
            kind => {
                return Err(CodecError::UnknownType {
                    device: "pic",
                    kind,
                })
            }
        };
        Ok(Self { id: raw.id, data })
    }
}

/// Data carried by a peripheral controller (ESP) frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EspCommandData {
    CargoDoor {
        state: DoorDirection,
        speed: u8,
        enable: bool,
    },
}

impl EspCommandData {
    pub fn type_code(&self) -> u8 {
        match self {
            EspCommandData::CargoDoor { .. } => 0,
        }
    }
}

/// Outbound frame for the peripheral controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EspCommand {
    pub id: String,
    pub data: EspCommandData,
}

impl EspCommand {
    pub fn new(id: impl Into<String>, data: EspCommandData) -> Self {
        Self { id: id.into(), data }
    }

    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let EspCommandData::CargoDoor {
            state,
            speed,
            enable,
        } = self.data;
        let json = serde_json::to_vec(&WireFrame {
            id: self.id.clone(),
            kind: self.data.type_code(),
            data: CargoDoorWire {
                state: state.code(),
                speed,
                enable: flag(enable),
            },
        })?;
        Ok(write_line(&json))
    }

    pub fn decode(line: &[u8]) -> Result<Self, CodecError> {
        let body = frame_body(line);
        if body.is_empty() {
            return Err(CodecError::Empty);
        }
        let raw: RawFrame = serde_json::from_slice(body)?;
        match raw.kind {
            0 => {
                let w: CargoDoorWire = serde_json::from_value(raw.data)?;
                Ok(Self {
                    id: raw.id,
                    data: EspCommandData::CargoDoor {
                        state: DoorDirection::from_code(w.state)?,
                        speed: w.speed,
                        enable: w.enable != 0,
                    },
                })
            }
            kind => Err(CodecError::UnknownType {
                device: "esp",
                kind,
            }),
        }
    }
}

/// Acknowledgement of a previously issued frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    pub id: String,
    pub success: bool,
}

/// Periodic distance readings from the motion controller (cm)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistanceSensorSync {
    pub front_distance: u16,
    pub back_distance: u16,
    pub down_distance: u16,
}

/// Periodic cargo compartment state from the peripheral controller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CargoSync {
    #[serde(deserialize_with = "de_flag")]
    pub door_open: bool,
    #[serde(default)]
    pub qr_code: String,
    pub bottom_distance: u16,
    #[serde(deserialize_with = "de_flag")]
    pub has_item: bool,
}

/// Accept either a JSON boolean or a 0/1 byte
fn de_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Byte(u8),
    }
    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Byte(n) => n != 0,
    })
}

/// A parsed inbound line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Ack(AckFrame),
    DistanceSensor(DistanceSensorSync),
    Cargo(CargoSync),
}

#[derive(Deserialize)]
struct InboundRaw {
    id: Option<String>,
    status: Option<u8>,
    #[serde(rename = "type")]
    kind: Option<u8>,
    data: Option<serde_json::Value>,
}

impl InboundFrame {
    fn parse_ack(raw: &InboundRaw) -> Result<Option<Self>, CodecError> {
        match (&raw.id, raw.status) {
            (Some(id), Some(status)) => {
                let success = match status {
                    0 => false,
                    1 => true,
                    other => {
                        return Err(CodecError::InvalidField {
                            field: "status",
                            value: other.into(),
                        })
                    }
                };
                Ok(Some(InboundFrame::Ack(AckFrame {
                    id: id.clone(),
                    success,
                })))
            }
            _ => Ok(None),
        }
    }

    fn raw(line: &[u8]) -> Result<InboundRaw, CodecError> {
        let body = frame_body(line);
        if body.is_empty() {
            return Err(CodecError::Empty);
        }
        Ok(serde_json::from_slice(body)?)
    }

    /// Parse a line received from the motion/power controller
    pub fn parse_pic(line: &[u8]) -> Result<Self, CodecError> {
        let raw = Self::raw(line)?;
        if let Some(ack) = Self::parse_ack(&raw)? {
            return Ok(ack);
        }
        match (raw.kind, raw.data) {
            (Some(0), Some(data)) => Ok(InboundFrame::DistanceSensor(serde_json::from_value(data)?)),
            (Some(kind), _) => Err(CodecError::UnknownType {
                device: "pic",
                kind,
            }),
            _ => Err(CodecError::Unrecognized(
                String::from_utf8_lossy(frame_body(line)).into_owned(),
            )),
        }
    }

    /// Parse a line received from the peripheral controller
    pub fn parse_esp(line: &[u8]) -> Result<Self, CodecError> {
        let raw = Self::raw(line)?;
        if let Some(ack) = Self::parse_ack(&raw)? {
            return Ok(ack);
        }
        match (raw.kind, raw.data) {
            (Some(0), Some(data)) => Ok(InboundFrame::Cargo(serde_json::from_value(data)?)),
            (Some(kind), _) => Err(CodecError::UnknownType {
                device: "esp",
                kind,
            }),
            _ => Err(CodecError::Unrecognized(
                String::from_utf8_lossy(frame_body(line)).into_owned(),
            )),
        }
    }
}

/// Splits a byte stream into `\n`-terminated lines
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(MAX_LINE_SIZE),
        }
    }

    /// Add data to the decoder buffer
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to take the next complete line, without its terminator
    ///
    /// Call this repeatedly until it returns `Ok(None)` to drain all complete
    /// lines. Blank lines are skipped. An overlong partial line is discarded
    /// and reported once.
    pub fn decode_next(&mut self) -> Result<Option<Bytes>, CodecError> {
        loop {
            let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') else {
                if self.buffer.len() > MAX_LINE_SIZE {
                    let len = self.buffer.len();
                    self.buffer.clear();
                    return Err(CodecError::LineTooLarge(len));
                }
                return Ok(None);
            };

            let mut line = self.buffer.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(pos - 1);
            }
            if line.len() > MAX_LINE_SIZE {
                return Err(CodecError::LineTooLarge(line.len()));
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(line.freeze()));
        }
    }

    /// Get the current buffer length (for debugging)
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }
}
