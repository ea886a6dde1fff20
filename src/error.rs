//! Error taxonomy
//!
//! Hardware failures stay distinguishable (link down vs. ACK timeout vs.
//! cancellation) so callers can decide whether a failure is retryable.

use raybot_shared::{CodecError, CommandId, CommandStatus, ValidationError};
use thiserror::Error;

use crate::serial::Device;

/// Errors from a serial link
#[derive(Error, Debug)]
pub enum SerialError {
    #[error("{0} serial port is not connected")]
    NotConnected(Device),

    #[error("failed to open serial port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: tokio_serial::Error,
    },

    #[error("write cancelled")]
    Cancelled,

    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from a hardware controller call
#[derive(Error, Debug)]
pub enum HardwareError {
    #[error("{0} serial port is not connected")]
    NotConnected(Device),

    #[error("command ACK timeout: {device} command {id}")]
    AckTimeout { device: Device, id: String },

    #[error("command ACK rejected: {device} command {id}")]
    AckRejected { device: Device, id: String },

    #[error("hardware call cancelled")]
    Cancelled,

    #[error("frame encoding failed: {0}")]
    Codec(#[from] CodecError),

    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HardwareError {
    /// A retry by a higher layer might succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, HardwareError::AckTimeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, HardwareError::Cancelled)
    }
}

impl From<SerialError> for HardwareError {
    fn from(err: SerialError) -> Self {
        match err {
            SerialError::NotConnected(device) => HardwareError::NotConnected(device),
            SerialError::Cancelled => HardwareError::Cancelled,
            SerialError::Io(e) => HardwareError::Io(e),
            SerialError::Open { source, .. } => {
                HardwareError::Io(std::io::Error::new(std::io::ErrorKind::NotConnected, source))
            }
        }
    }
}

/// Coarse classification used by callers to map errors onto responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    State,
    Hardware,
    Cancelled,
    Internal,
}

/// Errors from the command core
#[derive(Error, Debug)]
pub enum CommandError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("command not found: {0}")]
    NotFound(CommandId),

    #[error("no next executable command")]
    NoNextExecutableCommand,

    #[error("no command being processed")]
    NoCommandBeingProcessed,

    #[error("command {0} is in processing and can not be deleted")]
    InProcessingCanNotBeDeleted(CommandId),

    #[error("command with request id {0} already exists")]
    AlreadyExists(String),

    #[error("running command not found")]
    RunningCommandNotFound,

    #[error("running command already exists: {0}")]
    RunningCommandExists(CommandId),

    #[error("command {id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        id: CommandId,
        from: CommandStatus,
        to: CommandStatus,
    },

    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error("command cancelled")]
    Cancelled,

    #[error("stored payload is corrupt: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CommandError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CommandError::Validation(_) => ErrorKind::Validation,
            CommandError::NotFound(_)
            | CommandError::NoNextExecutableCommand
            | CommandError::RunningCommandNotFound => ErrorKind::NotFound,
            CommandError::AlreadyExists(_) | CommandError::RunningCommandExists(_) => {
                ErrorKind::Conflict
            }
            CommandError::NoCommandBeingProcessed
            | CommandError::InProcessingCanNotBeDeleted(_)
            | CommandError::InvalidTransition { .. } => ErrorKind::State,
            CommandError::Hardware(HardwareError::Cancelled) | CommandError::Cancelled => {
                ErrorKind::Cancelled
            }
            CommandError::Hardware(_) => ErrorKind::Hardware,
            CommandError::Payload(_) | CommandError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// The error stems from a cancellation signal rather than a failure
    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_not_connected_stays_distinct() {
        let err: HardwareError = SerialError::NotConnected(Device::Pic).into();
        assert!(matches!(err, HardwareError::NotConnected(Device::Pic)));
        assert!(!err.is_retryable());

        let timeout = HardwareError::AckTimeout {
            device: Device::Esp,
            id: "abc".into(),
        };
        assert!(timeout.is_retryable());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(CommandError::NotFound(1).kind(), ErrorKind::NotFound);
        assert_eq!(
            CommandError::AlreadyExists("req".into()).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            CommandError::InProcessingCanNotBeDeleted(3).kind(),
            ErrorKind::State
        );
        assert!(CommandError::Hardware(HardwareError::Cancelled).is_cancelled());
        assert_eq!(
            CommandError::Hardware(HardwareError::NotConnected(Device::Esp)).kind(),
            ErrorKind::Hardware
        );
    }
}
