//! Command State Machine
//!
//! Defines the valid command status transitions:
//! ```text
//! QUEUED ──▶ PROCESSING ──▶ SUCCEEDED | FAILED
//!   │            │
//!   │            ▼
//!   │        CANCELING ──▶ CANCELED
//!   └──────────────────────▶ CANCELED
//! ```

use crate::CommandStatus;

/// Check if a transition from one status to another is valid
pub fn is_valid_transition(from: CommandStatus, to: CommandStatus) -> bool {
    use CommandStatus::*;

    matches!(
        (from, to),
        (Queued, Processing)
            | (Queued, Canceled)
            | (Processing, Succeeded)
            | (Processing, Failed)
            | (Processing, Canceling)
            | (Canceling, Canceled)
    )
}
