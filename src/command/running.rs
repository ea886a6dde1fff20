//! Running-command registry
//!
//! Single slot holding the command currently executing together with the
//! token its executor observes. Not persisted: after a restart the slot is
//! empty and stale rows are recovered by the repository.

use raybot_shared::{Command, CommandId};
use std::sync::{Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

use crate::error::CommandError;

/// A PROCESSING command and its cancellation handle
#[derive(Debug, Clone)]
pub struct CancelableCommand {
    command: Command,
    token: CancellationToken,
}

impl CancelableCommand {
    /// Pair `command` with a fresh token
    pub fn new(command: Command) -> Self {
        Self {
            command,
            token: CancellationToken::new(),
        }
    }

    /// ID of the wrapped command
    pub fn id(&self) -> CommandId {
        self.command.id
    }

    /// The command as last stored
    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Token the executor watches
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Signal the executor to stop
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

/// Single slot holding the command being executed
#[derive(Debug, Default)]
pub struct RunningCommandRegistry {
    slot: Mutex<Option<CancelableCommand>>,
}

impl RunningCommandRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// The running command, or `RunningCommandNotFound`
    pub fn get(&self) -> Result<CancelableCommand, CommandError> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(CommandError::RunningCommandNotFound)
    }

    /// Occupy the slot; fails if a command is already running
    pub fn add(&self, command: CancelableCommand) -> Result<(), CommandError> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = slot.as_ref() {
            return Err(CommandError::RunningCommandExists(existing.id()));
        }
        *slot = Some(command);
        Ok(())
    }

    /// Replace the stored command, keeping its token
    pub fn update(&self, command: Command) -> Result<(), CommandError> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_mut() {
            Some(running) if running.id() == command.id => {
                running.command = command;
                Ok(())
            }
            _ => Err(CommandError::RunningCommandNotFound),
        }
    }

    /// Clear the slot if it still holds `id`
    pub fn remove(&self, id: CommandId) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|c| c.id() == id) {
            *slot = None;
        }
    }

    /// Whether no command is running
    pub fn is_empty(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use raybot_shared::command::WaitInputs;
    use raybot_shared::{CommandSource, CommandStatus, Inputs};

    fn command(id: CommandId) -> Command {
        let mut cmd = Command::queued(
            CommandSource::Cloud,
            Inputs::Wait(WaitInputs { duration_ms: 10 }),
            None,
            Utc::now(),
        );
        cmd.id = id;
        cmd
    }

    #[test]
    fn test_single_slot() {
        let registry = RunningCommandRegistry::new();
        assert!(matches!(
            registry.get(),
            Err(CommandError::RunningCommandNotFound)
        ));

        registry.add(CancelableCommand::new(command(1))).unwrap();
        assert!(matches!(
            registry.add(CancelableCommand::new(command(2))),
            Err(CommandError::RunningCommandExists(1))
        ));

        registry.remove(2);
        assert!(!registry.is_empty());
        registry.remove(1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_cancel_is_visible_through_get() {
        let registry = RunningCommandRegistry::new();
        registry.add(CancelableCommand::new(command(1))).unwrap();

        registry.get().unwrap().cancel();
        assert!(registry.get().unwrap().token().is_cancelled());
    }

    #[test]
    fn test_update_keeps_token() {
        let registry = RunningCommandRegistry::new();
        let running = CancelableCommand::new(command(1));
        let token = running.token().clone();
        registry.add(running).unwrap();

        let mut changed = command(1);
        changed.status = CommandStatus::Canceling;
        registry.update(changed).unwrap();
        token.cancel();

        let current = registry.get().unwrap();
        assert_eq!(current.command().status, CommandStatus::Canceling);
        assert!(current.token().is_cancelled());
        assert!(registry.update(command(9)).is_err());
    }
}
