//! Command service
//!
//! Owns the command lifecycle: creation, single-flight execution,
//! cancellation and pruning. Execution is synchronous inside
//! [`CommandService::run_next_executable_command`], which is what keeps at
//! most one command in PROCESSING or CANCELING.

use anyhow::anyhow;
use futures::FutureExt;
use raybot_shared::limits::MAX_REQUEST_ID_LEN;
use raybot_shared::{
    now, Command, CommandId, CommandSource, CommandStatus, Inputs, ValidationError,
};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::executor::CommandExecutor;
use super::processing_lock::ProcessingLock;
use super::repository::{CommandRepository, ListCommandsParams, Page, UpdateCommandParams};
use super::running::{CancelableCommand, RunningCommandRegistry};
use crate::config::ConfigService;
use crate::error::CommandError;
use crate::eventbus::{topics, Event, EventBus};

const MAX_PAGE_SIZE: u32 = 100;

/// Command lifecycle operations shared by the jobs and the outer surfaces
pub struct CommandService {
    bus: Arc<EventBus>,
    config: Arc<ConfigService>,
    repository: Arc<dyn CommandRepository>,
    running: Arc<RunningCommandRegistry>,
    processing_lock: Arc<ProcessingLock>,
    executor: Arc<dyn CommandExecutor>,
    /// Serializes claim + execute across concurrent callers
    execution: Mutex<()>,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run an executor future, turning a panic into an internal error
async fn guarded<F, T>(fut: F) -> Result<T, CommandError>
where
    F: Future<Output = Result<T, CommandError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(CommandError::Internal(anyhow!(
            "executor panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

impl CommandService {
    /// Wire the service to its collaborators
    pub fn new(
        bus: Arc<EventBus>,
        config: Arc<ConfigService>,
        repository: Arc<dyn CommandRepository>,
        running: Arc<RunningCommandRegistry>,
        processing_lock: Arc<ProcessingLock>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            bus,
            config,
            repository,
            running,
            processing_lock,
            executor,
            execution: Mutex::new(()),
        }
    }

    /// Validate and queue a command, then announce it on the bus
    pub async fn create_command(
        &self,
        source: CommandSource,
        inputs: Inputs,
        request_id: Option<String>,
    ) -> Result<Command, CommandError> {
        if let Some(request_id) = &request_id {
            if request_id.len() > MAX_REQUEST_ID_LEN {
                return Err(ValidationError::new(
                    "request_id",
                    format!("must be at most {MAX_REQUEST_ID_LEN} characters"),
                )
                .into());
            }
        }
        inputs.validate()?;

        let command = self
            .repository
            .create_command(Command::queued(source, inputs, request_id, now()))
            .await?;
        info!(
            id = command.id,
            command_type = %command.command_type(),
            source = ?command.source,
            "command created"
        );
        self.bus
            .publish(topics::COMMAND_CREATED, Event::CommandCreated { id: command.id });
        Ok(command)
    }

    /// Look up one command
    pub async fn get_command_by_id(&self, id: CommandId) -> Result<Command, CommandError> {
        self.repository.get_command_by_id(id).await
    }

    /// The command in PROCESSING or CANCELING, if any
    pub async fn get_current_processing_command(&self) -> Result<Command, CommandError> {
        self.repository.get_current_processing_command().await
    }

    /// Page through commands; `page` is 1-based and `page_size` at most 100
    pub async fn list_commands(
        &self,
        params: &ListCommandsParams,
    ) -> Result<Page<Command>, CommandError> {
        if params.page == 0 {
            return Err(ValidationError::new("page", "must be at least 1").into());
        }
        if params.page_size == 0 || params.page_size > MAX_PAGE_SIZE {
            return Err(ValidationError::new(
                "page_size",
                format!("must be between 1 and {MAX_PAGE_SIZE}"),
            )
            .into());
        }
        self.repository.list_commands(params).await
    }

    /// Resolve once no cancel-all holds the processing lock
    pub async fn wait_until_unlocked(&self, token: &CancellationToken) -> Result<(), CommandError> {
        self.processing_lock.wait_until_unlocked(token).await
    }

    /// Claim the oldest QUEUED command and execute it to a terminal state.
    ///
    /// A no-op while the processing lock is held or another call is already
    /// executing. The lock is kept from the claim until the command is
    /// registered as running. Returns `NoNextExecutableCommand` when the queue is empty.
    pub async fn run_next_executable_command(&self) -> Result<(), CommandError> {
        let Ok(_execution) = self.execution.try_lock() else {
            debug!("a command is already executing");
            return Ok(());
        };
        // Held until the claimed command is registered, so a cancel-all
        // waits for it instead of missing it
        let Some(hold) = self.processing_lock.try_hold() else {
            debug!("processing lock held, skipping");
            return Ok(());
        };

        let command = self.repository.claim_next_executable_command(now()).await?;
        let running = CancelableCommand::new(command.clone());
        let token = running.token().clone();
        if let Err(e) = self.running.add(running) {
            error!(id = command.id, error = %e, "failed to register running command");
            self.record_failure(&command, &e).await?;
            return Err(e);
        }
        drop(hold);

        info!(
            id = command.id,
            command_type = %command.command_type(),
            "executing command"
        );
        let outcome = guarded(self.executor.execute(&token, &command.inputs)).await;

        let finished = match outcome {
            Ok(outputs) => {
                let params = UpdateCommandParams::new(command.id, now())
                    .status(CommandStatus::Succeeded)
                    .outputs(outputs)
                    .completed_at(now());
                match self.repository.update_command(params).await {
                    Err(CommandError::InvalidTransition {
                        from: CommandStatus::Canceling,
                        ..
                    }) => self.finish_cancelled(&command).await,
                    other => other,
                }
            }
            Err(e) if e.is_cancelled() || token.is_cancelled() => {
                debug!(id = command.id, error = %e, "executor stopped by cancellation");
                self.finish_cancelled(&command).await
            }
            Err(e) => {
                warn!(id = command.id, error = %e, "command failed");
                self.record_failure(&command, &e).await
            }
        };

        self.running.remove(command.id);
        let finished = finished?;
        info!(id = finished.id, status = %finished.status, "command finished");
        self.publish_outcome(&finished);
        Ok(())
    }

    async fn record_failure(
        &self,
        command: &Command,
        err: &CommandError,
    ) -> Result<Command, CommandError> {
        let params = UpdateCommandParams::new(command.id, now())
            .status(CommandStatus::Failed)
            .error(err.to_string())
            .completed_at(now());
        match self.repository.update_command(params).await {
            Err(CommandError::InvalidTransition {
                from: CommandStatus::Canceling,
                ..
            }) => self.finish_cancelled(command).await,
            other => other,
        }
    }

    /// Run the executor's cancel hook, then settle the command as CANCELED
    async fn finish_cancelled(&self, command: &Command) -> Result<Command, CommandError> {
        let cleanup = CancellationToken::new();
        if let Err(e) = guarded(self.executor.on_cancel(&cleanup, &command.inputs)).await {
            error!(id = command.id, error = %e, "cancel hook failed");
        }

        let current = self.repository.get_command_by_id(command.id).await?;
        if current.status == CommandStatus::Processing {
            self.repository
                .update_command(
                    UpdateCommandParams::new(command.id, now()).status(CommandStatus::Canceling),
                )
                .await?;
        }
        self.repository
            .update_command(
                UpdateCommandParams::new(command.id, now())
                    .status(CommandStatus::Canceled)
                    .completed_at(now()),
            )
            .await
    }

    /// Signal the running command to stop; does not wait for it to finish
    pub async fn cancel_current_processing_command(&self) -> Result<(), CommandError> {
        let running = self
            .running
            .get()
            .map_err(|_| CommandError::NoCommandBeingProcessed)?;

        if running.command().status != CommandStatus::Canceling {
            let updated = self
                .repository
                .update_command(
                    UpdateCommandParams::new(running.id(), now()).status(CommandStatus::Canceling),
                )
                .await
                .map_err(|e| match e {
                    CommandError::InvalidTransition { .. } | CommandError::NotFound(_) => {
                        CommandError::NoCommandBeingProcessed
                    }
                    other => other,
                })?;
            if self.running.update(updated).is_err() {
                debug!(id = running.id(), "command finished while canceling");
            }
        }

        running.cancel();
        info!(id = running.id(), "cancel requested");
        Ok(())
    }

    /// Cancel queued and running commands that came from the cloud
    pub async fn cancel_active_cloud_commands(&self) -> Result<(), CommandError> {
        let cancelled = self
            .repository
            .cancel_queued_commands(Some(CommandSource::Cloud), now())
            .await?;
        self.publish_cancelled(&cancelled);

        if let Ok(running) = self.running.get() {
            if running.command().source == CommandSource::Cloud {
                self.cancel_ignoring_idle().await?;
            }
        }
        info!(queued = cancelled.len(), "cloud commands cancelled");
        Ok(())
    }

    /// Cancel the running command and everything still queued
    pub async fn cancel_all_running_commands(&self) -> Result<(), CommandError> {
        self.processing_lock
            .with_lock(async {
                self.cancel_ignoring_idle().await?;
                let cancelled = self.repository.cancel_queued_commands(None, now()).await?;
                self.publish_cancelled(&cancelled);
                info!(queued = cancelled.len(), "all commands cancelled");
                Ok::<(), CommandError>(())
            })
            .await
    }

    async fn cancel_ignoring_idle(&self) -> Result<(), CommandError> {
        match self.cancel_current_processing_command().await {
            Ok(()) | Err(CommandError::NoCommandBeingProcessed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Delete a command that is not in progress
    pub async fn delete_command_by_id(&self, id: CommandId) -> Result<(), CommandError> {
        self.repository.delete_command_by_id(id).await?;
        info!(id, "command deleted");
        Ok(())
    }

    /// Delete finished commands older than the configured threshold
    pub async fn delete_old_commands(&self) -> Result<u64, CommandError> {
        let threshold = self.config.config().cron.delete_old_command.threshold();
        let threshold = chrono::Duration::from_std(threshold)
            .map_err(|e| anyhow!("invalid delete threshold: {e}"))?;
        let deleted = self.repository.delete_old_commands(now() - threshold).await?;
        if deleted > 0 {
            info!(deleted, "old commands deleted");
        }
        Ok(deleted)
    }

    /// Settle commands left in flight by a previous run; the registry is
    /// empty after a restart so none of them can still be executing
    pub async fn recover_pending_commands(&self) -> Result<Vec<CommandId>, CommandError> {
        let cancelled = self.repository.cancel_pending_commands(now()).await?;
        if !cancelled.is_empty() {
            warn!(count = cancelled.len(), "cancelled commands left over from last run");
        }
        self.publish_cancelled(&cancelled);
        Ok(cancelled)
    }

    fn publish_cancelled(&self, ids: &[CommandId]) {
        for id in ids {
            self.bus.publish(
                topics::COMMAND_OUTCOME,
                Event::CommandOutcome {
                    id: *id,
                    status: CommandStatus::Canceled,
                    error: None,
                },
            );
        }
    }

    fn publish_outcome(&self, command: &Command) {
        self.bus.publish(
            topics::COMMAND_OUTCOME,
            Event::CommandOutcome {
                id: command.id,
                status: command.status,
                error: command.error.clone(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::executor::testing::{settle, Harness};
    use crate::command::executor::ExecutorRouter;
    use crate::command::repository::testing::GatedRepository;
    use crate::command::repository::InMemoryCommandRepository;
    use crate::hardware::fake::Call;
    use async_trait::async_trait;
    use raybot_shared::command::{CargoLiftInputs, StopMovementInputs, WaitInputs};
    use raybot_shared::Outputs;
    use std::sync::Mutex as StdMutex;

    struct Setup {
        harness: Harness,
        repository: Arc<InMemoryCommandRepository>,
        running: Arc<RunningCommandRegistry>,
        lock: Arc<ProcessingLock>,
        service: Arc<CommandService>,
    }

    fn setup_with(executor: Option<Arc<dyn CommandExecutor>>) -> Setup {
        let harness = Harness::new();
        let repository = Arc::new(InMemoryCommandRepository::new());
        let running = Arc::new(RunningCommandRegistry::new());
        let lock = Arc::new(ProcessingLock::new());
        let executor =
            executor.unwrap_or_else(|| Arc::new(ExecutorRouter::new(harness.deps())));
        let service = Arc::new(CommandService::new(
            harness.bus.clone(),
            harness.config.clone(),
            repository.clone(),
            running.clone(),
            lock.clone(),
            executor,
        ));
        Setup {
            harness,
            repository,
            running,
            lock,
            service,
        }
    }

    fn setup() -> Setup {
        setup_with(None)
    }

    fn wait(ms: u64) -> Inputs {
        Inputs::Wait(WaitInputs { duration_ms: ms })
    }

    fn outcomes(bus: &EventBus) -> Arc<StdMutex<Vec<(CommandId, CommandStatus)>>> {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let s = seen.clone();
        // Dropping the token does not cancel it
        let token = CancellationToken::new();
        bus.subscribe(&token, topics::COMMAND_OUTCOME, move |event| {
            if let Event::CommandOutcome { id, status, .. } = event {
                s.lock().unwrap().push((*id, *status));
            }
        });
        seen
    }

    async fn status(s: &Setup, id: CommandId) -> CommandStatus {
        s.service.get_command_by_id(id).await.unwrap().status
    }

    #[tokio::test]
    async fn test_create_validates_and_publishes() {
        let s = setup();
        let created = Arc::new(StdMutex::new(Vec::new()));
        let c = created.clone();
        let token = CancellationToken::new();
        s.harness
            .bus
            .subscribe(&token, topics::COMMAND_CREATED, move |event| {
                c.lock().unwrap().push(event.clone());
            });

        let cmd = s
            .service
            .create_command(CommandSource::App, wait(10), None)
            .await
            .unwrap();
        assert_eq!(cmd.status, CommandStatus::Queued);
        assert_eq!(
            *created.lock().unwrap(),
            vec![Event::CommandCreated { id: cmd.id }]
        );

        let err = s
            .service
            .create_command(CommandSource::App, wait(0), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Validation(_)));

        let err = s
            .service
            .create_command(CommandSource::App, wait(10), Some("x".repeat(65)))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Validation(e) if e.field == "request_id"));
    }

    #[tokio::test]
    async fn test_duplicate_request_id_creates_nothing() {
        let s = setup();
        s.service
            .create_command(CommandSource::Cloud, wait(10), Some("req-1".into()))
            .await
            .unwrap();
        let err = s
            .service
            .create_command(CommandSource::Cloud, wait(20), Some("req-1".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::AlreadyExists(_)));

        let page = s
            .service
            .list_commands(&ListCommandsParams::default())
            .await
            .unwrap();
        assert_eq!(page.total_items, 1);
    }

    #[tokio::test]
    async fn test_run_next_succeeds_and_records_outputs() {
        let s = setup();
        let seen = outcomes(&s.harness.bus);
        let cmd = s
            .service
            .create_command(
                CommandSource::App,
                Inputs::StopMovement(StopMovementInputs {}),
                None,
            )
            .await
            .unwrap();

        s.service.run_next_executable_command().await.unwrap();

        let done = s.service.get_command_by_id(cmd.id).await.unwrap();
        assert_eq!(done.status, CommandStatus::Succeeded);
        assert!(matches!(done.outputs, Some(Outputs::StopMovement(_))));
        assert!(done.started_at.is_some());
        assert!(done.completed_at.is_some());
        assert!(s.running.is_empty());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(cmd.id, CommandStatus::Succeeded)]
        );
    }

    #[tokio::test]
    async fn test_empty_queue() {
        let s = setup();
        assert!(matches!(
            s.service.run_next_executable_command().await,
            Err(CommandError::NoNextExecutableCommand)
        ));
    }

    #[tokio::test]
    async fn test_hardware_failure_marks_failed_with_error() {
        let s = setup();
        s.harness.controller.fail_with_ack_timeout();
        let cmd = s
            .service
            .create_command(
                CommandSource::App,
                Inputs::StopMovement(StopMovementInputs {}),
                None,
            )
            .await
            .unwrap();

        s.service.run_next_executable_command().await.unwrap();

        let done = s.service.get_command_by_id(cmd.id).await.unwrap();
        assert_eq!(done.status, CommandStatus::Failed);
        assert!(done.error.unwrap().contains("ACK"));
        assert!(done.outputs.is_none());
    }

    struct PanickingExecutor;

    #[async_trait]
    impl CommandExecutor for PanickingExecutor {
        async fn execute(
            &self,
            _token: &CancellationToken,
            _inputs: &Inputs,
        ) -> Result<Outputs, CommandError> {
            panic!("wheel fell off");
        }

        async fn on_cancel(
            &self,
            _token: &CancellationToken,
            _inputs: &Inputs,
        ) -> Result<(), CommandError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_executor_panic_becomes_failed() {
        let s = setup_with(Some(Arc::new(PanickingExecutor)));
        let cmd = s
            .service
            .create_command(CommandSource::App, wait(10), None)
            .await
            .unwrap();

        s.service.run_next_executable_command().await.unwrap();

        let done = s.service.get_command_by_id(cmd.id).await.unwrap();
        assert_eq!(done.status, CommandStatus::Failed);
        assert!(done.error.unwrap().contains("wheel fell off"));
        assert!(s.running.is_empty());
    }

    #[tokio::test]
    async fn test_processing_lock_blocks_dequeue() {
        let s = setup();
        let cmd = s
            .service
            .create_command(CommandSource::App, wait(10), None)
            .await
            .unwrap();

        let service = s.service.clone();
        s.lock
            .with_lock(async move { service.run_next_executable_command().await.unwrap() })
            .await;
        assert_eq!(status(&s, cmd.id).await, CommandStatus::Queued);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_runs_never_double_claim() {
        let s = setup();
        let first = s
            .service
            .create_command(CommandSource::App, wait(1000), None)
            .await
            .unwrap();
        let second = s
            .service
            .create_command(CommandSource::App, wait(1000), None)
            .await
            .unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let service = s.service.clone();
                tokio::spawn(async move { service.run_next_executable_command().await })
            })
            .collect();
        settle().await;

        let page = s
            .repository
            .list_commands(&ListCommandsParams {
                statuses: vec![CommandStatus::Processing, CommandStatus::Canceling],
                ..ListCommandsParams::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total_items, 1);
        assert_eq!(page.items[0].id, first.id);

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(status(&s, first.id).await, CommandStatus::Succeeded);
        assert_eq!(status(&s, second.id).await, CommandStatus::Queued);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_waits_for_claimed_command() {
        let harness = Harness::new();
        let repository = Arc::new(GatedRepository::pausing());
        let service = Arc::new(CommandService::new(
            harness.bus.clone(),
            harness.config.clone(),
            repository.clone(),
            Arc::new(RunningCommandRegistry::new()),
            Arc::new(ProcessingLock::new()),
            Arc::new(ExecutorRouter::new(harness.deps())),
        ));
        let cmd = service
            .create_command(CommandSource::App, wait(60_000), None)
            .await
            .unwrap();

        let s = service.clone();
        let run = tokio::spawn(async move { s.run_next_executable_command().await });
        repository.claimed.notified().await;

        // Row is PROCESSING but not yet in the registry
        let s = service.clone();
        let cancel = tokio::spawn(async move { s.cancel_all_running_commands().await });
        settle().await;
        assert!(!cancel.is_finished());

        repository.release.notify_one();
        cancel.await.unwrap().unwrap();
        run.await.unwrap().unwrap();
        assert_eq!(
            service.get_command_by_id(cmd.id).await.unwrap().status,
            CommandStatus::Canceled
        );
    }

    #[tokio::test]
    async fn test_cancel_during_lift_stops_motor_once() {
        let s = setup();
        s.harness.down_distance(200);
        let seen = outcomes(&s.harness.bus);
        let cmd = s
            .service
            .create_command(
                CommandSource::App,
                Inputs::CargoLift(CargoLiftInputs {
                    motor_speed: 50,
                    position: 45,
                }),
                None,
            )
            .await
            .unwrap();

        let service = s.service.clone();
        let run = tokio::spawn(async move { service.run_next_executable_command().await });
        settle().await;
        assert_eq!(status(&s, cmd.id).await, CommandStatus::Processing);

        s.service.cancel_current_processing_command().await.unwrap();
        run.await.unwrap().unwrap();

        let done = s.service.get_command_by_id(cmd.id).await.unwrap();
        assert_eq!(done.status, CommandStatus::Canceled);
        assert!(done.error.is_none());
        assert_eq!(s.harness.controller.count(&Call::StopLift), 1);
        assert!(s.running.is_empty());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(cmd.id, CommandStatus::Canceled)]
        );
    }

    #[tokio::test]
    async fn test_cancel_without_running_command() {
        let s = setup();
        assert!(matches!(
            s.service.cancel_current_processing_command().await,
            Err(CommandError::NoCommandBeingProcessed)
        ));
    }

    #[tokio::test]
    async fn test_cancel_active_cloud_commands() {
        let s = setup();
        let running = s
            .service
            .create_command(CommandSource::Cloud, wait(60_000), None)
            .await
            .unwrap();
        let cloud = s
            .service
            .create_command(CommandSource::Cloud, wait(10), None)
            .await
            .unwrap();
        let app = s
            .service
            .create_command(CommandSource::App, wait(10), None)
            .await
            .unwrap();

        let service = s.service.clone();
        let run = tokio::spawn(async move { service.run_next_executable_command().await });
        settle().await;

        s.service.cancel_active_cloud_commands().await.unwrap();
        run.await.unwrap().unwrap();

        assert_eq!(status(&s, running.id).await, CommandStatus::Canceled);
        assert_eq!(status(&s, cloud.id).await, CommandStatus::Canceled);
        assert_eq!(status(&s, app.id).await, CommandStatus::Queued);
    }

    #[tokio::test]
    async fn test_cancel_all_running_commands() {
        let s = setup();
        let running = s
            .service
            .create_command(CommandSource::App, wait(60_000), None)
            .await
            .unwrap();
        let queued = s
            .service
            .create_command(CommandSource::App, wait(10), None)
            .await
            .unwrap();

        let service = s.service.clone();
        let run = tokio::spawn(async move { service.run_next_executable_command().await });
        settle().await;

        s.service.cancel_all_running_commands().await.unwrap();
        run.await.unwrap().unwrap();

        assert_eq!(status(&s, running.id).await, CommandStatus::Canceled);
        assert_eq!(status(&s, queued.id).await, CommandStatus::Canceled);
        assert!(!s.lock.is_locked());
    }

    #[tokio::test]
    async fn test_delete_refuses_running_command() {
        let s = setup();
        let cmd = s
            .service
            .create_command(CommandSource::App, wait(60_000), None)
            .await
            .unwrap();

        let service = s.service.clone();
        let run = tokio::spawn(async move { service.run_next_executable_command().await });
        settle().await;

        assert!(matches!(
            s.service.delete_command_by_id(cmd.id).await,
            Err(CommandError::InProcessingCanNotBeDeleted(id)) if id == cmd.id
        ));

        s.service.cancel_current_processing_command().await.unwrap();
        run.await.unwrap().unwrap();
        s.service.delete_command_by_id(cmd.id).await.unwrap();
        assert!(matches!(
            s.service.get_command_by_id(cmd.id).await,
            Err(CommandError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_old_commands_uses_threshold() {
        let s = setup();
        let mut old = Command::queued(CommandSource::App, wait(10), None, now());
        old.status = CommandStatus::Succeeded;
        old.created_at = now() - chrono::Duration::days(30);
        let old = s.repository.create_command(old).await.unwrap();
        let fresh = s
            .service
            .create_command(CommandSource::App, wait(10), None)
            .await
            .unwrap();

        assert_eq!(s.service.delete_old_commands().await.unwrap(), 1);
        assert!(s.service.get_command_by_id(old.id).await.is_err());
        assert!(s.service.get_command_by_id(fresh.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_recover_pending_commands() {
        let s = setup();
        let cmd = s
            .service
            .create_command(CommandSource::App, wait(10), None)
            .await
            .unwrap();
        s.repository.claim_next_executable_command(now()).await.unwrap();

        let recovered = s.service.recover_pending_commands().await.unwrap();
        assert_eq!(recovered, vec![cmd.id]);
        assert_eq!(status(&s, cmd.id).await, CommandStatus::Canceled);
    }

    #[tokio::test]
    async fn test_list_rejects_bad_paging() {
        let s = setup();
        let err = s
            .service
            .list_commands(&ListCommandsParams {
                page: 0,
                ..ListCommandsParams::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Validation(e) if e.field == "page"));
    }
}
