//! Background jobs driving the command service

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::command::CommandService;
use crate::error::CommandError;
use crate::eventbus::{topics, EventBus};

/// Clears the busy flag however the run ends
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs queued commands on a fixed tick and whenever one is created
pub struct ExecuteCommandJob {
    service: Arc<CommandService>,
    interval: Duration,
    busy: AtomicBool,
    wake: Notify,
}

impl ExecuteCommandJob {
    /// Poll every `interval` in addition to creation wakeups
    pub fn new(service: Arc<CommandService>, interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            service,
            interval,
            busy: AtomicBool::new(false),
            wake: Notify::new(),
        })
    }

    /// Wake the job on `command:created` until `token` is cancelled
    pub fn listen(self: &Arc<Self>, bus: &EventBus, token: &CancellationToken) {
        let job = self.clone();
        bus.subscribe(token, topics::COMMAND_CREATED, move |_| job.wake.notify_one());
    }

    /// Execute at most one command; returns at once if a run is in progress.
    /// While the processing lock is held it waits for release first.
    pub async fn run_once(&self, token: &CancellationToken) {
        if self.busy.swap(true, Ordering::AcqRel) {
            debug!("execute job already running");
            return;
        }
        let _busy = BusyGuard(&self.busy);
        if self.service.wait_until_unlocked(token).await.is_err() {
            return;
        }
        match self.service.run_next_executable_command().await {
            Ok(()) | Err(CommandError::NoNextExecutableCommand) => {}
            Err(e) => error!(error = %e, "failed to run next command"),
        }
    }

    /// Drive [`ExecuteCommandJob::run_once`] until `token` is cancelled
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_ms = self.interval.as_millis() as u64, "execute command job started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }
            let job = self.clone();
            let token = token.clone();
            tokio::spawn(async move { job.run_once(&token).await });
        }
        info!("execute command job stopped");
    }
}

/// Prunes finished commands past the configured age
pub async fn run_delete_old_commands(
    service: Arc<CommandService>,
    every: Duration,
    token: CancellationToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(interval_secs = every.as_secs(), "delete old commands job started");

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Err(e) = service.delete_old_commands().await {
            error!(error = %e, "failed to delete old commands");
        }
    }
    info!("delete old commands job stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::executor::testing::{settle, Harness};
    use crate::command::repository::testing::GatedRepository;
    use crate::command::{
        CommandRepository, ExecutorRouter, InMemoryCommandRepository, ProcessingLock,
        RunningCommandRegistry,
    };
    use raybot_shared::command::{StopMovementInputs, WaitInputs};
    use raybot_shared::{CommandSource, CommandStatus, Inputs};

    fn service_with(
        h: &Harness,
        repository: Arc<dyn CommandRepository>,
        lock: Arc<ProcessingLock>,
    ) -> Arc<CommandService> {
        Arc::new(CommandService::new(
            h.bus.clone(),
            h.config.clone(),
            repository,
            Arc::new(RunningCommandRegistry::new()),
            lock,
            Arc::new(ExecutorRouter::new(h.deps())),
        ))
    }

    fn service(h: &Harness) -> Arc<CommandService> {
        service_with(
            h,
            Arc::new(InMemoryCommandRepository::new()),
            Arc::new(ProcessingLock::new()),
        )
    }

    #[tokio::test]
    async fn test_created_event_wakes_job() {
        let h = Harness::new();
        let service = service(&h);
        let job = ExecuteCommandJob::new(service.clone(), Duration::from_secs(3600));
        let token = CancellationToken::new();
        job.listen(&h.bus, &token);
        let handle = tokio::spawn(job.clone().run(token.clone()));
        settle().await;

        let cmd = service
            .create_command(
                CommandSource::App,
                Inputs::StopMovement(StopMovementInputs {}),
                None,
            )
            .await
            .unwrap();
        settle().await;

        let done = service.get_command_by_id(cmd.id).await.unwrap();
        assert_eq!(done.status, CommandStatus::Succeeded);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_once_is_not_reentrant() {
        let h = Harness::new();
        let service = service(&h);
        let job = ExecuteCommandJob::new(service.clone(), Duration::from_secs(1));
        for _ in 0..2 {
            service
                .create_command(
                    CommandSource::App,
                    Inputs::Wait(WaitInputs { duration_ms: 500 }),
                    None,
                )
                .await
                .unwrap();
        }

        let token = CancellationToken::new();
        let j = job.clone();
        let t = token.clone();
        let first = tokio::spawn(async move { j.run_once(&t).await });
        settle().await;
        // Returns immediately instead of waiting behind the first run
        job.run_once(&token).await;

        let processing = service.get_current_processing_command().await.unwrap();
        assert_eq!(processing.id, 1);
        first.await.unwrap();

        job.run_once(&token).await;
        assert_eq!(
            service.get_command_by_id(2).await.unwrap().status,
            CommandStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn test_busy_flag_cleared_after_panic() {
        let h = Harness::new();
        let service = service_with(
            &h,
            Arc::new(GatedRepository::panicking()),
            Arc::new(ProcessingLock::new()),
        );
        service
            .create_command(
                CommandSource::App,
                Inputs::StopMovement(StopMovementInputs {}),
                None,
            )
            .await
            .unwrap();
        let job = ExecuteCommandJob::new(service, Duration::from_secs(3600));

        let j = job.clone();
        let err = tokio::spawn(async move { j.run_once(&CancellationToken::new()).await })
            .await
            .unwrap_err();
        assert!(err.is_panic());
        assert!(!job.busy.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_run_waits_for_processing_lock() {
        let h = Harness::new();
        let lock = Arc::new(ProcessingLock::new());
        let service = service_with(&h, Arc::new(InMemoryCommandRepository::new()), lock.clone());
        let cmd = service
            .create_command(
                CommandSource::App,
                Inputs::StopMovement(StopMovementInputs {}),
                None,
            )
            .await
            .unwrap();
        let job = ExecuteCommandJob::new(service.clone(), Duration::from_secs(3600));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let held = lock.clone();
        let holder = tokio::spawn(async move {
            held.with_lock(async {
                let _ = release_rx.await;
            })
            .await
        });
        settle().await;
        assert!(lock.is_locked());

        let j = job.clone();
        let run = tokio::spawn(async move { j.run_once(&CancellationToken::new()).await });
        settle().await;
        assert!(!run.is_finished());
        assert_eq!(
            service.get_command_by_id(cmd.id).await.unwrap().status,
            CommandStatus::Queued
        );

        release_tx.send(()).unwrap();
        holder.await.unwrap();
        run.await.unwrap();
        assert_eq!(
            service.get_command_by_id(cmd.id).await.unwrap().status,
            CommandStatus::Succeeded
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_job_stops_on_cancel() {
        let h = Harness::new();
        let token = CancellationToken::new();
        let handle = tokio::spawn(run_delete_old_commands(
            service(&h),
            Duration::from_secs(60),
            token.clone(),
        ));
        tokio::time::sleep(Duration::from_secs(130)).await;
        token.cancel();
        handle.await.unwrap();
    }
}
