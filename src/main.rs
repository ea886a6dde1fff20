mod command;
mod config;
mod error;
mod eventbus;
mod hardware;
mod inbound;
mod jobs;
mod serial;
mod state;

use anyhow::Context;
use clap::Parser;
use command::{
    CommandService, ExecutorDeps, ExecutorRouter, InMemoryCommandRepository, ProcessingLock,
    RunningCommandRegistry,
};
use config::{ConfigService, LogConfig, LogFormat};
use eventbus::EventBus;
use hardware::{AckSettings, HardwareController};
use inbound::InboundHandler;
use jobs::ExecuteCommandJob;
use serial::{Device, SerialClient};
use state::RobotStateService;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Inbound lines buffered per serial link
const LINE_CHANNEL_SIZE: usize = 64;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

#[derive(Parser, Debug)]
#[command(name = "raybot", about = "Command supervisor for the raybot cargo robot")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    match log.format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init(),
    }
}

/// Re-read the config file on every SIGHUP
async fn reload_on_hangup(config: Arc<ConfigService>, token: CancellationToken) {
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            error!(error = %e, "failed to install SIGHUP handler");
            return;
        }
    };
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            received = hangup.recv() => {
                if received.is_none() {
                    break;
                }
            }
        }
        if let Err(e) = config.reload().await {
            error!(error = %e, "config reload failed, keeping current config");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Arc::new(
        ConfigService::load(&args.config)
            .with_context(|| format!("loading config {}", args.config.display()))?,
    );
    let cfg = config.config();
    init_tracing(&cfg.log);

    info!(config = %args.config.display(), "raybot starting");
    info!(
        pic = %cfg.hardware.pic.serial.port,
        esp = %cfg.hardware.esp.serial.port,
        "serial ports"
    );

    let root = CancellationToken::new();
    let bus = Arc::new(EventBus::new());
    let state = Arc::new(RobotStateService::new(bus.clone()));

    // Serial links and their inbound frame handlers
    let inbound = Arc::new(InboundHandler::new(bus.clone(), state.clone()));
    let pic = SerialClient::new(Device::Pic, cfg.hardware.pic.serial.clone(), bus.clone());
    let esp = SerialClient::new(Device::Esp, cfg.hardware.esp.serial.clone(), bus.clone());
    for (device, client) in [(Device::Pic, pic.clone()), (Device::Esp, esp.clone())] {
        let (tx, rx) = mpsc::channel(LINE_CHANNEL_SIZE);
        tokio::spawn(client.run(root.child_token(), tx));
        tokio::spawn(inbound.clone().run(device, root.child_token(), rx));
    }

    let controller = Arc::new(HardwareController::new(
        bus.clone(),
        state.clone(),
        pic,
        AckSettings::from(&cfg.hardware.pic),
        esp,
        AckSettings::from(&cfg.hardware.esp),
    ));

    // Command core
    let executor = Arc::new(ExecutorRouter::new(ExecutorDeps {
        bus: bus.clone(),
        controller,
        state: state.clone(),
        config: config.clone(),
    }));
    let service = Arc::new(CommandService::new(
        bus.clone(),
        config.clone(),
        Arc::new(InMemoryCommandRepository::new()),
        Arc::new(RunningCommandRegistry::new()),
        Arc::new(ProcessingLock::new()),
        executor,
    ));
    service
        .recover_pending_commands()
        .await
        .context("recovering pending commands")?;

    // Jobs
    let execute_job = ExecuteCommandJob::new(service.clone(), cfg.jobs.execute_interval());
    execute_job.listen(&bus, &root);
    tokio::spawn(execute_job.run(root.child_token()));
    tokio::spawn(jobs::run_delete_old_commands(
        service.clone(),
        cfg.cron.delete_old_command.interval(),
        root.child_token(),
    ));

    tokio::spawn(reload_on_hangup(config.clone(), root.child_token()));

    info!("raybot ready");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    warn!("shutdown requested, cancelling commands");
    if let Err(e) = service.cancel_all_running_commands().await {
        error!(error = %e, "failed to cancel commands on shutdown");
    }
    // Wait for the cancel hook to stop the motors
    let settled = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while service.get_current_processing_command().await.is_ok() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if settled.is_err() {
        warn!("running command did not settle before shutdown");
    }
    root.cancel();
    info!("raybot stopped");
    Ok(())
}
