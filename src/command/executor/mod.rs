//! Command executors
//!
//! One executor per command type. The router maps a command's [`Inputs`]
//! to its executor and wraps the typed result back into [`Outputs`].

mod cargo_check_qr;
mod cargo_door;
mod cargo_lift;
mod cargo_lower;
mod motion;
mod scan_location;
mod tracking;
mod wait;

pub use cargo_check_qr::CargoCheckQrExecutor;
pub use cargo_door::{CargoCloseExecutor, CargoOpenExecutor};
pub use cargo_lift::CargoLiftExecutor;
pub use cargo_lower::CargoLowerExecutor;
pub use motion::{MoveBackwardExecutor, MoveForwardExecutor, MoveToExecutor, StopMovementExecutor};
pub use scan_location::ScanLocationExecutor;
pub use tracking::{
    is_lift_position_reached, is_lower_position_reached, ObstacleAction, ObstacleTracker,
    StableReadCounter,
};
pub use wait::WaitExecutor;

use async_trait::async_trait;
use raybot_shared::{Inputs, Outputs};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::ConfigService;
use crate::error::CommandError;
use crate::eventbus::EventBus;
use crate::hardware::Controller;
use crate::state::RobotStateService;

/// Executor for a single command type
#[async_trait]
pub trait TypedExecutor: Send + Sync {
    type Inputs: Send + Sync;
    type Outputs: Send;

    /// Run to completion. Returns `Cancelled` once `token` fires; cleanup
    /// after a cancel is left to [`TypedExecutor::on_cancel`].
    async fn execute(
        &self,
        token: &CancellationToken,
        inputs: &Self::Inputs,
    ) -> Result<Self::Outputs, CommandError>;

    /// Bring the hardware to a safe state after a cancelled run
    async fn on_cancel(
        &self,
        _token: &CancellationToken,
        _inputs: &Self::Inputs,
    ) -> Result<(), CommandError> {
        Ok(())
    }
}

/// What the command service drives
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(
        &self,
        token: &CancellationToken,
        inputs: &Inputs,
    ) -> Result<Outputs, CommandError>;

    async fn on_cancel(&self, token: &CancellationToken, inputs: &Inputs)
        -> Result<(), CommandError>;
}

/// Shared services handed to every executor
#[derive(Clone)]
pub struct ExecutorDeps {
    pub bus: Arc<EventBus>,
    pub controller: Arc<dyn Controller>,
    pub state: Arc<RobotStateService>,
    pub config: Arc<ConfigService>,
}

pub struct ExecutorRouter {
    stop_movement: StopMovementExecutor,
    move_to: MoveToExecutor,
    move_forward: MoveForwardExecutor,
    move_backward: MoveBackwardExecutor,
    cargo_open: CargoOpenExecutor,
    cargo_close: CargoCloseExecutor,
    cargo_lift: CargoLiftExecutor,
    cargo_lower: CargoLowerExecutor,
    cargo_check_qr: CargoCheckQrExecutor,
    scan_location: ScanLocationExecutor,
    wait: WaitExecutor,
}

impl ExecutorRouter {
    pub fn new(deps: ExecutorDeps) -> Self {
        Self {
            stop_movement: StopMovementExecutor::new(deps.controller.clone()),
            move_to: MoveToExecutor::new(deps.clone()),
            move_forward: MoveForwardExecutor::new(deps.controller.clone()),
            move_backward: MoveBackwardExecutor::new(deps.controller.clone()),
            cargo_open: CargoOpenExecutor::new(deps.clone()),
            cargo_close: CargoCloseExecutor::new(deps.clone()),
            cargo_lift: CargoLiftExecutor::new(deps.clone()),
            cargo_lower: CargoLowerExecutor::new(deps.clone()),
            cargo_check_qr: CargoCheckQrExecutor::new(deps.state.clone()),
            scan_location: ScanLocationExecutor::new(deps.bus.clone()),
            wait: WaitExecutor,
        }
    }
}

#[async_trait]
impl CommandExecutor for ExecutorRouter {
    async fn execute(
        &self,
        token: &CancellationToken,
        inputs: &Inputs,
    ) -> Result<Outputs, CommandError> {
        let outputs = match inputs {
            Inputs::StopMovement(i) => Outputs::StopMovement(self.stop_movement.execute(token, i).await?),
            Inputs::MoveTo(i) => Outputs::MoveTo(self.move_to.execute(token, i).await?),
            Inputs::MoveForward(i) => Outputs::MoveForward(self.move_forward.execute(token, i).await?),
            Inputs::MoveBackward(i) => {
                Outputs::MoveBackward(self.move_backward.execute(token, i).await?)
            }
            Inputs::CargoOpen(i) => Outputs::CargoOpen(self.cargo_open.execute(token, i).await?),
            Inputs::CargoClose(i) => Outputs::CargoClose(self.cargo_close.execute(token, i).await?),
            Inputs::CargoLift(i) => Outputs::CargoLift(self.cargo_lift.execute(token, i).await?),
            Inputs::CargoLower(i) => Outputs::CargoLower(self.cargo_lower.execute(token, i).await?),
            Inputs::CargoCheckQr(i) => {
                Outputs::CargoCheckQr(self.cargo_check_qr.execute(token, i).await?)
            }
            Inputs::ScanLocation(i) => {
                Outputs::ScanLocation(self.scan_location.execute(token, i).await?)
            }
            Inputs::Wait(i) => Outputs::Wait(self.wait.execute(token, i).await?),
        };
        Ok(outputs)
    }

    async fn on_cancel(
        &self,
        token: &CancellationToken,
        inputs: &Inputs,
    ) -> Result<(), CommandError> {
        match inputs {
            Inputs::StopMovement(i) => self.stop_movement.on_cancel(token, i).await,
            Inputs::MoveTo(i) => self.move_to.on_cancel(token, i).await,
            Inputs::MoveForward(i) => self.move_forward.on_cancel(token, i).await,
            Inputs::MoveBackward(i) => self.move_backward.on_cancel(token, i).await,
            Inputs::CargoOpen(i) => self.cargo_open.on_cancel(token, i).await,
            Inputs::CargoClose(i) => self.cargo_close.on_cancel(token, i).await,
            Inputs::CargoLift(i) => self.cargo_lift.on_cancel(token, i).await,
            Inputs::CargoLower(i) => self.cargo_lower.on_cancel(token, i).await,
            Inputs::CargoCheckQr(i) => self.cargo_check_qr.on_cancel(token, i).await,
            Inputs::ScanLocation(i) => self.scan_location.on_cancel(token, i).await,
            Inputs::Wait(i) => self.wait.on_cancel(token, i).await,
        }
    }
}
