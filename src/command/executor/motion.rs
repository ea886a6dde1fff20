//! Drive motor executors

use async_trait::async_trait;
use raybot_shared::command::{
    MoveBackwardInputs, MoveBackwardOutputs, MoveForwardInputs, MoveForwardOutputs, MoveToInputs,
    MoveToOutputs, StopMovementInputs, StopMovementOutputs,
};
use raybot_shared::MoveDirection;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::tracking::{next_value, subscribe_values};
use super::{ExecutorDeps, TypedExecutor};
use crate::error::CommandError;
use crate::eventbus::{topics, Event};
use crate::hardware::Controller;

async fn stop_drive(controller: &dyn Controller, token: &CancellationToken) -> Result<(), CommandError> {
    controller.stop_drive_motor(token).await?;
    Ok(())
}

pub struct StopMovementExecutor {
    controller: Arc<dyn Controller>,
}

impl StopMovementExecutor {
    pub fn new(controller: Arc<dyn Controller>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl TypedExecutor for StopMovementExecutor {
    type Inputs = StopMovementInputs;
    type Outputs = StopMovementOutputs;

    async fn execute(
        &self,
        token: &CancellationToken,
        _inputs: &StopMovementInputs,
    ) -> Result<StopMovementOutputs, CommandError> {
        stop_drive(self.controller.as_ref(), token).await?;
        Ok(StopMovementOutputs {})
    }
}

/// Starts the drive motor forward and returns; stopping is a separate command
pub struct MoveForwardExecutor {
    controller: Arc<dyn Controller>,
}

impl MoveForwardExecutor {
    pub fn new(controller: Arc<dyn Controller>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl TypedExecutor for MoveForwardExecutor {
    type Inputs = MoveForwardInputs;
    type Outputs = MoveForwardOutputs;

    async fn execute(
        &self,
        token: &CancellationToken,
        inputs: &MoveForwardInputs,
    ) -> Result<MoveForwardOutputs, CommandError> {
        self.controller.move_forward(token, inputs.motor_speed).await?;
        Ok(MoveForwardOutputs {})
    }

    async fn on_cancel(
        &self,
        token: &CancellationToken,
        _inputs: &MoveForwardInputs,
    ) -> Result<(), CommandError> {
        stop_drive(self.controller.as_ref(), token).await
    }
}

pub struct MoveBackwardExecutor {
    controller: Arc<dyn Controller>,
}

impl MoveBackwardExecutor {
    pub fn new(controller: Arc<dyn Controller>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl TypedExecutor for MoveBackwardExecutor {
    type Inputs = MoveBackwardInputs;
    type Outputs = MoveBackwardOutputs;

    async fn execute(
        &self,
        token: &CancellationToken,
        inputs: &MoveBackwardInputs,
    ) -> Result<MoveBackwardOutputs, CommandError> {
        self.controller.move_backward(token, inputs.motor_speed).await?;
        Ok(MoveBackwardOutputs {})
    }

    async fn on_cancel(
        &self,
        token: &CancellationToken,
        _inputs: &MoveBackwardInputs,
    ) -> Result<(), CommandError> {
        stop_drive(self.controller.as_ref(), token).await
    }
}

/// Drive until the location reader reports the target, then stop
pub struct MoveToExecutor {
    deps: ExecutorDeps,
}

impl MoveToExecutor {
    pub fn new(deps: ExecutorDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl TypedExecutor for MoveToExecutor {
    type Inputs = MoveToInputs;
    type Outputs = MoveToOutputs;

    async fn execute(
        &self,
        token: &CancellationToken,
        inputs: &MoveToInputs,
    ) -> Result<MoveToOutputs, CommandError> {
        if self.deps.state.location().as_deref() == Some(inputs.location.as_str()) {
            info!(location = %inputs.location, "already at target location");
            return Ok(MoveToOutputs {});
        }

        let tracking = token.child_token();
        let _guard = tracking.clone().drop_guard();
        let mut locations = subscribe_values(
            &self.deps.bus,
            &tracking,
            topics::LOCATION_UPDATED,
            |event| match event {
                Event::LocationUpdated { location } => Some(location.clone()),
                _ => None,
            },
        );

        let controller = self.deps.controller.as_ref();
        match inputs.direction {
            MoveDirection::Forward => controller.move_forward(token, inputs.motor_speed).await?,
            MoveDirection::Backward => controller.move_backward(token, inputs.motor_speed).await?,
        }

        loop {
            let location = next_value(&mut locations, token).await?;
            debug!(%location, target = %inputs.location, "location read while moving");
            if location == inputs.location {
                break;
            }
        }

        stop_drive(controller, token).await?;
        info!(location = %inputs.location, "reached target location");
        Ok(MoveToOutputs {})
    }

    async fn on_cancel(
        &self,
        token: &CancellationToken,
        _inputs: &MoveToInputs,
    ) -> Result<(), CommandError> {
        stop_drive(self.deps.controller.as_ref(), token).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{settle, Harness};
    use super::*;
    use crate::hardware::fake::Call;

    fn move_to(location: &str) -> MoveToInputs {
        MoveToInputs {
            location: location.into(),
            direction: MoveDirection::Backward,
            motor_speed: 40,
        }
    }

    #[tokio::test]
    async fn test_stop_movement() {
        let h = Harness::new();
        let exec = StopMovementExecutor::new(h.controller.clone());
        exec.execute(&CancellationToken::new(), &StopMovementInputs {})
            .await
            .unwrap();
        assert_eq!(h.controller.calls(), vec![Call::StopDrive]);
    }

    #[tokio::test]
    async fn test_move_forward_returns_after_start() {
        let h = Harness::new();
        let exec = MoveForwardExecutor::new(h.controller.clone());
        exec.execute(&CancellationToken::new(), &MoveForwardInputs { motor_speed: 30 })
            .await
            .unwrap();
        assert_eq!(
            h.controller.calls(),
            vec![Call::Drive {
                direction: MoveDirection::Forward,
                speed: 30
            }]
        );
    }

    #[tokio::test]
    async fn test_move_to_already_there() {
        let h = Harness::new();
        h.state.update_location("B2");
        let exec = MoveToExecutor::new(h.deps());
        exec.execute(&CancellationToken::new(), &move_to("B2"))
            .await
            .unwrap();
        assert!(h.controller.calls().is_empty());
    }

    #[tokio::test]
    async fn test_move_to_stops_at_target() {
        let h = Harness::new();
        let exec = Arc::new(MoveToExecutor::new(h.deps()));
        let token = CancellationToken::new();

        let e = exec.clone();
        let t = token.clone();
        let handle = tokio::spawn(async move { e.execute(&t, &move_to("C3")).await });
        settle().await;

        h.state.update_location("C1");
        h.state.update_location("C2");
        settle().await;
        assert!(!handle.is_finished());
        h.state.update_location("C3");

        handle.await.unwrap().unwrap();
        assert_eq!(
            h.controller.calls(),
            vec![
                Call::Drive {
                    direction: MoveDirection::Backward,
                    speed: 40
                },
                Call::StopDrive
            ]
        );
        assert_eq!(h.bus.subscriber_count(topics::LOCATION_UPDATED), 0);
    }

    #[tokio::test]
    async fn test_move_to_cancel_leaves_stop_to_on_cancel() {
        let h = Harness::new();
        let exec = Arc::new(MoveToExecutor::new(h.deps()));
        let token = CancellationToken::new();

        let e = exec.clone();
        let t = token.clone();
        let handle = tokio::spawn(async move { e.execute(&t, &move_to("D4")).await });
        settle().await;
        token.cancel();

        assert!(handle.await.unwrap().unwrap_err().is_cancelled());
        assert_eq!(h.controller.count(&Call::StopDrive), 0);

        exec.on_cancel(&CancellationToken::new(), &move_to("D4"))
            .await
            .unwrap();
        assert_eq!(h.controller.count(&Call::StopDrive), 1);
    }
}
