//! Closed-loop cargo lower with bottom obstacle tracking
//!
//! Two trackers run side by side: one waits for the down distance to reach
//! the target, the other pauses the lift motor while something sits under the
//! platform and resumes it once the way is clear. Obstacle tracking ends when
//! position tracking does.

use async_trait::async_trait;
use raybot_shared::command::{CargoLowerInputs, CargoLowerOutputs};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::tracking::{
    is_lower_position_reached, next_value, subscribe_values, wait_until_stable, ObstacleAction,
    ObstacleTracker, StableReadCounter,
};
use super::{ExecutorDeps, TypedExecutor};
use crate::config::ObstacleTrackingConfig;
use crate::error::CommandError;
use crate::eventbus::{topics, Event};

pub struct CargoLowerExecutor {
    deps: ExecutorDeps,
}

impl CargoLowerExecutor {
    pub fn new(deps: ExecutorDeps) -> Self {
        Self { deps }
    }

    /// Runs until `token` fires; only ever returns the cancellation error
    async fn track_bottom_obstacle(
        &self,
        token: &CancellationToken,
        inputs: &CargoLowerInputs,
        thresholds: ObstacleTrackingConfig,
        mut distances: mpsc::UnboundedReceiver<u16>,
    ) -> CommandError {
        let mut tracker = ObstacleTracker::new(thresholds.enter_distance, thresholds.exit_distance);
        loop {
            let distance = match next_value(&mut distances, token).await {
                Ok(distance) => distance,
                Err(e) => return e,
            };

            match tracker.observe(distance) {
                Some(ObstacleAction::StopMotor) => {
                    warn!(distance, "obstacle under cargo, pausing lift motor");
                    if let Err(e) = self.deps.controller.stop_lift_motor(token).await {
                        error!(error = %e, "failed to stop lift motor");
                    }
                }
                Some(ObstacleAction::RestartMotor) => {
                    info!(distance, "obstacle cleared, resuming lift motor");
                    if let Err(e) = self
                        .deps
                        .controller
                        .set_cargo_position(token, inputs.motor_speed, inputs.position)
                        .await
                    {
                        error!(error = %e, "failed to set cargo position");
                    }
                }
                None => {}
            }
        }
    }
}

#[async_trait]
impl TypedExecutor for CargoLowerExecutor {
    type Inputs = CargoLowerInputs;
    type Outputs = CargoLowerOutputs;

    async fn execute(
        &self,
        token: &CancellationToken,
        inputs: &CargoLowerInputs,
    ) -> Result<CargoLowerOutputs, CommandError> {
        let config = self.deps.config.command_config().cargo_lower;

        let tracking = token.child_token();
        let _guard = tracking.clone().drop_guard();
        let mut readings = subscribe_values(
            &self.deps.bus,
            &tracking,
            topics::DISTANCE_SENSOR_UPDATED,
            |event| match event {
                Event::DistanceSensorUpdated(sync) => Some(sync.down_distance),
                _ => None,
            },
        );
        let bottom = subscribe_values(
            &self.deps.bus,
            &tracking,
            topics::CARGO_BOTTOM_DISTANCE_UPDATED,
            |event| match event {
                Event::CargoBottomDistanceUpdated { distance } => Some(*distance),
                _ => None,
            },
        );

        self.deps
            .controller
            .set_cargo_position(token, inputs.motor_speed, inputs.position)
            .await?;

        let position = wait_until_stable(
            &mut readings,
            &tracking,
            StableReadCounter::new(config.stable_read_count()),
            inputs.position,
            is_lower_position_reached,
        );
        let obstacle =
            self.track_bottom_obstacle(&tracking, inputs, config.bottom_obstacle_tracking, bottom);

        tokio::select! {
            biased;
            result = position => result?,
            e = obstacle => return Err(e),
        }

        self.deps.controller.stop_lift_motor(token).await?;
        info!(target = inputs.position, "cargo lowered");
        Ok(CargoLowerOutputs {})
    }

    async fn on_cancel(
        &self,
        token: &CancellationToken,
        _inputs: &CargoLowerInputs,
    ) -> Result<(), CommandError> {
        self.deps.controller.stop_lift_motor(token).await?;
        Ok(())
    }
}
