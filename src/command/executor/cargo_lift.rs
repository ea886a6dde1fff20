//! Closed-loop cargo lift
//!
//! Commands the lift motor toward the target and watches the down distance
//! sensor until enough consecutive readings sit within tolerance, then stops
//! the motor.

use async_trait::async_trait;
use raybot_shared::command::{CargoLiftInputs, CargoLiftOutputs};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::tracking::{
    is_lift_position_reached, subscribe_values, wait_until_stable, StableReadCounter,
};
use super::{ExecutorDeps, TypedExecutor};
use crate::error::CommandError;
use crate::eventbus::{topics, Event};

pub struct CargoLiftExecutor {
    deps: ExecutorDeps,
}

impl CargoLiftExecutor {
    pub fn new(deps: ExecutorDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl TypedExecutor for CargoLiftExecutor {
    type Inputs = CargoLiftInputs;
    type Outputs = CargoLiftOutputs;

    async fn execute(
        &self,
        token: &CancellationToken,
        inputs: &CargoLiftInputs,
    ) -> Result<CargoLiftOutputs, CommandError> {
        let current = self.deps.state.distance_sensor().down_distance;
        if is_lift_position_reached(current, inputs.position) {
            info!(current, target = inputs.position, "cargo already lifted");
            return Ok(CargoLiftOutputs {});
        }

        let required = self.deps.config.command_config().cargo_lift.stable_read_count();

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

        self.deps
            .controller
            .set_cargo_position(token, inputs.motor_speed, inputs.position)
            .await?;

        wait_until_stable(
            &mut readings,
            token,
            StableReadCounter::new(required),
            inputs.position,
            is_lift_position_reached,
        )
        .await?;

        self.deps.controller.stop_lift_motor(token).await?;
        info!(target = inputs.position, "cargo lifted");
        Ok(CargoLiftOutputs {})
    }

    async fn on_cancel(
        &self,
        token: &CancellationToken,
        _inputs: &CargoLiftInputs,
    ) -> Result<(), CommandError> {
        self.deps.controller.stop_lift_motor(token).await?;
        Ok(())
    }
}
