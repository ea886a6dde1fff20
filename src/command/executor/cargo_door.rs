//! Cargo door executors

use async_trait::async_trait;
use raybot_shared::command::{CargoCloseInputs, CargoCloseOutputs, CargoOpenInputs, CargoOpenOutputs};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::tracking::{next_value, subscribe_values};
use super::{ExecutorDeps, TypedExecutor};
use crate::error::CommandError;
use crate::eventbus::{topics, Event};

/// Actuate the door and wait until the ESP reports it in the wanted state
async fn drive_door(
    deps: &ExecutorDeps,
    token: &CancellationToken,
    open: bool,
    speed: u8,
) -> Result<(), CommandError> {
    if deps.state.cargo().door_open == open {
        info!(open, "cargo door already in place");
        return Ok(());
    }

    let tracking = token.child_token();
    let _guard = tracking.clone().drop_guard();
    let mut door = subscribe_values(&deps.bus, &tracking, topics::CARGO_DOOR_UPDATED, |event| {
        match event {
            Event::CargoDoorUpdated { open } => Some(*open),
            _ => None,
        }
    });

    if open {
        deps.controller.open_cargo_door(token, speed).await?;
    } else {
        deps.controller.close_cargo_door(token, speed).await?;
    }

    while next_value(&mut door, token).await? != open {
        debug!(open, "waiting for cargo door");
    }
    info!(open, "cargo door in place");
    Ok(())
}

pub struct CargoOpenExecutor {
    deps: ExecutorDeps,
}

impl CargoOpenExecutor {
    pub fn new(deps: ExecutorDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl TypedExecutor for CargoOpenExecutor {
    type Inputs = CargoOpenInputs;
    type Outputs = CargoOpenOutputs;

    async fn execute(
        &self,
        token: &CancellationToken,
        inputs: &CargoOpenInputs,
    ) -> Result<CargoOpenOutputs, CommandError> {
        drive_door(&self.deps, token, true, inputs.motor_speed).await?;
        Ok(CargoOpenOutputs {})
    }
}

pub struct CargoCloseExecutor {
    deps: ExecutorDeps,
}

impl CargoCloseExecutor {
    pub fn new(deps: ExecutorDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl TypedExecutor for CargoCloseExecutor {
    type Inputs = CargoCloseInputs;
    type Outputs = CargoCloseOutputs;

    async fn execute(
        &self,
        token: &CancellationToken,
        inputs: &CargoCloseInputs,
    ) -> Result<CargoCloseOutputs, CommandError> {
        drive_door(&self.deps, token, false, inputs.motor_speed).await?;
        Ok(CargoCloseOutputs {})
    }
}
