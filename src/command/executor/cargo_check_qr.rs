use anyhow::anyhow;
use async_trait::async_trait;
use raybot_shared::command::{CargoCheckQrInputs, CargoCheckQrOutputs};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::TypedExecutor;
use crate::error::CommandError;
use crate::state::RobotStateService;

/// Compares the QR code last read inside the cargo box with the expected one
pub struct CargoCheckQrExecutor {
    state: Arc<RobotStateService>,
}

impl CargoCheckQrExecutor {
    pub fn new(state: Arc<RobotStateService>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl TypedExecutor for CargoCheckQrExecutor {
    type Inputs = CargoCheckQrInputs;
    type Outputs = CargoCheckQrOutputs;

    async fn execute(
        &self,
        _token: &CancellationToken,
        inputs: &CargoCheckQrInputs,
    ) -> Result<CargoCheckQrOutputs, CommandError> {
        let actual = self.state.cargo().qr_code;
        if actual != inputs.qr_code {
            return Err(anyhow!(
                "cargo QR code mismatch: expected {:?}, got {:?}",
                inputs.qr_code,
                actual
            )
            .into());
        }
        info!(qr_code = %actual, "cargo QR code matched");
        Ok(CargoCheckQrOutputs {})
    }
}
