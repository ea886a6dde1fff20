use async_trait::async_trait;
use raybot_shared::command::{WaitInputs, WaitOutputs};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::TypedExecutor;
use crate::error::CommandError;

pub struct WaitExecutor;

#[async_trait]
impl TypedExecutor for WaitExecutor {
    type Inputs = WaitInputs;
    type Outputs = WaitOutputs;

    async fn execute(
        &self,
        token: &CancellationToken,
        inputs: &WaitInputs,
    ) -> Result<WaitOutputs, CommandError> {
        tokio::select! {
            _ = token.cancelled() => Err(CommandError::Cancelled),
            _ = tokio::time::sleep(Duration::from_millis(inputs.duration_ms)) => Ok(WaitOutputs {}),
        }
    }
}
