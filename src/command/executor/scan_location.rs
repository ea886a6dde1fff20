use async_trait::async_trait;
use raybot_shared::command::{ScanLocationInputs, ScanLocationOutputs};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::tracking::{next_value, subscribe_values};
use super::TypedExecutor;
use crate::error::CommandError;
use crate::eventbus::{topics, Event, EventBus};

/// Waits for the next tag read by the location reader
pub struct ScanLocationExecutor {
    bus: Arc<EventBus>,
}

impl ScanLocationExecutor {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl TypedExecutor for ScanLocationExecutor {
    type Inputs = ScanLocationInputs;
    type Outputs = ScanLocationOutputs;

    async fn execute(
        &self,
        token: &CancellationToken,
        _inputs: &ScanLocationInputs,
    ) -> Result<ScanLocationOutputs, CommandError> {
        let tracking = token.child_token();
        let _guard = tracking.clone().drop_guard();
        let mut locations =
            subscribe_values(&self.bus, &tracking, topics::LOCATION_UPDATED, |event| {
                match event {
                    Event::LocationUpdated { location } => Some(location.clone()),
                    _ => None,
                }
            });

        let location = next_value(&mut locations, token).await?;
        info!(%location, "location scanned");
        Ok(ScanLocationOutputs { location })
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{settle, Harness};
    use super::*;

    #[tokio::test]
    async fn test_cancel_before_any_read() {
        let h = Harness::new();
        let exec = Arc::new(ScanLocationExecutor::new(h.bus.clone()));
        let token = CancellationToken::new();

        let e = exec.clone();
        let t = token.clone();
        let handle = tokio::spawn(async move { e.execute(&t, &ScanLocationInputs {}).await });
        settle().await;
        assert_eq!(h.bus.subscriber_count(topics::LOCATION_UPDATED), 1);
        token.cancel();

        assert!(handle.await.unwrap().unwrap_err().is_cancelled());
        assert_eq!(h.bus.subscriber_count(topics::LOCATION_UPDATED), 0);
    }
}
