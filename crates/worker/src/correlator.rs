//! Message correlation: publish a handler's variables to a waiting catch-event.

use jobsync_core::{MessageSpec, Variables};
use jobsync_engine::{EngineClient, EngineError};
use std::sync::Arc;
use tracing::{error, info};

/// Publishes variable bundles as correlated messages.
///
/// One attempt per call; failures are logged and returned, never retried.
#[derive(Clone)]
pub struct MessageCorrelator {
    client: Arc<dyn EngineClient>,
}

impl MessageCorrelator {
    /// Create a correlator on top of an engine client.
    pub fn new(client: Arc<dyn EngineClient>) -> Self {
        Self { client }
    }

    /// Publish `variables` to the catch-event addressed by `spec`.
    pub async fn correlate(
        &self,
        spec: &MessageSpec,
        variables: Variables,
    ) -> Result<(), EngineError> {
        match self.client.publish_message(spec, variables).await {
            Ok(()) => {
                info!(
                    message = %spec.name,
                    correlation_key = %spec.correlation_key,
                    "Sent message"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    message = %spec.name,
                    correlation_key = %spec.correlation_key,
                    "Failed to publish message: {}",
                    e
                );
                Err(e)
            }
        }
    }
}
