//! Webhook output: posts each alert event as JSON to a fixed URL.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::models::AlertEvent;
use crate::output::{Output, OutputError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WebhookOutput {
    name: String,
    url: String,
    client: Client,
}

impl WebhookOutput {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Result<Self, OutputError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent("alertmgr/0.1")
            .build()
            .map_err(|e| OutputError(format!("cannot build http client: {e}")))?;
        Ok(WebhookOutput {
            name: name.into(),
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl Output for WebhookOutput {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, event: &AlertEvent) -> Result<(), OutputError> {
        let response = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .map_err(|e| OutputError(format!("post to {} failed: {e}", self.url)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(OutputError(format!("{} returned {status}", self.url)));
        }
        debug!(
            "delivered {} event for alert {} to {}",
            event.event_type, event.alert.name, self.name
        );
        Ok(())
    }
}
