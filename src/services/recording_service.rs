use crate::error::{Error, Result};
use crate::models::violation::ViolationType;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::json;
use uuid::Uuid;

/// Out-of-band proctoring evidence capture.
#[async_trait]
pub trait RecordingSink: Send + Sync {
    async fn notify_violation(
        &self,
        submission_id: Uuid,
        violation_type: ViolationType,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Release capture devices held for the session. Called exactly once on teardown.
    async fn release(&self, submission_id: Uuid) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct NoopRecordingSink;

#[async_trait]
impl RecordingSink for NoopRecordingSink {
    async fn notify_violation(&self, _: Uuid, _: ViolationType, _: DateTime<Utc>) -> Result<()> {
        Ok(())
    }

    async fn release(&self, _: Uuid) -> Result<()> {
        Ok(())
    }
}

/// Posts recording events to the capture service's webhook.
#[derive(Clone)]
pub struct WebhookRecordingSink {
    client: Client,
    target_url: String,
}

impl WebhookRecordingSink {
    pub fn new(client: Client, target_url: String) -> Self {
        Self { client, target_url }
    }

    async fn post(&self, payload: serde_json::Value) -> Result<()> {
        let resp = self
            .client
            .post(&self.target_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::Internal(format!("Recording webhook failed: {}", e)))?;
        if !resp.status().is_success() {
            return Err(Error::Internal(format!(
                "Recording webhook returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordingSink for WebhookRecordingSink {
    async fn notify_violation(
        &self,
        submission_id: Uuid,
        violation_type: ViolationType,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.post(json!({
            "event": "violation",
            "submission_id": submission_id,
            "type": violation_type,
            "timestamp": at.to_rfc3339(),
        }))
        .await
    }

    async fn release(&self, submission_id: Uuid) -> Result<()> {
        self.post(json!({
            "event": "release",
            "submission_id": submission_id,
        }))
        .await
    }
}
