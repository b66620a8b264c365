//! Client for the external workflow engine.
//!
//! Two dispatch modes: `trigger` awaits the engine and surfaces failures as
//! `DispatchFailed`; `trigger_async` is fire-and-forget. The spawned task
//! owns the outcome and its only terminal action on failure is a log line,
//! so the initiating request can neither block nor fail on dispatch.

use std::time::Duration;

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use crate::core::errors::ApiError;

const DISPATCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct WorkflowResponse {
    pub execution_id: String,
    pub data: Value,
}

#[derive(Debug, Clone)]
pub struct WorkflowClient {
    base_url: String,
    api_key: String,
    webhook_secret: Option<String>,
    client: reqwest::Client,
}

type HmacSha256 = Hmac<Sha256>;

impl WorkflowClient {
    pub fn new(base_url: String, api_key: String, webhook_secret: Option<String>) -> Self {
        Self {
            base_url,
            api_key,
            webhook_secret,
            client: reqwest::Client::new(),
        }
    }

    /// Synchronous dispatch: await the engine, fail on non-2xx or network
    /// error. No retries here; callers decide.
    pub async fn trigger(
        &self,
        workflow_name: &str,
        payload: Value,
    ) -> Result<WorkflowResponse, ApiError> {
        let url = format!(
            "{}/webhook/{}",
            self.base_url.trim_end_matches('/'),
            workflow_name
        );

        let response = self
            .client
            .post(url)
            .timeout(DISPATCH_TIMEOUT)
            .header("X-N8N-API-KEY", &self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                tracing::error!("failed to reach workflow engine for {workflow_name}: {e}");
                ApiError::DispatchFailed(workflow_name.to_string())
            })?;

        if !response.status().is_success() {
            tracing::error!(
                "workflow {workflow_name} dispatch returned {}",
                response.status()
            );
            return Err(ApiError::DispatchFailed(workflow_name.to_string()));
        }

        let data: Value = response.json().await.unwrap_or(Value::Null);
        let execution_id = data
            .get("executionId")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();

        Ok(WorkflowResponse { execution_id, data })
    }

    /// Fire-and-forget dispatch on a detached task. Failures are logged and
    /// dropped; they never propagate to the caller's response.
    pub fn trigger_async(&self, workflow_name: &str, payload: Value) {
        let client = self.clone();
        let workflow_name = workflow_name.to_string();
        tokio::spawn(async move {
            if let Err(e) = client.trigger(&workflow_name, payload).await {
                tracing::error!("async workflow dispatch failed: {e}");
            }
        });
    }

    /// Constant-time HMAC-SHA256 check of an inbound callback signature
    /// (hex digest over the raw body). An unconfigured secret rejects
    /// everything rather than failing open.
    pub fn verify_callback_signature(&self, signature_hex: &str, body: &str) -> bool {
        let Some(secret) = &self.webhook_secret else {
            tracing::warn!("workflow callback rejected: webhook secret not configured");
            return false;
        };

        let Ok(signature) = hex::decode(signature_hex) else {
            return false;
        };

        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(body.as_bytes());
        mac.verify_slice(&signature).is_ok()
    }
}
