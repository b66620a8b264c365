//! Inbound callbacks from the workflow engine. Verification mirrors the
//! billing webhook: signature over the raw body, checked before parsing.

use std::sync::Arc;

use axum::{extract::State, http::HeaderMap, Json};
use chrono::Utc;
use diesel::prelude::*;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::core::errors::ApiError;
use crate::core::models::NewWorkflowExecution;
use crate::core::schema::workflow_executions;
use crate::core::state::AppState;
use crate::workflows::triggers::names;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowCallback {
    pub workflow_name: String,
    pub execution_id: Option<String>,
    pub status: Option<String>,
    pub organization_id: Option<Uuid>,
    pub input: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub document_id: Option<String>,
}

pub async fn workflow_callback(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<Value>, ApiError> {
    let signature = headers
        .get("x-n8n-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::SignatureInvalid)?;

    if !state.workflows.verify_callback_signature(signature, &body) {
        return Err(ApiError::SignatureInvalid);
    }

    let callback: WorkflowCallback = serde_json::from_str(&body)
        .map_err(|e| ApiError::BadRequest(format!("malformed callback payload: {e}")))?;

    // Every callback with a tenant becomes one audit row, whether or not the
    // workflow name has bespoke handling below.
    if let Some(organization_id) = callback.organization_id {
        let mut conn = state.conn.get()?;
        diesel::insert_into(workflow_executions::table)
            .values(NewWorkflowExecution {
                organization_id,
                workflow_name: callback.workflow_name.clone(),
                status: callback
                    .status
                    .clone()
                    .unwrap_or_else(|| "success".to_string()),
                input: callback.input.clone(),
                output: callback.result.clone(),
                error: callback.error.clone(),
                completed_at: Some(Utc::now()),
            })
            .execute(&mut conn)?;
    }

    match callback.workflow_name.as_str() {
        names::DOCUMENT_PROCESSING => {
            if let (Some(document_id), Some(_)) = (&callback.document_id, &callback.result) {
                tracing::info!("document processed: {document_id}");
            }
        }
        names::USAGE_THRESHOLD_REACHED => {
            tracing::info!(organization = ?callback.organization_id, "usage threshold reached");
        }
        other => {
            tracing::debug!("workflow completed: {other}");
        }
    }

    Ok(Json(json!({
        "success": true,
        "executionId": callback.execution_id,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_parses_camel_case_payload() {
        let org_id = Uuid::new_v4();
        let callback: WorkflowCallback = serde_json::from_value(json!({
            "workflowName": "document-processing",
            "executionId": "exec_9",
            "status": "success",
            "organizationId": org_id,
            "result": { "pages": 3 },
            "documentId": "doc_7",
        }))
        .unwrap();

        assert_eq!(callback.workflow_name, "document-processing");
        assert_eq!(callback.execution_id.as_deref(), Some("exec_9"));
        assert_eq!(callback.organization_id, Some(org_id));
        assert_eq!(callback.document_id.as_deref(), Some("doc_7"));
        assert!(callback.error.is_none());
    }

    #[test]
    fn callback_tolerates_minimal_payload() {
        let callback: WorkflowCallback =
            serde_json::from_value(json!({ "workflowName": "nightly-report" })).unwrap();
        assert!(callback.organization_id.is_none());
        assert!(callback.status.is_none());
    }
}
