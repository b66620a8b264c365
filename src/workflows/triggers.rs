//! Well-known workflow triggers. Everything here is fire-and-forget except
//! document processing, which callers await for its result.

use serde_json::json;
use uuid::Uuid;

use crate::billing::plans::Plan;
use crate::core::errors::ApiError;
use crate::workflows::client::{WorkflowClient, WorkflowResponse};

pub mod names {
    pub const USER_CREATED: &str = "user-created";
    pub const USER_UPDATED: &str = "user-updated";
    pub const ORGANIZATION_CREATED: &str = "organization-created";
    pub const PLAN_UPGRADED: &str = "plan-upgraded";
    pub const DOCUMENT_PROCESSING: &str = "document-processing";
    pub const USAGE_THRESHOLD_REACHED: &str = "usage-threshold-reached";
    pub const PAYMENT_SUCCEEDED: &str = "payment-succeeded";
    pub const PAYMENT_FAILED: &str = "payment-failed";
}

impl WorkflowClient {
    pub fn user_created(&self, user_id: Uuid, email: &str) {
        self.trigger_async(
            names::USER_CREATED,
            json!({ "userId": user_id, "email": email }),
        );
    }

    pub fn user_updated(&self, user_id: Uuid, changes: serde_json::Value) {
        self.trigger_async(
            names::USER_UPDATED,
            json!({ "userId": user_id, "changes": changes }),
        );
    }

    pub fn organization_created(&self, organization_id: Uuid, plan: Plan) {
        self.trigger_async(
            names::ORGANIZATION_CREATED,
            json!({ "orgId": organization_id, "plan": plan.as_str() }),
        );
    }

    pub fn plan_upgraded(&self, organization_id: Uuid, from: Plan, to: Plan) {
        self.trigger_async(
            names::PLAN_UPGRADED,
            json!({
                "orgId": organization_id,
                "fromPlan": from.as_str(),
                "toPlan": to.as_str(),
            }),
        );
    }

    pub fn usage_threshold_reached(&self, organization_id: Uuid, percentage: f64) {
        self.trigger_async(
            names::USAGE_THRESHOLD_REACHED,
            json!({ "orgId": organization_id, "percentage": percentage }),
        );
    }

    pub fn payment_succeeded(&self, organization_id: Uuid, amount_cents: i64, invoice_id: &str) {
        self.trigger_async(
            names::PAYMENT_SUCCEEDED,
            json!({
                "orgId": organization_id,
                "amount": amount_cents,
                "invoiceId": invoice_id,
            }),
        );
    }

    pub fn payment_failed(&self, organization_id: Uuid, reason: &str) {
        self.trigger_async(
            names::PAYMENT_FAILED,
            json!({ "orgId": organization_id, "reason": reason }),
        );
    }

    /// Document processing is awaited: the caller needs the execution id.
    pub async fn document_processing(
        &self,
        document_id: &str,
        organization_id: Uuid,
    ) -> Result<WorkflowResponse, ApiError> {
        self.trigger(
            names::DOCUMENT_PROCESSING,
            json!({
                "documentId": document_id,
                "organizationId": organization_id,
            }),
        )
        .await
    }
}
