use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::billing::plans::{CreditAllowance, Plan};
use crate::core::schema::{organizations, usage_events, users, workflow_executions};

/// Tenant row. `plan` and `usage_limit` are stored denormalized and must be
/// written together; `usage_limit = -1` means unlimited on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = organizations)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub plan: String,
    pub usage_limit: i64,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Organization {
    /// Stored plan name lifted into the typed enum. Unknown names fall back
    /// to free rather than failing the request.
    pub fn plan(&self) -> Plan {
        self.plan.parse().unwrap_or(Plan::Free)
    }

    pub fn allowance(&self) -> CreditAllowance {
        CreditAllowance::from_raw(self.usage_limit)
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = organizations)]
pub struct NewOrganization {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub plan: String,
    pub usage_limit: i64,
    pub metadata: serde_json::Value,
}

/// User row keyed by the identity provider's subject id.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: Uuid,
    pub organization_id: Option<Uuid>,
    pub role: String,
    pub email: String,
    pub full_name: Option<String>,
    pub avatar_url: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub id: Uuid,
    pub organization_id: Option<Uuid>,
    pub role: String,
    pub email: String,
    pub full_name: Option<String>,
}

/// Append-only credit-consumption record; never updated or deleted.
#[derive(Debug, Clone, Serialize, Queryable)]
#[diesel(table_name = usage_events)]
pub struct UsageEvent {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub user_id: Option<Uuid>,
    pub event_type: String,
    pub credits_used: i32,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = usage_events)]
pub struct NewUsageEvent {
    pub organization_id: Uuid,
    pub user_id: Option<Uuid>,
    pub event_type: String,
    pub credits_used: i32,
    pub metadata: serde_json::Value,
}

/// Audit row written by the workflow callback handler. Read-only trail,
/// never consulted for authorization.
#[derive(Debug, Clone, Serialize, Queryable)]
#[diesel(table_name = workflow_executions)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub workflow_name: String,
    pub status: String,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = workflow_executions)]
pub struct NewWorkflowExecution {
    pub organization_id: Uuid,
    pub workflow_name: String,
    pub status: String,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn org_with(plan: &str, usage_limit: i64) -> Organization {
        let now = Utc::now();
        Organization {
            id: Uuid::new_v4(),
            name: "Acme".to_string(),
            slug: "acme".to_string(),
            plan: plan.to_string(),
            usage_limit,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn plan_parses_stored_names() {
        assert_eq!(org_with("pro", 10_000).plan(), Plan::Pro);
        assert_eq!(org_with("enterprise", 50_000).plan(), Plan::Enterprise);
        assert_eq!(org_with("free", 1_000).plan(), Plan::Free);
    }

    #[test]
    fn unknown_plan_falls_back_to_free() {
        assert_eq!(org_with("platinum", 1_000).plan(), Plan::Free);
    }

    #[test]
    fn allowance_lifts_sentinel() {
        assert_eq!(org_with("pro", -1).allowance(), CreditAllowance::Unlimited);
        assert_eq!(
            org_with("pro", 10_000).allowance(),
            CreditAllowance::Limited(10_000)
        );
    }
}
