//! Identity resolution and tenant signup.
//!
//! Credential verification lives in the external identity provider; the
//! fronting proxy installs the verified subject id in the `x-user-id`
//! header. This module resolves that subject against the tenant store and
//! exposes the result as a typed extractor, so every downstream query is
//! parameterized by the caller's own organization.

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, State},
    http::request::Parts,
    Json,
};
use diesel::prelude::*;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::billing::plans::Plan;
use crate::core::errors::ApiError;
use crate::core::models::{NewOrganization, NewUser, Organization, User};
use crate::core::schema::{organizations, users};
use crate::core::state::AppState;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Admin,
    Member,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Admin => "admin",
            Self::Member => "member",
        }
    }
}

impl FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(Self::Owner),
            "admin" => Ok(Self::Admin),
            "member" => Ok(Self::Member),
            _ => Err(()),
        }
    }
}

/// Resolved caller: user row, owning organization, and role within it.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user: User,
    pub organization: Organization,
    pub role: Role,
}

impl FromRequestParts<Arc<AppState>> for AuthContext {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let subject = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v).ok())
            .ok_or(ApiError::Unauthorized)?;

        let mut conn = state.conn.get()?;
        load_context(&mut conn, subject)
    }
}

/// Look up the caller and their organization. Any gap in the chain is a
/// uniform `Unauthorized`; the response must not reveal which part failed.
pub fn load_context(conn: &mut PgConnection, subject: Uuid) -> Result<AuthContext, ApiError> {
    let user: User = users::table
        .find(subject)
        .first(conn)
        .optional()?
        .ok_or(ApiError::Unauthorized)?;

    let organization_id = user.organization_id.ok_or(ApiError::Unauthorized)?;

    let organization: Organization = organizations::table
        .find(organization_id)
        .first(conn)
        .optional()?
        .ok_or(ApiError::Unauthorized)?;

    let role = user.role.parse().map_err(|_| ApiError::Unauthorized)?;

    Ok(AuthContext {
        user,
        organization,
        role,
    })
}

pub fn require_role(ctx: &AuthContext, allowed: &[Role]) -> Result<(), ApiError> {
    if allowed.contains(&ctx.role) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    /// Subject id issued by the identity provider at account creation.
    pub user_id: Uuid,
    pub email: String,
    pub full_name: Option<String>,
    pub organization_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SignupResponse {
    pub success: bool,
    pub user: User,
    pub organization: Option<Organization>,
}

/// Create the tenant for a freshly registered user: an organization on the
/// free plan and the user as its owner. Organization creation failure is
/// tolerated: the user record still lands and the org can be attached
/// later.
pub async fn signup(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SignupRequest>,
) -> Result<Json<SignupResponse>, ApiError> {
    let email = req.email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(ApiError::BadRequest("Valid email required".to_string()));
    }

    let org_name = req.organization_name.clone().unwrap_or_else(|| {
        match &req.full_name {
            Some(name) if !name.trim().is_empty() => format!("{name}'s Organization"),
            _ => "My Organization".to_string(),
        }
    });

    let mut conn = state.conn.get()?;

    let organization = create_organization(&mut conn, &org_name, &email)
        .map_err(|e| {
            tracing::error!("failed to create organization during signup: {e}");
            e
        })
        .ok();

    let user = NewUser {
        id: req.user_id,
        organization_id: organization.as_ref().map(|o| o.id),
        role: Role::Owner.as_str().to_string(),
        email: email.clone(),
        full_name: req.full_name.clone(),
    };

    let user: User = diesel::insert_into(users::table)
        .values(&user)
        .get_result(&mut conn)?;

    if let Some(org) = &organization {
        state.workflows.user_created(user.id, &email);
        state.workflows.organization_created(org.id, Plan::Free);
    }

    Ok(Json(SignupResponse {
        success: true,
        user,
        organization,
    }))
}

fn create_organization(
    conn: &mut PgConnection,
    name: &str,
    email: &str,
) -> Result<Organization, ApiError> {
    let plan = Plan::Free;
    let org = NewOrganization {
        id: Uuid::new_v4(),
        name: name.to_string(),
        slug: unique_slug(email),
        plan: plan.as_str().to_string(),
        usage_limit: plan.credit_allowance().as_raw(),
        metadata: serde_json::json!({}),
    };

    Ok(diesel::insert_into(organizations::table)
        .values(&org)
        .get_result(conn)?)
}

/// Slug from the email local part plus a random suffix to dodge collisions.
fn unique_slug(email: &str) -> String {
    let local = email.split('@').next().unwrap_or(email);
    let suffix: u32 = rand::thread_rng().gen_range(100_000..1_000_000);
    format!("{}-{}", slugify(local), suffix)
}

fn slugify(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c
            } else if c.is_whitespace() || c == '-' || c == '_' || c == '.' || c == '+' {
                '-'
            } else {
                '\0'
            }
        })
        .filter(|c| *c != '\0')
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips() {
        for role in [Role::Owner, Role::Admin, Role::Member] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("superuser".parse::<Role>().is_err());
    }

    #[test]
    fn require_role_checks_membership() {
        let now = chrono::Utc::now();
        let org = Organization {
            id: Uuid::new_v4(),
            name: "Acme".to_string(),
            slug: "acme-1".to_string(),
            plan: "free".to_string(),
            usage_limit: 1_000,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        };
        let user = User {
            id: Uuid::new_v4(),
            organization_id: Some(org.id),
            role: "member".to_string(),
            email: "m@acme.io".to_string(),
            full_name: None,
            avatar_url: None,
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        };
        let ctx = AuthContext {
            user,
            organization: org,
            role: Role::Member,
        };

        assert!(require_role(&ctx, &[Role::Member]).is_ok());
        assert!(matches!(
            require_role(&ctx, &[Role::Owner, Role::Admin]),
            Err(ApiError::Unauthorized)
        ));
    }

    #[test]
    fn slugify_normalizes_local_parts() {
        assert_eq!(slugify("Jane.Doe"), "jane-doe");
        assert_eq!(slugify("dev+test"), "dev-test");
        assert_eq!(slugify("  Acme   Corp "), "acme-corp");
        assert_eq!(slugify("héllo!"), "héllo");
    }

    #[test]
    fn unique_slug_embeds_local_part() {
        let slug = unique_slug("jane.doe@example.com");
        assert!(slug.starts_with("jane-doe-"));
        let suffix = slug.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_digit()));
    }
}
