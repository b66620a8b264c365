//! Usage ledger: monthly credit metering over the append-only
//! `usage_events` relation.
//!
//! The balance is derived, never stored: remaining = allowance minus the sum
//! of `credits_used` since UTC midnight on the first of the current month.
//! `check_usage_limit` is a pure read and `track_usage` an unconditional
//! append; the two are deliberately not transactional. Two concurrent
//! requests can both pass the check before either records, allowing a soft
//! overage bounded by one request's credits. An atomic conditional-insert
//! would close that race but also change what clients observe: requests
//! would start failing partway instead of landing.

use chrono::{DateTime, Datelike, Utc};
use diesel::dsl::sum;
use diesel::prelude::*;
use uuid::Uuid;

use crate::billing::plans::CreditAllowance;
use crate::core::errors::ApiError;
use crate::core::models::{NewUsageEvent, Organization};
use crate::core::schema::{organizations, usage_events};

/// UTC midnight on the first of the month containing `now`.
pub fn start_of_current_month(now: DateTime<Utc>) -> DateTime<Utc> {
    match now
        .date_naive()
        .with_day(1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
    {
        Some(dt) => DateTime::from_naive_utc_and_offset(dt, Utc),
        // Unreachable for any valid clock reading.
        None => now,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UsageCheck {
    pub allowed: bool,
    /// Floored at 0 for reporting; the raw signed remaining decides
    /// `allowed` internally.
    pub remaining: i64,
    pub limit: CreditAllowance,
}

/// Pure limit decision, separated from the store access for testability.
pub fn evaluate(limit: CreditAllowance, total_used: i64, credits_needed: i64) -> UsageCheck {
    match limit {
        CreditAllowance::Unlimited => UsageCheck {
            allowed: true,
            remaining: i64::MAX,
            limit,
        },
        CreditAllowance::Limited(cap) => {
            let raw_remaining = cap - total_used;
            UsageCheck {
                allowed: raw_remaining >= credits_needed,
                remaining: raw_remaining.max(0),
                limit,
            }
        }
    }
}

/// Sum of credits consumed by `organization_id` this billing period.
pub fn month_to_date(conn: &mut PgConnection, organization_id: Uuid) -> Result<i64, ApiError> {
    let period_start = start_of_current_month(Utc::now());
    let total: Option<i64> = usage_events::table
        .filter(usage_events::organization_id.eq(organization_id))
        .filter(usage_events::created_at.ge(period_start))
        .select(sum(usage_events::credits_used))
        .first(conn)?;
    Ok(total.unwrap_or(0))
}

/// Limit check for the caller's organization. Pure read, no side effects.
///
/// A missing organization is `NotFound`; callers must treat that as an
/// authorization failure, never as a zero limit.
pub fn check_usage_limit(
    conn: &mut PgConnection,
    organization_id: Uuid,
    credits_needed: i64,
) -> Result<UsageCheck, ApiError> {
    let org: Organization = organizations::table
        .find(organization_id)
        .first(conn)
        .optional()?
        .ok_or(ApiError::NotFound)?;

    let total_used = month_to_date(conn, organization_id)?;
    Ok(evaluate(org.allowance(), total_used, credits_needed))
}

/// Append one ledger entry. Never rejects on limit grounds; enforcement is
/// the caller's responsibility via [`check_usage_limit`].
pub fn track_usage(conn: &mut PgConnection, event: NewUsageEvent) -> Result<(), ApiError> {
    diesel::insert_into(usage_events::table)
        .values(&event)
        .execute(conn)?;
    Ok(())
}

/// Usage percentage after an insert of `credits_used`, given the remaining
/// balance observed before it. `None` for unlimited plans.
pub fn usage_percentage_after(
    limit: CreditAllowance,
    remaining_before: i64,
    credits_used: i64,
) -> Option<f64> {
    match limit {
        CreditAllowance::Unlimited => None,
        CreditAllowance::Limited(cap) if cap > 0 => {
            Some((cap - remaining_before + credits_used) as f64 / cap as f64 * 100.0)
        }
        CreditAllowance::Limited(_) => None,
    }
}

/// The notification band is [80, 100): at 100% the limit check already
/// blocks further usage, so there is nothing left to warn about.
pub fn crosses_threshold(percentage: f64) -> bool {
    (80.0..100.0).contains(&percentage)
}
