//! Plan catalog and entitlement resolution.
//!
//! Each plan has a canonical monthly credit allowance; the organization row
//! stores the allowance denormalized so the two must always be written
//! together. Storage keeps `-1` as the unlimited marker for compatibility
//! with existing rows; code lifts it into [`CreditAllowance`] at the
//! boundary.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Raw storage value meaning "no credit ceiling".
pub const UNLIMITED_SENTINEL: i64 = -1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Pro,
    Enterprise,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
            Self::Enterprise => "enterprise",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Free => "Free",
            Self::Pro => "Pro",
            Self::Enterprise => "Enterprise",
        }
    }

    /// Credits per billing period (calendar month, UTC).
    pub fn credit_allowance(&self) -> CreditAllowance {
        match self {
            Self::Free => CreditAllowance::Limited(1_000),
            Self::Pro => CreditAllowance::Limited(10_000),
            Self::Enterprise => CreditAllowance::Limited(50_000),
        }
    }

    pub fn monthly_price_cents(&self) -> i64 {
        match self {
            Self::Free => 0,
            Self::Pro => 2_900,
            Self::Enterprise => 9_900,
        }
    }

    pub fn features(&self) -> &'static [&'static str] {
        match self {
            Self::Free => &["1,000 credits/month", "Basic AI features", "Community support"],
            Self::Pro => &[
                "10,000 credits/month",
                "Advanced AI features",
                "Priority support",
                "Custom workflows",
            ],
            Self::Enterprise => &[
                "50,000 credits/month",
                "All AI features",
                "Dedicated support",
                "Custom integrations",
                "SLA guarantee",
            ],
        }
    }

    pub fn all() -> [Plan; 3] {
        [Self::Free, Self::Pro, Self::Enterprise]
    }
}

impl FromStr for Plan {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Self::Free),
            "pro" => Ok(Self::Pro),
            "enterprise" => Ok(Self::Enterprise),
            _ => Err(()),
        }
    }
}

/// Credit ceiling for a billing period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditAllowance {
    Limited(i64),
    Unlimited,
}

impl CreditAllowance {
    /// Lift the stored integer; any negative value is treated as the
    /// unlimited marker.
    pub fn from_raw(raw: i64) -> Self {
        if raw < 0 {
            Self::Unlimited
        } else {
            Self::Limited(raw)
        }
    }

    /// Storage/wire representation (`-1` for unlimited).
    pub fn as_raw(&self) -> i64 {
        match self {
            Self::Limited(n) => *n,
            Self::Unlimited => UNLIMITED_SENTINEL,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        matches!(self, Self::Unlimited)
    }
}

/// Stripe price id -> plan mapping from configuration. Unknown price ids
/// resolve to free so a misconfigured webhook can never grant entitlements.
#[derive(Debug, Clone)]
pub struct PriceMap {
    pro: String,
    enterprise: String,
}

impl PriceMap {
    pub fn new(pro: String, enterprise: String) -> Self {
        Self { pro, enterprise }
    }

    pub fn resolve(&self, price_id: &str) -> Plan {
        if price_id == self.pro {
            Plan::Pro
        } else if price_id == self.enterprise {
            Plan::Enterprise
        } else {
            Plan::Free
        }
    }

    pub fn price_id(&self, plan: Plan) -> Option<&str> {
        match plan {
            Plan::Free => None,
            Plan::Pro => Some(&self.pro),
            Plan::Enterprise => Some(&self.enterprise),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn price_map() -> PriceMap {
        PriceMap::new("price_pro_123".to_string(), "price_ent_456".to_string())
    }

    #[test]
    fn plan_round_trips_through_storage_names() {
        for plan in Plan::all() {
            assert_eq!(plan.as_str().parse::<Plan>().unwrap(), plan);
        }
        assert!("platinum".parse::<Plan>().is_err());
    }

    #[test]
    fn plan_serde_uses_lowercase() {
        assert_eq!(serde_json::to_string(&Plan::Pro).unwrap(), "\"pro\"");
        let plan: Plan = serde_json::from_str("\"enterprise\"").unwrap();
        assert_eq!(plan, Plan::Enterprise);
    }

    #[test]
    fn canonical_allowances() {
        assert_eq!(Plan::Free.credit_allowance(), CreditAllowance::Limited(1_000));
        assert_eq!(Plan::Pro.credit_allowance(), CreditAllowance::Limited(10_000));
        assert_eq!(
            Plan::Enterprise.credit_allowance(),
            CreditAllowance::Limited(50_000)
        );
    }

    #[test]
    fn allowance_sentinel_round_trip() {
        assert_eq!(CreditAllowance::from_raw(-1), CreditAllowance::Unlimited);
        assert_eq!(CreditAllowance::Unlimited.as_raw(), UNLIMITED_SENTINEL);
        assert_eq!(CreditAllowance::from_raw(500), CreditAllowance::Limited(500));
        assert_eq!(CreditAllowance::Limited(500).as_raw(), 500);
    }

    #[test]
    fn deep_negative_values_also_mean_unlimited() {
        assert!(CreditAllowance::from_raw(-42).is_unlimited());
    }

    #[test]
    fn price_map_resolves_configured_ids() {
        let map = price_map();
        assert_eq!(map.resolve("price_pro_123"), Plan::Pro);
        assert_eq!(map.resolve("price_ent_456"), Plan::Enterprise);
    }

    #[test]
    fn unknown_price_resolves_free() {
        assert_eq!(price_map().resolve("price_other"), Plan::Free);
    }

    #[test]
    fn price_ids_by_plan() {
        let map = price_map();
        assert_eq!(map.price_id(Plan::Free), None);
        assert_eq!(map.price_id(Plan::Pro), Some("price_pro_123"));
        assert_eq!(map.price_id(Plan::Enterprise), Some("price_ent_456"));
    }

    #[test]
    fn features_mention_credit_allowances() {
        for plan in Plan::all() {
            assert!(!plan.features().is_empty());
        }
        assert!(Plan::Free.features()[0].contains("1,000"));
    }
}
