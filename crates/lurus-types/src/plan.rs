//! Subscription plan catalog types

use serde::{Deserialize, Serialize};

/// A purchasable subscription plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionPlan {
    /// Unique plan code (weekly/monthly/quarterly/yearly)
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Duration in days
    pub days: i64,
    pub price_cents: i64,
    pub currency: String,
    /// Daily cap applied to the user while active (0 = no cap)
    pub daily_quota: i64,
    /// One-off quota credited on activation (0 = none)
    pub total_quota: i64,
    pub base_group: String,
    pub fallback_group: String,
    pub enabled: bool,
    #[serde(default)]
    pub sort_order: i32,
}

impl SubscriptionPlan {
    #[allow(clippy::too_many_arguments)]
    fn builtin(
        code: &str,
        name: &str,
        description: &str,
        days: i64,
        price_cents: i64,
        daily_quota: i64,
        total_quota: i64,
        base_group: &str,
        fallback_group: &str,
        sort_order: i32,
    ) -> Self {
        Self {
            code: code.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            days,
            price_cents,
            currency: "CNY".to_string(),
            daily_quota,
            total_quota,
            base_group: base_group.to_string(),
            fallback_group: fallback_group.to_string(),
            enabled: true,
            sort_order,
        }
    }
}

/// Built-in plans used when no `SubscriptionPlans` option row exists
pub fn default_plans() -> Vec<SubscriptionPlan> {
    vec![
        SubscriptionPlan::builtin(
            "weekly",
            "Weekly Plan",
            "7-day membership for short-term use",
            7,
            1_990,
            500_000,
            5_000_000,
            "weekly",
            "free",
            1,
        ),
        SubscriptionPlan::builtin(
            "monthly",
            "Monthly Plan",
            "30-day membership, best value",
            30,
            5_990,
            1_000_000,
            50_000_000,
            "monthly",
            "weekly",
            2,
        ),
        SubscriptionPlan::builtin(
            "quarterly",
            "Quarterly Plan",
            "90-day membership for power users",
            90,
            14_990,
            2_000_000,
            200_000_000,
            "quarterly",
            "monthly",
            3,
        ),
        SubscriptionPlan::builtin(
            "yearly",
            "Yearly Plan",
            "365-day membership",
            365,
            49_990,
            5_000_000,
            0,
            "yearly",
            "quarterly",
            4,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sorted_and_enabled() {
        let plans = default_plans();
        assert_eq!(plans.len(), 4);
        assert!(plans.windows(2).all(|w| w[0].sort_order < w[1].sort_order));
        assert!(plans.iter().all(|p| p.enabled && p.days > 0));
    }

    #[test]
    fn monthly_plan_values() {
        let monthly = default_plans()
            .into_iter()
            .find(|p| p.code == "monthly")
            .unwrap();
        assert_eq!(monthly.days, 30);
        assert_eq!(monthly.price_cents, 5_990);
        assert_eq!(monthly.base_group, "monthly");
        assert_eq!(monthly.fallback_group, "weekly");
    }

    #[test]
    fn plans_parse_from_option_json() {
        let json = r#"[{"code":"pro","name":"Pro","days":30,"price_cents":9900,
            "currency":"CNY","daily_quota":1000,"total_quota":0,
            "base_group":"pro","fallback_group":"free","enabled":true}]"#;
        let plans: Vec<SubscriptionPlan> = serde_json::from_str(json).unwrap();
        assert_eq!(plans[0].code, "pro");
        assert_eq!(plans[0].sort_order, 0);
        assert!(plans[0].description.is_empty());
    }
}
