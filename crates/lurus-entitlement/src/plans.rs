//! Subscription plan catalog
//!
//! Plans come from the `SubscriptionPlans` option row (a JSON array) and
//! fall back to the built-in set when the row is absent or unreadable. The
//! parsed catalog is swapped wholesale on refresh, so readers never see a
//! half-updated list.

use std::collections::HashSet;
use std::sync::Arc;

use lurus_db::OptionRepository;
use lurus_types::{default_plans, SubscriptionPlan};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::EntitlementError;

/// Option row holding the catalog
pub const PLANS_OPTION_KEY: &str = "SubscriptionPlans";

pub struct PlanCatalog {
    options: Arc<dyn OptionRepository>,
    plans: RwLock<Arc<Vec<SubscriptionPlan>>>,
}

fn sorted(mut plans: Vec<SubscriptionPlan>) -> Vec<SubscriptionPlan> {
    plans.sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then_with(|| a.code.cmp(&b.code)));
    plans
}

/// Reject catalogs the state machine could not honour
pub fn validate_plans(plans: &[SubscriptionPlan]) -> Result<(), EntitlementError> {
    if plans.is_empty() {
        return Err(EntitlementError::Validation("at least one plan is required".into()));
    }
    let mut codes = HashSet::new();
    for plan in plans {
        if plan.code.trim().is_empty() {
            return Err(EntitlementError::Validation("plan code must not be empty".into()));
        }
        if !codes.insert(plan.code.as_str()) {
            return Err(EntitlementError::Validation(format!("duplicate plan code: {}", plan.code)));
        }
        if plan.days <= 0 {
            return Err(EntitlementError::Validation(format!(
                "plan {} must last at least one day",
                plan.code
            )));
        }
        if plan.price_cents < 0 || plan.daily_quota < 0 || plan.total_quota < 0 {
            return Err(EntitlementError::Validation(format!(
                "plan {} has a negative price or quota",
                plan.code
            )));
        }
    }
    Ok(())
}

impl PlanCatalog {
    /// Catalog holding the built-in plans until the first refresh
    pub fn new(options: Arc<dyn OptionRepository>) -> Self {
        Self {
            options,
            plans: RwLock::new(Arc::new(sorted(default_plans()))),
        }
    }

    /// Re-read the option row
    pub async fn refresh(&self) -> Result<(), EntitlementError> {
        let plans = match self.options.get(PLANS_OPTION_KEY).await? {
            None => default_plans(),
            Some(raw) => match serde_json::from_str::<Vec<SubscriptionPlan>>(&raw) {
                Ok(plans) if validate_plans(&plans).is_ok() => plans,
                Ok(_) | Err(_) => {
                    warn!(key = PLANS_OPTION_KEY, "Stored plan catalog is invalid, using built-in plans");
                    default_plans()
                }
            },
        };
        *self.plans.write().await = Arc::new(sorted(plans));
        Ok(())
    }

    /// Every plan, disabled ones included
    pub async fn all(&self) -> Arc<Vec<SubscriptionPlan>> {
        self.plans.read().await.clone()
    }

    /// Plans offered to customers
    pub async fn enabled(&self) -> Vec<SubscriptionPlan> {
        self.all().await.iter().filter(|p| p.enabled).cloned().collect()
    }

    pub async fn find(&self, code: &str) -> Option<SubscriptionPlan> {
        self.all().await.iter().find(|p| p.code == code).cloned()
    }

    /// A plan that can be bought
    pub async fn find_purchasable(&self, code: &str) -> Result<SubscriptionPlan, EntitlementError> {
        self.find(code)
            .await
            .filter(|p| p.enabled)
            .ok_or_else(|| EntitlementError::PlanNotFound(code.to_string()))
    }

    /// Persist a new catalog and serve it immediately
    pub async fn replace(&self, plans: Vec<SubscriptionPlan>) -> Result<Arc<Vec<SubscriptionPlan>>, EntitlementError> {
        validate_plans(&plans)?;
        let raw = serde_json::to_string(&plans).map_err(|e| EntitlementError::Internal(e.to_string()))?;
        self.options.set(PLANS_OPTION_KEY, &raw).await?;

        let plans = Arc::new(sorted(plans));
        *self.plans.write().await = plans.clone();
        info!(count = plans.len(), "Plan catalog replaced");
        Ok(plans)
    }
}
