//! Enforces per-plan limits before the engine admits new work, backed by
//! the `Plan`/`PlanLimits` table.

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::model::{Plan, PlanLimits};
use crate::store::StateStore;

/// A feature gated behind a plan's `PlanLimits` flags, checked at the API
/// boundary before an operation that exposes it (e.g. streaming runtime
/// logs on `Plan::Free`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    RuntimeLogs,
}

#[async_trait]
pub trait QuotaGate: Send + Sync + 'static {
    /// Checked before `CreateApp`: does `owner_id` have room for one more
    /// app under their plan?
    async fn check_app_creation(&self, owner_id: &str, plan: Plan) -> Result<()>;

    /// Checked before a gated operation is allowed.
    fn check_feature(&self, plan: Plan, feature: Feature) -> Result<()>;

    fn limits_for(&self, plan: Plan) -> PlanLimits;
}

pub struct StoreBackedQuotaGate<S: StateStore> {
    store: std::sync::Arc<S>,
    custom_limits: PlanLimits,
}

impl<S: StateStore> StoreBackedQuotaGate<S> {
    pub fn new(store: std::sync::Arc<S>, custom_limits: PlanLimits) -> Self {
        Self {
            store,
            custom_limits,
        }
    }
}

#[async_trait]
impl<S: StateStore> QuotaGate for StoreBackedQuotaGate<S> {
    async fn check_app_creation(&self, owner_id: &str, plan: Plan) -> Result<()> {
        let limits = self.limits_for(plan);
        let count = self.store.count_apps_by_owner(owner_id).await?;
        if count >= limits.max_apps {
            return Err(Error::Quota(format!(
                "plan {plan} allows at most {} apps, {owner_id} already has {count}",
                limits.max_apps
            )));
        }
        Ok(())
    }

    fn check_feature(&self, plan: Plan, feature: Feature) -> Result<()> {
        let limits = self.limits_for(plan);
        match feature {
            Feature::RuntimeLogs if !limits.runtime_logs => Err(Error::Quota(format!(
                "plan {plan} does not include runtime log access"
            ))),
            _ => Ok(()),
        }
    }

    fn limits_for(&self, plan: Plan) -> PlanLimits {
        match plan {
            Plan::Custom => self.custom_limits,
            other => other.limits(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use std::sync::Arc;

    async fn gate() -> StoreBackedQuotaGate<SqliteStore> {
        let store = Arc::new(SqliteStore::new_in_memory().await);
        StoreBackedQuotaGate::new(store, Plan::Custom.limits())
    }

    #[tokio::test]
    async fn free_plan_allows_exactly_one_app() {
        let gate = gate().await;
        gate.store
            .create_app("u1", "first", "first", "git://x", "main")
            .await
            .unwrap();
        let err = gate
            .check_app_creation("u1", Plan::Free)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Quota(_)));
    }

    #[tokio::test]
    async fn free_plan_allows_first_app() {
        let gate = gate().await;
        gate.check_app_creation("u1", Plan::Free).await.unwrap();
    }

    #[tokio::test]
    async fn free_plan_blocks_runtime_logs() {
        let gate = gate().await;
        assert!(gate.check_feature(Plan::Free, Feature::RuntimeLogs).is_err());
        assert!(gate.check_feature(Plan::Pro, Feature::RuntimeLogs).is_ok());
    }
}
