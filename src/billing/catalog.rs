use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use thiserror::Error;

use super::models::Plan;

pub const METRIC_SITES: &str = "sites";
pub const METRIC_FIXES: &str = "fixes";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read plan catalog: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse plan catalog: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("plan catalog is empty")]
    Empty,
    #[error("plan `{0}` is defined more than once")]
    DuplicatePlan(String),
    #[error("plan `{plan}` has a negative {field}")]
    Negative { plan: String, field: String },
}

/// key: billing-plan-catalog -> single declarative source of plan tiers
/// Shared by enforcement and the plans endpoint so displayed quotas cannot
/// drift from enforced ones.
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    plans: HashMap<String, Plan>,
}

impl PlanCatalog {
    pub fn new(plans: Vec<Plan>) -> Result<Self, CatalogError> {
        if plans.is_empty() {
            return Err(CatalogError::Empty);
        }
        let mut indexed = HashMap::with_capacity(plans.len());
        for plan in plans {
            if plan.amount_cents < 0 {
                return Err(CatalogError::Negative {
                    plan: plan.id,
                    field: "price".to_string(),
                });
            }
            if let Some((metric, _)) = plan
                .quotas
                .iter()
                .find(|(_, limit)| matches!(limit, Some(limit) if *limit < 0))
            {
                return Err(CatalogError::Negative {
                    field: format!("limit for `{metric}`"),
                    plan: plan.id,
                });
            }
            if indexed.contains_key(&plan.id) {
                return Err(CatalogError::DuplicatePlan(plan.id));
            }
            indexed.insert(plan.id.clone(), plan);
        }
        Ok(Self { plans: indexed })
    }

    pub fn from_json(raw: &str) -> Result<Self, CatalogError> {
        let plans: Vec<Plan> = serde_json::from_str(raw)?;
        Self::new(plans)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn get(&self, plan_id: &str) -> Option<&Plan> {
        self.plans.get(plan_id)
    }

    /// Plans ordered by price, then id.
    pub fn list(&self) -> Vec<Plan> {
        let mut plans: Vec<Plan> = self.plans.values().cloned().collect();
        plans.sort_by(|a, b| {
            a.amount_cents
                .cmp(&b.amount_cents)
                .then_with(|| a.id.cmp(&b.id))
        });
        plans
    }
}

impl Default for PlanCatalog {
    fn default() -> Self {
        let plans = vec![
            builtin("free", "Free", 0, &[(METRIC_SITES, Some(3)), (METRIC_FIXES, Some(500))]),
            builtin("pro", "Pro", 2_900, &[(METRIC_SITES, Some(10)), (METRIC_FIXES, Some(5_000))]),
            builtin("agency", "Agency", 9_900, &[(METRIC_SITES, None), (METRIC_FIXES, Some(50_000))]),
        ];
        let plans = plans
            .into_iter()
            .map(|plan| (plan.id.clone(), plan))
            .collect();
        Self { plans }
    }
}

fn builtin(id: &str, name: &str, amount_cents: i64, quotas: &[(&str, Option<i64>)]) -> Plan {
    Plan {
        id: id.to_string(),
        name: name.to_string(),
        amount_cents,
        currency: "usd".to_string(),
        quotas: quotas
            .iter()
            .map(|(metric, limit)| (metric.to_string(), *limit))
            .collect::<BTreeMap<_, _>>(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn builtin_catalog_lists_by_price() {
        let catalog = PlanCatalog::default();
        let ids: Vec<String> = catalog.list().into_iter().map(|plan| plan.id).collect();
        assert_eq!(ids, vec!["free", "pro", "agency"]);
        let free = catalog.get("free").expect("free plan");
        assert_eq!(free.limit_for(METRIC_SITES), Some(3));
        assert_eq!(free.limit_for(METRIC_FIXES), Some(500));
        assert!(catalog.get("enterprise").is_none());
    }

    #[test]
    fn loads_catalog_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"id": "starter", "name": "Starter", "amount_cents": 0, "quotas": {{"sites": 1}}}},
                {{"id": "scale", "name": "Scale", "amount_cents": 4900, "currency": "eur", "quotas": {{"sites": null}}}}
            ]"#
        )
        .unwrap();

        let catalog = PlanCatalog::from_path(file.path()).unwrap();
        let scale = catalog.get("scale").unwrap();
        assert_eq!(scale.currency, "eur");
        assert_eq!(scale.limit_for("sites"), None);
        assert_eq!(catalog.get("starter").unwrap().currency, "usd");
    }

    #[test]
    fn rejects_duplicate_and_negative_plans() {
        let duplicate = r#"[
            {"id": "free", "name": "Free", "amount_cents": 0},
            {"id": "free", "name": "Free again", "amount_cents": 0}
        ]"#;
        assert!(matches!(
            PlanCatalog::from_json(duplicate),
            Err(CatalogError::DuplicatePlan(id)) if id == "free"
        ));

        let negative = r#"[{"id": "odd", "name": "Odd", "amount_cents": 0, "quotas": {"sites": -1}}]"#;
        assert!(matches!(
            PlanCatalog::from_json(negative),
            Err(CatalogError::Negative { .. })
        ));

        assert!(matches!(PlanCatalog::from_json("[]"), Err(CatalogError::Empty)));
    }
}
