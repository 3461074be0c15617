use crate::error::{ReconciliationError, Result};
use crate::hierarchy::MeterHierarchy;
use crate::schema::MeterRole;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceCheck {
    pub meter_id: String,
    /// What the parent meter itself recorded.
    pub supply: f64,
    /// Signed sum of everything metered below it.
    pub consumption: f64,
    /// `supply - consumption`: losses, common area, or unmetered load.
    pub unaccounted: f64,
    pub within_tolerance: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub checks: Vec<BalanceCheck>,
    pub warnings: Vec<String>,
}

impl VerificationResult {
    pub fn is_balanced(&self) -> bool {
        self.checks.iter().all(|c| c.within_tolerance)
    }
}

/// Compares every parent meter against the meters below it.
pub struct EnergyBalancer<'a> {
    hierarchy: &'a MeterHierarchy,
    tolerance: f64,
}

impl<'a> EnergyBalancer<'a> {
    /// `tolerance` is a fraction of the parent's supply.
    pub fn new(hierarchy: &'a MeterHierarchy, tolerance: f64) -> Self {
        Self {
            hierarchy,
            tolerance,
        }
    }

    pub fn check(&self, values: &BTreeMap<String, f64>) -> VerificationResult {
        let mut result = VerificationResult::default();

        for meter_id in self.supply_points(values) {
            let supply = values.get(meter_id).copied().unwrap_or(0.0);
            let consumption = self.hierarchy.hierarchical_total(meter_id, values);
            let unaccounted = supply - consumption;
            let within_tolerance = unaccounted.abs() <= self.tolerance * supply.abs();

            if !within_tolerance {
                result.warnings.push(format!(
                    "Meter {}: {:.2} kWh supplied but {:.2} kWh metered downstream ({:+.2} kWh unaccounted)",
                    meter_id, supply, consumption, unaccounted
                ));
            }

            result.checks.push(BalanceCheck {
                meter_id: meter_id.to_string(),
                supply,
                consumption,
                unaccounted,
                within_tolerance,
            });
        }

        result
    }

    pub fn verify(&self, values: &BTreeMap<String, f64>) -> Result<()> {
        let result = self.check(values);
        match result.checks.into_iter().find(|c| !c.within_tolerance) {
            Some(check) => Err(ReconciliationError::EnergyBalanceViolation {
                meter: check.meter_id,
                supply: check.supply,
                consumption: check.consumption,
                difference: check.unaccounted,
            }),
            None => Ok(()),
        }
    }

    /// Parents that carry a reading of their own. Grid supply meters come first.
    fn supply_points<'v>(&'v self, values: &BTreeMap<String, f64>) -> Vec<&'v str> {
        let mut points: Vec<&str> = self
            .hierarchy
            .meter_ids()
            .filter(|id| !self.hierarchy.is_leaf(id) && values.contains_key(*id))
            .collect();

        points.sort_by_key(|id| {
            (
                self.hierarchy.role(id) != MeterRole::GridSupply,
                self.hierarchy.depth(id),
            )
        });
        points
    }
}

pub fn check_energy_balance(
    hierarchy: &MeterHierarchy,
    values: &BTreeMap<String, f64>,
    tolerance: f64,
) -> VerificationResult {
    EnergyBalancer::new(hierarchy, tolerance).check(values)
}

pub fn verify_energy_balance(
    hierarchy: &MeterHierarchy,
    values: &BTreeMap<String, f64>,
    tolerance: f64,
) -> Result<()> {
    EnergyBalancer::new(hierarchy, tolerance).verify(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::MeterConnection;
    use crate::schema::{Meter, MeterType};

    fn meter(id: &str, meter_type: MeterType) -> Meter {
        Meter {
            id: id.to_string(),
            site_id: "s".to_string(),
            meter_number: id.to_string(),
            name: id.to_string(),
            meter_type,
            rating: None,
            tariff_structure_id: None,
        }
    }

    fn hierarchy() -> MeterHierarchy {
        let meters = vec![
            meter("bulk", MeterType::Bulk),
            meter("t1", MeterType::Tenant),
            meter("t2", MeterType::Tenant),
        ];
        let connections = vec![
            MeterConnection::new("t1", "bulk"),
            MeterConnection::new("t2", "bulk"),
        ];
        MeterHierarchy::from_connections(&meters, &connections).unwrap()
    }

    fn values(bulk: f64) -> BTreeMap<String, f64> {
        BTreeMap::from([
            ("bulk".to_string(), bulk),
            ("t1".to_string(), 400.0),
            ("t2".to_string(), 560.0),
        ])
    }

    #[test]
    fn test_balanced_within_tolerance() {
        let hierarchy = hierarchy();
        let result = check_energy_balance(&hierarchy, &values(1000.0), 0.05);

        assert!(result.is_balanced());
        assert_eq!(result.checks.len(), 1);
        assert!((result.checks[0].unaccounted - 40.0).abs() < 1e-9);
        assert!(verify_energy_balance(&hierarchy, &values(1000.0), 0.05).is_ok());
    }

    #[test]
    fn test_energy_balance_violation() {
        let hierarchy = hierarchy();
        let result = check_energy_balance(&hierarchy, &values(1200.0), 0.05);
        assert!(!result.is_balanced());
        assert_eq!(result.warnings.len(), 1);

        let err = verify_energy_balance(&hierarchy, &values(1200.0), 0.05);
        assert!(matches!(
            err,
            Err(ReconciliationError::EnergyBalanceViolation { .. })
        ));
    }

    #[test]
    fn test_parent_without_reading_is_skipped() {
        let hierarchy = hierarchy();
        let mut values = values(0.0);
        values.remove("bulk");
        assert!(check_energy_balance(&hierarchy, &values, 0.05).checks.is_empty());
    }
}
