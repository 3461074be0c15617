use crate::error::{ReconciliationError, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Tunables shared by cost calculation, variance classification and data-quality checks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(default)]
pub struct CalculationSettings {
    #[schemars(description = "Largest absolute variance percentage still classified as a match")]
    pub match_threshold_pct: f64,

    #[schemars(description = "Largest absolute variance percentage classified as a partial match; anything above is a mismatch")]
    pub partial_threshold_pct: f64,

    #[schemars(description = "Calendar months (1-12) billed at high-demand (winter) rates")]
    pub winter_months: Vec<u32>,

    #[schemars(description = "Allowed kWh gap between one period's closing register and the next period's opening register")]
    pub discontinuity_tolerance_kwh: f64,

    #[schemars(description = "Allowed difference between supply and downstream consumption, as a fraction of supply")]
    pub energy_balance_tolerance: f64,

    #[schemars(description = "Average length of a month in days, used to pro-rate monthly charges")]
    pub average_month_days: f64,
}

impl Default for CalculationSettings {
    fn default() -> Self {
        Self {
            match_threshold_pct: 5.0,
            partial_threshold_pct: 10.0,
            winter_months: vec![6, 7, 8],
            discontinuity_tolerance_kwh: 0.01,
            energy_balance_tolerance: 0.05,
            average_month_days: 365.25 / 12.0,
        }
    }
}

impl CalculationSettings {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.match_threshold_pct < 0.0 || self.partial_threshold_pct < 0.0 {
            return Err(ReconciliationError::InvalidSettings(
                "Variance thresholds must be non-negative".to_string(),
            ));
        }

        if self.match_threshold_pct > self.partial_threshold_pct {
            return Err(ReconciliationError::InvalidSettings(format!(
                "Match threshold ({}) exceeds partial threshold ({})",
                self.match_threshold_pct, self.partial_threshold_pct
            )));
        }

        if let Some(month) = self.winter_months.iter().find(|m| !(1..=12).contains(*m)) {
            return Err(ReconciliationError::InvalidSettings(format!(
                "Winter month {} must be between 1 and 12",
                month
            )));
        }

        if self.discontinuity_tolerance_kwh < 0.0 {
            return Err(ReconciliationError::InvalidSettings(
                "Discontinuity tolerance must be non-negative".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.energy_balance_tolerance) {
            return Err(ReconciliationError::InvalidSettings(format!(
                "Energy balance tolerance {} must be between 0.0 and 1.0",
                self.energy_balance_tolerance
            )));
        }

        if self.average_month_days <= 0.0 {
            return Err(ReconciliationError::InvalidSettings(
                "Average month length must be positive".to_string(),
            ));
        }

        Ok(())
    }

    pub fn schema_as_json() -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&schemars::schema_for!(CalculationSettings))
    }
}
