use crate::seasonality::PeriodSummary;
use crate::settings::CalculationSettings;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceBand {
    Match,
    Partial,
    Mismatch,
}

impl VarianceBand {
    /// Classifies with the default 5 % / 10 % bands.
    pub fn classify(variance_percentage: f64) -> Self {
        let defaults = CalculationSettings::default();
        Self::classify_with(variance_percentage, &defaults)
    }

    pub fn classify_with(variance_percentage: f64, settings: &CalculationSettings) -> Self {
        let magnitude = variance_percentage.abs();
        if magnitude <= settings.match_threshold_pct {
            VarianceBand::Match
        } else if magnitude <= settings.partial_threshold_pct {
            VarianceBand::Partial
        } else {
            VarianceBand::Mismatch
        }
    }
}

/// Variance of a calculated amount against the billed amount, as a percentage of the billed amount.
pub fn variance_percentage(calculated: f64, billed: f64) -> Option<f64> {
    if billed == 0.0 {
        None
    } else {
        Some((calculated - billed) / billed.abs() * 100.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discontinuity {
    pub from_period_end: NaiveDate,
    pub to_period_start: NaiveDate,
    pub current_reading: f64,
    pub previous_reading: f64,
    /// `previous_reading` of the later period minus `current_reading` of the earlier one.
    pub difference: f64,
}

/// Flags adjacent periods whose register readings do not join up.
/// Periods missing either register reading are skipped.
pub fn detect_discontinuities(periods: &[PeriodSummary], tolerance: f64) -> Vec<Discontinuity> {
    let mut sorted: Vec<&PeriodSummary> = periods.iter().collect();
    sorted.sort_by_key(|p| p.period.start);

    sorted
        .windows(2)
        .filter_map(|pair| {
            let (earlier, later) = (pair[0], pair[1]);
            let current = earlier.current_reading?;
            let previous = later.previous_reading?;
            let difference = previous - current;

            if difference.abs() > tolerance {
                Some(Discontinuity {
                    from_period_end: earlier.period.end,
                    to_period_start: later.period.start,
                    current_reading: current,
                    previous_reading: previous,
                    difference,
                })
            } else {
                None
            }
        })
        .collect()
}
