use crate::error::{ReconciliationError, Result};
use crate::schema::*;
use crate::settings::CalculationSettings;
use chrono::Timelike;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostComponent {
    Energy,
    Fixed,
    Demand,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostLineItem {
    pub component: CostComponent,
    pub description: String,
    pub quantity: f64,
    pub rate: f64,
    pub amount: f64,
}

/// Outcome of pricing one meter's consumption. Failures are reported through
/// `has_error`/`error_message` rather than as an `Err`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostCalculation {
    pub tariff_name: String,
    pub season: Option<Season>,
    pub total_kwh: f64,
    pub max_kva: Option<f64>,
    pub energy_cost: f64,
    pub fixed_charges: f64,
    pub demand_charges: f64,
    pub total_cost: f64,
    pub line_items: Vec<CostLineItem>,
    pub has_error: bool,
    pub error_message: Option<String>,
}

impl CostCalculation {
    pub fn failed(tariff_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tariff_name: tariff_name.into(),
            season: None,
            total_kwh: 0.0,
            max_kva: None,
            energy_cost: 0.0,
            fixed_charges: 0.0,
            demand_charges: 0.0,
            total_cost: 0.0,
            line_items: Vec::new(),
            has_error: true,
            error_message: Some(message.into()),
        }
    }

    pub fn component_total(&self, component: CostComponent) -> f64 {
        self.line_items
            .iter()
            .filter(|l| l.component == component)
            .map(|l| l.amount)
            .sum()
    }
}

pub struct TariffCalculator<'a> {
    settings: &'a CalculationSettings,
}

impl<'a> TariffCalculator<'a> {
    pub fn new(settings: &'a CalculationSettings) -> Self {
        Self { settings }
    }

    pub fn calculate(
        &self,
        meter: &Meter,
        tariff: &TariffStructure,
        period: &BillingPeriod,
        total_kwh: f64,
        readings: &[MeterReading],
    ) -> CostCalculation {
        match self.try_calculate(meter, tariff, period, total_kwh, readings) {
            Ok(calculation) => calculation,
            Err(e) => {
                warn!(
                    "Cost calculation failed for meter {} on tariff '{}': {}",
                    meter.meter_number, tariff.name, e
                );
                CostCalculation::failed(tariff.name.clone(), e.to_string())
            }
        }
    }

    pub fn try_calculate(
        &self,
        meter: &Meter,
        tariff: &TariffStructure,
        period: &BillingPeriod,
        total_kwh: f64,
        readings: &[MeterReading],
    ) -> Result<CostCalculation> {
        if !total_kwh.is_finite() || total_kwh < 0.0 {
            return Err(ReconciliationError::ValidationError {
                subject: meter.meter_number.clone(),
                details: format!("Consumption must be a non-negative number, got {}", total_kwh),
            });
        }
        if period.end < period.start {
            return Err(ReconciliationError::DateError(format!(
                "Billing period {} is inverted",
                period
            )));
        }
        validate_tariff(tariff)?;

        let period_readings: Vec<&MeterReading> = readings
            .iter()
            .filter(|r| r.meter_id == meter.id && period.contains(r.timestamp))
            .collect();

        let season = Season::for_period(period, self.settings);
        let max_kva = period_readings
            .iter()
            .filter_map(|r| r.kva)
            .fold(None, |acc: Option<f64>, kva| Some(acc.map_or(kva, |m| m.max(kva))));

        debug!(
            "Pricing {:.2} kWh for meter {} on '{}' ({} season, {} interval readings)",
            total_kwh,
            meter.meter_number,
            tariff.name,
            season,
            period_readings.len()
        );

        let mut line_items = if tariff.uses_tou {
            self.time_of_use_energy(tariff, total_kwh, &period_readings)?
        } else {
            self.block_energy(tariff, season, total_kwh)?
        };

        line_items.extend(self.charge_lines(tariff, season, period, total_kwh, max_kva));

        let mut calculation = CostCalculation {
            tariff_name: tariff.name.clone(),
            season: Some(season),
            total_kwh,
            max_kva,
            energy_cost: 0.0,
            fixed_charges: 0.0,
            demand_charges: 0.0,
            total_cost: 0.0,
            line_items,
            has_error: false,
            error_message: None,
        };
        calculation.energy_cost = calculation.component_total(CostComponent::Energy);
        calculation.fixed_charges = calculation.component_total(CostComponent::Fixed);
        calculation.demand_charges = calculation.component_total(CostComponent::Demand);
        calculation.total_cost =
            calculation.energy_cost + calculation.fixed_charges + calculation.demand_charges;

        Ok(calculation)
    }

    fn block_energy(
        &self,
        tariff: &TariffStructure,
        season: Season,
        total_kwh: f64,
    ) -> Result<Vec<CostLineItem>> {
        let blocks: Vec<&TariffBlock> = tariff
            .blocks
            .iter()
            .filter(|b| b.season.map_or(true, |s| s == season))
            .collect();

        if !blocks.is_empty() {
            return Ok(apply_blocks(&blocks, total_kwh));
        }

        let flat: Vec<CostLineItem> = tariff
            .charges
            .iter()
            .filter(|c| {
                c.kind == ChargeKind::SeasonalEnergy
                    && c.unit == ChargeUnit::PerKwh
                    && c.applies_in(season)
            })
            .map(|c| CostLineItem {
                component: CostComponent::Energy,
                description: c
                    .description
                    .clone()
                    .unwrap_or_else(|| format!("Energy charge ({} season)", season)),
                quantity: total_kwh,
                rate: c.amount,
                amount: total_kwh * c.amount,
            })
            .collect();

        if flat.is_empty() {
            return Err(ReconciliationError::NoApplicableRate {
                tariff: tariff.name.clone(),
                season: season.to_string(),
            });
        }

        Ok(flat)
    }

    fn time_of_use_energy(
        &self,
        tariff: &TariffStructure,
        total_kwh: f64,
        readings: &[&MeterReading],
    ) -> Result<Vec<CostLineItem>> {
        if readings.is_empty() {
            if total_kwh == 0.0 {
                return Ok(Vec::new());
            }
            return Err(ReconciliationError::ValidationError {
                subject: tariff.name.clone(),
                details: "Time-of-use pricing requires interval readings for the period"
                    .to_string(),
            });
        }

        // (label, rate bits) -> (kWh, rate)
        let mut buckets: BTreeMap<(String, u64), (f64, f64)> = BTreeMap::new();
        let mut interval_kwh = 0.0;

        for reading in readings {
            let date = reading.timestamp.date();
            let season = Season::for_date(date, self.settings);
            let day_type = DayType::for_date(date);
            let hour = reading.timestamp.hour();

            let period = tariff
                .time_periods
                .iter()
                .find(|p| p.season == season && p.day_type == day_type && p.covers_hour(hour))
                .ok_or_else(|| ReconciliationError::UncoveredTimeOfUse {
                    tariff: tariff.name.clone(),
                    timestamp: reading.timestamp.to_string(),
                })?;

            let label = format!(
                "{} {:?} {}",
                period.label.as_deref().unwrap_or("energy"),
                period.day_type,
                season
            );
            let entry = buckets
                .entry((label, period.rate_per_kwh.to_bits()))
                .or_insert((0.0, period.rate_per_kwh));
            entry.0 += reading.kwh;
            interval_kwh += reading.kwh;
        }

        let scale = if interval_kwh > 0.0 {
            total_kwh / interval_kwh
        } else if total_kwh > 0.0 {
            return Err(ReconciliationError::ValidationError {
                subject: tariff.name.clone(),
                details: "Interval readings carry no consumption to apportion".to_string(),
            });
        } else {
            0.0
        };

        if (scale - 1.0).abs() > 1e-9 {
            debug!(
                "Scaling {:.2} interval kWh to billed {:.2} kWh on '{}'",
                interval_kwh, total_kwh, tariff.name
            );
        }

        Ok(buckets
            .into_iter()
            .map(|((label, _), (kwh, rate))| {
                let quantity = kwh * scale;
                CostLineItem {
                    component: CostComponent::Energy,
                    description: label,
                    quantity,
                    rate,
                    amount: quantity * rate,
                }
            })
            .collect())
    }

    fn charge_lines(
        &self,
        tariff: &TariffStructure,
        season: Season,
        period: &BillingPeriod,
        total_kwh: f64,
        max_kva: Option<f64>,
    ) -> Vec<CostLineItem> {
        let months = period.months(self.settings.average_month_days);
        let days = period.days() as f64;
        let mut lines = Vec::new();

        for charge in tariff.charges.iter().filter(|c| c.applies_in(season)) {
            let component = match (charge.kind, charge.unit) {
                (ChargeKind::SeasonalEnergy, _) => continue,
                (ChargeKind::Demand, _) | (_, ChargeUnit::PerKva) => CostComponent::Demand,
                (ChargeKind::Other, ChargeUnit::PerKwh) => CostComponent::Energy,
                _ => CostComponent::Fixed,
            };

            let quantity = match charge.unit {
                ChargeUnit::PerMonth => months,
                ChargeUnit::PerDay => days,
                ChargeUnit::PerKwh => total_kwh,
                ChargeUnit::PerKva => match max_kva {
                    Some(kva) => kva,
                    None => {
                        debug!(
                            "No kVA readings for demand charge on '{}'; charging zero",
                            tariff.name
                        );
                        0.0
                    }
                },
            };

            lines.push(CostLineItem {
                component,
                description: charge
                    .description
                    .clone()
                    .unwrap_or_else(|| format!("{:?} charge", charge.kind)),
                quantity,
                rate: charge.amount,
                amount: quantity * charge.amount,
            });
        }

        lines
    }
}

/// Bills `total_kwh` across consumption tiers in ascending `kwh_from` order.
/// Each closed block takes at most its width from what is left; gaps between
/// one block's `kwh_to` and the next block's `kwh_from` are not billed twice.
/// Consumption above a closed top block is billed at that block's rate.
pub fn apply_blocks(blocks: &[&TariffBlock], total_kwh: f64) -> Vec<CostLineItem> {
    let mut sorted: Vec<&TariffBlock> = blocks.to_vec();
    sorted.sort_by(|a, b| a.kwh_from.total_cmp(&b.kwh_from));

    let mut lines = Vec::new();
    let mut remaining = total_kwh.max(0.0);

    for block in &sorted {
        if remaining <= 0.0 {
            break;
        }
        let quantity = match block.kwh_to {
            Some(to) => remaining.min((to - block.kwh_from).max(0.0)),
            None => remaining,
        };
        if quantity <= 0.0 {
            continue;
        }
        remaining -= quantity;
        lines.push(CostLineItem {
            component: CostComponent::Energy,
            description: format!("Energy block {}", block.block_number),
            quantity,
            rate: block.rate_per_kwh,
            amount: quantity * block.rate_per_kwh,
        });
    }

    if remaining > 1e-9 {
        if let Some(top) = sorted.last() {
            warn!(
                "{:.2} kWh exceeds the top block; billing at block {} rate",
                remaining, top.block_number
            );
            lines.push(CostLineItem {
                component: CostComponent::Energy,
                description: format!("Energy block {} (excess)", top.block_number),
                quantity: remaining,
                rate: top.rate_per_kwh,
                amount: remaining * top.rate_per_kwh,
            });
        }
    }

    lines
}

fn validate_tariff(tariff: &TariffStructure) -> Result<()> {
    for block in &tariff.blocks {
        if let Some(to) = block.kwh_to {
            if to <= block.kwh_from {
                return Err(ReconciliationError::ValidationError {
                    subject: tariff.name.clone(),
                    details: format!(
                        "Block {} upper bound {} is not above its lower bound {}",
                        block.block_number, to, block.kwh_from
                    ),
                });
            }
        }
    }

    for period in &tariff.time_periods {
        if period.start_hour > 23 || period.end_hour > 24 {
            return Err(ReconciliationError::ValidationError {
                subject: tariff.name.clone(),
                details: format!(
                    "Time period {}..{} is outside the day",
                    period.start_hour, period.end_hour
                ),
            });
        }
    }

    Ok(())
}

pub fn calculate_meter_cost(
    meter: &Meter,
    tariff: &TariffStructure,
    period: &BillingPeriod,
    total_kwh: f64,
    readings: &[MeterReading],
    settings: &CalculationSettings,
) -> CostCalculation {
    TariffCalculator::new(settings).calculate(meter, tariff, period, total_kwh, readings)
}
