use crate::balance::EnergyBalancer;
use crate::corrections::DataQualityCorrections;
use crate::error::{ReconciliationError, Result};
use crate::hierarchy::MeterHierarchy;
use crate::ingestion::sum_period_kwh;
use crate::register::MeterRegister;
use crate::schema::*;
use crate::settings::CalculationSettings;
use crate::store::ReconciliationStore;
use crate::tariff::{calculate_meter_cost, CostCalculation};
use crate::utils::round_currency;
use crate::variance::{variance_percentage, VarianceBand};
use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation, polled between items of a batch.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub item: String,
    pub message: String,
}

/// Settled results of a batch: every item is attempted unless cancelled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: bool,
    pub failures: Vec<BatchFailure>,
}

impl BatchOutcome {
    fn record_failure(&mut self, item: &str, message: String) {
        self.failed += 1;
        self.failures.push(BatchFailure {
            item: item.to_string(),
            message,
        });
    }

    pub fn attempted(&self) -> usize {
        self.succeeded + self.failed
    }
}

/// Prices a meter over a bill's period and compares the result with the billed total.
///
/// Consumption comes from the bill's grid energy lines for the meter when the
/// extractor found any, otherwise from the meter's readings in the period.
pub fn compare_document(
    extraction: &DocumentExtraction,
    meter: &Meter,
    tariff: &TariffStructure,
    readings: &[MeterReading],
    settings: &CalculationSettings,
) -> DocumentTariffCalculation {
    let billed = extraction.total_amount;

    let (total_kwh, cost) = match extraction.period() {
        Ok(period) => {
            let kwh = extraction
                .billed_kwh(Some(meter.meter_number.as_str()))
                .unwrap_or_else(|| sum_period_kwh(readings, &meter.id, &period));
            let cost = calculate_meter_cost(meter, tariff, &period, kwh, readings, settings);
            (kwh, cost)
        }
        Err(e) => (0.0, CostCalculation::failed(tariff.name.clone(), e.to_string())),
    };

    let (variance_amount, variance_pct) = if cost.has_error {
        (0.0, None)
    } else {
        (
            round_currency(cost.total_cost - billed),
            variance_percentage(cost.total_cost, billed),
        )
    };

    if let Some(pct) = variance_pct {
        debug!(
            "Document {} meter {}: calculated {:.2} vs billed {:.2} ({:+.2}%, {:?})",
            extraction.document_id,
            meter.meter_number,
            cost.total_cost,
            billed,
            pct,
            VarianceBand::classify_with(pct, settings)
        );
    }

    DocumentTariffCalculation {
        document_id: extraction.document_id.clone(),
        meter_id: meter.id.clone(),
        tariff_structure_id: tariff.id.clone(),
        tariff_name: cost.tariff_name,
        total_kwh,
        energy_cost: round_currency(cost.energy_cost),
        fixed_charges: round_currency(cost.fixed_charges),
        demand_charges: round_currency(cost.demand_charges),
        total_cost: round_currency(cost.total_cost),
        document_billed_amount: billed,
        variance_amount,
        variance_percentage: variance_pct,
        has_error: cost.has_error,
        error_message: cost.error_message,
        calculated_at: Utc::now(),
    }
}

/// One document/meter pairing for bulk calculation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentJob {
    pub extraction: DocumentExtraction,
    pub meter_id: String,
    /// Falls back to the meter's assigned tariff.
    #[serde(default)]
    pub tariff_structure_id: Option<String>,
}

impl DocumentJob {
    fn label(&self) -> String {
        format!("{}/{}", self.extraction.document_id, self.meter_id)
    }
}

fn resolve_job<S: ReconciliationStore>(
    store: &S,
    job: &DocumentJob,
) -> Result<(Meter, TariffStructure, Vec<MeterReading>)> {
    let meter = store.meter(&job.meter_id)?;
    let tariff_id = job
        .tariff_structure_id
        .clone()
        .or_else(|| meter.tariff_structure_id.clone())
        .ok_or_else(|| ReconciliationError::NoTariffAssigned(meter.meter_number.clone()))?;
    let tariff = store.tariff(&tariff_id)?;
    let period = job.extraction.period()?;
    let readings = store.readings(&meter.id, &period)?;
    Ok((meter, tariff, readings))
}

/// Calculates and stores every job in turn, checking `cancel` before each one.
/// Calculations that come back with an error are still stored and counted as failures.
pub fn calculate_documents<S: ReconciliationStore>(
    store: &mut S,
    jobs: &[DocumentJob],
    settings: &CalculationSettings,
    cancel: &CancellationFlag,
) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();
    info!("Calculating {} document/meter pairs", jobs.len());

    for job in jobs {
        if cancel.is_cancelled() {
            info!(
                "Document calculation cancelled after {} of {} jobs",
                outcome.attempted(),
                jobs.len()
            );
            outcome.cancelled = true;
            break;
        }

        let (meter, tariff, readings) = match resolve_job(store, job) {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!("Skipping {}: {}", job.label(), e);
                outcome.record_failure(&job.label(), e.to_string());
                continue;
            }
        };

        let calculation = compare_document(&job.extraction, &meter, &tariff, &readings, settings);
        let calc_error = calculation.error_message.clone();

        if let Err(e) = store.upsert_calculation(calculation) {
            warn!("Failed to store {}: {}", job.label(), e);
            outcome.record_failure(&job.label(), e.to_string());
            continue;
        }

        match calc_error {
            Some(message) => outcome.record_failure(&job.label(), message),
            None => outcome.succeeded += 1,
        }
    }

    info!(
        "Document calculation finished: {} succeeded, {} failed",
        outcome.succeeded, outcome.failed
    );
    outcome
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TariffAssignment {
    pub meter_id: String,
    pub tariff_structure_id: Option<String>,
}

/// Saves every assignment, reporting how many succeeded and failed.
pub fn assign_tariffs<S: ReconciliationStore>(
    store: &mut S,
    assignments: &[TariffAssignment],
) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();

    for assignment in assignments {
        match store.assign_tariff(
            &assignment.meter_id,
            assignment.tariff_structure_id.as_deref(),
        ) {
            Ok(()) => outcome.succeeded += 1,
            Err(e) => {
                warn!("Tariff assignment for {} failed: {}", assignment.meter_id, e);
                outcome.record_failure(&assignment.meter_id, e.to_string());
            }
        }
    }

    info!(
        "Saved {} tariff assignments ({} failed)",
        outcome.succeeded, outcome.failed
    );
    outcome
}

/// The role a meter plays in a run: its assigned role, or one implied by its type.
pub fn effective_role(meter: &Meter, roles: &BTreeMap<String, MeterRole>) -> MeterRole {
    match roles.get(&meter.id) {
        Some(role) if *role != MeterRole::Unassigned => *role,
        _ => match meter.meter_type {
            MeterType::Bulk => MeterRole::GridSupply,
            MeterType::Solar => MeterRole::SolarEnergy,
            MeterType::Tenant => MeterRole::TenantMeter,
            MeterType::Council => MeterRole::CheckMeter,
            MeterType::Other => MeterRole::Unassigned,
        },
    }
}

pub fn summarize(results: &[ReconciliationMeterResult]) -> RunSummary {
    let total_for = |role: MeterRole| -> f64 {
        results
            .iter()
            .filter(|r| r.role == role)
            .map(|r| r.direct_kwh)
            .sum()
    };
    let cost_for = |role: MeterRole| -> f64 {
        results
            .iter()
            .filter(|r| r.role == role)
            .map(|r| r.total_cost)
            .sum()
    };

    let grid_supply_kwh = total_for(MeterRole::GridSupply);
    let solar_kwh = total_for(MeterRole::SolarEnergy);
    let total_supply_kwh = grid_supply_kwh + solar_kwh;
    let tenant_kwh = total_for(MeterRole::TenantMeter);
    let common_area_kwh = total_for(MeterRole::CommonArea);

    RunSummary {
        grid_supply_kwh,
        solar_kwh,
        total_supply_kwh,
        tenant_kwh,
        common_area_kwh,
        discrepancy_kwh: total_supply_kwh - tenant_kwh - common_area_kwh,
        recovery_rate: if total_supply_kwh > 0.0 {
            Some(tenant_kwh / total_supply_kwh * 100.0)
        } else {
            None
        },
        grid_supply_cost: round_currency(cost_for(MeterRole::GridSupply)),
        tenant_revenue: round_currency(cost_for(MeterRole::TenantMeter)),
        meters_with_errors: results.iter().filter(|r| r.has_error).count(),
    }
}

/// Runs a named reconciliation pass for one site and stores it.
pub struct ReconciliationRunner<'a, S: ReconciliationStore> {
    store: &'a mut S,
    settings: &'a CalculationSettings,
    corrections: DataQualityCorrections,
    cancel: CancellationFlag,
    strict_balance: bool,
}

impl<'a, S: ReconciliationStore> ReconciliationRunner<'a, S> {
    pub fn new(store: &'a mut S, settings: &'a CalculationSettings) -> Self {
        Self {
            store,
            settings,
            corrections: DataQualityCorrections::default(),
            cancel: CancellationFlag::new(),
            strict_balance: false,
        }
    }

    pub fn with_corrections(mut self, corrections: DataQualityCorrections) -> Self {
        self.corrections = corrections;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Fail the run, without saving it, when any parent meter is out of balance
    /// by more than `energy_balance_tolerance`.
    pub fn with_strict_balance(mut self) -> Self {
        self.strict_balance = true;
        self
    }

    pub fn run(&mut self, site_id: &str, name: &str, period: BillingPeriod) -> Result<ReconciliationRun> {
        let meters = self.store.meters_for_site(site_id)?;
        if meters.is_empty() {
            return Err(ReconciliationError::ValidationError {
                subject: site_id.to_string(),
                details: "Site has no meters".to_string(),
            });
        }

        info!(
            "Starting reconciliation '{}' for site {} over {} ({} meters)",
            name,
            site_id,
            period,
            meters.len()
        );

        let roles = self.store.roles_for_site(site_id)?;
        let connections = self.store.connections_for_site(site_id)?;
        let hierarchy = MeterHierarchy::from_connections(&meters, &connections)?.with_roles(roles.clone());

        let mut warnings = Vec::new();
        let register = MeterRegister::from_meters(site_id, &meters);
        for entry in register.without_tariff() {
            debug!("Meter {} has no tariff and will not be costed", entry.meter_number);
        }

        let mut raw_readings = Vec::new();
        for meter in &meters {
            raw_readings.extend(self.store.readings(&meter.id, &period)?);
        }

        let corrected = self.corrections.apply(&raw_readings);
        if !self.corrections.is_empty() {
            info!(
                "Applied {} corrections; {} meters adjusted, {} excluded",
                self.corrections.corrections.len(),
                corrected.adjustments.len(),
                corrected.excluded_meters.len()
            );
        }

        let mut raw_totals: BTreeMap<String, f64> = BTreeMap::new();
        for reading in &raw_readings {
            if corrected.excluded_meters.contains(&reading.meter_id) {
                continue;
            }
            *raw_totals.entry(reading.meter_id.clone()).or_default() += reading.kwh;
        }

        let nodes = hierarchy.aggregate(&raw_totals, &corrected.adjustments);

        let corrected_totals: BTreeMap<String, f64> = nodes
            .iter()
            .filter(|(id, _)| raw_totals.contains_key(*id) || corrected.adjustments.contains_key(*id))
            .map(|(id, node)| (id.clone(), node.direct_total))
            .collect();

        let balancer = EnergyBalancer::new(&hierarchy, self.settings.energy_balance_tolerance);
        if self.strict_balance {
            balancer.verify(&corrected_totals)?;
            info!("Energy balance verified for site {}", site_id);
        }
        let balance = balancer.check(&corrected_totals);
        for warning in &balance.warnings {
            warn!("{}", warning);
        }
        warnings.extend(balance.warnings);

        let mut results = Vec::with_capacity(meters.len());
        for (completed, meter) in meters.iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!("Reconciliation '{}' cancelled", name);
                return Err(ReconciliationError::Cancelled {
                    completed,
                    total: meters.len(),
                });
            }

            if corrected.excluded_meters.contains(&meter.id) {
                debug!("Meter {} excluded from this run", meter.meter_number);
                continue;
            }

            let node = nodes.get(&meter.id);
            let direct_kwh = node.map_or(0.0, |n| n.direct_total);
            let hierarchical_kwh = node.map_or(direct_kwh, |n| n.hierarchical_total);
            let corrections_kwh = node.map_or(0.0, |n| n.corrections);

            let cost = self.cost_meter(meter, &period, direct_kwh, &corrected.readings);
            if let Some(message) = cost.as_ref().and_then(|c| c.error_message.as_ref()) {
                warnings.push(format!("Meter {}: {}", meter.meter_number, message));
            }

            results.push(ReconciliationMeterResult {
                meter_id: meter.id.clone(),
                meter_number: meter.meter_number.clone(),
                role: effective_role(meter, &roles),
                direct_kwh,
                hierarchical_kwh,
                corrections_kwh,
                max_kva: cost.as_ref().and_then(|c| c.max_kva),
                tariff_name: cost.as_ref().map(|c| c.tariff_name.clone()),
                energy_cost: cost.as_ref().map_or(0.0, |c| round_currency(c.energy_cost)),
                fixed_charges: cost.as_ref().map_or(0.0, |c| round_currency(c.fixed_charges)),
                demand_charges: cost.as_ref().map_or(0.0, |c| round_currency(c.demand_charges)),
                total_cost: cost.as_ref().map_or(0.0, |c| round_currency(c.total_cost)),
                has_error: cost.as_ref().map_or(false, |c| c.has_error),
                error_message: cost.and_then(|c| c.error_message),
            });
        }

        let summary = summarize(&results);
        let created_at = Utc::now();
        let run = ReconciliationRun {
            id: format!("{}-{}-{}", site_id, period.start, created_at.timestamp_millis()),
            site_id: site_id.to_string(),
            name: name.to_string(),
            period,
            created_at,
            results,
            summary,
            warnings,
        };

        self.store.save_run(run.clone())?;
        info!(
            "Reconciliation '{}' complete: supply {:.2} kWh, tenants {:.2} kWh, {} meters with errors",
            name,
            run.summary.total_supply_kwh,
            run.summary.tenant_kwh,
            run.summary.meters_with_errors
        );

        Ok(run)
    }

    /// `None` when the meter has no tariff; lookup failures become a failed calculation.
    fn cost_meter(
        &self,
        meter: &Meter,
        period: &BillingPeriod,
        kwh: f64,
        readings: &[MeterReading],
    ) -> Option<CostCalculation> {
        let tariff_id = meter.tariff_structure_id.as_deref()?;
        let calculation = match self.store.tariff(tariff_id) {
            Ok(tariff) => calculate_meter_cost(meter, &tariff, period, kwh, readings, self.settings),
            Err(e) => CostCalculation::failed(tariff_id, e.to_string()),
        };
        Some(calculation)
    }
}
