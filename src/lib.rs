//! # Meter Reconciliation
//!
//! A library for costing electricity consumption against municipal tariffs and
//! reconciling a site's bulk supply against the meters fed from it.
//!
//! ## Core Concepts
//!
//! - **Tariff Structures**: Inclining blocks, time-of-use periods and fixed/demand charges,
//!   each optionally restricted to the high (winter) or low (summer) season
//! - **Meter Hierarchy**: Parent/child connections between meters. A parent's
//!   hierarchical total is the signed sum of the leaves below it, with solar generation
//!   counted as negative consumption
//! - **Document Comparison**: Recalculating an extracted utility bill and classifying the
//!   variance as a match, partial match or mismatch
//! - **Reconciliation Runs**: Named, stored snapshots of every meter's consumption and cost
//!   for a site over a billing period
//!
//! ## Example
//!
//! ```rust,ignore
//! use meter_reconciliation::*;
//!
//! let mut store = MemoryStore::new();
//! store.insert_tariff(tariff);
//! store.insert_meter(bulk_meter);
//! store.insert_meter(tenant_meter);
//! store.insert_connection("site-1", MeterConnection::new("tenant-1", "bulk-1"));
//! store.insert_readings(readings);
//!
//! let settings = CalculationSettings::default();
//! let period = parse_period_string("2024-07")?;
//! let run = ReconciliationProcessor::run(&mut store, &settings, "site-1", "July", period)?;
//! println!("Recovery: {:?}%", run.summary.recovery_rate);
//! ```

pub mod balance;
pub mod corrections;
pub mod error;
pub mod hierarchy;
pub mod ingestion;
pub mod reconciliation;
pub mod register;
pub mod schema;
pub mod seasonality;
pub mod settings;
pub mod store;
pub mod tariff;
pub mod utils;
pub mod variance;

pub use balance::{
    check_energy_balance, verify_energy_balance, BalanceCheck, EnergyBalancer, VerificationResult,
};
pub use corrections::*;
pub use error::{ReconciliationError, Result};
pub use hierarchy::{HierarchyNode, MeterConnection, MeterHierarchy};
pub use ingestion::*;
pub use reconciliation::{
    assign_tariffs, calculate_documents, compare_document, effective_role, summarize,
    BatchFailure, BatchOutcome, CancellationFlag, DocumentJob, ReconciliationRunner,
    TariffAssignment,
};
pub use register::{MeterEntry, MeterRegister};
pub use schema::*;
pub use seasonality::{
    seasonal_averages, seasonal_segments, PeriodSummary, SeasonalAverage, SeasonalSegment,
};
pub use settings::CalculationSettings;
pub use store::{MemoryStore, ReconciliationStore};
pub use tariff::{
    apply_blocks, calculate_meter_cost, CostCalculation, CostComponent, CostLineItem,
    TariffCalculator,
};
pub use utils::*;
pub use variance::{detect_discontinuities, variance_percentage, Discontinuity, VarianceBand};

use log::debug;

pub struct ReconciliationProcessor;

impl ReconciliationProcessor {
    pub fn run<S: ReconciliationStore>(
        store: &mut S,
        settings: &CalculationSettings,
        site_id: &str,
        name: &str,
        period: BillingPeriod,
    ) -> Result<ReconciliationRun> {
        settings.validate()?;

        let run = ReconciliationRunner::new(store, settings).run(site_id, name, period)?;

        for warning in &run.warnings {
            debug!("Reconciliation warning: {}", warning);
        }

        Ok(run)
    }

    /// Like [`run`](Self::run), but fails without saving anything when any parent
    /// meter's supply differs from what is metered below it by more than
    /// `settings.energy_balance_tolerance` (a fraction of supply).
    pub fn run_with_verification<S: ReconciliationStore>(
        store: &mut S,
        settings: &CalculationSettings,
        site_id: &str,
        name: &str,
        period: BillingPeriod,
    ) -> Result<ReconciliationRun> {
        settings.validate()?;

        ReconciliationRunner::new(store, settings)
            .with_strict_balance()
            .run(site_id, name, period)
    }
}

pub fn run_reconciliation<S: ReconciliationStore>(
    store: &mut S,
    settings: &CalculationSettings,
    site_id: &str,
    name: &str,
    period: BillingPeriod,
) -> Result<ReconciliationRun> {
    ReconciliationProcessor::run(store, settings, site_id, name, period)
}

pub fn run_with_verification<S: ReconciliationStore>(
    store: &mut S,
    settings: &CalculationSettings,
    site_id: &str,
    name: &str,
    period: BillingPeriod,
) -> Result<ReconciliationRun> {
    ReconciliationProcessor::run_with_verification(store, settings, site_id, name, period)
}
