use crate::error::{ReconciliationError, Result};
use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MeterType {
    #[schemars(description = "Bulk supply meter measuring the grid connection of the site")]
    Bulk,
    #[schemars(description = "Meter measuring generation from an on-site solar installation")]
    Solar,
    #[schemars(description = "Sub-meter recovering consumption from a tenant")]
    Tenant,
    #[schemars(description = "Meter billed directly by the municipality / council")]
    Council,
    #[schemars(description = "Any other check or common-area meter")]
    Other,
}

impl fmt::Display for MeterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MeterType::Bulk => "bulk",
            MeterType::Solar => "solar",
            MeterType::Tenant => "tenant",
            MeterType::Council => "council",
            MeterType::Other => "other",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct Meter {
    pub id: String,
    pub site_id: String,
    pub meter_number: String,
    pub name: String,
    pub meter_type: MeterType,
    /// Electrical rating as printed on the installation, e.g. "100A TP".
    #[serde(default)]
    pub rating: Option<String>,
    #[serde(default)]
    pub tariff_structure_id: Option<String>,
}

/// One interval of metered consumption.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct MeterReading {
    pub meter_id: String,
    /// Start of the interval the reading covers.
    pub timestamp: NaiveDateTime,
    /// Energy consumed during the interval.
    pub kwh: f64,
    /// Apparent power demand over the interval, when the meter records it.
    #[serde(default)]
    pub kva: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Season {
    /// Winter, high-demand season.
    High,
    /// Summer, low-demand season.
    Low,
}

impl fmt::Display for Season {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Season::High => f.write_str("winter"),
            Season::Low => f.write_str("summer"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DayType {
    Weekday,
    Saturday,
    Sunday,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct TariffBlock {
    pub block_number: u32,
    pub kwh_from: f64,
    /// Upper bound of the block; `None` for the open top block.
    #[serde(default)]
    pub kwh_to: Option<f64>,
    pub rate_per_kwh: f64,
    /// Blocks without a season apply all year.
    #[serde(default)]
    pub season: Option<Season>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct TariffTimePeriod {
    pub season: Season,
    pub day_type: DayType,
    pub start_hour: u32,
    /// Exclusive. A period with `end_hour <= start_hour` wraps past midnight.
    pub end_hour: u32,
    pub rate_per_kwh: f64,
    #[serde(default)]
    pub label: Option<String>,
}

impl TariffTimePeriod {
    pub fn covers_hour(&self, hour: u32) -> bool {
        if self.end_hour > self.start_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ChargeKind {
    Basic,
    Demand,
    SeasonalEnergy,
    Service,
    Other,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ChargeUnit {
    PerMonth,
    PerDay,
    PerKva,
    PerKwh,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct TariffCharge {
    pub kind: ChargeKind,
    pub unit: ChargeUnit,
    pub amount: f64,
    #[serde(default)]
    pub season: Option<Season>,
    #[serde(default)]
    pub description: Option<String>,
}

impl TariffCharge {
    pub fn applies_in(&self, season: Season) -> bool {
        self.season.map_or(true, |s| s == season)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct TariffStructure {
    pub id: String,
    pub name: String,
    pub supply_authority: String,
    #[serde(default)]
    pub uses_tou: bool,
    #[serde(default)]
    pub blocks: Vec<TariffBlock>,
    #[serde(default)]
    pub time_periods: Vec<TariffTimePeriod>,
    #[serde(default)]
    pub charges: Vec<TariffCharge>,
}

/// An inclusive range of calendar days.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema)]
pub struct BillingPeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl BillingPeriod {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if end < start {
            return Err(ReconciliationError::DateError(format!(
                "Billing period ends ({}) before it starts ({})",
                end, start
            )));
        }
        Ok(Self { start, end })
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn midpoint(&self) -> NaiveDate {
        let offset = ((self.days() - 1) / 2).max(0) as u64;
        self.start
            .checked_add_days(Days::new(offset))
            .unwrap_or(self.start)
    }

    /// Billing months, pro-rated by `average_month_days`.
    pub fn months(&self, average_month_days: f64) -> f64 {
        self.days() as f64 / average_month_days
    }

    pub fn contains(&self, timestamp: NaiveDateTime) -> bool {
        let date = timestamp.date();
        date >= self.start && date <= self.end
    }
}

impl fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SupplyType {
    #[default]
    #[schemars(description = "Energy supplied from the grid")]
    Normal,
    #[schemars(description = "Energy supplied from solar generation")]
    Solar,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct ExtractedLineItem {
    #[schemars(description = "The line description exactly as printed on the bill (e.g. 'Energy Charge Block 1', 'Basic Charge')")]
    pub description: String,

    #[schemars(description = "Consumption quantity for this line, if printed (kWh for energy lines, kVA for demand lines)")]
    #[serde(default)]
    pub consumption: Option<f64>,

    #[schemars(description = "Unit rate applied on this line, if printed")]
    #[serde(default)]
    pub rate: Option<f64>,

    #[schemars(description = "Monetary amount charged on this line")]
    pub amount: f64,

    #[schemars(description = "Unit of the consumption column, e.g. 'kWh', 'kVA', 'days'")]
    #[serde(default)]
    pub unit: Option<String>,

    #[schemars(description = "Whether this line relates to grid ('normal') or solar supply")]
    #[serde(default)]
    pub supply_type: SupplyType,

    #[schemars(description = "Meter number this line belongs to, when the bill covers multiple meters")]
    #[serde(default)]
    pub meter_number: Option<String>,
}

impl ExtractedLineItem {
    pub fn is_energy(&self) -> bool {
        self.unit
            .as_deref()
            .map(|u| u.trim().eq_ignore_ascii_case("kwh"))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct DocumentExtraction {
    #[schemars(description = "Identifier of the uploaded site document this extraction belongs to")]
    pub document_id: String,

    #[schemars(description = "Identifier of the site the bill is addressed to")]
    pub site_id: String,

    #[schemars(description = "First day of the billing period in YYYY-MM-DD format")]
    pub period_start: NaiveDate,

    #[schemars(description = "Last day of the billing period (inclusive) in YYYY-MM-DD format")]
    pub period_end: NaiveDate,

    #[schemars(description = "Total amount billed for the period, excluding arrears")]
    pub total_amount: f64,

    #[schemars(description = "Every charge line printed on the bill")]
    #[serde(default)]
    pub line_items: Vec<ExtractedLineItem>,
}

impl DocumentExtraction {
    pub fn period(&self) -> Result<BillingPeriod> {
        BillingPeriod::new(self.period_start, self.period_end)
    }

    /// Grid-supplied kWh printed on the bill, optionally restricted to one meter number.
    pub fn billed_kwh(&self, meter_number: Option<&str>) -> Option<f64> {
        let lines: Vec<&ExtractedLineItem> = self
            .line_items
            .iter()
            .filter(|l| l.is_energy() && l.supply_type == SupplyType::Normal)
            .filter(|l| match (meter_number, l.meter_number.as_deref()) {
                (Some(wanted), Some(actual)) => wanted == actual,
                _ => true,
            })
            .collect();

        let quantities: Vec<f64> = lines.iter().filter_map(|l| l.consumption).collect();
        if quantities.is_empty() {
            None
        } else {
            Some(quantities.iter().sum())
        }
    }

    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(DocumentExtraction)
    }

    pub fn schema_as_json() -> std::result::Result<String, serde_json::Error> {
        let schema = Self::generate_json_schema();
        serde_json::to_string_pretty(&schema)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentTariffCalculation {
    pub document_id: String,
    pub meter_id: String,
    pub tariff_structure_id: String,
    pub tariff_name: String,
    pub total_kwh: f64,
    pub energy_cost: f64,
    pub fixed_charges: f64,
    pub demand_charges: f64,
    pub total_cost: f64,
    pub document_billed_amount: f64,
    pub variance_amount: f64,
    /// Relative to the billed amount; `None` when nothing was billed.
    pub variance_percentage: Option<f64>,
    pub has_error: bool,
    pub error_message: Option<String>,
    pub calculated_at: DateTime<Utc>,
}

impl DocumentTariffCalculation {
    pub fn key(&self) -> CalculationKey {
        CalculationKey {
            document_id: self.document_id.clone(),
            meter_id: self.meter_id.clone(),
            tariff_structure_id: self.tariff_structure_id.clone(),
        }
    }
}

/// Uniqueness key for stored document calculations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CalculationKey {
    pub document_id: String,
    pub meter_id: String,
    pub tariff_structure_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MeterRole {
    GridSupply,
    SolarEnergy,
    BulkMeter,
    CheckMeter,
    TenantMeter,
    CommonArea,
    Unassigned,
}

impl Default for MeterRole {
    fn default() -> Self {
        Self::Unassigned
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconciliationMeterResult {
    pub meter_id: String,
    pub meter_number: String,
    pub role: MeterRole,
    pub direct_kwh: f64,
    pub hierarchical_kwh: f64,
    pub corrections_kwh: f64,
    pub max_kva: Option<f64>,
    pub tariff_name: Option<String>,
    pub energy_cost: f64,
    pub fixed_charges: f64,
    pub demand_charges: f64,
    pub total_cost: f64,
    pub has_error: bool,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RunSummary {
    pub grid_supply_kwh: f64,
    pub solar_kwh: f64,
    pub total_supply_kwh: f64,
    pub tenant_kwh: f64,
    pub common_area_kwh: f64,
    pub discrepancy_kwh: f64,
    /// Share of supply recovered from tenants, as a percentage.
    pub recovery_rate: Option<f64>,
    pub grid_supply_cost: f64,
    pub tenant_revenue: f64,
    pub meters_with_errors: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconciliationRun {
    pub id: String,
    pub site_id: String,
    pub name: String,
    pub period: BillingPeriod,
    pub created_at: DateTime<Utc>,
    pub results: Vec<ReconciliationMeterResult>,
    pub summary: RunSummary,
    #[serde(default)]
    pub warnings: Vec<String>,
}
