use crate::error::{ReconciliationError, Result};
use crate::hierarchy::MeterConnection;
use crate::schema::*;
use log::debug;
use std::collections::BTreeMap;

/// The persistence boundary: the site's relational store of meters, readings,
/// tariffs, stored calculations and reconciliation runs.
pub trait ReconciliationStore {
    fn meters_for_site(&self, site_id: &str) -> Result<Vec<Meter>>;

    fn meter(&self, meter_id: &str) -> Result<Meter>;

    fn connections_for_site(&self, site_id: &str) -> Result<Vec<MeterConnection>>;

    fn roles_for_site(&self, site_id: &str) -> Result<BTreeMap<String, MeterRole>>;

    fn readings(&self, meter_id: &str, period: &BillingPeriod) -> Result<Vec<MeterReading>>;

    fn tariff(&self, tariff_id: &str) -> Result<TariffStructure>;

    fn assign_tariff(&mut self, meter_id: &str, tariff_id: Option<&str>) -> Result<()>;

    /// Inserts or replaces the row with the same (document, meter, tariff) key.
    fn upsert_calculation(&mut self, calculation: DocumentTariffCalculation) -> Result<()>;

    fn calculations_for_document(&self, document_id: &str)
        -> Result<Vec<DocumentTariffCalculation>>;

    fn save_run(&mut self, run: ReconciliationRun) -> Result<()>;

    fn runs_for_site(&self, site_id: &str) -> Result<Vec<ReconciliationRun>>;
}

#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    meters: BTreeMap<String, Meter>,
    connections: Vec<(String, MeterConnection)>,
    roles: BTreeMap<String, BTreeMap<String, MeterRole>>,
    readings: BTreeMap<String, Vec<MeterReading>>,
    tariffs: BTreeMap<String, TariffStructure>,
    calculations: BTreeMap<CalculationKey, DocumentTariffCalculation>,
    runs: Vec<ReconciliationRun>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_meter(&mut self, meter: Meter) {
        self.meters.insert(meter.id.clone(), meter);
    }

    pub fn insert_connection(&mut self, site_id: &str, connection: MeterConnection) {
        self.connections.push((site_id.to_string(), connection));
    }

    pub fn set_role(&mut self, site_id: &str, meter_id: &str, role: MeterRole) {
        self.roles
            .entry(site_id.to_string())
            .or_default()
            .insert(meter_id.to_string(), role);
    }

    pub fn insert_readings(&mut self, readings: Vec<MeterReading>) {
        for reading in readings {
            self.readings
                .entry(reading.meter_id.clone())
                .or_default()
                .push(reading);
        }
    }

    pub fn insert_tariff(&mut self, tariff: TariffStructure) {
        self.tariffs.insert(tariff.id.clone(), tariff);
    }

    pub fn calculation_count(&self) -> usize {
        self.calculations.len()
    }
}

impl ReconciliationStore for MemoryStore {
    fn meters_for_site(&self, site_id: &str) -> Result<Vec<Meter>> {
        Ok(self
            .meters
            .values()
            .filter(|m| m.site_id == site_id)
            .cloned()
            .collect())
    }

    fn meter(&self, meter_id: &str) -> Result<Meter> {
        self.meters
            .get(meter_id)
            .cloned()
            .ok_or_else(|| ReconciliationError::UnknownMeter(meter_id.to_string()))
    }

    fn connections_for_site(&self, site_id: &str) -> Result<Vec<MeterConnection>> {
        Ok(self
            .connections
            .iter()
            .filter(|(site, _)| site == site_id)
            .map(|(_, c)| c.clone())
            .collect())
    }

    fn roles_for_site(&self, site_id: &str) -> Result<BTreeMap<String, MeterRole>> {
        Ok(self.roles.get(site_id).cloned().unwrap_or_default())
    }

    fn readings(&self, meter_id: &str, period: &BillingPeriod) -> Result<Vec<MeterReading>> {
        let mut readings: Vec<MeterReading> = self
            .readings
            .get(meter_id)
            .map(|all| {
                all.iter()
                    .filter(|r| period.contains(r.timestamp))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        readings.sort_by_key(|r| r.timestamp);
        Ok(readings)
    }

    fn tariff(&self, tariff_id: &str) -> Result<TariffStructure> {
        self.tariffs
            .get(tariff_id)
            .cloned()
            .ok_or_else(|| ReconciliationError::UnknownTariff(tariff_id.to_string()))
    }

    fn assign_tariff(&mut self, meter_id: &str, tariff_id: Option<&str>) -> Result<()> {
        if let Some(id) = tariff_id {
            if !self.tariffs.contains_key(id) {
                return Err(ReconciliationError::UnknownTariff(id.to_string()));
            }
        }
        let meter = self
            .meters
            .get_mut(meter_id)
            .ok_or_else(|| ReconciliationError::UnknownMeter(meter_id.to_string()))?;
        meter.tariff_structure_id = tariff_id.map(str::to_string);
        Ok(())
    }

    fn upsert_calculation(&mut self, calculation: DocumentTariffCalculation) -> Result<()> {
        let key = calculation.key();
        if self.calculations.insert(key, calculation).is_some() {
            debug!("Replaced an existing document calculation");
        }
        Ok(())
    }

    fn calculations_for_document(
        &self,
        document_id: &str,
    ) -> Result<Vec<DocumentTariffCalculation>> {
        Ok(self
            .calculations
            .values()
            .filter(|c| c.document_id == document_id)
            .cloned()
            .collect())
    }

    fn save_run(&mut self, run: ReconciliationRun) -> Result<()> {
        self.runs.retain(|r| r.id != run.id);
        self.runs.push(run);
        Ok(())
    }

    fn runs_for_site(&self, site_id: &str) -> Result<Vec<ReconciliationRun>> {
        Ok(self
            .runs
            .iter()
            .filter(|r| r.site_id == site_id)
            .cloned()
            .collect())
    }
}
