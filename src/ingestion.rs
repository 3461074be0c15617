use crate::error::{ReconciliationError, Result};
use crate::schema::{BillingPeriod, MeterReading};
use crate::seasonality::PeriodSummary;
use crate::utils::{period_end_datetime, period_start_datetime};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use log::{debug, warn};
use serde::Deserialize;
use splines::{Interpolation, Key, Spline};
use std::fs::File;
use std::io::Read;
use std::path::Path;

const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M",
    "%d/%m/%Y %H:%M",
];

/// One row of an uploaded interval data file.
///
/// Expected header columns (by name):
/// - timestamp
/// - kwh
/// - kva (optional)
#[derive(Debug, Clone, Deserialize)]
struct ReadingRow {
    timestamp: String,
    kwh: f64,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    kva: Option<f64>,
}

pub fn parse_timestamp(value: &str) -> Result<NaiveDateTime> {
    let trimmed = value.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.naive_utc());
    }

    for format in TIMESTAMP_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(dt);
        }
    }

    Err(ReconciliationError::InvalidReading(format!(
        "Unrecognised timestamp '{}'",
        value
    )))
}

/// Rejects negative consumption and timestamps outside [2000-01-01, 2100-01-01).
pub fn validate_reading(reading: &MeterReading) -> Result<()> {
    if !reading.kwh.is_finite() || reading.kwh < 0.0 {
        return Err(ReconciliationError::InvalidReading(format!(
            "kWh must be non-negative, got {} at {}",
            reading.kwh, reading.timestamp
        )));
    }

    let date = reading.timestamp.date();
    let min = NaiveDate::from_ymd_opt(2000, 1, 1);
    let max = NaiveDate::from_ymd_opt(2100, 1, 1);
    if min.map_or(false, |m| date < m) || max.map_or(false, |m| date >= m) {
        return Err(ReconciliationError::InvalidReading(format!(
            "Timestamp {} is out of the allowed range",
            reading.timestamp
        )));
    }

    Ok(())
}

/// Parses interval readings for one meter from CSV. Invalid rows abort the parse.
pub fn parse_readings_csv<R: Read>(reader: R, meter_id: &str) -> Result<Vec<MeterReading>> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);

    let mut readings = Vec::new();
    for (idx, row) in rdr.deserialize::<ReadingRow>().enumerate() {
        let row = row?;
        let reading = MeterReading {
            meter_id: meter_id.to_string(),
            timestamp: parse_timestamp(&row.timestamp).map_err(|e| {
                ReconciliationError::InvalidReading(format!("Row {}: {}", idx + 1, e))
            })?,
            kwh: row.kwh,
            kva: row.kva,
        };
        validate_reading(&reading)?;
        readings.push(reading);
    }

    readings.sort_by_key(|r| r.timestamp);
    let before = readings.len();
    readings.dedup_by(|a, b| a.timestamp == b.timestamp);
    if readings.len() != before {
        warn!(
            "Dropped {} duplicate readings for meter {}",
            before - readings.len(),
            meter_id
        );
    }

    debug!("Parsed {} readings for meter {}", readings.len(), meter_id);
    Ok(readings)
}

pub fn read_readings_file(path: &Path, meter_id: &str) -> Result<Vec<MeterReading>> {
    let file = File::open(path)?;
    parse_readings_csv(file, meter_id)
}

pub fn sum_period_kwh(readings: &[MeterReading], meter_id: &str, period: &BillingPeriod) -> f64 {
    readings
        .iter()
        .filter(|r| r.meter_id == meter_id && period.contains(r.timestamp))
        .map(|r| r.kwh)
        .sum()
}

pub fn max_kva(readings: &[MeterReading], meter_id: &str, period: &BillingPeriod) -> Option<f64> {
    readings
        .iter()
        .filter(|r| r.meter_id == meter_id && period.contains(r.timestamp))
        .filter_map(|r| r.kva)
        .fold(None, |acc: Option<f64>, kva| Some(acc.map_or(kva, |m| m.max(kva))))
}

/// A cumulative register value read off a meter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegisterReading {
    pub timestamp: NaiveDateTime,
    pub value: f64,
}

fn to_seconds(timestamp: NaiveDateTime) -> f64 {
    timestamp.and_utc().timestamp() as f64
}

/// Linearly interpolates the register at `at`. Returns `None` outside the observed range.
pub fn interpolate_register(registers: &[RegisterReading], at: NaiveDateTime) -> Option<f64> {
    if let Some(exact) = registers.iter().find(|r| r.timestamp == at) {
        return Some(exact.value);
    }

    let mut sorted = registers.to_vec();
    sorted.sort_by_key(|r| r.timestamp);

    let keys: Vec<Key<f64, f64>> = sorted
        .iter()
        .map(|r| Key::new(to_seconds(r.timestamp), r.value, Interpolation::Linear))
        .collect();

    Spline::from_vec(keys).sample(to_seconds(at))
}

/// Builds per-period summaries from cumulative registers, estimating the
/// opening and closing register at each period boundary.
pub fn period_summaries_from_registers(
    registers: &[RegisterReading],
    periods: &[BillingPeriod],
) -> Vec<PeriodSummary> {
    periods
        .iter()
        .map(|period| {
            let previous = interpolate_register(registers, period_start_datetime(period));
            let current = interpolate_register(registers, period_end_datetime(period));
            let kwh = match (previous, current) {
                (Some(p), Some(c)) => c - p,
                _ => {
                    debug!("Register does not span period {}", period);
                    0.0
                }
            };
            PeriodSummary {
                period: *period,
                kwh,
                cost: None,
                previous_reading: previous,
                current_reading: current,
            }
        })
        .collect()
}
