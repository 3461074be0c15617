use crate::schema::MeterReading;
use chrono::NaiveDateTime;
use log::{debug, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// An ordered set of data-quality corrections for a reconciliation pass.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct DataQualityCorrections {
    #[schemars(description = "Corrections applied in order to the raw interval readings before aggregation")]
    #[serde(default)]
    pub corrections: Vec<ReadingCorrection>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReadingCorrection {
    /// Multiply every reading of a meter, e.g. to fix a wrong CT ratio.
    ScaleReadings { meter_id: String, factor: f64 },

    /// Book a one-off kWh adjustment against a meter without touching its readings.
    OffsetKwh {
        meter_id: String,
        kwh: f64,
        #[serde(default)]
        reason: Option<String>,
    },

    /// Replace (or insert) the reading at an exact timestamp.
    ReplaceReading {
        meter_id: String,
        timestamp: NaiveDateTime,
        kwh: f64,
        #[serde(default)]
        kva: Option<f64>,
    },

    /// Drop readings in `[from, to)`.
    DeleteRange {
        meter_id: String,
        from: NaiveDateTime,
        to: NaiveDateTime,
    },

    /// Remove a meter from the pass entirely.
    ExcludeMeter { meter_id: String },
}

impl ReadingCorrection {
    pub fn meter_id(&self) -> &str {
        match self {
            ReadingCorrection::ScaleReadings { meter_id, .. }
            | ReadingCorrection::OffsetKwh { meter_id, .. }
            | ReadingCorrection::ReplaceReading { meter_id, .. }
            | ReadingCorrection::DeleteRange { meter_id, .. }
            | ReadingCorrection::ExcludeMeter { meter_id } => meter_id,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CorrectedReadings {
    pub readings: Vec<MeterReading>,
    /// Net kWh change per meter caused by the corrections.
    pub adjustments: BTreeMap<String, f64>,
    pub excluded_meters: BTreeSet<String>,
}

impl DataQualityCorrections {
    pub fn is_empty(&self) -> bool {
        self.corrections.is_empty()
    }

    /// Applies the corrections to a copy of `readings`. The input is left untouched.
    pub fn apply(&self, readings: &[MeterReading]) -> CorrectedReadings {
        let mut working = readings.to_vec();
        let mut offsets: BTreeMap<String, f64> = BTreeMap::new();
        let mut excluded = BTreeSet::new();

        for correction in &self.corrections {
            debug!("Applying correction {:?}", correction);
            apply_single_correction(&mut working, &mut offsets, &mut excluded, correction);
        }

        working.retain(|r| !excluded.contains(&r.meter_id));
        working.sort_by(|a, b| {
            a.meter_id
                .cmp(&b.meter_id)
                .then(a.timestamp.cmp(&b.timestamp))
        });

        let mut adjustments = offsets;
        let before = totals_by_meter(readings);
        let after = totals_by_meter(&working);
        let meters: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
        for meter_id in meters {
            if excluded.contains(meter_id) {
                continue;
            }
            let delta = after.get(meter_id).copied().unwrap_or(0.0)
                - before.get(meter_id).copied().unwrap_or(0.0);
            if delta != 0.0 {
                *adjustments.entry(meter_id.clone()).or_default() += delta;
            }
        }
        adjustments.retain(|id, _| !excluded.contains(id));

        CorrectedReadings {
            readings: working,
            adjustments,
            excluded_meters: excluded,
        }
    }
}

fn apply_single_correction(
    readings: &mut Vec<MeterReading>,
    offsets: &mut BTreeMap<String, f64>,
    excluded: &mut BTreeSet<String>,
    correction: &ReadingCorrection,
) {
    match correction {
        ReadingCorrection::ScaleReadings { meter_id, factor } => {
            if *factor < 0.0 {
                warn!("Ignoring negative scale factor {} for meter {}", factor, meter_id);
                return;
            }
            for reading in readings.iter_mut().filter(|r| &r.meter_id == meter_id) {
                reading.kwh *= factor;
                if let Some(kva) = reading.kva.as_mut() {
                    *kva *= factor;
                }
            }
        }

        ReadingCorrection::OffsetKwh { meter_id, kwh, .. } => {
            *offsets.entry(meter_id.clone()).or_default() += kwh;
        }

        ReadingCorrection::ReplaceReading {
            meter_id,
            timestamp,
            kwh,
            kva,
        } => {
            readings.retain(|r| !(&r.meter_id == meter_id && r.timestamp == *timestamp));
            readings.push(MeterReading {
                meter_id: meter_id.clone(),
                timestamp: *timestamp,
                kwh: *kwh,
                kva: *kva,
            });
        }

        ReadingCorrection::DeleteRange { meter_id, from, to } => {
            readings.retain(|r| {
                !(&r.meter_id == meter_id && r.timestamp >= *from && r.timestamp < *to)
            });
        }

        ReadingCorrection::ExcludeMeter { meter_id } => {
            excluded.insert(meter_id.clone());
        }
    }
}

fn totals_by_meter(readings: &[MeterReading]) -> BTreeMap<String, f64> {
    let mut totals = BTreeMap::new();
    for reading in readings {
        *totals.entry(reading.meter_id.clone()).or_default() += reading.kwh;
    }
    totals
}
