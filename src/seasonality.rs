use crate::schema::{BillingPeriod, DayType, Season};
use crate::settings::CalculationSettings;
use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_WINTER_MONTHS: [u32; 3] = [6, 7, 8];

impl Season {
    /// Southern-hemisphere convention: June to August is winter.
    pub fn for_month(month: u32) -> Self {
        Self::for_month_with(month, &DEFAULT_WINTER_MONTHS)
    }

    pub fn for_month_with(month: u32, winter_months: &[u32]) -> Self {
        if winter_months.contains(&month) {
            Season::High
        } else {
            Season::Low
        }
    }

    pub fn for_date(date: NaiveDate, settings: &CalculationSettings) -> Self {
        Self::for_month_with(date.month(), &settings.winter_months)
    }

    pub fn for_period(period: &BillingPeriod, settings: &CalculationSettings) -> Self {
        Self::for_date(period.midpoint(), settings)
    }
}

impl DayType {
    pub fn for_date(date: NaiveDate) -> Self {
        match date.weekday() {
            Weekday::Sat => DayType::Saturday,
            Weekday::Sun => DayType::Sunday,
            _ => DayType::Weekday,
        }
    }
}

/// Per-period figures for one meter, as shown on charts and used for data-quality checks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeriodSummary {
    pub period: BillingPeriod,
    pub kwh: f64,
    #[serde(default)]
    pub cost: Option<f64>,
    /// Register reading at the start of the period.
    #[serde(default)]
    pub previous_reading: Option<f64>,
    /// Register reading at the end of the period.
    #[serde(default)]
    pub current_reading: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeasonalSegment {
    pub season: Season,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub period_count: usize,
    pub average_kwh: f64,
    pub average_cost: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeasonalAverage {
    pub season: Season,
    pub period_count: usize,
    pub average_kwh: f64,
    pub average_cost: Option<f64>,
}

struct Accumulator {
    count: usize,
    kwh: f64,
    cost: f64,
    cost_count: usize,
}

impl Accumulator {
    fn new() -> Self {
        Self {
            count: 0,
            kwh: 0.0,
            cost: 0.0,
            cost_count: 0,
        }
    }

    fn push(&mut self, summary: &PeriodSummary) {
        self.count += 1;
        self.kwh += summary.kwh;
        if let Some(cost) = summary.cost {
            self.cost += cost;
            self.cost_count += 1;
        }
    }

    fn average_kwh(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.kwh / self.count as f64
        }
    }

    fn average_cost(&self) -> Option<f64> {
        if self.cost_count == 0 {
            None
        } else {
            Some(self.cost / self.cost_count as f64)
        }
    }
}

/// Groups chronologically consecutive periods of the same season into segments.
pub fn seasonal_segments(
    periods: &[PeriodSummary],
    settings: &CalculationSettings,
) -> Vec<SeasonalSegment> {
    let mut sorted: Vec<&PeriodSummary> = periods.iter().collect();
    sorted.sort_by_key(|p| p.period.start);

    let mut segments = Vec::new();
    let mut current: Option<(Season, NaiveDate, NaiveDate, Accumulator)> = None;

    for summary in sorted {
        let season = Season::for_period(&summary.period, settings);

        match current.as_mut() {
            Some((s, _, end, acc)) if *s == season => {
                *end = summary.period.end;
                acc.push(summary);
            }
            _ => {
                if let Some(done) = current.take() {
                    segments.push(finish_segment(done));
                }
                let mut acc = Accumulator::new();
                acc.push(summary);
                current = Some((season, summary.period.start, summary.period.end, acc));
            }
        }
    }

    if let Some(done) = current {
        segments.push(finish_segment(done));
    }

    segments
}

fn finish_segment(
    (season, start, end, acc): (Season, NaiveDate, NaiveDate, Accumulator),
) -> SeasonalSegment {
    SeasonalSegment {
        season,
        start,
        end,
        period_count: acc.count,
        average_kwh: acc.average_kwh(),
        average_cost: acc.average_cost(),
    }
}

/// Averages across all periods of each season, regardless of adjacency.
pub fn seasonal_averages(
    periods: &[PeriodSummary],
    settings: &CalculationSettings,
) -> BTreeMap<Season, SeasonalAverage> {
    let mut accumulators: BTreeMap<Season, Accumulator> = BTreeMap::new();

    for summary in periods {
        let season = Season::for_period(&summary.period, settings);
        accumulators
            .entry(season)
            .or_insert_with(Accumulator::new)
            .push(summary);
    }

    accumulators
        .into_iter()
        .map(|(season, acc)| {
            (
                season,
                SeasonalAverage {
                    season,
                    period_count: acc.count,
                    average_kwh: acc.average_kwh(),
                    average_cost: acc.average_cost(),
                },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::month_period;

    fn summary(year: i32, month: u32, kwh: f64, cost: Option<f64>) -> PeriodSummary {
        PeriodSummary {
            period: month_period(year, month).unwrap(),
            kwh,
            cost,
            previous_reading: None,
            current_reading: None,
        }
    }

    #[test]
    fn test_season_for_month() {
        assert_eq!(Season::for_month(7), Season::High);
        assert_eq!(Season::for_month(1), Season::Low);
        assert_eq!(Season::for_month(6), Season::High);
        assert_eq!(Season::for_month(8), Season::High);
        assert_eq!(Season::for_month(9), Season::Low);
        assert_eq!(Season::for_month(5), Season::Low);
    }

    #[test]
    fn test_custom_winter_months() {
        assert_eq!(Season::for_month_with(12, &[12, 1, 2]), Season::High);
        assert_eq!(Season::for_month_with(7, &[12, 1, 2]), Season::Low);
    }

    #[test]
    fn test_day_type() {
        // 2024-03-02 was a Saturday.
        assert_eq!(
            DayType::for_date(NaiveDate::from_ymd_opt(2024, 3, 2).unwrap()),
            DayType::Saturday
        );
        assert_eq!(
            DayType::for_date(NaiveDate::from_ymd_opt(2024, 3, 3).unwrap()),
            DayType::Sunday
        );
        assert_eq!(
            DayType::for_date(NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()),
            DayType::Weekday
        );
    }

    #[test]
    fn test_segments_split_on_season_change() {
        let settings = CalculationSettings::default();
        let periods = vec![
            summary(2024, 4, 100.0, Some(200.0)),
            summary(2024, 5, 200.0, Some(400.0)),
            summary(2024, 6, 400.0, Some(1000.0)),
            summary(2024, 7, 600.0, None),
            summary(2024, 8, 500.0, Some(1200.0)),
            summary(2024, 9, 300.0, Some(600.0)),
        ];

        let segments = seasonal_segments(&periods, &settings);
        assert_eq!(segments.len(), 3);

        assert_eq!(segments[0].season, Season::Low);
        assert_eq!(segments[0].period_count, 2);
        assert!((segments[0].average_kwh - 150.0).abs() < 1e-9);
        assert_eq!(segments[0].average_cost, Some(300.0));

        assert_eq!(segments[1].season, Season::High);
        assert_eq!(segments[1].period_count, 3);
        assert!((segments[1].average_kwh - 500.0).abs() < 1e-9);
        assert_eq!(segments[1].average_cost, Some(1100.0));

        assert_eq!(segments[2].season, Season::Low);
        assert_eq!(segments[2].period_count, 1);
    }

    #[test]
    fn test_segments_sort_unordered_input() {
        let settings = CalculationSettings::default();
        let periods = vec![summary(2024, 2, 10.0, None), summary(2024, 1, 30.0, None)];
        let segments = seasonal_segments(&periods, &settings);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].start, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert_eq!(segments[0].end, NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
        assert_eq!(segments[0].average_cost, None);
    }

    #[test]
    fn test_seasonal_averages() {
        let settings = CalculationSettings::default();
        let periods = vec![
            summary(2023, 12, 100.0, None),
            summary(2024, 1, 300.0, None),
            summary(2024, 7, 800.0, None),
        ];
        let averages = seasonal_averages(&periods, &settings);
        assert!((averages[&Season::Low].average_kwh - 200.0).abs() < 1e-9);
        assert!((averages[&Season::High].average_kwh - 800.0).abs() < 1e-9);
    }
}
