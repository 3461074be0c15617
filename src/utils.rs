use crate::error::{ReconciliationError, Result};
use crate::schema::BillingPeriod;
use chrono::{Datelike, Days, NaiveDate, NaiveDateTime, NaiveTime};

pub fn last_day_of_month(year: i32, month: u32) -> Result<NaiveDate> {
    let next_month = if month == 12 { 1 } else { month + 1 };
    let next_year = if month == 12 { year + 1 } else { year };

    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.checked_sub_days(Days::new(1)))
        .ok_or_else(|| {
            ReconciliationError::DateError(format!("Invalid month {}-{:02}", year, month))
        })
}

/// The full calendar month as a billing period.
pub fn month_period(year: i32, month: u32) -> Result<BillingPeriod> {
    let start = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(|| {
        ReconciliationError::DateError(format!("Invalid month {}-{:02}", year, month))
    })?;
    BillingPeriod::new(start, last_day_of_month(year, month)?)
}

/// First instant of the period.
pub fn period_start_datetime(period: &BillingPeriod) -> NaiveDateTime {
    period.start.and_time(NaiveTime::MIN)
}

/// First instant after the period.
pub fn period_end_datetime(period: &BillingPeriod) -> NaiveDateTime {
    period
        .end
        .succ_opt()
        .unwrap_or(period.end)
        .and_time(NaiveTime::MIN)
}

/// Parses a period string in the format "YYYY-MM", "YYYY-MM:YYYY-MM" or
/// "YYYY-MM-DD:YYYY-MM-DD".
pub fn parse_period_string(period: &str) -> Result<BillingPeriod> {
    let parts: Vec<&str> = period.split(':').collect();

    match parts.len() {
        1 => {
            let (year, month) = parse_year_month(parts[0])?;
            month_period(year, month)
        }
        2 => {
            let (start_str, end_str) = (parts[0].trim(), parts[1].trim());

            if let (Ok(start), Ok(end)) = (
                NaiveDate::parse_from_str(start_str, "%Y-%m-%d"),
                NaiveDate::parse_from_str(end_str, "%Y-%m-%d"),
            ) {
                return BillingPeriod::new(start, end);
            }

            let (start_year, start_month) = parse_year_month(start_str)?;
            let (end_year, end_month) = parse_year_month(end_str)?;
            let start = month_period(start_year, start_month)?.start;
            let end = last_day_of_month(end_year, end_month)?;
            BillingPeriod::new(start, end)
        }
        _ => Err(ReconciliationError::DateError(format!(
            "Invalid period format: {}. Expected 'YYYY-MM' or 'YYYY-MM:YYYY-MM'",
            period
        ))),
    }
}

fn parse_year_month(value: &str) -> Result<(i32, u32)> {
    let start_str = format!("{}-01", value.trim());
    let date = NaiveDate::parse_from_str(&start_str, "%Y-%m-%d").map_err(|_| {
        ReconciliationError::DateError(format!(
            "Invalid date format in period: {}. Expected YYYY-MM",
            value
        ))
    })?;
    Ok((date.year(), date.month()))
}

pub fn round_currency(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
