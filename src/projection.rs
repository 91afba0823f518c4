use chrono::{Datelike, NaiveDate, TimeDelta};
use serde::Serialize;

/// Recent window used for the rate estimate.
const RECENT_POINTS: usize = 12;
/// Minimum non-null points before a regression is trusted.
const MIN_REGRESSION_POINTS: usize = 6;
/// Months are treated as a flat 30 days when projecting forward.
const DAYS_PER_MONTH: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionStatus {
    Current,
    Projected,
    ProjectedHistorical,
    NoMovement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionMethod {
    HistoricalRegression,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectionResult {
    pub status: ProjectionStatus,
    pub message: String,
    pub estimated_date: Option<NaiveDate>,
    pub months_to_wait: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_progress_days_per_month: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<ProjectionMethod>,
}

impl ProjectionResult {
    fn current(message: &str, method: Option<ProjectionMethod>) -> Self {
        ProjectionResult {
            status: ProjectionStatus::Current,
            message: message.to_string(),
            estimated_date: None,
            months_to_wait: Some(0),
            avg_progress_days_per_month: None,
            method,
        }
    }
}

/// Whole calendar months from `start` to `end`; days are ignored.
pub fn calculate_months_between(start: NaiveDate, end: NaiveDate) -> i64 {
    (end.year() as i64 - start.year() as i64) * 12 + (end.month() as i64 - start.month() as i64)
}

/// `start` plus `months` flat 30-day months. Not calendar-accurate.
/// `None` if the result falls outside the representable date range.
pub fn add_months_to_date(start: NaiveDate, months: i64) -> Option<NaiveDate> {
    months.checked_mul(DAYS_PER_MONTH).and_then(|days| offset_days(start, days))
}

fn offset_days(base: NaiveDate, days: i64) -> Option<NaiveDate> {
    TimeDelta::try_days(days).and_then(|d| base.checked_add_signed(d))
}

/// `offset_days` for a fitted value; non-finite or out-of-range is `None`.
fn offset_fractional_days(base: NaiveDate, days: f64) -> Option<NaiveDate> {
    if !days.is_finite() || days.abs() >= i64::MAX as f64 {
        return None;
    }
    offset_days(base, days as i64)
}

/// One decimal place, ties to even.
fn round1(x: f64) -> f64 {
    (x * 10.0).round_ties_even() / 10.0
}

/// Estimate when a cutoff series will reach `target`.
///
/// `dates` and `cutoffs` are parallel and ascending by publication date;
/// `None` cutoffs (unavailable months) are ignored. Returns `None` when fewer
/// than two usable points exist.
pub fn calculate_projection(
    dates: &[NaiveDate],
    cutoffs: &[Option<NaiveDate>],
    target: NaiveDate,
) -> Option<ProjectionResult> {
    if dates.len() < 2 {
        return None;
    }

    let valid: Vec<(NaiveDate, NaiveDate)> = dates
        .iter()
        .zip(cutoffs)
        .filter_map(|(p, c)| c.map(|c| (*p, c)))
        .collect();
    if valid.len() < 2 {
        return None;
    }

    let recent = &valid[valid.len().saturating_sub(RECENT_POINTS)..];
    let (first_pub, first_cutoff) = recent[0];
    let (last_pub, last_cutoff) = recent[recent.len() - 1];

    let months_elapsed = calculate_months_between(first_pub, last_pub).max(1);
    let days_advanced = (last_cutoff - first_cutoff).num_days();
    let avg_days_per_month = days_advanced as f64 / months_elapsed as f64;

    if last_cutoff >= target {
        return Some(ProjectionResult::current(
            "Your application date has already been reached!",
            None,
        ));
    }

    if avg_days_per_month <= 0.0 {
        if let Some(historical) = calculate_historical_linear_regression(&valid, target, last_pub) {
            return Some(historical);
        }
        return Some(ProjectionResult {
            status: ProjectionStatus::NoMovement,
            message: "No forward progress detected in recent months.".to_string(),
            estimated_date: None,
            months_to_wait: None,
            avg_progress_days_per_month: None,
            method: None,
        });
    }

    let days_to_advance = (target - last_cutoff).num_days();
    let months_to_wait = (days_to_advance as f64 / avg_days_per_month) as i64;

    let estimated_date = add_months_to_date(last_pub, months_to_wait);
    if estimated_date.is_none() {
        tracing::debug!("Projected date beyond the calendar ({} months)", months_to_wait);
    }

    Some(ProjectionResult {
        status: ProjectionStatus::Projected,
        message: format!("Estimated processing in {} months", months_to_wait),
        estimated_date,
        months_to_wait: Some(months_to_wait),
        avg_progress_days_per_month: Some(round1(avg_days_per_month)),
        method: None,
    })
}

/// Least-squares fit of cutoff-days against publication-days over the whole
/// series, used when the recent window stalled. `None` when there are fewer
/// than six points, the fitted line does not move forward, or its crossing
/// point lies outside the representable date range.
pub fn calculate_historical_linear_regression(
    points: &[(NaiveDate, NaiveDate)],
    target: NaiveDate,
    last_pub: NaiveDate,
) -> Option<ProjectionResult> {
    if points.len() < MIN_REGRESSION_POINTS {
        return None;
    }

    let epoch = regression_epoch();
    let days = |d: NaiveDate| (d - epoch).num_days() as i128;

    let n = points.len() as i128;
    let (mut sum_x, mut sum_y, mut sum_xy, mut sum_x2) = (0i128, 0i128, 0i128, 0i128);
    for (p, c) in points {
        let (x, y) = (days(*p), days(*c));
        sum_x += x;
        sum_y += y;
        sum_xy += x * y;
        sum_x2 += x * x;
    }

    let denominator = n * sum_x2 - sum_x * sum_x;
    if denominator == 0 {
        return None;
    }
    let slope = (n * sum_xy - sum_x * sum_y) as f64 / denominator as f64;
    let intercept = (sum_y as f64 - slope * sum_x as f64) / n as f64;
    if slope <= 0.0 {
        return None;
    }

    let target_days = days(target) as f64;
    let fitted_last_days = slope * days(last_pub) as f64 + intercept;
    let fitted_last = offset_fractional_days(epoch, fitted_last_days)?;
    if fitted_last >= target {
        return Some(ProjectionResult::current(
            "Your application date has already been reached (based on historical trend)!",
            Some(ProjectionMethod::HistoricalRegression),
        ));
    }

    let projected_pub_days = (target_days - intercept) / slope;
    let projected_date = offset_fractional_days(epoch, projected_pub_days)?;
    let months_to_wait = calculate_months_between(last_pub, projected_date).max(0);

    Some(ProjectionResult {
        status: ProjectionStatus::ProjectedHistorical,
        message: format!(
            "Estimated processing in {} months (based on long-term trend)",
            months_to_wait
        ),
        estimated_date: Some(projected_date),
        months_to_wait: Some(months_to_wait),
        avg_progress_days_per_month: Some(round1(slope * DAYS_PER_MONTH as f64)),
        method: Some(ProjectionMethod::HistoricalRegression),
    })
}

fn regression_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or_default()
}

/// Target dates come from user input; anything that is not `YYYY-MM-DD`
/// falls back to `today`.
pub fn parse_target_date(raw: Option<&str>, today: NaiveDate) -> NaiveDate {
    raw.and_then(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok())
        .unwrap_or(today)
}
