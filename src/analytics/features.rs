//! Feature engineering for the demand forecaster
//!
//! Rows are built from the product's observed sequence of daily sales:
//! lagged units, moving averages, calendar features and the previous price.
//! The same `feature_row` function serves both training (with historical
//! tails) and recursive prediction (with predicted values appended to the
//! tail), so train and inference inputs cannot drift apart.

use crate::config::ForecastConfig;
use crate::models::SalesRecord;
use chrono::{Datelike, NaiveDate};

/// Training matrix: one row per day with enough preceding history.
#[derive(Debug, Clone)]
pub struct FeatureFrame {
    pub names: Vec<String>,
    pub rows: Vec<Vec<f64>>,
    pub targets: Vec<f64>,
    pub dates: Vec<NaiveDate>,
}

/// Longest lag the configuration asks for; rows earlier than this have no
/// complete feature vector.
pub fn max_lag(cfg: &ForecastConfig) -> usize {
    cfg.lags
        .iter()
        .chain(cfg.ma_windows.iter())
        .copied()
        .max()
        .unwrap_or(1)
}

/// Names matching the layout produced by [`feature_row`].
pub fn feature_names(cfg: &ForecastConfig) -> Vec<String> {
    let mut names = Vec::new();
    for lag in &cfg.lags {
        names.push(format!("units_lag_{}", lag));
    }
    for window in &cfg.ma_windows {
        names.push(format!("units_ma_{}", window));
    }
    names.push("day_of_week".to_string());
    names.push("month".to_string());
    names.push("price_lag_1".to_string());
    names.push("price_ma_7".to_string());
    names
}

fn tail_mean(series: &[f64], window: usize) -> f64 {
    let n = series.len().min(window);
    if n == 0 {
        return 0.0;
    }
    series[series.len() - n..].iter().sum::<f64>() / n as f64
}

/// Feature vector for predicting the day `target_date`, given everything
/// observed (or already predicted) strictly before it.
///
/// `units` and `prices` are the full preceding sequences, oldest first.
/// Caller guarantees `units.len() >= max_lag(cfg)`.
pub fn feature_row(
    units: &[f64],
    prices: &[f64],
    target_date: NaiveDate,
    cfg: &ForecastConfig,
) -> Vec<f64> {
    let mut row = Vec::with_capacity(cfg.lags.len() + cfg.ma_windows.len() + 4);
    for &lag in &cfg.lags {
        row.push(units[units.len() - lag]);
    }
    for &window in &cfg.ma_windows {
        row.push(tail_mean(units, window));
    }
    row.push(target_date.weekday().num_days_from_monday() as f64);
    row.push(target_date.month() as f64);
    row.push(prices.last().copied().unwrap_or(0.0));
    row.push(tail_mean(prices, 7));
    row
}

/// Build the training frame from canonical history (ascending by date).
/// The first `max_lag` days are consumed as warm-up and produce no rows.
pub fn build_frame(history: &[SalesRecord], cfg: &ForecastConfig) -> FeatureFrame {
    let warmup = max_lag(cfg);
    let units: Vec<f64> = history.iter().map(|r| r.units_sold as f64).collect();
    let prices: Vec<f64> = history.iter().map(|r| r.price).collect();

    let mut rows = Vec::new();
    let mut targets = Vec::new();
    let mut dates = Vec::new();
    for t in warmup..history.len() {
        rows.push(feature_row(&units[..t], &prices[..t], history[t].date, cfg));
        targets.push(units[t]);
        dates.push(history[t].date);
    }

    FeatureFrame {
        names: feature_names(cfg),
        rows,
        targets,
        dates,
    }
}
