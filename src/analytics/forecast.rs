//! Demand Forecaster
//!
//! Ridge regression over the engineered feature frame, evaluated on a
//! held-out tail and recorded in the run's parameter snapshot.
//!
//! Multi-step strategy: recursive one-step prediction, applied uniformly —
//! each predicted day is appended to the unit series and feeds the lag
//! features of the next step. The carried price is the last observed price.
//! Predicted units are clamped to non-negative before persisting.

use super::features::{build_frame, feature_row, max_lag};
use super::AnalyticsError;
use crate::config::ForecastConfig;
use crate::models::Forecast;
use crate::storage::Database;
use chrono::Duration;
use nalgebra::{DMatrix, DVector};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

pub const MODEL_NAME: &str = "demand_forecast_ridge";
pub const MODEL_VERSION: &str = "1.0";

/// Result of one forecasting invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ForecastOutcome {
    pub run_id: Uuid,
    /// Mean absolute percentage error over the held-out tail, in percent.
    pub mape: f64,
    pub forecasts: Vec<Forecast>,
    pub train_rows: usize,
    pub holdout_rows: usize,
}

/// Ridge regression fit on standardized features with a centered target.
#[derive(Debug, Clone)]
pub struct RidgeModel {
    weights: Vec<f64>,
    x_mean: Vec<f64>,
    x_std: Vec<f64>,
    y_mean: f64,
}

impl RidgeModel {
    /// Solve (X'X + λI) w = X'y on standardized columns.
    pub fn fit(rows: &[Vec<f64>], targets: &[f64], lambda: f64) -> Option<Self> {
        let n = rows.len();
        if n == 0 {
            return None;
        }
        let d = rows[0].len();

        let mut x_mean = vec![0.0; d];
        let mut x_std = vec![0.0; d];
        for row in rows {
            for (j, v) in row.iter().enumerate() {
                x_mean[j] += v;
            }
        }
        for m in &mut x_mean {
            *m /= n as f64;
        }
        for row in rows {
            for (j, v) in row.iter().enumerate() {
                x_std[j] += (v - x_mean[j]).powi(2);
            }
        }
        for s in &mut x_std {
            *s = (*s / n as f64).sqrt();
            // Constant columns carry no signal; keep them harmless.
            if *s < 1e-12 {
                *s = 1.0;
            }
        }
        let y_mean = targets.iter().sum::<f64>() / n as f64;

        let x = DMatrix::from_fn(n, d, |r, c| (rows[r][c] - x_mean[c]) / x_std[c]);
        let y = DVector::from_fn(n, |r, _| targets[r] - y_mean);

        let xtx = x.transpose() * &x + DMatrix::identity(d, d) * lambda;
        let xty = x.transpose() * y;
        let weights = xtx.cholesky()?.solve(&xty);

        Some(Self {
            weights: weights.iter().copied().collect(),
            x_mean,
            x_std,
            y_mean,
        })
    }

    pub fn predict(&self, row: &[f64]) -> f64 {
        let mut acc = self.y_mean;
        for (j, v) in row.iter().enumerate() {
            acc += self.weights[j] * (v - self.x_mean[j]) / self.x_std[j];
        }
        acc
    }
}

/// MAPE in percent over (actual, predicted) pairs, skipping zero actuals
/// where the ratio is undefined.
pub fn mape(actual: &[f64], predicted: &[f64]) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for (a, p) in actual.iter().zip(predicted.iter()) {
        if *a != 0.0 {
            sum += ((a - p) / a).abs();
            count += 1;
        }
    }
    if count == 0 {
        0.0
    } else {
        100.0 * sum / count as f64
    }
}

/// Train on canonical history, score the held-out tail, then predict
/// `horizon` days past the latest observation. Persists one Forecast row per
/// target date under a fresh completed run.
pub fn run_forecast(
    db: &Database,
    product_id: Uuid,
    horizon: u32,
    cfg: &ForecastConfig,
) -> Result<ForecastOutcome, AnalyticsError> {
    let product = db
        .product(product_id)?
        .ok_or(AnalyticsError::ProductNotFound(product_id))?;

    let history = db.sales_history(product_id, cfg.max_training_rows)?;
    let warmup = max_lag(cfg);
    let need = warmup + cfg.holdout_days + cfg.min_training_rows;
    if history.len() < need {
        return Err(AnalyticsError::InsufficientHistory {
            have: history.len(),
            need,
        });
    }

    let frame = build_frame(&history, cfg);
    let split = frame.rows.len() - cfg.holdout_days;

    let run = db.open_run(
        MODEL_NAME,
        MODEL_VERSION,
        serde_json::json!({
            "product_id": product_id,
            "horizon": horizon,
            "lags": cfg.lags,
            "ma_windows": cfg.ma_windows,
            "holdout_days": cfg.holdout_days,
            "ridge_lambda": cfg.ridge_lambda,
            "strategy": "recursive_one_step",
            "history_rows": history.len(),
            "train_rows": split,
        }),
    )?;

    let model = RidgeModel::fit(&frame.rows[..split], &frame.targets[..split], cfg.ridge_lambda)
        .ok_or_else(|| {
            AnalyticsError::Storage(anyhow::anyhow!("ridge system was not positive definite"))
        })?;

    let holdout_pred: Vec<f64> = frame.rows[split..]
        .iter()
        .map(|row| model.predict(row).max(0.0))
        .collect();
    let accuracy = mape(&frame.targets[split..], &holdout_pred);

    // Recursive multi-step: each prediction becomes a lag input for the next.
    let mut units: Vec<f64> = history.iter().map(|r| r.units_sold as f64).collect();
    let prices: Vec<f64> = history.iter().map(|r| r.price).collect();
    let last_date = history.last().map(|r| r.date).unwrap_or_default();

    let mut forecasts = Vec::with_capacity(horizon as usize);
    for step in 1..=horizon as i64 {
        let target_date = last_date + Duration::days(step);
        let row = feature_row(&units, &prices, target_date, cfg);
        let predicted = model.predict(&row).max(0.0);
        units.push(predicted);
        forecasts.push(Forecast {
            product_id,
            run_id: run.id,
            target_date,
            predicted_units: predicted,
        });
    }

    db.insert_forecasts(&forecasts)?;
    db.amend_run_params(
        run.id,
        serde_json::json!({ "mape": accuracy, "holdout_rows": cfg.holdout_days }),
    )?;
    db.complete_run(run.id)?;

    info!(
        "🔮 Forecast for {}: {} days, holdout MAPE {:.1}%",
        product.sku, horizon, accuracy
    );

    Ok(ForecastOutcome {
        run_id: run.id,
        mape: accuracy,
        forecasts,
        train_rows: split,
        holdout_rows: cfg.holdout_days,
    })
}
