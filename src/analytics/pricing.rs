//! Price Optimizer
//!
//! Constant-elasticity demand curve D(p) = D0 · (p/P0)^b around a baseline
//! (D0, P0), maximizing revenue p·D(p) or profit (p−c)·D(p) inside
//! [pmin, pmax].
//!
//! Closed-form evaluation runs first: the profit optimum p* = c·b/(b+1)
//! exists when b < −1; revenue (and profit outside that region) is monotonic
//! in p under constant elasticity, so the optimum sits on a bound. A fine
//! grid across the interval is the verification/fallback path; the grid
//! winner is only taken when it beats the closed-form candidate.

use super::AnalyticsError;
use crate::config::PricingConfig;
use crate::models::{Objective, PriceRecommendation};
use crate::storage::Database;
use chrono::{Duration, NaiveDate};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

pub const MODEL_NAME: &str = "price_optimizer";
pub const MODEL_VERSION: &str = "1.0";

/// Caller-supplied parameters for one pricing invocation.
#[derive(Debug, Clone)]
pub struct PricingParams {
    pub objective: Objective,
    /// Defaults to `default_pmin_ratio · P0` when absent.
    pub pmin: Option<f64>,
    /// Defaults to `default_pmax_ratio · P0` when absent.
    pub pmax: Option<f64>,
    /// Defaults to the `default_horizon_days` after the latest observation.
    pub target_dates: Vec<NaiveDate>,
}

/// Result of one pricing invocation.
#[derive(Debug, Clone, Serialize)]
pub struct PricingOutcome {
    pub run_id: Uuid,
    pub elasticity: f64,
    pub baseline_price: f64,
    pub pmin: f64,
    pub pmax: f64,
    pub recommendations: Vec<PriceRecommendation>,
}

/// The maximizer and the quantities evaluated at it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Optimum {
    pub price: f64,
    pub units: f64,
    pub revenue: f64,
    pub profit: f64,
    pub at_bound: bool,
}

fn demand(p: f64, d0: f64, p0: f64, b: f64) -> f64 {
    d0 * (p / p0).powf(b)
}

fn objective_value(p: f64, d0: f64, p0: f64, b: f64, cost: Option<f64>) -> f64 {
    let d = demand(p, d0, p0, b);
    match cost {
        Some(c) => (p - c) * d,
        None => p * d,
    }
}

/// Closed-form candidate, already clamped into [pmin, pmax].
fn closed_form_candidate(b: f64, cost: Option<f64>, pmin: f64, pmax: f64) -> f64 {
    match cost {
        // Interior profit optimum exists only for elastic demand.
        Some(c) if b < -1.0 => (c * b / (b + 1.0)).clamp(pmin, pmax),
        // Inelastic profit and all revenue cases are monotonic in p.
        Some(_) => pmax,
        None => {
            if b < -1.0 {
                pmin
            } else {
                pmax
            }
        }
    }
}

/// Maximize the objective over [pmin, pmax].
pub fn optimize_price(
    d0: f64,
    p0: f64,
    b: f64,
    objective: Objective,
    cost: Option<f64>,
    pmin: f64,
    pmax: f64,
    grid_points: usize,
) -> Optimum {
    let cost = match objective {
        Objective::Profit => cost,
        Objective::Revenue => None,
    };

    let candidate = closed_form_candidate(b, cost, pmin, pmax);
    let mut best_price = candidate;
    let mut best_value = objective_value(candidate, d0, p0, b, cost);

    // Grid verification; the exact candidate wins ties.
    let n = grid_points.max(2);
    let step = (pmax - pmin) / (n - 1) as f64;
    for i in 0..n {
        let p = if i == n - 1 { pmax } else { pmin + step * i as f64 };
        let value = objective_value(p, d0, p0, b, cost);
        if value > best_value {
            best_value = value;
            best_price = p;
        }
    }

    let units = demand(best_price, d0, p0, b);
    let revenue = best_price * units;
    let profit = match cost {
        Some(c) => (best_price - c) * units,
        None => 0.0,
    };
    let eps = 1e-9 * (1.0 + pmax.abs());
    Optimum {
        price: best_price,
        units,
        revenue,
        profit,
        at_bound: (best_price - pmin).abs() < eps || (best_price - pmax).abs() < eps,
    }
}

/// Recommend prices for a set of target dates and persist one
/// recommendation per date under a fresh completed run.
pub fn recommend_prices(
    db: &Database,
    product_id: Uuid,
    params: &PricingParams,
    cfg: &PricingConfig,
) -> Result<PricingOutcome, AnalyticsError> {
    let product = db
        .product(product_id)?
        .ok_or(AnalyticsError::ProductNotFound(product_id))?;

    let latest = db
        .latest_sale(product_id)?
        .ok_or_else(|| AnalyticsError::InvalidBaseline("no sales history".to_string()))?;
    if latest.price <= 0.0 {
        return Err(AnalyticsError::InvalidBaseline(format!(
            "latest observed price {} is not positive",
            latest.price
        )));
    }
    let baseline_price = latest.price;
    let baseline_units = latest.units_sold as f64;

    let estimate = db
        .latest_completed_elasticity(product_id)?
        .ok_or(AnalyticsError::MissingElasticity(product_id))?;
    let b = estimate.elasticity;

    let pmin = params.pmin.unwrap_or(baseline_price * cfg.default_pmin_ratio);
    let pmax = params.pmax.unwrap_or(baseline_price * cfg.default_pmax_ratio);
    if pmin > pmax || pmin <= 0.0 {
        return Err(AnalyticsError::InvalidBounds { pmin, pmax });
    }

    let target_dates: Vec<NaiveDate> = if params.target_dates.is_empty() {
        (1..=cfg.default_horizon_days as i64)
            .map(|d| latest.date + Duration::days(d))
            .collect()
    } else {
        params.target_dates.clone()
    };

    // Profit needs a cost per date; verify all of them before anything is
    // opened or persisted, never substituting zero.
    let costs: Vec<Option<f64>> = match params.objective {
        Objective::Profit => {
            let mut costs = Vec::with_capacity(target_dates.len());
            for date in &target_dates {
                let cost = db.unit_cost_on(product_id, *date)?.ok_or(
                    AnalyticsError::MissingCost {
                        product_id,
                        date: *date,
                    },
                )?;
                costs.push(Some(cost));
            }
            costs
        }
        Objective::Revenue => vec![None; target_dates.len()],
    };

    let run = db.open_run(
        MODEL_NAME,
        MODEL_VERSION,
        serde_json::json!({
            "product_id": product_id,
            "objective": params.objective,
            "pmin": pmin,
            "pmax": pmax,
            "baseline_price": baseline_price,
            "baseline_units": baseline_units,
            "elasticity": b,
            "elasticity_r2": estimate.r2,
            "elasticity_low_confidence": estimate.low_confidence,
            "grid_points": cfg.grid_points,
            "target_dates": target_dates,
        }),
    )?;

    let mut recommendations = Vec::with_capacity(target_dates.len());
    for (date, cost) in target_dates.iter().zip(costs.iter()) {
        // Forecasted demand for the day when available, else the baseline.
        let d0 = db
            .latest_forecast_units(product_id, *date)?
            .unwrap_or(baseline_units);

        let optimum = optimize_price(
            d0,
            baseline_price,
            b,
            params.objective,
            *cost,
            pmin,
            pmax,
            cfg.grid_points,
        );
        recommendations.push(PriceRecommendation {
            product_id,
            run_id: run.id,
            target_date: *date,
            objective: params.objective,
            suggested_price: optimum.price,
            expected_units: optimum.units,
            expected_revenue: optimum.revenue,
            expected_profit: optimum.profit,
            at_bound: optimum.at_bound,
        });
    }

    db.insert_recommendations(&recommendations)?;
    db.complete_run(run.id)?;

    info!(
        "💰 Priced {} for {} dates ({}): b={:.3}, bounds [{:.2}, {:.2}]",
        product.sku,
        recommendations.len(),
        params.objective,
        b,
        pmin,
        pmax
    );

    Ok(PricingOutcome {
        run_id: run.id,
        elasticity: b,
        baseline_price,
        pmin,
        pmax,
        recommendations,
    })
}
