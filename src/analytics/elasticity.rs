//! Elasticity Estimator
//!
//! Fits ln(units) = a + b·ln(price) over a trailing window of canonical
//! sales; the slope b is the price elasticity. Estimates that fail the
//! variance or fit guardrails are still returned, flagged low-confidence —
//! callers always see an explicit trust signal, never a silently unreliable
//! number.

use super::AnalyticsError;
use crate::config::ElasticityConfig;
use crate::models::ElasticityEstimate;
use crate::storage::Database;
use chrono::Duration;
use nalgebra::{DMatrix, DVector};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

pub const MODEL_NAME: &str = "log_log_ols";
pub const MODEL_VERSION: &str = "1.0";

/// Result of one estimation invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ElasticityOutcome {
    pub run_id: Uuid,
    pub estimate: ElasticityEstimate,
    pub observations: usize,
    pub price_cv: f64,
}

/// Least-squares fit of ln(q) on ln(p) plus intercept.
/// Returns (elasticity, intercept, r2).
///
/// Near-zero price variance makes the slope unidentifiable; it is reported
/// as 0.0 with r2 0.0 so the caller never sees NaN, and the variance
/// guardrail flags the estimate.
pub fn fit_log_log(points: &[(f64, f64)]) -> (f64, f64, f64) {
    let n = points.len();
    let ln_p: Vec<f64> = points.iter().map(|(p, _)| p.ln()).collect();
    let ln_q: Vec<f64> = points.iter().map(|(_, q)| q.ln()).collect();

    let mean_p = ln_p.iter().sum::<f64>() / n as f64;
    let var_p = ln_p.iter().map(|v| (v - mean_p).powi(2)).sum::<f64>() / n as f64;
    if var_p < 1e-12 {
        return (0.0, ln_q.iter().sum::<f64>() / n as f64, 0.0);
    }

    let x = DMatrix::from_fn(n, 2, |r, c| if c == 0 { 1.0 } else { ln_p[r] });
    let y = DVector::from_vec(ln_q.clone());
    let beta = match x.clone().svd(true, true).solve(&y, 1e-12) {
        Ok(beta) => beta,
        // Degenerate design matrix despite the variance check.
        Err(_) => return (0.0, ln_q.iter().sum::<f64>() / n as f64, 0.0),
    };
    let intercept = beta[(0, 0)];
    let slope = beta[(1, 0)];

    let fitted = &x * &beta;
    let mean_q = ln_q.iter().sum::<f64>() / n as f64;
    let ss_res: f64 = ln_q
        .iter()
        .zip(fitted.iter())
        .map(|(a, f)| (a - f).powi(2))
        .sum();
    let ss_tot: f64 = ln_q.iter().map(|a| (a - mean_q).powi(2)).sum();
    let r2 = if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { 0.0 };

    (slope, intercept, r2)
}

/// Coefficient of variation of the raw (not log) prices.
fn price_cv(prices: &[f64]) -> f64 {
    let n = prices.len() as f64;
    let mean = prices.iter().sum::<f64>() / n;
    if mean <= 0.0 {
        return 0.0;
    }
    let var = prices.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / n;
    var.sqrt() / mean
}

/// Estimate price elasticity for a product over its trailing window and
/// persist the estimate under a fresh completed run.
pub fn estimate_elasticity(
    db: &Database,
    product_id: Uuid,
    cfg: &ElasticityConfig,
) -> Result<ElasticityOutcome, AnalyticsError> {
    let product = db
        .product(product_id)?
        .ok_or(AnalyticsError::ProductNotFound(product_id))?;

    // Window ends at the product's latest observation, not wall-clock today,
    // so backfilled histories estimate the same way as live ones.
    let latest = db
        .latest_sale(product_id)?
        .ok_or(AnalyticsError::InsufficientData {
            have: 0,
            need: cfg.min_observations,
        })?;
    let window_end = latest.date;
    let window_start = window_end - Duration::days(cfg.window_days as i64);

    let rows = db.sales_window(product_id, window_start, window_end)?;
    // Zero price or zero units is undefined under the logarithm.
    let valid: Vec<(f64, f64)> = rows
        .iter()
        .filter(|r| r.price > 0.0 && r.units_sold > 0)
        .map(|r| (r.price, r.units_sold as f64))
        .collect();

    if valid.len() < cfg.min_observations {
        return Err(AnalyticsError::InsufficientData {
            have: valid.len(),
            need: cfg.min_observations,
        });
    }

    let run = db.open_run(
        MODEL_NAME,
        MODEL_VERSION,
        serde_json::json!({
            "product_id": product_id,
            "window_days": cfg.window_days,
            "window_start": window_start,
            "window_end": window_end,
            "min_observations": cfg.min_observations,
            "min_price_cv": cfg.min_price_cv,
            "min_r2": cfg.min_r2,
        }),
    )?;

    let prices: Vec<f64> = valid.iter().map(|(p, _)| *p).collect();
    let cv = price_cv(&prices);
    let (elasticity, _intercept, r2) = fit_log_log(&valid);
    let low_confidence = cv < cfg.min_price_cv || r2 < cfg.min_r2;

    if low_confidence {
        warn!(
            "Elasticity for {} ({}) flagged low-confidence: price_cv={:.4}, r2={:.3}",
            product.sku, product_id, cv, r2
        );
    }
    if elasticity > 0.0 {
        warn!(
            "Positive elasticity {:.3} for {} — demand rising with price",
            elasticity, product.sku
        );
    }

    let estimate = ElasticityEstimate {
        product_id,
        run_id: run.id,
        window_start,
        window_end,
        elasticity,
        r2,
        low_confidence,
    };
    db.insert_elasticity_estimate(&estimate)?;
    db.amend_run_params(
        run.id,
        serde_json::json!({
            "observations": valid.len(),
            "price_cv": cv,
            "elasticity": elasticity,
            "r2": r2,
            "low_confidence": low_confidence,
        }),
    )?;
    db.complete_run(run.id)?;

    info!(
        "📉 Elasticity for {}: b={:.3}, r2={:.3}, {} observations",
        product.sku,
        elasticity,
        r2,
        valid.len()
    );

    Ok(ElasticityOutcome {
        run_id: run.id,
        estimate,
        observations: valid.len(),
        price_cv: cv,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etl::transform::CanonicalRow;
    use chrono::NaiveDate;
    use std::time::Duration as StdDuration;

    fn seed_sales(db: &Database, org: Uuid, sku: &str, rows: &[(NaiveDate, i64, f64)]) -> Uuid {
        let canonical: Vec<(i64, CanonicalRow)> = rows
            .iter()
            .enumerate()
            .map(|(i, (date, units, price))| {
                (
                    i as i64 + 1,
                    CanonicalRow {
                        sku: sku.to_string(),
                        date: *date,
                        units_sold: *units,
                        price: *price,
                        revenue: *units as f64 * price,
                    },
                )
            })
            .collect();
        let dummies: Vec<serde_json::Value> =
            rows.iter().map(|_| serde_json::json!({})).collect();
        db.stage_raw_records(org, "api", &dummies).unwrap();
        db.commit_canonical_batch(org, &canonical, &[], 0, StdDuration::from_millis(1))
            .unwrap();
        db.product_by_sku(org, sku).unwrap().unwrap().id
    }

    fn day(i: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + Duration::days(i as i64)
    }

    #[test]
    fn recovers_known_elasticity() {
        // D = 100 * (p / 10)^(-1.5), exact power-law data.
        let db = Database::open_in_memory().unwrap();
        let org = db.create_organization("acme").unwrap().id;
        let rows: Vec<(NaiveDate, i64, f64)> = (0..60)
            .map(|i| {
                let price = 8.0 + (i % 5) as f64; // 8..12
                let units = (100.0 * (price / 10.0_f64).powf(-1.5)).round() as i64;
                (day(i), units, price)
            })
            .collect();
        let product = seed_sales(&db, org, "SKU-E", &rows);

        let outcome =
            estimate_elasticity(&db, product, &ElasticityConfig::default()).unwrap();
        assert!(
            (outcome.estimate.elasticity + 1.5).abs() < 0.1,
            "elasticity {} not near -1.5",
            outcome.estimate.elasticity
        );
        assert!(outcome.estimate.r2 > 0.9);
        assert!(!outcome.estimate.low_confidence);

        // The run completed and the estimate is now the trusted latest.
        let latest = db.latest_completed_elasticity(product).unwrap().unwrap();
        assert_eq!(latest.run_id, outcome.run_id);
        assert!(db.run(outcome.run_id).unwrap().unwrap().finished_at.is_some());
    }

    #[test]
    fn constant_price_is_flagged_never_undefined() {
        let db = Database::open_in_memory().unwrap();
        let org = db.create_organization("acme").unwrap().id;
        let rows: Vec<(NaiveDate, i64, f64)> =
            (0..30).map(|i| (day(i), 20 + (i % 3) as i64, 10.0)).collect();
        let product = seed_sales(&db, org, "SKU-C", &rows);

        let outcome =
            estimate_elasticity(&db, product, &ElasticityConfig::default()).unwrap();
        assert!(outcome.estimate.low_confidence);
        assert!(outcome.estimate.elasticity.is_finite());
        assert!(outcome.estimate.r2.is_finite());
    }

    #[test]
    fn too_few_observations_is_typed_and_persists_nothing() {
        let db = Database::open_in_memory().unwrap();
        let org = db.create_organization("acme").unwrap().id;
        let rows: Vec<(NaiveDate, i64, f64)> =
            (0..5).map(|i| (day(i), 10, 9.0 + i as f64)).collect();
        let product = seed_sales(&db, org, "SKU-S", &rows);

        let err = estimate_elasticity(&db, product, &ElasticityConfig::default()).unwrap_err();
        assert_eq!(err.code(), "insufficient_data");
        assert!(db.latest_completed_elasticity(product).unwrap().is_none());
    }

    #[test]
    fn zero_rows_are_excluded_from_the_fit() {
        let db = Database::open_in_memory().unwrap();
        let org = db.create_organization("acme").unwrap().id;
        let mut rows: Vec<(NaiveDate, i64, f64)> = (0..40)
            .map(|i| {
                let price = 9.0 + (i % 4) as f64;
                let units = (100.0 * (price / 10.0_f64).powf(-1.2)).round() as i64;
                (day(i), units, price)
            })
            .collect();
        // Days with zero units or zero price must not poison the logs.
        rows.push((day(40), 0, 10.0));
        rows.push((day(41), 15, 0.0));
        let product = seed_sales(&db, org, "SKU-Z", &rows);

        let outcome =
            estimate_elasticity(&db, product, &ElasticityConfig::default()).unwrap();
        assert_eq!(outcome.observations, 40);
        assert!((outcome.estimate.elasticity + 1.2).abs() < 0.2);
    }

    #[test]
    fn fit_log_log_exact_power_law() {
        let points: Vec<(f64, f64)> = [8.0, 9.0, 10.0, 11.0, 12.0]
            .iter()
            .map(|&p: &f64| (p, 100.0 * (p / 10.0).powf(-1.5)))
            .collect();
        let (slope, intercept, r2) = fit_log_log(&points);
        assert!((slope + 1.5).abs() < 1e-9);
        assert!((r2 - 1.0).abs() < 1e-9);
        // ln(100) + 1.5*ln(10)
        assert!((intercept - (100.0_f64.ln() + 1.5 * 10.0_f64.ln())).abs() < 1e-9);
    }
}
