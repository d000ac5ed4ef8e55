//! Pipeline configuration
//!
//! Every knob has a default tuned for daily sales data; the binary can
//! override the whole block from a TOML file or individual values from CLI
//! flags. Loaded once at startup and treated as read-only afterwards.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration for the pipeline and analytics engines.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub etl: EtlConfig,
    pub elasticity: ElasticityConfig,
    pub forecast: ForecastConfig,
    pub pricing: PricingConfig,
    pub api: ApiConfig,
}

impl PipelineConfig {
    /// Load from a TOML file; missing keys fall back to defaults.
    pub fn from_toml_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let cfg = toml::from_str(&text)?;
        Ok(cfg)
    }
}

/// ETL batching and retry behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EtlConfig {
    /// Pending raw rows pulled per canonical-write transaction.
    pub batch_size: usize,
    /// Bounded retries for transient storage conflicts (SQLITE_BUSY).
    pub max_commit_retries: u32,
    /// Backoff between retries, in milliseconds.
    pub retry_backoff_ms: u64,
    /// Cap on failure reasons echoed back per ETL call.
    pub failure_sample_size: usize,
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_commit_retries: 3,
            retry_backoff_ms: 50,
            failure_sample_size: 10,
        }
    }
}

/// Elasticity estimation window and confidence guardrails.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElasticityConfig {
    /// Trailing window, in days, ending at the product's latest observation.
    pub window_days: u32,
    /// Minimum valid (nonzero price and units) observations required.
    pub min_observations: usize,
    /// Price coefficient of variation below this flags low confidence.
    pub min_price_cv: f64,
    /// R-squared below this flags low confidence.
    pub min_r2: f64,
}

impl Default for ElasticityConfig {
    fn default() -> Self {
        Self {
            window_days: 90,
            min_observations: 10,
            min_price_cv: 0.05,
            min_r2: 0.2,
        }
    }
}

/// Demand forecaster features, holdout and training caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastConfig {
    /// Lag offsets for unit sales, in rows of history.
    pub lags: Vec<usize>,
    /// Moving-average windows over unit sales.
    pub ma_windows: Vec<usize>,
    /// Held-out tail used to compute the accuracy metric.
    pub holdout_days: usize,
    /// Ridge regularization strength.
    pub ridge_lambda: f64,
    /// Hard cap on training rows so one invocation cannot block unboundedly.
    pub max_training_rows: usize,
    /// Minimum training rows after feature construction.
    pub min_training_rows: usize,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            lags: vec![1, 7, 14, 28],
            ma_windows: vec![7, 14, 28],
            holdout_days: 14,
            ridge_lambda: 1.0,
            max_training_rows: 3650,
            min_training_rows: 10,
        }
    }
}

/// Price search resolution and default bound widening.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    /// Grid points evaluated across [pmin, pmax] on the fallback path.
    pub grid_points: usize,
    /// Default pmin as a multiple of the baseline price when unspecified.
    pub default_pmin_ratio: f64,
    /// Default pmax as a multiple of the baseline price when unspecified.
    pub default_pmax_ratio: f64,
    /// Target dates generated after the latest observation when the caller
    /// does not name explicit dates.
    pub default_horizon_days: u32,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            grid_points: 400,
            default_pmin_ratio: 0.5,
            default_pmax_ratio: 1.5,
            default_horizon_days: 7,
        }
    }
}

/// Limits on the read accessors exposed to the request layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Page size used when the caller passes none.
    pub default_page_size: usize,
    /// Upper bound enforced on any requested page size.
    pub max_page_size: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            default_page_size: 100,
            max_page_size: 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.etl.batch_size, 500);
        assert_eq!(cfg.elasticity.window_days, 90);
        assert_eq!(cfg.forecast.lags, vec![1, 7, 14, 28]);
        assert!(cfg.pricing.grid_points >= 100);
        assert!(cfg.api.max_page_size >= cfg.api.default_page_size);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: PipelineConfig = toml::from_str(
            r#"
            [etl]
            batch_size = 50

            [elasticity]
            window_days = 30
            "#,
        )
        .unwrap();
        assert_eq!(cfg.etl.batch_size, 50);
        assert_eq!(cfg.etl.max_commit_retries, 3);
        assert_eq!(cfg.elasticity.window_days, 30);
        assert_eq!(cfg.forecast.holdout_days, 14);
    }
}
