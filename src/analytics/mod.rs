//! Analytical engines
//!
//! Each invocation is a pure function of (product, parameters, current
//! canonical state): it opens a lineage run, computes, persists its derived
//! rows, completes the run, and returns. No hidden global state, so a queued
//! or concurrent execution model can wrap these without contract changes.

pub mod elasticity;
pub mod features;
pub mod forecast;
pub mod pricing;

use chrono::NaiveDate;
use uuid::Uuid;

/// Typed failures for the analytics entry points. Nothing partial or guessed
/// is persisted when one of these is returned.
#[derive(Debug)]
pub enum AnalyticsError {
    ProductNotFound(Uuid),
    /// Too few valid observations in the elasticity window.
    InsufficientData { have: usize, need: usize },
    /// Product history shorter than the features require.
    InsufficientHistory { have: usize, need: usize },
    /// Pricing requested with no completed elasticity estimate on record.
    MissingElasticity(Uuid),
    /// Profit objective requested without a cost record for the date.
    MissingCost { product_id: Uuid, date: NaiveDate },
    InvalidBounds { pmin: f64, pmax: f64 },
    /// No usable baseline observation (e.g. latest price is zero).
    InvalidBaseline(String),
    Storage(anyhow::Error),
}

impl AnalyticsError {
    /// Stable reason code surfaced to callers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ProductNotFound(_) => "product_not_found",
            Self::InsufficientData { .. } => "insufficient_data",
            Self::InsufficientHistory { .. } => "insufficient_history",
            Self::MissingElasticity(_) => "missing_elasticity",
            Self::MissingCost { .. } => "missing_cost",
            Self::InvalidBounds { .. } => "invalid_bounds",
            Self::InvalidBaseline(_) => "invalid_baseline",
            Self::Storage(_) => "storage_error",
        }
    }
}

impl std::fmt::Display for AnalyticsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ProductNotFound(id) => write!(f, "product_not_found: {}", id),
            Self::InsufficientData { have, need } => write!(
                f,
                "insufficient_data: {} valid observations, need at least {}",
                have, need
            ),
            Self::InsufficientHistory { have, need } => write!(
                f,
                "insufficient_history: {} days of history, need at least {}",
                have, need
            ),
            Self::MissingElasticity(id) => write!(
                f,
                "missing_elasticity: no completed elasticity estimate for product {}",
                id
            ),
            Self::MissingCost { product_id, date } => write!(
                f,
                "missing_cost: no cost record for product {} on {}",
                product_id, date
            ),
            Self::InvalidBounds { pmin, pmax } => {
                write!(f, "invalid_bounds: pmin {} and pmax {} are not a valid range", pmin, pmax)
            }
            Self::InvalidBaseline(reason) => write!(f, "invalid_baseline: {}", reason),
            Self::Storage(err) => write!(f, "storage_error: {:#}", err),
        }
    }
}

impl std::error::Error for AnalyticsError {}

impl From<anyhow::Error> for AnalyticsError {
    fn from(err: anyhow::Error) -> Self {
        Self::Storage(err)
    }
}
