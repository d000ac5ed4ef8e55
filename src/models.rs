//! Core entities shared by the ETL pipeline, the analytics engines and the
//! storage layer.
//!
//! Everything downstream of the Transform Engine is strictly typed; raw
//! payloads stay as `serde_json::Value` only inside [`RawRecord`].

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tenant boundary. Immutable once created except for the display name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// An item for sale, owned by exactly one organization.
/// Unique on (org_id, sku); auto-created on first ETL reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub org_id: Uuid,
    pub sku: String,
    pub name: String,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

/// Processing lifecycle of a staged raw record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawStatus {
    Pending,
    Processed,
    Failed,
}

impl RawStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RawStatus::Pending => "pending",
            RawStatus::Processed => "processed",
            RawStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RawStatus::Pending),
            "processed" => Some(RawStatus::Processed),
            "failed" => Some(RawStatus::Failed),
            _ => None,
        }
    }
}

/// A staged sales record exactly as received. The payload is write-once;
/// only `status` / `error` ever transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    pub raw_id: i64,
    pub org_id: Uuid,
    pub source: String,
    pub payload: serde_json::Value,
    pub status: RawStatus,
    pub error: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

/// Canonical daily sales observation. Unique on (product_id, date);
/// repeat loads overwrite in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SalesRecord {
    pub product_id: Uuid,
    pub date: NaiveDate,
    pub units_sold: i64,
    pub price: f64,
    pub revenue: f64,
}

/// Daily unit cost, used only by the profit objective.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    pub product_id: Uuid,
    pub date: NaiveDate,
    pub unit_cost: f64,
}

/// Immutable lineage anchor for one analytical invocation.
///
/// A run with no `finished_at` is a crashed or in-flight computation and is
/// never used as a source for downstream lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub model_name: String,
    pub model_version: String,
    pub params: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Output of one elasticity estimation, tied to the run that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElasticityEstimate {
    pub product_id: Uuid,
    pub run_id: Uuid,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub elasticity: f64,
    pub r2: f64,
    pub low_confidence: bool,
}

/// One predicted day of unit demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Forecast {
    pub product_id: Uuid,
    pub run_id: Uuid,
    pub target_date: NaiveDate,
    pub predicted_units: f64,
}

/// What the price optimizer maximizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    Revenue,
    Profit,
}

impl Objective {
    pub fn as_str(&self) -> &'static str {
        match self {
            Objective::Revenue => "revenue",
            Objective::Profit => "profit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "revenue" => Some(Objective::Revenue),
            "profit" => Some(Objective::Profit),
            _ => None,
        }
    }
}

impl std::fmt::Display for Objective {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Suggested price for one (product, target date) plus the expected
/// quantities evaluated at that price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceRecommendation {
    pub product_id: Uuid,
    pub run_id: Uuid,
    pub target_date: NaiveDate,
    pub objective: Objective,
    pub suggested_price: f64,
    pub expected_units: f64,
    pub expected_revenue: f64,
    pub expected_profit: f64,
    /// True when the maximizer landed on pmin or pmax, meaning the true
    /// optimum sits outside the explored range.
    pub at_bound: bool,
}
