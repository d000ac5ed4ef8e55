//! Canonical Writer
//!
//! Drains pending raw records for one (organization, source) in bounded
//! batches. Each batch transforms rows independently, then commits the
//! successful subset atomically while marking the failing raws with their
//! reason — a batch is never all-or-nothing across independent rows.
//!
//! Re-running after a crash is a no-op in effect: the (product, date)
//! unique-key upsert makes identical rows idempotent.

use super::mapping::{MappingError, MappingRegistry};
use super::transform::{transform, CanonicalRow};
use crate::config::EtlConfig;
use crate::storage::Database;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// One failing raw record and why, echoed back to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct FailureSample {
    pub raw_id: i64,
    pub reason: String,
}

/// Outcome of one ETL invocation. Success and failure counts are always
/// reported together.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EtlSummary {
    pub processed: usize,
    pub failed: usize,
    pub batches: usize,
    pub products_created: usize,
    /// Bounded sample of failure reasons (first N encountered).
    pub failure_samples: Vec<FailureSample>,
}

/// Fatal failure for the whole ETL call (never for sibling sources).
#[derive(Debug)]
pub enum EtlError {
    UnknownSource(String),
    Storage(anyhow::Error),
}

impl std::fmt::Display for EtlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownSource(source) => {
                write!(f, "unknown_source: no mapping registered for '{}'", source)
            }
            Self::Storage(err) => write!(f, "storage_error: {:#}", err),
        }
    }
}

impl std::error::Error for EtlError {}

impl From<MappingError> for EtlError {
    fn from(err: MappingError) -> Self {
        match err {
            MappingError::UnknownSource(source) => Self::UnknownSource(source),
        }
    }
}

impl From<anyhow::Error> for EtlError {
    fn from(err: anyhow::Error) -> Self {
        Self::Storage(err)
    }
}

/// Drain pending raw records for (org, source) through transform and load.
///
/// `limit` bounds the total rows pulled this invocation; `None` drains
/// everything pending.
pub fn run_etl(
    db: &Database,
    registry: &MappingRegistry,
    org_id: Uuid,
    source: &str,
    limit: Option<usize>,
    cfg: &EtlConfig,
) -> Result<EtlSummary, EtlError> {
    let spec = registry.resolve(source)?;
    let backoff = Duration::from_millis(cfg.retry_backoff_ms);

    let mut summary = EtlSummary::default();
    let mut remaining = limit.unwrap_or(usize::MAX);

    while remaining > 0 {
        let pull = cfg.batch_size.min(remaining);
        let batch = db.pending_raw_records(org_id, source, pull)?;
        if batch.is_empty() {
            break;
        }
        remaining -= batch.len();
        summary.batches += 1;

        let mut loaded: Vec<(i64, CanonicalRow)> = Vec::with_capacity(batch.len());
        let mut failed: Vec<(i64, String)> = Vec::new();

        for raw in &batch {
            match transform(&raw.payload, spec) {
                Ok(row) => loaded.push((raw.raw_id, row)),
                Err(err) => {
                    let reason = err.to_string();
                    if summary.failure_samples.len() < cfg.failure_sample_size {
                        summary.failure_samples.push(FailureSample {
                            raw_id: raw.raw_id,
                            reason: reason.clone(),
                        });
                    }
                    failed.push((raw.raw_id, reason));
                }
            }
        }

        let stats = db.commit_canonical_batch(
            org_id,
            &loaded,
            &failed,
            cfg.max_commit_retries,
            backoff,
        )?;
        summary.processed += stats.raws_processed;
        summary.failed += stats.raws_failed;
        summary.products_created += stats.products_created;
    }

    if summary.failed > 0 {
        warn!(
            "ETL source '{}': {} processed, {} failed across {} batches",
            source, summary.processed, summary.failed, summary.batches
        );
    } else {
        info!(
            "ETL source '{}': {} processed across {} batches",
            source, summary.processed, summary.batches
        );
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup() -> (Database, MappingRegistry, Uuid) {
        let db = Database::open_in_memory().unwrap();
        let org = db.create_organization("acme").unwrap();
        (db, MappingRegistry::builtin(), org.id)
    }

    fn payload(sku: &str, date: &str, units: i64, price: f64) -> serde_json::Value {
        json!({"sku": sku, "date": date, "units_sold": units, "price": price})
    }

    #[test]
    fn unknown_source_fails_structurally() {
        let (db, registry, org) = setup();
        let err = run_etl(&db, &registry, org, "ancient_erp", None, &EtlConfig::default())
            .unwrap_err();
        assert!(matches!(err, EtlError::UnknownSource(ref s) if s == "ancient_erp"));
    }

    #[test]
    fn mixed_batch_commits_good_rows_and_records_failures() {
        let (db, registry, org) = setup();
        db.stage_raw_records(
            org,
            "api",
            &[
                payload("A", "2024-01-01", 5, 10.0),
                json!({"sku": "B", "date": "2024-01-01", "units_sold": -2, "price": 3.0}),
                payload("C", "2024-01-01", 1, 2.0),
            ],
        )
        .unwrap();

        let summary =
            run_etl(&db, &registry, org, "api", None, &EtlConfig::default()).unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.products_created, 2);
        assert_eq!(summary.failure_samples.len(), 1);
        assert!(summary.failure_samples[0].reason.starts_with("domain_validation"));

        // Good rows landed despite the sibling failure.
        let a = db.product_by_sku(org, "A").unwrap().unwrap();
        assert_eq!(db.count_sales(a.id).unwrap(), 1);
        assert!(db.product_by_sku(org, "B").unwrap().is_none());
    }

    #[test]
    fn reingesting_identical_batch_is_idempotent() {
        let (db, registry, org) = setup();
        let rows: Vec<_> = (1..=5)
            .map(|d| payload("SKU-1", &format!("2024-01-{:02}", d), d, 10.0))
            .collect();

        db.stage_raw_records(org, "api", &rows).unwrap();
        run_etl(&db, &registry, org, "api", None, &EtlConfig::default()).unwrap();

        let product = db.product_by_sku(org, "SKU-1").unwrap().unwrap();
        let first = db.sales_history(product.id, 100).unwrap();

        // Same payloads staged and loaded again: canonical set unchanged.
        db.stage_raw_records(org, "api", &rows).unwrap();
        run_etl(&db, &registry, org, "api", None, &EtlConfig::default()).unwrap();

        let second = db.sales_history(product.id, 100).unwrap();
        assert_eq!(db.count_sales(product.id).unwrap(), 5);
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.date, b.date);
            assert_eq!(a.units_sold, b.units_sold);
            assert_eq!(a.price, b.price);
        }
    }

    #[test]
    fn limit_bounds_rows_pulled() {
        let (db, registry, org) = setup();
        let rows: Vec<_> = (1..=8)
            .map(|d| payload("SKU-1", &format!("2024-02-{:02}", d), d, 10.0))
            .collect();
        db.stage_raw_records(org, "api", &rows).unwrap();

        let cfg = EtlConfig {
            batch_size: 3,
            ..EtlConfig::default()
        };
        let summary = run_etl(&db, &registry, org, "api", Some(5), &cfg).unwrap();
        assert_eq!(summary.processed, 5);
        assert_eq!(summary.batches, 2);

        // The rest stays pending for the next invocation.
        assert_eq!(db.pending_raw_records(org, "api", 100).unwrap().len(), 3);
    }

    #[test]
    fn failure_samples_are_bounded() {
        let (db, registry, org) = setup();
        let bad: Vec<_> = (0..20)
            .map(|i| json!({"sku": format!("S{}", i), "date": "nope", "units_sold": 1, "price": 1.0}))
            .collect();
        db.stage_raw_records(org, "api", &bad).unwrap();

        let cfg = EtlConfig {
            failure_sample_size: 4,
            ..EtlConfig::default()
        };
        let summary = run_etl(&db, &registry, org, "api", None, &cfg).unwrap();
        assert_eq!(summary.failed, 20);
        assert_eq!(summary.failure_samples.len(), 4);
    }
}
