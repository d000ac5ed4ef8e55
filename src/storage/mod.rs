//! SQLite-backed canonical store
//!
//! Single-connection storage behind a parking_lot mutex:
//! - WAL mode so readers are not blocked during batch loads
//! - prepared statement caching for hot queries
//! - batch writes inside IMMEDIATE transactions
//! - unique-key upserts so repeat loads are idempotent
//!
//! Unique constraints enforce the keys of the data model: (org, sku) for
//! products, (product, date) for sales and costs. Runs are write-once after
//! completion; every derived artifact references exactly one run.

use crate::etl::transform::CanonicalRow;
use crate::models::{
    CostRecord, ElasticityEstimate, Forecast, Objective, Organization, PriceRecommendation,
    Product, RawRecord, RawStatus, Run, SalesRecord,
};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OpenFlags, TransactionBehavior};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
PRAGMA cache_size = -32000;  -- 32MB cache
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS organizations (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS products (
    id TEXT PRIMARY KEY,
    org_id TEXT NOT NULL REFERENCES organizations(id),
    sku TEXT NOT NULL,
    name TEXT NOT NULL,
    currency TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(org_id, sku)
) WITHOUT ROWID;

-- Staging area: payload is write-once, only status/error transition.
CREATE TABLE IF NOT EXISTS raw_records (
    raw_id INTEGER PRIMARY KEY AUTOINCREMENT,
    org_id TEXT NOT NULL REFERENCES organizations(id),
    source TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    error TEXT,
    uploaded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_raw_pending
    ON raw_records(org_id, source, raw_id) WHERE status = 'pending';

CREATE TABLE IF NOT EXISTS sales_daily (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    product_id TEXT NOT NULL REFERENCES products(id),
    date TEXT NOT NULL,
    units_sold INTEGER NOT NULL,
    price REAL NOT NULL,
    revenue REAL NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(product_id, date)
);

CREATE TABLE IF NOT EXISTS costs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    product_id TEXT NOT NULL REFERENCES products(id),
    date TEXT NOT NULL,
    unit_cost REAL NOT NULL,
    UNIQUE(product_id, date)
);

-- Lineage anchor: finished_at is stamped exactly once, after all derived
-- rows for the invocation have committed.
CREATE TABLE IF NOT EXISTS model_runs (
    id TEXT PRIMARY KEY,
    model_name TEXT NOT NULL,
    model_version TEXT NOT NULL,
    params_json TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS elasticity_estimates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    product_id TEXT NOT NULL REFERENCES products(id),
    run_id TEXT NOT NULL REFERENCES model_runs(id),
    window_start TEXT NOT NULL,
    window_end TEXT NOT NULL,
    elasticity REAL NOT NULL,
    r2 REAL NOT NULL,
    low_confidence INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_elasticity_product
    ON elasticity_estimates(product_id, id DESC);

CREATE TABLE IF NOT EXISTS forecasts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    product_id TEXT NOT NULL REFERENCES products(id),
    run_id TEXT NOT NULL REFERENCES model_runs(id),
    target_date TEXT NOT NULL,
    predicted_units REAL NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_forecasts_product_date
    ON forecasts(product_id, target_date, id DESC);

CREATE TABLE IF NOT EXISTS price_recommendations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    product_id TEXT NOT NULL REFERENCES products(id),
    run_id TEXT NOT NULL REFERENCES model_runs(id),
    target_date TEXT NOT NULL,
    objective TEXT NOT NULL,
    suggested_price REAL NOT NULL,
    expected_units REAL NOT NULL,
    expected_revenue REAL NOT NULL,
    expected_profit REAL NOT NULL,
    at_bound INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_recs_product_date
    ON price_recommendations(product_id, target_date, id DESC);
"#;

/// Stats returned by one canonical batch commit.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchCommitStats {
    pub rows_upserted: usize,
    pub products_created: usize,
    pub raws_processed: usize,
    pub raws_failed: usize,
}

/// Handle to the canonical store. Cheap to clone; all methods take `&self`.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

fn parse_date(idx: usize, s: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_uuid(idx: usize, s: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// True for transient lock contention that a bounded retry may clear.
pub fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
    )
}

impl Database {
    /// Open (and if needed create) the store at `db_path`.
    pub fn open(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // we handle our own locking

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;
        Self::init(conn, db_path)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn, ":memory:")
    }

    fn init(conn: Connection, label: &str) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;
        conn.busy_timeout(Duration::from_millis(250))
            .context("Failed to set busy timeout")?;
        info!("📊 Canonical store ready at: {}", label);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ------------------------------------------------------------------
    // Organizations & products
    // ------------------------------------------------------------------

    pub fn create_organization(&self, name: &str) -> Result<Organization> {
        let org = Organization {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO organizations (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![org.id.to_string(), org.name, org.created_at.to_rfc3339()],
        )?;
        Ok(org)
    }

    /// The only mutation organizations support.
    pub fn rename_organization(&self, org_id: Uuid, name: &str) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE organizations SET name = ?2 WHERE id = ?1",
            params![org_id.to_string(), name],
        )?;
        anyhow::ensure!(changed == 1, "organization {} not found", org_id);
        Ok(())
    }

    pub fn organization(&self, org_id: Uuid) -> Result<Option<Organization>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT id, name, created_at FROM organizations WHERE id = ?1")?;
        let org = stmt
            .query_row(params![org_id.to_string()], |row| {
                Ok(Organization {
                    id: parse_uuid(0, &row.get::<_, String>(0)?)?,
                    name: row.get(1)?,
                    created_at: parse_ts(2, &row.get::<_, String>(2)?)?,
                })
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(org)
    }

    pub fn create_product(
        &self,
        org_id: Uuid,
        sku: &str,
        name: &str,
        currency: &str,
    ) -> Result<Product> {
        let product = Product {
            id: Uuid::new_v4(),
            org_id,
            sku: sku.to_string(),
            name: name.to_string(),
            currency: currency.to_string(),
            created_at: Utc::now(),
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO products (id, org_id, sku, name, currency, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                product.id.to_string(),
                product.org_id.to_string(),
                product.sku,
                product.name,
                product.currency,
                product.created_at.to_rfc3339(),
            ],
        )
        .with_context(|| format!("Failed to create product {} for org {}", sku, org_id))?;
        Ok(product)
    }

    fn row_to_product(row: &rusqlite::Row) -> rusqlite::Result<Product> {
        Ok(Product {
            id: parse_uuid(0, &row.get::<_, String>(0)?)?,
            org_id: parse_uuid(1, &row.get::<_, String>(1)?)?,
            sku: row.get(2)?,
            name: row.get(3)?,
            currency: row.get(4)?,
            created_at: parse_ts(5, &row.get::<_, String>(5)?)?,
        })
    }

    pub fn product(&self, product_id: Uuid) -> Result<Option<Product>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, org_id, sku, name, currency, created_at FROM products WHERE id = ?1",
        )?;
        let product = stmt
            .query_row(params![product_id.to_string()], Self::row_to_product)
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(product)
    }

    pub fn product_by_sku(&self, org_id: Uuid, sku: &str) -> Result<Option<Product>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, org_id, sku, name, currency, created_at
             FROM products WHERE org_id = ?1 AND sku = ?2",
        )?;
        let product = stmt
            .query_row(params![org_id.to_string(), sku], Self::row_to_product)
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(product)
    }

    pub fn list_products(&self, org_id: Uuid) -> Result<Vec<Product>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, org_id, sku, name, currency, created_at
             FROM products WHERE org_id = ?1 ORDER BY sku",
        )?;
        let products = stmt
            .query_map(params![org_id.to_string()], Self::row_to_product)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(products)
    }

    // ------------------------------------------------------------------
    // Staging buffer
    // ------------------------------------------------------------------

    /// Stage raw payloads as pending, all in one transaction.
    pub fn stage_raw_records(
        &self,
        org_id: Uuid,
        source: &str,
        payloads: &[serde_json::Value],
    ) -> Result<usize> {
        if payloads.is_empty() {
            return Ok(0);
        }
        // Pre-serialize outside the lock
        let serialized: Vec<String> = payloads
            .iter()
            .map(|p| serde_json::to_string(p))
            .collect::<std::result::Result<_, _>>()?;

        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO raw_records (org_id, source, payload_json, status, uploaded_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4)",
            )?;
            for json in &serialized {
                stmt.execute(params![org_id.to_string(), source, json, now])?;
            }
        }
        tx.commit()?;
        debug!("📦 Staged {} raw records from source '{}'", serialized.len(), source);
        Ok(serialized.len())
    }

    /// Oldest pending raw rows for (org, source), up to `limit`.
    pub fn pending_raw_records(
        &self,
        org_id: Uuid,
        source: &str,
        limit: usize,
    ) -> Result<Vec<RawRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT raw_id, org_id, source, payload_json, status, error, uploaded_at
             FROM raw_records
             WHERE org_id = ?1 AND source = ?2 AND status = 'pending'
             ORDER BY raw_id
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![org_id.to_string(), source, limit], |row| {
                let payload_json: String = row.get(3)?;
                let payload = serde_json::from_str(&payload_json).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        3,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?;
                let status_str: String = row.get(4)?;
                Ok(RawRecord {
                    raw_id: row.get(0)?,
                    org_id: parse_uuid(1, &row.get::<_, String>(1)?)?,
                    source: row.get(2)?,
                    payload,
                    status: RawStatus::parse(&status_str).unwrap_or(RawStatus::Pending),
                    error: row.get(5)?,
                    uploaded_at: parse_ts(6, &row.get::<_, String>(6)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Lookup for tests and failure inspection.
    pub fn raw_record(&self, raw_id: i64) -> Result<Option<RawRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT raw_id, org_id, source, payload_json, status, error, uploaded_at
             FROM raw_records WHERE raw_id = ?1",
        )?;
        let row = stmt
            .query_row(params![raw_id], |row| {
                let payload_json: String = row.get(3)?;
                let payload = serde_json::from_str(&payload_json).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        3,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?;
                let status_str: String = row.get(4)?;
                Ok(RawRecord {
                    raw_id: row.get(0)?,
                    org_id: parse_uuid(1, &row.get::<_, String>(1)?)?,
                    source: row.get(2)?,
                    payload,
                    status: RawStatus::parse(&status_str).unwrap_or(RawStatus::Pending),
                    error: row.get(5)?,
                    uploaded_at: parse_ts(6, &row.get::<_, String>(6)?)?,
                })
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(row)
    }

    // ------------------------------------------------------------------
    // Canonical writer
    // ------------------------------------------------------------------

    /// Commit one transformed batch atomically: resolve-or-create products,
    /// upsert sales rows by (product, date), flip raw statuses.
    ///
    /// Successful rows commit even when sibling rows failed transform; the
    /// failing raws are marked failed with their reason in the same
    /// transaction. Transient lock contention is retried a bounded number of
    /// times before surfacing.
    pub fn commit_canonical_batch(
        &self,
        org_id: Uuid,
        loaded: &[(i64, CanonicalRow)],
        failed: &[(i64, String)],
        max_retries: u32,
        backoff: Duration,
    ) -> Result<BatchCommitStats> {
        let mut attempt = 0;
        loop {
            match self.try_commit_canonical_batch(org_id, loaded, failed) {
                Ok(stats) => return Ok(stats),
                Err(err) if is_busy(&err) && attempt < max_retries => {
                    attempt += 1;
                    warn!(
                        "Canonical batch commit hit lock contention, retry {}/{}",
                        attempt, max_retries
                    );
                    std::thread::sleep(backoff);
                }
                Err(err) => {
                    return Err(anyhow::Error::new(err).context("Canonical batch commit failed"))
                }
            }
        }
    }

    fn try_commit_canonical_batch(
        &self,
        org_id: Uuid,
        loaded: &[(i64, CanonicalRow)],
        failed: &[(i64, String)],
    ) -> rusqlite::Result<BatchCommitStats> {
        let now = Utc::now().to_rfc3339();
        let mut stats = BatchCommitStats::default();
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            // Batch-local cache so each SKU is resolved once.
            let mut product_ids: HashMap<String, String> = HashMap::new();

            let mut find_product = tx.prepare_cached(
                "SELECT id FROM products WHERE org_id = ?1 AND sku = ?2",
            )?;
            let mut insert_product = tx.prepare_cached(
                "INSERT INTO products (id, org_id, sku, name, currency, created_at)
                 VALUES (?1, ?2, ?3, ?4, 'USD', ?5)",
            )?;
            let mut upsert_sale = tx.prepare_cached(
                "INSERT INTO sales_daily (product_id, date, units_sold, price, revenue, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(product_id, date) DO UPDATE SET
                     units_sold = excluded.units_sold,
                     price = excluded.price,
                     revenue = excluded.revenue,
                     created_at = excluded.created_at",
            )?;
            let mut mark_processed = tx.prepare_cached(
                "UPDATE raw_records SET status = 'processed', error = NULL WHERE raw_id = ?1",
            )?;
            let mut mark_failed = tx.prepare_cached(
                "UPDATE raw_records SET status = 'failed', error = ?2 WHERE raw_id = ?1",
            )?;

            for (raw_id, row) in loaded {
                let product_id = match product_ids.get(&row.sku) {
                    Some(id) => id.clone(),
                    None => {
                        let existing: Option<String> = find_product
                            .query_row(params![org_id.to_string(), row.sku], |r| r.get(0))
                            .map(Some)
                            .or_else(|e| match e {
                                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                                other => Err(other),
                            })?;
                        let id = match existing {
                            Some(id) => id,
                            None => {
                                let id = Uuid::new_v4().to_string();
                                insert_product.execute(params![
                                    id,
                                    org_id.to_string(),
                                    row.sku,
                                    row.sku, // display name defaults to the SKU
                                    now,
                                ])?;
                                stats.products_created += 1;
                                id
                            }
                        };
                        product_ids.insert(row.sku.clone(), id.clone());
                        id
                    }
                };

                upsert_sale.execute(params![
                    product_id,
                    row.date.to_string(),
                    row.units_sold,
                    row.price,
                    row.revenue,
                    now,
                ])?;
                mark_processed.execute(params![raw_id])?;
                stats.rows_upserted += 1;
                stats.raws_processed += 1;
            }

            for (raw_id, reason) in failed {
                mark_failed.execute(params![raw_id, reason])?;
                stats.raws_failed += 1;
            }
        }
        tx.commit()?;
        Ok(stats)
    }

    // ------------------------------------------------------------------
    // Canonical reads
    // ------------------------------------------------------------------

    fn row_to_sale(row: &rusqlite::Row) -> rusqlite::Result<SalesRecord> {
        Ok(SalesRecord {
            product_id: parse_uuid(0, &row.get::<_, String>(0)?)?,
            date: parse_date(1, &row.get::<_, String>(1)?)?,
            units_sold: row.get(2)?,
            price: row.get(3)?,
            revenue: row.get(4)?,
        })
    }

    /// Sales rows for a product in [start, end], ascending by date.
    pub fn sales_window(
        &self,
        product_id: Uuid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<SalesRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT product_id, date, units_sold, price, revenue
             FROM sales_daily
             WHERE product_id = ?1 AND date >= ?2 AND date <= ?3
             ORDER BY date",
        )?;
        let rows = stmt
            .query_map(
                params![product_id.to_string(), start.to_string(), end.to_string()],
                Self::row_to_sale,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Most recent `cap` sales rows for a product, returned ascending by date.
    pub fn sales_history(&self, product_id: Uuid, cap: usize) -> Result<Vec<SalesRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT product_id, date, units_sold, price, revenue FROM (
                 SELECT product_id, date, units_sold, price, revenue
                 FROM sales_daily
                 WHERE product_id = ?1
                 ORDER BY date DESC
                 LIMIT ?2
             ) ORDER BY date",
        )?;
        let rows = stmt
            .query_map(params![product_id.to_string(), cap], Self::row_to_sale)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn latest_sale(&self, product_id: Uuid) -> Result<Option<SalesRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT product_id, date, units_sold, price, revenue
             FROM sales_daily WHERE product_id = ?1
             ORDER BY date DESC LIMIT 1",
        )?;
        let row = stmt
            .query_row(params![product_id.to_string()], Self::row_to_sale)
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(row)
    }

    pub fn count_sales(&self, product_id: Uuid) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM sales_daily WHERE product_id = ?1",
            params![product_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Costs
    // ------------------------------------------------------------------

    pub fn upsert_cost(&self, cost: &CostRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO costs (product_id, date, unit_cost) VALUES (?1, ?2, ?3)
             ON CONFLICT(product_id, date) DO UPDATE SET unit_cost = excluded.unit_cost",
            params![
                cost.product_id.to_string(),
                cost.date.to_string(),
                cost.unit_cost
            ],
        )?;
        Ok(())
    }

    /// Unit cost recorded for exactly (product, date), if any.
    pub fn unit_cost_on(&self, product_id: Uuid, date: NaiveDate) -> Result<Option<f64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT unit_cost FROM costs WHERE product_id = ?1 AND date = ?2",
        )?;
        let cost = stmt
            .query_row(params![product_id.to_string(), date.to_string()], |row| {
                row.get(0)
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(cost)
    }

    // ------------------------------------------------------------------
    // Lineage tracker
    // ------------------------------------------------------------------

    /// Open a run before any analytical work starts.
    pub fn open_run(
        &self,
        model_name: &str,
        model_version: &str,
        params_snapshot: serde_json::Value,
    ) -> Result<Run> {
        let run = Run {
            id: Uuid::new_v4(),
            model_name: model_name.to_string(),
            model_version: model_version.to_string(),
            params: params_snapshot,
            started_at: Utc::now(),
            finished_at: None,
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO model_runs (id, model_name, model_version, params_json, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run.id.to_string(),
                run.model_name,
                run.model_version,
                serde_json::to_string(&run.params)?,
                run.started_at.to_rfc3339(),
            ],
        )?;
        debug!("🧾 Opened run {} ({})", run.id, run.model_name);
        Ok(run)
    }

    /// Merge extra keys into the run's parameter snapshot while the run is
    /// still open (used to record accuracy metrics computed mid-flight).
    pub fn amend_run_params(&self, run_id: Uuid, extra: serde_json::Value) -> Result<()> {
        let conn = self.conn.lock();
        let current: String = conn.query_row(
            "SELECT params_json FROM model_runs WHERE id = ?1 AND finished_at IS NULL",
            params![run_id.to_string()],
            |row| row.get(0),
        )?;
        let mut params_value: serde_json::Value = serde_json::from_str(&current)?;
        if let (Some(obj), Some(extra_obj)) = (params_value.as_object_mut(), extra.as_object()) {
            for (k, v) in extra_obj {
                obj.insert(k.clone(), v.clone());
            }
        }
        conn.execute(
            "UPDATE model_runs SET params_json = ?2 WHERE id = ?1",
            params![run_id.to_string(), serde_json::to_string(&params_value)?],
        )?;
        Ok(())
    }

    /// Stamp the completion time. Write-once: completing twice is an error.
    pub fn complete_run(&self, run_id: Uuid) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE model_runs SET finished_at = ?2 WHERE id = ?1 AND finished_at IS NULL",
            params![run_id.to_string(), Utc::now().to_rfc3339()],
        )?;
        anyhow::ensure!(changed == 1, "run {} missing or already completed", run_id);
        Ok(())
    }

    pub fn run(&self, run_id: Uuid) -> Result<Option<Run>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, model_name, model_version, params_json, started_at, finished_at
             FROM model_runs WHERE id = ?1",
        )?;
        let run = stmt
            .query_row(params![run_id.to_string()], |row| {
                let params_json: String = row.get(3)?;
                let params_value = serde_json::from_str(&params_json).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        3,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?;
                let finished: Option<String> = row.get(5)?;
                Ok(Run {
                    id: parse_uuid(0, &row.get::<_, String>(0)?)?,
                    model_name: row.get(1)?,
                    model_version: row.get(2)?,
                    params: params_value,
                    started_at: parse_ts(4, &row.get::<_, String>(4)?)?,
                    finished_at: match finished {
                        Some(s) => Some(parse_ts(5, &s)?),
                        None => None,
                    },
                })
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(run)
    }

    // ------------------------------------------------------------------
    // Derived artifacts
    // ------------------------------------------------------------------

    pub fn insert_elasticity_estimate(&self, est: &ElasticityEstimate) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO elasticity_estimates
             (product_id, run_id, window_start, window_end, elasticity, r2, low_confidence)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                est.product_id.to_string(),
                est.run_id.to_string(),
                est.window_start.to_string(),
                est.window_end.to_string(),
                est.elasticity,
                est.r2,
                est.low_confidence as i64,
            ],
        )?;
        Ok(())
    }

    fn row_to_estimate(row: &rusqlite::Row) -> rusqlite::Result<ElasticityEstimate> {
        Ok(ElasticityEstimate {
            product_id: parse_uuid(0, &row.get::<_, String>(0)?)?,
            run_id: parse_uuid(1, &row.get::<_, String>(1)?)?,
            window_start: parse_date(2, &row.get::<_, String>(2)?)?,
            window_end: parse_date(3, &row.get::<_, String>(3)?)?,
            elasticity: row.get(4)?,
            r2: row.get(5)?,
            low_confidence: row.get::<_, i64>(6)? != 0,
        })
    }

    /// Most recent estimate whose run completed. Incomplete runs are never
    /// trusted as a source.
    pub fn latest_completed_elasticity(
        &self,
        product_id: Uuid,
    ) -> Result<Option<ElasticityEstimate>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT e.product_id, e.run_id, e.window_start, e.window_end,
                    e.elasticity, e.r2, e.low_confidence
             FROM elasticity_estimates e
             JOIN model_runs r ON r.id = e.run_id
             WHERE e.product_id = ?1 AND r.finished_at IS NOT NULL
             ORDER BY e.id DESC
             LIMIT 1",
        )?;
        let est = stmt
            .query_row(params![product_id.to_string()], Self::row_to_estimate)
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(est)
    }

    pub fn insert_forecasts(&self, rows: &[Forecast]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO forecasts (product_id, run_id, target_date, predicted_units)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for f in rows {
                stmt.execute(params![
                    f.product_id.to_string(),
                    f.run_id.to_string(),
                    f.target_date.to_string(),
                    f.predicted_units,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Latest completed-run prediction for (product, date), if one exists.
    pub fn latest_forecast_units(
        &self,
        product_id: Uuid,
        target_date: NaiveDate,
    ) -> Result<Option<f64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT f.predicted_units
             FROM forecasts f
             JOIN model_runs r ON r.id = f.run_id
             WHERE f.product_id = ?1 AND f.target_date = ?2 AND r.finished_at IS NOT NULL
             ORDER BY f.id DESC
             LIMIT 1",
        )?;
        let units = stmt
            .query_row(
                params![product_id.to_string(), target_date.to_string()],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(units)
    }

    fn row_to_forecast(row: &rusqlite::Row) -> rusqlite::Result<Forecast> {
        Ok(Forecast {
            product_id: parse_uuid(0, &row.get::<_, String>(0)?)?,
            run_id: parse_uuid(1, &row.get::<_, String>(1)?)?,
            target_date: parse_date(2, &row.get::<_, String>(2)?)?,
            predicted_units: row.get(3)?,
        })
    }

    /// Paginated forecast reads for the request layer. Date bounds inclusive.
    pub fn forecasts_page(
        &self,
        product_id: Uuid,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Forecast>> {
        let from = from.map(|d| d.to_string()).unwrap_or_else(|| "0000-01-01".into());
        let to = to.map(|d| d.to_string()).unwrap_or_else(|| "9999-12-31".into());
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT product_id, run_id, target_date, predicted_units
             FROM forecasts
             WHERE product_id = ?1 AND target_date >= ?2 AND target_date <= ?3
             ORDER BY target_date, id
             LIMIT ?4 OFFSET ?5",
        )?;
        let rows = stmt
            .query_map(
                params![product_id.to_string(), from, to, limit, offset],
                Self::row_to_forecast,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn insert_recommendations(&self, rows: &[PriceRecommendation]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO price_recommendations
                 (product_id, run_id, target_date, objective, suggested_price,
                  expected_units, expected_revenue, expected_profit, at_bound)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for rec in rows {
                stmt.execute(params![
                    rec.product_id.to_string(),
                    rec.run_id.to_string(),
                    rec.target_date.to_string(),
                    rec.objective.as_str(),
                    rec.suggested_price,
                    rec.expected_units,
                    rec.expected_revenue,
                    rec.expected_profit,
                    rec.at_bound as i64,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn row_to_recommendation(row: &rusqlite::Row) -> rusqlite::Result<PriceRecommendation> {
        let objective_str: String = row.get(3)?;
        Ok(PriceRecommendation {
            product_id: parse_uuid(0, &row.get::<_, String>(0)?)?,
            run_id: parse_uuid(1, &row.get::<_, String>(1)?)?,
            target_date: parse_date(2, &row.get::<_, String>(2)?)?,
            objective: Objective::parse(&objective_str).unwrap_or(Objective::Revenue),
            suggested_price: row.get(4)?,
            expected_units: row.get(5)?,
            expected_revenue: row.get(6)?,
            expected_profit: row.get(7)?,
            at_bound: row.get::<_, i64>(8)? != 0,
        })
    }

    /// Paginated recommendation reads, optionally filtered by objective.
    pub fn recommendations_page(
        &self,
        product_id: Uuid,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        objective: Option<Objective>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<PriceRecommendation>> {
        let from = from.map(|d| d.to_string()).unwrap_or_else(|| "0000-01-01".into());
        let to = to.map(|d| d.to_string()).unwrap_or_else(|| "9999-12-31".into());
        // Empty objective filter matches everything.
        let objective = objective.map(|o| o.as_str().to_string()).unwrap_or_default();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT product_id, run_id, target_date, objective, suggested_price,
                    expected_units, expected_revenue, expected_profit, at_bound
             FROM price_recommendations
             WHERE product_id = ?1 AND target_date >= ?2 AND target_date <= ?3
               AND (?4 = '' OR objective = ?4)
             ORDER BY target_date, id
             LIMIT ?5 OFFSET ?6",
        )?;
        let rows = stmt
            .query_map(
                params![product_id.to_string(), from, to, objective, limit, offset],
                Self::row_to_recommendation,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn count_recommendations(&self, product_id: Uuid) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM price_recommendations WHERE product_id = ?1",
            params![product_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn canonical(sku: &str, date: &str, units: i64, price: f64) -> CanonicalRow {
        CanonicalRow {
            sku: sku.to_string(),
            date: date.parse().unwrap(),
            units_sold: units,
            price,
            revenue: units as f64 * price,
        }
    }

    #[test]
    fn upsert_overwrites_same_product_date() {
        let db = test_db();
        let org = db.create_organization("acme").unwrap();

        db.stage_raw_records(org.id, "api", &[serde_json::json!({}), serde_json::json!({})])
            .unwrap();
        db.commit_canonical_batch(
            org.id,
            &[(1, canonical("SKU-1", "2024-03-01", 5, 10.0))],
            &[],
            0,
            Duration::from_millis(1),
        )
        .unwrap();
        db.commit_canonical_batch(
            org.id,
            &[(2, canonical("SKU-1", "2024-03-01", 7, 12.0))],
            &[],
            0,
            Duration::from_millis(1),
        )
        .unwrap();

        let product = db.product_by_sku(org.id, "SKU-1").unwrap().unwrap();
        assert_eq!(db.count_sales(product.id).unwrap(), 1);
        let sale = db.latest_sale(product.id).unwrap().unwrap();
        assert_eq!(sale.units_sold, 7);
        assert_eq!(sale.price, 12.0);
        assert_eq!(sale.revenue, 84.0);
    }

    #[test]
    fn batch_commit_flips_raw_statuses() {
        let db = test_db();
        let org = db.create_organization("acme").unwrap();
        db.stage_raw_records(org.id, "api", &[serde_json::json!({}), serde_json::json!({})])
            .unwrap();

        db.commit_canonical_batch(
            org.id,
            &[(1, canonical("A", "2024-01-01", 3, 4.0))],
            &[(2, "coercion_error: units_sold".to_string())],
            0,
            Duration::from_millis(1),
        )
        .unwrap();

        let ok = db.raw_record(1).unwrap().unwrap();
        assert_eq!(ok.status, RawStatus::Processed);
        assert!(ok.error.is_none());

        let bad = db.raw_record(2).unwrap().unwrap();
        assert_eq!(bad.status, RawStatus::Failed);
        assert_eq!(bad.error.as_deref(), Some("coercion_error: units_sold"));

        assert!(db.pending_raw_records(org.id, "api", 10).unwrap().is_empty());
    }

    #[test]
    fn run_completion_is_write_once() {
        let db = test_db();
        let run = db
            .open_run("log_log_ols", "1.0", serde_json::json!({"window_days": 90}))
            .unwrap();
        assert!(db.run(run.id).unwrap().unwrap().finished_at.is_none());

        db.complete_run(run.id).unwrap();
        assert!(db.run(run.id).unwrap().unwrap().finished_at.is_some());

        // Second completion must be rejected.
        assert!(db.complete_run(run.id).is_err());
    }

    #[test]
    fn incomplete_runs_are_invisible_to_lookups() {
        let db = test_db();
        let org = db.create_organization("acme").unwrap();
        let product = db.create_product(org.id, "SKU-1", "Widget", "USD").unwrap();

        let run = db.open_run("log_log_ols", "1.0", serde_json::json!({})).unwrap();
        db.insert_elasticity_estimate(&ElasticityEstimate {
            product_id: product.id,
            run_id: run.id,
            window_start: "2024-01-01".parse().unwrap(),
            window_end: "2024-03-31".parse().unwrap(),
            elasticity: -1.3,
            r2: 0.8,
            low_confidence: false,
        })
        .unwrap();

        // Run still open: not a trusted source.
        assert!(db.latest_completed_elasticity(product.id).unwrap().is_none());

        db.complete_run(run.id).unwrap();
        let est = db.latest_completed_elasticity(product.id).unwrap().unwrap();
        assert_eq!(est.run_id, run.id);
        assert!((est.elasticity + 1.3).abs() < 1e-9);
    }

    #[test]
    fn forecast_pagination_respects_bounds() {
        let db = test_db();
        let org = db.create_organization("acme").unwrap();
        let product = db.create_product(org.id, "SKU-1", "Widget", "USD").unwrap();
        let run = db.open_run("demand_forecast", "1.0", serde_json::json!({})).unwrap();

        let rows: Vec<Forecast> = (1..=9)
            .map(|d| Forecast {
                product_id: product.id,
                run_id: run.id,
                target_date: NaiveDate::from_ymd_opt(2024, 4, d).unwrap(),
                predicted_units: d as f64,
            })
            .collect();
        db.insert_forecasts(&rows).unwrap();
        db.complete_run(run.id).unwrap();

        let page = db
            .forecasts_page(product.id, None, None, 4, 4)
            .unwrap();
        assert_eq!(page.len(), 4);
        assert_eq!(page[0].target_date, NaiveDate::from_ymd_opt(2024, 4, 5).unwrap());

        let bounded = db
            .forecasts_page(
                product.id,
                Some(NaiveDate::from_ymd_opt(2024, 4, 3).unwrap()),
                Some(NaiveDate::from_ymd_opt(2024, 4, 5).unwrap()),
                100,
                0,
            )
            .unwrap();
        assert_eq!(bounded.len(), 3);
    }

    #[test]
    fn cost_lookup_is_exact_date() {
        let db = test_db();
        let org = db.create_organization("acme").unwrap();
        let product = db.create_product(org.id, "SKU-1", "Widget", "USD").unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();

        db.upsert_cost(&CostRecord {
            product_id: product.id,
            date,
            unit_cost: 4.5,
        })
        .unwrap();

        assert_eq!(db.unit_cost_on(product.id, date).unwrap(), Some(4.5));
        assert_eq!(
            db.unit_cost_on(product.id, date.succ_opt().unwrap()).unwrap(),
            None
        );

        // Upsert replaces in place.
        db.upsert_cost(&CostRecord {
            product_id: product.id,
            date,
            unit_cost: 5.0,
        })
        .unwrap();
        assert_eq!(db.unit_cost_on(product.id, date).unwrap(), Some(5.0));
    }
}
