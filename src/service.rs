//! Service facade
//!
//! The surface the (external, out-of-scope) request layer calls into:
//! ingestion, ETL triggering, the three analytics entry points, and
//! paginated read accessors. Every entry point is an independent unit of
//! work over (product, parameters, canonical state); invocations for
//! different products may run concurrently, serialization of conflicting
//! writes is left to the store's transaction isolation.

use crate::analytics::elasticity::{estimate_elasticity, ElasticityOutcome};
use crate::analytics::forecast::{run_forecast, ForecastOutcome};
use crate::analytics::pricing::{recommend_prices, PricingOutcome, PricingParams};
use crate::analytics::AnalyticsError;
use crate::config::PipelineConfig;
use crate::etl::loader::{run_etl, EtlError, EtlSummary};
use crate::etl::mapping::MappingRegistry;
use crate::models::{
    CostRecord, Forecast, Objective, Organization, PriceRecommendation, Product,
};
use crate::storage::Database;
use anyhow::Result;
use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Counts returned by the ingestion entry point.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct IngestSummary {
    /// Records staged as pending.
    pub accepted: usize,
    /// Records refused at the door (not JSON objects).
    pub rejected: usize,
}

/// Page of results plus the paging actually applied.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub offset: usize,
    pub page_size: usize,
}

/// Entry points for the request layer. Clone is cheap; the database handle
/// and mapping registry are shared.
#[derive(Clone)]
pub struct PricingService {
    db: Arc<Database>,
    mappings: Arc<MappingRegistry>,
    config: PipelineConfig,
}

impl PricingService {
    pub fn new(db: Database, mappings: MappingRegistry, config: PipelineConfig) -> Self {
        Self {
            db: Arc::new(db),
            mappings: Arc::new(mappings),
            config,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    // ------------------------------------------------------------------
    // Tenancy
    // ------------------------------------------------------------------

    pub async fn create_organization(&self, name: &str) -> Result<Organization> {
        self.db.create_organization(name)
    }

    pub async fn create_product(
        &self,
        org_id: Uuid,
        sku: &str,
        name: &str,
        currency: &str,
    ) -> Result<Product> {
        self.db.create_product(org_id, sku, name, currency)
    }

    pub async fn list_products(&self, org_id: Uuid) -> Result<Vec<Product>> {
        self.db.list_products(org_id)
    }

    pub async fn upsert_cost(
        &self,
        product_id: Uuid,
        date: NaiveDate,
        unit_cost: f64,
    ) -> Result<()> {
        anyhow::ensure!(unit_cost >= 0.0, "unit_cost must be non-negative");
        self.db.upsert_cost(&CostRecord {
            product_id,
            date,
            unit_cost,
        })
    }

    // ------------------------------------------------------------------
    // Ingestion + ETL
    // ------------------------------------------------------------------

    /// Stage a batch of raw structured records for (source, org). Payloads
    /// that are not JSON objects are rejected immediately; everything else
    /// is accepted as pending, validation happens at transform time.
    pub async fn ingest_raw(
        &self,
        source: &str,
        org_id: Uuid,
        records: Vec<serde_json::Value>,
    ) -> Result<IngestSummary> {
        let (objects, rejects): (Vec<_>, Vec<_>) =
            records.into_iter().partition(|r| r.is_object());
        let accepted = self.db.stage_raw_records(org_id, source, &objects)?;
        if !rejects.is_empty() {
            debug!(
                "Rejected {} non-object payloads from source '{}'",
                rejects.len(),
                source
            );
        }
        Ok(IngestSummary {
            accepted,
            rejected: rejects.len(),
        })
    }

    /// Run the transform/load pipeline for pending records of (source, org).
    pub async fn run_etl(
        &self,
        source: &str,
        org_id: Uuid,
        limit: Option<usize>,
    ) -> Result<EtlSummary, EtlError> {
        run_etl(
            &self.db,
            &self.mappings,
            org_id,
            source,
            limit,
            &self.config.etl,
        )
    }

    // ------------------------------------------------------------------
    // Analytics
    // ------------------------------------------------------------------

    pub async fn estimate_elasticity(
        &self,
        product_id: Uuid,
        window_days: Option<u32>,
    ) -> Result<ElasticityOutcome, AnalyticsError> {
        let mut cfg = self.config.elasticity.clone();
        if let Some(days) = window_days {
            cfg.window_days = days;
        }
        estimate_elasticity(&self.db, product_id, &cfg)
    }

    pub async fn run_forecast(
        &self,
        product_id: Uuid,
        horizon: u32,
    ) -> Result<ForecastOutcome, AnalyticsError> {
        run_forecast(&self.db, product_id, horizon, &self.config.forecast)
    }

    pub async fn recommend_prices(
        &self,
        product_id: Uuid,
        params: PricingParams,
    ) -> Result<PricingOutcome, AnalyticsError> {
        recommend_prices(&self.db, product_id, &params, &self.config.pricing)
    }

    // ------------------------------------------------------------------
    // Read accessors
    // ------------------------------------------------------------------

    fn clamp_page(&self, page_size: Option<usize>) -> usize {
        page_size
            .unwrap_or(self.config.api.default_page_size)
            .min(self.config.api.max_page_size)
            .max(1)
    }

    pub async fn forecasts(
        &self,
        product_id: Uuid,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        offset: usize,
        page_size: Option<usize>,
    ) -> Result<Page<Forecast>> {
        let page_size = self.clamp_page(page_size);
        let items = self
            .db
            .forecasts_page(product_id, from, to, page_size, offset)?;
        Ok(Page {
            items,
            offset,
            page_size,
        })
    }

    pub async fn price_recommendations(
        &self,
        product_id: Uuid,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        objective: Option<Objective>,
        offset: usize,
        page_size: Option<usize>,
    ) -> Result<Page<PriceRecommendation>> {
        let page_size = self.clamp_page(page_size);
        let items =
            self.db
                .recommendations_page(product_id, from, to, objective, page_size, offset)?;
        Ok(Page {
            items,
            offset,
            page_size,
        })
    }
}
