//! PricePulse - sales analytics and price optimization worker
//!
//! CLI front-end over the service layer: stage raw sales, run the ETL
//! pipeline, and invoke the analytics entry points. The network-facing
//! request layer is a separate collaborator; this binary is the operational
//! worker used for seeding, batch jobs and inspection.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use pricepulse_backend::analytics::pricing::PricingParams;
use pricepulse_backend::config::PipelineConfig;
use pricepulse_backend::etl::mapping::MappingRegistry;
use pricepulse_backend::models::Objective;
use pricepulse_backend::synth::{generate_payloads, SynthConfig};
use pricepulse_backend::{Database, PricingService};
use std::path::PathBuf;
use tracing::info;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "pricepulse", about = "Sales ETL, demand forecasting and price optimization")]
struct Cli {
    /// SQLite database path
    #[arg(long, env = "PRICEPULSE_DB", default_value = "pricepulse.db")]
    db: String,

    /// Optional pipeline config (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Optional mapping specs file (JSON array), merged over built-ins
    #[arg(long)]
    mappings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the database schema and a first organization
    Init {
        /// Organization name
        #[arg(long, default_value = "Default Organization")]
        org_name: String,
    },
    /// Stage synthetic sales with a known elasticity and run ETL over them
    Seed {
        #[arg(long)]
        org: Uuid,
        #[arg(long, default_value = "SYN-1")]
        sku: String,
        #[arg(long, default_value_t = 120)]
        days: u32,
        #[arg(long, default_value_t = -1.2)]
        elasticity: f64,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Stage raw records from a JSON file (array of objects)
    Ingest {
        #[arg(long)]
        org: Uuid,
        #[arg(long, default_value = "api")]
        source: String,
        /// Path to a JSON array of raw records
        file: PathBuf,
    },
    /// Transform and load pending raw records
    Etl {
        #[arg(long)]
        org: Uuid,
        #[arg(long, default_value = "api")]
        source: String,
        /// Max raw rows to pull this invocation
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Estimate price elasticity over a trailing window
    Elasticity {
        #[arg(long)]
        product: Uuid,
        #[arg(long)]
        window: Option<u32>,
    },
    /// Forecast demand for the next N days
    Forecast {
        #[arg(long)]
        product: Uuid,
        #[arg(long, default_value_t = 14)]
        horizon: u32,
    },
    /// Recommend prices under an objective and bounds
    Recommend {
        #[arg(long)]
        product: Uuid,
        #[arg(long, default_value = "revenue")]
        objective: String,
        #[arg(long)]
        pmin: Option<f64>,
        #[arg(long)]
        pmax: Option<f64>,
        /// Explicit target dates (YYYY-MM-DD); defaults to the horizon after
        /// the latest observation
        #[arg(long)]
        dates: Vec<NaiveDate>,
    },
    /// List products of an organization
    Products {
        #[arg(long)]
        org: Uuid,
    },
    /// Show stored forecasts for a product
    Forecasts {
        #[arg(long)]
        product: Uuid,
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
    },
    /// Show stored price recommendations for a product
    Recommendations {
        #[arg(long)]
        product: Uuid,
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => PipelineConfig::from_toml_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    let mappings = match &cli.mappings {
        Some(path) => MappingRegistry::with_config_file(path)
            .with_context(|| format!("Failed to load mappings from {}", path.display()))?,
        None => MappingRegistry::builtin(),
    };

    let db = Database::open(&cli.db)?;
    let service = PricingService::new(db, mappings, config);

    match cli.command {
        Command::Init { org_name } => {
            let org = service.create_organization(&org_name).await?;
            println!("Created organization '{}' with id {}", org.name, org.id);
        }
        Command::Seed {
            org,
            sku,
            days,
            elasticity,
            seed,
        } => {
            let payloads = generate_payloads(&SynthConfig {
                sku,
                days,
                elasticity,
                seed,
                ..SynthConfig::default()
            });
            let staged = service.ingest_raw("synthetic", org, payloads).await?;
            info!("Staged {} synthetic records", staged.accepted);
            let summary = service.run_etl("synthetic", org, None).await?;
            println!(
                "Seeded: {} processed, {} failed, {} products created",
                summary.processed, summary.failed, summary.products_created
            );
        }
        Command::Ingest { org, source, file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let records: Vec<serde_json::Value> = serde_json::from_str(&text)?;
            let summary = service.ingest_raw(&source, org, records).await?;
            println!(
                "Ingested: {} accepted, {} rejected",
                summary.accepted, summary.rejected
            );
        }
        Command::Etl { org, source, limit } => {
            let summary = service.run_etl(&source, org, limit).await?;
            println!(
                "ETL: {} processed, {} failed across {} batches",
                summary.processed, summary.failed, summary.batches
            );
            for sample in &summary.failure_samples {
                println!("  raw {}: {}", sample.raw_id, sample.reason);
            }
        }
        Command::Elasticity { product, window } => {
            let outcome = service.estimate_elasticity(product, window).await?;
            println!(
                "Elasticity {:.4} (r2 {:.3}{}) from {} observations, run {}",
                outcome.estimate.elasticity,
                outcome.estimate.r2,
                if outcome.estimate.low_confidence {
                    ", LOW CONFIDENCE"
                } else {
                    ""
                },
                outcome.observations,
                outcome.run_id
            );
        }
        Command::Forecast { product, horizon } => {
            let outcome = service.run_forecast(product, horizon).await?;
            println!(
                "Forecast run {} (holdout MAPE {:.1}%):",
                outcome.run_id, outcome.mape
            );
            for f in &outcome.forecasts {
                println!("  {}: {:.1} units", f.target_date, f.predicted_units);
            }
        }
        Command::Recommend {
            product,
            objective,
            pmin,
            pmax,
            dates,
        } => {
            let objective = Objective::parse(&objective)
                .with_context(|| format!("unknown objective '{}'", objective))?;
            let outcome = service
                .recommend_prices(
                    product,
                    PricingParams {
                        objective,
                        pmin,
                        pmax,
                        target_dates: dates,
                    },
                )
                .await?;
            println!(
                "Pricing run {} (b={:.3}, bounds [{:.2}, {:.2}]):",
                outcome.run_id, outcome.elasticity, outcome.pmin, outcome.pmax
            );
            for r in &outcome.recommendations {
                println!(
                    "  {}: price {:.2}{} -> units {:.1}, revenue {:.2}, profit {:.2}",
                    r.target_date,
                    r.suggested_price,
                    if r.at_bound { " (at bound)" } else { "" },
                    r.expected_units,
                    r.expected_revenue,
                    r.expected_profit
                );
            }
        }
        Command::Products { org } => {
            for p in service.list_products(org).await? {
                println!("{}  {}  {} ({})", p.id, p.sku, p.name, p.currency);
            }
        }
        Command::Forecasts { product, from, to } => {
            let page = service.forecasts(product, from, to, 0, None).await?;
            for f in &page.items {
                println!("{}: {:.1} units (run {})", f.target_date, f.predicted_units, f.run_id);
            }
        }
        Command::Recommendations { product, from, to } => {
            let page = service
                .price_recommendations(product, from, to, None, 0, None)
                .await?;
            for r in &page.items {
                println!(
                    "{} [{}]: price {:.2}, units {:.1}, revenue {:.2}, profit {:.2}",
                    r.target_date,
                    r.objective,
                    r.suggested_price,
                    r.expected_units,
                    r.expected_revenue,
                    r.expected_profit
                );
            }
        }
    }

    Ok(())
}
