//! PricePulse Backend Library
//!
//! Sales ingestion, elasticity estimation, demand forecasting and price
//! optimization over a transactional canonical store. Exposes the core
//! modules for the binary and integration tests.

pub mod analytics;
pub mod config;
pub mod etl;
pub mod models;
pub mod service;
pub mod storage;
pub mod synth;

pub use service::PricingService;
pub use storage::Database;
