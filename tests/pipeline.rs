//! End-to-end pipeline test: synthetic raw sales through ETL, elasticity
//! estimation, demand forecasting and price recommendation, with a known
//! elasticity baked into the generated demand.

use pricepulse_backend::analytics::pricing::PricingParams;
use pricepulse_backend::config::PipelineConfig;
use pricepulse_backend::etl::mapping::MappingRegistry;
use pricepulse_backend::models::Objective;
use pricepulse_backend::synth::{generate_payloads, SynthConfig};
use pricepulse_backend::{Database, PricingService};

fn service() -> PricingService {
    PricingService::new(
        Database::open_in_memory().unwrap(),
        MappingRegistry::builtin(),
        PipelineConfig::default(),
    )
}

#[tokio::test]
async fn synthetic_sales_flow_through_the_whole_pipeline() {
    let svc = service();
    let org = svc.create_organization("acme").await.unwrap();

    // 120 days, price oscillating 9 <-> 11, elasticity -1.2 baked in.
    let payloads = generate_payloads(&SynthConfig {
        sku: "SYN-E2E".to_string(),
        days: 120,
        elasticity: -1.2,
        price_choices: vec![9.0, 11.0],
        noise: 0.05,
        seed: 7,
        ..SynthConfig::default()
    });

    let staged = svc.ingest_raw("synthetic", org.id, payloads).await.unwrap();
    assert_eq!(staged.accepted, 120);
    assert_eq!(staged.rejected, 0);

    let etl = svc.run_etl("synthetic", org.id, None).await.unwrap();
    assert_eq!(etl.processed, 120);
    assert_eq!(etl.failed, 0);
    assert_eq!(etl.products_created, 1);

    let product = svc
        .db()
        .product_by_sku(org.id, "SYN-E2E")
        .unwrap()
        .unwrap();
    assert_eq!(svc.db().count_sales(product.id).unwrap(), 120);

    // Elasticity over a 90-day window recovers the baked-in coefficient.
    let elasticity = svc
        .estimate_elasticity(product.id, Some(90))
        .await
        .unwrap();
    assert!(
        (elasticity.estimate.elasticity + 1.2).abs() < 0.3,
        "estimated elasticity {} too far from -1.2",
        elasticity.estimate.elasticity
    );
    assert!(!elasticity.estimate.low_confidence);
    assert!(elasticity.estimate.r2 > 0.5);

    // 14-day forecast scores under 25% MAPE on the held-out tail.
    let forecast = svc.run_forecast(product.id, 14).await.unwrap();
    assert_eq!(forecast.forecasts.len(), 14);
    assert!(
        forecast.mape < 25.0,
        "holdout MAPE {} exceeds 25%",
        forecast.mape
    );
    assert!(forecast.forecasts.iter().all(|f| f.predicted_units >= 0.0));

    // Revenue recommendation inside [5, 15], beating the status quo.
    let latest = svc.db().latest_sale(product.id).unwrap().unwrap();
    let pricing = svc
        .recommend_prices(
            product.id,
            PricingParams {
                objective: Objective::Revenue,
                pmin: Some(5.0),
                pmax: Some(15.0),
                target_dates: vec![],
            },
        )
        .await
        .unwrap();

    assert!(!pricing.recommendations.is_empty());
    for rec in &pricing.recommendations {
        assert!(rec.suggested_price >= 5.0 && rec.suggested_price <= 15.0);
        assert!(rec.expected_units >= 0.0);
        assert!(
            rec.expected_revenue >= latest.revenue,
            "expected revenue {} below revenue {} at the latest observed price",
            rec.expected_revenue,
            latest.revenue
        );
    }

    // Every analytics invocation left a completed run behind.
    for run_id in [elasticity.run_id, forecast.run_id, pricing.run_id] {
        let run = svc.db().run(run_id).unwrap().unwrap();
        assert!(run.finished_at.is_some(), "run {} never completed", run_id);
    }

    // Read accessors page through the persisted artifacts.
    let forecasts = svc
        .forecasts(product.id, None, None, 0, Some(5))
        .await
        .unwrap();
    assert_eq!(forecasts.items.len(), 5);

    let recs = svc
        .price_recommendations(product.id, None, None, Some(Objective::Revenue), 0, None)
        .await
        .unwrap();
    assert_eq!(recs.items.len(), pricing.recommendations.len());
}

#[tokio::test]
async fn reingesting_the_same_upload_changes_nothing() {
    let svc = service();
    let org = svc.create_organization("acme").await.unwrap();
    let payloads = generate_payloads(&SynthConfig {
        sku: "SYN-IDEM".to_string(),
        days: 30,
        seed: 11,
        ..SynthConfig::default()
    });

    svc.ingest_raw("synthetic", org.id, payloads.clone())
        .await
        .unwrap();
    svc.run_etl("synthetic", org.id, None).await.unwrap();

    let product = svc
        .db()
        .product_by_sku(org.id, "SYN-IDEM")
        .unwrap()
        .unwrap();
    let before = svc.db().sales_history(product.id, 100).unwrap();

    svc.ingest_raw("synthetic", org.id, payloads).await.unwrap();
    svc.run_etl("synthetic", org.id, None).await.unwrap();

    let after = svc.db().sales_history(product.id, 100).unwrap();
    assert_eq!(before.len(), after.len());
    for (a, b) in before.iter().zip(after.iter()) {
        assert_eq!(a.date, b.date);
        assert_eq!(a.units_sold, b.units_sold);
        assert_eq!(a.price, b.price);
        assert_eq!(a.revenue, b.revenue);
    }
}

#[tokio::test]
async fn profit_objective_uses_recorded_costs() {
    let svc = service();
    let org = svc.create_organization("acme").await.unwrap();
    let payloads = generate_payloads(&SynthConfig {
        sku: "SYN-PROFIT".to_string(),
        days: 60,
        elasticity: -1.8,
        price_choices: vec![8.0, 10.0, 12.0],
        seed: 3,
        ..SynthConfig::default()
    });
    svc.ingest_raw("synthetic", org.id, payloads).await.unwrap();
    svc.run_etl("synthetic", org.id, None).await.unwrap();

    let product = svc
        .db()
        .product_by_sku(org.id, "SYN-PROFIT")
        .unwrap()
        .unwrap();
    svc.estimate_elasticity(product.id, Some(60)).await.unwrap();

    let latest = svc.db().latest_sale(product.id).unwrap().unwrap();
    let target = latest.date.succ_opt().unwrap();

    // Without a cost record the profit objective must fail typed.
    let err = svc
        .recommend_prices(
            product.id,
            PricingParams {
                objective: Objective::Profit,
                pmin: Some(4.0),
                pmax: Some(20.0),
                target_dates: vec![target],
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "missing_cost");

    svc.upsert_cost(product.id, target, 5.0).await.unwrap();
    let pricing = svc
        .recommend_prices(
            product.id,
            PricingParams {
                objective: Objective::Profit,
                pmin: Some(4.0),
                pmax: Some(20.0),
                target_dates: vec![target],
            },
        )
        .await
        .unwrap();

    let rec = &pricing.recommendations[0];
    assert!(rec.suggested_price >= 4.0 && rec.suggested_price <= 20.0);
    // Price must clear the unit cost for an elastic product.
    assert!(rec.suggested_price > 5.0);
    assert!(rec.expected_profit > 0.0);
}
