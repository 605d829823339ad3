use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use actix_web_prom::PrometheusMetricsBuilder;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use stagalgo_control_rs::api::{self, ApiState};
use stagalgo_control_rs::audit::{AuditSink, TracingAuditSink};
use stagalgo_control_rs::clock::{Clock, SystemClock};
use stagalgo_control_rs::config::Settings;
use stagalgo_control_rs::events::NatsEventPublisher;
use stagalgo_control_rs::idempotency::{spawn_sweeper, IdempotencyCache};
use stagalgo_control_rs::nats_engine;
use stagalgo_control_rs::toggles::{ToggleCoordinator, ToggleState};
use stagalgo_control_rs::trade_gate::TradeGate;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting default subscriber failed");

    info!("╔═══════════════════════════════════════════════════════════════╗");
    info!("║               STAGALGO CONTROL RS                             ║");
    info!("║               Risk & Idempotency Control Plane                ║");
    info!("╚═══════════════════════════════════════════════════════════════╝");

    // Load environment variables
    dotenv::dotenv().ok();
    let settings = Settings::new()?;

    // Initialize Core Components
    let audit: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let initial = ToggleState::safe_defaults(&settings.toggles.bots, &settings.toggles.rails);
    let coordinator = Arc::new(ToggleCoordinator::new(initial, audit.clone()));
    let cache = Arc::new(IdempotencyCache::new(clock.clone()));
    let gate = Arc::new(TradeGate::new(
        coordinator.clone(),
        cache.clone(),
        audit.clone(),
        clock.clone(),
        settings.idempotency.window_secs,
        settings.idempotency.ttl_ms,
    ));

    info!("✅ Core components initialized");

    // Connect to NATS
    let nats_url = settings.control.nats_url.clone();
    info!("Connecting to NATS at {}", nats_url);

    let client = match async_nats::connect(&nats_url).await {
        Ok(c) => {
            info!("✅ Connected to NATS");
            c
        }
        Err(e) => {
            error!("❌ Failed to connect to NATS: {}", e);
            std::process::exit(1);
        }
    };

    // Background tasks: cache sweeper + risk signal listener
    spawn_sweeper(
        cache.clone(),
        Duration::from_secs(settings.idempotency.sweep_secs),
    );
    let listener_handle =
        nats_engine::start_signal_listener(client.clone(), coordinator.clone()).await?;

    // --- Control API Server ---
    let bind_address = format!("0.0.0.0:{}", settings.control.port);
    info!("🚀 Starting Control API on {}", bind_address);

    let prometheus = PrometheusMetricsBuilder::new("stag_control_http")
        .endpoint("/metrics")
        .registry(prometheus::default_registry().clone())
        .build()?;

    let api_state = web::Data::new(ApiState {
        coordinator: coordinator.clone(),
        gate,
        publisher: Arc::new(NatsEventPublisher::new(client.clone())),
        nats: client,
    });

    HttpServer::new(move || {
        let cors = actix_cors::Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header();

        App::new()
            .wrap(cors)
            .wrap(prometheus.clone())
            .app_data(api_state.clone())
            .configure(api::config)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    // Wait for the listener if the server stops (unlikely unless signal)
    let _ = listener_handle.await;

    Ok(())
}
