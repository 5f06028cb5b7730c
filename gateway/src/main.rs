mod aggregate;
mod api;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::aggregate::{Aggregator, AggregatorConfig};

#[derive(Parser)]
#[command(name = "gateway")]
struct Args {
    #[arg(long, env = "RESERVATION_SERVICE_URL", default_value = "http://localhost:3001")]
    reservation_service_url: String,

    #[arg(long, env = "PAYMENT_SERVICE_URL", default_value = "http://localhost:3002")]
    payment_service_url: String,

    #[arg(long, env = "VENUE_SERVICE_URL", default_value = "http://localhost:3003")]
    venue_service_url: String,

    #[arg(long, env = "UPSTREAM_TIMEOUT_MS", default_value_t = 8000)]
    upstream_timeout_ms: u64,

    #[arg(long, env = "PORT", default_value = "8080")]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let aggregator = Aggregator::new(AggregatorConfig {
        reservation_url: args.reservation_service_url,
        venue_url: args.venue_service_url,
        payment_url: args.payment_service_url,
        timeout: Duration::from_millis(args.upstream_timeout_ms),
    })?;

    let app = api::create_router(api::AppState {
        aggregator: Arc::new(aggregator),
    });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;
    info!(port = args.port, "gateway started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;

    Ok(())
}
