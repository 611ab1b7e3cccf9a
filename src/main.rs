mod api;
mod bootstrap;
mod clients;
mod config;
mod distribution;
mod error;
mod lamassu;
mod poller;
mod server;
mod tunnel;

use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,satdca=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    info!("Starting DCA reconciliation and distribution backend");

    dotenv::dotenv().ok();
    let config = config::Config::from_env()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let state = bootstrap::initialize_app_state(&config, shutdown_rx.clone()).await?;

    let app = server::create_app(state);
    server::run_server(app, &config.bind_address, shutdown_rx).await?;

    info!("Server stopped");
    Ok(())
}
