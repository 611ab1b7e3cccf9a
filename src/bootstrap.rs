use std::{sync::Arc, time::Duration};

use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::sync::watch;
use tracing::info;

use crate::{
    api::handler::AppState,
    clients::ClientRepository,
    config::Config,
    distribution::PaymentRepository,
    error::AppResult,
    lamassu::{fetcher::TransactionFetcher, LamassuRepository},
    poller::PollOrchestrator,
};

pub async fn initialize_app_state(
    config: &Config,
    shutdown: watch::Receiver<bool>,
) -> AppResult<AppState> {
    info!("Initializing application components...");

    let pool = initialize_database(&config.database_url).await?;

    let clients = Arc::new(ClientRepository::new(pool.clone()));
    let payments = Arc::new(PaymentRepository::new(pool.clone()));
    let lamassu = Arc::new(LamassuRepository::new(pool.clone()));
    let fetcher = TransactionFetcher::new(pool.clone());

    let orchestrator = Arc::new(PollOrchestrator::new(
        lamassu.clone(),
        clients.clone(),
        payments.clone(),
        fetcher,
    ));

    orchestrator.clone().spawn_scheduler(
        Duration::from_secs(config.poll_interval_secs),
        Duration::from_secs(config.poll_error_backoff_secs),
        shutdown,
    );
    info!(
        "Poll scheduler started (every {}s)",
        config.poll_interval_secs
    );

    Ok(AppState {
        clients,
        payments,
        lamassu,
        orchestrator,
    })
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .connect(database_url)
        .await?;

    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("Database initialized");
    Ok(pool)
}
