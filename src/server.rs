use axum::{
    routing::{get, post, put},
    Router,
};
use tokio::sync::watch;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::api::handler::{
    create_client, create_deposit, get_client, get_client_balance, get_config,
    get_transaction_distributions, health_check, list_client_deposits, list_clients,
    list_transactions, put_config, run_poll, test_connection, update_client,
    update_deposit_status, AppState,
};

pub fn create_app(state: AppState) -> Router {
    info!("Setting up HTTP routes...");

    let app = Router::new()
        .route("/health", get(health_check))
        .nest(
            "/api/v1",
            Router::new()
                // Engine endpoints
                .route("/dca/poll", post(run_poll))
                .route("/dca/test-connection", post(test_connection))
                .route("/dca/transactions", get(list_transactions))
                .route(
                    "/dca/transactions/:id/distributions",
                    get(get_transaction_distributions),
                )
                .route("/dca/config", get(get_config).put(put_config))
                // Client registry
                .route("/clients", post(create_client).get(list_clients))
                .route("/clients/:id", get(get_client).put(update_client))
                .route("/clients/:id/balance", get(get_client_balance))
                .route("/clients/:id/deposits", get(list_client_deposits))
                // Deposits
                .route("/deposits", post(create_deposit))
                .route("/deposits/:id/status", put(update_deposit_status)),
        )
        .layer(CompressionLayer::new())
        .layer(CorsLayer::very_permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("HTTP routes configured");
    app
}

pub async fn run_server(
    app: Router,
    bind_address: &str,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("Server listening on: {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            // Either a real signal flips the flag or the sender is dropped;
            // both mean stop accepting connections.
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}
