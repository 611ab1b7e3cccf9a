use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use super::models::*;
use crate::{
    clients::{
        models::{BalanceSummary, DcaClient, DcaDeposit},
        ClientRepository,
    },
    distribution::{
        models::{DcaPayment, StoredTransaction},
        PaymentRepository,
    },
    error::AppResult,
    lamassu::LamassuRepository,
    poller::{ConnectionTestReport, CycleReport, PollOrchestrator},
};

#[derive(Clone)]
pub struct AppState {
    pub clients: Arc<ClientRepository>,
    pub payments: Arc<PaymentRepository>,
    pub lamassu: Arc<LamassuRepository>,
    pub orchestrator: Arc<PollOrchestrator>,
}

/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now(),
    })
}

// ========== POLL / DIAGNOSTICS ==========

/// Run one poll cycle immediately
/// POST /api/v1/dca/poll
///
/// Shares the cycle lock with the scheduler, so a manual poll issued while
/// a scheduled cycle runs simply waits its turn.
pub async fn run_poll(State(state): State<AppState>) -> AppResult<Json<CycleReport>> {
    info!("Manual poll requested");
    let report = state.orchestrator.run_cycle().await?;
    Ok(Json(report))
}

/// Connectivity diagnostics: tunnel + connect + SELECT 1, no transactions
/// POST /api/v1/dca/test-connection
pub async fn test_connection(
    State(state): State<AppState>,
) -> AppResult<Json<ConnectionTestReport>> {
    info!("Connection test requested");
    let report = state.orchestrator.test_connection().await?;
    Ok(Json(report))
}

// ========== AUDIT ==========

/// GET /api/v1/dca/transactions
pub async fn list_transactions(
    State(state): State<AppState>,
    Query(query): Query<ListTransactionsQuery>,
) -> AppResult<Json<Vec<StoredTransaction>>> {
    let limit = query.limit.clamp(1, 1000);
    let transactions = state.payments.list_stored_transactions(limit).await?;
    Ok(Json(transactions))
}

/// Per-client payment rows for one external transaction id
/// GET /api/v1/dca/transactions/:id/distributions
pub async fn get_transaction_distributions(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
) -> AppResult<Json<Vec<DcaPayment>>> {
    // 404 for an id the engine never recorded, empty list never happens
    // because the audit row and payment rows are written together.
    state.payments.get_stored_transaction(&external_id).await?;
    let payments = state
        .payments
        .find_payments_by_transaction(&external_id)
        .await?;
    Ok(Json(payments))
}

// ========== LAMASSU CONFIG ==========

/// GET /api/v1/dca/config
pub async fn get_config(State(state): State<AppState>) -> AppResult<Json<LamassuConfigResponse>> {
    let cfg = state
        .lamassu
        .get_active_config()
        .await?
        .ok_or_else(|| crate::error::AppError::NotFound("No active Lamassu configuration".to_string()))?;
    Ok(Json(cfg.into()))
}

/// PUT /api/v1/dca/config
pub async fn put_config(
    State(state): State<AppState>,
    Json(request): Json<UpsertLamassuConfigRequest>,
) -> AppResult<Json<LamassuConfigResponse>> {
    let cfg = state
        .lamassu
        .upsert_config(
            &request.host,
            request.port,
            &request.database_name,
            &request.username,
            &request.password,
            request.use_ssh_tunnel,
            request.ssh_host,
            request.ssh_port,
            request.ssh_username,
            request.ssh_password,
            request.ssh_private_key,
            request.use_system_ssh,
        )
        .await?;
    info!("Lamassu configuration replaced: {}", cfg.id);
    Ok(Json(cfg.into()))
}

// ========== CLIENT REGISTRY ==========

/// POST /api/v1/clients
pub async fn create_client(
    State(state): State<AppState>,
    Json(request): Json<CreateClientRequest>,
) -> AppResult<Json<DcaClient>> {
    let client = state
        .clients
        .create_client(
            &request.user_id,
            &request.wallet_id,
            request.dca_mode,
            request.fixed_mode_daily_limit,
        )
        .await?;
    info!("Client registered: {} ({})", client.id, client.user_id);
    Ok(Json(client))
}

/// GET /api/v1/clients
pub async fn list_clients(State(state): State<AppState>) -> AppResult<Json<Vec<DcaClient>>> {
    let clients = state.clients.list_clients().await?;
    Ok(Json(clients))
}

/// GET /api/v1/clients/:id
pub async fn get_client(
    State(state): State<AppState>,
    Path(client_id): Path<Uuid>,
) -> AppResult<Json<DcaClient>> {
    let client = state.clients.get_client(client_id).await?;
    Ok(Json(client))
}

/// PUT /api/v1/clients/:id
pub async fn update_client(
    State(state): State<AppState>,
    Path(client_id): Path<Uuid>,
    Json(request): Json<UpdateClientRequest>,
) -> AppResult<Json<DcaClient>> {
    let client = state
        .clients
        .update_client(
            client_id,
            request.dca_mode,
            request.fixed_mode_daily_limit,
            request.status,
        )
        .await?;
    Ok(Json(client))
}

/// GET /api/v1/clients/:id/balance
pub async fn get_client_balance(
    State(state): State<AppState>,
    Path(client_id): Path<Uuid>,
) -> AppResult<Json<BalanceSummary>> {
    // Existence check first so an unknown id is a 404, not a zero balance.
    state.clients.get_client(client_id).await?;
    let summary = state.clients.balance_summary(client_id).await?;
    Ok(Json(summary))
}

// ========== DEPOSITS ==========

/// POST /api/v1/deposits
pub async fn create_deposit(
    State(state): State<AppState>,
    Json(request): Json<CreateDepositRequest>,
) -> AppResult<Json<DcaDeposit>> {
    let deposit = state
        .clients
        .create_deposit(
            request.client_id,
            request.amount,
            &request.currency,
            request.notes,
        )
        .await?;
    info!(
        "Deposit created: {} ({} {} for client {})",
        deposit.id, deposit.amount, deposit.currency, deposit.client_id
    );
    Ok(Json(deposit))
}

/// Confirming a deposit is what funds a client's remaining balance
/// PUT /api/v1/deposits/:id/status
pub async fn update_deposit_status(
    State(state): State<AppState>,
    Path(deposit_id): Path<Uuid>,
    Json(request): Json<UpdateDepositStatusRequest>,
) -> AppResult<Json<DcaDeposit>> {
    let deposit = state
        .clients
        .update_deposit_status(deposit_id, request.status)
        .await?;
    Ok(Json(deposit))
}

/// GET /api/v1/clients/:id/deposits
pub async fn list_client_deposits(
    State(state): State<AppState>,
    Path(client_id): Path<Uuid>,
) -> AppResult<Json<Vec<DcaDeposit>>> {
    state.clients.get_client(client_id).await?;
    let deposits = state.clients.list_deposits(client_id).await?;
    Ok(Json(deposits))
}
