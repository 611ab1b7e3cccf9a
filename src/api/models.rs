use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clients::models::{ClientStatus, DcaMode, DepositStatus};
use crate::lamassu::models::LamassuConfig;

// ========== REQUEST MODELS ==========

/// Register a new DCA client
#[derive(Debug, Deserialize)]
pub struct CreateClientRequest {
    pub user_id: String,
    pub wallet_id: String,
    pub dca_mode: DcaMode,
    /// Daily spend cap in smallest fiat units; only meaningful in fixed mode
    pub fixed_mode_daily_limit: Option<i64>,
}

/// Partial update; omitted fields keep their current value
#[derive(Debug, Deserialize)]
pub struct UpdateClientRequest {
    pub dca_mode: Option<DcaMode>,
    pub fixed_mode_daily_limit: Option<i64>,
    pub status: Option<ClientStatus>,
}

#[derive(Debug, Deserialize)]
pub struct CreateDepositRequest {
    pub client_id: Uuid,
    /// Smallest fiat unit (e.g. centavos)
    pub amount: i64,
    pub currency: String,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateDepositStatusRequest {
    pub status: DepositStatus,
}

/// Replace the active Lamassu connection configuration.
///
/// SSH credentials are optional as a pair; when `use_ssh_tunnel` is set at
/// least one of password/private key must be present, validated at poll
/// time rather than here so a half-entered config can still be saved.
#[derive(Debug, Deserialize)]
pub struct UpsertLamassuConfigRequest {
    pub host: String,
    pub port: i32,
    pub database_name: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub use_ssh_tunnel: bool,
    pub ssh_host: Option<String>,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: i32,
    pub ssh_username: Option<String>,
    pub ssh_password: Option<String>,
    pub ssh_private_key: Option<String>,
    #[serde(default)]
    pub use_system_ssh: bool,
}

fn default_ssh_port() -> i32 {
    22
}

#[derive(Debug, Deserialize)]
pub struct ListTransactionsQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}

// ========== RESPONSE MODELS ==========

/// Config view with secrets redacted. The password and SSH credentials
/// never leave the service once stored.
#[derive(Debug, Serialize)]
pub struct LamassuConfigResponse {
    pub id: Uuid,
    pub host: String,
    pub port: i32,
    pub database_name: String,
    pub username: String,
    pub is_active: bool,
    pub test_connection_last: Option<DateTime<Utc>>,
    pub test_connection_success: Option<bool>,
    pub last_poll_attempted_at: Option<DateTime<Utc>>,
    pub last_poll_succeeded_at: Option<DateTime<Utc>>,
    pub use_ssh_tunnel: bool,
    pub ssh_host: Option<String>,
    pub ssh_port: i32,
    pub ssh_username: Option<String>,
    pub has_ssh_password: bool,
    pub has_ssh_private_key: bool,
    pub use_system_ssh: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<LamassuConfig> for LamassuConfigResponse {
    fn from(cfg: LamassuConfig) -> Self {
        Self {
            id: cfg.id,
            host: cfg.host,
            port: cfg.port,
            database_name: cfg.database_name,
            username: cfg.username,
            is_active: cfg.is_active,
            test_connection_last: cfg.test_connection_last,
            test_connection_success: cfg.test_connection_success,
            last_poll_attempted_at: cfg.last_poll_attempted_at,
            last_poll_succeeded_at: cfg.last_poll_succeeded_at,
            use_ssh_tunnel: cfg.use_ssh_tunnel,
            ssh_host: cfg.ssh_host,
            ssh_port: cfg.ssh_port,
            ssh_username: cfg.ssh_username,
            has_ssh_password: cfg.ssh_password.as_deref().is_some_and(|p| !p.is_empty()),
            has_ssh_private_key: cfg
                .ssh_private_key
                .as_deref()
                .is_some_and(|k| !k.is_empty()),
            use_system_ssh: cfg.use_system_ssh,
            created_at: cfg.created_at,
            updated_at: cfg.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
}
