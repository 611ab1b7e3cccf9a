use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Client participation mode.
///
/// `Flow` clients receive a proportional share of every processed ledger
/// transaction. `Fixed` clients accumulate against a daily spend limit and
/// are not part of proportional distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DcaMode {
    Flow,
    Fixed,
}

impl DcaMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DcaMode::Flow => "flow",
            DcaMode::Fixed => "fixed",
        }
    }

    pub fn parse(s: &str) -> AppResult<Self> {
        match s {
            "flow" => Ok(DcaMode::Flow),
            "fixed" => Ok(DcaMode::Fixed),
            other => Err(AppError::InvalidInput(format!("Unknown DCA mode: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    Active,
    Inactive,
}

impl ClientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientStatus::Active => "active",
            ClientStatus::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> AppResult<Self> {
        match s {
            "active" => Ok(ClientStatus::Active),
            "inactive" => Ok(ClientStatus::Inactive),
            other => Err(AppError::InvalidInput(format!(
                "Unknown client status: {}",
                other
            ))),
        }
    }
}

/// A registered DCA client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DcaClient {
    pub id: Uuid,
    pub user_id: String,
    pub wallet_id: String,
    pub dca_mode: DcaMode,
    pub fixed_mode_daily_limit: Option<i64>,
    pub status: ClientStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DcaClient {
    /// Eligible for proportional distribution: active and in flow mode.
    /// Balance eligibility is checked separately per transaction.
    pub fn participates_in_flow(&self) -> bool {
        self.status == ClientStatus::Active && self.dca_mode == DcaMode::Flow
    }
}

/// Derived balance view for one client. Never stored; computed on demand
/// from confirmed deposits and confirmed DCA payments.
#[derive(Debug, Clone, Serialize)]
pub struct BalanceSummary {
    pub client_id: Uuid,
    pub confirmed_deposits: i64,
    pub confirmed_dca_spend: i64,
    pub remaining_balance: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepositStatus {
    Pending,
    Confirmed,
}

impl DepositStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DepositStatus::Pending => "pending",
            DepositStatus::Confirmed => "confirmed",
        }
    }

    pub fn parse(s: &str) -> AppResult<Self> {
        match s {
            "pending" => Ok(DepositStatus::Pending),
            "confirmed" => Ok(DepositStatus::Confirmed),
            other => Err(AppError::InvalidInput(format!(
                "Unknown deposit status: {}",
                other
            ))),
        }
    }
}

/// A fiat deposit. Only confirmed deposits fund a client's remaining
/// balance.
#[derive(Debug, Clone, Serialize)]
pub struct DcaDeposit {
    pub id: Uuid,
    pub client_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub status: DepositStatus,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
}
