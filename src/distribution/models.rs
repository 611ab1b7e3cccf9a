use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentKind {
    Flow,
    Fixed,
    Manual,
    Commission,
}

impl PaymentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentKind::Flow => "flow",
            PaymentKind::Fixed => "fixed",
            PaymentKind::Manual => "manual",
            PaymentKind::Commission => "commission",
        }
    }

    pub fn parse(s: &str) -> AppResult<Self> {
        match s {
            "flow" => Ok(PaymentKind::Flow),
            "fixed" => Ok(PaymentKind::Fixed),
            "manual" => Ok(PaymentKind::Manual),
            "commission" => Ok(PaymentKind::Commission),
            other => Err(AppError::InvalidInput(format!(
                "Unknown payment kind: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Confirmed,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Confirmed => "confirmed",
            PaymentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> AppResult<Self> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "confirmed" => Ok(PaymentStatus::Confirmed),
            "failed" => Ok(PaymentStatus::Failed),
            other => Err(AppError::InvalidInput(format!(
                "Unknown payment status: {}",
                other
            ))),
        }
    }
}

/// One recorded distribution: `amount_sats` of bitcoin credited to one
/// client out of one ledger transaction. Created exactly once per
/// (client_id, lamassu_transaction_id) pair.
#[derive(Debug, Clone, Serialize)]
pub struct DcaPayment {
    pub id: Uuid,
    pub client_id: Uuid,
    pub amount_sats: i64,
    pub amount_fiat: i64,
    pub exchange_rate: f64,
    pub kind: PaymentKind,
    pub lamassu_transaction_id: Option<String>,
    pub payment_hash: Option<String>,
    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,
}

/// Local audit mirror of a processed ledger transaction, written once per
/// external id, plus transaction-level aggregates.
#[derive(Debug, Clone, Serialize)]
pub struct StoredTransaction {
    pub id: Uuid,
    pub lamassu_transaction_id: String,
    pub fiat_amount: i64,
    pub crypto_amount: i64,
    pub commission_rate: Decimal,
    pub discount_rate: Decimal,
    pub effective_commission: Decimal,
    pub commission_amount_sats: i64,
    pub base_amount_sats: i64,
    pub exchange_rate: f64,
    pub crypto_code: String,
    pub fiat_code: String,
    pub device_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
    pub clients_count: i32,
    pub distributions_total_sats: i64,
}

/// A client admitted to proportional distribution: active, flow mode, and
/// a positive remaining balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EligibleClient {
    pub client_id: Uuid,
    pub remaining_balance: i64,
}

/// One client's share of one transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Allocation {
    pub client_id: Uuid,
    pub sats_amount: i64,
    pub fiat_amount: i64,
}

/// Full calculator output for one ledger transaction. An empty allocation
/// list means there was nothing to distribute; such transactions are not
/// recorded and stay re-evaluatable until they leave the fetch window.
#[derive(Debug, Clone)]
pub struct DistributionBreakdown {
    pub effective_commission: Decimal,
    pub base_amount_sats: i64,
    pub commission_amount_sats: i64,
    /// Sats per smallest fiat unit; 0 when the fiat amount is 0.
    pub exchange_rate: f64,
    pub allocations: Vec<Allocation>,
}

impl DistributionBreakdown {
    pub fn total_distributed_sats(&self) -> i64 {
        self.allocations.iter().map(|a| a.sats_amount).sum()
    }

    /// Truncation left over after integer shares; accepted, never
    /// redistributed.
    pub fn rounding_loss_sats(&self) -> i64 {
        self.base_amount_sats - self.total_distributed_sats()
    }
}
