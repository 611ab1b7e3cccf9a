use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::{postgres::PgRow, PgPool, Row};
use tracing::info;
use uuid::Uuid;

use super::models::*;
use crate::error::{AppError, AppResult};
use crate::lamassu::models::AtmTransaction;

/// Owns the dca_payments and lamassu_transactions tables.
///
/// Recording one distribution is a single database transaction: first the
/// per-client payment rows, then the audit row with its aggregates. The
/// unique (client_id, lamassu_transaction_id) index is the last-resort
/// guard against double payment if every upstream dedup layer fails.
pub struct PaymentRepository {
    pool: PgPool,
}

impl PaymentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn payment_from_row(row: &PgRow) -> AppResult<DcaPayment> {
        let kind: String = row.try_get("kind")?;
        let status: String = row.try_get("status")?;
        Ok(DcaPayment {
            id: row.try_get("id")?,
            client_id: row.try_get("client_id")?,
            amount_sats: row.try_get("amount_sats")?,
            amount_fiat: row.try_get("amount_fiat")?,
            exchange_rate: row.try_get("exchange_rate")?,
            kind: PaymentKind::parse(&kind)?,
            lamassu_transaction_id: row.try_get("lamassu_transaction_id")?,
            payment_hash: row.try_get("payment_hash")?,
            status: PaymentStatus::parse(&status)?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn stored_from_row(row: &PgRow) -> AppResult<StoredTransaction> {
        Ok(StoredTransaction {
            id: row.try_get("id")?,
            lamassu_transaction_id: row.try_get("lamassu_transaction_id")?,
            fiat_amount: row.try_get("fiat_amount")?,
            crypto_amount: row.try_get("crypto_amount")?,
            commission_rate: row.try_get::<Decimal, _>("commission_rate")?,
            discount_rate: row.try_get::<Decimal, _>("discount_rate")?,
            effective_commission: row.try_get::<Decimal, _>("effective_commission")?,
            commission_amount_sats: row.try_get("commission_amount_sats")?,
            base_amount_sats: row.try_get("base_amount_sats")?,
            exchange_rate: row.try_get("exchange_rate")?,
            crypto_code: row.try_get("crypto_code")?,
            fiat_code: row.try_get("fiat_code")?,
            device_id: row.try_get("device_id")?,
            occurred_at: row.try_get("occurred_at")?,
            processed_at: row.try_get("processed_at")?,
            clients_count: row.try_get("clients_count")?,
            distributions_total_sats: row.try_get("distributions_total_sats")?,
        })
    }

    /// All local payment records referencing one external transaction.
    /// An empty result is the green light to process that transaction.
    pub async fn find_payments_by_transaction(
        &self,
        external_id: &str,
    ) -> AppResult<Vec<DcaPayment>> {
        let rows = sqlx::query(
            r#"
            SELECT id, client_id, amount_sats, amount_fiat, exchange_rate, kind,
                   lamassu_transaction_id, payment_hash, status, created_at
            FROM dca_payments
            WHERE lamassu_transaction_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(external_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::payment_from_row).collect()
    }

    /// Persist one computed distribution: payment rows first, then the
    /// audit mirror with `clients_count`/`distributions_total_sats`.
    /// Write-then-aggregate inside one database transaction.
    pub async fn record_distribution(
        &self,
        tx: &AtmTransaction,
        breakdown: &DistributionBreakdown,
    ) -> AppResult<StoredTransaction> {
        let mut db_tx = self.pool.begin().await?;
        let now = Utc::now();

        for allocation in &breakdown.allocations {
            sqlx::query(
                r#"
                INSERT INTO dca_payments (
                    id, client_id, amount_sats, amount_fiat, exchange_rate,
                    kind, lamassu_transaction_id, status, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(allocation.client_id)
            .bind(allocation.sats_amount)
            .bind(allocation.fiat_amount)
            .bind(breakdown.exchange_rate)
            .bind(PaymentKind::Flow.as_str())
            .bind(&tx.external_id)
            .bind(PaymentStatus::Confirmed.as_str())
            .bind(now)
            .execute(&mut *db_tx)
            .await?;
        }

        let row = sqlx::query(
            r#"
            INSERT INTO lamassu_transactions (
                id, lamassu_transaction_id, fiat_amount, crypto_amount,
                commission_rate, discount_rate, effective_commission,
                commission_amount_sats, base_amount_sats, exchange_rate,
                crypto_code, fiat_code, device_id, occurred_at, processed_at,
                clients_count, distributions_total_sats
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (lamassu_transaction_id) DO UPDATE SET
                processed_at = EXCLUDED.processed_at,
                clients_count = EXCLUDED.clients_count,
                distributions_total_sats = EXCLUDED.distributions_total_sats
            RETURNING id, lamassu_transaction_id, fiat_amount, crypto_amount,
                      commission_rate, discount_rate, effective_commission,
                      commission_amount_sats, base_amount_sats, exchange_rate,
                      crypto_code, fiat_code, device_id, occurred_at, processed_at,
                      clients_count, distributions_total_sats
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&tx.external_id)
        .bind(tx.fiat_amount)
        .bind(tx.crypto_amount)
        .bind(tx.commission_rate)
        .bind(tx.discount_rate)
        .bind(breakdown.effective_commission)
        .bind(breakdown.commission_amount_sats)
        .bind(breakdown.base_amount_sats)
        .bind(breakdown.exchange_rate)
        .bind(tx.crypto_code.as_deref().unwrap_or("BTC"))
        .bind(tx.fiat_code.as_deref().unwrap_or("GTQ"))
        .bind(&tx.device_id)
        .bind(tx.occurred_at)
        .bind(now)
        .bind(breakdown.allocations.len() as i32)
        .bind(breakdown.total_distributed_sats())
        .fetch_one(&mut *db_tx)
        .await?;

        let stored = Self::stored_from_row(&row)?;
        db_tx.commit().await?;

        info!(
            "Recorded transaction {}: {} clients, {} sats distributed, {} sats rounding loss",
            tx.external_id,
            stored.clients_count,
            stored.distributions_total_sats,
            breakdown.rounding_loss_sats()
        );
        Ok(stored)
    }

    // ========== AUDIT QUERIES ==========

    pub async fn list_stored_transactions(&self, limit: i64) -> AppResult<Vec<StoredTransaction>> {
        let rows = sqlx::query(
            r#"
            SELECT id, lamassu_transaction_id, fiat_amount, crypto_amount,
                   commission_rate, discount_rate, effective_commission,
                   commission_amount_sats, base_amount_sats, exchange_rate,
                   crypto_code, fiat_code, device_id, occurred_at, processed_at,
                   clients_count, distributions_total_sats
            FROM lamassu_transactions
            ORDER BY occurred_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::stored_from_row).collect()
    }

    pub async fn get_stored_transaction(
        &self,
        external_id: &str,
    ) -> AppResult<StoredTransaction> {
        let row = sqlx::query(
            r#"
            SELECT id, lamassu_transaction_id, fiat_amount, crypto_amount,
                   commission_rate, discount_rate, effective_commission,
                   commission_amount_sats, base_amount_sats, exchange_rate,
                   crypto_code, fiat_code, device_id, occurred_at, processed_at,
                   clients_count, distributions_total_sats
            FROM lamassu_transactions
            WHERE lamassu_transaction_id = $1
            "#,
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Transaction {} not found", external_id)))?;

        Self::stored_from_row(&row)
    }
}
