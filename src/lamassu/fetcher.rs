use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sqlx::{postgres::PgRow, PgPool, Row};
use tracing::info;

use super::access::LedgerConnection;
use super::models::AtmTransaction;
use crate::error::PollError;

/// First-run lookback when no checkpoint exists yet. Bounds the cost of the
/// very first poll instead of scanning since epoch.
pub const FIRST_RUN_LOOKBACK_HOURS: i64 = 24;

/// Window start for a poll cycle: the success checkpoint, or a fixed
/// lookback on first run.
pub fn window_start(checkpoint: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    checkpoint.unwrap_or_else(|| now - Duration::hours(FIRST_RUN_LOOKBACK_HOURS))
}

/// Pulls confirmed cash transactions out of the Lamassu database and
/// deduplicates them against locally recorded payments.
///
/// Dedup happens twice: once at query time (known ids are excluded in the
/// WHERE clause) and once at process time against the local payments table.
/// The second layer exists because the query-level filter is time-based and
/// may re-return transactions inside the window boundary on retry.
pub struct TransactionFetcher {
    pool: PgPool,
}

impl TransactionFetcher {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// External ids already referenced by local payment records.
    pub async fn known_transaction_ids(&self) -> Result<HashSet<String>, PollError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT lamassu_transaction_id
            FROM dca_payments
            WHERE lamassu_transaction_id IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PollError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("lamassu_transaction_id")
                    .map_err(|e| PollError::Query(e.to_string()))
            })
            .collect()
    }

    /// Fetch confirmed transactions newer than `window_start`, newest
    /// first, excluding ids in `known` at query time.
    pub async fn fetch_confirmed_since(
        &self,
        ledger: &mut LedgerConnection,
        window_start: DateTime<Utc>,
        known: &HashSet<String>,
    ) -> Result<Vec<AtmTransaction>, PollError> {
        let exclude: Vec<String> = known.iter().cloned().collect();

        let rows = sqlx::query(
            r#"
            SELECT
                id::TEXT AS external_id,
                fiat::BIGINT AS fiat_amount,
                crypto_atoms::BIGINT AS crypto_amount,
                commission_percentage AS commission_rate,
                COALESCE(discount, 0) AS discount_rate,
                created AS occurred_at,
                device_id::TEXT AS device_id,
                crypto_code,
                fiat_code
            FROM cash_out_txs
            WHERE created > $1
              AND status = 'confirmed'
              AND NOT (id::TEXT = ANY($2))
            ORDER BY created DESC
            "#,
        )
        .bind(window_start)
        .bind(&exclude)
        .fetch_all(ledger.as_mut())
        .await
        .map_err(|e| PollError::Query(e.to_string()))?;

        let transactions: Result<Vec<_>, PollError> =
            rows.iter().map(Self::transaction_from_row).collect();
        let transactions = transactions?;

        // Second dedup layer, independent of the query-level filter.
        let transactions = filter_known(transactions, known);

        info!(
            "Fetched {} new Lamassu transactions since {}",
            transactions.len(),
            window_start
        );
        Ok(transactions)
    }

    fn transaction_from_row(row: &PgRow) -> Result<AtmTransaction, PollError> {
        let get = |e: sqlx::Error| PollError::Query(e.to_string());
        Ok(AtmTransaction {
            external_id: row.try_get("external_id").map_err(get)?,
            fiat_amount: row.try_get("fiat_amount").map_err(get)?,
            crypto_amount: row.try_get("crypto_amount").map_err(get)?,
            commission_rate: row
                .try_get::<Decimal, _>("commission_rate")
                .map_err(get)?,
            discount_rate: row.try_get::<Decimal, _>("discount_rate").map_err(get)?,
            occurred_at: row.try_get("occurred_at").map_err(get)?,
            device_id: row.try_get("device_id").map_err(get)?,
            crypto_code: row.try_get("crypto_code").map_err(get)?,
            fiat_code: row.try_get("fiat_code").map_err(get)?,
        })
    }
}

/// Drop transactions whose external id is already known locally.
pub fn filter_known(
    transactions: Vec<AtmTransaction>,
    known: &HashSet<String>,
) -> Vec<AtmTransaction> {
    transactions
        .into_iter()
        .filter(|tx| !known.contains(&tx.external_id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tx(id: &str) -> AtmTransaction {
        AtmTransaction {
            external_id: id.to_string(),
            fiat_amount: 10_000,
            crypto_amount: 103,
            commission_rate: dec!(0.03),
            discount_rate: dec!(0),
            occurred_at: Utc::now(),
            device_id: None,
            crypto_code: Some("BTC".to_string()),
            fiat_code: Some("GTQ".to_string()),
        }
    }

    #[test]
    fn filter_known_drops_already_recorded_ids() {
        let known: HashSet<String> = ["a".to_string(), "c".to_string()].into_iter().collect();
        let out = filter_known(vec![tx("a"), tx("b"), tx("c"), tx("d")], &known);
        let ids: Vec<_> = out.iter().map(|t| t.external_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "d"]);
    }

    #[test]
    fn window_start_defaults_to_fixed_lookback_on_first_run() {
        let now = Utc::now();
        let start = window_start(None, now);
        assert_eq!(start, now - Duration::hours(24));
    }

    #[test]
    fn window_start_uses_checkpoint_when_present() {
        let now = Utc::now();
        let checkpoint = now - Duration::hours(2);
        assert_eq!(window_start(Some(checkpoint), now), checkpoint);
    }
}
