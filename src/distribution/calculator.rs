use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use super::models::{Allocation, DistributionBreakdown, EligibleClient};
use crate::error::{AppError, AppResult};
use crate::lamassu::models::AtmTransaction;

/// Proportional distribution of one ledger transaction.
///
/// The ledger records the commission-inclusive crypto amount, so the
/// commission-free principal is recovered by division:
///
///   effective = commission_rate * (100 - discount_rate) / 100
///   base      = round(crypto_amount / (1 + effective))
///
/// Each eligible client then receives `floor(base * balance / total)`
/// satoshis. The truncation left over is accepted as rounding loss and
/// credited to no one. A zero fiat amount or zero total eligible balance
/// yields an empty allocation list; both are ordinary outcomes, not errors.
pub fn calculate(
    tx: &AtmTransaction,
    eligible: &[EligibleClient],
) -> AppResult<DistributionBreakdown> {
    if tx.crypto_amount < 0 || tx.fiat_amount < 0 {
        return Err(AppError::InvalidInput(format!(
            "Negative amounts in transaction {}",
            tx.external_id
        )));
    }

    let effective_commission =
        tx.commission_rate * (Decimal::from(100) - tx.discount_rate) / Decimal::from(100);

    let base = (Decimal::from(tx.crypto_amount) / (Decimal::ONE + effective_commission)).round();
    let base_amount_sats = base.to_i64().ok_or_else(|| {
        AppError::InvalidInput(format!(
            "Base amount out of range for transaction {}",
            tx.external_id
        ))
    })?;
    let commission_amount_sats = tx.crypto_amount - base_amount_sats;

    // Division-by-zero guard: a zero-fiat transaction carries no usable
    // exchange rate, so it is mirrored for audit but distributes nothing.
    let exchange_rate = if tx.fiat_amount > 0 {
        base_amount_sats as f64 / tx.fiat_amount as f64
    } else {
        0.0
    };

    let mut breakdown = DistributionBreakdown {
        effective_commission,
        base_amount_sats,
        commission_amount_sats,
        exchange_rate,
        allocations: Vec::new(),
    };

    if tx.fiat_amount == 0 || base_amount_sats == 0 {
        return Ok(breakdown);
    }

    // Zero-balance clients are excluded from numerator and denominator
    // alike; they must not show up with a zero share.
    let participants: Vec<&EligibleClient> = eligible
        .iter()
        .filter(|c| c.remaining_balance > 0)
        .collect();

    let total_eligible_balance: i128 = participants
        .iter()
        .map(|c| c.remaining_balance as i128)
        .sum();
    if total_eligible_balance == 0 {
        return Ok(breakdown);
    }

    for client in participants {
        let sats_amount =
            (base_amount_sats as i128 * client.remaining_balance as i128 / total_eligible_balance)
                as i64;
        if sats_amount == 0 {
            continue;
        }
        // Equivalent to floor(sats / exchange_rate), kept in integers so
        // the audit trail reproduces exactly.
        let fiat_amount = (sats_amount as i128 * tx.fiat_amount as i128
            / base_amount_sats as i128) as i64;

        breakdown.allocations.push(Allocation {
            client_id: client.client_id,
            sats_amount,
            fiat_amount,
        });
    }

    Ok(breakdown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn tx(fiat: i64, crypto: i64, commission: Decimal, discount: Decimal) -> AtmTransaction {
        AtmTransaction {
            external_id: "tx-1".to_string(),
            fiat_amount: fiat,
            crypto_amount: crypto,
            commission_rate: commission,
            discount_rate: discount,
            occurred_at: Utc::now(),
            device_id: None,
            crypto_code: Some("BTC".to_string()),
            fiat_code: Some("GTQ".to_string()),
        }
    }

    fn client(balance: i64) -> EligibleClient {
        EligibleClient {
            client_id: Uuid::new_v4(),
            remaining_balance: balance,
        }
    }

    #[test]
    fn commission_extraction_round_trip() {
        // 103 sats at 3% inclusive commission recovers a 100 sat principal.
        let breakdown = calculate(&tx(10_000, 103, dec!(0.03), dec!(0)), &[client(1_000)]).unwrap();
        assert_eq!(breakdown.effective_commission, dec!(0.03));
        assert_eq!(breakdown.base_amount_sats, 100);
        assert_eq!(breakdown.commission_amount_sats, 3);
    }

    #[test]
    fn discount_reduces_effective_commission() {
        let breakdown = calculate(&tx(10_000, 103, dec!(0.03), dec!(50)), &[client(1_000)]).unwrap();
        assert_eq!(breakdown.effective_commission, dec!(0.015));
    }

    #[test]
    fn proportional_split_700_300() {
        let a = client(700);
        let b = client(300);
        let breakdown = calculate(&tx(10_000, 103, dec!(0.03), dec!(0)), &[a, b]).unwrap();

        assert_eq!(breakdown.allocations.len(), 2);
        let sats_a = breakdown
            .allocations
            .iter()
            .find(|x| x.client_id == a.client_id)
            .unwrap()
            .sats_amount;
        let sats_b = breakdown
            .allocations
            .iter()
            .find(|x| x.client_id == b.client_id)
            .unwrap()
            .sats_amount;
        assert_eq!(sats_a, 70);
        assert_eq!(sats_b, 30);
        assert_eq!(breakdown.rounding_loss_sats(), 0);
    }

    #[test]
    fn zero_balance_client_never_appears() {
        let funded = client(500);
        let broke = client(0);
        let breakdown = calculate(&tx(10_000, 103, dec!(0.03), dec!(0)), &[funded, broke]).unwrap();

        assert_eq!(breakdown.allocations.len(), 1);
        assert_eq!(breakdown.allocations[0].client_id, funded.client_id);
        // The funded client absorbs the whole base amount.
        assert_eq!(breakdown.allocations[0].sats_amount, 100);
    }

    #[test]
    fn zero_fiat_amount_is_a_noop_not_an_error() {
        let breakdown = calculate(&tx(0, 103, dec!(0.03), dec!(0)), &[client(1_000)]).unwrap();
        assert_eq!(breakdown.exchange_rate, 0.0);
        assert!(breakdown.allocations.is_empty());
    }

    #[test]
    fn no_eligible_clients_is_a_noop() {
        let breakdown = calculate(&tx(10_000, 103, dec!(0.03), dec!(0)), &[]).unwrap();
        assert!(breakdown.allocations.is_empty());
        assert_eq!(breakdown.base_amount_sats, 100);
    }

    #[test]
    fn rounding_loss_is_truncated_not_redistributed() {
        // base = round(100 / 1.0) = 100; three equal balances leave 1 sat.
        let breakdown = calculate(
            &tx(300, 100, dec!(0), dec!(0)),
            &[client(1), client(1), client(1)],
        )
        .unwrap();
        assert_eq!(breakdown.total_distributed_sats(), 99);
        assert_eq!(breakdown.rounding_loss_sats(), 1);
    }

    #[test]
    fn fiat_share_matches_exchange_rate_floor() {
        // rate = 100 sats / 10000 centavos = 0.01; 70 sats -> 7000 centavos
        let a = client(700);
        let b = client(300);
        let breakdown = calculate(&tx(10_000, 103, dec!(0.03), dec!(0)), &[a, b]).unwrap();
        let fiat_a = breakdown
            .allocations
            .iter()
            .find(|x| x.client_id == a.client_id)
            .unwrap()
            .fiat_amount;
        assert_eq!(fiat_a, 7_000);
    }

    proptest! {
        #[test]
        fn shares_never_exceed_base(
            crypto in 0i64..1_000_000_000,
            fiat in 1i64..100_000_000,
            balances in proptest::collection::vec(0i64..10_000_000, 0..12),
        ) {
            let eligible: Vec<EligibleClient> = balances.iter().map(|b| client(*b)).collect();
            let breakdown =
                calculate(&tx(fiat, crypto, dec!(0.03), dec!(0)), &eligible).unwrap();

            prop_assert!(breakdown.total_distributed_sats() <= breakdown.base_amount_sats);
            prop_assert!(breakdown.base_amount_sats + breakdown.commission_amount_sats == crypto);
            for allocation in &breakdown.allocations {
                prop_assert!(allocation.sats_amount > 0);
            }
        }
    }
}
