use chrono::Utc;
use sqlx::{postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use super::models::*;
use crate::error::{AppError, AppResult};

/// Client registry - owns the dca_clients and dca_deposits tables.
///
/// The distribution engine only reads from here; mutation happens through
/// the registration endpoints.
pub struct ClientRepository {
    pool: PgPool,
}

impl ClientRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn client_from_row(row: &PgRow) -> AppResult<DcaClient> {
        let mode: String = row.try_get("dca_mode")?;
        let status: String = row.try_get("status")?;
        Ok(DcaClient {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            wallet_id: row.try_get("wallet_id")?,
            dca_mode: DcaMode::parse(&mode)?,
            fixed_mode_daily_limit: row.try_get("fixed_mode_daily_limit")?,
            status: ClientStatus::parse(&status)?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn deposit_from_row(row: &PgRow) -> AppResult<DcaDeposit> {
        let status: String = row.try_get("status")?;
        Ok(DcaDeposit {
            id: row.try_get("id")?,
            client_id: row.try_get("client_id")?,
            amount: row.try_get("amount")?,
            currency: row.try_get("currency")?,
            status: DepositStatus::parse(&status)?,
            notes: row.try_get("notes")?,
            created_at: row.try_get("created_at")?,
            confirmed_at: row.try_get("confirmed_at")?,
        })
    }

    // ========== CLIENT OPERATIONS ==========

    pub async fn create_client(
        &self,
        user_id: &str,
        wallet_id: &str,
        dca_mode: DcaMode,
        fixed_mode_daily_limit: Option<i64>,
    ) -> AppResult<DcaClient> {
        let existing = sqlx::query("SELECT id FROM dca_clients WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        if existing.is_some() {
            return Err(AppError::Conflict(format!(
                "User {} is already registered",
                user_id
            )));
        }

        let row = sqlx::query(
            r#"
            INSERT INTO dca_clients (id, user_id, wallet_id, dca_mode, fixed_mode_daily_limit, status)
            VALUES ($1, $2, $3, $4, $5, 'active')
            RETURNING id, user_id, wallet_id, dca_mode, fixed_mode_daily_limit, status,
                      created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(wallet_id)
        .bind(dca_mode.as_str())
        .bind(fixed_mode_daily_limit)
        .fetch_one(&self.pool)
        .await?;

        Self::client_from_row(&row)
    }

    pub async fn get_client(&self, client_id: Uuid) -> AppResult<DcaClient> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, wallet_id, dca_mode, fixed_mode_daily_limit, status,
                   created_at, updated_at
            FROM dca_clients
            WHERE id = $1
            "#,
        )
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Client {} not found", client_id)))?;

        Self::client_from_row(&row)
    }

    pub async fn list_clients(&self) -> AppResult<Vec<DcaClient>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, wallet_id, dca_mode, fixed_mode_daily_limit, status,
                   created_at, updated_at
            FROM dca_clients
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::client_from_row).collect()
    }

    /// Active flow-mode clients - the candidate set for proportional
    /// distribution. Balance filtering happens per transaction.
    pub async fn list_flow_clients(&self) -> AppResult<Vec<DcaClient>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, wallet_id, dca_mode, fixed_mode_daily_limit, status,
                   created_at, updated_at
            FROM dca_clients
            WHERE dca_mode = 'flow' AND status = 'active'
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::client_from_row).collect()
    }

    pub async fn update_client(
        &self,
        client_id: Uuid,
        dca_mode: Option<DcaMode>,
        fixed_mode_daily_limit: Option<i64>,
        status: Option<ClientStatus>,
    ) -> AppResult<DcaClient> {
        let row = sqlx::query(
            r#"
            UPDATE dca_clients
            SET dca_mode = COALESCE($2, dca_mode),
                fixed_mode_daily_limit = COALESCE($3, fixed_mode_daily_limit),
                status = COALESCE($4, status),
                updated_at = $5
            WHERE id = $1
            RETURNING id, user_id, wallet_id, dca_mode, fixed_mode_daily_limit, status,
                      created_at, updated_at
            "#,
        )
        .bind(client_id)
        .bind(dca_mode.map(|m| m.as_str()))
        .bind(fixed_mode_daily_limit)
        .bind(status.map(|s| s.as_str()))
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Client {} not found", client_id)))?;

        Self::client_from_row(&row)
    }

    // ========== BALANCE SUMMARY ==========

    /// Derived on demand: confirmed deposits minus confirmed DCA spend.
    pub async fn balance_summary(&self, client_id: Uuid) -> AppResult<BalanceSummary> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE((SELECT SUM(amount) FROM dca_deposits
                          WHERE client_id = $1 AND status = 'confirmed'), 0)::BIGINT AS confirmed_deposits,
                COALESCE((SELECT SUM(amount_fiat) FROM dca_payments
                          WHERE client_id = $1 AND status = 'confirmed'), 0)::BIGINT AS confirmed_dca_spend
            "#,
        )
        .bind(client_id)
        .fetch_one(&self.pool)
        .await?;

        let confirmed_deposits: i64 = row.try_get("confirmed_deposits")?;
        let confirmed_dca_spend: i64 = row.try_get("confirmed_dca_spend")?;

        Ok(BalanceSummary {
            client_id,
            confirmed_deposits,
            confirmed_dca_spend,
            remaining_balance: confirmed_deposits - confirmed_dca_spend,
        })
    }

    // ========== DEPOSIT OPERATIONS ==========

    pub async fn create_deposit(
        &self,
        client_id: Uuid,
        amount: i64,
        currency: &str,
        notes: Option<String>,
    ) -> AppResult<DcaDeposit> {
        if amount <= 0 {
            return Err(AppError::InvalidInput(
                "Deposit amount must be positive".to_string(),
            ));
        }
        // Ensure the client exists before taking money against it
        self.get_client(client_id).await?;

        let row = sqlx::query(
            r#"
            INSERT INTO dca_deposits (id, client_id, amount, currency, status, notes)
            VALUES ($1, $2, $3, $4, 'pending', $5)
            RETURNING id, client_id, amount, currency, status, notes, created_at, confirmed_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(client_id)
        .bind(amount)
        .bind(currency)
        .bind(notes)
        .fetch_one(&self.pool)
        .await?;

        Self::deposit_from_row(&row)
    }

    pub async fn update_deposit_status(
        &self,
        deposit_id: Uuid,
        status: DepositStatus,
    ) -> AppResult<DcaDeposit> {
        let confirmed_at = match status {
            DepositStatus::Confirmed => Some(Utc::now()),
            DepositStatus::Pending => None,
        };

        let row = sqlx::query(
            r#"
            UPDATE dca_deposits
            SET status = $2, confirmed_at = $3
            WHERE id = $1
            RETURNING id, client_id, amount, currency, status, notes, created_at, confirmed_at
            "#,
        )
        .bind(deposit_id)
        .bind(status.as_str())
        .bind(confirmed_at)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Deposit {} not found", deposit_id)))?;

        Self::deposit_from_row(&row)
    }

    pub async fn list_deposits(&self, client_id: Uuid) -> AppResult<Vec<DcaDeposit>> {
        let rows = sqlx::query(
            r#"
            SELECT id, client_id, amount, currency, status, notes, created_at, confirmed_at
            FROM dca_deposits
            WHERE client_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(client_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::deposit_from_row).collect()
    }
}
