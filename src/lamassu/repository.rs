use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use super::models::LamassuConfig;
use crate::error::{AppError, AppResult};

/// Local store for the Lamassu connection configuration and the poll
/// checkpoint attached to it.
pub struct LamassuRepository {
    pool: PgPool,
}

impl LamassuRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn config_from_row(row: &PgRow) -> AppResult<LamassuConfig> {
        Ok(LamassuConfig {
            id: row.try_get("id")?,
            host: row.try_get("host")?,
            port: row.try_get("port")?,
            database_name: row.try_get("database_name")?,
            username: row.try_get("username")?,
            password: row.try_get("password")?,
            is_active: row.try_get("is_active")?,
            test_connection_last: row.try_get("test_connection_last")?,
            test_connection_success: row.try_get("test_connection_success")?,
            last_poll_attempted_at: row.try_get("last_poll_attempted_at")?,
            last_poll_succeeded_at: row.try_get("last_poll_succeeded_at")?,
            use_ssh_tunnel: row.try_get("use_ssh_tunnel")?,
            ssh_host: row.try_get("ssh_host")?,
            ssh_port: row.try_get("ssh_port")?,
            ssh_username: row.try_get("ssh_username")?,
            ssh_password: row.try_get("ssh_password")?,
            ssh_private_key: row.try_get("ssh_private_key")?,
            use_system_ssh: row.try_get("use_system_ssh")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    const CONFIG_COLUMNS: &'static str = r#"
        id, host, port, database_name, username, password, is_active,
        test_connection_last, test_connection_success,
        last_poll_attempted_at, last_poll_succeeded_at,
        use_ssh_tunnel, ssh_host, ssh_port, ssh_username, ssh_password,
        ssh_private_key, use_system_ssh, created_at, updated_at
    "#;

    pub async fn get_active_config(&self) -> AppResult<Option<LamassuConfig>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM lamassu_config WHERE is_active = TRUE ORDER BY updated_at DESC LIMIT 1",
            Self::CONFIG_COLUMNS
        ))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::config_from_row).transpose()
    }

    /// Create or replace the active configuration. Any previously active
    /// row is deactivated so the checkpoint stays 1:1 with the active
    /// config.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_config(
        &self,
        host: &str,
        port: i32,
        database_name: &str,
        username: &str,
        password: &str,
        use_ssh_tunnel: bool,
        ssh_host: Option<String>,
        ssh_port: i32,
        ssh_username: Option<String>,
        ssh_password: Option<String>,
        ssh_private_key: Option<String>,
        use_system_ssh: bool,
    ) -> AppResult<LamassuConfig> {
        if !(1..=65_535).contains(&port) {
            return Err(AppError::InvalidInput(format!(
                "Database port {} out of range",
                port
            )));
        }
        if !(1..=65_535).contains(&ssh_port) {
            return Err(AppError::InvalidInput(format!(
                "SSH port {} out of range",
                ssh_port
            )));
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE lamassu_config SET is_active = FALSE, updated_at = $1 WHERE is_active = TRUE")
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO lamassu_config (
                id, host, port, database_name, username, password, is_active,
                use_ssh_tunnel, ssh_host, ssh_port, ssh_username, ssh_password,
                ssh_private_key, use_system_ssh
            )
            VALUES ($1, $2, $3, $4, $5, $6, TRUE, $7, $8, $9, $10, $11, $12, $13)
            RETURNING {}
            "#,
            Self::CONFIG_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(host)
        .bind(port)
        .bind(database_name)
        .bind(username)
        .bind(password)
        .bind(use_ssh_tunnel)
        .bind(ssh_host)
        .bind(ssh_port)
        .bind(ssh_username)
        .bind(ssh_password)
        .bind(ssh_private_key)
        .bind(use_system_ssh)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Self::config_from_row(&row)
    }

    // ========== CHECKPOINT ==========

    pub async fn record_poll_attempt(
        &self,
        config_id: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<()> {
        sqlx::query("UPDATE lamassu_config SET last_poll_attempted_at = $2 WHERE id = $1")
            .bind(config_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Advance the success checkpoint. GREATEST guards monotonicity even if
    /// clocks or callers misbehave: the checkpoint never moves backwards.
    pub async fn record_poll_success(
        &self,
        config_id: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE lamassu_config
            SET last_poll_succeeded_at = GREATEST(COALESCE(last_poll_succeeded_at, $2), $2)
            WHERE id = $1
            "#,
        )
        .bind(config_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Operator-visible "last connection test" flag. Written on every
    /// connect outcome, independent of whether a full poll succeeded.
    pub async fn update_test_result(&self, config_id: Uuid, success: bool) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE lamassu_config
            SET test_connection_last = $2, test_connection_success = $3
            WHERE id = $1
            "#,
        )
        .bind(config_id)
        .bind(Utc::now())
        .bind(success)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
