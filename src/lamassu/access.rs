use std::net::SocketAddr;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgSslMode};
use sqlx::{Connection, PgConnection, Row};
use tracing::info;

use super::models::LamassuConfig;
use crate::error::PollError;

/// Cap on how long a connection attempt may take.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// A read-only connection to the operator-owned Lamassu database.
///
/// The engine never mutates the remote ledger; this wrapper only exists to
/// centralize connect/timeout handling and to keep the remap-to-tunnel
/// logic in one place.
pub struct LedgerConnection {
    conn: PgConnection,
}

impl LedgerConnection {
    /// Connect to the ledger database. When `endpoint` is set the logical
    /// target is remapped to the local tunnel endpoint.
    pub async fn connect(
        cfg: &LamassuConfig,
        endpoint: Option<SocketAddr>,
    ) -> Result<Self, PollError> {
        let (host, port) = match endpoint {
            Some(addr) => (addr.ip().to_string(), addr.port()),
            None => (cfg.host.clone(), cfg.db_port()?),
        };

        let options = PgConnectOptions::new()
            .host(&host)
            .port(port)
            .database(&cfg.database_name)
            .username(&cfg.username)
            .password(&cfg.password)
            .ssl_mode(PgSslMode::Prefer);

        let conn = tokio::time::timeout(CONNECT_TIMEOUT, PgConnection::connect_with(&options))
            .await
            .map_err(|_| {
                PollError::Connect(format!(
                    "Timed out connecting to {}:{} after {}s",
                    host,
                    port,
                    CONNECT_TIMEOUT.as_secs()
                ))
            })?
            .map_err(|e| PollError::Connect(e.to_string()))?;

        info!("Connected to Lamassu database at {}:{}", host, port);
        Ok(Self { conn })
    }

    /// Cheap liveness probe used by the connection-test diagnostics.
    pub async fn ping(&mut self) -> Result<(), PollError> {
        let row = sqlx::query("SELECT 1 AS one")
            .fetch_one(&mut self.conn)
            .await
            .map_err(|e| PollError::Query(e.to_string()))?;
        let one: i32 = row
            .try_get("one")
            .map_err(|e| PollError::Query(e.to_string()))?;
        debug_assert_eq!(one, 1);
        Ok(())
    }

    pub fn as_mut(&mut self) -> &mut PgConnection {
        &mut self.conn
    }

    pub async fn close(self) {
        // A failed close is harmless; the server reaps the session.
        let _ = self.conn.close().await;
    }
}
