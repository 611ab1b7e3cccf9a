use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PollError;

/// Connection settings for the operator-owned Lamassu Postgres database,
/// including the optional SSH tunnel in front of it. The poll checkpoint
/// lives on this row: `last_poll_succeeded_at` is the authoritative
/// low-water mark for the next fetch window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LamassuConfig {
    pub id: Uuid,
    pub host: String,
    pub port: i32,
    pub database_name: String,
    pub username: String,
    pub password: String,
    pub is_active: bool,
    pub test_connection_last: Option<DateTime<Utc>>,
    pub test_connection_success: Option<bool>,
    pub last_poll_attempted_at: Option<DateTime<Utc>>,
    pub last_poll_succeeded_at: Option<DateTime<Utc>>,
    pub use_ssh_tunnel: bool,
    pub ssh_host: Option<String>,
    pub ssh_port: i32,
    pub ssh_username: Option<String>,
    pub ssh_password: Option<String>,
    pub ssh_private_key: Option<String>,
    pub use_system_ssh: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LamassuConfig {
    /// Database port as a real port number. The column is a plain integer,
    /// so out-of-range values are rejected rather than truncated.
    pub fn db_port(&self) -> Result<u16, PollError> {
        u16::try_from(self.port)
            .map_err(|_| PollError::Connect(format!("Database port {} out of range", self.port)))
    }

    /// Extract the tunnel settings, validating that credentials exist.
    pub fn tunnel_settings(&self) -> Result<TunnelSettings, PollError> {
        let ssh_port = u16::try_from(self.ssh_port)
            .map_err(|_| PollError::Tunnel(format!("SSH port {} out of range", self.ssh_port)))?;
        let target_port = self
            .db_port()
            .map_err(|e| PollError::Tunnel(e.to_string()))?;

        let ssh_host = self
            .ssh_host
            .clone()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| PollError::Tunnel("SSH host not configured".to_string()))?;
        let ssh_username = self
            .ssh_username
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| PollError::Tunnel("SSH username not configured".to_string()))?;

        let settings = TunnelSettings {
            ssh_host,
            ssh_port,
            ssh_username,
            ssh_password: self.ssh_password.clone().filter(|p| !p.is_empty()),
            ssh_private_key: self.ssh_private_key.clone().filter(|k| !k.is_empty()),
            target_host: self.host.clone(),
            target_port,
            use_system_ssh: self.use_system_ssh,
        };

        if settings.ssh_password.is_none() && settings.ssh_private_key.is_none() {
            return Err(PollError::Tunnel(
                "Neither SSH password nor private key configured".to_string(),
            ));
        }

        Ok(settings)
    }
}

/// Everything the tunnel manager needs, decoupled from the config row.
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_username: String,
    pub ssh_password: Option<String>,
    pub ssh_private_key: Option<String>,
    /// Remote database endpoint as seen from the bastion host.
    pub target_host: String,
    pub target_port: u16,
    /// Prefer the external ssh(1) process over the in-process library.
    pub use_system_ssh: bool,
}

/// One confirmed cash transaction read from the Lamassu database.
///
/// `crypto_amount` is commission-inclusive satoshis: the amount actually
/// dispensed/charged, commission and all. `commission_rate` is a fraction
/// (0.03 = 3%), `discount_rate` is in percent units (0-100).
#[derive(Debug, Clone, Serialize)]
pub struct AtmTransaction {
    pub external_id: String,
    pub fiat_amount: i64,
    pub crypto_amount: i64,
    pub commission_rate: Decimal,
    pub discount_rate: Decimal,
    pub occurred_at: DateTime<Utc>,
    pub device_id: Option<String>,
    pub crypto_code: Option<String>,
    pub fiat_code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LamassuConfig {
        LamassuConfig {
            id: Uuid::new_v4(),
            host: "10.0.0.5".to_string(),
            port: 5432,
            database_name: "lamassu".to_string(),
            username: "reader".to_string(),
            password: "secret".to_string(),
            is_active: true,
            test_connection_last: None,
            test_connection_success: None,
            last_poll_attempted_at: None,
            last_poll_succeeded_at: None,
            use_ssh_tunnel: true,
            ssh_host: Some("bastion.example.net".to_string()),
            ssh_port: 22,
            ssh_username: Some("operator".to_string()),
            ssh_password: Some("hunter2".to_string()),
            ssh_private_key: None,
            use_system_ssh: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn tunnel_settings_extracts_valid_config() {
        let settings = config().tunnel_settings().unwrap();
        assert_eq!(settings.ssh_port, 22);
        assert_eq!(settings.target_port, 5432);
        assert_eq!(settings.target_host, "10.0.0.5");
    }

    #[test]
    fn tunnel_settings_rejects_out_of_range_ssh_port() {
        let mut cfg = config();
        cfg.ssh_port = 70_000;
        assert!(matches!(cfg.tunnel_settings(), Err(PollError::Tunnel(_))));
    }

    #[test]
    fn tunnel_settings_rejects_out_of_range_database_port() {
        let mut cfg = config();
        cfg.port = -1;
        assert!(matches!(cfg.tunnel_settings(), Err(PollError::Tunnel(_))));
    }

    #[test]
    fn db_port_rejects_out_of_range_value() {
        let mut cfg = config();
        cfg.port = 100_000;
        assert!(matches!(cfg.db_port(), Err(PollError::Connect(_))));
    }

    #[test]
    fn tunnel_settings_requires_a_credential() {
        let mut cfg = config();
        cfg.ssh_password = None;
        cfg.ssh_private_key = None;
        assert!(matches!(cfg.tunnel_settings(), Err(PollError::Tunnel(_))));
    }
}
