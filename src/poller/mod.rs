use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::clients::ClientRepository;
use crate::distribution::calculator;
use crate::distribution::models::EligibleClient;
use crate::distribution::PaymentRepository;
use crate::error::{AppError, AppResult, PollError};
use crate::lamassu::access::LedgerConnection;
use crate::lamassu::fetcher::{window_start, TransactionFetcher};
use crate::lamassu::models::{AtmTransaction, LamassuConfig, TunnelSettings};
use crate::lamassu::LamassuRepository;
use crate::tunnel::{select_tunnel, TunnelManager};

/// Outcome of one poll cycle, also the manual-poll response body.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub fetched: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub failures: Vec<String>,
}

/// One step of the connection-test diagnostics. Operators debug tunnel and
/// credential problems from these without log access.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticStep {
    pub step: String,
    pub success: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionTestReport {
    pub ok: bool,
    pub steps: Vec<DiagnosticStep>,
}

impl ConnectionTestReport {
    fn step(&mut self, step: &str, success: bool, detail: impl Into<String>) {
        self.steps.push(DiagnosticStep {
            step: step.to_string(),
            success,
            detail: detail.into(),
        });
        if !success {
            self.ok = false;
        }
    }
}

/// Runs poll cycles: checkpoint window -> tunnel -> fetch -> per-transaction
/// calculate + record -> checkpoint advance.
///
/// Scheduled and manual runs share `cycle_lock`; at most one cycle is in
/// flight at a time. That serialization is what makes the checkpoint writes
/// and the single-active-tunnel constraint safe.
pub struct PollOrchestrator {
    lamassu: Arc<LamassuRepository>,
    clients: Arc<ClientRepository>,
    payments: Arc<PaymentRepository>,
    fetcher: TransactionFetcher,
    cycle_lock: tokio::sync::Mutex<()>,
}

impl PollOrchestrator {
    pub fn new(
        lamassu: Arc<LamassuRepository>,
        clients: Arc<ClientRepository>,
        payments: Arc<PaymentRepository>,
        fetcher: TransactionFetcher,
    ) -> Self {
        Self {
            lamassu,
            clients,
            payments,
            fetcher,
            cycle_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Run one complete poll cycle. The success checkpoint only advances
    /// when every fetched transaction was handled; a transaction that
    /// failed mid-batch stays ahead of the checkpoint and is retried next
    /// cycle.
    pub async fn run_cycle(&self) -> AppResult<CycleReport> {
        let _guard = self.cycle_lock.lock().await;

        let cfg = self
            .lamassu
            .get_active_config()
            .await?
            .ok_or(PollError::ConfigMissing)?;

        let now = Utc::now();
        self.lamassu.record_poll_attempt(cfg.id, now).await?;
        let window = window_start(cfg.last_poll_succeeded_at, now);

        // Local-only query; runs before any tunnel or remote connection
        // exists so its failure leaks nothing.
        let known = self.fetcher.known_transaction_ids().await?;

        let tunnel = if cfg.use_ssh_tunnel {
            let settings = cfg.tunnel_settings()?;
            let manager = select_tunnel(&settings);
            Some((manager, settings))
        } else {
            None
        };

        let report = with_tunnel(tunnel, |endpoint| {
            self.run_connected(&cfg, endpoint, window, &known)
        })
        .await?;

        if should_advance_checkpoint(&report) {
            self.lamassu.record_poll_success(cfg.id, Utc::now()).await?;
        } else {
            warn!(
                "{} of {} transactions failed; checkpoint not advanced",
                report.failed, report.fetched
            );
        }

        info!(
            "Poll cycle complete: {} fetched, {} processed, {} skipped, {} failed",
            report.fetched, report.processed, report.skipped, report.failed
        );
        Ok(report)
    }

    async fn run_connected(
        &self,
        cfg: &LamassuConfig,
        endpoint: Option<SocketAddr>,
        window: chrono::DateTime<Utc>,
        known: &HashSet<String>,
    ) -> AppResult<CycleReport> {
        let mut ledger = match LedgerConnection::connect(cfg, endpoint).await {
            Ok(ledger) => {
                self.lamassu.update_test_result(cfg.id, true).await?;
                ledger
            }
            Err(e) => {
                // Best effort: the flag matters more than this write.
                if let Err(flag_err) = self.lamassu.update_test_result(cfg.id, false).await {
                    warn!("Could not record connection test result: {}", flag_err);
                }
                return Err(e.into());
            }
        };

        let fetched = self
            .fetcher
            .fetch_confirmed_since(&mut ledger, window, known)
            .await;
        ledger.close().await;
        let transactions = fetched?;

        let mut report = CycleReport {
            fetched: transactions.len(),
            ..Default::default()
        };

        // Per-transaction isolation: one bad transaction is logged and
        // skipped, the rest of the batch keeps going. Fatal poll errors
        // (lost local database, for instance) still abort the cycle.
        for tx in &transactions {
            match self.process_transaction(tx).await {
                Ok(true) => report.processed += 1,
                Ok(false) => report.skipped += 1,
                Err(AppError::Poll(e)) if e.is_fatal_for_cycle() => {
                    return Err(AppError::Poll(e));
                }
                Err(e) => {
                    let failure = PollError::Transaction {
                        external_id: tx.external_id.clone(),
                        reason: e.to_string(),
                    };
                    error!("{}", failure);
                    report.failed += 1;
                    report.failures.push(failure.to_string());
                }
            }
        }

        Ok(report)
    }

    /// Calculate and record distributions for one ledger transaction.
    /// Returns false when the transaction was a no-op (already recorded, or
    /// nothing to distribute).
    async fn process_transaction(&self, tx: &AtmTransaction) -> AppResult<bool> {
        // Any existing payment for this external id means a previous cycle
        // already handled it; never recompute.
        let existing = self
            .payments
            .find_payments_by_transaction(&tx.external_id)
            .await?;
        if !existing.is_empty() {
            info!(
                "Transaction {} already recorded ({} payments), skipping",
                tx.external_id,
                existing.len()
            );
            return Ok(false);
        }

        let flow_clients = self.clients.list_flow_clients().await?;
        let mut eligible = Vec::with_capacity(flow_clients.len());
        for client in flow_clients.iter().filter(|c| c.participates_in_flow()) {
            let balance = self.clients.balance_summary(client.id).await?;
            if balance.remaining_balance > 0 {
                eligible.push(EligibleClient {
                    client_id: client.id,
                    remaining_balance: balance.remaining_balance,
                });
            }
        }

        let breakdown = calculator::calculate(tx, &eligible)?;
        if breakdown.allocations.is_empty() {
            info!(
                "Transaction {}: no eligible balance, nothing to distribute",
                tx.external_id
            );
            return Ok(false);
        }

        self.payments.record_distribution(tx, &breakdown).await?;
        Ok(true)
    }

    /// Tunnel + connect + SELECT 1 only; never touches transactions.
    /// Shares the cycle lock because the tunnel is single-occupancy.
    pub async fn test_connection(&self) -> AppResult<ConnectionTestReport> {
        let _guard = self.cycle_lock.lock().await;

        let mut report = ConnectionTestReport {
            ok: true,
            steps: Vec::new(),
        };

        let cfg = match self.lamassu.get_active_config().await? {
            Some(cfg) => {
                report.step("config", true, format!("Active configuration {}", cfg.id));
                cfg
            }
            None => {
                report.step("config", false, "No active Lamassu configuration");
                return Ok(report);
            }
        };

        let tunnel = if cfg.use_ssh_tunnel {
            match cfg.tunnel_settings() {
                Ok(settings) => Some((select_tunnel(&settings), settings)),
                Err(e) => {
                    report.step("tunnel", false, e.to_string());
                    self.lamassu.update_test_result(cfg.id, false).await?;
                    return Ok(report);
                }
            }
        } else {
            None
        };

        let cfg = &cfg;
        let outcome = with_tunnel_diagnostics(tunnel, &mut report, |endpoint| async move {
            match LedgerConnection::connect(cfg, endpoint).await {
                Ok(mut ledger) => {
                    let connect_detail = match endpoint {
                        Some(addr) => format!("Connected via tunnel endpoint {}", addr),
                        None => format!("Connected to {}:{}", cfg.host, cfg.port),
                    };
                    let ping = ledger.ping().await;
                    ledger.close().await;
                    match ping {
                        Ok(()) => Ok((connect_detail, "SELECT 1 succeeded".to_string())),
                        Err(e) => Err(("query", connect_detail, e.to_string())),
                    }
                }
                Err(e) => Err(("connect", String::new(), e.to_string())),
            }
        })
        .await;

        match outcome {
            Some(Ok((connect_detail, query_detail))) => {
                report.step("connect", true, connect_detail);
                report.step("query", true, query_detail);
            }
            Some(Err(("connect", _, detail))) => report.step("connect", false, detail),
            Some(Err((stage, connect_detail, detail))) => {
                report.step("connect", true, connect_detail);
                report.step(stage, false, detail);
            }
            // Tunnel failed; the step was already recorded.
            None => {}
        }

        self.lamassu.update_test_result(cfg.id, report.ok).await?;
        Ok(report)
    }

    /// Permanent scheduled loop: steady interval on success, shorter
    /// backoff after a failed cycle, graceful stop on shutdown signal.
    pub fn spawn_scheduler(
        self: Arc<Self>,
        interval: Duration,
        error_backoff: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Scheduled Lamassu polling started (every {}s, {}s backoff on error)",
                interval.as_secs(),
                error_backoff.as_secs()
            );
            loop {
                let outcome = self.run_cycle().await;
                match &outcome {
                    Ok(report) => info!(
                        "Scheduled poll processed {} transactions",
                        report.processed
                    ),
                    Err(e) => error!("Scheduled poll failed: {}", e),
                }
                let sleep_for = next_sleep(outcome.is_ok(), interval, error_backoff);

                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Scheduled polling stopped");
                            break;
                        }
                    }
                }
            }
        })
    }
}

/// The success checkpoint moves only when every fetched transaction was
/// handled; an empty batch counts as fully handled.
fn should_advance_checkpoint(report: &CycleReport) -> bool {
    report.failed == 0
}

/// Steady interval after a clean cycle, shorter backoff after a failure.
fn next_sleep(cycle_ok: bool, interval: Duration, error_backoff: Duration) -> Duration {
    if cycle_ok {
        interval
    } else {
        error_backoff
    }
}

/// Run `body` with an optional tunnel around it. The tunnel is torn down on
/// every exit path: open failure, body failure, or success.
async fn with_tunnel<T, F, Fut>(
    tunnel: Option<(Box<dyn TunnelManager>, TunnelSettings)>,
    body: F,
) -> AppResult<T>
where
    F: FnOnce(Option<SocketAddr>) -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let (mut manager, endpoint) = match tunnel {
        Some((mut manager, settings)) => match manager.open(&settings).await {
            Ok(endpoint) => (Some(manager), Some(endpoint)),
            Err(e) => {
                manager.close().await;
                return Err(e.into());
            }
        },
        None => (None, None),
    };

    let result = body(endpoint).await;

    if let Some(mut manager) = manager {
        manager.close().await;
    }

    result
}

/// Same shape as `with_tunnel`, but records the tunnel steps into the
/// diagnostics report instead of failing the call. Returns None when the
/// tunnel never came up.
async fn with_tunnel_diagnostics<T, F, Fut>(
    tunnel: Option<(Box<dyn TunnelManager>, TunnelSettings)>,
    report: &mut ConnectionTestReport,
    body: F,
) -> Option<T>
where
    F: FnOnce(Option<SocketAddr>) -> Fut,
    Fut: Future<Output = T>,
{
    let (mut manager, endpoint) = match tunnel {
        Some((mut manager, settings)) => match manager.open(&settings).await {
            Ok(endpoint) => {
                report.step(
                    "tunnel",
                    true,
                    format!("Tunnel established, local endpoint {}", endpoint),
                );
                (Some(manager), Some(endpoint))
            }
            Err(e) => {
                report.step("tunnel", false, e.to_string());
                manager.close().await;
                return None;
            }
        },
        None => (None, None),
    };

    let result = body(endpoint).await;

    if let Some(mut manager) = manager {
        manager.close().await;
    }

    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeTunnel {
        opened: Arc<AtomicBool>,
        closed: Arc<AtomicBool>,
        fail_open: bool,
    }

    impl FakeTunnel {
        fn new(fail_open: bool) -> (Box<dyn TunnelManager>, Arc<AtomicBool>, Arc<AtomicBool>) {
            let opened = Arc::new(AtomicBool::new(false));
            let closed = Arc::new(AtomicBool::new(false));
            (
                Box::new(FakeTunnel {
                    opened: opened.clone(),
                    closed: closed.clone(),
                    fail_open,
                }),
                opened,
                closed,
            )
        }
    }

    #[async_trait]
    impl TunnelManager for FakeTunnel {
        async fn open(&mut self, _settings: &TunnelSettings) -> Result<SocketAddr, PollError> {
            if self.fail_open {
                return Err(PollError::Tunnel("handshake refused".to_string()));
            }
            self.opened.store(true, Ordering::SeqCst);
            Ok("127.0.0.1:15432".parse().unwrap())
        }

        async fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn settings() -> TunnelSettings {
        TunnelSettings {
            ssh_host: "bastion".to_string(),
            ssh_port: 22,
            ssh_username: "op".to_string(),
            ssh_password: Some("secret".to_string()),
            ssh_private_key: None,
            target_host: "db".to_string(),
            target_port: 5432,
            use_system_ssh: false,
        }
    }

    #[tokio::test]
    async fn tunnel_closed_after_successful_body() {
        let (tunnel, opened, closed) = FakeTunnel::new(false);
        let result = with_tunnel(Some((tunnel, settings())), |endpoint| async move {
            assert!(endpoint.is_some());
            Ok::<_, AppError>(42)
        })
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert!(opened.load(Ordering::SeqCst));
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn tunnel_closed_when_body_fails() {
        let (tunnel, _opened, closed) = FakeTunnel::new(false);
        let result: AppResult<()> = with_tunnel(Some((tunnel, settings())), |_| async {
            Err(PollError::Query("boom".to_string()).into())
        })
        .await;

        assert!(result.is_err());
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn tunnel_closed_when_open_fails() {
        let (tunnel, opened, closed) = FakeTunnel::new(true);
        let result: AppResult<()> =
            with_tunnel(Some((tunnel, settings())), |_| async { Ok(()) }).await;

        assert!(matches!(
            result,
            Err(AppError::Poll(PollError::Tunnel(_)))
        ));
        assert!(!opened.load(Ordering::SeqCst));
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn no_tunnel_runs_body_directly() {
        let result = with_tunnel(None, |endpoint| async move {
            assert!(endpoint.is_none());
            Ok::<_, AppError>("direct")
        })
        .await
        .unwrap();
        assert_eq!(result, "direct");
    }

    #[test]
    fn checkpoint_advances_only_on_a_clean_batch() {
        let clean = CycleReport {
            fetched: 3,
            processed: 2,
            skipped: 1,
            ..Default::default()
        };
        assert!(should_advance_checkpoint(&clean));

        let partial = CycleReport {
            fetched: 3,
            processed: 2,
            failed: 1,
            failures: vec!["tx-9: calculation failed".to_string()],
            ..Default::default()
        };
        assert!(!should_advance_checkpoint(&partial));
    }

    #[test]
    fn empty_batch_still_advances_checkpoint() {
        assert!(should_advance_checkpoint(&CycleReport::default()));
    }

    #[test]
    fn scheduler_backs_off_after_a_failed_cycle() {
        let interval = Duration::from_secs(3600);
        let backoff = Duration::from_secs(300);
        assert_eq!(next_sleep(true, interval, backoff), interval);
        assert_eq!(next_sleep(false, interval, backoff), backoff);
    }

    #[tokio::test]
    async fn diagnostics_record_tunnel_failure_step() {
        let (tunnel, _opened, closed) = FakeTunnel::new(true);
        let mut report = ConnectionTestReport {
            ok: true,
            steps: Vec::new(),
        };
        let outcome =
            with_tunnel_diagnostics(Some((tunnel, settings())), &mut report, |_| async { 1 })
                .await;

        assert!(outcome.is_none());
        assert!(!report.ok);
        assert_eq!(report.steps.len(), 1);
        assert_eq!(report.steps[0].step, "tunnel");
        assert!(!report.steps[0].success);
        assert!(closed.load(Ordering::SeqCst));
    }
}
