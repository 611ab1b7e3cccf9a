use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use ssh2::Session;
use tracing::{info, warn};

use super::TunnelManager;
use crate::error::PollError;
use crate::lamassu::models::TunnelSettings;

const SSH_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// In-process SSH tunnel built on libssh2.
///
/// `open` performs the handshake and authentication, then hands the session
/// to a forwarder thread that accepts loopback connections and pumps them
/// over `channel_direct_tcpip` to the database endpoint behind the bastion.
pub struct LibSshTunnel {
    worker: Option<ForwardWorker>,
}

struct ForwardWorker {
    shutdown: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

impl LibSshTunnel {
    pub fn new() -> Self {
        Self { worker: None }
    }
}

impl Default for LibSshTunnel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TunnelManager for LibSshTunnel {
    async fn open(&mut self, settings: &TunnelSettings) -> Result<SocketAddr, PollError> {
        if self.worker.is_some() {
            return Err(PollError::Tunnel("Tunnel already open".to_string()));
        }

        let settings = settings.clone();
        // libssh2 is blocking; keep the handshake off the async runtime.
        let (worker, local_addr) = tokio::task::spawn_blocking(move || start_forwarder(&settings))
            .await
            .map_err(|e| PollError::Tunnel(format!("Tunnel task panicked: {}", e)))??;

        info!(
            "SSH tunnel established, local endpoint {} -> bastion",
            local_addr
        );
        self.worker = Some(worker);
        Ok(local_addr)
    }

    async fn close(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.shutdown.store(true, Ordering::SeqCst);
            let _ = tokio::task::spawn_blocking(move || {
                let _ = worker.handle.join();
            })
            .await;
            info!("SSH tunnel closed");
        }
    }
}

fn start_forwarder(settings: &TunnelSettings) -> Result<(ForwardWorker, SocketAddr), PollError> {
    let session = connect_and_authenticate(settings)?;

    let (listener, local_addr) = super::reserve_local_addr()?;
    listener
        .set_nonblocking(true)
        .map_err(|e| PollError::Tunnel(format!("Could not configure listener: {}", e)))?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let target_host = settings.target_host.clone();
    let target_port = settings.target_port;

    let handle = {
        let shutdown = shutdown.clone();
        thread::spawn(move || {
            accept_loop(session, listener, &target_host, target_port, &shutdown);
        })
    };

    Ok((ForwardWorker { shutdown, handle }, local_addr))
}

fn connect_and_authenticate(settings: &TunnelSettings) -> Result<Session, PollError> {
    let bastion = (settings.ssh_host.as_str(), settings.ssh_port)
        .to_socket_addrs()
        .map_err(|e| PollError::Tunnel(format!("Could not resolve SSH host: {}", e)))?
        .next()
        .ok_or_else(|| PollError::Tunnel("SSH host resolved to no addresses".to_string()))?;

    let tcp = TcpStream::connect_timeout(&bastion, SSH_CONNECT_TIMEOUT)
        .map_err(|e| PollError::Tunnel(format!("TCP connect to bastion failed: {}", e)))?;

    let mut session =
        Session::new().map_err(|e| PollError::Tunnel(format!("Session init failed: {}", e)))?;
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|e| PollError::Tunnel(format!("SSH handshake refused: {}", e)))?;

    // Key material wins over password when both are present.
    if let Some(key) = &settings.ssh_private_key {
        session
            .userauth_pubkey_memory(&settings.ssh_username, None, key, None)
            .map_err(|e| PollError::Tunnel(format!("Key authentication failed: {}", e)))?;
    } else if let Some(password) = &settings.ssh_password {
        session
            .userauth_password(&settings.ssh_username, password)
            .map_err(|e| PollError::Tunnel(format!("Password authentication failed: {}", e)))?;
    } else {
        return Err(PollError::Tunnel(
            "Neither SSH password nor private key configured".to_string(),
        ));
    }

    if !session.authenticated() {
        return Err(PollError::Tunnel(
            "SSH authentication rejected".to_string(),
        ));
    }

    Ok(session)
}

/// Serve loopback connections until asked to shut down. Connections are
/// handled serially; the ledger layer holds a single connection at a time.
fn accept_loop(
    session: Session,
    listener: TcpListener,
    target_host: &str,
    target_port: u16,
    shutdown: &AtomicBool,
) {
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((local, peer)) => {
                if let Err(e) = forward_connection(&session, local, target_host, target_port) {
                    warn!("Tunnel connection from {} failed: {}", peer, e);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => {
                warn!("Tunnel listener error: {}", e);
                break;
            }
        }
    }
    let _ = session.disconnect(None, "tunnel closed", None);
}

/// Single-threaded bidirectional byte pump. libssh2 sessions are not
/// thread-safe, so both directions are serviced from one loop with the
/// session in non-blocking mode.
fn forward_connection(
    session: &Session,
    mut local: TcpStream,
    target_host: &str,
    target_port: u16,
) -> io::Result<()> {
    local.set_nodelay(true)?;

    session.set_blocking(true);
    let mut channel = session
        .channel_direct_tcpip(target_host, target_port, None)
        .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e))?;

    local.set_nonblocking(true)?;
    session.set_blocking(false);

    let mut buf = [0u8; 16 * 1024];
    let mut local_eof = false;

    loop {
        let mut idle = true;

        if !local_eof {
            match local.read(&mut buf) {
                Ok(0) => {
                    // Client hung up; propagate EOF so the database closes
                    // its half and the remaining bytes drain.
                    local_eof = true;
                    session.set_blocking(true);
                    let _ = channel.send_eof();
                    session.set_blocking(false);
                }
                Ok(n) => {
                    idle = false;
                    write_all_retrying(&mut channel, &buf[..n])?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }

        match channel.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                idle = false;
                local.set_nonblocking(false)?;
                local.write_all(&buf[..n])?;
                local.set_nonblocking(true)?;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if channel.eof() {
                    break;
                }
            }
            Err(e) => return Err(e),
        }

        if idle {
            thread::sleep(Duration::from_millis(5));
        }
    }

    session.set_blocking(true);
    let _ = channel.close();
    let _ = channel.wait_close();
    Ok(())
}

/// Write the whole buffer, retrying on EAGAIN from the non-blocking session.
fn write_all_retrying(channel: &mut ssh2::Channel, data: &[u8]) -> io::Result<()> {
    let mut written = 0;
    while written < data.len() {
        match channel.write(&data[written..]) {
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(1));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
