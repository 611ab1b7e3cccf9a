pub mod libssh;
pub mod openssh;

use std::net::SocketAddr;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::PollError;
use crate::lamassu::models::TunnelSettings;

/// An encrypted tunnel to the bastion host in front of the ledger database.
///
/// `open` returns the local endpoint the ledger connection should be
/// remapped to. `close` is idempotent and safe to call even if `open` was
/// never called or failed; callers invoke it on every exit path of a poll
/// cycle. At most one tunnel is active per process - poll cycles are
/// serialized upstream.
#[async_trait]
pub trait TunnelManager: Send {
    async fn open(&mut self, settings: &TunnelSettings) -> Result<SocketAddr, PollError>;
    async fn close(&mut self);
}

/// Pick a tunnel implementation from what the configuration can support.
///
/// Password authentication only works in-process (ssh(1) would prompt), so
/// it always selects the library tunnel. Key-authenticated configs may opt
/// into the external ssh(1) process when the binary is present.
pub fn select_tunnel(settings: &TunnelSettings) -> Box<dyn TunnelManager> {
    if settings.use_system_ssh && settings.ssh_private_key.is_some() && system_ssh_path().is_some()
    {
        Box::new(openssh::OpenSshTunnel::new())
    } else {
        Box::new(libssh::LibSshTunnel::new())
    }
}

/// Locate the ssh(1) binary on PATH.
pub fn system_ssh_path() -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join("ssh"))
        .find(|candidate| candidate.is_file())
}

/// Bind an ephemeral loopback port for the local side of the tunnel.
pub(crate) fn reserve_local_addr() -> Result<(std::net::TcpListener, SocketAddr), PollError> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))
        .map_err(|e| PollError::Tunnel(format!("Could not bind local endpoint: {}", e)))?;
    let addr = listener
        .local_addr()
        .map_err(|e| PollError::Tunnel(format!("Could not resolve local endpoint: {}", e)))?;
    Ok((listener, addr))
}
