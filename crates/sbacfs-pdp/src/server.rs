//! TCP server for the decision point.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::allowlist::Allowlist;

/// Largest request read in one go.
const MAX_REQUEST: usize = 4096;

/// Build the reply to one `path,mode` request, or `None` if the request is
/// malformed and gets no reply.
pub fn answer(allowlist: &Allowlist, peer: IpAddr, demand: &str) -> Option<String> {
    let (path, mode) = demand.rsplit_once(',')?;
    let allowed = allowlist.permits(peer, path, mode);
    tracing::info!(%peer, path, mode, allowed, "authorization request");
    Some(format!(
        "{demand},{}",
        if allowed { "True" } else { "False" }
    ))
}

/// The decision point service.
#[derive(Clone, Debug)]
pub struct PdpServer {
    allowlist: Arc<Allowlist>,
}

impl PdpServer {
    /// Create a server granting what `allowlist` lists.
    pub fn new(allowlist: Allowlist) -> Self {
        Self {
            allowlist: Arc::new(allowlist),
        }
    }

    /// Listen on `addr` until a shutdown signal arrives.
    pub async fn run(self, addr: SocketAddr) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Starting decision point on {}", listener.local_addr()?);

        tokio::select! {
            result = self.serve(listener) => result?,
            signal = shutdown_signal() => {
                tracing::info!(signal, "stopping decision point");
            }
        }

        tracing::info!("Decision point shut down");
        Ok(())
    }

    /// Accept connections from `listener` forever, one task per connection.
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (conn, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };
            tracing::debug!(%peer, "accepted connection");

            let allowlist = Arc::clone(&self.allowlist);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(conn, peer, &allowlist).await {
                    tracing::debug!(%peer, error = %e, "connection ended with error");
                }
            });
        }
    }
}

async fn handle_connection(
    mut conn: TcpStream,
    peer: SocketAddr,
    allowlist: &Allowlist,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; MAX_REQUEST];
    loop {
        let n = conn.read(&mut buf).await?;
        if n == 0 {
            tracing::debug!(%peer, "peer closed connection");
            return Ok(());
        }

        let demand = String::from_utf8_lossy(&buf[..n]);
        match answer(allowlist, peer.ip(), &demand) {
            Some(reply) => conn.write_all(reply.as_bytes()).await?,
            None => tracing::warn!(%peer, %demand, "ignoring malformed request"),
        }
    }
}

/// Resolves with the name of the first termination signal received.
async fn shutdown_signal() -> &'static str {
    let interrupt = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "SIGINT",
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGINT");
                std::future::pending().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                "SIGTERM"
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<&'static str>();

    tokio::select! {
        name = interrupt => name,
        name = terminate => name,
    }
}
