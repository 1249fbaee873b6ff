//! Shared TCP accept loop for plain and encrypted servers.
//!
//! Each accepted stream is upgraded to a [`Connection`] (a no-op for the plain
//! transport, a Noise handshake for the encrypted one), wrapped in a
//! [`ServerSession`] and served in its own task. A failed upgrade only drops
//! that connection.
//!
//! # Thread Safety
//!
//! The accept loop and every session run on the tokio runtime. The dispatch
//! factory is shared via `Arc` and called once per connection.

use crate::config::ServerConfig;
use crate::error::{Result, RpcError};
use crate::server::{Dispatch, ServerSession, SessionHandle};
use crate::transport::Connection;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// Turns an accepted TCP stream into a session transport.
#[async_trait]
pub(crate) trait Upgrade: Send + Sync + 'static {
    async fn upgrade(&self, stream: TcpStream, max_line_length: usize) -> Result<Connection>;
}

/// Handle to a running server. Dropping it stops accepting.
pub struct RpcServer {
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    active_sessions: Arc<AtomicUsize>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl RpcServer {
    /// The bound address, useful after binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Relaxed)
    }

    /// Stop accepting new connections. Running sessions are untouched.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Stop accepting and ask every running session to disconnect.
    pub fn shutdown(&mut self) {
        self.stop();
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("local_addr", &self.local_addr)
            .field("active_sessions", &self.active_sessions())
            .finish()
    }
}

/// Bind `addr` and serve sessions until the returned handle is stopped.
pub(crate) async fn serve<A, U, F, D>(
    addr: A,
    upgrade: U,
    config: ServerConfig,
    factory: F,
) -> Result<RpcServer>
where
    A: ToSocketAddrs,
    U: Upgrade,
    F: Fn(&SessionHandle) -> D + Send + Sync + 'static,
    D: Dispatch,
{
    if config.max_connections == 0 {
        return Err(RpcError::Config {
            message: "max_connections must be at least 1".to_string(),
        });
    }

    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!("RPC server listening on {}", local_addr);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
    let active_sessions = Arc::new(AtomicUsize::new(0));

    let task_handle = tokio::spawn(accept_loop(
        listener,
        Arc::new(upgrade),
        Arc::new(factory),
        Arc::new(config),
        shutdown_rx,
        conn_shutdown_rx,
        active_sessions.clone(),
    ));

    Ok(RpcServer {
        local_addr,
        shutdown_tx: Some(shutdown_tx),
        conn_shutdown_tx,
        active_sessions,
        task_handle: Some(task_handle),
    })
}

async fn accept_loop<U, F, D>(
    listener: TcpListener,
    upgrade: Arc<U>,
    factory: Arc<F>,
    config: Arc<ServerConfig>,
    mut shutdown_rx: oneshot::Receiver<()>,
    conn_shutdown_rx: watch::Receiver<bool>,
    active_sessions: Arc<AtomicUsize>,
) where
    U: Upgrade,
    F: Fn(&SessionHandle) -> D + Send + Sync + 'static,
    D: Dispatch,
{
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                info!("RPC server stopped accepting");
                break;
            }
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        let current = active_sessions.load(Ordering::Relaxed);
                        if current >= config.max_connections {
                            warn!(
                                "Rejecting connection from {}: at max capacity ({})",
                                peer_addr,
                                config.max_connections
                            );
                            continue;
                        }
                        if let Err(e) = stream.set_nodelay(config.nodelay) {
                            debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
                        }

                        active_sessions.fetch_add(1, Ordering::Relaxed);
                        let upgrade = upgrade.clone();
                        let factory = factory.clone();
                        let config = config.clone();
                        let sessions = active_sessions.clone();
                        let conn_shutdown = conn_shutdown_rx.clone();

                        tokio::spawn(async move {
                            debug!("Connection from {}", peer_addr);
                            if let Err(e) = serve_connection(stream, &*upgrade, &*factory, &config, conn_shutdown).await {
                                debug!("Session with {} ended: {}", peer_addr, e);
                            }
                            sessions.fetch_sub(1, Ordering::Relaxed);
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
        }
    }
}

async fn serve_connection<U, F, D>(
    stream: TcpStream,
    upgrade: &U,
    factory: &F,
    config: &ServerConfig,
    mut conn_shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    U: Upgrade,
    F: Fn(&SessionHandle) -> D,
    D: Dispatch,
{
    let upgraded = tokio::time::timeout(
        config.handshake_timeout,
        upgrade.upgrade(stream, config.session.max_line_length),
    )
    .await
    .map_err(|_| RpcError::Handshake {
        message: "Handshake timed out".to_string(),
    })?;
    let connection = upgraded?;

    let session = ServerSession::new(connection, config.session.clone());
    let handle = session.handle();
    let dispatch = factory(&handle);

    // Server shutdown turns into a server-initiated disconnect.
    let watcher = tokio::spawn(async move {
        if conn_shutdown.wait_for(|stop| *stop).await.is_ok() {
            if let Err(e) = handle.disconnect().await {
                debug!("Failed to send shutdown disconnect: {}", e);
            }
        }
    });

    let result = session.run(dispatch).await;
    watcher.abort();
    result
}
