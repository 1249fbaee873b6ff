//! Plain TCP listener and dialer.

use crate::client::RpcClient;
use crate::config::{ClientConfig, ServerConfig};
use crate::error::{Result, RpcError};
use crate::listener::{self, RpcServer, Upgrade};
use crate::server::{Dispatch, SessionHandle};
use crate::transport::Connection;
use async_trait::async_trait;
use std::fmt;
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

pub(crate) struct PlainUpgrade;

#[async_trait]
impl Upgrade for PlainUpgrade {
    async fn upgrade(&self, stream: TcpStream, max_line_length: usize) -> Result<Connection> {
        Connection::tcp(stream, max_line_length)
    }
}

/// Serve plain line-protocol sessions on `addr`.
///
/// `factory` builds one dispatch target per accepted connection.
///
/// # Example
///
/// ```rust,ignore
/// let registry = Arc::new(MethodRegistry::new()
///     .method("Calc", "add(int,int)", |(a, b): (i64, i64)| async move { Ok(a + b) }));
/// let server = serve_tcp("127.0.0.1:0", ServerConfig::default(), move |_| registry.clone()).await?;
/// println!("listening on {}", server.local_addr());
/// ```
pub async fn serve_tcp<A, F, D>(addr: A, config: ServerConfig, factory: F) -> Result<RpcServer>
where
    A: ToSocketAddrs,
    F: Fn(&SessionHandle) -> D + Send + Sync + 'static,
    D: Dispatch,
{
    listener::serve(addr, PlainUpgrade, config, factory).await
}

/// Open a TCP stream within `connect_timeout`.
pub(crate) async fn dial<A>(addr: &A, config: &ClientConfig) -> Result<TcpStream>
where
    A: ToSocketAddrs + fmt::Display,
{
    let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| RpcError::ConnectTimeout {
            addr: addr.to_string(),
        })??;
    stream.set_nodelay(config.nodelay)?;
    debug!("Connected to {}", addr);
    Ok(stream)
}

/// Dial `addr` and return a plain transport.
pub async fn dial_tcp<A>(addr: A, config: &ClientConfig) -> Result<Connection>
where
    A: ToSocketAddrs + fmt::Display,
{
    let stream = dial(&addr, config).await?;
    Connection::tcp(stream, config.session.max_line_length)
}

/// Connect a plain client session to `addr`.
pub async fn client_tcp<A>(addr: A, config: ClientConfig) -> Result<RpcClient>
where
    A: ToSocketAddrs + fmt::Display,
{
    let connection = dial_tcp(addr, &config).await?;
    Ok(RpcClient::builder(connection).config(config.session).start())
}
