//! rpcchannel - Bidirectional RPC over a single duplex byte stream.
//!
//! A client issues method calls addressed by `(target, mangle)`; the server
//! dispatches them concurrently and answers each with exactly one result or
//! error record, in completion order. The server may push events and either
//! side may start a cooperative disconnect. Records are newline-delimited JSON
//! carried over plain TCP or a Noise XX encrypted channel.
//!
//! # Example
//!
//! ```rust,ignore
//! use rpcchannel::{client_tcp, serve_tcp, ClientConfig, MethodRegistry, ServerConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> rpcchannel::Result<()> {
//!     let registry = Arc::new(MethodRegistry::new()
//!         .method("Calc", "add(int,int)", |(a, b): (i64, i64)| async move { Ok(a + b) }));
//!     let server = serve_tcp("127.0.0.1:0", ServerConfig::default(), move |_| registry.clone()).await?;
//!
//!     let client = client_tcp(server.local_addr(), ClientConfig::default()).await?;
//!     let sum: i64 = client.call_typed("Calc", "add(int,int)", &(2, 3)).await?;
//!     assert_eq!(sum, 5);
//!
//!     client.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod correlation;
pub mod error;
pub mod listener;
pub mod noise;
pub mod protocol;
pub mod server;
pub mod session;
pub mod tcp;
pub mod transport;

// Re-export commonly used types
pub use client::{create_client_session, ClientSessionBuilder, EventCallback, RpcClient};
pub use config::{ClientConfig, DrainPolicy, ProtocolConfig, ServerConfig, SessionConfig};
pub use correlation::{CallOutcome, CallTable, PendingCall};
pub use error::{ProtocolError, Result, RpcError, RpcException};
pub use listener::RpcServer;
pub use noise::{
    client_noise, dial_noise, serve_noise, NoiseInfo, NoiseKeypair, NoiseSettings,
    PeerVerification,
};
pub use protocol::{
    CallMessage, ErrorMessage, ErrorType, EventMessage, Message, MessageKind, Payload,
    ResultMessage,
};
pub use server::{
    create_server_session, Dispatch, DispatchError, DispatchResult, MethodRegistry,
    ServerSession, SessionHandle,
};
pub use session::SessionState;
pub use tcp::{client_tcp, dial_tcp, serve_tcp};
pub use transport::{Connection, ConnectionInfo, LineReader, LineWriter, MessageReader, MessageWriter};
