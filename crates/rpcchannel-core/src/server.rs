//! Server session and dispatch boundary.
//!
//! A [`ServerSession`] reads Call records from one connection, hands each to a
//! [`Dispatch`] target in its own task, and writes back exactly one Result or
//! Error record per call. Replies go out in completion order, not call order.
//!
//! ```text
//! reader task --mpsc--> run loop --spawn--> handler task --reply--> writer
//!                          |                                          ^
//!                          +-- SessionHandle (events, disconnect) ----+
//! ```
//!
//! # Thread Safety
//!
//! The dispatch target is shared across handler tasks through an `Arc`, so it
//! must be `Send + Sync`. Writes from handlers, events and the run loop are
//! queued to a single writer task, so aborting a handler mid-reply still puts
//! the whole record on the wire.

use crate::config::{DrainPolicy, SessionConfig};
use crate::error::{ProtocolError, Result, RpcError};
use crate::protocol::{CallMessage, ErrorMessage, ErrorType, Message, Payload};
use crate::session::{Lifecycle, SessionState};
use crate::transport::{Connection, ConnectionInfo, MessageReader, Outbox};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::{AssertUnwindSafe, Location};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Failure reported by a dispatch target. Each variant maps onto one
/// [`ErrorType`] on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("{target}.{mangle} is not implemented")]
    NotImplemented { target: String, mangle: String },

    #[error("Parameter mismatch: {0}")]
    ParameterMismatch(String),

    #[error("{message}")]
    Internal {
        message: String,
        file: Option<String>,
        line: Option<u32>,
    },
}

pub type DispatchResult = std::result::Result<Option<Payload>, DispatchError>;

impl DispatchError {
    pub fn not_implemented(call: &CallMessage) -> Self {
        DispatchError::NotImplemented {
            target: call.target.clone(),
            mangle: call.mangle.clone(),
        }
    }

    /// Internal failure tagged with the caller's source location.
    #[track_caller]
    pub fn internal(message: impl Into<String>) -> Self {
        let location = Location::caller();
        DispatchError::Internal {
            message: message.into(),
            file: Some(location.file().to_string()),
            line: Some(location.line()),
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            DispatchError::NotImplemented { .. } => ErrorType::NotImplemented,
            DispatchError::ParameterMismatch(_) => ErrorType::ParameterMismatch,
            DispatchError::Internal { .. } => ErrorType::InternalError,
        }
    }

    /// The Error record answering call `id`.
    pub fn into_message(self, id: u64) -> Message {
        let error_type = self.error_type();
        let message = self.to_string();
        let (file, line) = match self {
            DispatchError::Internal { file, line, .. } => (file, line),
            _ => (None, None),
        };
        Message::Error(ErrorMessage {
            id: Some(id),
            error_type,
            message,
            file,
            line,
        })
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::ParameterMismatch(err.to_string())
    }
}

/// Application boundary of a server session.
///
/// `Ok(None)` answers a void method, `Ok(Some(value))` a valued one.
#[async_trait]
pub trait Dispatch: Send + Sync + 'static {
    async fn dispatch(&self, call: &CallMessage) -> DispatchResult;
}

#[async_trait]
impl<D: Dispatch + ?Sized> Dispatch for Arc<D> {
    async fn dispatch(&self, call: &CallMessage) -> DispatchResult {
        (**self).dispatch(call).await
    }
}

type MethodHandler = Box<dyn Fn(&Payload) -> BoxFuture<'static, DispatchResult> + Send + Sync>;

/// Dispatch target built from typed async closures keyed by
/// `(target, mangle)`.
///
/// # Example
///
/// ```rust,ignore
/// let registry = MethodRegistry::new()
///     .method("Calc", "add(int,int)", |(a, b): (i64, i64)| async move { Ok(a + b) })
///     .void_method("Log", "write(string)", |(line,): (String,)| async move {
///         println!("{}", line);
///         Ok(())
///     });
/// ```
#[derive(Default)]
pub struct MethodRegistry {
    targets: HashMap<String, HashMap<String, MethodHandler>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method returning a value.
    ///
    /// Parameters that fail to decode as `P` answer with `parameterMismatch`
    /// without running `handler`.
    pub fn method<P, R, F, Fut>(self, target: &str, mangle: &str, handler: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, DispatchError>> + Send + 'static,
    {
        self.insert(target, mangle, move |params: P| {
            let fut = handler(params);
            async move {
                let value = fut.await?;
                Payload::new(&value)
                    .map(Some)
                    .map_err(|e| DispatchError::internal(format!("Failed to encode result: {}", e)))
            }
        })
    }

    /// Register a void method.
    pub fn void_method<P, F, Fut>(self, target: &str, mangle: &str, handler: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), DispatchError>> + Send + 'static,
    {
        self.insert(target, mangle, move |params: P| {
            let fut = handler(params);
            async move { fut.await.map(|()| None) }
        })
    }

    fn insert<P, F, Fut>(mut self, target: &str, mangle: &str, handler: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DispatchResult> + Send + 'static,
    {
        let erased: MethodHandler = Box::new(move |payload: &Payload| match payload.decode::<P>() {
            Ok(params) => handler(params).boxed(),
            Err(e) => {
                let err = DispatchError::from(e);
                async move { Err(err) }.boxed()
            }
        });
        self.targets
            .entry(target.to_string())
            .or_default()
            .insert(mangle.to_string(), erased);
        self
    }

    pub fn handles(&self, target: &str, mangle: &str) -> bool {
        self.targets
            .get(target)
            .is_some_and(|methods| methods.contains_key(mangle))
    }
}

#[async_trait]
impl Dispatch for MethodRegistry {
    async fn dispatch(&self, call: &CallMessage) -> DispatchResult {
        let handler = self
            .targets
            .get(&call.target)
            .and_then(|methods| methods.get(&call.mangle));
        match handler {
            Some(handler) => handler(&call.parameters).await,
            None => Err(DispatchError::not_implemented(call)),
        }
    }
}

struct ServerShared {
    outbox: Outbox,
    lifecycle: Lifecycle,
    info: ConnectionInfo,
    config: SessionConfig,
}

impl ServerShared {
    async fn write(&self, message: Message) -> Result<()> {
        self.outbox.send(message).await
    }
}

/// Cloneable handle to a running server session.
///
/// Dispatch targets keep one to push events to their client or to end their
/// own session.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<ServerShared>,
}

impl SessionHandle {
    /// Push an event record to the client.
    ///
    /// Fails with `Disconnected` once a disconnect has started.
    pub async fn emit_event(&self, target: &str, parameters: Payload) -> Result<()> {
        if self.shared.lifecycle.get() != SessionState::Connected {
            return Err(RpcError::Disconnected);
        }
        debug!(target, "Emitting event");
        self.shared.write(Message::event(target, parameters)).await
    }

    /// Serialize `parameters` and push them as an event.
    pub async fn emit<P: Serialize + ?Sized>(&self, target: &str, parameters: &P) -> Result<()> {
        self.emit_event(target, Payload::new(parameters)?).await
    }

    /// Start a server-initiated disconnect.
    ///
    /// The run loop stops dispatching new calls and returns once the client
    /// acknowledges or the stream ends. Repeated calls are no-ops.
    pub async fn disconnect(&self) -> Result<()> {
        if !self.shared.lifecycle.begin_disconnect() {
            return Ok(());
        }
        debug!(peer = ?self.shared.info.peer_addr, "Server initiated disconnect");
        self.shared.write(Message::Disconnect).await
    }

    pub fn connected(&self) -> bool {
        self.shared.lifecycle.get() == SessionState::Connected
    }

    pub fn state(&self) -> SessionState {
        self.shared.lifecycle.get()
    }

    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.shared.info
    }

    /// Wait until the session has fully closed.
    pub async fn closed(&self) {
        self.shared.lifecycle.wait_disconnected().await;
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("state", &self.state())
            .field("info", &self.shared.info)
            .finish()
    }
}

/// Why the run loop stopped reading.
enum Exit {
    /// Client asked to disconnect; we owe it an acknowledgement.
    PeerDisconnect,
    /// Client acknowledged our disconnect.
    Acknowledged,
    PeerClosed,
    AckTimeout,
    Transport(RpcError),
    Violation(RpcError),
}

/// Server end of one connection.
pub struct ServerSession {
    reader: Box<dyn MessageReader>,
    shared: Arc<ServerShared>,
}

/// Wrap a connection in a server session with default settings.
pub fn create_server_session(connection: Connection) -> ServerSession {
    ServerSession::new(connection, SessionConfig::default())
}

impl ServerSession {
    /// Bind `connection` to a new session. Must be called from within a tokio
    /// runtime.
    pub fn new(connection: Connection, config: SessionConfig) -> Self {
        let (reader, writer, info) = connection.into_parts();
        Self {
            reader,
            shared: Arc::new(ServerShared {
                outbox: Outbox::spawn(writer),
                lifecycle: Lifecycle::new(),
                info,
                config,
            }),
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.shared.info
    }

    /// Serve calls until the session ends.
    ///
    /// Returns `Ok(())` for every orderly ending (disconnect handshake, peer
    /// closing the stream) and the violation for a protocol error, after a
    /// best-effort id-less error record has been sent.
    pub async fn run<D: Dispatch>(self, dispatch: D) -> Result<()> {
        let ServerSession { reader, shared } = self;
        let dispatch = Arc::new(dispatch);
        let peer = shared.info.peer_addr;
        debug!(?peer, "Server session started");

        // Reads happen in their own task: a read cancelled mid-record would
        // desynchronize encrypted transports.
        let (msg_tx, mut msg_rx) = mpsc::channel(1);
        let reader_task = tokio::spawn(forward_messages(reader, msg_tx));

        let mut handlers = JoinSet::new();
        let in_flight = Arc::new(Mutex::new(HashSet::new()));
        let limiter = shared
            .config
            .max_in_flight
            .map(|max| Arc::new(Semaphore::new(max.max(1))));
        let mut state_rx = shared.lifecycle.subscribe();
        let mut ack_deadline: Option<Instant> = None;

        let exit = loop {
            if ack_deadline.is_none() && shared.lifecycle.get() != SessionState::Connected {
                ack_deadline = Some(Instant::now() + shared.config.disconnect_timeout);
            }

            tokio::select! {
                next = msg_rx.recv() => match next {
                    Some(Ok(Some(Message::Call(call)))) => {
                        if shared.lifecycle.get() != SessionState::Connected {
                            debug!(id = call.id, "Ignoring call received while disconnecting");
                            continue;
                        }
                        let fresh = in_flight
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .insert(call.id);
                        if !fresh {
                            break Exit::Violation(ProtocolError::DuplicateCallId(call.id).into());
                        }

                        let permit = match &limiter {
                            // Reads pause here while the bound is reached.
                            Some(limiter) => limiter.clone().acquire_owned().await.ok(),
                            None => None,
                        };
                        handlers.spawn(handle_call(
                            dispatch.clone(),
                            shared.clone(),
                            in_flight.clone(),
                            call,
                            permit,
                        ));
                    }
                    Some(Ok(Some(Message::Disconnect))) => {
                        if shared.lifecycle.begin_disconnect() {
                            break Exit::PeerDisconnect;
                        }
                        break Exit::Acknowledged;
                    }
                    Some(Ok(Some(other))) => {
                        break Exit::Violation(
                            ProtocolError::UnexpectedMessage {
                                side: "server",
                                kind: other.kind().as_str(),
                            }
                            .into(),
                        );
                    }
                    Some(Ok(None)) | None => break Exit::PeerClosed,
                    Some(Err(e @ RpcError::Protocol(_))) => break Exit::Violation(e),
                    Some(Err(e)) => break Exit::Transport(e),
                },
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = joined {
                        debug!("Handler task ended abnormally: {}", e);
                    }
                }
                _ = state_rx.changed() => {}
                _ = tokio::time::sleep_until(ack_deadline.unwrap_or_else(Instant::now)), if ack_deadline.is_some() => {
                    break Exit::AckTimeout;
                }
            }
        };

        let result = match exit {
            Exit::PeerDisconnect => {
                match shared.config.on_disconnect {
                    DrainPolicy::Wait => {
                        let limit = shared.config.disconnect_timeout;
                        drain_handlers(&mut handlers, &mut msg_rx, limit).await;
                    }
                    DrainPolicy::Abandon => abort_handlers(&mut handlers).await,
                }
                if let Err(e) = shared.write(Message::Disconnect).await {
                    debug!("Failed to acknowledge disconnect: {}", e);
                }
                Ok(())
            }
            Exit::Acknowledged | Exit::PeerClosed => {
                abort_handlers(&mut handlers).await;
                Ok(())
            }
            Exit::AckTimeout => {
                warn!(?peer, "Client did not acknowledge disconnect in time");
                abort_handlers(&mut handlers).await;
                Ok(())
            }
            Exit::Transport(e) => {
                debug!(?peer, "Transport failed: {}", e);
                abort_handlers(&mut handlers).await;
                Ok(())
            }
            Exit::Violation(e) => {
                warn!(?peer, "Closing session on protocol violation: {}", e);
                abort_handlers(&mut handlers).await;
                let report = Message::error(None, ErrorType::InternalError, e.to_string());
                if let Err(write_err) = shared.write(report).await {
                    debug!("Failed to report violation: {}", write_err);
                }
                Err(e)
            }
        };

        reader_task.abort();
        shared.lifecycle.finish();
        if let Err(e) = shared.outbox.close().await {
            debug!("Error closing server transport: {}", e);
        }
        info!(?peer, "Server session closed");
        result
    }
}

async fn forward_messages(
    mut reader: Box<dyn MessageReader>,
    tx: mpsc::Sender<Result<Option<Message>>>,
) {
    loop {
        let next = reader.read_message().await;
        let last = !matches!(next, Ok(Some(_)));
        if tx.send(next).await.is_err() || last {
            break;
        }
    }
}

/// Let running handlers finish after the client asked to disconnect.
///
/// Aborts whatever is left once the client closes the stream or `limit`
/// elapses, so a stuck handler cannot keep the session alive.
async fn drain_handlers(
    handlers: &mut JoinSet<()>,
    messages: &mut mpsc::Receiver<Result<Option<Message>>>,
    limit: Duration,
) {
    debug!(running = handlers.len(), "Waiting for in-flight handlers");
    let deadline = tokio::time::sleep(limit);
    tokio::pin!(deadline);

    while !handlers.is_empty() {
        tokio::select! {
            _ = handlers.join_next() => {}
            next = messages.recv() => match next {
                Some(Ok(Some(message))) => {
                    debug!(kind = message.kind().as_str(), "Ignoring record received while draining");
                }
                _ => {
                    debug!(running = handlers.len(), "Client closed the stream while handlers were running");
                    break;
                }
            },
            _ = &mut deadline => {
                warn!(running = handlers.len(), "In-flight handlers did not finish within {:?}", limit);
                break;
            }
        }
    }
    abort_handlers(handlers).await;
}

async fn abort_handlers(handlers: &mut JoinSet<()>) {
    handlers.abort_all();
    while handlers.join_next().await.is_some() {}
}

async fn handle_call<D: Dispatch>(
    dispatch: Arc<D>,
    shared: Arc<ServerShared>,
    in_flight: Arc<Mutex<HashSet<u64>>>,
    call: CallMessage,
    _permit: Option<OwnedSemaphorePermit>,
) {
    let id = call.id;
    debug!(id, target = %call.target, mangle = %call.mangle, "Dispatching call");

    let reply = match AssertUnwindSafe(dispatch.dispatch(&call)).catch_unwind().await {
        Ok(Ok(value)) => Message::result(id, value),
        Ok(Err(e)) => {
            debug!(id, "Call failed: {}", e);
            e.into_message(id)
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(id, target = %call.target, "Handler panicked: {}", message);
            Message::error(Some(id), ErrorType::InternalError, message)
        }
    };

    // The id is free for reuse once the client can see the reply.
    in_flight
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&id);
    if let Err(e) = shared.write(reply).await {
        debug!(id, "Failed to write reply: {}", e);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("Handler panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("Handler panicked: {}", message)
    } else {
        "Handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Parameter type for methods taking no arguments (`[]` on the wire).
    type NoArgs = [u8; 0];

    fn explode() -> std::result::Result<(), DispatchError> {
        panic!("kaboom")
    }

    fn calc() -> MethodRegistry {
        MethodRegistry::new()
            .method("Calc", "add(int,int)", |(a, b): (i64, i64)| async move { Ok(a + b) })
            .method("Calc", "slow(int)", |(ms,): (u64,)| async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(ms)
            })
            .method("Calc", "hang()", |_: NoArgs| async move {
                std::future::pending::<()>().await;
                Ok(0)
            })
            .void_method("Calc", "boom()", |_: NoArgs| async move { explode() })
    }

    fn call(id: u64, target: &str, mangle: &str, params: Payload) -> CallMessage {
        CallMessage {
            id,
            target: target.into(),
            mangle: mangle.into(),
            parameters: params,
        }
    }

    /// A server session running `dispatch`, plus the raw client end.
    fn session_with_peer<D: Dispatch>(
        dispatch: D,
        config: SessionConfig,
    ) -> (tokio::task::JoinHandle<Result<()>>, SessionHandle, Connection) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let session = ServerSession::new(Connection::from_stream(a), config);
        let handle = session.handle();
        let task = tokio::spawn(session.run(dispatch));
        (task, handle, Connection::from_stream(b))
    }

    #[tokio::test]
    async fn test_registry_dispatches_typed_method() {
        let value = calc()
            .dispatch(&call(1, "Calc", "add(int,int)", Payload::new(&(2, 3)).unwrap()))
            .await
            .unwrap();
        assert_eq!(value.unwrap().decode::<i64>().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_registry_missing_method_is_not_implemented() {
        let err = calc()
            .dispatch(&call(1, "Calc", "sub(int,int)", Payload::empty()))
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), ErrorType::NotImplemented);
        assert!(err.to_string().contains("Calc.sub(int,int)"));
    }

    #[tokio::test]
    async fn test_registry_bad_parameters_are_mismatch() {
        let err = calc()
            .dispatch(&call(1, "Calc", "add(int,int)", Payload::new(&["x"]).unwrap()))
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), ErrorType::ParameterMismatch);
    }

    #[test]
    fn test_internal_error_records_location() {
        let err = DispatchError::internal("broken");
        match err.clone().into_message(9) {
            Message::Error(record) => {
                assert_eq!(record.id, Some(9));
                assert_eq!(record.error_type, ErrorType::InternalError);
                assert_eq!(record.file.as_deref(), Some(file!()));
                assert!(record.line.is_some());
            }
            other => panic!("Expected error record, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_answers_calls() {
        let (task, _handle, mut peer) = session_with_peer(calc(), SessionConfig::default());
        peer.write_message(&Message::call(7, "Calc", "add(int,int)", Payload::new(&(2, 3)).unwrap()))
            .await
            .unwrap();
        assert_eq!(
            peer.read_message().await.unwrap(),
            Some(Message::result(7, Some(Payload::new(&5).unwrap())))
        );

        peer.close().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_panicking_handler_reports_internal_error() {
        let (_task, handle, mut peer) = session_with_peer(calc(), SessionConfig::default());
        peer.write_message(&Message::call(1, "Calc", "boom()", Payload::empty()))
            .await
            .unwrap();
        match peer.read_message().await.unwrap() {
            Some(Message::Error(record)) => {
                assert_eq!(record.id, Some(1));
                assert_eq!(record.error_type, ErrorType::InternalError);
                assert!(record.message.contains("kaboom"));
            }
            other => panic!("Expected error record, got: {:?}", other),
        }
        assert!(handle.connected());
    }

    #[tokio::test]
    async fn test_duplicate_call_id_closes_session() {
        let (task, _handle, mut peer) = session_with_peer(calc(), SessionConfig::default());
        let hang = Message::call(3, "Calc", "hang()", Payload::empty());
        peer.write_message(&hang).await.unwrap();
        peer.write_message(&hang).await.unwrap();

        match peer.read_message().await.unwrap() {
            Some(Message::Error(record)) => {
                assert_eq!(record.id, None);
                assert_eq!(record.error_type, ErrorType::InternalError);
            }
            other => panic!("Expected id-less error, got: {:?}", other),
        }
        assert_eq!(peer.read_message().await.unwrap(), None);
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            RpcError::Protocol(ProtocolError::DuplicateCallId(3))
        ));
    }

    #[tokio::test]
    async fn test_client_disconnect_waits_for_handlers() {
        let (task, handle, mut peer) = session_with_peer(calc(), SessionConfig::default());
        peer.write_message(&Message::call(1, "Calc", "slow(int)", Payload::new(&(30,)).unwrap()))
            .await
            .unwrap();
        peer.write_message(&Message::Disconnect).await.unwrap();

        assert_eq!(
            peer.read_message().await.unwrap(),
            Some(Message::result(1, Some(Payload::new(&30).unwrap())))
        );
        assert_eq!(peer.read_message().await.unwrap(), Some(Message::Disconnect));
        assert_eq!(peer.read_message().await.unwrap(), None);
        task.await.unwrap().unwrap();
        assert_eq!(handle.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_client_disconnect_abandons_handlers() {
        let config = SessionConfig::default().on_disconnect(DrainPolicy::Abandon);
        let (task, _handle, mut peer) = session_with_peer(calc(), config);
        peer.write_message(&Message::call(1, "Calc", "hang()", Payload::empty()))
            .await
            .unwrap();
        peer.write_message(&Message::Disconnect).await.unwrap();

        assert_eq!(peer.read_message().await.unwrap(), Some(Message::Disconnect));
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_client_closing_stream_ends_handler_drain() {
        let config = SessionConfig::default().disconnect_timeout(Duration::from_secs(60));
        let (task, handle, mut peer) = session_with_peer(calc(), config);
        peer.write_message(&Message::call(1, "Calc", "hang()", Payload::empty()))
            .await
            .unwrap();
        peer.write_message(&Message::Disconnect).await.unwrap();
        drop(peer);

        let finished = tokio::time::timeout(Duration::from_secs(3), task).await;
        assert!(matches!(finished, Ok(Ok(Ok(())))));
        assert_eq!(handle.state(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_handler_drain_is_bounded() {
        let config = SessionConfig::default().disconnect_timeout(Duration::from_secs(2));
        let (task, _handle, mut peer) = session_with_peer(calc(), config);
        peer.write_message(&Message::call(1, "Calc", "hang()", Payload::empty()))
            .await
            .unwrap();
        peer.write_message(&Message::Disconnect).await.unwrap();

        assert_eq!(peer.read_message().await.unwrap(), Some(Message::Disconnect));
        assert_eq!(peer.read_message().await.unwrap(), None);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_handler_reply_is_written_whole() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let big = "y".repeat(64 * 1024);
        let registry = {
            let big = big.clone();
            MethodRegistry::new().method("Blob", "get()", move |_: NoArgs| {
                let big = big.clone();
                async move { Ok(big) }
            })
        };
        let (a, mut b) = tokio::io::duplex(1024);
        let config = SessionConfig::default().on_disconnect(DrainPolicy::Abandon);
        let session = ServerSession::new(Connection::from_stream(a), config);
        let task = tokio::spawn(session.run(registry));

        let call = Message::call(1, "Blob", "get()", Payload::empty());
        b.write_all(&crate::protocol::encode(&call).unwrap()).await.unwrap();

        // The reply is far larger than the pipe, so its write is in progress
        // once the first bytes show up.
        let mut received = vec![0u8; 16];
        let n = b.read(&mut received).await.unwrap();
        received.truncate(n);
        b.write_all(&crate::protocol::encode(&Message::Disconnect).unwrap())
            .await
            .unwrap();
        b.read_to_end(&mut received).await.unwrap();
        task.await.unwrap().unwrap();

        let records: Vec<Message> = received
            .split_inclusive(|&byte| byte == b'\n')
            .map(|record| crate::protocol::decode(record).unwrap())
            .collect();
        assert_eq!(
            records,
            vec![
                Message::result(1, Some(Payload::new(&big).unwrap())),
                Message::Disconnect
            ]
        );
    }

    #[tokio::test]
    async fn test_server_initiated_disconnect() {
        let (task, handle, mut peer) = session_with_peer(calc(), SessionConfig::default());
        handle.disconnect().await.unwrap();
        assert!(!handle.connected());
        assert!(matches!(
            handle.emit("Ticker", &[1]).await,
            Err(RpcError::Disconnected)
        ));

        assert_eq!(peer.read_message().await.unwrap(), Some(Message::Disconnect));
        peer.write_message(&Message::Disconnect).await.unwrap();
        task.await.unwrap().unwrap();
        handle.closed().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_disconnect_times_out() {
        let config = SessionConfig::default().disconnect_timeout(Duration::from_secs(2));
        let (task, handle, _peer) = session_with_peer(calc(), config);
        handle.disconnect().await.unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(handle.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_result_record_from_client_is_violation() {
        let (task, _handle, mut peer) = session_with_peer(calc(), SessionConfig::default());
        peer.write_message(&Message::result(1, None)).await.unwrap();
        assert!(matches!(
            peer.read_message().await.unwrap(),
            Some(Message::Error(ErrorMessage { id: None, .. }))
        ));
        assert!(matches!(
            task.await.unwrap(),
            Err(RpcError::Protocol(ProtocolError::UnexpectedMessage { side: "server", .. }))
        ));
    }

    #[tokio::test]
    async fn test_max_in_flight_bounds_handlers() {
        let running = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let registry = {
            let running = running.clone();
            let peak = peak.clone();
            MethodRegistry::new().method("Calc", "work()", move |_: NoArgs| {
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    use std::sync::atomic::Ordering;
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };

        let config = SessionConfig::default().max_in_flight(Some(2));
        let (_task, _handle, mut peer) = session_with_peer(registry, config);
        for id in 1..=6 {
            peer.write_message(&Message::call(id, "Calc", "work()", Payload::empty()))
                .await
                .unwrap();
        }
        for _ in 1..=6 {
            assert!(matches!(peer.read_message().await.unwrap(), Some(Message::Result(_))));
        }
        assert!(peak.load(std::sync::atomic::Ordering::SeqCst) <= 2);
    }
}
