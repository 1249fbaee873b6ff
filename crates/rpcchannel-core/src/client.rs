//! Client session.
//!
//! An [`RpcClient`] owns one connection. Calls look synchronous to the caller:
//! `call()` writes a Call record and suspends on its own oneshot until the
//! background read loop resolves it through the [`CallTable`].
//!
//! # Thread Safety
//!
//! Records go out through an `Outbox` whose task owns the writer, so
//! concurrent calls never interleave inside a record and a caller that gives up
//! (e.g. under `tokio::time::timeout`) never leaves half a record behind. The
//! read loop runs in its own spawned task and never waits on a caller or an
//! event handler.

use crate::config::SessionConfig;
use crate::correlation::{CallOutcome, CallTable};
use crate::error::{ProtocolError, Result, RpcError};
use crate::protocol::{EventMessage, Message, Payload};
use crate::session::{Lifecycle, SessionState};
use crate::transport::{Connection, ConnectionInfo, MessageReader, Outbox};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Callback for server-pushed events. Runs on the read loop; keep it short or
/// hand the event off to another task.
pub type EventCallback = Arc<dyn Fn(EventMessage) + Send + Sync>;

type DisconnectCallback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct DisconnectSlot {
    callback: Option<DisconnectCallback>,
    fired: bool,
}

enum Flow {
    Continue,
    Stop,
}

struct ClientShared {
    outbox: Outbox,
    calls: CallTable,
    lifecycle: Lifecycle,
    info: ConnectionInfo,
    config: SessionConfig,
    on_event: Option<EventCallback>,
    on_disconnect: Mutex<DisconnectSlot>,
}

impl ClientShared {
    async fn write(&self, message: Message) -> Result<()> {
        self.outbox.send(message).await
    }

    /// Enter `Disconnected` exactly once: fail pending calls, close the
    /// transport, then notify.
    async fn teardown(&self) {
        if !self.lifecycle.finish() {
            return;
        }

        let drained = self.calls.drain();
        if let Err(e) = self.outbox.close().await {
            debug!("Error closing client transport: {}", e);
        }
        info!(drained, "Client session disconnected");

        let callback = {
            let mut slot = self.on_disconnect.lock().unwrap_or_else(PoisonError::into_inner);
            slot.fired = true;
            slot.callback.take()
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    async fn handle_message(&self, message: Message) -> Result<Flow> {
        match message {
            Message::Result(result) => {
                let id = result.id;
                if !self.calls.resolve(id, CallOutcome::Returned(result.value)) {
                    return Err(ProtocolError::UnknownCallId(id).into());
                }
            }
            Message::Error(error) => match error.id {
                Some(id) => {
                    if !self.calls.resolve(id, CallOutcome::Failed(error.into_exception())) {
                        return Err(ProtocolError::UnknownCallId(id).into());
                    }
                }
                None => {
                    warn!(
                        error_type = %error.error_type,
                        "Peer reported a session error: {}",
                        error.message
                    );
                }
            },
            Message::Event(event) => self.deliver_event(event),
            Message::Disconnect => {
                if self.lifecycle.begin_disconnect() {
                    debug!("Peer requested disconnect, acknowledging");
                    if let Err(e) = self.write(Message::Disconnect).await {
                        debug!("Failed to acknowledge disconnect: {}", e);
                    }
                } else {
                    debug!("Disconnect acknowledged by peer");
                }
                return Ok(Flow::Stop);
            }
            Message::Call(_) => {
                return Err(ProtocolError::UnexpectedMessage {
                    side: "client",
                    kind: "call",
                }
                .into());
            }
        }
        Ok(Flow::Continue)
    }

    fn deliver_event(&self, event: EventMessage) {
        let Some(callback) = &self.on_event else {
            debug!(target = %event.target, "Dropping event, no handler registered");
            return;
        };
        let target = event.target.clone();
        if std::panic::catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
            error!(%target, "Event handler panicked");
        }
    }
}

async fn read_loop(shared: Arc<ClientShared>, mut reader: Box<dyn MessageReader>) {
    let mut state_rx = shared.lifecycle.subscribe();

    loop {
        let next = tokio::select! {
            next = reader.read_message() => next,
            _ = state_rx.wait_for(|state| *state == SessionState::Disconnected) => break,
        };

        match next {
            Ok(Some(message)) => match shared.handle_message(message).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break,
                Err(e) => {
                    warn!("Closing client session: {}", e);
                    break;
                }
            },
            Ok(None) => {
                debug!("Peer closed the stream");
                break;
            }
            Err(e) => {
                warn!("Client read failed: {}", e);
                break;
            }
        }
    }

    shared.teardown().await;
}

/// Marks a call abandoned when its caller stops waiting before the outcome
/// arrives, so a late reply is discarded instead of leaking the table entry.
struct AbandonOnDrop<'a> {
    calls: &'a CallTable,
    id: u64,
}

impl Drop for AbandonOnDrop<'_> {
    fn drop(&mut self) {
        self.calls.abandon(self.id);
    }
}

/// Builder for a client session.
///
/// # Example
///
/// ```rust,ignore
/// let client = RpcClient::builder(connection)
///     .on_event(|event| println!("{}: {}", event.target, event.parameters))
///     .on_disconnect(|| println!("gone"))
///     .start();
/// ```
pub struct ClientSessionBuilder {
    connection: Connection,
    config: SessionConfig,
    on_event: Option<EventCallback>,
    on_disconnect: Option<DisconnectCallback>,
}

impl ClientSessionBuilder {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            config: SessionConfig::default(),
            on_event: None,
            on_disconnect: None,
        }
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Register the handler for server-pushed events.
    pub fn on_event<F>(mut self, handler: F) -> Self
    where
        F: Fn(EventMessage) + Send + Sync + 'static,
    {
        self.on_event = Some(Arc::new(handler));
        self
    }

    pub fn on_disconnect<F>(mut self, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_disconnect = Some(Box::new(callback));
        self
    }

    /// Spawn the read loop and return the connected client.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> RpcClient {
        let (reader, writer, info) = self.connection.into_parts();
        debug!(peer = ?info.peer_addr, encrypted = info.is_encrypted(), "Starting client session");

        let shared = Arc::new(ClientShared {
            outbox: Outbox::spawn(writer),
            calls: CallTable::new(),
            lifecycle: Lifecycle::new(),
            info,
            config: self.config,
            on_event: self.on_event,
            on_disconnect: Mutex::new(DisconnectSlot {
                callback: self.on_disconnect,
                fired: false,
            }),
        });
        let read_task = tokio::spawn(read_loop(shared.clone(), reader));

        RpcClient { shared, read_task }
    }
}

/// Client end of an RPC session.
pub struct RpcClient {
    shared: Arc<ClientShared>,
    read_task: JoinHandle<()>,
}

/// Wrap a connection in a client session with default settings.
pub fn create_client_session(connection: Connection) -> RpcClient {
    ClientSessionBuilder::new(connection).start()
}

impl RpcClient {
    pub fn builder(connection: Connection) -> ClientSessionBuilder {
        ClientSessionBuilder::new(connection)
    }

    /// Invoke `mangle` on `target` and wait for the correlated outcome.
    ///
    /// Returns `Ok(None)` for void methods. Fails with `Remote` when the peer
    /// answered with an error record and with `Disconnected` when the session
    /// ended first. There is no implicit deadline.
    pub async fn call(&self, target: &str, mangle: &str, parameters: Payload) -> Result<Option<Payload>> {
        if self.shared.lifecycle.get() != SessionState::Connected {
            return Err(RpcError::Disconnected);
        }

        let pending = self.shared.calls.register()?;
        let id = pending.id();
        let _abandon = AbandonOnDrop {
            calls: &self.shared.calls,
            id,
        };
        debug!(id, target, mangle, "Issuing call");

        if let Err(e) = self
            .shared
            .write(Message::call(id, target, mangle, parameters))
            .await
        {
            warn!(id, "Failed to send call: {}", e);
            self.shared.calls.cancel(id);
            self.shared.teardown().await;
            return Err(RpcError::Disconnected);
        }

        pending.wait().await.into_result()
    }

    /// Serialize `parameters`, call, and decode the returned value as `R`.
    pub async fn call_typed<P, R>(&self, target: &str, mangle: &str, parameters: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let parameters = Payload::new(parameters)?;
        match self.call(target, mangle, parameters).await? {
            Some(value) => Ok(value.decode()?),
            None => Err(RpcError::Payload {
                message: format!("{}.{} returned no value", target, mangle),
                source: None,
            }),
        }
    }

    /// Call a method whose return value, if any, is ignored.
    pub async fn call_void<P>(&self, target: &str, mangle: &str, parameters: &P) -> Result<()>
    where
        P: Serialize + ?Sized,
    {
        let parameters = Payload::new(parameters)?;
        self.call(target, mangle, parameters).await.map(|_| ())
    }

    /// Cooperatively end the session.
    ///
    /// Sends Disconnect and waits for the peer's acknowledgement or end of
    /// stream, at most `disconnect_timeout`, then closes the transport. Calls
    /// still pending at that point fail with `Disconnected`.
    pub async fn disconnect(&self) {
        let shared = &self.shared;
        if shared.lifecycle.begin_disconnect() {
            debug!("Sending disconnect");
            if let Err(e) = shared.write(Message::Disconnect).await {
                debug!("Failed to send disconnect: {}", e);
                shared.teardown().await;
                return;
            }
        }

        let timeout = shared.config.disconnect_timeout;
        if tokio::time::timeout(timeout, shared.lifecycle.wait_disconnected())
            .await
            .is_err()
        {
            warn!("Peer did not acknowledge disconnect within {:?}", timeout);
            shared.teardown().await;
        }
    }

    /// Register the callback run once the session is disconnected.
    ///
    /// Replaces any earlier callback. Runs immediately if the session is
    /// already gone.
    pub fn on_disconnect<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut slot = self
            .shared
            .on_disconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !slot.fired {
            slot.callback = Some(Box::new(callback));
            return;
        }
        drop(slot);
        callback();
    }

    /// Wait until the session reaches `Disconnected`, whoever ended it.
    pub async fn closed(&self) {
        self.shared.lifecycle.wait_disconnected().await;
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

    /// Number of calls still waiting for a result.
    pub fn pending_calls(&self) -> usize {
        self.shared.calls.len()
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("state", &self.state())
            .field("info", &self.shared.info)
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}
