//! Call correlation table.
//!
//! Maps a locally generated call id to the oneshot sender of the caller waiting
//! for that call's outcome.
//!
//! ```text
//! call():     register() -> (id, PendingCall) ; write Call{id} ; PendingCall::wait()
//! read loop:  Result/Error{id} -> resolve(id, outcome) -> oneshot fires
//! teardown:   drain() -> every PendingCall sees Disconnected, later registers fail
//! gave up:    abandon(id) -> a late Result/Error{id} is discarded, not an error
//! ```
//!
//! # Thread Safety
//!
//! Ids come from an `AtomicU64`; the pending map sits behind a `std::sync::Mutex`
//! that is only held for map operations, never across an await point.

use crate::error::{RpcError, RpcException};
use crate::protocol::Payload;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// How a call completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    /// `None` for void methods.
    Returned(Option<Payload>),
    Failed(RpcException),
    Disconnected,
}

impl CallOutcome {
    pub fn into_result(self) -> Result<Option<Payload>, RpcError> {
        match self {
            CallOutcome::Returned(value) => Ok(value),
            CallOutcome::Failed(exception) => Err(RpcError::Remote(exception)),
            CallOutcome::Disconnected => Err(RpcError::Disconnected),
        }
    }
}

/// Handle a caller suspends on until its call is resolved.
#[derive(Debug)]
pub struct PendingCall {
    id: u64,
    rx: oneshot::Receiver<CallOutcome>,
}

impl PendingCall {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn wait(self) -> CallOutcome {
        // A dropped sender means the table went away with the session.
        self.rx.await.unwrap_or(CallOutcome::Disconnected)
    }
}

#[derive(Debug, Default)]
struct TableState {
    pending: HashMap<u64, oneshot::Sender<CallOutcome>>,
    /// Written calls whose caller stopped waiting.
    abandoned: HashSet<u64>,
    closed: bool,
}

/// Per-session table of outstanding calls.
#[derive(Debug)]
pub struct CallTable {
    next_id: AtomicU64,
    state: Mutex<TableState>,
}

impl Default for CallTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CallTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            state: Mutex::new(TableState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a fresh id and register a waiter for it.
    ///
    /// Fails with `Disconnected` once the table has been drained.
    pub fn register(&self) -> Result<PendingCall, RpcError> {
        let mut state = self.state();
        if state.closed {
            return Err(RpcError::Disconnected);
        }

        let id = loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            // Zero is reserved, and a wrapped counter must skip ids still pending.
            if id != 0 && !state.pending.contains_key(&id) && !state.abandoned.contains(&id) {
                break id;
            }
        };

        let (tx, rx) = oneshot::channel();
        state.pending.insert(id, tx);
        debug!(id, pending = state.pending.len(), "registered pending call");
        Ok(PendingCall { id, rx })
    }

    /// Deliver `outcome` to the caller waiting on `id` and forget the entry.
    ///
    /// Returns `false` if no call with that id is pending; the caller decides
    /// whether that is a protocol violation.
    pub fn resolve(&self, id: u64, outcome: CallOutcome) -> bool {
        let tx = {
            let mut state = self.state();
            match state.pending.remove(&id) {
                Some(tx) => tx,
                None if state.abandoned.remove(&id) => {
                    debug!(id, "discarding outcome of abandoned call");
                    return true;
                }
                None => {
                    warn!(id, "result for unknown call id");
                    return false;
                }
            }
        };
        if tx.send(outcome).is_err() {
            debug!(id, "caller stopped waiting before resolution");
        }
        true
    }

    /// Forget a call without resolving it, e.g. when its Call record never
    /// made it onto the wire.
    pub fn cancel(&self, id: u64) {
        self.state().pending.remove(&id);
    }

    /// Stop waiting for a call that may already be on the wire.
    ///
    /// Its eventual outcome is dropped by [`CallTable::resolve`]. No-op once
    /// the call has been resolved or cancelled.
    pub fn abandon(&self, id: u64) {
        let mut state = self.state();
        if state.pending.remove(&id).is_some() {
            state.abandoned.insert(id);
            debug!(id, "caller abandoned pending call");
        }
    }

    /// Resolve every pending call as `Disconnected` and refuse new ones.
    ///
    /// Returns how many callers were woken. Only the first drain wakes anyone.
    pub fn drain(&self) -> usize {
        self.drain_with(CallOutcome::Disconnected)
    }

    /// Like [`CallTable::drain`], delivering `outcome` to every waiter.
    pub fn drain_with(&self, outcome: CallOutcome) -> usize {
        let drained: Vec<_> = {
            let mut state = self.state();
            state.closed = true;
            state.abandoned.clear();
            state.pending.drain().collect()
        };

        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(outcome.clone());
        }
        if count > 0 {
            debug!(count, "drained pending calls");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.state().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Ids currently pending, sorted (for diagnostics).
    pub fn pending_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.state().pending.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ErrorType;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let table = CallTable::new();
        let a = table.register().unwrap();
        let b = table.register().unwrap();
        assert_eq!(a.id(), 1);
        assert_eq!(b.id(), 2);
        assert_eq!(table.pending_ids(), vec![1, 2]);
    }

    #[test]
    fn test_concurrent_registration_yields_distinct_ids() {
        let table = Arc::new(CallTable::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| table.register().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids = HashSet::new();
        for handle in handles {
            for pending in handle.join().unwrap() {
                assert!(ids.insert(pending.id()));
            }
        }
        assert_eq!(ids.len(), 800);
        assert_eq!(table.len(), 800);
    }

    #[tokio::test]
    async fn test_resolve_delivers_exactly_once() {
        let table = CallTable::new();
        let pending = table.register().unwrap();
        let id = pending.id();

        let value = Payload::new(&5).unwrap();
        assert!(table.resolve(id, CallOutcome::Returned(Some(value.clone()))));
        assert!(!table.resolve(id, CallOutcome::Returned(None)));

        assert_eq!(pending.wait().await, CallOutcome::Returned(Some(value)));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_with_failure() {
        let table = CallTable::new();
        let pending = table.register().unwrap();
        let exception = RpcException::new(ErrorType::NotImplemented, "nope");
        assert!(table.resolve(pending.id(), CallOutcome::Failed(exception.clone())));

        let err = pending.wait().await.into_result().unwrap_err();
        assert_eq!(err.as_remote(), Some(&exception));
    }

    #[test]
    fn test_unknown_id_is_reported() {
        let table = CallTable::new();
        assert!(!table.resolve(42, CallOutcome::Returned(None)));
    }

    #[tokio::test]
    async fn test_drain_wakes_all_and_closes() {
        let table = CallTable::new();
        let pending: Vec<_> = (0..3).map(|_| table.register().unwrap()).collect();

        assert_eq!(table.drain(), 3);
        assert_eq!(table.drain(), 0);
        assert!(table.is_closed());

        for call in pending {
            assert_eq!(call.wait().await, CallOutcome::Disconnected);
        }
        assert!(matches!(table.register(), Err(RpcError::Disconnected)));
    }

    #[tokio::test]
    async fn test_abandoned_call_discards_late_outcome() {
        let table = CallTable::new();
        let pending = table.register().unwrap();
        let id = pending.id();
        drop(pending);

        table.abandon(id);
        assert!(table.is_empty());
        assert!(table.resolve(id, CallOutcome::Returned(None)));
        // Only the first late outcome is expected.
        assert!(!table.resolve(id, CallOutcome::Returned(None)));
    }

    #[test]
    fn test_abandon_after_resolve_is_noop() {
        let table = CallTable::new();
        let pending = table.register().unwrap();
        assert!(table.resolve(pending.id(), CallOutcome::Returned(None)));
        table.abandon(pending.id());
        assert!(!table.resolve(pending.id(), CallOutcome::Returned(None)));
    }

    #[test]
    fn test_cancel_forgets_entry() {
        let table = CallTable::new();
        let pending = table.register().unwrap();
        table.cancel(pending.id());
        assert!(!table.resolve(pending.id(), CallOutcome::Returned(None)));
    }
}
