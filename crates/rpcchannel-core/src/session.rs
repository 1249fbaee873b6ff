//! Session lifecycle shared by client and server sessions.

use std::fmt;
use tokio::sync::watch;

/// `Connected -> Disconnecting -> Disconnected`. `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connected,
    Disconnecting,
    Disconnected,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connected => "connected",
            SessionState::Disconnecting => "disconnecting",
            SessionState::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable state cell. Transitions only move forward.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    tx: watch::Sender<SessionState>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(SessionState::Connected);
        Self { tx }
    }

    pub(crate) fn get(&self) -> SessionState {
        *self.tx.borrow()
    }

    /// `Connected -> Disconnecting`. True only for the caller that made the move.
    pub(crate) fn begin_disconnect(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == SessionState::Connected {
                *state = SessionState::Disconnecting;
                true
            } else {
                false
            }
        })
    }

    /// Move to `Disconnected`. True only for the first caller.
    pub(crate) fn finish(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == SessionState::Disconnected {
                false
            } else {
                *state = SessionState::Disconnected;
                true
            }
        })
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    pub(crate) async fn wait_disconnected(&self) {
        let mut rx = self.subscribe();
        let _ = rx
            .wait_for(|state| *state == SessionState::Disconnected)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_only_move_forward() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.get(), SessionState::Connected);

        assert!(lifecycle.begin_disconnect());
        assert!(!lifecycle.begin_disconnect());
        assert_eq!(lifecycle.get(), SessionState::Disconnecting);

        assert!(lifecycle.finish());
        assert!(!lifecycle.finish());
        assert!(!lifecycle.begin_disconnect());
        assert_eq!(lifecycle.get(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_wait_disconnected_wakes() {
        let lifecycle = std::sync::Arc::new(Lifecycle::new());
        let waiter = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.wait_disconnected().await })
        };
        lifecycle.finish();
        waiter.await.unwrap();
    }
}
