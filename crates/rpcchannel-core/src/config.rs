//! Centralized configuration for rpcchannel.
//!
//! Protocol limits are fixed constants; per-session, per-server and per-client
//! knobs live in plain structs with `Default` impls and builder-style setters.

use std::time::Duration;

/// Wire-level limits and defaults.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Largest accepted record, excluding the terminator.
    pub const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024; // 16MB
    pub const RECORD_TERMINATOR: u8 = b'\n';
    /// Records queued for the writer task before senders wait.
    pub const OUTBOX_CAPACITY: usize = 64;

    // Noise
    pub const NOISE_PATTERN: &'static str = "Noise_XX_25519_ChaChaPoly_BLAKE2s";
    pub const NOISE_MAX_FRAME: usize = 65535;
    pub const NOISE_TAG_LEN: usize = 16;
    pub const NOISE_KEY_LEN: usize = 32;

    // Timeouts
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    pub const MAX_CONNECTIONS: usize = 1024;
}

/// What a server session does with running handlers once a disconnect starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrainPolicy {
    /// Let in-flight handlers finish and write their replies first, for at
    /// most `disconnect_timeout` and only while the client keeps the stream
    /// open.
    #[default]
    Wait,
    /// Abort in-flight handlers; their callers see a disconnection.
    Abandon,
}

/// Settings shared by client and server sessions.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_line_length: usize,
    /// Upper bound on concurrently running handlers per connection.
    pub max_in_flight: Option<usize>,
    pub on_disconnect: DrainPolicy,
    /// How long `disconnect()` waits for the peer's acknowledgement.
    pub disconnect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_line_length: ProtocolConfig::MAX_LINE_LENGTH,
            max_in_flight: None,
            on_disconnect: DrainPolicy::Wait,
            disconnect_timeout: ProtocolConfig::DISCONNECT_TIMEOUT,
        }
    }
}

impl SessionConfig {
    /// Longest accepted record, excluding the terminator.
    pub fn max_line_length(mut self, max: usize) -> Self {
        self.max_line_length = max;
        self
    }

    /// Bound the number of handlers running at once. `None` is unbounded.
    pub fn max_in_flight(mut self, max: Option<usize>) -> Self {
        self.max_in_flight = max;
        self
    }

    /// What happens to running handlers when the client disconnects.
    pub fn on_disconnect(mut self, policy: DrainPolicy) -> Self {
        self.on_disconnect = policy;
        self
    }

    /// How long a disconnect waits for the peer's acknowledgement.
    pub fn disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }
}

/// Listener settings for `serve_tcp` / `serve_noise`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_connections: usize,
    pub nodelay: bool,
    pub handshake_timeout: Duration,
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: ProtocolConfig::MAX_CONNECTIONS,
            nodelay: true,
            handshake_timeout: ProtocolConfig::HANDSHAKE_TIMEOUT,
            session: SessionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Cap on concurrent sessions; extra connections are refused.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set `TCP_NODELAY` on each stream.
    pub fn nodelay(mut self, enable: bool) -> Self {
        self.nodelay = enable;
        self
    }

    /// Bound on the Noise handshake.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Settings applied to every session.
    pub fn session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }
}

/// Dialer settings for `client_tcp` / `client_noise`.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub nodelay: bool,
    pub session: SessionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: ProtocolConfig::CONNECT_TIMEOUT,
            handshake_timeout: ProtocolConfig::HANDSHAKE_TIMEOUT,
            nodelay: true,
            session: SessionConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Bound on establishing the TCP connection.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Bound on the Noise handshake.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set `TCP_NODELAY` on each stream.
    pub fn nodelay(mut self, enable: bool) -> Self {
        self.nodelay = enable;
        self
    }

    /// Settings applied to every session.
    pub fn session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noise_frame_fits_length_prefix() {
        assert!(ProtocolConfig::NOISE_MAX_FRAME <= u16::MAX as usize);
        assert!(ProtocolConfig::NOISE_TAG_LEN < ProtocolConfig::NOISE_MAX_FRAME);
    }

    #[test]
    fn test_timeouts_are_reasonable() {
        assert!(ProtocolConfig::CONNECT_TIMEOUT > Duration::ZERO);
        assert!(ProtocolConfig::DISCONNECT_TIMEOUT > Duration::ZERO);
    }

    #[test]
    fn test_session_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.max_in_flight, None);
        assert_eq!(config.on_disconnect, DrainPolicy::Wait);
        assert_eq!(config.max_line_length, ProtocolConfig::MAX_LINE_LENGTH);
    }

    #[test]
    fn test_builder_setters() {
        let config = ServerConfig::default()
            .max_connections(4)
            .session(SessionConfig::default().max_in_flight(Some(2)));
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.session.max_in_flight, Some(2));
    }
}
