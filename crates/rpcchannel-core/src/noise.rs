//! Encrypted transport over the Noise Protocol Framework.
//!
//! Both ends run `Noise_XX_25519_ChaChaPoly_BLAKE2s`; the initiator is the
//! dialing side. Every Noise message travels in a length-prefixed frame:
//!
//! ```text
//! [u16 BE: len][ciphertext of len bytes]
//! ```
//!
//! After the handshake, JSON lines are encrypted in chunks of at most
//! `NOISE_MAX_FRAME - NOISE_TAG_LEN` plaintext bytes. The reader decrypts
//! frames into a plaintext buffer and splits it on `\n`, so sessions see the
//! same record stream as on the plain transport.
//!
//! # Thread Safety
//!
//! Reader and writer halves share one `snow::TransportState` behind a
//! `std::sync::Mutex`. The lock is only taken inside the synchronous
//! encrypt/decrypt helpers and never held across an await point.

use crate::client::RpcClient;
use crate::config::{ClientConfig, ProtocolConfig, ServerConfig};
use crate::error::{ProtocolError, Result, RpcError};
use crate::listener::{self, RpcServer, Upgrade};
use crate::protocol::{self, Message};
use crate::server::{Dispatch, SessionHandle};
use crate::tcp;
use crate::transport::{Connection, ConnectionInfo, MessageReader, MessageWriter};
use async_trait::async_trait;
use snow::params::NoiseParams;
use snow::{Builder, HandshakeState, TransportState};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, info};

const KEY_LEN: usize = ProtocolConfig::NOISE_KEY_LEN;

/// Static X25519 keypair identifying one endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct NoiseKeypair {
    private: [u8; KEY_LEN],
    public: [u8; KEY_LEN],
}

impl NoiseKeypair {
    pub fn generate() -> Result<Self> {
        let keypair = Builder::new(noise_params()?).generate_keypair()?;
        Ok(Self {
            private: to_key(&keypair.private, "private key")?,
            public: to_key(&keypair.public, "public key")?,
        })
    }

    pub fn from_hex(private_hex: &str, public_hex: &str) -> Result<Self> {
        Ok(Self {
            private: parse_key(private_hex)?,
            public: parse_key(public_hex)?,
        })
    }

    /// Load a key file: hex private key on the first line, hex public key on
    /// the second.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let mut lines = contents.lines().map(str::trim).filter(|line| !line.is_empty());
        match (lines.next(), lines.next()) {
            (Some(private_hex), Some(public_hex)) => Self::from_hex(private_hex, public_hex),
            _ => Err(RpcError::Config {
                message: format!("Key file {} must hold a private and a public key", path.display()),
            }),
        }
    }

    /// Write the key file read by [`NoiseKeypair::load`]. On unix the file is
    /// created with mode 0600.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        use std::io::Write;

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(path.as_ref())?;
        writeln!(file, "{}", hex::encode(self.private))?;
        writeln!(file, "{}", hex::encode(self.public))?;
        Ok(())
    }

    pub fn public_key(&self) -> &[u8; KEY_LEN] {
        &self.public
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public)
    }
}

impl fmt::Debug for NoiseKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NoiseKeypair")
            .field("public", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

/// Parse a hex-encoded 32-byte public or private key.
pub fn parse_key(key_hex: &str) -> Result<[u8; KEY_LEN]> {
    let bytes = hex::decode(key_hex.trim()).map_err(|e| RpcError::Config {
        message: format!("Invalid hex key: {}", e),
    })?;
    to_key(&bytes, "key")
}

fn to_key(bytes: &[u8], what: &str) -> Result<[u8; KEY_LEN]> {
    bytes.try_into().map_err(|_| RpcError::Config {
        message: format!("{} must be {} bytes, got {}", what, KEY_LEN, bytes.len()),
    })
}

fn noise_params() -> Result<NoiseParams> {
    Ok(ProtocolConfig::NOISE_PATTERN.parse()?)
}

/// Which remote static keys a handshake accepts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PeerVerification {
    /// Accept any remote key. The channel is encrypted but unauthenticated.
    #[default]
    Any,
    /// Accept only the listed keys.
    Allow(Vec<[u8; KEY_LEN]>),
}

impl PeerVerification {
    pub fn allows(&self, remote: &[u8; KEY_LEN]) -> bool {
        match self {
            PeerVerification::Any => true,
            PeerVerification::Allow(keys) => keys.contains(remote),
        }
    }
}

/// Local identity plus peer policy for one endpoint.
#[derive(Debug, Clone)]
pub struct NoiseSettings {
    pub keypair: NoiseKeypair,
    pub verify: PeerVerification,
}

impl NoiseSettings {
    pub fn new(keypair: NoiseKeypair) -> Self {
        Self {
            keypair,
            verify: PeerVerification::Any,
        }
    }

    pub fn verify(mut self, verify: PeerVerification) -> Self {
        self.verify = verify;
        self
    }

    /// Add one key to the allow-list, switching from `Any` if needed.
    pub fn allow(mut self, key: [u8; KEY_LEN]) -> Self {
        match &mut self.verify {
            PeerVerification::Allow(keys) => keys.push(key),
            PeerVerification::Any => self.verify = PeerVerification::Allow(vec![key]),
        }
        self
    }
}

/// Outcome of a completed handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoiseInfo {
    pub remote_static: [u8; KEY_LEN],
    /// Identical on both ends of the same session.
    pub handshake_hash: Vec<u8>,
    pub protocol: String,
    /// Whether `remote_static` was checked against an allow-list.
    pub verified: bool,
}

impl NoiseInfo {
    pub fn remote_static_hex(&self) -> String {
        hex::encode(self.remote_static)
    }
}

/// Read one length-prefixed frame.
///
/// `None` only when the stream ends exactly on a frame boundary; a stream cut
/// inside the length prefix or the body is a truncated record.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 2];
    if reader.read(&mut len_buf[..1]).await? == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut len_buf[1..]).await.map_err(truncated)?;

    let len = u16::from_be_bytes(len_buf) as usize;
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await.map_err(truncated)?;
    Ok(Some(frame))
}

fn truncated(err: std::io::Error) -> RpcError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtocolError::TruncatedRecord.into()
    } else {
        err.into()
    }
}

fn push_frame(out: &mut Vec<u8>, ciphertext: &[u8]) {
    // Callers never produce more than NOISE_MAX_FRAME bytes.
    out.extend_from_slice(&(ciphertext.len() as u16).to_be_bytes());
    out.extend_from_slice(ciphertext);
}

async fn run_handshake<S>(
    stream: &mut S,
    mut state: HandshakeState,
    settings: &NoiseSettings,
) -> Result<(TransportState, NoiseInfo)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; ProtocolConfig::NOISE_MAX_FRAME];
    while !state.is_handshake_finished() {
        if state.is_my_turn() {
            let len = state.write_message(&[], &mut buf)?;
            let mut frame = Vec::with_capacity(len + 2);
            push_frame(&mut frame, &buf[..len]);
            stream.write_all(&frame).await?;
            stream.flush().await?;
        } else {
            let frame = read_frame(stream).await?.ok_or_else(|| RpcError::Handshake {
                message: "Peer closed the stream during the handshake".to_string(),
            })?;
            state.read_message(&frame, &mut buf)?;
        }
    }

    let remote = state.get_remote_static().ok_or_else(|| RpcError::Handshake {
        message: "Peer sent no static key".to_string(),
    })?;
    let remote_static: [u8; KEY_LEN] = remote.try_into().map_err(|_| RpcError::Handshake {
        message: format!("Peer static key has {} bytes", remote.len()),
    })?;

    if !settings.verify.allows(&remote_static) {
        return Err(RpcError::Handshake {
            message: format!("Peer key {} is not allowed", hex::encode(remote_static)),
        });
    }

    let info = NoiseInfo {
        remote_static,
        handshake_hash: state.get_handshake_hash().to_vec(),
        protocol: ProtocolConfig::NOISE_PATTERN.to_string(),
        verified: matches!(settings.verify, PeerVerification::Allow(_)),
    };
    Ok((state.into_transport_mode()?, info))
}

/// Run the dialing side of the handshake and wrap `stream` in an encrypted
/// connection.
pub async fn handshake_initiator<S>(
    mut stream: S,
    settings: &NoiseSettings,
    mut info: ConnectionInfo,
    max_line_length: usize,
) -> Result<Connection>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let state = Builder::new(noise_params()?)
        .local_private_key(&settings.keypair.private)
        .build_initiator()?;
    let (transport, noise) = run_handshake(&mut stream, state, settings).await?;
    debug!(remote = %noise.remote_static_hex(), "Noise handshake complete (initiator)");
    info.noise = Some(noise);
    Ok(encrypted(stream, transport, info, max_line_length))
}

/// Run the accepting side of the handshake.
pub async fn handshake_responder<S>(
    mut stream: S,
    settings: &NoiseSettings,
    mut info: ConnectionInfo,
    max_line_length: usize,
) -> Result<Connection>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let state = Builder::new(noise_params()?)
        .local_private_key(&settings.keypair.private)
        .build_responder()?;
    let (transport, noise) = run_handshake(&mut stream, state, settings).await?;
    debug!(remote = %noise.remote_static_hex(), "Noise handshake complete (responder)");
    info.noise = Some(noise);
    Ok(encrypted(stream, transport, info, max_line_length))
}

type SharedTransport = Arc<Mutex<TransportState>>;

fn lock(transport: &SharedTransport) -> MutexGuard<'_, TransportState> {
    transport.lock().unwrap_or_else(PoisonError::into_inner)
}

fn encrypted<S>(
    stream: S,
    transport: TransportState,
    info: ConnectionInfo,
    max_line_length: usize,
) -> Connection
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let transport = Arc::new(Mutex::new(transport));
    let (read_half, write_half) = tokio::io::split(stream);
    Connection::new(
        NoiseReader {
            inner: read_half,
            transport: transport.clone(),
            plaintext: Vec::new(),
            max_line_length,
        },
        NoiseWriter {
            inner: write_half,
            transport,
            closed: false,
        },
        info,
    )
}

struct NoiseReader<S> {
    inner: ReadHalf<S>,
    transport: SharedTransport,
    plaintext: Vec<u8>,
    max_line_length: usize,
}

impl<S> NoiseReader<S> {
    fn decrypt_into_buffer(&mut self, frame: &[u8]) -> Result<()> {
        let mut out = vec![0u8; frame.len()];
        let len = lock(&self.transport)
            .read_message(frame, &mut out)
            .map_err(|e| RpcError::Transport {
                message: format!("Failed to decrypt frame: {}", e),
                source: None,
            })?;
        self.plaintext.extend_from_slice(&out[..len]);
        Ok(())
    }
}

#[async_trait]
impl<S: AsyncRead + Send + 'static> MessageReader for NoiseReader<S> {
    async fn read_message(&mut self) -> Result<Option<Message>> {
        loop {
            // Room for the record plus "\r\n".
            let limit = self.max_line_length + 2;
            let terminator = self
                .plaintext
                .iter()
                .position(|&b| b == ProtocolConfig::RECORD_TERMINATOR);
            let len = terminator.map_or(self.plaintext.len(), |end| end + 1);
            if len > limit || (terminator.is_none() && len == limit) {
                return Err(ProtocolError::LineTooLong {
                    len,
                    max: self.max_line_length,
                }
                .into());
            }
            if let Some(end) = terminator {
                let record: Vec<u8> = self.plaintext.drain(..=end).collect();
                return Ok(Some(protocol::decode(&record)?));
            }

            match read_frame(&mut self.inner).await? {
                Some(frame) => self.decrypt_into_buffer(&frame)?,
                None if self.plaintext.is_empty() => return Ok(None),
                None => return Err(ProtocolError::TruncatedRecord.into()),
            }
        }
    }
}

struct NoiseWriter<S> {
    inner: WriteHalf<S>,
    transport: SharedTransport,
    closed: bool,
}

impl<S> NoiseWriter<S> {
    /// Encrypt a whole record into one buffer of consecutive frames.
    fn seal(&self, record: &[u8]) -> Result<Vec<u8>> {
        let chunk_len = ProtocolConfig::NOISE_MAX_FRAME - ProtocolConfig::NOISE_TAG_LEN;
        let mut out = Vec::with_capacity(record.len() + (record.len() / chunk_len + 1) * 18);
        let mut ciphertext = vec![0u8; ProtocolConfig::NOISE_MAX_FRAME];

        let mut transport = lock(&self.transport);
        for chunk in record.chunks(chunk_len) {
            let len = transport.write_message(chunk, &mut ciphertext)?;
            push_frame(&mut out, &ciphertext[..len]);
        }
        Ok(out)
    }
}

#[async_trait]
impl<S: AsyncWrite + Send + 'static> MessageWriter for NoiseWriter<S> {
    async fn write_message(&mut self, message: &Message) -> Result<()> {
        let record = protocol::encode(message)?;
        let frames = self.seal(&record)?;
        self.inner.write_all(&frames).await?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.inner.shutdown().await?;
        Ok(())
    }
}

struct NoiseUpgrade {
    settings: NoiseSettings,
}

#[async_trait]
impl Upgrade for NoiseUpgrade {
    async fn upgrade(&self, stream: TcpStream, max_line_length: usize) -> Result<Connection> {
        let info = ConnectionInfo::tcp(&stream)?;
        handshake_responder(stream, &self.settings, info, max_line_length).await
    }
}

/// Serve encrypted sessions on `addr`.
///
/// Each accepted connection completes a responder handshake within
/// `config.handshake_timeout` before its session starts; a failed handshake
/// only drops that connection.
pub async fn serve_noise<A, F, D>(
    addr: A,
    settings: NoiseSettings,
    config: ServerConfig,
    factory: F,
) -> Result<RpcServer>
where
    A: ToSocketAddrs,
    F: Fn(&SessionHandle) -> D + Send + Sync + 'static,
    D: Dispatch,
{
    info!(public_key = %settings.keypair.public_key_hex(), "Starting Noise server");
    listener::serve(addr, NoiseUpgrade { settings }, config, factory).await
}

/// Dial `addr` and complete an initiator handshake.
pub async fn dial_noise<A>(addr: A, settings: &NoiseSettings, config: &ClientConfig) -> Result<Connection>
where
    A: ToSocketAddrs + fmt::Display,
{
    let stream = tcp::dial(&addr, config).await?;
    let info = ConnectionInfo::tcp(&stream)?;
    let handshake = handshake_initiator(stream, settings, info, config.session.max_line_length);
    tokio::time::timeout(config.handshake_timeout, handshake)
        .await
        .map_err(|_| RpcError::Handshake {
            message: format!("Handshake with {} timed out", addr),
        })?
}

/// Connect an encrypted client session to `addr`.
pub async fn client_noise<A>(addr: A, settings: &NoiseSettings, config: ClientConfig) -> Result<RpcClient>
where
    A: ToSocketAddrs + fmt::Display,
{
    let connection = dial_noise(addr, settings, &config).await?;
    Ok(RpcClient::builder(connection).config(config.session).start())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Payload;

    fn settings() -> NoiseSettings {
        NoiseSettings::new(NoiseKeypair::generate().unwrap())
    }

    async fn pair(client: &NoiseSettings, server: &NoiseSettings) -> (Result<Connection>, Result<Connection>) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let max = ProtocolConfig::MAX_LINE_LENGTH;
        tokio::join!(
            handshake_initiator(a, client, ConnectionInfo::default(), max),
            handshake_responder(b, server, ConnectionInfo::default(), max),
        )
    }

    #[tokio::test]
    async fn test_handshake_and_exchange() {
        let client_settings = settings();
        let server_settings = settings();
        let (client, server) = pair(&client_settings, &server_settings).await;
        let (mut client, mut server) = (client.unwrap(), server.unwrap());

        let client_noise = client.info().noise.clone().unwrap();
        let server_noise = server.info().noise.clone().unwrap();
        assert_eq!(client_noise.handshake_hash, server_noise.handshake_hash);
        assert_eq!(&client_noise.remote_static, server_settings.keypair.public_key());
        assert_eq!(&server_noise.remote_static, client_settings.keypair.public_key());
        assert!(!client_noise.verified);
        assert_eq!(client_noise.protocol, ProtocolConfig::NOISE_PATTERN);

        let call = Message::call(1, "Calc", "add(int,int)", Payload::new(&(2, 3)).unwrap());
        client.write_message(&call).await.unwrap();
        client.write_message(&Message::Disconnect).await.unwrap();
        assert_eq!(server.read_message().await.unwrap(), Some(call));
        assert_eq!(server.read_message().await.unwrap(), Some(Message::Disconnect));

        client.close().await.unwrap();
        assert_eq!(server.read_message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_large_record_spans_frames() {
        let (client, server) = pair(&settings(), &settings()).await;
        let (mut client, mut server) = (client.unwrap(), server.unwrap());

        let big = "x".repeat(3 * ProtocolConfig::NOISE_MAX_FRAME);
        let event = Message::event("Blob", Payload::new(&[&big]).unwrap());

        let writer = tokio::spawn(async move {
            client.write_message(&event).await.unwrap();
            (client, event)
        });
        let received = server.read_message().await.unwrap().unwrap();
        let (_client, event) = writer.await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn test_timed_out_call_keeps_ciphers_in_step() {
        let (a, b) = tokio::io::duplex(1024);
        let max = ProtocolConfig::MAX_LINE_LENGTH;
        let (client_settings, server_settings) = (settings(), settings());
        let (client, server) = tokio::join!(
            handshake_initiator(a, &client_settings, ConnectionInfo::default(), max),
            handshake_responder(b, &server_settings, ConnectionInfo::default(), max),
        );
        let client = crate::client::create_client_session(client.unwrap());
        let mut server = server.unwrap();

        // Spans several frames and cannot fit the pipe while nobody reads.
        let big = Payload::new(&["z".repeat(200 * 1024)]).unwrap();
        let first = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            client.call("Blob", "put(string)", big.clone()),
        )
        .await;
        assert!(first.is_err());

        let server_side = async {
            match server.read_message().await.unwrap() {
                Some(Message::Call(call)) => assert_eq!(call.parameters, big),
                other => panic!("Expected call, got: {:?}", other),
            }
            let second = match server.read_message().await.unwrap() {
                Some(Message::Call(call)) => call,
                other => panic!("Expected call, got: {:?}", other),
            };
            server
                .write_message(&Message::result(second.id, Some(Payload::new(&1).unwrap())))
                .await
                .unwrap();
        };
        let (second, ()) = tokio::join!(client.call("Blob", "size()", Payload::empty()), server_side);
        assert_eq!(second.unwrap().unwrap().decode::<i64>().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_read_frame_distinguishes_clean_eof_from_cut_frame() {
        let mut empty = std::io::Cursor::new(Vec::<u8>::new());
        assert!(read_frame(&mut empty).await.unwrap().is_none());

        let mut whole = std::io::Cursor::new(vec![0, 2, 7, 9]);
        assert_eq!(read_frame(&mut whole).await.unwrap(), Some(vec![7, 9]));
        assert!(read_frame(&mut whole).await.unwrap().is_none());

        // One byte of the length prefix, then nothing.
        let mut cut_prefix = std::io::Cursor::new(vec![0]);
        assert!(matches!(
            read_frame(&mut cut_prefix).await,
            Err(RpcError::Protocol(ProtocolError::TruncatedRecord))
        ));

        let mut cut_body = std::io::Cursor::new(vec![0, 5, 1, 2]);
        assert!(matches!(
            read_frame(&mut cut_body).await,
            Err(RpcError::Protocol(ProtocolError::TruncatedRecord))
        ));
    }

    #[tokio::test]
    async fn test_allow_list_accepts_known_key() {
        let client_settings = settings();
        let server_settings = settings().allow(*client_settings.keypair.public_key());
        let (client, server) = pair(&client_settings, &server_settings).await;
        client.unwrap();
        assert!(server.unwrap().info().noise.as_ref().unwrap().verified);
    }

    #[tokio::test]
    async fn test_allow_list_rejects_unknown_key() {
        let stranger = NoiseKeypair::generate().unwrap();
        let server_settings = settings().allow(*stranger.public_key());
        let (_client, server) = pair(&settings(), &server_settings).await;
        assert!(matches!(server, Err(RpcError::Handshake { .. })));
    }

    #[test]
    fn test_keypair_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.key");

        let keypair = NoiseKeypair::generate().unwrap();
        keypair.save(&path).unwrap();
        let loaded = NoiseKeypair::load(&path).unwrap();
        assert_eq!(loaded, keypair);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_load_rejects_short_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.key");
        std::fs::write(&path, "abcd\n").unwrap();
        assert!(matches!(NoiseKeypair::load(&path), Err(RpcError::Config { .. })));
    }

    #[test]
    fn test_parse_key_checks_length() {
        assert!(parse_key("0011").is_err());
        assert!(parse_key("zz").is_err());
        assert_eq!(parse_key(&"ab".repeat(32)).unwrap(), [0xab; 32]);
    }

    #[test]
    fn test_debug_hides_private_key() {
        let keypair = NoiseKeypair::generate().unwrap();
        let debug = format!("{:?}", keypair);
        assert!(debug.contains(&keypair.public_key_hex()));
        assert!(!debug.contains(&hex::encode(keypair.private)));
    }
}
