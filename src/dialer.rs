//! Transport dialer: TLS WebSocket connect plus session-open handshake.

use crate::error::{DialError, ErrorContext};
use crate::handshake::{session_open_frame, HandshakeMode};
use crate::transport::{split_ws, FrameSink, FrameSource, Session, WsSession, WsSink, WsSource};
use bytes::Bytes;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::USER_AGENT;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::Connector;
use uuid::Uuid;

pub const DEFAULT_PATH: &str = "/tun";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Linux; Android)";
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// How the relay's certificate is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum TlsPolicy {
    /// Verify the chain against webpki roots and the relay host name.
    Verify,
    /// Accept any certificate; handshake signatures are still checked.
    SkipVerification,
    /// Plain `ws://` without TLS.
    Disabled,
}

impl TlsPolicy {
    fn scheme(self) -> &'static str {
        match self {
            TlsPolicy::Disabled => "ws",
            TlsPolicy::Verify | TlsPolicy::SkipVerification => "wss",
        }
    }
}

/// Whether the relay answers the handshake with one frame before data flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AckPolicy {
    #[default]
    None,
    AwaitFrame,
}

/// Everything needed to reach one relay.
#[derive(Debug, Clone)]
pub struct DialerConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub user_agent: String,
    pub client_id: Uuid,
    pub handshake_mode: HandshakeMode,
    pub tls_policy: TlsPolicy,
    pub ack_policy: AckPolicy,
    /// Bound on TCP connect + TLS + WebSocket upgrade.
    pub dial_timeout: Duration,
    /// Bound on the acknowledgement read when [`AckPolicy::AwaitFrame`].
    pub ack_timeout: Duration,
}

impl DialerConfig {
    pub fn new(host: impl Into<String>, port: u16, client_id: Uuid, tls_policy: TlsPolicy) -> Self {
        Self {
            host: host.into(),
            port,
            path: DEFAULT_PATH.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            client_id,
            handshake_mode: HandshakeMode::Canonical,
            tls_policy,
            ack_policy: AckPolicy::None,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn relay_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn url(&self) -> String {
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("{}://{}{}", self.tls_policy.scheme(), self.relay_addr(), path)
    }
}

/// Produces handshaked sessions.
pub trait Dialer: Send + Sync + 'static {
    type Sink: FrameSink;
    type Source: FrameSource;

    fn dial(
        &self,
    ) -> impl Future<Output = Result<Session<Self::Sink, Self::Source>, DialError>> + Send;
}

/// Send the session-open frame and, if required, read the acknowledgement.
///
/// The write is bounded by `write_timeout`. The session is closed before any
/// error is returned.
pub async fn open_session<S: FrameSink, R: FrameSource>(
    mut session: Session<S, R>,
    frame: Bytes,
    write_timeout: Duration,
    ack_policy: AckPolicy,
    ack_timeout: Duration,
) -> Result<Session<S, R>, DialError> {
    match tokio::time::timeout(write_timeout, session.send_handshake(frame)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            session.close().await;
            return Err(DialError::HandshakeWrite(e));
        }
        Err(_) => {
            session.close().await;
            return Err(DialError::Timeout(write_timeout));
        }
    }

    if ack_policy == AckPolicy::AwaitFrame {
        match tokio::time::timeout(ack_timeout, session.read_ack()).await {
            Ok(Ok(ack)) => {
                log::debug!("Relay acknowledged handshake ({} bytes)", ack.len());
            }
            Ok(Err(e)) => {
                session.close().await;
                return Err(DialError::HandshakeAck(ErrorContext::with_source(
                    "reading handshake acknowledgement",
                    e,
                )));
            }
            Err(_) => {
                session.close().await;
                return Err(DialError::ack(format!(
                    "no acknowledgement within {:?}",
                    ack_timeout
                )));
            }
        }
    }

    session.activate();
    Ok(session)
}

/// Dials the relay over WebSocket.
pub struct WsDialer {
    config: DialerConfig,
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl WsDialer {
    pub fn new(config: DialerConfig) -> Self {
        let tls = match config.tls_policy {
            TlsPolicy::Verify => Some(verified_client_config()),
            TlsPolicy::SkipVerification => Some(insecure_client_config()),
            TlsPolicy::Disabled => None,
        };
        Self { config, tls }
    }

    pub fn config(&self) -> &DialerConfig {
        &self.config
    }

    async fn connect(&self) -> Result<WsSession, DialError> {
        let url = self.config.url();
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| DialError::connect_with_source(format!("invalid relay URL {}", url), e))?;
        let user_agent = HeaderValue::from_str(&self.config.user_agent)
            .map_err(|e| DialError::connect_with_source("invalid User-Agent header", e))?;
        request.headers_mut().insert(USER_AGENT, user_agent);

        match self.config.tls_policy {
            TlsPolicy::Verify => {}
            TlsPolicy::SkipVerification => log::warn!(
                "TLS certificate verification is DISABLED for {}",
                self.config.relay_addr()
            ),
            TlsPolicy::Disabled => log::warn!(
                "TLS is disabled; traffic to {} is sent in plaintext",
                self.config.relay_addr()
            ),
        }

        let connector = match &self.tls {
            Some(tls) => Connector::Rustls(tls.clone()),
            None => Connector::Plain,
        };

        let connect = tokio_tungstenite::connect_async_tls_with_config(
            request,
            None,
            false,
            Some(connector),
        );
        let (stream, response) = match tokio::time::timeout(self.config.dial_timeout, connect).await
        {
            Ok(Ok(connected)) => connected,
            Ok(Err(e)) => {
                return Err(DialError::connect_with_source(
                    format!("connecting to {}", url),
                    e,
                ))
            }
            Err(_) => return Err(DialError::Timeout(self.config.dial_timeout)),
        };
        log::debug!("WebSocket upgrade to {} ({})", url, response.status());

        let (sink, source) = split_ws(stream);
        Ok(Session::new(sink, source, self.config.relay_addr()))
    }
}

impl Dialer for WsDialer {
    type Sink = WsSink;
    type Source = WsSource;

    async fn dial(&self) -> Result<WsSession, DialError> {
        let session = self.connect().await?;
        let frame = Bytes::from(session_open_frame(
            self.config.handshake_mode,
            self.config.client_id,
        ));
        open_session(
            session,
            frame,
            self.config.dial_timeout,
            self.config.ack_policy,
            self.config.ack_timeout,
        )
        .await
    }
}

// ============================================================================
// TLS configuration
// ============================================================================

/// Install aws-lc-rs as the process-wide rustls provider.
pub fn ensure_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn verified_client_config() -> Arc<rustls::ClientConfig> {
    ensure_crypto_provider();
    let roots = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

fn insecure_client_config() -> Arc<rustls::ClientConfig> {
    ensure_crypto_provider();
    Arc::new(
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(AcceptAnyCertVerifier::new())
            .with_no_client_auth(),
    )
}

/// Accepts any server certificate but still validates handshake signatures.
#[derive(Debug)]
struct AcceptAnyCertVerifier {
    crypto: Arc<rustls::crypto::CryptoProvider>,
}

impl AcceptAnyCertVerifier {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            crypto: Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
        })
    }
}

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        log::trace!("Accepting unverified certificate for {:?}", server_name);
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.crypto.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.crypto.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.crypto
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::{HandshakeMessage, HANDSHAKE_LEN, ID_ONLY_HANDSHAKE_LEN};
    use crate::test_support::loopback_session;
    use crate::transport::SessionState;
    use futures::{SinkExt, StreamExt};
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::tungstenite::Message;

    /// What the loopback relay saw from the client.
    struct Observed {
        path: String,
        user_agent: Option<String>,
        first_frame: Vec<u8>,
    }

    /// Plaintext relay that records the upgrade request and first frame,
    /// optionally replies with `ack`, then drains until the client leaves.
    async fn spawn_relay(ack: Option<&'static [u8]>) -> (SocketAddr, JoinHandle<Observed>) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind loopback relay");
        let addr = listener.local_addr().expect("local addr");

        let handle = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.expect("accept");
            let (req_tx, req_rx) = oneshot::channel();
            let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                let user_agent = req
                    .headers()
                    .get(USER_AGENT)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let _ = req_tx.send((req.uri().path().to_string(), user_agent));
                Ok(resp)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(tcp, callback)
                .await
                .expect("websocket accept");
            let (path, user_agent) = req_rx.await.expect("request observed");

            let first_frame = match ws.next().await {
                Some(Ok(Message::Binary(data))) => data.to_vec(),
                other => panic!("expected binary handshake, got {:?}", other),
            };
            if let Some(ack) = ack {
                ws.send(Message::binary(ack)).await.expect("send ack");
            }
            while let Some(Ok(_)) = ws.next().await {}

            Observed {
                path,
                user_agent,
                first_frame,
            }
        });

        (addr, handle)
    }

    fn plaintext_config(addr: SocketAddr, client_id: Uuid) -> DialerConfig {
        let mut config = DialerConfig::new("127.0.0.1", addr.port(), client_id, TlsPolicy::Disabled);
        config.dial_timeout = Duration::from_secs(5);
        config
    }

    #[test]
    fn test_url_for_policies() {
        let id = Uuid::new_v4();
        let config = DialerConfig::new("relay.example", 443, id, TlsPolicy::Verify);
        assert_eq!(config.url(), "wss://relay.example:443/tun");

        let mut config = DialerConfig::new("2001:db8::1", 8080, id, TlsPolicy::Disabled);
        config.path = "vless".to_string();
        assert_eq!(config.url(), "ws://[2001:db8::1]:8080/vless");
    }

    #[tokio::test]
    async fn test_dial_sends_canonical_handshake() {
        let (addr, relay) = spawn_relay(None).await;
        let client_id = Uuid::new_v4();
        let dialer = WsDialer::new(plaintext_config(addr, client_id));

        let mut session = dialer.dial().await.expect("dial relay");
        assert_eq!(session.state(), SessionState::Active);
        assert!(session.ack().is_none());
        session.close().await;

        let observed = relay.await.expect("relay task");
        assert_eq!(observed.path, "/tun");
        assert_eq!(observed.user_agent.as_deref(), Some(DEFAULT_USER_AGENT));
        assert_eq!(observed.first_frame.len(), HANDSHAKE_LEN);
        let msg = HandshakeMessage::decode(&observed.first_frame).expect("decode handshake");
        assert_eq!(msg.client_id, client_id);
    }

    #[tokio::test]
    async fn test_dial_id_only_mode() {
        let (addr, relay) = spawn_relay(None).await;
        let client_id = Uuid::new_v4();
        let mut config = plaintext_config(addr, client_id);
        config.handshake_mode = HandshakeMode::IdOnly;
        let dialer = WsDialer::new(config);

        let mut session = dialer.dial().await.expect("dial relay");
        session.close().await;

        let observed = relay.await.expect("relay task");
        assert_eq!(observed.first_frame.len(), ID_ONLY_HANDSHAKE_LEN);
        assert_eq!(observed.first_frame.as_slice(), client_id.as_bytes());
    }

    #[tokio::test]
    async fn test_dial_reads_ack_when_required() {
        let (addr, relay) = spawn_relay(Some(b"\x00\x00")).await;
        let mut config = plaintext_config(addr, Uuid::new_v4());
        config.ack_policy = AckPolicy::AwaitFrame;
        let dialer = WsDialer::new(config);

        let mut session = dialer.dial().await.expect("dial relay");
        assert_eq!(session.ack().map(|b| b.len()), Some(2));
        session.close().await;
        relay.await.expect("relay task");
    }

    #[tokio::test]
    async fn test_dial_ack_timeout() {
        let (addr, _relay) = spawn_relay(None).await;
        let mut config = plaintext_config(addr, Uuid::new_v4());
        config.ack_policy = AckPolicy::AwaitFrame;
        config.ack_timeout = Duration::from_millis(200);
        let dialer = WsDialer::new(config);

        let err = dialer.dial().await.expect_err("ack should time out");
        assert!(matches!(err, DialError::HandshakeAck(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_dial_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);

        let dialer = WsDialer::new(plaintext_config(addr, Uuid::new_v4()));
        let err = dialer.dial().await.expect_err("dial should fail");
        assert!(matches!(err, DialError::ConnectFailure(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_dial_times_out_on_silent_peer() {
        // Accepts TCP via the backlog but never answers the upgrade.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");

        let mut config = plaintext_config(addr, Uuid::new_v4());
        config.dial_timeout = Duration::from_millis(200);
        let dialer = WsDialer::new(config);

        let err = dialer.dial().await.expect_err("dial should time out");
        assert!(matches!(err, DialError::Timeout(_)), "got {:?}", err);
        drop(listener);
    }

    #[tokio::test]
    async fn test_open_session_write_failure_closes() {
        let (session, handle) = loopback_session("relay.test:443");
        handle.fail_sends_after(0);

        let err = open_session(
            session,
            Bytes::from_static(b"hello"),
            DEFAULT_DIAL_TIMEOUT,
            AckPolicy::None,
            DEFAULT_ACK_TIMEOUT,
        )
        .await
        .expect_err("write should fail");
        assert!(matches!(err, DialError::HandshakeWrite(_)));
        assert_eq!(handle.sink_closes(), 1);
    }

    #[tokio::test]
    async fn test_open_session_ack_close_fails() {
        let (session, handle) = loopback_session("relay.test:443");
        handle.close_incoming();

        let err = open_session(
            session,
            Bytes::from_static(b"hello"),
            DEFAULT_DIAL_TIMEOUT,
            AckPolicy::AwaitFrame,
            DEFAULT_ACK_TIMEOUT,
        )
        .await
        .expect_err("ack should fail");
        assert!(matches!(err, DialError::HandshakeAck(_)));
        assert_eq!(handle.sink_closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_session_write_timeout_closes() {
        let (session, handle) = loopback_session("relay.test:443");
        handle.stall_sends();

        let err = open_session(
            session,
            Bytes::from_static(b"hello"),
            Duration::from_secs(3),
            AckPolicy::None,
            DEFAULT_ACK_TIMEOUT,
        )
        .await
        .expect_err("write should time out");
        assert!(
            matches!(err, DialError::Timeout(d) if d == Duration::from_secs(3)),
            "got {:?}",
            err
        );
        assert_eq!(handle.sink_closes(), 1);
    }
}
