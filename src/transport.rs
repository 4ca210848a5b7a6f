//! HTTP/2-over-TLS transport plumbing
// (c) 2024 Ross Younger
//!
//! Every connection this tool opens (load-generating flows, latency probes,
//! the configuration fetch) goes through [`Dialer::connect`]. The dialer
//! negotiates TLS with ALPN `h2` so that small probe requests can be
//! multiplexed onto a connection that is busy saturating the link.
//!
//! Certificate verification is deliberately disabled: the tool measures
//! round-trip times and goodput, it does not transfer anything confidential,
//! and test servers routinely present self-signed certificates.

use std::convert::Infallible;
use std::fs::File;
use std::io::Write as _;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd as _, RawFd};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::{Context as _, Result};
use bytes::Bytes;
use http::Uri;
use http_body::Frame;
use hyper::client::conn::http2::{self, SendRequest};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{DigitallySignedStruct, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Upload flows stream this buffer over and over; nothing is allocated per chunk.
const UPLOAD_CHUNK: &[u8] = &[0u8; 8192];

/// Request body for every request this tool issues.
pub enum Payload {
    /// No body: probes, downloads and the configuration fetch
    Empty,
    /// A never-ending body: the upload flows
    Unbounded(UnboundedBody),
}

/// Streams [`UPLOAD_CHUNK`] indefinitely, counting the bytes handed to the
/// HTTP layer, until its governing scope is cancelled.
pub struct UnboundedBody {
    sent: Arc<AtomicU64>,
    scope: CancellationToken,
}

impl UnboundedBody {
    /// `sent` accumulates the bytes produced; `scope` ends the stream.
    #[must_use]
    pub fn new(sent: Arc<AtomicU64>, scope: CancellationToken) -> Self {
        Self { sent, scope }
    }
}

impl http_body::Body for Payload {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        match self.get_mut() {
            Payload::Empty => Poll::Ready(None),
            Payload::Unbounded(body) => {
                if body.scope.is_cancelled() {
                    return Poll::Ready(None);
                }
                // hyper only polls us when the stream has send capacity, so
                // this also respects HTTP/2 flow control.
                let _ = body.sent.fetch_add(UPLOAD_CHUNK.len() as u64, Ordering::Relaxed);
                Poll::Ready(Some(Ok(Frame::data(Bytes::from_static(UPLOAD_CHUNK)))))
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        matches!(self, Payload::Empty)
    }
}

/// Transport-level identity of an established connection, kept for
/// extended-statistics harvesting after sampling has stopped.
#[derive(Debug, Clone, Copy)]
pub struct ConnInfo {
    /// Raw socket handle. Only meaningful while the connection is open.
    pub fd: RawFd,
    /// Remote address
    pub peer: SocketAddr,
}

/// How long each stage of connection establishment took
#[derive(Debug, Clone, Copy)]
pub struct ConnectTiming {
    /// TCP three-way handshake
    pub tcp: Duration,
    /// TLS negotiation
    pub tls: Duration,
}

/// An established HTTP/2 connection.
///
/// Requests are issued through clones of [`send_request`](Self::send_request);
/// they multiplex onto the one underlying TLS stream. Dropping this closes
/// the connection.
pub struct EstablishedConnection {
    send_request: SendRequest<Payload>,
    conn_task: JoinHandle<()>,
    info: ConnInfo,
    timing: ConnectTiming,
}

impl EstablishedConnection {
    /// Clonable request handle
    #[must_use]
    pub fn send_request(&self) -> SendRequest<Payload> {
        self.send_request.clone()
    }

    /// Accessor
    #[must_use]
    pub fn info(&self) -> ConnInfo {
        self.info
    }

    /// Accessor
    #[must_use]
    pub fn timing(&self) -> ConnectTiming {
        self.timing
    }

    /// Tears the connection down
    pub fn close(&self) {
        self.conn_task.abort();
    }
}

impl Drop for EstablishedConnection {
    fn drop(&mut self) {
        self.conn_task.abort();
    }
}

/// Shared connection factory. Cheap to clone.
#[derive(Clone)]
pub struct Dialer {
    tls: Arc<rustls::ClientConfig>,
}

impl Dialer {
    /// Sets up the TLS client configuration, optionally feeding session
    /// secrets to a shared key log writer.
    #[must_use]
    pub fn new(key_log: Option<Arc<KeyLogWriter>>) -> Self {
        let mut config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureServerVerifier))
            .with_no_client_auth();
        config.alpn_protocols = vec![b"h2".to_vec()];
        if let Some(key_log) = key_log {
            config.key_log = key_log;
        }
        Self {
            tls: Arc::new(config),
        }
    }

    /// Dials `url`: TCP connect, TLS handshake, HTTP/2 handshake.
    ///
    /// Returns once the connection is ready to carry requests. The connection
    /// task is spawned onto the runtime and lives until the returned handle
    /// is dropped or closed.
    pub async fn connect(&self, url: &Uri) -> Result<EstablishedConnection> {
        let host = url
            .host()
            .with_context(|| format!("URL {url} has no host"))?
            .to_string();
        let port = url.port_u16().unwrap_or(443);

        let begin = Instant::now();
        let tcp = TcpStream::connect((host.as_str(), port))
            .await
            .with_context(|| format!("dial error: TCP connect to {host}:{port}"))?;
        tcp.set_nodelay(true)?;
        let fd = tcp.as_raw_fd();
        let peer = tcp.peer_addr()?;
        let tcp_done = Instant::now();

        let server_name = ServerName::try_from(host.clone())
            .with_context(|| format!("TLS error: invalid server name {host}"))?;
        let tls = TlsConnector::from(self.tls.clone())
            .connect(server_name, tcp)
            .await
            .with_context(|| format!("TLS error: handshake with {host}:{port}"))?;
        let tls_done = Instant::now();

        let (send_request, connection) =
            http2::handshake(TokioExecutor::new(), TokioIo::new(tls))
                .await
                .with_context(|| format!("HTTP error: h2 handshake with {host}:{port}"))?;
        let conn_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("connection to {peer} closed: {e}");
            }
        });

        Ok(EstablishedConnection {
            send_request,
            conn_task,
            info: ConnInfo { fd, peer },
            timing: ConnectTiming {
                tcp: tcp_done - begin,
                tls: tls_done - tcp_done,
            },
        })
    }
}

/// Process-wide TLS key log sink, NSS key log format.
///
/// rustls calls [`log`](rustls::KeyLog::log) from whichever task is doing a
/// handshake, so writes are serialised through an internal mutex. One
/// instance is shared by every connection for the life of the process.
#[derive(Debug)]
pub struct KeyLogWriter {
    file: Mutex<File>,
}

impl KeyLogWriter {
    /// Opens `path` for appending
    pub fn create(path: &str) -> Result<Self> {
        let file = File::options()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening key log file {path}"))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl rustls::KeyLog for KeyLogWriter {
    fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
        fn hex(bytes: &[u8]) -> String {
            bytes.iter().map(|b| format!("{b:02x}")).collect()
        }
        let line = format!("{label} {} {}\n", hex(client_random), hex(secret));
        if let Ok(mut file) = self.file.lock() {
            let _ = file.write_all(line.as_bytes());
        }
    }

    fn will_log(&self, _label: &str) -> bool {
        true
    }
}

/// Accepts any server certificate. See the module documentation for why.
#[derive(Debug)]
struct InsecureServerVerifier;

impl ServerCertVerifier for InsecureServerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::{Payload, UnboundedBody, UPLOAD_CHUNK};
    use http_body_util::BodyExt as _;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn unbounded_body_counts_and_stops() {
        let sent = Arc::new(AtomicU64::new(0));
        let scope = CancellationToken::new();
        let mut body = Payload::Unbounded(UnboundedBody::new(sent.clone(), scope.clone()));

        let frame = body.frame().await.expect("a frame").expect("no error");
        assert_eq!(frame.data_ref().expect("data frame").len(), UPLOAD_CHUNK.len());
        let _ = body.frame().await.expect("a frame").expect("no error");
        assert_eq!(sent.load(Ordering::Relaxed), 2 * UPLOAD_CHUNK.len() as u64);

        scope.cancel();
        assert!(body.frame().await.is_none());
    }

    #[tokio::test]
    async fn empty_body_ends_immediately() {
        let mut body = Payload::Empty;
        assert!(http_body::Body::is_end_stream(&body));
        assert!(body.frame().await.is_none());
    }

    #[test]
    fn key_log_writes_nss_format() {
        use rustls::KeyLog as _;
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("keys.log");
        let writer = super::KeyLogWriter::create(path.to_str().expect("utf8")).expect("create");
        writer.log("CLIENT_HANDSHAKE_TRAFFIC_SECRET", &[0xab, 0xcd], &[0x01]);
        let contents = std::fs::read_to_string(&path).expect("read");
        assert_eq!(contents, "CLIENT_HANDSHAKE_TRAFFIC_SECRET abcd 01\n");
    }
}
