//! In-process responsiveness server for end-to-end tests
// (c) 2024 Ross Younger
//!
//! Serves the discovery document plus the three test URLs over HTTP/2 + TLS
//! with a self-signed certificate, on an ephemeral loopback port.

use std::convert::Infallible;
use std::future::Future as _;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body::Frame;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt as _, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls_pki_types::PrivateKeyDer;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

/// The large-download payload is sliced out of this static buffer.
const LARGE_CHUNK_SOURCE: &[u8] = &[0x5a; 64 * 1024];

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// HTTP status served for `/config`
    pub config_status: StatusCode,
    /// Leave `upload_url` out of the discovery document
    pub omit_upload_url: bool,
    /// Artificial service time for `/small`
    pub small_delay: Duration,
    /// Bytes per `/large` chunk (at most 64 KiB)
    pub large_chunk: usize,
    /// Pause between `/large` chunks; zero streams flat out
    pub large_chunk_delay: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            config_status: StatusCode::OK,
            omit_upload_url: false,
            small_delay: Duration::from_millis(5),
            large_chunk: 64 * 1024,
            large_chunk_delay: Duration::ZERO,
        }
    }
}

pub struct TestServer {
    addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(options: ServerOptions) -> Result<Self> {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
        let cert = certified.cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(certified.key_pair.serialize_der().into());
        let mut tls = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)?;
        tls.alpn_protocols = vec![b"h2".to_vec()];
        let acceptor = TlsAcceptor::from(Arc::new(tls));

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let host_port = format!("127.0.0.1:{}", addr.port());
        let options = Arc::new(options);

        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((tcp, _)) = listener.accept().await else {
                    break;
                };
                let acceptor = acceptor.clone();
                let options = options.clone();
                let host_port = host_port.clone();
                let _ = tokio::spawn(async move {
                    let Ok(tls) = acceptor.accept(tcp).await else {
                        return;
                    };
                    let service = service_fn(move |request| {
                        handle(request, options.clone(), host_port.clone())
                    });
                    let _ = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(tls), service)
                        .await;
                });
            }
        });

        Ok(Self { addr, accept_task })
    }

    pub fn host_port(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn handle(
    request: Request<Incoming>,
    options: Arc<ServerOptions>,
    host_port: String,
) -> Result<Response<BoxBody<Bytes, Infallible>>, Infallible> {
    let response = match request.uri().path() {
        "/config" => {
            if options.config_status == StatusCode::OK {
                full_response(StatusCode::OK, config_document(&options, &host_port))
            } else {
                full_response(options.config_status, Bytes::new())
            }
        }
        "/small" => {
            tokio::time::sleep(options.small_delay).await;
            full_response(StatusCode::OK, Bytes::from_static(b"ok"))
        }
        "/large" => Response::new(BoxBody::new(ThrottledBody {
            chunk: options.large_chunk.min(LARGE_CHUNK_SOURCE.len()),
            delay: options.large_chunk_delay,
            sleep: None,
        })),
        "/upload" => {
            // Accept whatever the client manages to send, discarding it.
            let mut body = request.into_body();
            while let Some(frame) = body.frame().await {
                if frame.is_err() {
                    break;
                }
            }
            full_response(StatusCode::OK, Bytes::from_static(b"done"))
        }
        _ => full_response(StatusCode::NOT_FOUND, Bytes::new()),
    };
    Ok(response)
}

fn config_document(options: &ServerOptions, host_port: &str) -> Bytes {
    let mut urls = serde_json::json!({
        "small_https_download_url": format!("https://{host_port}/small"),
        "large_https_download_url": format!("https://{host_port}/large"),
        "upload_url": format!("https://{host_port}/upload"),
    });
    if options.omit_upload_url {
        let _ = urls.as_object_mut().expect("object").remove("upload_url");
    }
    let document = serde_json::json!({ "urls": urls, "source": "test-server" });
    Bytes::from(document.to_string())
}

fn full_response(status: StatusCode, body: Bytes) -> Response<BoxBody<Bytes, Infallible>> {
    Response::builder()
        .status(status)
        .body(Full::new(body).boxed())
        .expect("static response")
}

/// Streams chunks forever, optionally pausing between them; the client ends
/// the transfer by closing its end.
struct ThrottledBody {
    chunk: usize,
    delay: Duration,
    sleep: Option<Pin<Box<tokio::time::Sleep>>>,
}

impl http_body::Body for ThrottledBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
        let this = self.get_mut();
        if !this.delay.is_zero() {
            if this.sleep.is_none() {
                this.sleep = Some(Box::pin(tokio::time::sleep(this.delay)));
            }
            if let Some(sleep) = this.sleep.as_mut() {
                match sleep.as_mut().poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(()) => this.sleep = None,
                }
            }
        }
        Poll::Ready(Some(Ok(Frame::data(Bytes::from_static(
            &LARGE_CHUNK_SOURCE[..this.chunk],
        )))))
    }
}
