//! Load-generating connections
// (c) 2024 Ross Younger
//!
//! A load-generating connection (LGC) is one parallel HTTP/2 flow in one
//! direction: either downloading a very large object or uploading an
//! unbounded body. Flow groups ([`crate::rpm::flow_group`]) own a growing set
//! of these and read their byte counters to decide when the link is
//! saturated.
//!
//! Transport teardown is deliberately separate from stats readout: kernel
//! counters (retransmits, RTT variance) are only meaningful on a still-open
//! socket, yet throughput measurement has already stopped by the time they
//! are read. [`LoadGeneratingConnection::stats`] therefore remains callable
//! after data collection ends, until the network-activity scope closes the
//! sockets.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{ensure, Result};
use async_trait::async_trait;
use http::{Method, Request, Uri};
use http_body_util::BodyExt as _;
use hyper::client::conn::http2::SendRequest;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::transport::{ConnInfo, Dialer, EstablishedConnection, Payload, UnboundedBody};

/// Observable lifecycle of a load-generating flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// Created, not yet dialled
    Pending,
    /// Transport established, request dispatched
    Started,
    /// Payload bytes are moving
    TransferringBytes,
    /// Unrecoverable failure
    Error,
    /// Closed, or the transfer ran to completion
    Stopped,
}

/// Per-flow snapshot. `bytes_transferred` is monotone non-decreasing over the
/// flow's lifetime.
#[derive(Debug, Clone, Copy)]
pub struct FlowStats {
    /// Cumulative payload bytes moved
    pub bytes_transferred: u64,
    /// Transport handle, present while the connection is open
    pub conn_info: Option<ConnInfo>,
}

/// One load-generating flow. The download and upload variants share this
/// capability set; everything here is callable from any task at any
/// frequency.
#[async_trait]
pub trait LoadGeneratingConnection: Send + Sync {
    /// Dials, negotiates TLS and dispatches the load request. Returns once
    /// the transport is set up; the transfer continues asynchronously under
    /// `network_scope`.
    async fn start(&self, network_scope: CancellationToken) -> Result<()>;

    /// Cumulative payload bytes delivered (download) or accepted (upload)
    fn transferred(&self) -> u64;

    /// Current lifecycle state
    fn state(&self) -> FlowState;

    /// False once the flow has seen an unrecoverable error or been closed
    fn is_valid(&self) -> bool;

    /// Snapshot including the transport handle. Callable after
    /// data-collection cancellation, until network-activity cancellation.
    fn stats(&self) -> FlowStats;

    /// Clone of the h2 request handle, for probes multiplexed onto this
    /// flow's connection. None until the flow has started.
    fn probe_handle(&self) -> Option<SendRequest<Payload>>;

    /// Releases the transport
    fn close(&self);
}

/// State shared between an LGC's handle and its transfer task
#[derive(Clone)]
struct FlowShared {
    dialer: Dialer,
    url: Uri,
    transferred: Arc<AtomicU64>,
    state: Arc<Mutex<FlowState>>,
    connection: Arc<Mutex<Option<EstablishedConnection>>>,
}

impl FlowShared {
    fn new(dialer: Dialer, url: Uri) -> Self {
        Self {
            dialer,
            url,
            transferred: Arc::new(AtomicU64::new(0)),
            state: Arc::new(Mutex::new(FlowState::Pending)),
            connection: Arc::new(Mutex::new(None)),
        }
    }

    fn set_state(&self, state: FlowState) {
        *self.state.lock().unwrap() = state;
    }

    fn state(&self) -> FlowState {
        *self.state.lock().unwrap()
    }

    fn fail(&self, what: &str, error: &anyhow::Error) {
        debug!("{what} flow to {} failed: {error:#}", self.url);
        self.set_state(FlowState::Error);
    }

    async fn dial(&self) -> Result<SendRequest<Payload>> {
        let connection = self.dialer.connect(&self.url).await?;
        let send_request = connection.send_request();
        *self.connection.lock().unwrap() = Some(connection);
        self.set_state(FlowState::Started);
        Ok(send_request)
    }

    fn stats(&self) -> FlowStats {
        FlowStats {
            bytes_transferred: self.transferred.load(Ordering::Relaxed),
            conn_info: self.connection.lock().unwrap().as_ref().map(EstablishedConnection::info),
        }
    }

    fn probe_handle(&self) -> Option<SendRequest<Payload>> {
        self.connection
            .lock()
            .unwrap()
            .as_ref()
            .map(EstablishedConnection::send_request)
    }

    fn close(&self) {
        if let Some(connection) = self.connection.lock().unwrap().take() {
            connection.close();
        }
        if self.state() != FlowState::Error {
            self.set_state(FlowState::Stopped);
        }
    }
}

macro_rules! delegate_flow_common {
    () => {
        fn transferred(&self) -> u64 {
            self.shared.transferred.load(Ordering::Relaxed)
        }

        fn state(&self) -> FlowState {
            self.shared.state()
        }

        fn is_valid(&self) -> bool {
            !matches!(self.shared.state(), FlowState::Error | FlowState::Stopped)
        }

        fn stats(&self) -> FlowStats {
            self.shared.stats()
        }

        fn probe_handle(&self) -> Option<SendRequest<Payload>> {
            self.shared.probe_handle()
        }

        fn close(&self) {
            self.shared.close();
        }
    };
}

/// A flow that downloads the large object
pub struct Download {
    shared: FlowShared,
}

impl Download {
    /// Constructor; the flow does not dial until [started](LoadGeneratingConnection::start)
    #[must_use]
    pub fn new(dialer: Dialer, url: Uri) -> Self {
        Self {
            shared: FlowShared::new(dialer, url),
        }
    }
}

#[async_trait]
impl LoadGeneratingConnection for Download {
    async fn start(&self, network_scope: CancellationToken) -> Result<()> {
        let mut send_request = self
            .shared
            .dial()
            .await
            .inspect_err(|e| self.shared.fail("download", e))?;

        let request = Request::builder()
            .method(Method::GET)
            .uri(self.shared.url.clone())
            .body(Payload::Empty)?;

        let shared = self.shared.clone();
        let _ = tokio::spawn(async move {
            let outcome: Result<()> = async {
                send_request.ready().await?;
                let response = tokio::select! {
                    () = network_scope.cancelled() => return Ok(()),
                    r = send_request.send_request(request) => r?,
                };
                ensure!(
                    response.status().is_success(),
                    "server returned status {}",
                    response.status()
                );
                shared.set_state(FlowState::TransferringBytes);
                let mut body = response.into_body();
                loop {
                    tokio::select! {
                        () = network_scope.cancelled() => break,
                        frame = body.frame() => match frame {
                            Some(Ok(frame)) => {
                                if let Some(data) = frame.data_ref() {
                                    let _ = shared
                                        .transferred
                                        .fetch_add(data.len() as u64, Ordering::Relaxed);
                                }
                            }
                            Some(Err(e)) => return Err(e.into()),
                            None => break,
                        }
                    }
                }
                Ok(())
            }
            .await;
            match outcome {
                Ok(()) => shared.close(),
                Err(e) => shared.fail("download", &e),
            }
        });
        Ok(())
    }

    delegate_flow_common!();
}

/// A flow that uploads an unbounded body
pub struct Upload {
    shared: FlowShared,
}

impl Upload {
    /// Constructor; the flow does not dial until [started](LoadGeneratingConnection::start)
    #[must_use]
    pub fn new(dialer: Dialer, url: Uri) -> Self {
        Self {
            shared: FlowShared::new(dialer, url),
        }
    }
}

#[async_trait]
impl LoadGeneratingConnection for Upload {
    async fn start(&self, network_scope: CancellationToken) -> Result<()> {
        let mut send_request = self
            .shared
            .dial()
            .await
            .inspect_err(|e| self.shared.fail("upload", e))?;

        let body = UnboundedBody::new(self.shared.transferred.clone(), network_scope.clone());
        let request = Request::builder()
            .method(Method::PUT)
            .uri(self.shared.url.clone())
            .body(Payload::Unbounded(body))?;

        let shared = self.shared.clone();
        let _ = tokio::spawn(async move {
            let outcome: Result<()> = async {
                send_request.ready().await?;
                let response_future = send_request.send_request(request);
                // Bytes start flowing as soon as hyper pulls the body; the
                // response, if any, only arrives when the server gives up on
                // us or rejects the request.
                shared.set_state(FlowState::TransferringBytes);
                tokio::select! {
                    () = network_scope.cancelled() => (),
                    r = response_future => {
                        let response = r?;
                        ensure!(
                            response.status().is_success(),
                            "server returned status {}",
                            response.status()
                        );
                    }
                }
                Ok(())
            }
            .await;
            match outcome {
                Ok(()) => shared.close(),
                Err(e) => shared.fail("upload", &e),
            }
        });
        Ok(())
    }

    delegate_flow_common!();
}
