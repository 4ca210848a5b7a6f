//! Latency probes over the loaded link
// (c) 2024 Ross Younger
//!
//! Two probe channels run while the link is saturated. *Self* probes reuse a
//! saturating connection, so they measure how the loaded flows themselves are
//! treated. *Foreign* probes pay for a fresh TCP + TLS + HTTP exchange every
//! time, so they measure what a new arrival experiences.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{ensure, Context as _, Result};
use chrono::Utc;
use http::{Method, Request, Uri};
use http_body_util::BodyExt as _;
use hyper::client::conn::http2::SendRequest;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::datalogger::DataLogger;
use crate::lgc::LoadGeneratingConnection;
use crate::rpm::{ProbeDataPoint, ProbeKind};
use crate::transport::{Dialer, Payload};

type Flows = Arc<Mutex<Vec<Arc<dyn LoadGeneratingConnection>>>>;

/// Issues a small request over a designated saturating flow at every probe
/// interval, publishing one [`ProbeDataPoint`] per completed probe.
///
/// The designated flow is the first healthy one; if it becomes invalid the
/// prober re-selects, and idles when none qualifies. Stops at
/// `collection_scope` cancellation; a probe in flight at that moment is
/// abandoned unrecorded.
pub(crate) fn self_prober(
    collection_scope: CancellationToken,
    flows: Flows,
    probe_url: Uri,
    interval: Duration,
    logger: Arc<dyn DataLogger<ProbeDataPoint>>,
    direction: &'static str,
) -> (JoinHandle<()>, mpsc::UnboundedReceiver<ProbeDataPoint>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = collection_scope.cancelled() => break,
                _ = ticker.tick() => (),
            }
            // Re-selects every tick: the designated flow may have died.
            let handle = {
                let flows = flows.lock().unwrap();
                flows
                    .iter()
                    .find(|f| f.is_valid())
                    .and_then(|f| f.probe_handle())
            };
            let Some(handle) = handle else {
                continue;
            };

            let time = Utc::now();
            let begin = Instant::now();
            let outcome = tokio::select! {
                () = collection_scope.cancelled() => break,
                r = send_probe(handle, &probe_url) => r,
            };
            match outcome {
                Ok(()) => {
                    let point = ProbeDataPoint {
                        time,
                        duration: begin.elapsed(),
                        round_trip_count: 1,
                        kind: ProbeKind::SelfProbe,
                    };
                    logger.log(&point);
                    if tx.send(point).is_err() {
                        break;
                    }
                }
                Err(e) => debug!("{direction}: self probe dropped: {e:#}"),
            }
        }
    });
    (task, rx)
}

/// Opens a brand-new connection per probe: dial, TLS, one small request,
/// teardown. One sample covers three round trips.
///
/// Ticks are skipped while the previous probe is still in flight, so probes
/// never stack. Points accumulate in the returned channel until the
/// controller drains it after shutdown.
pub(crate) fn foreign_prober(
    scope: CancellationToken,
    dialer: Dialer,
    probe_url: Uri,
    interval: Duration,
    logger: Arc<dyn DataLogger<ProbeDataPoint>>,
) -> mpsc::UnboundedReceiver<ProbeDataPoint> {
    let (tx, rx) = mpsc::unbounded_channel();
    let _ = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut in_flight: Option<JoinHandle<()>> = None;
        loop {
            tokio::select! {
                () = scope.cancelled() => break,
                _ = ticker.tick() => (),
            }
            if in_flight.as_ref().is_some_and(|probe| !probe.is_finished()) {
                continue;
            }

            let dialer = dialer.clone();
            let probe_url = probe_url.clone();
            let logger = logger.clone();
            let tx = tx.clone();
            let scope = scope.clone();
            in_flight = Some(tokio::spawn(async move {
                let time = Utc::now();
                let begin = Instant::now();
                let outcome = tokio::select! {
                    () = scope.cancelled() => return,
                    r = foreign_probe_once(&dialer, &probe_url) => r,
                };
                match outcome {
                    Ok(()) => {
                        let point = ProbeDataPoint {
                            time,
                            duration: begin.elapsed(),
                            round_trip_count: 3,
                            kind: ProbeKind::Foreign,
                        };
                        logger.log(&point);
                        let _ = tx.send(point);
                    }
                    Err(e) => debug!("foreign probe dropped: {e:#}"),
                }
            }));
        }
    });
    rx
}

async fn foreign_probe_once(dialer: &Dialer, probe_url: &Uri) -> Result<()> {
    let connection = dialer.connect(probe_url).await?;
    let timing = connection.timing();
    send_probe(connection.send_request(), probe_url).await?;
    debug!(
        "foreign probe: tcp {:?}, tls {:?}",
        timing.tcp, timing.tls
    );
    // Dropping the connection tears it down; the next probe pays full price.
    Ok(())
}

/// One small request-response exchange on an established connection
pub(crate) async fn send_probe(mut handle: SendRequest<Payload>, probe_url: &Uri) -> Result<()> {
    handle.ready().await.context("probe connection not ready")?;
    let request = Request::builder()
        .method(Method::GET)
        .uri(probe_url.clone())
        .body(Payload::Empty)?;
    let response = handle
        .send_request(request)
        .await
        .context("probe request failed")?;
    ensure!(
        response.status().is_success(),
        "probe returned status {}",
        response.status()
    );
    let mut body = response.into_body();
    while let Some(frame) = body.frame().await {
        let _ = frame.context("probe response failed")?;
    }
    Ok(())
}
