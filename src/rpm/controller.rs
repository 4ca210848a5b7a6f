//! Test controller: runs both directions, probes, timeouts and the staged
//! shutdown
// (c) 2024 Ross Younger
//!
//! The controller owns a small tree of cancellation scopes:
//!
//! ```text
//! operating ─┬─ data collection   (stop measuring)
//!            ├─ network activity  (close the load-generating sockets)
//!            └─ foreign prober    (stop foreign probing)
//! ```
//!
//! The shutdown order is load-bearing. Data collection stops first so the
//! final numbers are frozen; the foreign prober stops next; kernel counters
//! are then read from the still-open sockets; only after that does network
//! activity stop and close them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use http::Uri;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Configuration;
use crate::datalogger::Loggers;
use crate::extendedstats::AggregateExtendedStats;
use crate::lgc::{Download, LoadGeneratingConnection, Upload};
use crate::rpm::flow_group::{self, FlowFactory};
use crate::rpm::{
    calculate_rpm, percentile, probe, SelfDataCollectionResult, PROBE_INTERVAL,
};
use crate::transport::Dialer;
use crate::util::timeout_at;

/// Tunables for one test run
#[derive(Debug, Clone, Copy)]
pub struct TestOptions {
    /// Maximum time to spend driving the link towards saturation
    pub saturation_timeout: Duration,
    /// Maximum time to spend collecting results (also the grace period for
    /// provisional data after a saturation timeout)
    pub rpm_timeout: Duration,
    /// Harvest kernel counters from the load-generating connections
    pub extended_stats: bool,
}

/// Everything a finished run produced
pub struct TestReport {
    /// Final download rate, bytes per second
    pub download_rate_bps: f64,
    /// Parallel download connections at the end of collection
    pub download_flows: usize,
    /// Final upload rate, bytes per second
    pub upload_rate_bps: f64,
    /// Parallel upload connections at the end of collection
    pub upload_flows: usize,
    /// Number of self probes across both directions
    pub self_probe_count: usize,
    /// Number of foreign probes
    pub foreign_probe_count: usize,
    /// P90 of self probe round-trip times, seconds
    pub self_rtt_p90: f64,
    /// P90 of foreign probe round-trip times, seconds
    pub foreign_rtt_p90: f64,
    /// Round-trips Per Minute
    pub rpm: f64,
    /// Kernel counters, when requested and supported
    pub extended_stats: Option<AggregateExtendedStats>,
}

/// Runs a complete responsiveness test against a validated configuration.
///
/// Returns an error only for the two fatal cases: the saturation timeout
/// expired with no provisional data, or results never arrived after data
/// collection was cancelled. Poor results are still results.
pub async fn run(
    config: &Configuration,
    options: &TestOptions,
    loggers: &Loggers,
    dialer: &Dialer,
) -> Result<TestReport> {
    let small_url: Uri = config.urls.small_https_download_url.parse()?;
    let large_url: Uri = config.urls.large_https_download_url.parse()?;
    let upload_url: Uri = config.urls.upload_url.parse()?;

    let operating_scope = CancellationToken::new();
    // Everything below dies with the run, including the early-error paths.
    let _operating_guard = operating_scope.clone().drop_guard();
    let collection_scope = operating_scope.child_token();
    let network_scope = operating_scope.child_token();
    let foreign_scope = operating_scope.child_token();

    let mut timeout_rx = timeout_at(
        &operating_scope,
        Instant::now() + options.saturation_timeout,
    );

    let download_factory: FlowFactory = {
        let dialer = dialer.clone();
        Arc::new(move || {
            Arc::new(Download::new(dialer.clone(), large_url.clone()))
                as Arc<dyn LoadGeneratingConnection>
        })
    };
    let upload_factory: FlowFactory = {
        let dialer = dialer.clone();
        Arc::new(move || {
            Arc::new(Upload::new(dialer.clone(), upload_url.clone()))
                as Arc<dyn LoadGeneratingConnection>
        })
    };

    let (mut download_complete, mut download_result) = flow_group::collect_data(
        collection_scope.clone(),
        network_scope.clone(),
        download_factory,
        small_url.clone(),
        loggers.self_probe.clone(),
        loggers.download_throughput.clone(),
        "download",
    );
    let (mut upload_complete, mut upload_result) = flow_group::collect_data(
        collection_scope.clone(),
        network_scope.clone(),
        upload_factory,
        small_url.clone(),
        loggers.self_probe.clone(),
        loggers.upload_throughput.clone(),
        "upload",
    );
    let mut foreign_rx = probe::foreign_prober(
        foreign_scope.clone(),
        dialer.clone(),
        small_url,
        PROBE_INTERVAL,
        loggers.foreign_probe.clone(),
    );

    // Stage 1-2: wait for both directions to signal saturation. On a first
    // timeout, stop collection and rearm the timer, hoping for provisional
    // completions; a second timeout is fatal.
    let mut download_done = false;
    let mut upload_done = false;
    let mut collection_timed_out = false;
    while !(download_done && upload_done) {
        tokio::select! {
            r = &mut download_complete, if !download_done => {
                download_done = true;
                let fully = r.unwrap_or(false);
                debug!("download data generation is {}complete", if fully { "" } else { "(provisionally) " });
            }
            r = &mut upload_complete, if !upload_done => {
                upload_done = true;
                let fully = r.unwrap_or(false);
                debug!("upload data generation is {}complete", if fully { "" } else { "(provisionally) " });
            }
            _ = &mut timeout_rx => {
                if collection_timed_out {
                    bail!("Load-generating data collection could not be completed in time and no provisional data could be gathered. Test failed.");
                }
                collection_timed_out = true;
                debug!("timed out waiting for saturation; collecting provisional data");
                collection_scope.cancel();
                timeout_rx = timeout_at(&operating_scope, Instant::now() + options.rpm_timeout);
            }
        }
    }

    // Stage 3: stop measuring. The flows keep transferring; only the
    // emission of new samples ends here.
    debug!("stopping load-generating data collection");
    collection_scope.cancel();

    // Stage 4: stop foreign probing.
    debug!("stopping foreign probers");
    foreign_scope.cancel();

    // Stage 5: collect the final results, against a fresh deadline.
    let mut timeout_rx = timeout_at(&operating_scope, Instant::now() + options.rpm_timeout);
    let mut download_collection: Option<SelfDataCollectionResult> = None;
    let mut upload_collection: Option<SelfDataCollectionResult> = None;
    while download_collection.is_none() || upload_collection.is_none() {
        tokio::select! {
            r = &mut download_result, if download_collection.is_none() => {
                match r {
                    Ok(result) => {
                        debug!("download data collection is complete ({} flows)", result.lgcs.len());
                        download_collection = Some(result);
                    }
                    Err(_) => bail!("Load-generating data collection could not be completed. Test failed."),
                }
            }
            r = &mut upload_result, if upload_collection.is_none() => {
                match r {
                    Ok(result) => {
                        debug!("upload data collection is complete ({} flows)", result.lgcs.len());
                        upload_collection = Some(result);
                    }
                    Err(_) => bail!("Load-generating data collection could not be completed. Test failed."),
                }
            }
            _ = &mut timeout_rx => {
                bail!("Load-generating data collection could not be completed in time and no provisional data could be gathered. Test failed.");
            }
        }
    }
    let (Some(download_collection), Some(upload_collection)) =
        (download_collection, upload_collection)
    else {
        bail!("Load-generating data collection could not be completed. Test failed.");
    };

    // Stage 6: while the sockets are still open, read their kernel counters.
    let extended_stats = options
        .extended_stats
        .then(|| harvest_extended_stats([&download_collection, &upload_collection]));

    // Stage 7: now, and only now, stop the load-generating network activity.
    debug!("stopping load-generating network activity");
    network_scope.cancel();

    // Stage 8: the foreign prober has stopped; drain what it left behind.
    let mut foreign_points = Vec::new();
    while let Some(point) = foreign_rx.recv().await {
        foreign_points.push(point);
    }

    // Stage 9: reduce to RPM.
    let self_rtts: Vec<f64> = download_collection
        .probe_data_points
        .iter()
        .chain(&upload_collection.probe_data_points)
        .map(|p| p.duration.as_secs_f64())
        .collect();
    let foreign_rtts: Vec<f64> = foreign_points
        .iter()
        .map(|p| p.duration.as_secs_f64())
        .collect();
    let self_rtt_p90 = percentile(&self_rtts, 90.0);
    let foreign_rtt_p90 = percentile(&foreign_rtts, 90.0);
    let rpm = calculate_rpm(self_rtt_p90, foreign_rtt_p90);
    debug!(
        "total load-generating round trips: {}, total new-connection round trips: {}, P90 self RTT: {self_rtt_p90:.6}s, P90 foreign RTT: {foreign_rtt_p90:.6}s",
        self_rtts.len(),
        foreign_rtts.len(),
    );

    // Stage 10: tear the rest down.
    operating_scope.cancel();

    Ok(TestReport {
        download_rate_bps: download_collection.rate_bps,
        download_flows: download_collection.lgcs.len(),
        upload_rate_bps: upload_collection.rate_bps,
        upload_flows: upload_collection.lgcs.len(),
        self_probe_count: self_rtts.len(),
        foreign_probe_count: foreign_rtts.len(),
        self_rtt_p90,
        foreign_rtt_p90,
        rpm,
        extended_stats,
    })
}

/// Stage 6 worker: the sockets listed in the results are still open because
/// the network-activity scope has not yet been cancelled.
fn harvest_extended_stats(results: [&SelfDataCollectionResult; 2]) -> AggregateExtendedStats {
    let mut aggregate = AggregateExtendedStats::default();
    for result in results {
        for lgc in &result.lgcs {
            match lgc.stats().conn_info {
                Some(info) => {
                    if let Err(e) = aggregate.incorporate(info.fd) {
                        warn!("Could not add extended stats for the connection: {e}");
                    }
                }
                None => warn!("Could not add extended stats for the connection: already closed"),
            }
        }
    }
    aggregate
}
