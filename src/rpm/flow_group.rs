//! Flow groups: parallel load-generating flows for one direction
// (c) 2024 Ross Younger

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use http::Uri;
use human_repr::HumanThroughput as _;
use tokio::sync::oneshot;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::datalogger::DataLogger;
use crate::lgc::{FlowState, LoadGeneratingConnection};
use crate::rpm::probe::self_prober;
use crate::rpm::{
    is_stable, MovingAverage, ProbeDataPoint, SelfDataCollectionResult, ThroughputDataPoint,
    ADD_FLOWS_STEP, MEASUREMENT_INTERVAL, MOVING_AVERAGE_INTERVALS, PROBE_INTERVAL,
};

/// Creates new load-generating flows for one direction
pub type FlowFactory = Arc<dyn Fn() -> Arc<dyn LoadGeneratingConnection> + Send + Sync>;

type Flows = Arc<Mutex<Vec<Arc<dyn LoadGeneratingConnection>>>>;

/// Runs one direction of load generation plus its self prober.
///
/// Grows the set of flows by [`ADD_FLOWS_STEP`] per measurement interval
/// until the moving-average throughput stabilises, then signals `complete`
/// with `true`. If `collection_scope` is cancelled first, `complete` carries
/// `false` and the eventual result is provisional.
///
/// The result channel fires exactly once, strictly after the complete
/// channel, and only once the collection scope has been cancelled. At that
/// point sampling has stopped but the flows' sockets are still open (they
/// belong to `network_scope`).
pub fn collect_data(
    collection_scope: CancellationToken,
    network_scope: CancellationToken,
    factory: FlowFactory,
    probe_url: Uri,
    self_probe_logger: Arc<dyn DataLogger<ProbeDataPoint>>,
    throughput_logger: Arc<dyn DataLogger<ThroughputDataPoint>>,
    direction: &'static str,
) -> (
    oneshot::Receiver<bool>,
    oneshot::Receiver<SelfDataCollectionResult>,
) {
    let (complete_tx, complete_rx) = oneshot::channel();
    let (result_tx, result_rx) = oneshot::channel();
    let _ = tokio::spawn(run_group(
        collection_scope,
        network_scope,
        factory,
        probe_url,
        self_probe_logger,
        throughput_logger,
        direction,
        complete_tx,
        result_tx,
    ));
    (complete_rx, result_rx)
}

#[allow(clippy::too_many_arguments)]
async fn run_group(
    collection_scope: CancellationToken,
    network_scope: CancellationToken,
    factory: FlowFactory,
    probe_url: Uri,
    self_probe_logger: Arc<dyn DataLogger<ProbeDataPoint>>,
    throughput_logger: Arc<dyn DataLogger<ThroughputDataPoint>>,
    direction: &'static str,
    complete_tx: oneshot::Sender<bool>,
    result_tx: oneshot::Sender<SelfDataCollectionResult>,
) {
    let flows: Flows = Arc::default();
    add_flows(&flows, &factory, &network_scope, direction);

    if !wait_for_first_transfer(&flows, &collection_scope).await {
        // Cancelled before a single byte moved: all we can offer is an empty
        // provisional result.
        let _ = complete_tx.send(false);
        let lgcs = flows.lock().unwrap().clone();
        let _ = result_tx.send(SelfDataCollectionResult {
            rate_bps: 0.0,
            lgcs,
            probe_data_points: Vec::new(),
        });
        return;
    }

    let (prober_task, mut probe_rx) = self_prober(
        collection_scope.clone(),
        flows.clone(),
        probe_url,
        PROBE_INTERVAL,
        self_probe_logger,
        direction,
    );

    let mut ticker = interval_at(Instant::now() + MEASUREMENT_INTERVAL, MEASUREMENT_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut moving_average = MovingAverage::new(MOVING_AVERAGE_INTERVALS);
    let mut previous_average = None;
    let mut previous_total = 0u64;
    let mut last_tick = Instant::now();
    let mut saturated = false;
    let mut complete_tx = Some(complete_tx);

    while !saturated {
        tokio::select! {
            () = collection_scope.cancelled() => break,
            _ = ticker.tick() => (),
        }
        let now = Instant::now();
        let elapsed = (now - last_tick).as_secs_f64();
        last_tick = now;

        let (total, active_connections) = {
            let flows = flows.lock().unwrap();
            (
                flows.iter().map(|f| f.transferred()).sum::<u64>(),
                flows.len(),
            )
        };
        #[allow(clippy::cast_precision_loss)]
        let bytes_per_second = total.saturating_sub(previous_total) as f64 / elapsed;
        previous_total = total;

        throughput_logger.log(&ThroughputDataPoint {
            time: Utc::now(),
            bytes_per_second,
            active_connections,
        });
        moving_average.add(bytes_per_second);
        debug!(
            "{direction}: {} across {active_connections} flows",
            bytes_per_second.human_throughput_bytes()
        );

        if moving_average.is_full() {
            let current = moving_average.average();
            if let Some(previous) = previous_average {
                if is_stable(previous, current) {
                    debug!("{direction}: saturated at {}", current.human_throughput_bytes());
                    saturated = true;
                    if let Some(tx) = complete_tx.take() {
                        let _ = tx.send(true);
                    }
                }
            }
            previous_average = Some(current);
        }
        if !saturated {
            add_flows(&flows, &factory, &network_scope, direction);
        }
    }

    if let Some(tx) = complete_tx.take() {
        // Data collection was cancelled before stability was proven.
        debug!("{direction}: data generation is (provisionally) complete");
        let _ = tx.send(false);
    }

    // The result is only published after data collection has been cancelled;
    // until then the prober keeps contributing samples.
    collection_scope.cancelled().await;
    let _ = prober_task.await;
    let mut probe_data_points = Vec::new();
    while let Ok(point) = probe_rx.try_recv() {
        probe_data_points.push(point);
    }

    let lgcs = flows.lock().unwrap().clone();
    debug!(
        "{direction}: collection complete, {} flows, {} self probes",
        lgcs.len(),
        probe_data_points.len()
    );
    let _ = result_tx.send(SelfDataCollectionResult {
        rate_bps: moving_average.average(),
        lgcs,
        probe_data_points,
    });
}

/// Spawns one growth step of flows. Dialling happens concurrently; each flow
/// joins the set once its transport is up. The set only ever grows.
fn add_flows(
    flows: &Flows,
    factory: &FlowFactory,
    network_scope: &CancellationToken,
    direction: &'static str,
) {
    for _ in 0..ADD_FLOWS_STEP {
        let flow = factory();
        let flows = flows.clone();
        let scope = network_scope.clone();
        let _ = tokio::spawn(async move {
            match flow.start(scope).await {
                Ok(()) => flows.lock().unwrap().push(flow),
                Err(e) => warn!("{direction}: could not start load-generating connection: {e:#}"),
            }
        });
    }
}

/// Waits until at least one flow is moving bytes. False if the collection
/// scope is cancelled first.
async fn wait_for_first_transfer(flows: &Flows, collection_scope: &CancellationToken) -> bool {
    loop {
        {
            let flows = flows.lock().unwrap();
            if flows
                .iter()
                .any(|f| f.transferred() > 0 || f.state() == FlowState::TransferringBytes)
            {
                return true;
            }
        }
        tokio::select! {
            () = collection_scope.cancelled() => return false,
            () = tokio::time::sleep(Duration::from_millis(10)) => (),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datalogger::NullDataLogger;
    use crate::lgc::FlowStats;
    use crate::transport::Payload;
    use anyhow::Result;
    use async_trait::async_trait;
    use hyper::client::conn::http2::SendRequest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Simulates a link with a fixed aggregate capacity, shared out evenly
    /// across however many fake flows have been created.
    struct FakeLink {
        started: Instant,
        aggregate_rate: f64,
        flow_count: AtomicUsize,
    }

    struct FakeFlow {
        link: Arc<FakeLink>,
    }

    #[async_trait]
    impl LoadGeneratingConnection for FakeFlow {
        async fn start(&self, _network_scope: CancellationToken) -> Result<()> {
            Ok(())
        }

        fn transferred(&self) -> u64 {
            let elapsed = (Instant::now() - self.link.started).as_secs_f64();
            let flows = self.link.flow_count.load(Ordering::Relaxed).max(1);
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
            let share = (elapsed * self.link.aggregate_rate / flows as f64) as u64;
            share
        }

        fn state(&self) -> FlowState {
            FlowState::TransferringBytes
        }

        fn is_valid(&self) -> bool {
            true
        }

        fn stats(&self) -> FlowStats {
            FlowStats {
                bytes_transferred: self.transferred(),
                conn_info: None,
            }
        }

        fn probe_handle(&self) -> Option<SendRequest<Payload>> {
            None
        }

        fn close(&self) {}
    }

    fn fake_factory(aggregate_rate: f64) -> FlowFactory {
        let link = Arc::new(FakeLink {
            started: Instant::now(),
            aggregate_rate,
            flow_count: AtomicUsize::new(0),
        });
        Arc::new(move || {
            let _ = link.flow_count.fetch_add(1, Ordering::Relaxed);
            Arc::new(FakeFlow { link: link.clone() }) as Arc<dyn LoadGeneratingConnection>
        })
    }

    fn probe_url() -> Uri {
        "https://example.com/small".parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn constant_rate_link_saturates() {
        let collection = CancellationToken::new();
        let network = CancellationToken::new();
        let (complete, mut result) = collect_data(
            collection.clone(),
            network,
            fake_factory(1_000_000.0),
            probe_url(),
            Arc::new(NullDataLogger),
            Arc::new(NullDataLogger),
            "download",
        );

        let fully_complete = complete.await.expect("complete channel");
        assert!(fully_complete, "a flat-rate link must saturate");

        // The result must not appear until collection is cancelled.
        assert!(matches!(
            result.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ));
        collection.cancel();
        let result = result.await.expect("result channel");

        // Constant aggregate rate: stability strikes on the first comparison
        // (sample 5), after four growth steps on top of the initial wave.
        assert_eq!(result.lgcs.len(), ADD_FLOWS_STEP * 5);
        assert!(
            (result.rate_bps - 1_000_000.0).abs() < 50_000.0,
            "rate {} should be close to the simulated 1MB/s",
            result.rate_bps
        );
        assert!(result.probe_data_points.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_before_saturation_is_provisional() {
        let collection = CancellationToken::new();
        let network = CancellationToken::new();
        let (complete, result) = collect_data(
            collection.clone(),
            network,
            fake_factory(1_000_000.0),
            probe_url(),
            Arc::new(NullDataLogger),
            Arc::new(NullDataLogger),
            "upload",
        );

        // Cancel mid-ramp, before the moving average can fill.
        tokio::time::sleep(Duration::from_millis(2500)).await;
        collection.cancel();

        let fully_complete = complete.await.expect("complete channel");
        assert!(!fully_complete, "early cancellation must be provisional");
        let result = result.await.expect("a provisional result is still produced");
        assert!(result.rate_bps > 0.0);
        assert!(!result.lgcs.is_empty());
    }
}
