//! The RPM measurement engine
// (c) 2024 Ross Younger
//!
//! Data model and arithmetic shared by the engine components:
//! [`flow_group`] grows parallel flows until saturation, [`probe`] measures
//! latency on the loaded link, and [`controller`] coordinates the whole test
//! including its staged shutdown.

pub mod controller;
pub mod flow_group;
pub mod probe;

pub use controller::{run, TestOptions, TestReport};

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::lgc::LoadGeneratingConnection;

/// Interval between latency probes, both kinds
pub const PROBE_INTERVAL: Duration = Duration::from_millis(100);
/// Throughput sampling period
pub const MEASUREMENT_INTERVAL: Duration = Duration::from_secs(1);
/// Flows spawned per growth decision
pub const ADD_FLOWS_STEP: usize = 4;
/// Throughput samples in the stability moving average
pub const MOVING_AVERAGE_INTERVALS: usize = 4;
/// Relative moving-average change, in percent, below which throughput is
/// considered stable
pub const STABILITY_DELTA: f64 = 5.0;

/// Which channel a probe was measured on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProbeKind {
    /// Issued over an existing saturating connection
    #[serde(rename = "self")]
    SelfProbe,
    /// Issued on a brand-new connection (TCP + TLS + HTTP)
    #[serde(rename = "foreign")]
    Foreign,
}

/// One completed latency probe. Immutable once produced.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ProbeDataPoint {
    /// Wall-clock start of the probe
    pub time: DateTime<Utc>,
    /// Total observed duration
    #[serde(serialize_with = "serialize_seconds")]
    pub duration: Duration,
    /// Round trips this one measurement spans: 1 for self probes, 3 for
    /// foreign probes (TCP, TLS and HTTP each cost one)
    pub round_trip_count: u32,
    /// Probe channel
    pub kind: ProbeKind,
}

/// One throughput sample. Immutable once produced.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ThroughputDataPoint {
    /// Wall-clock time of the sample
    pub time: DateTime<Utc>,
    /// Instantaneous rate over the just-ended measurement interval
    pub bytes_per_second: f64,
    /// Parallel flows alive when the sample was taken
    pub active_connections: usize,
}

fn serialize_seconds<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// Terminal product of one flow group run
pub struct SelfDataCollectionResult {
    /// Final aggregate rate, bytes per second
    pub rate_bps: f64,
    /// The flows that were alive at the end of data collection. Their
    /// sockets stay open until the network-activity scope is cancelled, so
    /// extended statistics can still be read from them.
    pub lgcs: Vec<Arc<dyn LoadGeneratingConnection>>,
    /// Every self probe observed during generation
    pub probe_data_points: Vec<ProbeDataPoint>,
}

/// Windowed mean used by the saturation check
#[derive(Debug, Clone)]
pub struct MovingAverage {
    window: VecDeque<f64>,
    intervals: usize,
}

impl MovingAverage {
    /// A moving average over the last `intervals` samples
    #[must_use]
    pub fn new(intervals: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(intervals),
            intervals,
        }
    }

    /// Incorporates a sample, evicting the oldest if the window is full
    pub fn add(&mut self, sample: f64) {
        if self.window.len() == self.intervals {
            let _ = self.window.pop_front();
        }
        self.window.push_back(sample);
    }

    /// True once the window holds a full complement of samples
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.window.len() == self.intervals
    }

    /// Mean of the current window; 0 when empty
    #[must_use]
    pub fn average(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let count = self.window.len() as f64;
        self.window.iter().sum::<f64>() / count
    }
}

/// The stability criterion: two consecutive moving averages differ by less
/// than [`STABILITY_DELTA`] percent, relative to the current one.
#[must_use]
pub fn is_stable(previous_average: f64, current_average: f64) -> bool {
    if current_average == 0.0 {
        return false;
    }
    ((current_average - previous_average).abs() / current_average) * 100.0 < STABILITY_DELTA
}

/// Percentile of a sample set: the element at index `⌊p/100 · n⌋` of the
/// sorted samples, clamped. 0 for an empty set.
#[must_use]
pub fn percentile(samples: &[f64], p: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let index = ((p / 100.0) * sorted.len() as f64) as usize;
    sorted[index.min(sorted.len() - 1)]
}

/// Round-trips Per Minute from the two P90 round-trip times (in seconds).
///
/// The responsiveness specification wants the foreign component split as
/// `(tcp_p90 + tls_p90 + http_p90)/3`, but the individual stages are not
/// separable from user space; treating the three as equal collapses that
/// term to the observed per-probe duration.
#[must_use]
pub fn calculate_rpm(self_rtt_p90: f64, foreign_rtt_p90: f64) -> f64 {
    60.0 / ((self_rtt_p90 + foreign_rtt_p90) / 2.0)
}
