// (c) 2024 Ross Younger

//! `nq` measures the responsiveness of an Internet access link while the link
//! is doing work, and reports it in Round-trips Per Minute (RPM).
//!
//! ## Overview
//!
//! Traditional speed tests report throughput on an otherwise idle link.
//! Responsiveness is different: it asks how quickly the link still answers
//! small requests *while saturated in both directions*, which is what most
//! people perceive as the link being "fast" or "slow".
//!
//! A test run looks like this:
//! 1. Fetch a configuration document from a discovery server. It names three
//!    URLs: a very large download, an upload sink, and a small object.
//! 2. Open successive waves of parallel HTTP/2 connections that download the
//!    large object and upload an unbounded body, until aggregate throughput
//!    stops growing (saturation).
//! 3. While the link is loaded, measure latency two ways: *self* probes reuse
//!    a saturating connection, *foreign* probes each open a brand-new
//!    connection (TCP + TLS + HTTP).
//! 4. Shut down in stages so that final throughput figures and per-connection
//!    kernel counters can still be harvested, then reduce the probe samples
//!    to a single RPM figure.
//!
//! The engine lives in [rpm]; the individual load-generating flows are in
//! [lgc]. Everything else is supporting machinery.
//!
//! ## Output
//!
//! The report format on stdout is stable and parse-friendly:
//!
//! ```text
//! Download:  94.521 Mbps ( 11.815 MBps), using 12 parallel connections.
//! Upload:    21.990 Mbps (  2.749 MBps), using 12 parallel connections.
//! RPM:  1714
//! ```

mod cli;
pub use cli::cli; // needs to be re-exported for the binary crate

pub mod config;
pub mod datalogger;
pub mod extendedstats;
pub mod lgc;
pub mod rpm;
pub mod transport;
pub mod util;

mod version;
