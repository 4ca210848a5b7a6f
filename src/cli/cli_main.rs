//! Main CLI entrypoint for nq
// (c) 2024 Ross Younger

use std::fs::File;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use chrono::Utc;
use clap::Parser as _;
use tracing::{debug, warn};

use super::args::CliArgs;
use crate::config::Configuration;
use crate::datalogger::Loggers;
use crate::extendedstats;
use crate::rpm::{self, TestOptions};
use crate::transport::{Dialer, KeyLogWriter};
use crate::util::{setup_tracing, to_mbps, to_mbytes_per_second};

/// Breathing room before exit in debug mode, so late task output is not lost
const COOLDOWN_PERIOD: Duration = Duration::from_secs(4);

/// Computes the trace level for a given set of [CliArgs]
fn trace_level(args: &CliArgs) -> &str {
    if args.debug {
        "debug"
    } else {
        "error"
    }
}

/// Main CLI entrypoint
///
/// Call this from `main`. It reads argv.
/// # Exit status
/// 0 indicates success, even if the measured results are poor; non-zero
/// indicates the test could not be run to completion.
#[tokio::main]
pub async fn cli() -> Result<ExitCode> {
    let args = CliArgs::parse();
    setup_tracing(trace_level(&args)).inspect_err(|e| eprintln!("{e:?}"))?;

    let mut extended_stats = args.extended_stats;
    if extended_stats && !extendedstats::extended_stats_available() {
        extended_stats = false;
        warn!("Calculation of extended statistics was requested but they are not supported on this platform");
    }

    // Profiling is opt-in and its file must be writable up front.
    let profiler = args.profile.as_deref().map(Profiler::start).transpose()?;

    let key_log = args.ssl_key_file.as_deref().and_then(|path| {
        match KeyLogWriter::create(path) {
            Ok(writer) => Some(Arc::new(writer)),
            Err(e) => {
                warn!("Could not open the key file for writing: {e:#}");
                None
            }
        }
    });
    let dialer = Dialer::new(key_log);

    let host_port = args.config_host_port();
    let config = Configuration::fetch(&dialer, &host_port, &args.path).await?;
    config.validate().map_err(|e| {
        anyhow!(
            "Invalid configuration returned from {}: {e}",
            config.source
        )
    })?;
    debug!("{config}");

    // The banner and everything after it on stdout is a stable interface.
    println!(
        "{} UTC Responsiveness to {host_port}...",
        Utc::now().format("%m-%d-%Y %H:%M:%S")
    );

    let loggers = Loggers::create(args.logger_filename.as_deref(), Utc::now());
    let options = TestOptions {
        saturation_timeout: args.sattimeout,
        rpm_timeout: args.rpmtimeout,
        extended_stats,
    };

    let report = rpm::run(&config, &options, &loggers, &dialer).await?;

    println!(
        "Download: {:7.3} Mbps ({:7.3} MBps), using {} parallel connections.",
        to_mbps(report.download_rate_bps),
        to_mbytes_per_second(report.download_rate_bps),
        report.download_flows,
    );
    println!(
        "Upload:   {:7.3} Mbps ({:7.3} MBps), using {} parallel connections.",
        to_mbps(report.upload_rate_bps),
        to_mbytes_per_second(report.upload_rate_bps),
        report.upload_flows,
    );
    println!("RPM: {:5.0}", report.rpm);
    if let Some(stats) = &report.extended_stats {
        println!("{stats}");
    }

    loggers.export_and_close();
    if let Some(profiler) = profiler {
        if let Err(e) = profiler.finish() {
            warn!("could not write the CPU profile: {e:#}");
        }
    }

    if args.debug {
        debug!("in debugging mode, we will cool down");
        tokio::time::sleep(COOLDOWN_PERIOD).await;
    }
    Ok(ExitCode::SUCCESS)
}

/// Samples the process for the duration of the run; the report is written as
/// a flamegraph when the run ends.
struct Profiler {
    guard: pprof::ProfilerGuard<'static>,
    file: File,
}

impl Profiler {
    fn start(path: &str) -> Result<Self> {
        let file = File::create(path).with_context(|| {
            format!("Profiling requested with storage in {path} but that file could not be opened")
        })?;
        let guard = pprof::ProfilerGuardBuilder::default()
            .frequency(99)
            .blocklist(&["libc", "libgcc", "pthread", "vdso"])
            .build()
            .context("could not start the CPU profiler")?;
        Ok(Self { guard, file })
    }

    fn finish(self) -> Result<()> {
        let report = self
            .guard
            .report()
            .build()
            .context("building the CPU profile report")?;
        report
            .flamegraph(&self.file)
            .context("writing the CPU profile")?;
        Ok(())
    }
}
