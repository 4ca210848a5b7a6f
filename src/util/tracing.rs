//! Tracing helpers
// (c) 2024 Ross Younger

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const STANDARD_ENV_VAR: &str = "RUST_LOG";

/// Result type for `filter_for()`
struct FilterResult {
    filter: EnvFilter,
    used_env: bool, // Did we use the environment variable we were requested to?
}

/// Log filter setup:
/// Use the standard environment variable; if it wasn't present, log only nq items at a given trace level.
fn filter_for(trace_level: &str) -> anyhow::Result<FilterResult> {
    EnvFilter::try_from_env(STANDARD_ENV_VAR)
        .map(|filter| FilterResult {
            filter,
            used_env: true,
        })
        .or_else(|e| {
            // The env var was unset or invalid. Which is it?
            if std::env::var(STANDARD_ENV_VAR).is_ok() {
                anyhow::bail!("{STANDARD_ENV_VAR} (set in environment) was invalid: {e}");
            }
            // It was unset. Fall back.
            Ok(FilterResult {
                filter: EnvFilter::new(format!("nq={trace_level}")),
                used_env: false,
            })
        })
}

/// Set up rust tracing to stderr.
///
/// By default we log only our events (nq), at a given trace level.
/// This can be overridden by setting `RUST_LOG`.
///
/// Diagnostics go to stderr so they cannot disturb the report on stdout,
/// whose format is a stable interface.
///
/// **CAUTION:** If this function fails, tracing won't be set up; callers must take extra care to report the error.
pub fn setup(trace_level: &str) -> anyhow::Result<()> {
    let filter = filter_for(trace_level)?;
    // If we used the environment variable, show log targets; if we did not, we're only logging nq, so do not show targets.
    let format = fmt::layer()
        .compact()
        .with_target(filter.used_env)
        .with_writer(std::io::stderr)
        .with_filter(filter.filter);

    tracing_subscriber::registry().with(format).init();
    Ok(())
}
