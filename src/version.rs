//! Build-time version string
// (c) 2024 Ross Younger

/// Full version string: cargo package version plus git short hash
pub(crate) const VERSION_STRING: &str = env!("NQ_VERSION_STRING");
