// nq top-level command-line arguments
// (c) 2024 Ross Younger

use clap::Parser;
use tokio::time::Duration;

/// Default responsiveness configuration server
pub(crate) const DEFAULT_CONFIG_HOST: &str = "networkquality.example.com";
/// Default port of the configuration server
pub(crate) const DEFAULT_CONFIG_PORT: u16 = 4043;

fn parse_duration(arg: &str) -> Result<std::time::Duration, std::num::ParseIntError> {
    let seconds = arg.parse()?;
    Ok(std::time::Duration::from_secs(seconds))
}

#[derive(Debug, Parser, Clone)]
#[command(
    author,
    version(crate::version::VERSION_STRING),
    about,
    infer_long_args(true)
)]
pub(crate) struct CliArgs {
    /// Name or IP of the responsiveness configuration server
    #[arg(long, default_value(DEFAULT_CONFIG_HOST), value_name("HOST"), help_heading("Discovery"))]
    pub config: String,

    /// Port number on which to access the responsiveness configuration server
    #[arg(long, default_value_t = DEFAULT_CONFIG_PORT, value_name("PORT"), help_heading("Discovery"))]
    pub port: u16,

    /// Path on the server to the configuration endpoint
    #[arg(long, default_value("config"), value_name("PATH"), help_heading("Discovery"))]
    pub path: String,

    /// Enables debugging output
    #[arg(long, action)]
    pub debug: bool,

    /// Maximum time to spend measuring saturation
    #[arg(long, default_value("20"), value_name("sec"), value_parser = parse_duration, help_heading("Timing"))]
    pub sattimeout: Duration,

    /// Maximum time to spend calculating RPM
    #[arg(long, default_value("10"), value_name("sec"), value_parser = parse_duration, help_heading("Timing"))]
    pub rpmtimeout: Duration,

    /// Appends the per-session TLS secrets to this file, in NSS key log
    /// format, for packet-capture decryption
    #[arg(long("ssl-key-file"), value_name("FILE"), help_heading("Output"))]
    pub ssl_key_file: Option<String>,

    /// Records a CPU profile of the run to this file
    #[arg(long, value_name("FILE"), help_heading("Debug"))]
    pub profile: Option<String>,

    /// Includes kernel connection counters in the report.
    ///
    /// Degrades to a warning on platforms without support.
    #[arg(long("extended-stats"), action, help_heading("Output"))]
    pub extended_stats: bool,

    /// Stores granular information about the test in CSV files with this
    /// basename. Direction and a UTC timestamp are appended (before the
    /// first `.`) to create four separate log files.
    #[arg(long("logger-filename"), value_name("BASE"), help_heading("Output"))]
    pub logger_filename: Option<String>,
}

impl CliArgs {
    /// The `host:port` of the configuration endpoint
    pub(crate) fn config_host_port(&self) -> String {
        format!("{}:{}", self.config, self.port)
    }
}
