//! Kernel-level connection statistics (TCP_INFO)
// (c) 2024 Ross Younger
//!
//! A platform-conditional capability: on Linux the kernel exposes per-socket
//! counters via `getsockopt(TCP_INFO)`; elsewhere this module degrades to a
//! feature probe that answers `false` and an aggregator that refuses input.
//! The counters are only meaningful on a still-open socket, which is why the
//! controller harvests them after sampling stops but before the
//! load-generating sockets close.

use std::fmt::Display;
use std::os::fd::RawFd;

use anyhow::Result;

/// Whether this platform can produce extended statistics at all
#[must_use]
pub fn extended_stats_available() -> bool {
    cfg!(target_os = "linux")
}

/// Accumulates kernel counters across the surviving load-generating
/// connections of a run.
#[derive(Debug, Default)]
pub struct AggregateExtendedStats {
    connections: usize,
    total_retransmissions: u64,
    rtt_sum_us: u64,
    rtt_variance_sum_us: u64,
    max_send_mss: u32,
    max_recv_mss: u32,
}

impl AggregateExtendedStats {
    /// Number of connections incorporated so far
    #[must_use]
    pub fn connections(&self) -> usize {
        self.connections
    }

    /// Reads `TCP_INFO` from an open socket and folds it in
    #[cfg(target_os = "linux")]
    pub fn incorporate(&mut self, fd: RawFd) -> Result<()> {
        use std::mem::size_of;

        let mut info: libc::tcp_info = unsafe { std::mem::zeroed() };
        #[allow(clippy::cast_possible_truncation)]
        let mut len = size_of::<libc::tcp_info>() as libc::socklen_t;
        // SAFETY: fd is an open socket; the kernel writes at most `len` bytes
        // into `info` and updates `len` to what it actually wrote.
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_INFO,
                std::ptr::addr_of_mut!(info).cast::<libc::c_void>(),
                &mut len,
            )
        };
        anyhow::ensure!(
            rc == 0,
            "getsockopt(TCP_INFO) failed: {}",
            std::io::Error::last_os_error()
        );

        self.connections += 1;
        self.total_retransmissions += u64::from(info.tcpi_total_retrans);
        self.rtt_sum_us += u64::from(info.tcpi_rtt);
        self.rtt_variance_sum_us += u64::from(info.tcpi_rttvar);
        self.max_send_mss = self.max_send_mss.max(info.tcpi_snd_mss);
        self.max_recv_mss = self.max_recv_mss.max(info.tcpi_rcv_mss);
        Ok(())
    }

    /// Unsupported here
    #[cfg(not(target_os = "linux"))]
    pub fn incorporate(&mut self, _fd: RawFd) -> Result<()> {
        anyhow::bail!("extended statistics are not supported on this platform")
    }

    fn mean_rtt_us(&self) -> u64 {
        if self.connections == 0 {
            0
        } else {
            self.rtt_sum_us / self.connections as u64
        }
    }

    fn mean_rtt_variance_us(&self) -> u64 {
        if self.connections == 0 {
            0
        } else {
            self.rtt_variance_sum_us / self.connections as u64
        }
    }
}

impl Display for AggregateExtendedStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Extended Statistics:")?;
        writeln!(f, "\tConnections: {}", self.connections)?;
        writeln!(f, "\tMaximum Segment Size (send): {}", self.max_send_mss)?;
        writeln!(f, "\tMaximum Segment Size (receive): {}", self.max_recv_mss)?;
        writeln!(f, "\tTotal Retransmissions: {}", self.total_retransmissions)?;
        writeln!(f, "\tMean RTT (µs): {}", self.mean_rtt_us())?;
        write!(f, "\tMean RTT variance (µs): {}", self.mean_rtt_variance_us())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn availability_matches_platform() {
        assert_eq!(extended_stats_available(), cfg!(target_os = "linux"));
    }

    #[test]
    fn empty_aggregate_displays_zeroes() {
        let stats = AggregateExtendedStats::default();
        let repr = format!("{stats}");
        assert!(repr.starts_with("Extended Statistics:"));
        assert!(repr.contains("Connections: 0"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn incorporates_a_live_socket() {
        use std::net::{TcpListener, TcpStream};
        use std::os::fd::AsRawFd as _;

        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).expect("connect");
        let _server = listener.accept().expect("accept");

        let mut stats = AggregateExtendedStats::default();
        stats.incorporate(client.as_raw_fd()).expect("TCP_INFO");
        assert_eq!(stats.connections(), 1);
    }

    #[cfg(not(target_os = "linux"))]
    #[test]
    fn refuses_input_when_unsupported() {
        let mut stats = AggregateExtendedStats::default();
        assert!(stats.incorporate(0).is_err());
    }
}
