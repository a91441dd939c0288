//! OS-level transmitted byte counters

/// Source of a monotonically increasing count of bytes sent by this host
pub trait TxByteCounter: Send + Sync {
    /// Total transmitted bytes, or `None` when the platform does not expose it
    fn total_tx_bytes(&self) -> Option<u64>;
}

/// Reads the host-wide transmit counter of all non-loopback interfaces
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTxCounter;

impl TxByteCounter for SystemTxCounter {
    #[cfg(target_os = "linux")]
    fn total_tx_bytes(&self) -> Option<u64> {
        match std::fs::read_to_string("/proc/net/dev") {
            Ok(content) => parse_proc_net_dev(&content),
            Err(e) => {
                tracing::debug!("Failed to read /proc/net/dev: {}", e);
                None
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn total_tx_bytes(&self) -> Option<u64> {
        None
    }
}

/// Sum the transmit-bytes column of `/proc/net/dev`, skipping loopback
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub(crate) fn parse_proc_net_dev(content: &str) -> Option<u64> {
    let mut total = 0u64;
    let mut seen = false;

    for line in content.lines().skip(2) {
        let Some((iface, stats)) = line.split_once(':') else {
            continue;
        };
        if iface.trim() == "lo" {
            continue;
        }
        // 8 receive columns come first, then tx bytes
        if let Some(tx) = stats.split_whitespace().nth(8) {
            if let Ok(bytes) = tx.parse::<u64>() {
                total = total.saturating_add(bytes);
                seen = true;
            }
        }
    }

    seen.then_some(total)
}
