//! Resource probes: where the context numbers come from
//!
//! `ProcProbe` reads Linux procfs. `FixedProbe` returns values set by the
//! caller and is used by tests and by hosts that measure resources themselves.

use std::sync::Mutex;

use async_trait::async_trait;

use super::ContextError;

/// Cumulative byte counters of one network interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetCounters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Source of raw resource measurements.
#[async_trait]
pub trait ResourceProbe: Send + Sync {
    /// Number of usable CPU cores.
    async fn cores(&self) -> Result<u32, ContextError>;

    /// Free memory in MB.
    async fn free_memory_mb(&self) -> Result<f64, ContextError>;

    /// Cumulative counters of the monitored network interface.
    async fn net_counters(&self) -> Result<NetCounters, ContextError>;
}

/// Probe backed by `/proc`.
pub struct ProcProbe {
    /// Interface to read; the first non-loopback interface when `None`.
    interface: Option<String>,
}

impl ProcProbe {
    pub fn new(interface: Option<String>) -> Self {
        Self { interface }
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }
}

impl Default for ProcProbe {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl ResourceProbe for ProcProbe {
    async fn cores(&self) -> Result<u32, ContextError> {
        std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .map_err(|e| ContextError::ProbeError(format!("Failed to read core count: {}", e)))
    }

    async fn free_memory_mb(&self) -> Result<f64, ContextError> {
        let meminfo = tokio::fs::read_to_string("/proc/meminfo").await.map_err(|e|
            ContextError::ProbeError(format!("Failed to read /proc/meminfo: {}", e))
        )?;
        parse_meminfo(&meminfo)
    }

    async fn net_counters(&self) -> Result<NetCounters, ContextError> {
        let netdev = tokio::fs::read_to_string("/proc/net/dev").await.map_err(|e|
            ContextError::ProbeError(format!("Failed to read /proc/net/dev: {}", e))
        )?;
        parse_net_dev(&netdev, self.interface.as_deref())
    }
}

/// Extract free memory (MB) from `/proc/meminfo`, preferring `MemAvailable`.
pub(crate) fn parse_meminfo(meminfo: &str) -> Result<f64, ContextError> {
    let field = |name: &str| -> Option<f64> {
        meminfo.lines().find_map(|line| {
            let rest = line.strip_prefix(name)?.strip_prefix(':')?;
            rest.split_whitespace().next()?.parse::<f64>().ok()
        })
    };

    field("MemAvailable")
        .or_else(|| field("MemFree"))
        .map(|kb| kb / 1024.0)
        .ok_or_else(|| ContextError::ProbeError("No MemAvailable/MemFree in /proc/meminfo".to_string()))
}

/// Extract counters for `interface` (or the first non-loopback one) from `/proc/net/dev`.
pub(crate) fn parse_net_dev(netdev: &str, interface: Option<&str>) -> Result<NetCounters, ContextError> {
    // Two header lines, then `iface: rx_bytes rx_packets ... tx_bytes ...`
    for line in netdev.lines().skip(2) {
        let Some((name, stats)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let wanted = match interface {
            Some(iface) => name == iface,
            None => name != "lo",
        };
        if !wanted {
            continue;
        }

        let fields = stats
            .split_whitespace()
            .map(|f| f.parse::<u64>())
            .collect::<Result<Vec<u64>, _>>()
            .map_err(|e| {
                ContextError::ProbeError(format!("Malformed /proc/net/dev counter for {}: {}", name, e))
            })?;
        if fields.len() < 9 {
            return Err(ContextError::ProbeError(format!("Malformed /proc/net/dev line for {}", name)));
        }
        return Ok(NetCounters {
            rx_bytes: fields[0],
            tx_bytes: fields[8],
        });
    }
    Err(ContextError::NoInterface)
}

/// Probe returning caller-provided values.
pub struct FixedProbe {
    cores: Mutex<u32>,
    free_memory_mb: Mutex<f64>,
    counters: Mutex<Option<NetCounters>>,
}

impl FixedProbe {
    pub fn new(cores: u32, free_memory_mb: f64) -> Self {
        Self {
            cores: Mutex::new(cores),
            free_memory_mb: Mutex::new(free_memory_mb),
            counters: Mutex::new(Some(NetCounters::default())),
        }
    }

    pub fn set_cores(&self, cores: u32) {
        if let Ok(mut c) = self.cores.lock() {
            *c = cores;
        }
    }

    pub fn set_free_memory_mb(&self, mb: f64) {
        if let Ok(mut m) = self.free_memory_mb.lock() {
            *m = mb;
        }
    }

    /// `None` makes `net_counters` fail with `NoInterface`.
    pub fn set_counters(&self, counters: Option<NetCounters>) {
        if let Ok(mut c) = self.counters.lock() {
            *c = counters;
        }
    }
}

#[async_trait]
impl ResourceProbe for FixedProbe {
    async fn cores(&self) -> Result<u32, ContextError> {
        self.cores
            .lock()
            .map(|c| *c)
            .map_err(|e| ContextError::ProbeError(e.to_string()))
    }

    async fn free_memory_mb(&self) -> Result<f64, ContextError> {
        self.free_memory_mb
            .lock()
            .map(|m| *m)
            .map_err(|e| ContextError::ProbeError(e.to_string()))
    }

    async fn net_counters(&self) -> Result<NetCounters, ContextError> {
        let counters = self
            .counters
            .lock()
            .map_err(|e| ContextError::ProbeError(e.to_string()))?;
        (*counters).ok_or(ContextError::NoInterface)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NET_DEV: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:  123456     100    0    0    0     0          0         0   123456     100    0    0    0     0       0          0
  eth0: 9000000    7000    0    0    0     0          0         0  4000000    3000    0    0    0     0       0          0
 wlan0:   50000      40    0    0    0     0          0         0    20000      10    0    0    0     0       0          0
";

    #[test]
    fn test_parse_net_dev_skips_loopback() {
        let counters = parse_net_dev(NET_DEV, None).unwrap();
        assert_eq!(counters, NetCounters { rx_bytes: 9000000, tx_bytes: 4000000 });
    }

    #[test]
    fn test_parse_net_dev_named_interface() {
        let counters = parse_net_dev(NET_DEV, Some("wlan0")).unwrap();
        assert_eq!(counters, NetCounters { rx_bytes: 50000, tx_bytes: 20000 });
        assert!(matches!(parse_net_dev(NET_DEV, Some("eth9")), Err(ContextError::NoInterface)));
    }

    #[test]
    fn test_parse_net_dev_rejects_non_numeric_field() {
        let netdev = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
  eth0: 9000000    7000    0    n/a    0     0          0         0  4000000    3000    0    0    0     0       0          0
";
        assert!(matches!(parse_net_dev(netdev, None), Err(ContextError::ProbeError(_))));
    }

    #[test]
    fn test_parse_meminfo_prefers_available() {
        let meminfo = "MemTotal:        8000000 kB\nMemFree:          102400 kB\nMemAvailable:    2048000 kB\n";
        assert_eq!(parse_meminfo(meminfo).unwrap(), 2000.0);

        let old_kernel = "MemTotal:        8000000 kB\nMemFree:          102400 kB\n";
        assert_eq!(parse_meminfo(old_kernel).unwrap(), 100.0);

        assert!(parse_meminfo("garbage").is_err());
    }

    #[tokio::test]
    async fn test_fixed_probe() {
        let probe = FixedProbe::new(2, 256.0);
        assert_eq!(probe.cores().await.unwrap(), 2);
        probe.set_free_memory_mb(64.0);
        assert_eq!(probe.free_memory_mb().await.unwrap(), 64.0);
        probe.set_counters(None);
        assert!(probe.net_counters().await.is_err());
    }
}
