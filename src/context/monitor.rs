//! ContextMonitor — owns the live DeviceContext and keeps it fresh
//!
//! Two background tasks sample the probe: a general snapshot (cores, free
//! memory) and a network-counter read. Network load is half the byte delta
//! between two consecutive counter samples, and zero on the first sample.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;

use super::constraint::GeoPoint;
use super::device::{ContextQuery, DeviceContext};
use super::probe::{NetCounters, ResourceProbe};

/// Sampling cadences.
#[derive(Clone, Debug)]
pub struct SamplingConfig {
    pub snapshot_interval: Duration,
    pub network_interval: Duration,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: Duration::from_secs(5),
            network_interval: Duration::from_secs(2),
        }
    }
}

pub struct ContextMonitor {
    context: RwLock<DeviceContext>,
    probe: Arc<dyn ResourceProbe>,
    last_counters: Mutex<Option<NetCounters>>,
    config: SamplingConfig,
    shutdown_tx: broadcast::Sender<()>,
}

impl ContextMonitor {
    /// Create a monitor. The device id is provisional until the coordinator
    /// assigns one.
    pub fn new(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        location: Option<GeoPoint>,
        probe: Arc<dyn ResourceProbe>,
        config: SamplingConfig,
    ) -> Arc<Self> {
        let mut context = DeviceContext::new(device_id, device_name);
        context.location = location;
        let (shutdown_tx, _) = broadcast::channel(1);

        Arc::new(Self {
            context: RwLock::new(context),
            probe,
            last_counters: Mutex::new(None),
            config,
            shutdown_tx,
        })
    }

    /// Take one sample of each kind, then keep sampling in the background.
    pub async fn start(self: &Arc<Self>) {
        self.refresh_snapshot().await;
        self.refresh_network().await;

        {
            let monitor = Arc::clone(self);
            let interval = self.config.snapshot_interval;
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => monitor.refresh_snapshot().await,
                        _ = shutdown.recv() => break,
                    }
                }
            });
        }

        {
            let monitor = Arc::clone(self);
            let interval = self.config.network_interval;
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => monitor.refresh_network().await,
                        _ = shutdown.recv() => break,
                    }
                }
            });
        }
    }

    /// Stop both sampling tasks.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Re-read cores and free memory. Failures keep the previous values.
    pub async fn refresh_snapshot(&self) {
        let cores = self.probe.cores().await;
        let free_mem = self.probe.free_memory_mb().await;

        let Ok(mut ctx) = self.context.write() else {
            return;
        };
        match cores {
            Ok(cores) => ctx.cores = cores,
            Err(e) => log::warn!("Core count sample failed: {}", e),
        }
        match free_mem {
            Ok(mb) => ctx.free_mem = mb,
            Err(e) => log::warn!("Memory sample failed: {}", e),
        }
        ctx.sampled_at = Utc::now();
    }

    /// Re-read network counters and update rx/tx load.
    pub async fn refresh_network(&self) {
        let current = match self.probe.net_counters().await {
            Ok(c) => c,
            Err(e) => {
                log::warn!("Network counter sample failed: {}", e);
                return;
            }
        };

        let previous = match self.last_counters.lock() {
            Ok(mut last) => last.replace(current),
            Err(_) => return,
        };

        let (rx_load, tx_load) = match previous {
            // Counters can reset when an interface bounces.
            Some(prev) => (
                current.rx_bytes.saturating_sub(prev.rx_bytes) as f64 / 2.0,
                current.tx_bytes.saturating_sub(prev.tx_bytes) as f64 / 2.0,
            ),
            None => (0.0, 0.0),
        };

        if let Ok(mut ctx) = self.context.write() {
            ctx.rx_load = rx_load;
            ctx.tx_load = tx_load;
        }
    }

    /// A copy of the current context.
    pub fn snapshot(&self) -> DeviceContext {
        match self.context.read() {
            Ok(ctx) => ctx.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn query(&self) -> ContextQuery {
        self.snapshot().query()
    }

    pub fn device_id(&self) -> String {
        self.snapshot().device_id
    }

    pub fn set_device_id(&self, device_id: impl Into<String>) {
        if let Ok(mut ctx) = self.context.write() {
            ctx.device_id = device_id.into();
        }
    }

    pub fn set_location(&self, location: Option<GeoPoint>) {
        if let Ok(mut ctx) = self.context.write() {
            ctx.location = location;
        }
    }
}
