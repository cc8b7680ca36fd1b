//! In-process bus simulator
//!
//! A shared medium hosting any number of named endpoints. Clients connected to
//! the same endpoint see each other's publications; clients on different
//! endpoints do not. Every subscribe/unsubscribe/connect is counted so tests
//! can assert on exactly what reached the bus.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::transport::{BusClient, BusConnector, BusMessage};
use super::BusError;

#[derive(Default)]
struct Shared {
    clients: Vec<Arc<SimBusClient>>,
    unreachable: HashSet<String>,
    connects: Vec<String>,
    subscribes: Vec<String>,
    unsubscribes: Vec<String>,
    published: Vec<BusMessage>,
}

/// The simulated bus.
#[derive(Clone, Default)]
pub struct SimBusNetwork {
    shared: Arc<Mutex<Shared>>,
}

impl SimBusNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `endpoint` refuse (or accept again) new connections.
    pub fn set_reachable(&self, endpoint: &str, reachable: bool) {
        if let Ok(mut shared) = self.shared.lock() {
            if reachable {
                shared.unreachable.remove(endpoint);
            } else {
                shared.unreachable.insert(endpoint.to_string());
            }
        }
    }

    /// Publish as a remote device connected to `endpoint`.
    pub fn inject(&self, endpoint: &str, topic: &str, payload: &[u8]) {
        self.deliver(endpoint, BusMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
    }

    /// Endpoints connected to so far, in order.
    pub fn connects(&self) -> Vec<String> {
        self.shared.lock().map(|s| s.connects.clone()).unwrap_or_default()
    }

    /// Number of bus-level subscribe calls for `topic`.
    pub fn subscribe_calls(&self, topic: &str) -> usize {
        self.shared
            .lock()
            .map(|s| s.subscribes.iter().filter(|t| *t == topic).count())
            .unwrap_or(0)
    }

    /// Number of bus-level unsubscribe calls for `topic`.
    pub fn unsubscribe_calls(&self, topic: &str) -> usize {
        self.shared
            .lock()
            .map(|s| s.unsubscribes.iter().filter(|t| *t == topic).count())
            .unwrap_or(0)
    }

    /// Every message published through any client.
    pub fn published(&self) -> Vec<BusMessage> {
        self.shared.lock().map(|s| s.published.clone()).unwrap_or_default()
    }

    /// Number of open client connections.
    pub fn open_clients(&self) -> usize {
        self.shared
            .lock()
            .map(|s| s.clients.iter().filter(|c| c.is_connected()).count())
            .unwrap_or(0)
    }

    fn deliver(&self, endpoint: &str, message: BusMessage) {
        let targets: Vec<Arc<SimBusClient>> = match self.shared.lock() {
            Ok(shared) => shared
                .clients
                .iter()
                .filter(|c| c.endpoint == endpoint && c.is_connected() && c.is_subscribed(&message.topic))
                .cloned()
                .collect(),
            Err(_) => return,
        };
        for client in targets {
            let _ = client.tx.send(message.clone());
        }
    }
}

#[async_trait]
impl BusConnector for SimBusNetwork {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn BusClient>, BusError> {
        let mut shared = self
            .shared
            .lock()
            .map_err(|e| BusError::ConnectionError(e.to_string()))?;
        if shared.unreachable.contains(endpoint) {
            return Err(BusError::ConnectionError(format!("{} unreachable", endpoint)));
        }

        let (tx, _) = broadcast::channel(256);
        let client = Arc::new(SimBusClient {
            id: Uuid::new_v4(),
            endpoint: endpoint.to_string(),
            network: self.clone(),
            topics: Mutex::new(HashSet::new()),
            tx,
            connected: AtomicBool::new(true),
        });
        shared.connects.push(endpoint.to_string());
        shared.clients.push(Arc::clone(&client));
        Ok(client)
    }
}

/// A simulated bus connection.
pub struct SimBusClient {
    id: Uuid,
    endpoint: String,
    network: SimBusNetwork,
    topics: Mutex<HashSet<String>>,
    tx: broadcast::Sender<BusMessage>,
    connected: AtomicBool,
}

impl SimBusClient {
    fn is_subscribed(&self, topic: &str) -> bool {
        self.topics.lock().map(|t| t.contains(topic)).unwrap_or(false)
    }

    fn record<F: FnOnce(&mut Shared)>(&self, f: F) {
        if let Ok(mut shared) = self.network.shared.lock() {
            f(&mut shared);
        }
    }
}

#[async_trait]
impl BusClient for SimBusClient {
    async fn subscribe(&self, topic: &str) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        if let Ok(mut topics) = self.topics.lock() {
            topics.insert(topic.to_string());
        }
        self.record(|s| s.subscribes.push(topic.to_string()));
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        if let Ok(mut topics) = self.topics.lock() {
            topics.remove(topic);
        }
        self.record(|s| s.unsubscribes.push(topic.to_string()));
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        let message = BusMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        };
        self.record(|s| s.published.push(message.clone()));
        self.network.deliver(&self.endpoint, message);
        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        self.connected.store(false, Ordering::SeqCst);
        let id = self.id;
        self.record(|s| s.clients.retain(|c| c.id != id));
        Ok(())
    }

    fn incoming(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
