//! TopicBroker — reference-counted topic interest over one bus connection
//!
//! Links register interest in topics under a subscriber id. The broker keeps
//! one bus subscription per distinct topic no matter how many local
//! subscribers share it, fans inbound messages out to every local subscriber
//! of the topic, and can migrate the whole subscription table to a new
//! endpoint.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::graph::Message;

use super::transport::{BusClient, BusConnector, BusMessage};
use super::BusError;

/// Invoked once per inbound message on the subscribed topic.
pub type BusCallback = Arc<dyn Fn(&Message) + Send + Sync>;

struct Subscription {
    topic: String,
    callback: BusCallback,
}

struct BrokerState {
    endpoint: String,
    client: Option<Arc<dyn BusClient>>,
    /// subscriber id -> bound topic
    subscriptions: HashMap<String, Subscription>,
    /// topic -> number of local subscribers
    topics: HashMap<String, usize>,
    reader: Option<JoinHandle<()>>,
}

pub struct TopicBroker {
    connector: Arc<dyn BusConnector>,
    state: Mutex<BrokerState>,
}

impl TopicBroker {
    /// Create a broker for `endpoint`. Nothing is connected until [`start`](Self::start).
    pub fn new(connector: Arc<dyn BusConnector>, endpoint: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            connector,
            state: Mutex::new(BrokerState {
                endpoint: endpoint.into(),
                client: None,
                subscriptions: HashMap::new(),
                topics: HashMap::new(),
                reader: None,
            }),
        })
    }

    /// Open the initial connection. On failure the broker stays usable for
    /// bookkeeping and waits for [`reconnect`](Self::reconnect) or
    /// [`update_endpoint`](Self::update_endpoint).
    pub async fn start(self: &Arc<Self>) -> Result<(), BusError> {
        let mut state = self.state.lock().await;
        if state.client.is_some() {
            return Ok(());
        }
        let endpoint = state.endpoint.clone();
        self.connect_locked(&mut state, &endpoint).await
    }

    /// Drop the current connection and connect to the same endpoint again.
    pub async fn reconnect(self: &Arc<Self>) -> Result<(), BusError> {
        let mut state = self.state.lock().await;
        Self::disconnect_locked(&mut state).await;
        let endpoint = state.endpoint.clone();
        self.connect_locked(&mut state, &endpoint).await
    }

    /// Move to `endpoint`, re-subscribing every active topic there.
    ///
    /// Returns `Ok(false)` without touching a live connection when the
    /// endpoint is unchanged. A disconnected broker connects again even when
    /// the endpoint is the same. The new endpoint is only recorded once the
    /// connection to it succeeds.
    pub async fn update_endpoint(self: &Arc<Self>, endpoint: &str) -> Result<bool, BusError> {
        let mut state = self.state.lock().await;
        let live = state.client.as_ref().map(|c| c.is_connected()).unwrap_or(false);
        if state.endpoint == endpoint && live {
            return Ok(false);
        }
        if state.endpoint == endpoint {
            log::info!("Reconnecting bus at {}", endpoint);
        } else {
            log::info!("Migrating bus connection {} -> {}", state.endpoint, endpoint);
        }
        Self::disconnect_locked(&mut state).await;
        self.connect_locked(&mut state, endpoint).await?;
        Ok(true)
    }

    /// Close the connection and stop dispatching.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        Self::disconnect_locked(&mut state).await;
    }

    /// Bind `subscriber_id` to `topic`, replacing any previous binding.
    pub async fn subscribe(&self, subscriber_id: &str, topic: &str, callback: BusCallback) {
        let mut state = self.state.lock().await;

        if let Some(existing) = state.subscriptions.get(subscriber_id) {
            if existing.topic == topic {
                return;
            }
        }
        if let Some(previous) = state.subscriptions.remove(subscriber_id) {
            Self::release_locked(&mut state, &previous.topic).await;
        }

        state.subscriptions.insert(
            subscriber_id.to_string(),
            Subscription {
                topic: topic.to_string(),
                callback,
            },
        );
        let count = state.topics.entry(topic.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 {
            if let Some(client) = &state.client {
                if let Err(e) = client.subscribe(topic).await {
                    log::warn!("Bus subscribe to {} failed: {}", topic, e);
                }
            }
        }
    }

    /// Release whatever `subscriber_id` is bound to. No-op when unbound.
    pub async fn unsubscribe(&self, subscriber_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(previous) = state.subscriptions.remove(subscriber_id) {
            Self::release_locked(&mut state, &previous.topic).await;
        }
    }

    /// Publish a message as-is on `topic`.
    pub async fn publish(&self, topic: &str, message: &Message) -> Result<(), BusError> {
        let payload =
            serde_json::to_vec(message).map_err(|e| BusError::SerializationError(e.to_string()))?;
        let client = {
            let state = self.state.lock().await;
            state.client.clone()
        };
        match client {
            Some(c) => c.publish(topic, &payload).await,
            None => Err(BusError::NotConnected),
        }
    }

    pub async fn endpoint(&self) -> String {
        self.state.lock().await.endpoint.clone()
    }

    pub async fn is_connected(&self) -> bool {
        let state = self.state.lock().await;
        state.client.as_ref().map(|c| c.is_connected()).unwrap_or(false)
    }

    /// Local reference count for `topic`.
    pub async fn topic_refs(&self, topic: &str) -> usize {
        self.state.lock().await.topics.get(topic).copied().unwrap_or(0)
    }

    /// Topic bound to `subscriber_id`, if any.
    pub async fn subscription_of(&self, subscriber_id: &str) -> Option<String> {
        let state = self.state.lock().await;
        state.subscriptions.get(subscriber_id).map(|s| s.topic.clone())
    }

    /// Deliver an inbound message to every local subscriber of its topic.
    pub async fn dispatch(&self, message: &BusMessage) {
        let callbacks: Vec<BusCallback> = {
            let state = self.state.lock().await;
            state
                .subscriptions
                .values()
                .filter(|s| s.topic == message.topic)
                .map(|s| Arc::clone(&s.callback))
                .collect()
        };
        if callbacks.is_empty() {
            return;
        }

        let decoded: Message = match serde_json::from_slice(&message.payload) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("Dropping undecodable message on {}: {}", message.topic, e);
                return;
            }
        };
        for callback in callbacks {
            callback(&decoded);
        }
    }

    async fn connect_locked(self: &Arc<Self>, state: &mut BrokerState, endpoint: &str) -> Result<(), BusError> {
        let client = self.connector.connect(endpoint).await.map_err(|e| {
            log::warn!("Bus connection to {} failed: {}", endpoint, e);
            e
        })?;

        // Listen before re-subscribing so nothing published in between is lost.
        let rx = client.incoming();
        for topic in state.topics.keys() {
            if let Err(e) = client.subscribe(topic).await {
                log::warn!("Bus re-subscribe to {} failed: {}", topic, e);
            }
        }

        state.reader = Some(Self::spawn_reader(Arc::downgrade(self), rx));
        state.client = Some(client);
        state.endpoint = endpoint.to_string();
        log::info!("Connected to bus at {}", endpoint);
        Ok(())
    }

    async fn disconnect_locked(state: &mut BrokerState) {
        if let Some(reader) = state.reader.take() {
            reader.abort();
        }
        if let Some(client) = state.client.take() {
            if let Err(e) = client.close().await {
                log::debug!("Closing bus connection failed: {}", e);
            }
        }
    }

    async fn release_locked(state: &mut BrokerState, topic: &str) {
        let remaining = match state.topics.get_mut(topic) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => return,
        };
        if remaining > 0 {
            return;
        }
        state.topics.remove(topic);
        if let Some(client) = &state.client {
            if let Err(e) = client.unsubscribe(topic).await {
                log::warn!("Bus unsubscribe from {} failed: {}", topic, e);
            }
        }
    }

    fn spawn_reader(broker: Weak<Self>, mut rx: broadcast::Receiver<BusMessage>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => {
                        let Some(broker) = broker.upgrade() else {
                            break;
                        };
                        broker.dispatch(&message).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Bus reader lagged, {} messages skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
