//! Bus transport trait definitions
//!
//! Defines the abstract pub/sub client that the simulated bus and any real
//! broker client conform to. A fresh connection remembers nothing: callers
//! re-issue subscriptions after every connect.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::BusError;

/// A message received from, or sent to, the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// An open connection to one bus endpoint.
#[async_trait]
pub trait BusClient: Send + Sync {
    /// Start receiving messages published on `topic`.
    async fn subscribe(&self, topic: &str) -> Result<(), BusError>;

    /// Stop receiving messages published on `topic`.
    async fn unsubscribe(&self, topic: &str) -> Result<(), BusError>;

    /// Publish `payload` on `topic`.
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BusError>;

    /// Close the connection.
    async fn close(&self) -> Result<(), BusError>;

    /// Messages for subscribed topics.
    fn incoming(&self) -> broadcast::Receiver<BusMessage>;

    /// The endpoint this client is connected to.
    fn endpoint(&self) -> &str;

    fn is_connected(&self) -> bool;
}

/// Opens bus connections.
#[async_trait]
pub trait BusConnector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn BusClient>, BusError>;
}
