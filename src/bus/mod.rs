//! Message bus layer
//!
//! Provides the bus client traits, an in-process simulated bus for testing,
//! and the reference-counting [`TopicBroker`] that owns the device's single
//! bus connection.

pub mod broker;
pub mod simulated;
pub mod transport;

pub use broker::{BusCallback, TopicBroker};
pub use simulated::SimBusNetwork;
pub use transport::{BusClient, BusConnector, BusMessage};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Not connected to a bus endpoint")]
    NotConnected,

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Bus rejected operation on topic {topic}: {reason}")]
    Rejected { topic: String, reason: String },
}
