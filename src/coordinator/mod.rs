//! Coordinator channel
//!
//! [`protocol`] defines the frames exchanged with the central coordinator;
//! [`transport`] carries them.

pub mod protocol;
pub mod transport;

pub use protocol::{
    decode_pending, encode_pending, CoordinatorMessage, FlowDeployment, Heartbeat, SyncExchange,
    SyncRequest, SyncResponse,
};
pub use transport::{
    CoordinatorConnection, CoordinatorTransport, Inbound, SimCoordinator, TcpCoordinatorTransport,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Not connected to the coordinator")]
    NotConnected,

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
