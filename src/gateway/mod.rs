//! Per-flow gateway
//!
//! A [`FlowGateway`] owns the relocatable links of one loaded flow, moves them
//! between states on every heartbeat and keeps the flow's sync request with
//! the coordinator up to date.

pub mod flow_gateway;

pub use flow_gateway::FlowGateway;

use thiserror::Error;

use crate::bus::BusError;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Node {0} is not part of the flow")]
    UnknownNode(String),

    #[error("No relocatable link {0}")]
    UnknownLink(String),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}
