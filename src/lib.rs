// dnr-agent - Distributed dataflow edge relocation

pub mod agent;
pub mod bus;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod gateway;
pub mod graph;
pub mod link;

pub use agent::{AgentError, ConnectionState, DeviceAgent};
pub use config::AgentConfig;
pub use context::DeviceContext;
pub use gateway::FlowGateway;
pub use graph::{FlowGraph, HostEngine};
pub use link::{LinkCardinality, LinkState};
