//! The host graph engine, as seen from the agent

use std::collections::HashSet;
use std::sync::Mutex;

use super::Message;

/// Runs ordinary nodes and wires. The agent only ever hands it messages for
/// local nodes and asks which node types it can run.
pub trait HostEngine: Send + Sync {
    /// Feed `message` into node `node_id` of flow `flow_id`.
    fn deliver(&self, flow_id: &str, node_id: &str, message: Message);

    /// Node types installed on this host.
    fn installed_types(&self) -> HashSet<String>;
}

/// One message handed to the host.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub flow_id: String,
    pub node_id: String,
    pub message: Message,
}

/// Host that records deliveries instead of running anything.
#[derive(Default)]
pub struct RecordingHost {
    installed: HashSet<String>,
    deliveries: Mutex<Vec<Delivery>>,
}

impl RecordingHost {
    pub fn new<I, S>(installed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            installed: installed.into_iter().map(Into::into).collect(),
            deliveries: Mutex::new(Vec::new()),
        }
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().map(|d| d.clone()).unwrap_or_default()
    }

    /// Messages delivered to `node_id`, in arrival order.
    pub fn delivered_to(&self, node_id: &str) -> Vec<Message> {
        self.deliveries()
            .into_iter()
            .filter(|d| d.node_id == node_id)
            .map(|d| d.message)
            .collect()
    }
}

impl HostEngine for RecordingHost {
    fn deliver(&self, flow_id: &str, node_id: &str, message: Message) {
        log::debug!("Host delivery {}/{}", flow_id, node_id);
        if let Ok(mut deliveries) = self.deliveries.lock() {
            deliveries.push(Delivery {
                flow_id: flow_id.to_string(),
                node_id: node_id.to_string(),
                message,
            });
        }
    }

    fn installed_types(&self) -> HashSet<String> {
        self.installed.clone()
    }
}
