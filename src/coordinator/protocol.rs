//! Coordinator wire protocol
//!
//! Every frame is a JSON object discriminated by its `topic` field. Devices
//! register, heartbeat their context together with every flow's pending sync
//! request, and receive batched sync responses and flow deployments.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::ContextQuery;
use crate::graph::FlowGraph;
use crate::link::LinkState;

use super::CoordinatorError;

/// Render a pending entry as `<edgeKey>-<stateCode>`.
pub fn encode_pending(edge_key: &str, state: LinkState) -> String {
    format!("{}-{}", edge_key, state.code())
}

/// Parse a `<edgeKey>-<stateCode>` entry. Edge keys may themselves contain
/// dashes; the code is whatever follows the last one.
pub fn decode_pending(entry: &str) -> Option<(String, LinkState)> {
    let (key, code) = entry.rsplit_once('-')?;
    let state = LinkState::from_code(code.parse().ok()?)?;
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), state))
}

/// One flow's outstanding questions for the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub device_id: String,
    pub flow_id: String,
    /// Unresolved links as `<edgeKey>-<stateCode>`.
    #[serde(default)]
    pub edge_keys: Vec<String>,
    /// Nodes this device offers to keep serving locally.
    #[serde(default)]
    pub contributed_node_ids: Vec<String>,
}

impl SyncRequest {
    /// Build a request, or `None` when there is nothing to ask or offer.
    pub fn build(
        device_id: &str,
        flow_id: &str,
        pending: &BTreeSet<(String, LinkState)>,
        contributions: &BTreeSet<String>,
    ) -> Option<Self> {
        if pending.is_empty() && contributions.is_empty() {
            return None;
        }
        Some(Self {
            device_id: device_id.to_string(),
            flow_id: flow_id.to_string(),
            edge_keys: pending
                .iter()
                .map(|(key, state)| encode_pending(key, *state))
                .collect(),
            contributed_node_ids: contributions.iter().cloned().collect(),
        })
    }

    /// Decoded pending entries; malformed entries are skipped.
    pub fn pending(&self) -> Vec<(String, LinkState)> {
        self.edge_keys
            .iter()
            .filter_map(|entry| {
                let decoded = decode_pending(entry);
                if decoded.is_none() {
                    log::debug!("Ignoring malformed sync entry {}", entry);
                }
                decoded
            })
            .collect()
    }
}

/// The coordinator's answer to one [`SyncRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    /// edgeKey -> topic
    #[serde(default)]
    pub dnr_links: BTreeMap<String, String>,
    #[serde(default)]
    pub brokers: Vec<String>,
}

impl SyncResponse {
    /// Bus endpoint the device should move to, if the coordinator named one.
    pub fn endpoint_override(&self) -> Option<&str> {
        self.brokers.first().map(String::as_str)
    }
}

/// A request echoed back with its response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncExchange {
    #[serde(rename = "dnrSyncReq")]
    pub request: SyncRequest,
    #[serde(rename = "dnrSyncRes")]
    pub response: SyncResponse,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub device_id: String,
    pub context: ContextQuery,
    /// flowId -> pending request
    #[serde(default)]
    pub pending_sync_requests: BTreeMap<String, SyncRequest>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDeployment {
    pub active_flow: FlowGraph,
    /// Ids of every flow that should exist on the device.
    #[serde(default)]
    pub all_flows: Vec<String>,
}

/// One frame on the coordinator channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", rename_all = "snake_case")]
pub enum CoordinatorMessage {
    Register {
        #[serde(rename = "deviceName")]
        device_name: String,
    },
    RegisterAck {
        id: String,
    },
    RegisterReq,
    Heartbeat(Heartbeat),
    SyncResponses {
        #[serde(rename = "dnrSync", default)]
        exchanges: Vec<SyncExchange>,
    },
    FlowDeployed {
        data: FlowDeployment,
    },
}

impl CoordinatorMessage {
    pub fn to_json(&self) -> Result<String, CoordinatorError> {
        serde_json::to_string(self).map_err(|e| CoordinatorError::SerializationError(e.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self, CoordinatorError> {
        serde_json::from_str(raw).map_err(|e| CoordinatorError::SerializationError(e.to_string()))
    }

    /// Short name for logs.
    pub fn topic(&self) -> &'static str {
        match self {
            CoordinatorMessage::Register { .. } => "register",
            CoordinatorMessage::RegisterAck { .. } => "register_ack",
            CoordinatorMessage::RegisterReq => "register_req",
            CoordinatorMessage::Heartbeat(_) => "heartbeat",
            CoordinatorMessage::SyncResponses { .. } => "sync_responses",
            CoordinatorMessage::FlowDeployed { .. } => "flow_deployed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_pending_entry_format() {
        assert_eq!(encode_pending("a_0_c", LinkState::FetchForward), "a_0_c-3");
        assert_eq!(
            decode_pending("n-1_0_n-2-4"),
            Some(("n-1_0_n-2".to_string(), LinkState::ReceiveRedirect))
        );
        assert_eq!(decode_pending("a_0_c-9"), None);
        assert_eq!(decode_pending("a_0_c"), None);
        assert_eq!(decode_pending("-3"), None);
    }

    #[test]
    fn test_sync_request_absent_when_empty() {
        assert!(SyncRequest::build("d1", "f1", &BTreeSet::new(), &BTreeSet::new()).is_none());

        let mut contributions = BTreeSet::new();
        contributions.insert("n1".to_string());
        let request = SyncRequest::build("d1", "f1", &BTreeSet::new(), &contributions).unwrap();
        assert!(request.edge_keys.is_empty());
        assert_eq!(request.contributed_node_ids, vec!["n1".to_string()]);
    }

    #[test]
    fn test_sync_request_json() {
        let mut pending = BTreeSet::new();
        pending.insert(("a_0_c".to_string(), LinkState::FetchForward));
        let request = SyncRequest::build("d1", "f1", &pending, &BTreeSet::new()).unwrap();

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({
                "deviceId": "d1",
                "flowId": "f1",
                "edgeKeys": ["a_0_c-3"],
                "contributedNodeIds": []
            })
        );
        assert_eq!(request.pending(), vec![("a_0_c".to_string(), LinkState::FetchForward)]);
    }

    #[test]
    fn test_parse_sync_responses() {
        let raw = json!({
            "topic": "sync_responses",
            "dnrSync": [{
                "dnrSyncReq": {"deviceId": "d1", "flowId": "f1", "edgeKeys": ["a_0_c-3"], "contributedNodeIds": []},
                "dnrSyncRes": {"dnrLinks": {"a_0_c": "topic-x"}, "brokers": ["ws://other/mqttws"]}
            }]
        })
        .to_string();

        match CoordinatorMessage::from_json(&raw).unwrap() {
            CoordinatorMessage::SyncResponses { exchanges } => {
                assert_eq!(exchanges.len(), 1);
                assert_eq!(exchanges[0].request.flow_id, "f1");
                assert_eq!(exchanges[0].response.dnr_links["a_0_c"], "topic-x");
                assert_eq!(exchanges[0].response.endpoint_override(), Some("ws://other/mqttws"));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_register_frames() {
        let register = CoordinatorMessage::Register {
            device_name: "pi-1".to_string(),
        };
        let value: Value = serde_json::from_str(&register.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"topic": "register", "deviceName": "pi-1"}));

        let ack = CoordinatorMessage::from_json(r#"{"topic":"register_ack","id":"dev-7"}"#).unwrap();
        assert_eq!(ack, CoordinatorMessage::RegisterAck { id: "dev-7".to_string() });

        let req = CoordinatorMessage::from_json(r#"{"topic":"register_req"}"#).unwrap();
        assert_eq!(req.topic(), "register_req");
    }

    #[test]
    fn test_heartbeat_json() {
        let mut pending_sync_requests = BTreeMap::new();
        pending_sync_requests.insert(
            "f1".to_string(),
            SyncRequest {
                device_id: "d1".to_string(),
                flow_id: "f1".to_string(),
                edge_keys: vec!["a_0_c-4".to_string()],
                contributed_node_ids: vec![],
            },
        );
        let heartbeat = CoordinatorMessage::Heartbeat(Heartbeat {
            device_id: "d1".to_string(),
            context: ContextQuery {
                location: None,
                free_mem: 512.0,
                rx_load: 0.0,
                tx_load: 1.5,
                cores: 4,
            },
            pending_sync_requests,
            timestamp: Utc::now(),
        });

        let value: Value = serde_json::from_str(&heartbeat.to_json().unwrap()).unwrap();
        assert_eq!(value["topic"], json!("heartbeat"));
        assert_eq!(value["deviceId"], json!("d1"));
        assert_eq!(value["context"]["freeMem"], json!(512.0));
        assert_eq!(value["pendingSyncRequests"]["f1"]["edgeKeys"], json!(["a_0_c-4"]));
    }

    #[test]
    fn test_unknown_topic_is_error() {
        assert!(matches!(
            CoordinatorMessage::from_json(r#"{"topic":"bogus"}"#),
            Err(CoordinatorError::SerializationError(_))
        ));
    }
}
