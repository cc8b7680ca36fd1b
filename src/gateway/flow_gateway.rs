//! FlowGateway — relocation state for one flow

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::bus::{BusCallback, TopicBroker};
use crate::context::DeviceContext;
use crate::coordinator::{SyncRequest, SyncResponse};
use crate::graph::{FlowGraph, HostEngine, Message};
use crate::link::{
    contribution_for, reason, EdgeKey, LinkCardinality, LinkState, RelocatableLink, TopicBinding,
};

use super::GatewayError;

pub struct FlowGateway {
    flow_id: String,
    device_id: String,
    graph: FlowGraph,
    /// edgeKey -> link
    links: BTreeMap<String, RelocatableLink>,
    broker: Arc<TopicBroker>,
    host: Arc<dyn HostEngine>,
    /// Links waiting for the coordinator to name their topic.
    pending: BTreeSet<(String, LinkState)>,
    /// Nodes offered to the coordinator as served locally.
    contributions: BTreeSet<String>,
    sync_request: Option<SyncRequest>,
}

impl FlowGateway {
    pub fn new(graph: FlowGraph, broker: Arc<TopicBroker>, host: Arc<dyn HostEngine>) -> Self {
        Self {
            flow_id: graph.id.clone(),
            device_id: String::new(),
            graph,
            links: BTreeMap::new(),
            broker,
            host,
            pending: BTreeSet::new(),
            contributions: BTreeSet::new(),
            sync_request: None,
        }
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn graph(&self) -> &FlowGraph {
        &self.graph
    }

    pub fn link(&self, edge_key: &str) -> Option<&RelocatableLink> {
        self.links.get(edge_key)
    }

    pub fn links(&self) -> impl Iterator<Item = &RelocatableLink> {
        self.links.values()
    }

    pub fn pending(&self) -> &BTreeSet<(String, LinkState)> {
        &self.pending
    }

    pub fn contributions(&self) -> &BTreeSet<String> {
        &self.contributions
    }

    /// The request to piggyback on the next heartbeat, if any.
    pub fn sync_request(&self) -> Option<&SyncRequest> {
        self.sync_request.as_ref()
    }

    /// Register one edge. The cardinality is inferred from the wiring when
    /// not given. Registering an edge twice is a no-op.
    pub fn register_link(
        &mut self,
        edge: EdgeKey,
        cardinality: Option<LinkCardinality>,
    ) -> Result<(), GatewayError> {
        for node in [&edge.predecessor, &edge.successor] {
            if self.graph.node(node).is_none() {
                return Err(GatewayError::UnknownNode(node.clone()));
            }
        }
        let key = edge.to_string();
        if self.links.contains_key(&key) {
            return Ok(());
        }
        let cardinality = cardinality.unwrap_or_else(|| self.graph.cardinality(&edge));
        log::debug!("Registered {} link {} in flow {}", cardinality, key, self.flow_id);
        self.links.insert(key, RelocatableLink::new(edge, cardinality));
        Ok(())
    }

    /// Register every wired edge of the current graph. Returns the number of
    /// links now held.
    pub fn register_all_edges(&mut self) -> usize {
        for edge in self.graph.edges() {
            if let Err(e) = self.register_link(edge, None) {
                log::warn!("Skipping edge in flow {}: {}", self.flow_id, e);
            }
        }
        self.links.len()
    }

    /// Swap in a new graph snapshot and pick up any new edges. Links whose
    /// nodes disappeared are kept but skipped by [`heartbeat`](Self::heartbeat).
    pub fn update_graph(&mut self, graph: FlowGraph) {
        self.graph = graph;
        self.register_all_edges();
    }

    /// Re-evaluate every link against `context`, rebinding the ones whose
    /// state changed, then rebuild the sync request.
    ///
    /// When the device id changed since the last pass, links on topics derived
    /// from the old id move to the new one without changing state.
    pub async fn heartbeat(&mut self, context: &DeviceContext) {
        let id_changed = self.device_id != context.device_id;
        if id_changed && !self.device_id.is_empty() {
            log::info!(
                "Flow {} device id {} -> {}",
                self.flow_id,
                self.device_id,
                context.device_id
            );
        }
        self.device_id = context.device_id.clone();

        let keys: Vec<String> = self.links.keys().cloned().collect();
        for key in keys {
            let Some(desired) = self.desired_state(&key, context) else {
                continue;
            };
            let unchanged = self.links.get(&key).map(|l| l.state() == desired).unwrap_or(true);
            if !unchanged {
                self.enter_state(&key, desired).await;
            } else if id_changed {
                self.refresh_derived_topic(&key).await;
            }
        }

        self.rebuild_sync_request();
    }

    /// Apply the coordinator's answer to `request`.
    ///
    /// Only entries that are still pending with the state named in the
    /// request are bound; anything else is stale and ignored.
    pub async fn process_sync_response(
        &mut self,
        request: &SyncRequest,
        response: &SyncResponse,
    ) -> Result<(), GatewayError> {
        if request.flow_id != self.flow_id {
            log::debug!("Sync response for flow {} ignored by {}", request.flow_id, self.flow_id);
            return Ok(());
        }

        let requested: BTreeMap<String, LinkState> = request.pending().into_iter().collect();
        for (key, topic) in &response.dnr_links {
            let Some(state) = requested.get(key).copied() else {
                log::debug!("Unrequested link {} in sync response", key);
                continue;
            };
            let entry = (key.clone(), state);
            if !self.pending.contains(&entry) {
                log::debug!("Stale sync entry {}-{}", key, state.code());
                continue;
            }
            if self.links.get(key).map(|l| l.state()) != Some(state) {
                continue;
            }
            self.bind(key, topic).await;
            self.pending.remove(&entry);
        }

        for node in &request.contributed_node_ids {
            self.contributions.remove(node);
        }

        let result = match response.endpoint_override() {
            Some(endpoint) => self.broker.update_endpoint(endpoint).await.map(|_| ()),
            None => Ok(()),
        };
        self.rebuild_sync_request();
        result.map_err(GatewayError::from)
    }

    /// Handle a message the predecessor emitted on `edge_key`.
    pub async fn route(&self, edge_key: &str, message: Message) -> Result<(), GatewayError> {
        let link = self
            .links
            .get(edge_key)
            .ok_or_else(|| GatewayError::UnknownLink(edge_key.to_string()))?;
        let state = link.state();

        if state.delivers_locally() {
            self.host
                .deliver(&self.flow_id, &link.edge().successor, message.clone());
        }
        if state.publishes() {
            match link.publish_topic() {
                Some(topic) => self.broker.publish(topic, &message).await?,
                None => log::debug!("Link {} has no topic yet, message not relayed", edge_key),
            }
        }
        Ok(())
    }

    /// Release every topic this flow holds.
    pub async fn close(&mut self) {
        for key in self.links.keys() {
            self.broker.unsubscribe(&self.subscriber_id(key)).await;
        }
        self.pending.clear();
        self.contributions.clear();
        self.sync_request = None;
        log::info!("Closed gateway for flow {}", self.flow_id);
    }

    fn desired_state(&self, key: &str, context: &DeviceContext) -> Option<LinkState> {
        let link = self.links.get(key)?;
        let edge = link.edge();
        let (Some(predecessor), Some(successor)) =
            (self.graph.node(&edge.predecessor), self.graph.node(&edge.successor))
        else {
            log::debug!("Link {} references a missing node, skipped", key);
            return None;
        };
        Some(reason(
            context,
            &predecessor.constraints,
            &successor.constraints,
            link.cardinality(),
        ))
    }

    async fn enter_state(&mut self, key: &str, state: LinkState) {
        let (edge, previous, binding) = match self.links.get_mut(key) {
            Some(link) => {
                let previous = link.transition(state);
                let binding = link.binding_for(state, &self.device_id);
                (link.edge().clone(), previous, binding)
            }
            None => return,
        };
        log::info!("Flow {} link {}: {} -> {}", self.flow_id, key, previous, state);

        self.broker.unsubscribe(&self.subscriber_id(key)).await;
        self.pending.retain(|(k, _)| k != key);

        if let Some(node) = contribution_for(&edge, previous) {
            let still_held = self.links.values().any(|l| l.contribution() == Some(node));
            if !still_held {
                self.contributions.remove(node);
            }
        }
        if let Some(node) = contribution_for(&edge, state) {
            self.contributions.insert(node.to_string());
        }

        match binding {
            TopicBinding::Unbound => {}
            TopicBinding::Derived(topic) => self.bind(key, &topic).await,
            TopicBinding::Coordinator => {
                self.pending.insert((key.to_string(), state));
            }
        }
    }

    /// Rebind a link whose derived topic no longer matches the device id.
    async fn refresh_derived_topic(&mut self, key: &str) {
        let Some(link) = self.links.get(key) else {
            return;
        };
        let TopicBinding::Derived(topic) = link.binding_for(link.state(), &self.device_id) else {
            return;
        };
        let current = link.subscribe_topic().or(link.publish_topic());
        if current == Some(topic.as_str()) {
            return;
        }
        log::info!("Flow {} link {} moves to topic {}", self.flow_id, key, topic);
        self.bind(key, &topic).await;
    }

    /// Record `topic` for the link's current state and subscribe when the
    /// state fetches from the bus.
    async fn bind(&mut self, key: &str, topic: &str) {
        let Some(link) = self.links.get_mut(key) else {
            return;
        };
        if !link.bind(topic) {
            return;
        }
        if !link.state().fetches() {
            return;
        }

        let host = Arc::clone(&self.host);
        let flow_id = self.flow_id.clone();
        let successor = link.edge().successor.clone();
        let callback: BusCallback = Arc::new(move |message: &Message| {
            host.deliver(&flow_id, &successor, message.clone());
        });
        self.broker
            .subscribe(&self.subscriber_id(key), topic, callback)
            .await;
    }

    fn rebuild_sync_request(&mut self) {
        self.sync_request =
            SyncRequest::build(&self.device_id, &self.flow_id, &self.pending, &self.contributions);
    }

    fn subscriber_id(&self, key: &str) -> String {
        format!("{}:{}", self.flow_id, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SimBusNetwork;
    use crate::context::{ConstraintGroup, ConstraintSet};
    use crate::graph::{GraphNode, RecordingHost};
    use serde_json::json;
    use std::time::Duration;

    fn on_device(name: &str) -> ConstraintSet {
        ConstraintSet::new().with_group(
            "g1",
            ConstraintGroup::new().with("id", json!("g1")).with("deviceName", json!(name)),
        )
    }

    fn make_context() -> DeviceContext {
        let mut ctx = DeviceContext::new("dev1", "pi");
        ctx.cores = 4;
        ctx.free_mem = 2048.0;
        ctx
    }

    struct Fixture {
        network: SimBusNetwork,
        broker: Arc<TopicBroker>,
        host: Arc<RecordingHost>,
    }

    async fn make_fixture() -> Fixture {
        let network = SimBusNetwork::new();
        let broker = TopicBroker::new(Arc::new(network.clone()), "bus-1");
        broker.start().await.unwrap();
        Fixture {
            network,
            broker,
            host: Arc::new(RecordingHost::new(["function"])),
        }
    }

    fn make_gateway(fixture: &Fixture, graph: FlowGraph) -> FlowGateway {
        let mut gateway = FlowGateway::new(graph, Arc::clone(&fixture.broker), fixture.host.clone());
        gateway.register_all_edges();
        gateway
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    /// a -> b, with a pinned to another device.
    fn remote_source_graph() -> FlowGraph {
        FlowGraph::new("f1")
            .with_node(
                GraphNode::new("a", "function")
                    .wire(0, "b")
                    .with_constraints(on_device("elsewhere")),
            )
            .with_node(GraphNode::new("b", "function"))
    }

    #[tokio::test]
    async fn test_unconstrained_flow_stays_local() {
        let fixture = make_fixture().await;
        let graph = FlowGraph::new("f1")
            .with_node(GraphNode::new("a", "function").wire(0, "b"))
            .with_node(GraphNode::new("b", "function"));
        let mut gateway = make_gateway(&fixture, graph);

        gateway.heartbeat(&make_context()).await;
        assert_eq!(gateway.link("a_0_b").unwrap().state(), LinkState::Normal);
        assert!(gateway.sync_request().is_none());

        gateway.route("a_0_b", json!({"payload": 1})).await.unwrap();
        assert_eq!(fixture.host.delivered_to("b"), vec![json!({"payload": 1})]);
        assert!(fixture.network.published().is_empty());
    }

    #[tokio::test]
    async fn test_register_link_rejects_unknown_node() {
        let fixture = make_fixture().await;
        let mut gateway = make_gateway(&fixture, remote_source_graph());
        let result = gateway.register_link(EdgeKey::new("a", 0, "ghost"), None);
        assert!(matches!(result, Err(GatewayError::UnknownNode(n)) if n == "ghost"));
    }

    #[tokio::test]
    async fn test_fetch_forward_waits_for_coordinator() {
        let fixture = make_fixture().await;
        let mut gateway = make_gateway(&fixture, remote_source_graph());

        gateway.heartbeat(&make_context()).await;
        let link = gateway.link("a_0_b").unwrap();
        assert_eq!(link.state(), LinkState::FetchForward);
        assert_eq!(link.subscribe_topic(), None);

        let request = gateway.sync_request().cloned().unwrap();
        assert_eq!(request.device_id, "dev1");
        assert_eq!(request.edge_keys, vec!["a_0_b-3".to_string()]);

        let mut response = SyncResponse::default();
        response.dnr_links.insert("a_0_b".to_string(), "t-ab".to_string());
        gateway.process_sync_response(&request, &response).await.unwrap();

        assert_eq!(gateway.link("a_0_b").unwrap().subscribe_topic(), Some("t-ab"));
        assert!(gateway.pending().is_empty());
        assert!(gateway.sync_request().is_none());
        assert_eq!(fixture.broker.topic_refs("t-ab").await, 1);

        fixture.network.inject("bus-1", "t-ab", br#"{"payload":7}"#);
        settle().await;
        assert_eq!(fixture.host.delivered_to("b"), vec![json!({"payload": 7})]);

        // Local output of a is not delivered while fetching.
        gateway.route("a_0_b", json!({"payload": 8})).await.unwrap();
        assert_eq!(fixture.host.delivered_to("b").len(), 1);
    }

    #[tokio::test]
    async fn test_unresolved_entry_stays_pending() {
        let fixture = make_fixture().await;
        let mut gateway = make_gateway(&fixture, remote_source_graph());
        gateway.heartbeat(&make_context()).await;

        let request = gateway.sync_request().cloned().unwrap();
        gateway
            .process_sync_response(&request, &SyncResponse::default())
            .await
            .unwrap();
        assert_eq!(gateway.pending().len(), 1);
        assert_eq!(gateway.sync_request(), Some(&request));
    }

    #[tokio::test]
    async fn test_stale_response_is_ignored() {
        let fixture = make_fixture().await;
        let mut gateway = make_gateway(&fixture, remote_source_graph());
        gateway.heartbeat(&make_context()).await;
        let request = gateway.sync_request().cloned().unwrap();

        // The source moves onto this device before the answer arrives.
        let local = FlowGraph::new("f1")
            .with_node(GraphNode::new("a", "function").wire(0, "b").with_constraints(on_device("pi")))
            .with_node(GraphNode::new("b", "function"));
        gateway.update_graph(local);
        gateway.heartbeat(&make_context()).await;
        assert_eq!(gateway.link("a_0_b").unwrap().state(), LinkState::Normal);
        assert!(gateway.sync_request().is_none());

        let mut response = SyncResponse::default();
        response.dnr_links.insert("a_0_b".to_string(), "t-ab".to_string());
        gateway.process_sync_response(&request, &response).await.unwrap();

        assert_eq!(gateway.link("a_0_b").unwrap().subscribe_topic(), None);
        assert_eq!(fixture.broker.topic_refs("t-ab").await, 0);
    }

    #[tokio::test]
    async fn test_receive_redirect_on_many_to_many_edge() {
        let fixture = make_fixture().await;
        // a and x both feed c and d.
        let graph = FlowGraph::new("f2")
            .with_node(
                GraphNode::new("a", "function")
                    .wire(0, "c")
                    .wire(0, "d")
                    .with_constraints(on_device("pi")),
            )
            .with_node(GraphNode::new("x", "function").wire(0, "c").wire(0, "d"))
            .with_node(GraphNode::new("c", "function").with_constraints(on_device("elsewhere")))
            .with_node(GraphNode::new("d", "function"));
        let mut gateway = make_gateway(&fixture, graph);
        gateway.heartbeat(&make_context()).await;

        let link = gateway.link("a_0_c").unwrap();
        assert_eq!(link.cardinality(), LinkCardinality::ManyToMany);
        assert_eq!(link.state(), LinkState::ReceiveRedirect);
        assert_eq!(link.publish_topic(), Some("a_0_c"));
        assert_eq!(gateway.link("a_0_d").unwrap().state(), LinkState::Normal);
        assert_eq!(gateway.link("x_0_c").unwrap().state(), LinkState::Drop);
        assert!(gateway.sync_request().is_none());

        gateway.route("a_0_c", json!({"payload": "hi"})).await.unwrap();
        let published = fixture.network.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "a_0_c");
        assert!(fixture.host.delivered_to("c").is_empty());

        gateway.route("x_0_c", json!({"payload": "dropped"})).await.unwrap();
        assert!(fixture.host.delivered_to("c").is_empty());
        assert_eq!(fixture.network.published().len(), 1);
    }

    #[tokio::test]
    async fn test_copy_state_offers_contribution() {
        let fixture = make_fixture().await;
        let graph = FlowGraph::new("f3")
            .with_node(GraphNode::new("a", "function").wire(0, "b").wire(0, "c"))
            .with_node(GraphNode::new("b", "function"))
            .with_node(GraphNode::new("c", "function"));
        let mut gateway = make_gateway(&fixture, graph);
        gateway.heartbeat(&make_context()).await;

        let link = gateway.link("a_0_b").unwrap();
        assert_eq!(link.state(), LinkState::ReceiveRedirectCopy);
        assert_eq!(link.publish_topic(), Some("from_dev1_a_0_b"));
        assert_eq!(gateway.contributions().iter().collect::<Vec<_>>(), vec!["a"]);

        let request = gateway.sync_request().cloned().unwrap();
        assert!(request.edge_keys.is_empty());
        assert_eq!(request.contributed_node_ids, vec!["a".to_string()]);

        gateway.route("a_0_b", json!({"payload": 3})).await.unwrap();
        assert_eq!(fixture.host.delivered_to("b").len(), 1);
        assert_eq!(fixture.network.published()[0].topic, "from_dev1_a_0_b");

        gateway
            .process_sync_response(&request, &SyncResponse::default())
            .await
            .unwrap();
        assert!(gateway.contributions().is_empty());
        assert!(gateway.sync_request().is_none());
    }

    #[tokio::test]
    async fn test_new_device_id_moves_publisher_topic() {
        let fixture = make_fixture().await;
        let graph = FlowGraph::new("f3")
            .with_node(GraphNode::new("a", "function").wire(0, "b").wire(0, "c"))
            .with_node(GraphNode::new("b", "function"))
            .with_node(GraphNode::new("c", "function"));
        let mut gateway = make_gateway(&fixture, graph);
        gateway.heartbeat(&make_context()).await;
        assert_eq!(gateway.link("a_0_b").unwrap().publish_topic(), Some("from_dev1_a_0_b"));

        let mut renamed = make_context();
        renamed.device_id = "dev2".to_string();
        gateway.heartbeat(&renamed).await;

        let link = gateway.link("a_0_b").unwrap();
        assert_eq!(link.state(), LinkState::ReceiveRedirectCopy);
        assert_eq!(link.publish_topic(), Some("from_dev2_a_0_b"));
        assert_eq!(gateway.sync_request().unwrap().device_id, "dev2");

        gateway.route("a_0_b", json!({"payload": 1})).await.unwrap();
        assert_eq!(fixture.network.published()[0].topic, "from_dev2_a_0_b");
    }

    #[tokio::test]
    async fn test_new_device_id_moves_fetcher_subscription() {
        let fixture = make_fixture().await;
        // a and b both feed c.
        let graph = FlowGraph::new("f4")
            .with_node(GraphNode::new("a", "function").wire(0, "c"))
            .with_node(GraphNode::new("b", "function").wire(0, "c"))
            .with_node(GraphNode::new("c", "function"));
        let mut gateway = make_gateway(&fixture, graph);
        gateway.heartbeat(&make_context()).await;

        let link = gateway.link("a_0_c").unwrap();
        assert_eq!(link.state(), LinkState::CopyFetchForward);
        assert_eq!(link.subscribe_topic(), Some("to_dev1_a_0_c"));
        assert_eq!(fixture.broker.topic_refs("to_dev1_a_0_c").await, 1);

        let mut renamed = make_context();
        renamed.device_id = "dev2".to_string();
        gateway.heartbeat(&renamed).await;

        assert_eq!(gateway.link("a_0_c").unwrap().subscribe_topic(), Some("to_dev2_a_0_c"));
        assert_eq!(fixture.broker.topic_refs("to_dev1_a_0_c").await, 0);
        assert_eq!(fixture.broker.topic_refs("to_dev2_a_0_c").await, 1);
        assert_eq!(fixture.network.unsubscribe_calls("to_dev1_a_0_c"), 1);

        fixture.network.inject("bus-1", "to_dev2_a_0_c", br#"{"payload":2}"#);
        settle().await;
        assert_eq!(fixture.host.delivered_to("c"), vec![json!({"payload": 2})]);
    }

    #[tokio::test]
    async fn test_repeated_heartbeats_keep_bindings() {
        let fixture = make_fixture().await;
        let mut gateway = make_gateway(&fixture, remote_source_graph());
        gateway.heartbeat(&make_context()).await;
        let request = gateway.sync_request().cloned().unwrap();
        let mut response = SyncResponse::default();
        response.dnr_links.insert("a_0_b".to_string(), "t-ab".to_string());
        gateway.process_sync_response(&request, &response).await.unwrap();

        gateway.heartbeat(&make_context()).await;
        gateway.heartbeat(&make_context()).await;

        let link = gateway.link("a_0_b").unwrap();
        assert_eq!(link.state(), LinkState::FetchForward);
        assert_eq!(link.subscribe_topic(), Some("t-ab"));
        assert_eq!(fixture.network.subscribe_calls("t-ab"), 1);
        assert_eq!(fixture.network.unsubscribe_calls("t-ab"), 0);
        assert_eq!(fixture.broker.topic_refs("t-ab").await, 1);
        assert!(gateway.pending().is_empty());
        assert!(gateway.sync_request().is_none());
    }

    #[tokio::test]
    async fn test_repeated_heartbeats_keep_redirect_topic() {
        let fixture = make_fixture().await;
        let graph = FlowGraph::new("f2")
            .with_node(
                GraphNode::new("a", "function")
                    .wire(0, "c")
                    .wire(0, "d")
                    .with_constraints(on_device("pi")),
            )
            .with_node(GraphNode::new("x", "function").wire(0, "c").wire(0, "d"))
            .with_node(GraphNode::new("c", "function").with_constraints(on_device("elsewhere")))
            .with_node(GraphNode::new("d", "function"));
        let mut gateway = make_gateway(&fixture, graph);

        for _ in 0..3 {
            gateway.heartbeat(&make_context()).await;
            let link = gateway.link("a_0_c").unwrap();
            assert_eq!(link.state(), LinkState::ReceiveRedirect);
            assert_eq!(link.publish_topic(), Some("a_0_c"));
        }
        assert_eq!(fixture.network.subscribe_calls("a_0_c"), 0);
        assert_eq!(fixture.network.unsubscribe_calls("a_0_c"), 0);
        assert!(gateway.sync_request().is_none());
    }

    #[tokio::test]
    async fn test_contribution_withdrawn_only_when_unheld() {
        let fixture = make_fixture().await;
        let graph = FlowGraph::new("f3")
            .with_node(GraphNode::new("a", "function").wire(0, "b").wire(0, "c"))
            .with_node(GraphNode::new("b", "function"))
            .with_node(GraphNode::new("c", "function"));
        let mut gateway = make_gateway(&fixture, graph);
        gateway.heartbeat(&make_context()).await;
        assert_eq!(gateway.contributions().len(), 1);

        // b becomes unrunnable here: a_0_b drops, a_0_c still copies a.
        let graph = FlowGraph::new("f3")
            .with_node(GraphNode::new("a", "function").wire(0, "b").wire(0, "c"))
            .with_node(GraphNode::new("b", "function").with_constraints(on_device("elsewhere")))
            .with_node(GraphNode::new("c", "function"));
        gateway.update_graph(graph);
        gateway.heartbeat(&make_context()).await;
        assert_eq!(gateway.link("a_0_b").unwrap().state(), LinkState::Drop);
        assert!(gateway.contributions().contains("a"));

        let graph = FlowGraph::new("f3")
            .with_node(GraphNode::new("a", "function").wire(0, "b").wire(0, "c"))
            .with_node(GraphNode::new("b", "function").with_constraints(on_device("elsewhere")))
            .with_node(GraphNode::new("c", "function").with_constraints(on_device("elsewhere")));
        gateway.update_graph(graph);
        gateway.heartbeat(&make_context()).await;
        assert!(gateway.contributions().is_empty());
        assert!(gateway.sync_request().is_none());
    }

    #[tokio::test]
    async fn test_missing_node_is_skipped() {
        let fixture = make_fixture().await;
        let mut gateway = make_gateway(&fixture, remote_source_graph());
        gateway.update_graph(FlowGraph::new("f1").with_node(GraphNode::new("b", "function")));

        gateway.heartbeat(&make_context()).await;
        assert_eq!(gateway.link("a_0_b").unwrap().state(), LinkState::Normal);
        assert!(gateway.sync_request().is_none());
    }

    #[tokio::test]
    async fn test_endpoint_override_migrates_bus() {
        let fixture = make_fixture().await;
        let mut gateway = make_gateway(&fixture, remote_source_graph());
        gateway.heartbeat(&make_context()).await;
        let request = gateway.sync_request().cloned().unwrap();

        let mut response = SyncResponse::default();
        response.dnr_links.insert("a_0_b".to_string(), "t-ab".to_string());
        response.brokers.push("bus-2".to_string());
        gateway.process_sync_response(&request, &response).await.unwrap();

        assert_eq!(fixture.broker.endpoint().await, "bus-2");
        assert_eq!(fixture.network.connects(), vec!["bus-1".to_string(), "bus-2".to_string()]);
        assert_eq!(fixture.network.subscribe_calls("t-ab"), 2);
    }

    #[tokio::test]
    async fn test_close_releases_topics() {
        let fixture = make_fixture().await;
        let mut gateway = make_gateway(&fixture, remote_source_graph());
        gateway.heartbeat(&make_context()).await;
        let request = gateway.sync_request().cloned().unwrap();
        let mut response = SyncResponse::default();
        response.dnr_links.insert("a_0_b".to_string(), "t-ab".to_string());
        gateway.process_sync_response(&request, &response).await.unwrap();

        gateway.close().await;
        assert_eq!(fixture.broker.topic_refs("t-ab").await, 0);
        assert_eq!(fixture.network.unsubscribe_calls("t-ab"), 1);
    }

    #[tokio::test]
    async fn test_route_unknown_link() {
        let fixture = make_fixture().await;
        let gateway = make_gateway(&fixture, remote_source_graph());
        assert!(matches!(
            gateway.route("nope", json!({})).await,
            Err(GatewayError::UnknownLink(_))
        ));
    }
}
