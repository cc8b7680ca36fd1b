//! Relocatable links: graph edges whose execution can move off-device
//!
//! Each link carries exactly one [`LinkState`] plus the bus topics bound for
//! that state. The state is recomputed every heartbeat by
//! [`reasoner::reason`]; the gateway drives the transitions.

pub mod reasoner;

pub use reasoner::reason;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Fan shape of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkCardinality {
    #[serde(rename = "11")]
    OneToOne,
    #[serde(rename = "1N")]
    OneToMany,
    #[serde(rename = "N1")]
    ManyToOne,
    #[serde(rename = "NN")]
    ManyToMany,
}

impl LinkCardinality {
    /// Classify an edge from the predecessor port's fan-out and the
    /// successor's fan-in.
    pub fn from_fan(fan_in: usize, fan_out: usize) -> Self {
        match (fan_in > 1, fan_out > 1) {
            (false, false) => LinkCardinality::OneToOne,
            (false, true) => LinkCardinality::OneToMany,
            (true, false) => LinkCardinality::ManyToOne,
            (true, true) => LinkCardinality::ManyToMany,
        }
    }
}

impl fmt::Display for LinkCardinality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkCardinality::OneToOne => "11",
            LinkCardinality::OneToMany => "1N",
            LinkCardinality::ManyToOne => "N1",
            LinkCardinality::ManyToMany => "NN",
        };
        f.write_str(s)
    }
}

/// What this device does with one edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkState {
    /// Deliver in-process to the successor.
    Normal,
    /// Discard.
    Drop,
    /// Pull the predecessor's output from the bus, feed the local successor.
    FetchForward,
    /// Publish local edge data to the bus instead of delivering it.
    ReceiveRedirect,
    /// Fetch from the bus and keep delivering local edge data.
    CopyFetchForward,
    /// Publish local edge data and keep delivering it.
    ReceiveRedirectCopy,
}

impl LinkState {
    /// Numeric code used in sync requests.
    pub fn code(self) -> u8 {
        match self {
            LinkState::Normal => 1,
            LinkState::Drop => 2,
            LinkState::FetchForward => 3,
            LinkState::ReceiveRedirect => 4,
            LinkState::CopyFetchForward => 5,
            LinkState::ReceiveRedirectCopy => 6,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(LinkState::Normal),
            2 => Some(LinkState::Drop),
            3 => Some(LinkState::FetchForward),
            4 => Some(LinkState::ReceiveRedirect),
            5 => Some(LinkState::CopyFetchForward),
            6 => Some(LinkState::ReceiveRedirectCopy),
            _ => None,
        }
    }

    /// States that subscribe to a bus topic.
    pub fn fetches(self) -> bool {
        matches!(self, LinkState::FetchForward | LinkState::CopyFetchForward)
    }

    /// States that publish local edge data to a bus topic.
    pub fn publishes(self) -> bool {
        matches!(self, LinkState::ReceiveRedirect | LinkState::ReceiveRedirectCopy)
    }

    /// States that hand local edge data to the successor in-process.
    pub fn delivers_locally(self) -> bool {
        matches!(
            self,
            LinkState::Normal | LinkState::CopyFetchForward | LinkState::ReceiveRedirectCopy
        )
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Normal => "NORMAL",
            LinkState::Drop => "DROP",
            LinkState::FetchForward => "FETCH_FORWARD",
            LinkState::ReceiveRedirect => "RECEIVE_REDIRECT",
            LinkState::CopyFetchForward => "COPY_FETCH_FORWARD",
            LinkState::ReceiveRedirectCopy => "RECEIVE_REDIRECT_COPY",
        };
        f.write_str(s)
    }
}

/// Stable identity of an edge: predecessor, output port, successor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeKey {
    pub predecessor: String,
    pub port: usize,
    pub successor: String,
}

impl EdgeKey {
    pub fn new(predecessor: impl Into<String>, port: usize, successor: impl Into<String>) -> Self {
        Self {
            predecessor: predecessor.into(),
            port,
            successor: successor.into(),
        }
    }
}

impl fmt::Display for EdgeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.predecessor, self.port, self.successor)
    }
}

/// Where the topic for a (state, cardinality) pair comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicBinding {
    /// The state uses no topic.
    Unbound,
    /// Derived locally.
    Derived(String),
    /// Only the coordinator can name it.
    Coordinator,
}

/// Topic naming rule.
///
/// NN edges use the edge key on both ends. On a 1N edge the single publisher
/// names `from_<device>_<edge>`; on an N1 edge the single fetcher names
/// `to_<device>_<edge>`. The opposite ends, and both ends of 11 edges, ask the
/// coordinator.
pub fn topic_binding(
    state: LinkState,
    cardinality: LinkCardinality,
    edge_key: &str,
    device_id: &str,
) -> TopicBinding {
    if !state.fetches() && !state.publishes() {
        return TopicBinding::Unbound;
    }
    match (cardinality, state.publishes()) {
        (LinkCardinality::ManyToMany, _) => TopicBinding::Derived(edge_key.to_string()),
        (LinkCardinality::OneToMany, true) => {
            TopicBinding::Derived(format!("from_{}_{}", device_id, edge_key))
        }
        (LinkCardinality::ManyToOne, false) => {
            TopicBinding::Derived(format!("to_{}_{}", device_id, edge_key))
        }
        _ => TopicBinding::Coordinator,
    }
}

/// One relocatable edge and its current bindings.
#[derive(Debug, Clone)]
pub struct RelocatableLink {
    edge: EdgeKey,
    key: String,
    cardinality: LinkCardinality,
    state: LinkState,
    subscribe_topic: Option<String>,
    publish_topic: Option<String>,
}

impl RelocatableLink {
    /// A freshly registered link runs as a plain local wire.
    pub fn new(edge: EdgeKey, cardinality: LinkCardinality) -> Self {
        let key = edge.to_string();
        Self {
            edge,
            key,
            cardinality,
            state: LinkState::Normal,
            subscribe_topic: None,
            publish_topic: None,
        }
    }

    pub fn edge(&self) -> &EdgeKey {
        &self.edge
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn cardinality(&self) -> LinkCardinality {
        self.cardinality
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn subscribe_topic(&self) -> Option<&str> {
        self.subscribe_topic.as_deref()
    }

    pub fn publish_topic(&self) -> Option<&str> {
        self.publish_topic.as_deref()
    }

    /// Topic source for `state` on this link.
    pub fn binding_for(&self, state: LinkState, device_id: &str) -> TopicBinding {
        topic_binding(state, self.cardinality, &self.key, device_id)
    }

    /// Enter `state`, clearing both topics. Returns the previous state.
    pub fn transition(&mut self, state: LinkState) -> LinkState {
        self.subscribe_topic = None;
        self.publish_topic = None;
        std::mem::replace(&mut self.state, state)
    }

    /// Record `topic` in the slot the current state uses. Returns false when
    /// the current state takes no topic.
    pub fn bind(&mut self, topic: impl Into<String>) -> bool {
        if self.state.fetches() {
            self.subscribe_topic = Some(topic.into());
            true
        } else if self.state.publishes() {
            self.publish_topic = Some(topic.into());
            true
        } else {
            false
        }
    }

    /// The node this link offers to serve locally while relaying, if any.
    pub fn contribution(&self) -> Option<&str> {
        contribution_for(&self.edge, self.state)
    }
}

/// Copy states keep serving a node locally while also relaying it: the
/// predecessor for RECEIVE_REDIRECT_COPY, the successor for COPY_FETCH_FORWARD.
pub fn contribution_for(edge: &EdgeKey, state: LinkState) -> Option<&str> {
    match state {
        LinkState::ReceiveRedirectCopy => Some(&edge.predecessor),
        LinkState::CopyFetchForward => Some(&edge.successor),
        _ => None,
    }
}
