//! DeviceAgent — the per-device daemon
//!
//! Owns the context monitor, the topic broker and one [`FlowGateway`] per
//! loaded flow. A connection task keeps a session with the coordinator alive
//! (register, dispatch inbound frames, detect silence, reconnect with
//! backoff); a heartbeat task drives every gateway and reports the device's
//! context and pending sync requests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::bus::{BusConnector, BusError, TopicBroker};
use crate::config::{AgentConfig, ConfigError};
use crate::context::{ContextMonitor, GeoPoint, ResourceProbe};
use crate::coordinator::{
    CoordinatorConnection, CoordinatorError, CoordinatorMessage, CoordinatorTransport,
    FlowDeployment, Heartbeat, Inbound, SyncExchange,
};
use crate::gateway::{FlowGateway, GatewayError};
use crate::graph::{FlowGraph, HostEngine, Message};

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("No flow {0} loaded")]
    UnknownFlow(String),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Where the agent stands with the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Registering,
    Registered,
    Disconnected,
    ServerInactive,
    ServerUnreachable,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Registering => "registering",
            ConnectionState::Registered => "registered",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::ServerInactive => "server inactive",
            ConnectionState::ServerUnreachable => "server unreachable",
        };
        f.write_str(s)
    }
}

/// How a coordinator session ended.
enum SessionEnd {
    Closed,
    Inactive,
    Shutdown,
}

pub struct DeviceAgent {
    config: AgentConfig,
    monitor: Arc<ContextMonitor>,
    broker: Arc<TopicBroker>,
    host: Arc<dyn HostEngine>,
    transport: Arc<dyn CoordinatorTransport>,
    /// flowId -> gateway
    gateways: RwLock<HashMap<String, Arc<Mutex<FlowGateway>>>>,
    connection: Mutex<Option<Arc<dyn CoordinatorConnection>>>,
    state_tx: watch::Sender<ConnectionState>,
    /// Id assigned by the coordinator; links are not evaluated before it.
    assigned_id: std::sync::RwLock<Option<String>>,
    last_server_activity: std::sync::Mutex<Instant>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl DeviceAgent {
    pub fn new(
        config: AgentConfig,
        probe: Arc<dyn ResourceProbe>,
        host: Arc<dyn HostEngine>,
        transport: Arc<dyn CoordinatorTransport>,
        bus: Arc<dyn BusConnector>,
    ) -> Result<Arc<Self>, AgentError> {
        config.validate()?;

        let provisional_id = Uuid::new_v4().to_string();
        let monitor = ContextMonitor::new(
            provisional_id,
            config.device_name.clone(),
            config.location,
            probe,
            config.sampling(),
        );
        let broker = TopicBroker::new(bus, config.broker_endpoint());
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Arc::new(Self {
            config,
            monitor,
            broker,
            host,
            transport,
            gateways: RwLock::new(HashMap::new()),
            connection: Mutex::new(None),
            state_tx,
            assigned_id: std::sync::RwLock::new(None),
            last_server_activity: std::sync::Mutex::new(Instant::now()),
            tasks: std::sync::Mutex::new(Vec::new()),
            shutdown_tx,
        }))
    }

    /// Agent sampling this host through `/proc`, on the interface named by
    /// `networkInterface`.
    pub fn with_proc_probe(
        config: AgentConfig,
        host: Arc<dyn HostEngine>,
        transport: Arc<dyn CoordinatorTransport>,
        bus: Arc<dyn BusConnector>,
    ) -> Result<Arc<Self>, AgentError> {
        let probe = Arc::new(config.proc_probe());
        Self::new(config, probe, host, transport, bus)
    }

    /// Start sampling, connect the bus and spawn the connection and
    /// heartbeat tasks.
    pub async fn start(self: &Arc<Self>) {
        self.monitor.start().await;
        if let Err(e) = self.broker.start().await {
            log::warn!("Bus unavailable at start, retrying on every heartbeat: {}", e);
        }

        let connection_task = {
            let agent = Arc::clone(self);
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                agent.connection_loop(&mut shutdown).await;
            })
        };

        let heartbeat_task = {
            let agent = Arc::clone(self);
            let interval = self.config.heartbeat_interval();
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => agent.heartbeat().await,
                        _ = shutdown.recv() => break,
                    }
                }
            })
        };

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(connection_task);
            tasks.push(heartbeat_task);
        }
        log::info!("Agent {} started", self.config.device_name);
    }

    /// Stop every task, release every flow and close both connections.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        self.monitor.stop();

        let handles: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            handle.abort();
        }

        if let Some(conn) = self.connection.lock().await.take() {
            conn.close().await;
        }

        let flow_ids: Vec<String> = self.gateways.read().await.keys().cloned().collect();
        for flow_id in flow_ids {
            self.unload_flow(&flow_id).await;
        }
        self.broker.stop().await;
        self.set_state(ConnectionState::Disconnected);
        log::info!("Agent {} stopped", self.config.device_name);
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn monitor(&self) -> &Arc<ContextMonitor> {
        &self.monitor
    }

    pub fn broker(&self) -> &Arc<TopicBroker> {
        &self.broker
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Follow connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// The coordinator-assigned device id, once registered.
    pub fn device_id(&self) -> Option<String> {
        self.assigned_id.read().ok().and_then(|id| id.clone())
    }

    /// Report a new position; location constraints use it from the next
    /// heartbeat on.
    pub fn set_location(&self, location: Option<GeoPoint>) {
        self.monitor.set_location(location);
    }

    pub async fn flow_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.gateways.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn gateway(&self, flow_id: &str) -> Option<Arc<Mutex<FlowGateway>>> {
        self.gateways.read().await.get(flow_id).cloned()
    }

    /// Load `graph`, replacing any flow with the same id. Node types the host
    /// cannot run are masked first. Returns the number of relocatable links.
    pub async fn load_flow(&self, mut graph: FlowGraph) -> usize {
        let installed: HashSet<String> = self.host.installed_types();
        graph.mask_unknown_types(&installed);

        let flow_id = graph.id.clone();
        self.unload_flow(&flow_id).await;

        let mut gateway = FlowGateway::new(graph, Arc::clone(&self.broker), Arc::clone(&self.host));
        let links = gateway.register_all_edges();
        self.gateways
            .write()
            .await
            .insert(flow_id.clone(), Arc::new(Mutex::new(gateway)));
        log::info!("Loaded flow {} with {} relocatable links", flow_id, links);
        links
    }

    /// Release and forget a flow. Returns false when it was not loaded.
    pub async fn unload_flow(&self, flow_id: &str) -> bool {
        let removed = self.gateways.write().await.remove(flow_id);
        match removed {
            Some(gateway) => {
                gateway.lock().await.close().await;
                log::info!("Unloaded flow {}", flow_id);
                true
            }
            None => false,
        }
    }

    /// Entry point for the host when a predecessor emits on a relocatable edge.
    pub async fn route(&self, flow_id: &str, edge_key: &str, message: Message) -> Result<(), AgentError> {
        let gateway = self
            .gateway(flow_id)
            .await
            .ok_or_else(|| AgentError::UnknownFlow(flow_id.to_string()))?;
        let gateway = gateway.lock().await;
        gateway.route(edge_key, message).await?;
        Ok(())
    }

    /// One heartbeat pass: re-evaluate every flow, then report to the
    /// coordinator when registered.
    pub async fn heartbeat(&self) {
        if !self.broker.is_connected().await {
            if let Err(e) = self.broker.reconnect().await {
                log::debug!("Bus still unavailable: {}", e);
            }
        }

        if self.device_id().is_none() {
            log::debug!("Not registered yet, skipping link evaluation");
            return;
        }

        let context = self.monitor.snapshot();
        let gateways: Vec<Arc<Mutex<FlowGateway>>> =
            self.gateways.read().await.values().cloned().collect();

        let mut pending_sync_requests = BTreeMap::new();
        for gateway in gateways {
            let mut gateway = gateway.lock().await;
            gateway.heartbeat(&context).await;
            if let Some(request) = gateway.sync_request() {
                pending_sync_requests.insert(gateway.flow_id().to_string(), request.clone());
            }
        }

        if self.connection_state() != ConnectionState::Registered {
            return;
        }
        let frame = CoordinatorMessage::Heartbeat(Heartbeat {
            device_id: context.device_id.clone(),
            context: context.query(),
            pending_sync_requests,
            timestamp: Utc::now(),
        });
        if let Err(e) = self.send(&frame).await {
            log::warn!("Heartbeat not sent: {}", e);
        }
    }

    /// React to one frame from the coordinator.
    pub async fn handle_message(&self, message: CoordinatorMessage) {
        log::debug!("Coordinator frame: {}", message.topic());
        match message {
            CoordinatorMessage::RegisterAck { id } => {
                log::info!("Registered as {}", id);
                self.monitor.set_device_id(id.clone());
                if let Ok(mut assigned) = self.assigned_id.write() {
                    *assigned = Some(id);
                }
                self.set_state(ConnectionState::Registered);
            }
            CoordinatorMessage::RegisterReq => {
                self.set_state(ConnectionState::Connected);
                self.register().await;
            }
            CoordinatorMessage::SyncResponses { exchanges } => {
                for exchange in exchanges {
                    self.apply_sync_exchange(exchange).await;
                }
            }
            CoordinatorMessage::FlowDeployed { data } => self.apply_deployment(data).await,
            CoordinatorMessage::Register { .. } | CoordinatorMessage::Heartbeat(_) => {
                log::debug!("Ignoring device-bound frame {}", message.topic());
            }
        }
    }

    async fn apply_sync_exchange(&self, exchange: SyncExchange) {
        let flow_id = exchange.request.flow_id.clone();
        let Some(gateway) = self.gateway(&flow_id).await else {
            log::debug!("Sync response for unloaded flow {}", flow_id);
            return;
        };
        let mut gateway = gateway.lock().await;
        if let Err(e) = gateway
            .process_sync_response(&exchange.request, &exchange.response)
            .await
        {
            log::warn!("Sync response for flow {} only partly applied: {}", flow_id, e);
        }
    }

    async fn apply_deployment(&self, deployment: FlowDeployment) {
        let active_id = deployment.active_flow.id.clone();
        self.load_flow(deployment.active_flow).await;

        let keep: HashSet<&String> = deployment.all_flows.iter().collect();
        for flow_id in self.flow_ids().await {
            if flow_id != active_id && !keep.contains(&flow_id) {
                self.unload_flow(&flow_id).await;
            }
        }
    }

    async fn register(&self) {
        let frame = CoordinatorMessage::Register {
            device_name: self.config.device_name.clone(),
        };
        match self.send(&frame).await {
            Ok(()) => self.set_state(ConnectionState::Registering),
            Err(e) => log::warn!("Registration not sent: {}", e),
        }
    }

    async fn send(&self, message: &CoordinatorMessage) -> Result<(), AgentError> {
        let conn = self.connection.lock().await.clone();
        match conn {
            Some(conn) => Ok(conn.send(message).await?),
            None => Err(CoordinatorError::NotConnected.into()),
        }
    }

    async fn connection_loop(&self, shutdown: &mut broadcast::Receiver<()>) {
        let mut attempt: u32 = 0;
        loop {
            self.set_state(ConnectionState::Connecting);
            match self.transport.connect(&self.config.coordinator_url).await {
                Ok((conn, inbound)) => {
                    attempt = 0;
                    *self.connection.lock().await = Some(Arc::clone(&conn));
                    self.touch();
                    self.set_state(ConnectionState::Connected);
                    self.register().await;

                    let end = self.session(inbound, shutdown).await;
                    conn.close().await;
                    *self.connection.lock().await = None;
                    match end {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Closed => self.set_state(ConnectionState::ServerUnreachable),
                        SessionEnd::Inactive => self.set_state(ConnectionState::ServerInactive),
                    }
                }
                Err(e) => {
                    log::warn!("Coordinator unreachable: {}", e);
                    self.set_state(ConnectionState::ServerUnreachable);
                }
            }

            let delay = self.config.reconnect.delay_for(attempt);
            attempt = attempt.saturating_add(1);
            log::info!("Reconnecting to coordinator in {:?}", delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.recv() => break,
            }
        }
    }

    async fn session(&self, mut inbound: Inbound, shutdown: &mut broadcast::Receiver<()>) -> SessionEnd {
        let timeout = self.config.inactive_timeout();
        loop {
            let deadline = self.last_activity() + timeout;
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(message) => {
                        self.touch();
                        self.handle_message(message).await;
                    }
                    None => {
                        log::warn!("Coordinator closed the connection");
                        return SessionEnd::Closed;
                    }
                },
                _ = tokio::time::sleep_until(deadline) => {
                    if self.last_activity() + timeout <= Instant::now() {
                        log::warn!("Coordinator silent for {:?}, recycling connection", timeout);
                        return SessionEnd::Inactive;
                    }
                }
                _ = shutdown.recv() => return SessionEnd::Shutdown,
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            log::info!("Coordinator connection: {}", state);
        }
    }

    fn touch(&self) {
        if let Ok(mut last) = self.last_server_activity.lock() {
            *last = Instant::now();
        }
    }

    fn last_activity(&self) -> Instant {
        self.last_server_activity
            .lock()
            .map(|last| *last)
            .unwrap_or_else(|_| Instant::now())
    }
}
