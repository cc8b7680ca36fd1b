//! Coordinator channel transports
//!
//! A connection is a pair: a [`CoordinatorConnection`] for sending frames and
//! an [`Inbound`] receiver yielding decoded frames from the coordinator. The
//! receiver ends when the connection drops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::protocol::CoordinatorMessage;
use super::CoordinatorError;

/// Frames received from the coordinator.
pub type Inbound = mpsc::Receiver<CoordinatorMessage>;

#[async_trait]
pub trait CoordinatorConnection: Send + Sync {
    async fn send(&self, message: &CoordinatorMessage) -> Result<(), CoordinatorError>;

    async fn close(&self);

    fn is_open(&self) -> bool;
}

#[async_trait]
pub trait CoordinatorTransport: Send + Sync {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn CoordinatorConnection>, Inbound), CoordinatorError>;
}

/// `host:port` part of a coordinator URL such as `ws://host:1818/path`.
pub fn socket_address(url: &str) -> &str {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    rest.split('/').next().unwrap_or(rest)
}

/// Newline-delimited JSON frames over TCP.
#[derive(Debug, Default, Clone)]
pub struct TcpCoordinatorTransport;

impl TcpCoordinatorTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CoordinatorTransport for TcpCoordinatorTransport {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn CoordinatorConnection>, Inbound), CoordinatorError> {
        let addr = socket_address(url);
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| CoordinatorError::ConnectionError(format!("{}: {}", addr, e)))?;
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(64);
        let open = Arc::new(AtomicBool::new(true));

        let reader_open = Arc::clone(&open);
        let peer = addr.to_string();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => match CoordinatorMessage::from_json(&line) {
                        Ok(message) => {
                            if tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Unparseable frame from coordinator: {}", e),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("Coordinator read failed: {}", e);
                        break;
                    }
                }
            }
            reader_open.store(false, Ordering::SeqCst);
            log::info!("Coordinator {} disconnected", peer);
        });

        log::info!("Connected to coordinator at {}", addr);
        let connection = TcpConnection {
            writer: Mutex::new(write_half),
            open,
            reader,
        };
        Ok((Arc::new(connection), rx))
    }
}

struct TcpConnection {
    writer: Mutex<OwnedWriteHalf>,
    open: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

#[async_trait]
impl CoordinatorConnection for TcpConnection {
    async fn send(&self, message: &CoordinatorMessage) -> Result<(), CoordinatorError> {
        if !self.is_open() {
            return Err(CoordinatorError::NotConnected);
        }
        let mut frame = message.to_json()?;
        frame.push('\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(frame.as_bytes()).await?;
        Ok(())
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.reader.abort();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            log::debug!("Coordinator socket shutdown failed: {}", e);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct SimShared {
    reachable: bool,
    connects: usize,
    sent: Vec<CoordinatorMessage>,
    device_tx: Option<mpsc::Sender<CoordinatorMessage>>,
    current: Option<Arc<SimConnection>>,
}

/// In-process coordinator for tests. Plays the server: records what the
/// device sends and pushes frames to its most recent connection.
#[derive(Clone)]
pub struct SimCoordinator {
    shared: Arc<std::sync::Mutex<SimShared>>,
}

impl Default for SimCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl SimCoordinator {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(std::sync::Mutex::new(SimShared {
                reachable: true,
                ..SimShared::default()
            })),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        if let Ok(mut shared) = self.shared.lock() {
            shared.reachable = reachable;
        }
    }

    /// Number of successful connects so far.
    pub fn connects(&self) -> usize {
        self.shared.lock().map(|s| s.connects).unwrap_or(0)
    }

    /// Every frame the device has sent, oldest first.
    pub fn sent(&self) -> Vec<CoordinatorMessage> {
        self.shared.lock().map(|s| s.sent.clone()).unwrap_or_default()
    }

    /// Frames the device sent under `topic`.
    pub fn sent_with_topic(&self, topic: &str) -> Vec<CoordinatorMessage> {
        self.sent().into_iter().filter(|m| m.topic() == topic).collect()
    }

    pub fn clear_sent(&self) {
        if let Ok(mut shared) = self.shared.lock() {
            shared.sent.clear();
        }
    }

    /// Push a frame to the device. Returns false when nobody is connected.
    pub async fn push(&self, message: CoordinatorMessage) -> bool {
        let tx = match self.shared.lock() {
            Ok(shared) => shared.device_tx.clone(),
            Err(_) => None,
        };
        match tx {
            Some(tx) => tx.send(message).await.is_ok(),
            None => false,
        }
    }

    /// Sever the current connection from the server side.
    pub fn drop_connection(&self) {
        if let Ok(mut shared) = self.shared.lock() {
            shared.device_tx = None;
            if let Some(current) = shared.current.take() {
                current.open.store(false, Ordering::SeqCst);
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared
            .lock()
            .map(|s| s.current.as_ref().map(|c| c.is_open()).unwrap_or(false))
            .unwrap_or(false)
    }
}

#[async_trait]
impl CoordinatorTransport for SimCoordinator {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn CoordinatorConnection>, Inbound), CoordinatorError> {
        let mut shared = self
            .shared
            .lock()
            .map_err(|e| CoordinatorError::ConnectionError(e.to_string()))?;
        if !shared.reachable {
            return Err(CoordinatorError::ConnectionError(format!("{} unreachable", url)));
        }

        shared.connects += 1;
        let (tx, rx) = mpsc::channel(64);
        let connection = Arc::new(SimConnection {
            id: shared.connects,
            open: AtomicBool::new(true),
            shared: Arc::clone(&self.shared),
        });
        shared.device_tx = Some(tx);
        shared.current = Some(Arc::clone(&connection));
        Ok((connection, rx))
    }
}

struct SimConnection {
    id: usize,
    open: AtomicBool,
    shared: Arc<std::sync::Mutex<SimShared>>,
}

#[async_trait]
impl CoordinatorConnection for SimConnection {
    async fn send(&self, message: &CoordinatorMessage) -> Result<(), CoordinatorError> {
        if !self.is_open() {
            return Err(CoordinatorError::NotConnected);
        }
        let mut shared = self
            .shared
            .lock()
            .map_err(|e| CoordinatorError::ConnectionError(e.to_string()))?;
        shared.sent.push(message.clone());
        Ok(())
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        if let Ok(mut shared) = self.shared.lock() {
            let is_current = shared.current.as_ref().map(|c| c.id == self.id).unwrap_or(false);
            if is_current {
                shared.current = None;
                shared.device_tx = None;
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
