//! Line-framed TCP gossip between fleet nodes.
//!
//! Every node runs one listening socket and dials each configured
//! bootstrap peer. Framing is one UTF-8 JSON object per line, terminated
//! by `\n`, with the line length capped at 1 MiB — an overlong line drops
//! the connection rather than buffering without bound.
//!
//! Protocol: an initiator sends `HANDSHAKE` then `REQUEST_CHAIN`; a
//! `REQUEST_CHAIN` is answered with the full local log; a received
//! `RESPONSE_CHAIN` feeds the longest-chain resolution; a `NEW_BLOCK`
//! appends via the ledger and — only if accepted — is re-broadcast to all
//! peers. Flood termination relies on the ledger's idempotent rejection of
//! an already-appended index, not on message ids.

use crate::ledger::{Block, ReplicationLog};
use crate::FleetEvent;
use dashmap::DashMap;
use guardmesh_core::config::NetworkConfig;
use guardmesh_core::{GuardError, Result, Severity};
use guardmesh_store::{OfflineQueue, QueueKind, SharedPatternStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Hard cap on one framed line.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Wire message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Handshake,
    RequestChain,
    ResponseChain,
    NewBlock,
    /// Reserved for future use; logged and ignored on receipt.
    NewTransaction,
}

/// Envelope for every gossip message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub payload: Value,
    #[serde(rename = "senderId")]
    pub sender_id: String,
}

impl PeerMessage {
    fn new(kind: MessageKind, payload: Value, sender_id: &str) -> Self {
        Self {
            kind,
            payload,
            sender_id: sender_id.to_string(),
        }
    }
}

/// Per-peer outbound lane. The writer task owns the socket half; dropping
/// the sender closes the lane.
type PeerLane = mpsc::UnboundedSender<String>;

/// The gossip node.
pub struct PeerNetwork {
    node_id: String,
    config: NetworkConfig,
    log: Arc<Mutex<ReplicationLog>>,
    store: SharedPatternStore,
    queue: Option<Arc<Mutex<OfflineQueue>>>,
    events: broadcast::Sender<FleetEvent>,
    /// Connected peers keyed by `ip:port`.
    peers: Arc<DashMap<String, PeerLane>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl PeerNetwork {
    pub fn new(
        node_id: &str,
        config: NetworkConfig,
        log: Arc<Mutex<ReplicationLog>>,
        store: SharedPatternStore,
        queue: Option<Arc<Mutex<OfflineQueue>>>,
        events: broadcast::Sender<FleetEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id: node_id.to_string(),
            config,
            log,
            store,
            queue,
            events,
            peers: Arc::new(DashMap::new()),
            tasks: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Bind the listener and dial every bootstrap peer. Returns the bound
    /// local port (useful when configured with port 0 in tests).
    pub async fn start(self: Arc<Self>) -> Result<u16> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.listen_port))
            .await
            .map_err(|e| GuardError::Gossip(format!("bind failed: {e}")))?;
        let local_port = listener
            .local_addr()
            .map_err(|e| GuardError::Gossip(format!("no local addr: {e}")))?
            .port();
        info!(port = local_port, node = %self.node_id, "gossip listener up");

        let accept_node = Arc::clone(&self);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        if accept_node.peers.len() >= accept_node.config.max_peers {
                            warn!(%addr, "peer limit reached, refusing connection");
                            continue;
                        }
                        debug!(%addr, "inbound peer connection");
                        Self::adopt_connection(&accept_node, stream, addr.to_string(), false);
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        break;
                    }
                }
            }
        });
        self.tasks.lock().expect("task list poisoned").push(accept_task);

        for peer_addr in self.config.bootstrap_nodes.clone() {
            let node = Arc::clone(&self);
            let dial_task = tokio::spawn(async move {
                match TcpStream::connect(&peer_addr).await {
                    Ok(stream) => {
                        info!(peer = %peer_addr, "connected to bootstrap peer");
                        Self::adopt_connection(&node, stream, peer_addr, true);
                    }
                    // Failed dials are logged and abandoned; no reconnect loop.
                    Err(e) => warn!(peer = %peer_addr, error = %e, "dial failed"),
                }
            });
            self.tasks.lock().expect("task list poisoned").push(dial_task);
        }

        Ok(local_port)
    }

    /// Register a connection: spawn its writer and reader tasks and, for
    /// outbound connections, run the initiator handshake.
    fn adopt_connection(node: &Arc<Self>, stream: TcpStream, peer_key: String, initiator: bool) {
        let (read_half, write_half) = stream.into_split();

        let (lane_tx, lane_rx) = mpsc::unbounded_channel::<String>();
        node.peers.insert(peer_key.clone(), lane_tx.clone());

        let writer_task = tokio::spawn(writer_loop(write_half, lane_rx));

        if initiator {
            let hello = PeerMessage::new(
                MessageKind::Handshake,
                serde_json::json!({"node": node.node_id}),
                &node.node_id,
            );
            let want_chain =
                PeerMessage::new(MessageKind::RequestChain, Value::Null, &node.node_id);
            for msg in [hello, want_chain] {
                if let Ok(line) = serde_json::to_string(&msg) {
                    let _ = lane_tx.send(line);
                }
            }
        }

        let reader_node = Arc::clone(node);
        let key = peer_key.clone();
        let reader_task = tokio::spawn(async move {
            let node = reader_node;
            let mut reader = BufReader::new(read_half);
            let mut line = Vec::new();
            loop {
                line.clear();
                let mut limited = (&mut reader).take(MAX_LINE_BYTES as u64 + 1);
                match limited.read_until(b'\n', &mut line).await {
                    Ok(0) => {
                        debug!(peer = %key, "peer closed connection");
                        break;
                    }
                    Ok(_) if line.len() > MAX_LINE_BYTES => {
                        warn!(peer = %key, "line cap exceeded, dropping connection");
                        break;
                    }
                    Ok(_) => {
                        // Malformed lines are logged and discarded without
                        // closing the socket.
                        match serde_json::from_slice::<PeerMessage>(&line) {
                            Ok(msg) => node.handle_message(msg, &key).await,
                            Err(e) => {
                                warn!(peer = %key, error = %e, "discarding malformed gossip line");
                            }
                        }
                    }
                    Err(e) => {
                        warn!(peer = %key, error = %e, "peer read failed");
                        break;
                    }
                }
            }
            node.peers.remove(&key);
        });

        let mut tasks = node.tasks.lock().expect("task list poisoned");
        tasks.push(writer_task);
        tasks.push(reader_task);
    }

    async fn handle_message(&self, msg: PeerMessage, peer_key: &str) {
        match msg.kind {
            MessageKind::Handshake => {
                debug!(peer = %peer_key, sender = %msg.sender_id, "handshake received");
            }
            MessageKind::RequestChain => {
                let chain = { self.log.lock().await.chain().to_vec() };
                let reply = PeerMessage::new(
                    MessageKind::ResponseChain,
                    serde_json::to_value(&chain).unwrap_or(Value::Null),
                    &self.node_id,
                );
                self.send_to(peer_key, &reply);
            }
            MessageKind::ResponseChain => {
                let Ok(chain) = serde_json::from_value::<Vec<Block>>(msg.payload) else {
                    warn!(peer = %peer_key, "discarding malformed chain payload");
                    return;
                };
                let adopted: Vec<Block> = {
                    let mut log = self.log.lock().await;
                    if log.resolve(vec![chain]) {
                        log.chain().to_vec()
                    } else {
                        Vec::new()
                    }
                };
                if !adopted.is_empty() {
                    info!(peer = %peer_key, length = adopted.len(), "adopted peer chain");
                    self.mirror_into_store(&adopted).await;
                    let _ = self.events.send(FleetEvent::ChainReplaced {
                        length: adopted.len(),
                    });
                }
            }
            MessageKind::NewBlock => {
                let Ok(block) = serde_json::from_value::<Block>(msg.payload) else {
                    warn!(peer = %peer_key, "discarding malformed block payload");
                    return;
                };
                let accepted = { self.log.lock().await.add_block(block.clone()) };
                if accepted {
                    self.mirror_into_store(std::slice::from_ref(&block)).await;
                    let _ = self.events.send(FleetEvent::BlockAdded(block.clone()));
                    // Re-broadcast only after local acceptance; duplicate
                    // indices bounce off every peer's ledger, which is what
                    // stops the flood.
                    self.broadcast_block(&block).await;
                } else {
                    debug!(peer = %peer_key, index = block.index, "block rejected (already known or invalid)");
                }
            }
            MessageKind::NewTransaction => {
                debug!(peer = %peer_key, "NEW_TRANSACTION is reserved, ignoring");
            }
        }
    }

    /// Mirror the fingerprints of accepted blocks into the local pattern
    /// store, skipping duplicates.
    async fn mirror_into_store(&self, blocks: &[Block]) {
        let entries: Vec<(String, String, Severity)> = blocks
            .iter()
            .flat_map(|b| b.patterns.iter())
            .map(|p| (p.category.clone(), p.pattern.clone(), p.severity))
            .collect();
        if entries.is_empty() {
            return;
        }
        let mut store = self.store.write().await;
        let (added, duplicated) = store.add_batch(entries);
        if added > 0 {
            if let Err(e) = store.save() {
                warn!(error = %e, "failed to persist mirrored patterns");
            }
        }
        debug!(added, duplicated, "mirrored block patterns into store");
    }

    /// Send a message to one connected peer.
    fn send_to(&self, peer_key: &str, msg: &PeerMessage) {
        let Ok(line) = serde_json::to_string(msg) else {
            return;
        };
        if let Some(lane) = self.peers.get(peer_key) {
            if lane.send(line).is_err() {
                drop(lane);
                self.peers.remove(peer_key);
            }
        }
    }

    /// Announce a locally appended block to the fleet.
    pub async fn broadcast_block(&self, block: &Block) {
        let msg = PeerMessage::new(
            MessageKind::NewBlock,
            serde_json::to_value(block).unwrap_or(Value::Null),
            &self.node_id,
        );
        self.broadcast(&msg).await;
    }

    /// Serialise once and write to every connected peer. With zero
    /// reachable peers and a wired offline queue, the payload is enqueued
    /// for later replay.
    pub async fn broadcast(&self, msg: &PeerMessage) {
        let Ok(line) = serde_json::to_string(msg) else {
            return;
        };

        if self.peers.is_empty() {
            if let Some(queue) = &self.queue {
                let kind = match msg.kind {
                    MessageKind::NewBlock => QueueKind::Block,
                    _ => QueueKind::Pattern,
                };
                let mut queue = queue.lock().await;
                if let Err(e) = queue.enqueue(kind, msg.payload.clone()) {
                    warn!(error = %e, "failed to enqueue offline gossip");
                } else {
                    info!(queued = queue.len(), "no peers reachable, gossip queued");
                }
            }
            return;
        }

        let mut dead = Vec::new();
        for entry in self.peers.iter() {
            if entry.value().send(line.clone()).is_err() {
                dead.push(entry.key().clone());
            }
        }
        for key in dead {
            self.peers.remove(&key);
        }
    }

    /// Replay queued blocks once peers are reachable again. Items are
    /// removed only when at least one peer holds a lane open.
    pub async fn replay_offline(&self) -> Result<()> {
        let Some(queue) = &self.queue else {
            return Ok(());
        };
        if self.peers.is_empty() {
            return Ok(());
        }
        let node_id = self.node_id.clone();
        let peers = Arc::clone(&self.peers);
        let mut queue = queue.lock().await;
        let report = queue
            .process(|item| {
                let kind = match item.kind {
                    QueueKind::Block => MessageKind::NewBlock,
                    QueueKind::Pattern => MessageKind::NewTransaction,
                };
                let msg = PeerMessage::new(kind, item.payload.clone(), &node_id);
                let line = serde_json::to_string(&msg).ok();
                let peers = Arc::clone(&peers);
                async move {
                    let Some(line) = line else { return false };
                    let mut delivered = false;
                    for entry in peers.iter() {
                        if entry.value().send(line.clone()).is_ok() {
                            delivered = true;
                        }
                    }
                    delivered
                }
            })
            .await?;
        if report.delivered > 0 {
            info!(delivered = report.delivered, "offline gossip replayed");
        }
        Ok(())
    }

    /// Tear down: abort every task and drop all peer lanes.
    pub fn stop(&self) {
        for task in self.tasks.lock().expect("task list poisoned").drain(..) {
            task.abort();
        }
        self.peers.clear();
        info!(node = %self.node_id, "gossip stopped");
    }
}

/// Drain the outbound lane onto the socket, one line per message.
async fn writer_loop(mut half: OwnedWriteHalf, mut lane_rx: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = lane_rx.recv().await {
        if half.write_all(line.as_bytes()).await.is_err() {
            break;
        }
        if half.write_all(b"\n").await.is_err() {
            break;
        }
    }
    let _ = half.shutdown().await;
}
