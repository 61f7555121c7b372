//! Coordinator: membership, discovery and signaling fanout
//!
//! Assigns aliases, accepts WebSocket upgrades on `/connect`, verifies
//! credentials before any alias is allocated, places each newly joined
//! client with a relay and forwards WebRTC session negotiation between
//! endpoints. No data-plane traffic flows through here.
//!
//! ## Concurrency model
//!
//! One worker task owns the registry. Each accepted socket gets a
//! reader task feeding the central command queue; observable side
//! effects happen in the order commands are popped. Writers are
//! serialized through a bounded per-socket outbound queue; overflow
//! closes the socket, because a peer that cannot drain its signaling
//! queue is lagging or hostile.

use crate::auth::Authenticator;
use crate::codec::{Codec, Envelope};
use crate::config::CoordinatorConfig;
use crate::error::{CommError, CommResult};
use crate::proto::{ConnectMessage, MessageType, Role, WelcomeMessage};
use crate::topics::Alias;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// How often held clients are reassessed
const HOLDING_TICK: Duration = Duration::from_secs(2);
/// How long a client may wait for a relay before being disconnected
const HOLDING_LIMIT: Duration = Duration::from_secs(30);

/// Close reason for clients that outwaited the holding window
pub const REASON_NO_RELAY: &str = "no_relay_available";

/// Snapshot handed to the injected reporter
#[derive(Clone, Debug, Default)]
pub struct CoordinatorStats {
    pub client_count: usize,
    pub server_count: usize,
    /// Outbound queue depth per signaling socket
    pub signaling_backlogs: Vec<usize>,
}

/// Injected stats sink
pub type Reporter = Box<dyn Fn(&CoordinatorStats) + Send + Sync>;

/// Relay placement policy. The coordinator scores every connected
/// relay and picks the highest; equal scores break toward the smallest
/// alias.
pub trait RelaySelector: Send {
    fn score(&mut self, relay: Alias) -> u64;
}

/// Default policy: uniform random scores
pub struct RandomSelector {
    rng: StdRng,
}

impl RandomSelector {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic variant for tests
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl RelaySelector for RandomSelector {
    fn score(&mut self, _relay: Alias) -> u64 {
        self.rng.gen()
    }
}

/// What the worker pushes into a socket's writer task
#[derive(Debug)]
pub enum SocketOutput {
    Envelope(Envelope),
    Close { code: u16, reason: String },
}

/// Commands drained by the single registry worker
#[derive(Debug)]
pub enum Command {
    Register {
        role: Role,
        outbound: mpsc::Sender<SocketOutput>,
        reply: oneshot::Sender<CommResult<Alias>>,
    },
    Deregister {
        alias: Alias,
    },
    /// A signaling envelope read from the socket owned by `from`
    Signal {
        from: Alias,
        envelope: Envelope,
    },
    ReassessHolding,
    Report,
}

/// Operational counters; `auth_failures` is labeled by rejection reason
#[derive(Default)]
pub struct CoordinatorCounters {
    auth_failures: Mutex<HashMap<&'static str, u64>>,
    pub unknown_destination: AtomicU64,
    pub refused_connections: AtomicU64,
    pub socket_overflows: AtomicU64,
}

impl CoordinatorCounters {
    pub fn record_auth_failure(&self, reason: &'static str) {
        *self.auth_failures.lock().entry(reason).or_insert(0) += 1;
    }

    pub fn auth_failures(&self, reason: &str) -> u64 {
        self.auth_failures.lock().get(reason).copied().unwrap_or(0)
    }
}

struct PeerEntry {
    role: Role,
    outbound: mpsc::Sender<SocketOutput>,
    /// Chosen relay, clients only
    relay: Option<Alias>,
    /// Set while the client waits for a relay
    holding_since: Option<Instant>,
}

struct Registry {
    peers: HashMap<Alias, PeerEntry>,
    next_alias: u64,
    max_peers: usize,
    selector: Box<dyn RelaySelector>,
}

impl Registry {
    /// Allocate the next alias. Aliases are never reused within a
    /// coordinator lifetime; when the counter would wrap, new
    /// connections are refused.
    fn allocate_alias(&mut self) -> CommResult<Alias> {
        if self.next_alias == u64::MAX {
            return Err(CommError::Internal(
                "alias space exhausted, refusing connection".to_string(),
            ));
        }
        let alias = self.next_alias;
        self.next_alias += 1;
        Ok(alias)
    }

    fn servers(&self) -> Vec<Alias> {
        let mut servers: Vec<Alias> = self
            .peers
            .iter()
            .filter(|(_, entry)| entry.role == Role::CommunicationServer)
            .map(|(alias, _)| *alias)
            .collect();
        servers.sort();
        servers
    }

    /// Highest score wins; equal scores break toward the smallest
    /// alias, which the sorted candidate order gives for free.
    fn choose_relay(&mut self) -> Option<Alias> {
        let candidates = self.servers();
        let mut best: Option<(u64, Alias)> = None;
        for alias in candidates {
            let score = self.selector.score(alias);
            match best {
                Some((best_score, _)) if score <= best_score => {}
                _ => best = Some((score, alias)),
            }
        }
        best.map(|(_, alias)| alias)
    }
}

/// The coordinator service
pub struct Coordinator {
    commands: mpsc::Sender<Command>,
    auth: Arc<Authenticator>,
    codec: Codec,
    config: CoordinatorConfig,
    pub counters: Arc<CoordinatorCounters>,
    accepting: AtomicBool,
}

impl Coordinator {
    /// Build the service and start its worker and tick tasks.
    pub fn new(
        config: CoordinatorConfig,
        auth: Arc<Authenticator>,
        selector: Box<dyn RelaySelector>,
        reporter: Reporter,
    ) -> Arc<Self> {
        let (commands_tx, commands_rx) = mpsc::channel(1024);
        let counters = Arc::new(CoordinatorCounters::default());

        let coordinator = Arc::new(Self {
            commands: commands_tx.clone(),
            auth,
            codec: Codec::default(),
            config: config.clone(),
            counters: counters.clone(),
            accepting: AtomicBool::new(true),
        });

        let registry = Registry {
            peers: HashMap::new(),
            next_alias: 1,
            max_peers: config.max_peers,
            selector,
        };
        tokio::spawn(run_worker(registry, commands_rx, counters, reporter));

        let holding_tx = commands_tx.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(HOLDING_TICK);
            loop {
                tick.tick().await;
                if holding_tx.send(Command::ReassessHolding).await.is_err() {
                    break;
                }
            }
        });

        let report_tx = commands_tx;
        let period = Duration::from_secs(config.report_period.max(1));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.tick().await; // first tick is immediate, skip it
            loop {
                tick.tick().await;
                if report_tx.send(Command::Report).await.is_err() {
                    break;
                }
            }
        });

        coordinator
    }

    /// Command queue handle, for sockets and tests
    pub fn commands(&self) -> mpsc::Sender<Command> {
        self.commands.clone()
    }

    /// HTTP surface: the signaling upgrade plus the operational probes
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/connect", get(connect_handler))
            .route("/status", get(status_handler))
            .route("/version", get(version_handler))
            .with_state(self.clone())
    }

    /// Bind and serve until the process ends
    pub async fn serve(self: Arc<Self>) -> CommResult<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        info!(addr, "coordinator listening");
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let router = self.router();
        axum::serve(listener, router)
            .await
            .map_err(|e| CommError::Transport(format!("serve: {}", e)))
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Register a freshly upgraded socket and run its read/write loops
    async fn handle_socket(self: Arc<Self>, socket: WebSocket, role: Role) {
        let (outbound_tx, outbound_rx) =
            mpsc::channel::<SocketOutput>(self.config.outbound_queue_size);
        // The reader only needs the queue to push a protocol-error
        // close; a weak handle keeps close-on-drop working when the
        // worker expels this socket.
        let outbound_for_reader = outbound_tx.downgrade();

        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Register {
                role,
                outbound: outbound_tx,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return;
        }
        let alias = match reply_rx.await {
            Ok(Ok(alias)) => alias,
            Ok(Err(e)) => {
                warn!(error = %e, "registration refused");
                self.counters.refused_connections.fetch_add(1, Ordering::Relaxed);
                close_socket(socket, 1013, "try again later").await;
                return;
            }
            Err(_) => return,
        };
        debug!(alias, ?role, "signaling socket registered");

        let (ws_write, ws_read) = socket.split();
        let writer = tokio::spawn(write_socket(ws_write, outbound_rx, self.codec.clone()));
        self.clone().read_socket(ws_read, alias, outbound_for_reader).await;

        // Deregistering drops the worker's sender; the writer drains
        // what is queued, closes the stream and finishes.
        let _ = self.commands.send(Command::Deregister { alias }).await;
        let _ = writer.await;
    }

    async fn read_socket(
        self: Arc<Self>,
        mut ws_read: futures_util::stream::SplitStream<WebSocket>,
        alias: Alias,
        outbound: mpsc::WeakSender<SocketOutput>,
    ) {
        while let Some(message) = ws_read.next().await {
            let framed = match message {
                Ok(WsMessage::Binary(framed)) => framed,
                Ok(WsMessage::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };
            let envelope = match self
                .codec
                .deframe(&framed)
                .and_then(|payload| self.codec.decode(payload))
            {
                Ok(envelope) => envelope,
                Err(e) => {
                    // Protocol faults are local to this peer: close its
                    // socket with the category's close code.
                    warn!(alias, error = %e, "bad signaling frame, closing socket");
                    if let Some(sender) = outbound.upgrade() {
                        let _ = sender.try_send(SocketOutput::Close {
                            code: e.ws_close_code(),
                            reason: "malformed signaling frame".to_string(),
                        });
                    }
                    break;
                }
            };
            if self
                .commands
                .send(Command::Signal {
                    from: alias,
                    envelope,
                })
                .await
                .is_err()
            {
                break;
            }
        }
    }
}

async fn close_socket(mut socket: WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(WsMessage::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

async fn write_socket(
    mut ws_write: futures_util::stream::SplitSink<WebSocket, WsMessage>,
    mut outbound_rx: mpsc::Receiver<SocketOutput>,
    codec: Codec,
) {
    while let Some(output) = outbound_rx.recv().await {
        match output {
            SocketOutput::Envelope(envelope) => {
                let framed = match codec.frame(&envelope.encode()) {
                    Ok(framed) => framed,
                    Err(e) => {
                        warn!(error = %e, "cannot frame signaling envelope");
                        continue;
                    }
                };
                if ws_write.send(WsMessage::Binary(framed)).await.is_err() {
                    break;
                }
            }
            SocketOutput::Close { code, reason } => {
                let _ = ws_write
                    .send(WsMessage::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                return;
            }
        }
    }
    // Queue gone without an explicit close: the worker dropped this
    // socket (overflow or shutdown). Close out the stream.
    let _ = ws_write.send(WsMessage::Close(None)).await;
}

async fn connect_handler(
    State(coordinator): State<Arc<Coordinator>>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    // Role is inferred from the credential shape: servers present the
    // shared secret, clients the identity tuple.
    let role = if params.contains_key("secret") {
        Role::CommunicationServer
    } else {
        Role::Client
    };

    if let Err(e) = coordinator.auth.authenticate_from_url(
        role,
        "GET",
        &coordinator.config.coordinator_url,
        &params,
    ) {
        coordinator.counters.record_auth_failure(e.reason());
        warn!(?role, error = %e, "upgrade rejected");
        return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
    }

    let coordinator = coordinator.clone();
    ws.on_upgrade(move |socket| coordinator.handle_socket(socket, role))
}

async fn status_handler(State(coordinator): State<Arc<Coordinator>>) -> Response {
    if coordinator.is_accepting() {
        StatusCode::OK.into_response()
    } else {
        StatusCode::SERVICE_UNAVAILABLE.into_response()
    }
}

async fn version_handler() -> Response {
    axum::Json(serde_json::json!({ "version": env!("CARGO_PKG_VERSION") })).into_response()
}

/// The single worker that owns the registry
async fn run_worker(
    mut registry: Registry,
    mut commands: mpsc::Receiver<Command>,
    counters: Arc<CoordinatorCounters>,
    reporter: Reporter,
) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Register {
                role,
                outbound,
                reply,
            } => {
                let result = register_peer(&mut registry, role, outbound, &counters);
                let _ = reply.send(result);
            }
            Command::Deregister { alias } => deregister_peer(&mut registry, alias),
            Command::Signal { from, envelope } => {
                route_signal(&mut registry, from, envelope, &counters)
            }
            Command::ReassessHolding => reassess_holding(&mut registry, &counters),
            Command::Report => {
                let stats = snapshot(&registry);
                reporter(&stats);
            }
        }
    }
}

fn register_peer(
    registry: &mut Registry,
    role: Role,
    outbound: mpsc::Sender<SocketOutput>,
    counters: &CoordinatorCounters,
) -> CommResult<Alias> {
    if registry.peers.len() >= registry.max_peers {
        return Err(CommError::Internal("peer limit reached".to_string()));
    }
    let alias = registry.allocate_alias()?;
    registry.peers.insert(
        alias,
        PeerEntry {
            role,
            outbound,
            relay: None,
            holding_since: None,
        },
    );

    match role {
        Role::CommunicationServer => {
            info!(alias, "communication server joined");
            send_to(registry, alias, welcome(alias, Vec::new()), counters);
            // Existing relays dial the newcomer so the mesh stays full.
            let others: Vec<Alias> = registry
                .servers()
                .into_iter()
                .filter(|other| *other != alias)
                .collect();
            for other in others {
                send_to(
                    registry,
                    other,
                    Envelope::Connect(ConnectMessage {
                        r#type: MessageType::Connect as i32,
                        from_alias: other,
                        to_alias: alias,
                    }),
                    counters,
                );
            }
            // A relay appearing may free held clients right away.
            reassess_holding(registry, counters);
        }
        _ => {
            info!(alias, "client joined");
            place_client(registry, alias, counters);
        }
    }
    Ok(alias)
}

/// Choose a relay for one client, or park it in the holding state.
/// The WELCOME's server list leads with the chosen relay.
fn place_client(registry: &mut Registry, alias: Alias, counters: &CoordinatorCounters) {
    match registry.choose_relay() {
        Some(relay) => {
            let mut servers = registry.servers();
            servers.retain(|s| *s != relay);
            servers.insert(0, relay);
            if let Some(entry) = registry.peers.get_mut(&alias) {
                entry.relay = Some(relay);
                entry.holding_since = None;
            }
            send_to(registry, alias, welcome(alias, servers), counters);
            send_to(
                registry,
                relay,
                Envelope::Connect(ConnectMessage {
                    r#type: MessageType::Connect as i32,
                    from_alias: relay,
                    to_alias: alias,
                }),
                counters,
            );
            info!(alias, relay, "client placed");
        }
        None => {
            let mut newly_holding = false;
            if let Some(entry) = registry.peers.get_mut(&alias) {
                entry.relay = None;
                if entry.holding_since.is_none() {
                    entry.holding_since = Some(Instant::now());
                    newly_holding = true;
                }
            }
            // An empty relay list tells the client it is being held;
            // only the transition is announced, not every tick.
            if newly_holding {
                send_to(registry, alias, welcome(alias, Vec::new()), counters);
                debug!(alias, "no relay available, client holding");
            }
        }
    }
}

fn deregister_peer(registry: &mut Registry, alias: Alias) {
    let Some(entry) = registry.peers.remove(&alias) else {
        return;
    };
    info!(alias, role = ?entry.role, "peer left");
    if entry.role != Role::CommunicationServer {
        return;
    }
    // Clients served by a departed relay go back to holding and are
    // reassigned or expired by the holding pass.
    let orphaned: Vec<Alias> = registry
        .peers
        .iter()
        .filter(|(_, e)| e.relay == Some(alias))
        .map(|(a, _)| *a)
        .collect();
    for client in orphaned {
        if let Some(e) = registry.peers.get_mut(&client) {
            e.relay = None;
            e.holding_since = Some(Instant::now());
        }
    }
}

fn route_signal(
    registry: &mut Registry,
    from: Alias,
    envelope: Envelope,
    counters: &CoordinatorCounters,
) {
    match envelope {
        Envelope::WebRtc(message) => {
            // The sender cannot speak for another alias.
            if message.from_alias != from {
                warn!(
                    from,
                    claimed = message.from_alias,
                    "signaling envelope with forged source"
                );
                return;
            }
            let to = message.to_alias;
            if !registry.peers.contains_key(&to) {
                // Silent drop: do not leak presence.
                counters.unknown_destination.fetch_add(1, Ordering::Relaxed);
                return;
            }
            send_to(registry, to, Envelope::WebRtc(message), counters);
        }
        Envelope::Connect(message) => {
            // A client may ask for a connection; the coordinator flips
            // the instruction toward the relay, which initiates.
            if message.from_alias != from {
                warn!(from, claimed = message.from_alias, "connect with forged source");
                return;
            }
            let relay = message.to_alias;
            let Some(entry) = registry.peers.get(&relay) else {
                counters.unknown_destination.fetch_add(1, Ordering::Relaxed);
                return;
            };
            if entry.role != Role::CommunicationServer {
                warn!(from, relay, "connect target is not a relay");
                return;
            }
            send_to(
                registry,
                relay,
                Envelope::Connect(ConnectMessage {
                    r#type: MessageType::Connect as i32,
                    from_alias: relay,
                    to_alias: from,
                }),
                counters,
            );
        }
        other => {
            debug!(from, message_type = ?other.message_type(), "unexpected signaling envelope");
        }
    }
}

fn reassess_holding(registry: &mut Registry, counters: &CoordinatorCounters) {
    let holding: Vec<(Alias, Instant)> = registry
        .peers
        .iter()
        .filter(|(_, entry)| entry.role != Role::CommunicationServer)
        .filter_map(|(alias, entry)| entry.holding_since.map(|since| (*alias, since)))
        .collect();

    for (alias, since) in holding {
        if since.elapsed() >= HOLDING_LIMIT {
            warn!(alias, "holding window expired, disconnecting client");
            if let Some(entry) = registry.peers.get(&alias) {
                let _ = entry.outbound.try_send(SocketOutput::Close {
                    code: 1000,
                    reason: REASON_NO_RELAY.to_string(),
                });
            }
            registry.peers.remove(&alias);
            continue;
        }
        place_client(registry, alias, counters);
    }
}

fn welcome(alias: Alias, available_servers: Vec<Alias>) -> Envelope {
    Envelope::Welcome(WelcomeMessage {
        r#type: MessageType::Welcome as i32,
        alias,
        available_servers,
    })
}

/// Push an envelope into a socket's outbound queue. Overflow means
/// the peer is lagging or hostile: the socket is closed.
fn send_to(
    registry: &mut Registry,
    alias: Alias,
    envelope: Envelope,
    counters: &CoordinatorCounters,
) {
    let Some(entry) = registry.peers.get(&alias) else {
        return;
    };
    match entry.outbound.try_send(SocketOutput::Envelope(envelope)) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            // Dropping the entry drops the only sender; the writer
            // drains what is queued and closes the socket.
            warn!(alias, "signaling backlog overflow, closing socket");
            counters.socket_overflows.fetch_add(1, Ordering::Relaxed);
            registry.peers.remove(&alias);
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            registry.peers.remove(&alias);
        }
    }
}

fn snapshot(registry: &Registry) -> CoordinatorStats {
    let mut stats = CoordinatorStats::default();
    for entry in registry.peers.values() {
        match entry.role {
            Role::CommunicationServer => stats.server_count += 1,
            _ => stats.client_count += 1,
        }
        stats
            .signaling_backlogs
            .push(entry.outbound.max_capacity() - entry.outbound.capacity());
    }
    stats
}
