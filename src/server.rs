//! Communication server (relay) assembly
//!
//! Owns the whole relay: the signaling link to the coordinator, the
//! peer arena keyed by alias, the subscription indices, the forwarding
//! engine and the reporter. All shared state lives in one `CommServer`
//! value constructed at startup and passed explicitly; there are no
//! process globals.
//!
//! Peers are held in an arena keyed by alias and indices reference
//! aliases only, never handles; anything resolving an alias does so
//! under the arena read lock and treats a missing entry as "peer tore
//! down, drop silently".

use crate::auth::Authenticator;
use crate::codec::{Codec, Envelope};
use crate::config::ServerConfig;
use crate::error::{CommError, CommResult};
use crate::forward::{ForwardingEngine, Handled};
use crate::peer::{PeerConnection, PeerEvent, PeerOptions, PeerState};
use crate::proto::{Format, MessageType, Role, SubscriptionMessage, WebRtcMessage};
use crate::reporter::{PeerStatsSnapshot, Reporter, StatsSink, Totals};
use crate::signaling::SignalingLink;
use crate::topics::{encode_plain_topics, AggregateSubscription, Alias, SubscriptionIndex};
use parking_lot::{Mutex, RwLock};
use prost::Message;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The relay service
pub struct CommServer {
    config: ServerConfig,
    authenticator: Arc<Authenticator>,
    codec: Codec,
    own_alias: AtomicU64,
    peers: Arc<RwLock<HashMap<Alias, Arc<PeerConnection>>>>,
    engine: ForwardingEngine<Arc<PeerConnection>>,
    index: Arc<RwLock<SubscriptionIndex>>,
    aggregate: Mutex<AggregateSubscription>,
    retired: Mutex<Totals>,
    reporter: Mutex<Reporter>,
    cancel: CancellationToken,
}

impl CommServer {
    pub fn new(config: ServerConfig, authenticator: Arc<Authenticator>, sink: StatsSink) -> Arc<Self> {
        let codec = Codec::new(config.max_body_len);
        let index = Arc::new(RwLock::new(SubscriptionIndex::new(
            config.subscription_max_per_peer,
        )));
        let peers: Arc<RwLock<HashMap<Alias, Arc<PeerConnection>>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let engine = ForwardingEngine::new(index.clone(), peers.clone(), codec.clone());

        Arc::new(Self {
            config,
            authenticator,
            codec,
            own_alias: AtomicU64::new(0),
            peers,
            engine,
            index,
            aggregate: Mutex::new(AggregateSubscription::new()),
            retired: Mutex::new(Totals::default()),
            reporter: Mutex::new(Reporter::new(sink)),
            cancel: CancellationToken::new(),
        })
    }

    /// Alias assigned by the coordinator, 0 until WELCOME arrives
    pub fn alias(&self) -> Alias {
        self.own_alias.load(Ordering::SeqCst)
    }

    /// Request teardown of the whole relay
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn peer_options(&self) -> PeerOptions {
        PeerOptions {
            ice_servers: self.config.ice_servers.clone(),
            outbound_queue_size: self.config.outbound_queue_size,
            auth_timeout: Duration::from_secs(self.config.auth_timeout_secs),
            ice_timeout: Duration::from_secs(self.config.ice_timeout_secs),
            send_timeout: Duration::from_secs(self.config.send_timeout_secs),
            max_body_len: self.config.max_body_len,
        }
    }

    /// Connect to the coordinator and run until shutdown or, with
    /// `exit_on_coordinator_close`, until the signaling link drops.
    pub async fn run(self: Arc<Self>) -> CommResult<()> {
        let url = self
            .authenticator
            .server_connect_url(&self.config.coordinator_url);
        let connect_deadline = Duration::from_secs(self.config.connect_timeout_secs);
        let (link, mut inbound) = tokio::time::timeout(
            connect_deadline,
            SignalingLink::connect(&url, self.codec.clone()),
        )
        .await
        .map_err(|_| CommError::Transport("coordinator connect timed out".to_string()))??;
        let link_closed = link.closed();

        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<(Alias, PeerEvent)>();
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<WebRtcMessage>();

        let mut report_tick =
            tokio::time::interval(Duration::from_secs(self.config.report_period.max(1)));
        report_tick.tick().await;
        let mut debounce_tick = tokio::time::interval(Duration::from_millis(
            self.config.subscription_debounce_ms.max(1),
        ));
        debounce_tick.tick().await;

        let mut link_lost = false;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("relay shutting down");
                    break;
                }
                _ = link_closed.cancelled(), if !link_lost => {
                    link_lost = true;
                    self.on_link_lost().await;
                    if self.config.exit_on_coordinator_close {
                        return Err(CommError::Transport(
                            "coordinator link closed".to_string(),
                        ));
                    }
                }
                envelope = inbound.recv(), if !link_lost => {
                    match envelope {
                        Some(envelope) => {
                            if let Err(e) = self
                                .handle_signaling(envelope, &events_tx, &signal_tx)
                                .await
                            {
                                warn!(error = %e, "signaling envelope failed");
                            }
                        }
                        None => {
                            // Reader ended; the closed token fires on the
                            // next pass.
                        }
                    }
                }
                Some((alias, event)) = events_rx.recv() => {
                    self.handle_peer_event(alias, event).await;
                }
                Some(message) = signal_rx.recv() => {
                    if !link_lost {
                        let _ = link.send(Envelope::WebRtc(message));
                    }
                }
                _ = report_tick.tick() => self.report(),
                _ = debounce_tick.tick() => self.flush_aggregate(),
            }
        }
        Ok(())
    }

    /// One envelope from the coordinator
    async fn handle_signaling(
        self: &Arc<Self>,
        envelope: Envelope,
        events_tx: &mpsc::UnboundedSender<(Alias, PeerEvent)>,
        signal_tx: &mpsc::UnboundedSender<WebRtcMessage>,
    ) -> CommResult<()> {
        match envelope {
            Envelope::Welcome(message) => {
                self.own_alias.store(message.alias, Ordering::SeqCst);
                info!(alias = message.alias, "welcome from coordinator");
                Ok(())
            }
            Envelope::Connect(message) => {
                // The coordinator tells us to initiate toward the
                // named remote alias.
                self.initiate_peer(message.to_alias, events_tx, signal_tx)
                    .await
            }
            Envelope::WebRtc(message) => {
                let message_type = MessageType::try_from(message.r#type)
                    .unwrap_or(MessageType::UnknownMessageType);
                match message_type {
                    MessageType::WebrtcOffer => {
                        let peer = match self.lookup(message.from_alias) {
                            Some(peer) => peer,
                            None => {
                                self.accept_peer(message.from_alias, events_tx, signal_tx)
                                    .await?
                            }
                        };
                        peer.handle_offer(&message.sdp).await
                    }
                    MessageType::WebrtcAnswer => match self.lookup(message.from_alias) {
                        Some(peer) => peer.handle_answer(&message.sdp).await,
                        None => {
                            debug!(alias = message.from_alias, "answer for unknown peer");
                            Ok(())
                        }
                    },
                    MessageType::WebrtcIceCandidate => match self.lookup(message.from_alias) {
                        Some(peer) => peer.handle_candidate(&message.sdp).await,
                        None => {
                            debug!(alias = message.from_alias, "candidate for unknown peer");
                            Ok(())
                        }
                    },
                    other => Err(CommError::Protocol(format!(
                        "unexpected webrtc envelope type {:?}",
                        other
                    ))),
                }
            }
            other => {
                debug!(message_type = ?other.message_type(), "unexpected signaling envelope");
                Ok(())
            }
        }
    }

    fn lookup(&self, alias: Alias) -> Option<Arc<PeerConnection>> {
        self.peers.read().get(&alias).cloned()
    }

    async fn new_peer(
        self: &Arc<Self>,
        alias: Alias,
        events_tx: &mpsc::UnboundedSender<(Alias, PeerEvent)>,
        signal_tx: &mpsc::UnboundedSender<WebRtcMessage>,
    ) -> CommResult<Arc<PeerConnection>> {
        if self.peers.read().len() >= self.config.max_peers {
            return Err(CommError::Overflow("peer limit reached".to_string()));
        }
        let peer = PeerConnection::new(
            alias,
            self.alias(),
            Role::UnknownRole,
            self.authenticator.clone(),
            self.peer_options(),
            events_tx.clone(),
            signal_tx.clone(),
            self.cancel.child_token(),
        )
        .await?;
        self.peers.write().insert(alias, peer.clone());
        Ok(peer)
    }

    /// Initiate a session toward `alias` (we are the offerer)
    async fn initiate_peer(
        self: &Arc<Self>,
        alias: Alias,
        events_tx: &mpsc::UnboundedSender<(Alias, PeerEvent)>,
        signal_tx: &mpsc::UnboundedSender<WebRtcMessage>,
    ) -> CommResult<()> {
        if self.lookup(alias).is_some() {
            debug!(alias, "connect for an existing peer, ignoring");
            return Ok(());
        }
        let peer = self.new_peer(alias, events_tx, signal_tx).await?;
        if let Err(e) = peer.open().await {
            warn!(alias, error = %e, "initiate failed");
            peer.close("initiate_failed").await;
            return Err(e);
        }
        info!(alias, "initiating session");
        Ok(())
    }

    /// Accept a session initiated by the remote side (we answer)
    async fn accept_peer(
        self: &Arc<Self>,
        alias: Alias,
        events_tx: &mpsc::UnboundedSender<(Alias, PeerEvent)>,
        signal_tx: &mpsc::UnboundedSender<WebRtcMessage>,
    ) -> CommResult<Arc<PeerConnection>> {
        info!(alias, "accepting session");
        self.new_peer(alias, events_tx, signal_tx).await
    }

    async fn handle_peer_event(self: &Arc<Self>, alias: Alias, event: PeerEvent) {
        match event {
            PeerEvent::ChannelsOpen => {
                // Present our server credential; relays validate it,
                // clients ignore it and send their own AUTH.
                let Some(peer) = self.lookup(alias) else { return };
                if let Some(auth) = self.authenticator.server_auth_message() {
                    if let Err(e) = peer.send_reliable(auth.encode_to_vec()) {
                        warn!(alias, error = %e, "cannot present server credential");
                    }
                }
            }
            PeerEvent::Authenticated(_identity) => {
                let Some(peer) = self.lookup(alias) else { return };
                if peer.role() == Role::CommunicationServer {
                    // A fresh relay link needs our current aggregate to
                    // route cross-relay traffic.
                    let snapshot = self.aggregate.lock().snapshot();
                    if !snapshot.is_empty() {
                        let message = SubscriptionMessage {
                            r#type: MessageType::Subscription as i32,
                            format: Format::Plain as i32,
                            topics: encode_plain_topics(&snapshot),
                        };
                        if let Err(e) = peer.send_reliable(message.encode_to_vec()) {
                            warn!(alias, error = %e, "cannot push aggregate");
                        }
                    }
                }
            }
            PeerEvent::Message { lane, data } => {
                let Some(peer) = self.lookup(alias) else { return };
                let identity = peer.identity().unwrap_or_default();
                match self
                    .engine
                    .handle_frame(alias, peer.role(), &identity, lane, &data)
                {
                    Ok(Handled::Subscription(delta)) => {
                        if peer.role() != Role::CommunicationServer && !delta.is_empty() {
                            self.aggregate.lock().apply_delta(&delta);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        // Protocol faults are local to the peer.
                        warn!(alias, error = %e, "closing peer on bad frame");
                        peer.close("protocol_error").await;
                    }
                }
            }
            PeerEvent::Closed { reason } => {
                let removed = self.peers.write().remove(&alias);
                let removed_topics = self.index.write().remove_peer(alias);
                if let Some(peer) = removed {
                    if peer.role() != Role::CommunicationServer && !removed_topics.is_empty() {
                        self.aggregate.lock().remove_topics(&removed_topics);
                    }
                    self.retired.lock().add(&snapshot_of(&peer, 0).totals());
                }
                info!(alias, reason, "peer closed");
            }
        }
    }

    /// Push the aggregate to every ready relay link; called on the
    /// debounce tick so bursts coalesce into one wire message.
    fn flush_aggregate(&self) {
        let payload = {
            let mut aggregate = self.aggregate.lock();
            if !aggregate.take_dirty() {
                return;
            }
            encode_plain_topics(&aggregate.snapshot())
        };
        let message = SubscriptionMessage {
            r#type: MessageType::Subscription as i32,
            format: Format::Plain as i32,
            topics: payload,
        };
        let encoded = message.encode_to_vec();

        let servers: Vec<Arc<PeerConnection>> = {
            let peers = self.peers.read();
            peers
                .values()
                .filter(|peer| {
                    peer.role() == Role::CommunicationServer && peer.state() == PeerState::Ready
                })
                .cloned()
                .collect()
        };
        for peer in servers {
            if let Err(e) = peer.send_reliable(encoded.clone()) {
                warn!(alias = peer.alias, error = %e, "aggregate push failed");
            }
        }
    }

    /// In-flight ICE exchanges die with the signaling link; established
    /// sessions are independent of it and stay up.
    async fn on_link_lost(&self) {
        warn!("signaling link lost");
        let negotiating: Vec<Arc<PeerConnection>> = {
            let peers = self.peers.read();
            peers
                .values()
                .filter(|peer| peer.state() == PeerState::Negotiating)
                .cloned()
                .collect()
        };
        for peer in negotiating {
            peer.close("signaling_lost").await;
        }
    }

    fn report(&self) {
        let snapshots: Vec<PeerStatsSnapshot> = {
            let peers = self.peers.read();
            let index = self.index.read();
            peers
                .values()
                .map(|peer| snapshot_of(peer, index.peer_topic_count(peer.alias)))
                .collect()
        };
        let topic_count = self.engine.topic_count();
        let retired = *self.retired.lock();
        self.reporter.lock().report(snapshots, topic_count, retired);
    }

    /// Test and tooling access to the subscription indices
    pub fn subscription_index(&self) -> Arc<RwLock<SubscriptionIndex>> {
        self.index.clone()
    }
}

fn snapshot_of(peer: &Arc<PeerConnection>, topic_count: usize) -> PeerStatsSnapshot {
    let counters = &peer.counters;
    PeerStatsSnapshot {
        alias: peer.alias,
        role: peer.role(),
        state: peer.state(),
        topic_count,
        reliable_messages_sent: counters.reliable_messages_sent.load(Ordering::Relaxed),
        reliable_messages_received: counters.reliable_messages_received.load(Ordering::Relaxed),
        reliable_bytes_sent: counters.reliable_bytes_sent.load(Ordering::Relaxed),
        reliable_bytes_received: counters.reliable_bytes_received.load(Ordering::Relaxed),
        unreliable_messages_sent: counters.unreliable_messages_sent.load(Ordering::Relaxed),
        unreliable_messages_received: counters
            .unreliable_messages_received
            .load(Ordering::Relaxed),
        unreliable_bytes_sent: counters.unreliable_bytes_sent.load(Ordering::Relaxed),
        unreliable_bytes_received: counters.unreliable_bytes_received.load(Ordering::Relaxed),
        unreliable_dropped: counters.unreliable_dropped.load(Ordering::Relaxed),
    }
}
