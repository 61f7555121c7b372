//! WebRTC peer connection management (relay side)
//!
//! Owns the WebRTC session for one remote peer: the peer connection,
//! the reliable/unreliable data-channel pair, the outbound queues and
//! the lifecycle state machine. Session negotiation happens over the
//! signaling link; this module only produces and consumes the
//! offer/answer/candidate payloads.
//!
//! ## State machine
//!
//! `Negotiating → Authenticating → Ready → Closing → Closed`.
//! Channels opening moves the peer to Authenticating; a valid AUTH
//! envelope within the auth timeout moves it to Ready; close requests,
//! ICE failure or a channel closing move it to Closing; the underlying
//! session reporting closed moves it to Closed, releasing resources
//! exactly once.
//!
//! ## Backpressure
//!
//! Each lane has a bounded outbound queue. Unreliable overflow drops
//! the newest message and counts it; reliable overflow closes the peer
//! with reason `reliable_overflow`, because a peer that cannot drain
//! its reliable lane is persistently slow and must be expelled to
//! protect the relay.

use crate::auth::{Authenticator, Identity};
use crate::codec::Codec;
use crate::error::{CommError, CommResult};
use crate::proto::{AuthMessage, MessageType, Role, WebRtcMessage};
use crate::topics::Alias;
use bytes::Bytes;
use prost::Message;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

pub const RELIABLE_CHANNEL_LABEL: &str = "reliable";
pub const UNRELIABLE_CHANNEL_LABEL: &str = "unreliable";

/// Delivery lane of a data-channel message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Lane {
    /// Ordered, retransmitted
    Reliable,
    /// Unordered, no retransmit
    Unreliable,
}

/// Peer lifecycle states
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    Negotiating,
    Authenticating,
    Ready,
    Closing,
    Closed,
}

/// Serialized lifecycle transitions, kept separate from the session
/// plumbing so the transition rules are testable on their own.
#[derive(Debug)]
pub struct PeerStateMachine {
    state: PeerState,
}

impl Default for PeerStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerStateMachine {
    pub fn new() -> Self {
        Self {
            state: PeerState::Negotiating,
        }
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Negotiating → Authenticating on both channels open
    pub fn on_channels_open(&mut self) -> bool {
        if self.state == PeerState::Negotiating {
            self.state = PeerState::Authenticating;
            true
        } else {
            false
        }
    }

    /// Authenticating → Ready on a valid AUTH message
    pub fn on_authenticated(&mut self) -> bool {
        if self.state == PeerState::Authenticating {
            self.state = PeerState::Ready;
            true
        } else {
            false
        }
    }

    /// Any live state → Closing on close(), ICE failure or channel
    /// close. Returns false once closing has already begun.
    pub fn on_closing(&mut self) -> bool {
        match self.state {
            PeerState::Closing | PeerState::Closed => false,
            _ => {
                self.state = PeerState::Closing;
                true
            }
        }
    }

    /// Closing → Closed once the session reports closed
    pub fn on_session_closed(&mut self) -> bool {
        if self.state == PeerState::Closed {
            false
        } else {
            self.state = PeerState::Closed;
            true
        }
    }
}

/// Events emitted by a peer connection toward the relay's event loop
#[derive(Debug)]
pub enum PeerEvent {
    /// Both data channels are open; authentication may begin
    ChannelsOpen,
    /// AUTH validated; the peer's role and identity are final
    Authenticated(Identity),
    /// A data-channel message arrived while Ready
    Message { lane: Lane, data: Vec<u8> },
    /// The session is gone and all resources are released
    Closed { reason: String },
}

/// Per-peer traffic counters, single-owner on the hot path
#[derive(Debug, Default)]
pub struct PeerCounters {
    pub reliable_messages_sent: AtomicU64,
    pub reliable_messages_received: AtomicU64,
    pub reliable_bytes_sent: AtomicU64,
    pub reliable_bytes_received: AtomicU64,
    pub unreliable_messages_sent: AtomicU64,
    pub unreliable_messages_received: AtomicU64,
    pub unreliable_bytes_sent: AtomicU64,
    pub unreliable_bytes_received: AtomicU64,
    /// Newest-message drops on unreliable overflow
    pub unreliable_dropped: AtomicU64,
}

/// Construction parameters shared by every peer of one relay
#[derive(Clone, Debug)]
pub struct PeerOptions {
    pub ice_servers: Vec<String>,
    pub outbound_queue_size: usize,
    pub auth_timeout: Duration,
    pub ice_timeout: Duration,
    pub send_timeout: Duration,
    pub max_body_len: usize,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            outbound_queue_size: 256,
            auth_timeout: Duration::from_secs(10),
            ice_timeout: Duration::from_secs(20),
            send_timeout: Duration::from_secs(5),
            max_body_len: crate::codec::DEFAULT_MAX_BODY_LEN,
        }
    }
}

struct LaneQueues {
    reliable_tx: mpsc::Sender<Vec<u8>>,
    reliable_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    unreliable_tx: mpsc::Sender<Vec<u8>>,
    unreliable_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
}

/// One remote peer: WebRTC session, channel pair, queues, lifecycle
pub struct PeerConnection {
    pub alias: Alias,
    own_alias: Alias,
    pc: Arc<RTCPeerConnection>,
    state: Mutex<PeerStateMachine>,
    role: Mutex<Role>,
    identity: Mutex<Option<Identity>>,
    reliable: Mutex<Option<Arc<RTCDataChannel>>>,
    unreliable: Mutex<Option<Arc<RTCDataChannel>>>,
    /// Remote candidates held until the remote description is applied,
    /// drained in arrival order
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    remote_description_set: AtomicBool,
    queues: LaneQueues,
    events_tx: mpsc::UnboundedSender<(Alias, PeerEvent)>,
    signal_tx: mpsc::UnboundedSender<WebRtcMessage>,
    authenticator: Arc<Authenticator>,
    codec: Codec,
    options: PeerOptions,
    pub counters: PeerCounters,
    cancel: CancellationToken,
    closed_once: AtomicBool,
    close_reason: Mutex<Option<String>>,
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("alias", &self.alias)
            .field("state", &self.state.lock().state())
            .finish_non_exhaustive()
    }
}

impl PeerConnection {
    /// Create the underlying session. `own_alias` is this relay's
    /// alias, `alias` the remote peer's; `initial_role` is what we
    /// know before AUTH (a relay dialing another relay knows it is
    /// talking to a server, an accepted peer is unknown until it
    /// authenticates).
    pub async fn new(
        alias: Alias,
        own_alias: Alias,
        initial_role: Role,
        authenticator: Arc<Authenticator>,
        options: PeerOptions,
        events_tx: mpsc::UnboundedSender<(Alias, PeerEvent)>,
        signal_tx: mpsc::UnboundedSender<WebRtcMessage>,
        cancel: CancellationToken,
    ) -> CommResult<Arc<Self>> {
        let mut media = MediaEngine::default();
        media
            .register_default_codecs()
            .map_err(|e| CommError::Transport(format!("register codecs: {}", e)))?;
        let mut registry = webrtc::interceptor::registry::Registry::new();
        registry = register_default_interceptors(registry, &mut media)
            .map_err(|e| CommError::Transport(format!("register interceptors: {}", e)))?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: options.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| CommError::Transport(format!("new peer connection: {}", e)))?,
        );

        let (reliable_tx, reliable_rx) = mpsc::channel(options.outbound_queue_size);
        let (unreliable_tx, unreliable_rx) = mpsc::channel(options.outbound_queue_size);

        let peer = Arc::new(Self {
            alias,
            own_alias,
            pc,
            state: Mutex::new(PeerStateMachine::new()),
            role: Mutex::new(initial_role),
            identity: Mutex::new(None),
            reliable: Mutex::new(None),
            unreliable: Mutex::new(None),
            pending_candidates: Mutex::new(Vec::new()),
            remote_description_set: AtomicBool::new(false),
            queues: LaneQueues {
                reliable_tx,
                reliable_rx: Mutex::new(Some(reliable_rx)),
                unreliable_tx,
                unreliable_rx: Mutex::new(Some(unreliable_rx)),
            },
            events_tx,
            signal_tx,
            authenticator,
            codec: Codec::new(options.max_body_len),
            options,
            counters: PeerCounters::default(),
            cancel,
            closed_once: AtomicBool::new(false),
            close_reason: Mutex::new(None),
        });

        peer.register_session_callbacks();
        peer.spawn_ice_deadline();
        Ok(peer)
    }

    fn register_session_callbacks(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(peer) = weak.upgrade() else { return };
                    debug!(alias = peer.alias, ?state, "peer connection state");
                    match state {
                        RTCPeerConnectionState::Failed
                        | RTCPeerConnectionState::Disconnected => {
                            peer.close("ice_failure").await;
                        }
                        RTCPeerConnectionState::Closed => {
                            peer.finish_close().await;
                        }
                        _ => {}
                    }
                })
            }));

        let weak = Arc::downgrade(self);
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let weak = weak.clone();
                Box::pin(async move {
                    let (Some(peer), Some(candidate)) = (weak.upgrade(), candidate) else {
                        return;
                    };
                    let init = match candidate.to_json() {
                        Ok(init) => init,
                        Err(e) => {
                            warn!(alias = peer.alias, error = %e, "candidate to_json failed");
                            return;
                        }
                    };
                    let payload = match serde_json::to_vec(&init) {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!(alias = peer.alias, error = %e, "candidate serialize failed");
                            return;
                        }
                    };
                    let _ = peer.signal_tx.send(WebRtcMessage {
                        r#type: MessageType::WebrtcIceCandidate as i32,
                        from_alias: peer.own_alias,
                        to_alias: peer.alias,
                        sdp: payload,
                    });
                })
            }));

        // Answerer path: the initiator's channels arrive here, routed
        // by label.
        let weak = Arc::downgrade(self);
        self.pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(peer) = weak.upgrade() else { return };
                match dc.label() {
                    RELIABLE_CHANNEL_LABEL => peer.adopt_channel(Lane::Reliable, dc),
                    UNRELIABLE_CHANNEL_LABEL => peer.adopt_channel(Lane::Unreliable, dc),
                    other => {
                        warn!(alias = peer.alias, label = other, "unexpected data channel");
                    }
                }
            })
        }));
    }

    fn spawn_ice_deadline(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let deadline = self.options.ice_timeout;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(deadline) => {
                    let Some(peer) = weak.upgrade() else { return };
                    if peer.state() == PeerState::Negotiating {
                        peer.close("ice_timeout").await;
                    }
                }
            }
        });
    }

    /// Initiate the session: create both channels so they appear in
    /// the SDP, then send the offer through the signaling link.
    pub async fn open(self: &Arc<Self>) -> CommResult<()> {
        let reliable = self
            .pc
            .create_data_channel(
                RELIABLE_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| CommError::Transport(format!("create reliable channel: {}", e)))?;
        self.adopt_channel(Lane::Reliable, reliable);

        let unreliable = self
            .pc
            .create_data_channel(
                UNRELIABLE_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(false),
                    max_retransmits: Some(0),
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| CommError::Transport(format!("create unreliable channel: {}", e)))?;
        self.adopt_channel(Lane::Unreliable, unreliable);

        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| CommError::Transport(format!("create offer: {}", e)))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| CommError::Transport(format!("set local description: {}", e)))?;

        self.signal_tx
            .send(WebRtcMessage {
                r#type: MessageType::WebrtcOffer as i32,
                from_alias: self.own_alias,
                to_alias: self.alias,
                sdp: offer.sdp.into_bytes(),
            })
            .map_err(|_| CommError::Transport("signaling link gone".to_string()))?;
        Ok(())
    }

    /// Accept a remote offer and answer it
    pub async fn handle_offer(self: &Arc<Self>, sdp: &[u8]) -> CommResult<()> {
        let sdp = String::from_utf8(sdp.to_vec())
            .map_err(|e| CommError::Protocol(format!("offer not UTF-8: {}", e)))?;
        let offer = RTCSessionDescription::offer(sdp)
            .map_err(|e| CommError::Protocol(format!("parse offer: {}", e)))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| CommError::Transport(format!("set remote description: {}", e)))?;
        self.remote_description_set.store(true, Ordering::SeqCst);
        self.drain_pending_candidates().await;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| CommError::Transport(format!("create answer: {}", e)))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| CommError::Transport(format!("set local description: {}", e)))?;

        self.signal_tx
            .send(WebRtcMessage {
                r#type: MessageType::WebrtcAnswer as i32,
                from_alias: self.own_alias,
                to_alias: self.alias,
                sdp: answer.sdp.into_bytes(),
            })
            .map_err(|_| CommError::Transport("signaling link gone".to_string()))?;
        Ok(())
    }

    /// Apply the remote answer to our offer
    pub async fn handle_answer(self: &Arc<Self>, sdp: &[u8]) -> CommResult<()> {
        let sdp = String::from_utf8(sdp.to_vec())
            .map_err(|e| CommError::Protocol(format!("answer not UTF-8: {}", e)))?;
        let answer = RTCSessionDescription::answer(sdp)
            .map_err(|e| CommError::Protocol(format!("parse answer: {}", e)))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| CommError::Transport(format!("set remote description: {}", e)))?;
        self.remote_description_set.store(true, Ordering::SeqCst);
        self.drain_pending_candidates().await;
        Ok(())
    }

    /// Apply or buffer a remote ICE candidate
    pub async fn handle_candidate(self: &Arc<Self>, payload: &[u8]) -> CommResult<()> {
        let init: RTCIceCandidateInit = serde_json::from_slice(payload)
            .map_err(|e| CommError::Protocol(format!("parse candidate: {}", e)))?;
        if !self.remote_description_set.load(Ordering::SeqCst) {
            self.pending_candidates.lock().push(init);
            return Ok(());
        }
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| CommError::Transport(format!("add candidate: {}", e)))?;
        Ok(())
    }

    async fn drain_pending_candidates(self: &Arc<Self>) {
        let pending: Vec<RTCIceCandidateInit> =
            std::mem::take(&mut *self.pending_candidates.lock());
        for init in pending {
            if let Err(e) = self.pc.add_ice_candidate(init).await {
                warn!(alias = self.alias, error = %e, "buffered candidate rejected");
            }
        }
    }

    fn adopt_channel(self: &Arc<Self>, lane: Lane, dc: Arc<RTCDataChannel>) {
        match lane {
            Lane::Reliable => *self.reliable.lock() = Some(dc.clone()),
            Lane::Unreliable => *self.unreliable.lock() = Some(dc.clone()),
        }

        let weak = Arc::downgrade(self);
        let dc_for_open = dc.clone();
        dc.on_open(Box::new(move || {
            let weak = weak.clone();
            let dc = dc_for_open.clone();
            Box::pin(async move {
                let Some(peer) = weak.upgrade() else { return };
                peer.spawn_lane_writer(lane, dc);
                peer.on_channel_open();
            })
        }));

        let weak = Arc::downgrade(self);
        dc.on_close(Box::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(peer) = weak.upgrade() {
                    peer.close("channel_closed").await;
                }
            })
        }));

        let weak = Arc::downgrade(self);
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(peer) = weak.upgrade() {
                    peer.on_channel_message(lane, msg.data.to_vec()).await;
                }
            })
        }));
    }

    /// Both channels open → Authenticating, with the auth deadline armed
    fn on_channel_open(self: &Arc<Self>) {
        let both_open = self.reliable.lock().is_some() && self.unreliable.lock().is_some();
        if !both_open {
            return;
        }
        if !self.state.lock().on_channels_open() {
            return;
        }
        info!(alias = self.alias, "data channels open");
        let _ = self.events_tx.send((self.alias, PeerEvent::ChannelsOpen));

        let weak = Arc::downgrade(self);
        let deadline = self.options.auth_timeout;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(deadline) => {
                    let Some(peer) = weak.upgrade() else { return };
                    if peer.state() == PeerState::Authenticating {
                        peer.close("auth_timeout").await;
                    }
                }
            }
        });
    }

    async fn on_channel_message(self: &Arc<Self>, lane: Lane, data: Vec<u8>) {
        match lane {
            Lane::Reliable => {
                self.counters
                    .reliable_messages_received
                    .fetch_add(1, Ordering::Relaxed);
                self.counters
                    .reliable_bytes_received
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
            }
            Lane::Unreliable => {
                self.counters
                    .unreliable_messages_received
                    .fetch_add(1, Ordering::Relaxed);
                self.counters
                    .unreliable_bytes_received
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
            }
        }

        match self.state() {
            // AUTH travels on the reliable lane; an eager unreliable
            // frame racing it is dropped, not treated as a credential.
            PeerState::Authenticating if lane == Lane::Reliable => {
                self.handle_auth_message(&data).await
            }
            PeerState::Ready => {
                let _ = self
                    .events_tx
                    .send((self.alias, PeerEvent::Message { lane, data }));
            }
            state => {
                debug!(alias = self.alias, ?state, "message dropped out of state");
            }
        }
    }

    /// The first reliable message after channels open must be AUTH;
    /// anything else, or invalid credentials, expels the peer.
    async fn handle_auth_message(self: &Arc<Self>, data: &[u8]) {
        let envelope = match self.codec.peek_type(data) {
            Ok(MessageType::Auth) => match AuthMessage::decode(data) {
                Ok(message) => message,
                Err(e) => {
                    warn!(alias = self.alias, error = %e, "bad AUTH envelope");
                    self.close("auth_failed").await;
                    return;
                }
            },
            Ok(other) => {
                warn!(alias = self.alias, ?other, "expected AUTH, got something else");
                self.close("auth_failed").await;
                return;
            }
            Err(e) => {
                warn!(alias = self.alias, error = %e, "undecodable pre-auth message");
                self.close("auth_failed").await;
                return;
            }
        };

        let role = Role::try_from(envelope.role).unwrap_or(Role::UnknownRole);
        match self
            .authenticator
            .authenticate_from_message(role, &envelope.body)
        {
            Ok(identity) => {
                if !self.state.lock().on_authenticated() {
                    return;
                }
                *self.role.lock() = role;
                *self.identity.lock() = Some(identity.clone());
                info!(alias = self.alias, ?role, "peer authenticated");
                let _ = self
                    .events_tx
                    .send((self.alias, PeerEvent::Authenticated(identity)));
            }
            Err(e) => {
                warn!(alias = self.alias, error = %e, "authentication rejected");
                self.close("auth_failed").await;
            }
        }
    }

    fn spawn_lane_writer(self: &Arc<Self>, lane: Lane, dc: Arc<RTCDataChannel>) {
        let rx = match lane {
            Lane::Reliable => self.queues.reliable_rx.lock().take(),
            Lane::Unreliable => self.queues.unreliable_rx.lock().take(),
        };
        let Some(mut rx) = rx else { return };

        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let send_timeout = self.options.send_timeout;
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };
                let Some(peer) = weak.upgrade() else { break };
                let bytes = Bytes::from(message);
                let len = bytes.len() as u64;
                let sent = match lane {
                    Lane::Reliable => {
                        match tokio::time::timeout(send_timeout, dc.send(&bytes)).await {
                            Ok(Ok(_)) => true,
                            Ok(Err(e)) => {
                                warn!(alias = peer.alias, error = %e, "reliable send failed");
                                peer.close("transport_error").await;
                                break;
                            }
                            Err(_) => {
                                warn!(alias = peer.alias, "reliable send timed out");
                                peer.close("send_timeout").await;
                                break;
                            }
                        }
                    }
                    Lane::Unreliable => match dc.send(&bytes).await {
                        Ok(_) => true,
                        Err(e) => {
                            debug!(alias = peer.alias, error = %e, "unreliable send failed");
                            false
                        }
                    },
                };
                if sent {
                    match lane {
                        Lane::Reliable => {
                            peer.counters
                                .reliable_messages_sent
                                .fetch_add(1, Ordering::Relaxed);
                            peer.counters
                                .reliable_bytes_sent
                                .fetch_add(len, Ordering::Relaxed);
                        }
                        Lane::Unreliable => {
                            peer.counters
                                .unreliable_messages_sent
                                .fetch_add(1, Ordering::Relaxed);
                            peer.counters
                                .unreliable_bytes_sent
                                .fetch_add(len, Ordering::Relaxed);
                        }
                    }
                }
            }
        });
    }

    /// Enqueue on the reliable lane. A full queue means the peer is
    /// persistently slow: it is closed with `reliable_overflow` and
    /// the caller gets the overflow error.
    pub fn send_reliable(self: &Arc<Self>, data: Vec<u8>) -> CommResult<()> {
        match self.queues.reliable_tx.try_send(data) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                let peer = self.clone();
                tokio::spawn(async move {
                    peer.close("reliable_overflow").await;
                });
                Err(CommError::Overflow(format!(
                    "reliable queue full for peer {}",
                    self.alias
                )))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(CommError::Transport(format!(
                "peer {} reliable lane closed",
                self.alias
            ))),
        }
    }

    /// Enqueue on the unreliable lane. A full queue drops this newest
    /// message and counts it; the peer stays open.
    pub fn send_unreliable(self: &Arc<Self>, data: Vec<u8>) -> CommResult<()> {
        match self.queues.unreliable_tx.try_send(data) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters
                    .unreliable_dropped
                    .fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(CommError::Transport(format!(
                "peer {} unreliable lane closed",
                self.alias
            ))),
        }
    }

    pub fn send(self: &Arc<Self>, lane: Lane, data: Vec<u8>) -> CommResult<()> {
        match lane {
            Lane::Reliable => self.send_reliable(data),
            Lane::Unreliable => self.send_unreliable(data),
        }
    }

    /// Begin teardown; idempotent. The first caller's reason wins and
    /// is reported in the Closed event.
    pub async fn close(self: &Arc<Self>, reason: &str) {
        if !self.state.lock().on_closing() {
            return;
        }
        info!(alias = self.alias, reason, "closing peer");
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some(reason.to_string());
            }
        }
        self.cancel.cancel();
        if let Err(e) = self.pc.close().await {
            debug!(alias = self.alias, error = %e, "session close");
        }
        // The Closed connection-state callback normally finishes the
        // teardown; finish here too in case the session never fires it.
        self.finish_close().await;
    }

    async fn finish_close(self: &Arc<Self>) {
        if self.closed_once.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.lock().on_session_closed();
        let reason = self
            .close_reason
            .lock()
            .clone()
            .unwrap_or_else(|| "closed".to_string());
        let _ = self
            .events_tx
            .send((self.alias, PeerEvent::Closed { reason }));
    }

    pub fn state(&self) -> PeerState {
        self.state.lock().state()
    }

    pub fn role(&self) -> Role {
        *self.role.lock()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.identity.lock().clone()
    }

    pub fn topic_peer(&self) -> (Alias, Role) {
        (self.alias, self.role())
    }
}
