//! Topic forwarding engine
//!
//! Classifies each inbound data-channel frame, resolves the topic's
//! subscriber set and emits TOPIC_FW / TOPIC_IDENTITY_FW envelopes on
//! the lane matching the inbound lane. The engine never retransmits
//! and never duplicates; ordering holds per (publisher, subscriber,
//! lane) because frames are handled in arrival order and enqueue in
//! order on each subscriber's lane queue.
//!
//! Indices hold aliases, not peer handles. The alias resolves to a
//! handle under the peers read lock at send time; an absent handle
//! means the peer tore down between lookup and send and the message is
//! silently dropped.

use crate::codec::Codec;
use crate::error::{CommError, CommResult};
use crate::peer::Lane;
use crate::proto::*;
use crate::topics::{
    parse_plain_topics, validate_topic, Alias, SubscriptionDelta, SubscriptionIndex,
};
use parking_lot::RwLock;
use prost::Message;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Send half of a connected peer, as the forwarding engine sees it
pub trait OutboundPeer: Send + Sync {
    fn role(&self) -> Role;
    fn enqueue(&self, lane: Lane, data: Vec<u8>) -> CommResult<()>;
}

impl OutboundPeer for Arc<crate::peer::PeerConnection> {
    fn role(&self) -> Role {
        crate::peer::PeerConnection::role(self)
    }

    fn enqueue(&self, lane: Lane, data: Vec<u8>) -> CommResult<()> {
        self.send(lane, data)
    }
}

/// What a frame turned into, reported to the relay's event loop
#[derive(Debug)]
pub enum Handled {
    /// Subscription replacement applied; the delta feeds the
    /// server-to-server aggregate
    Subscription(SubscriptionDelta),
    /// Topic fan-out completed
    Forwarded { subscribers: usize },
    /// Ping echoed
    Ping,
    /// Frame ignored (disallowed type, invalid topic, late AUTH)
    Dropped,
}

/// Engine counters, read by the reporter
#[derive(Debug, Default)]
pub struct ForwardCounters {
    pub frames_dropped: AtomicU64,
    pub topics_forwarded: AtomicU64,
    pub pings_echoed: AtomicU64,
}

/// Forwarding engine over a shared peer arena
pub struct ForwardingEngine<P: OutboundPeer> {
    index: Arc<RwLock<SubscriptionIndex>>,
    peers: Arc<RwLock<HashMap<Alias, P>>>,
    codec: Codec,
    pub counters: ForwardCounters,
}

impl<P: OutboundPeer> ForwardingEngine<P> {
    pub fn new(
        index: Arc<RwLock<SubscriptionIndex>>,
        peers: Arc<RwLock<HashMap<Alias, P>>>,
        codec: Codec,
    ) -> Self {
        Self {
            index,
            peers,
            codec,
            counters: ForwardCounters::default(),
        }
    }

    /// Process one inbound frame from an authenticated peer.
    ///
    /// `publisher_role` keys the loop-prevention rule: frames arriving
    /// from a server peer are delivered to local clients only, because
    /// the aggregate subscription protocol is the only inter-relay
    /// fanout mechanism. `publisher_identity` is the relay-verified
    /// identity stamped into TOPIC_IDENTITY_FW.
    pub fn handle_frame(
        &self,
        publisher: Alias,
        publisher_role: Role,
        publisher_identity: &[u8],
        lane: Lane,
        frame: &[u8],
    ) -> CommResult<Handled> {
        let message_type = match self.codec.peek_type(frame) {
            Ok(t) => t,
            Err(CommError::UnknownMessageType { type_tag, .. }) => {
                debug!(publisher, type_tag, "dropping unknown frame type");
                self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                return Ok(Handled::Dropped);
            }
            Err(e) => {
                self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        match message_type {
            MessageType::Subscription => {
                let message = SubscriptionMessage::decode(frame)?;
                if message.format != Format::Plain as i32 {
                    return Err(CommError::Protocol(format!(
                        "unsupported subscription format {}",
                        message.format
                    )));
                }
                let topics = parse_plain_topics(&message.topics)?;
                let delta = self.index.write().apply_replacement(publisher, &topics);
                Ok(Handled::Subscription(delta))
            }
            MessageType::Topic => {
                let message = TopicMessage::decode(frame)?;
                if !validate_topic(&message.topic) {
                    warn!(publisher, topic = %message.topic, "rejecting invalid topic");
                    self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    return Ok(Handled::Dropped);
                }
                let forward = TopicFwMessage {
                    r#type: MessageType::TopicFw as i32,
                    from_alias: publisher,
                    topic: message.topic.clone(),
                    body: message.body,
                };
                let subscribers =
                    self.fan_out(publisher, publisher_role, &message.topic, lane, forward.encode_to_vec());
                Ok(Handled::Forwarded { subscribers })
            }
            MessageType::TopicIdentity => {
                let message = TopicIdentityMessage::decode(frame)?;
                if !validate_topic(&message.topic) {
                    warn!(publisher, topic = %message.topic, "rejecting invalid topic");
                    self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    return Ok(Handled::Dropped);
                }
                let forward = TopicIdentityFwMessage {
                    r#type: MessageType::TopicIdentityFw as i32,
                    from_alias: publisher,
                    identity: publisher_identity.to_vec(),
                    topic: message.topic.clone(),
                    body: message.body,
                };
                let subscribers =
                    self.fan_out(publisher, publisher_role, &message.topic, lane, forward.encode_to_vec());
                Ok(Handled::Forwarded { subscribers })
            }
            MessageType::Ping => {
                let _ = PingMessage::decode(frame)?;
                let echo = PingMessage {
                    r#type: MessageType::Ping as i32,
                    time: chrono::Utc::now().timestamp_millis() as f64,
                };
                let sent = {
                    let peers = self.peers.read();
                    peers
                        .get(&publisher)
                        .map(|peer| peer.enqueue(lane, echo.encode_to_vec()))
                };
                if let Some(Err(e)) = sent {
                    debug!(publisher, error = %e, "ping echo not delivered");
                }
                self.counters.pings_echoed.fetch_add(1, Ordering::Relaxed);
                Ok(Handled::Ping)
            }
            // A late AUTH is harmless; the peer already authenticated.
            MessageType::Auth => Ok(Handled::Dropped),
            _ => {
                debug!(publisher, ?message_type, "dropping disallowed frame type");
                self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                Ok(Handled::Dropped)
            }
        }
    }

    /// Deliver one pre-encoded forward to every subscriber except the
    /// publisher, on the lane the publisher used.
    fn fan_out(
        &self,
        publisher: Alias,
        publisher_role: Role,
        topic: &str,
        lane: Lane,
        encoded: Vec<u8>,
    ) -> usize {
        let targets: Vec<Alias> = {
            let index = self.index.read();
            match index.subscribers(topic) {
                Some(subscribers) => subscribers
                    .iter()
                    .copied()
                    .filter(|alias| *alias != publisher)
                    .collect(),
                None => return 0,
            }
        };
        if targets.is_empty() {
            return 0;
        }

        let from_server = publisher_role == Role::CommunicationServer;
        let mut delivered = 0usize;
        let peers = self.peers.read();
        for alias in targets {
            let Some(peer) = peers.get(&alias) else {
                // Tore down between index lookup and send.
                continue;
            };
            if from_server && peer.role() == Role::CommunicationServer {
                // Never re-forward relay traffic across the relay mesh.
                continue;
            }
            match peer.enqueue(lane, encoded.clone()) {
                Ok(()) => delivered += 1,
                Err(CommError::Overflow(_)) => {
                    // Reliable overflow: the peer is being expelled.
                }
                Err(e) => {
                    debug!(alias, error = %e, "forward not delivered");
                }
            }
        }
        if delivered > 0 {
            self.counters
                .topics_forwarded
                .fetch_add(delivered as u64, Ordering::Relaxed);
        }
        delivered
    }

    /// Current distinct-topic count, for the reporter
    pub fn topic_count(&self) -> usize {
        self.index.read().topic_count()
    }
}
