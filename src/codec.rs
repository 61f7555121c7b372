//! Envelope encoding and framing
//!
//! Two-layer framing shared by the signaling socket and the data
//! channels: the outer envelope declares a [`MessageType`], the inner
//! body is the type-specific structure from [`crate::proto`]. On the
//! signaling socket each WebSocket binary message carries a 4-byte
//! big-endian length prefix followed by the envelope; on data channels
//! the whole datagram is one envelope.
//!
//! The codec is total: an unknown type tag surfaces as
//! [`CommError::UnknownMessageType`] with the raw bytes retained for
//! logging, and body length limits are enforced before any allocation
//! prost would do on the envelope's behalf.

use crate::error::{CommError, CommResult};
use crate::proto::*;
use prost::Message;

/// Default per-envelope body limit, 64 KiB
pub const DEFAULT_MAX_BODY_LEN: usize = 64 * 1024;

/// Length of the signaling-socket frame prefix
pub const FRAME_HEADER_LEN: usize = 4;

/// A fully decoded envelope
#[derive(Clone, Debug, PartialEq)]
pub enum Envelope {
    Auth(AuthMessage),
    Welcome(WelcomeMessage),
    Connect(ConnectMessage),
    /// Offer, answer or ICE candidate; the inner type tag tells which
    WebRtc(WebRtcMessage),
    Subscription(SubscriptionMessage),
    Topic(TopicMessage),
    TopicFw(TopicFwMessage),
    TopicIdentity(TopicIdentityMessage),
    TopicIdentityFw(TopicIdentityFwMessage),
    Ping(PingMessage),
}

impl Envelope {
    pub fn message_type(&self) -> MessageType {
        match self {
            Envelope::Auth(_) => MessageType::Auth,
            Envelope::Welcome(_) => MessageType::Welcome,
            Envelope::Connect(_) => MessageType::Connect,
            Envelope::WebRtc(m) => {
                MessageType::try_from(m.r#type).unwrap_or(MessageType::UnknownMessageType)
            }
            Envelope::Subscription(_) => MessageType::Subscription,
            Envelope::Topic(_) => MessageType::Topic,
            Envelope::TopicFw(_) => MessageType::TopicFw,
            Envelope::TopicIdentity(_) => MessageType::TopicIdentity,
            Envelope::TopicIdentityFw(_) => MessageType::TopicIdentityFw,
            Envelope::Ping(_) => MessageType::Ping,
        }
    }

    /// Encode this envelope to wire bytes
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Envelope::Auth(m) => m.encode_to_vec(),
            Envelope::Welcome(m) => m.encode_to_vec(),
            Envelope::Connect(m) => m.encode_to_vec(),
            Envelope::WebRtc(m) => m.encode_to_vec(),
            Envelope::Subscription(m) => m.encode_to_vec(),
            Envelope::Topic(m) => m.encode_to_vec(),
            Envelope::TopicFw(m) => m.encode_to_vec(),
            Envelope::TopicIdentity(m) => m.encode_to_vec(),
            Envelope::TopicIdentityFw(m) => m.encode_to_vec(),
            Envelope::Ping(m) => m.encode_to_vec(),
        }
    }
}

/// Envelope codec with a configurable body cap
#[derive(Clone, Debug)]
pub struct Codec {
    max_body_len: usize,
}

impl Default for Codec {
    fn default() -> Self {
        Self {
            max_body_len: DEFAULT_MAX_BODY_LEN,
        }
    }
}

impl Codec {
    pub fn new(max_body_len: usize) -> Self {
        Self { max_body_len }
    }

    /// Decode only the type tag of an envelope
    pub fn peek_type(&self, bytes: &[u8]) -> CommResult<MessageType> {
        self.check_len(bytes)?;
        let header = MessageHeader::decode(bytes)?;
        MessageType::try_from(header.r#type).map_err(|_| CommError::UnknownMessageType {
            type_tag: header.r#type,
            raw: bytes.to_vec(),
        })
    }

    /// Decode a complete envelope
    pub fn decode(&self, bytes: &[u8]) -> CommResult<Envelope> {
        let message_type = self.peek_type(bytes)?;
        let envelope = match message_type {
            MessageType::Auth => Envelope::Auth(AuthMessage::decode(bytes)?),
            MessageType::Welcome => Envelope::Welcome(WelcomeMessage::decode(bytes)?),
            MessageType::Connect => Envelope::Connect(ConnectMessage::decode(bytes)?),
            MessageType::WebrtcOffer
            | MessageType::WebrtcAnswer
            | MessageType::WebrtcIceCandidate => Envelope::WebRtc(WebRtcMessage::decode(bytes)?),
            MessageType::Subscription => {
                Envelope::Subscription(SubscriptionMessage::decode(bytes)?)
            }
            MessageType::Topic => Envelope::Topic(TopicMessage::decode(bytes)?),
            MessageType::TopicFw => Envelope::TopicFw(TopicFwMessage::decode(bytes)?),
            MessageType::TopicIdentity => {
                Envelope::TopicIdentity(TopicIdentityMessage::decode(bytes)?)
            }
            MessageType::TopicIdentityFw => {
                Envelope::TopicIdentityFw(TopicIdentityFwMessage::decode(bytes)?)
            }
            MessageType::Ping => Envelope::Ping(PingMessage::decode(bytes)?),
            MessageType::UnknownMessageType => {
                return Err(CommError::UnknownMessageType {
                    type_tag: 0,
                    raw: bytes.to_vec(),
                })
            }
        };
        Ok(envelope)
    }

    /// Wrap an encoded envelope with the signaling-socket length prefix
    pub fn frame(&self, payload: &[u8]) -> CommResult<Vec<u8>> {
        self.check_len(payload)?;
        let mut framed = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        framed.extend_from_slice(payload);
        Ok(framed)
    }

    /// Strip and validate the signaling-socket length prefix
    pub fn deframe<'a>(&self, framed: &'a [u8]) -> CommResult<&'a [u8]> {
        if framed.len() < FRAME_HEADER_LEN {
            return Err(CommError::Protocol(format!(
                "frame too short: {} bytes",
                framed.len()
            )));
        }
        let mut prefix = [0u8; FRAME_HEADER_LEN];
        prefix.copy_from_slice(&framed[..FRAME_HEADER_LEN]);
        let declared = u32::from_be_bytes(prefix) as usize;
        if declared > self.max_body_len {
            return Err(CommError::Protocol(format!(
                "frame length {} exceeds limit {}",
                declared, self.max_body_len
            )));
        }
        let payload = &framed[FRAME_HEADER_LEN..];
        if payload.len() != declared {
            return Err(CommError::Protocol(format!(
                "frame length mismatch: declared {}, got {}",
                declared,
                payload.len()
            )));
        }
        Ok(payload)
    }

    fn check_len(&self, bytes: &[u8]) -> CommResult<()> {
        if bytes.len() > self.max_body_len {
            return Err(CommError::Protocol(format!(
                "envelope of {} bytes exceeds limit {}",
                bytes.len(),
                self.max_body_len
            )));
        }
        Ok(())
    }
}
