//! Wire protocol messages
//!
//! Every message exchanged on the signaling socket or a data channel
//! is a protobuf envelope whose field 1 is the [`MessageType`] tag, so
//! a receiver can decode the header alone and dispatch without parsing
//! the full body. The structs here are hand-maintained prost messages;
//! the wire format is stable and there is no build-time codegen.
//!
//! Topic payloads (position, profile, chat) are opaque bytes to the
//! relay. The typed category payloads at the bottom of this module are
//! for endpoints and tests; the forwarding engine never decodes them.

/// Envelope type tag, always field 1 of every message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    UnknownMessageType = 0,
    Welcome = 1,
    Connect = 2,
    WebrtcOffer = 3,
    WebrtcAnswer = 4,
    WebrtcIceCandidate = 5,
    Auth = 6,
    Subscription = 7,
    Topic = 8,
    TopicFw = 9,
    TopicIdentity = 10,
    TopicIdentityFw = 11,
    Ping = 12,
}

/// Peer role, established at authentication time
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Role {
    UnknownRole = 0,
    Client = 1,
    CommunicationServer = 2,
}

/// Subscription topics encoding
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Format {
    Plain = 0,
}

/// Header-only view of an envelope, decodes just the type tag
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MessageHeader {
    #[prost(enumeration = "MessageType", tag = "1")]
    pub r#type: i32,
}

/// Credential presentation, either during the coordinator upgrade
/// (server role) or as the first message on a freshly opened data
/// channel. For clients the body is an encoded [`AuthData`]; for
/// servers it is the shared secret.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuthMessage {
    #[prost(enumeration = "MessageType", tag = "1")]
    pub r#type: i32,
    #[prost(enumeration = "Role", tag = "2")]
    pub role: i32,
    #[prost(bytes = "vec", tag = "3")]
    pub body: Vec<u8>,
}

/// Coordinator to peer: your alias, and for clients the relay aliases
/// currently available. The chosen relay is the first entry.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WelcomeMessage {
    #[prost(enumeration = "MessageType", tag = "1")]
    pub r#type: i32,
    #[prost(uint64, tag = "2")]
    pub alias: u64,
    #[prost(uint64, repeated, tag = "3")]
    pub available_servers: Vec<u64>,
}

/// Coordinator to peer: begin offer generation for `to_alias`
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectMessage {
    #[prost(enumeration = "MessageType", tag = "1")]
    pub r#type: i32,
    #[prost(uint64, tag = "2")]
    pub from_alias: u64,
    #[prost(uint64, tag = "3")]
    pub to_alias: u64,
}

/// Session negotiation payload relayed verbatim by the coordinator.
/// The type tag distinguishes offer, answer and ICE candidate; `sdp`
/// carries the session description or the candidate JSON.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WebRtcMessage {
    #[prost(enumeration = "MessageType", tag = "1")]
    pub r#type: i32,
    #[prost(uint64, tag = "2")]
    pub from_alias: u64,
    #[prost(uint64, tag = "3")]
    pub to_alias: u64,
    #[prost(bytes = "vec", tag = "4")]
    pub sdp: Vec<u8>,
}

/// Full replacement of the sender's topic set. With `Format::Plain`
/// the topics are one space-separated UTF-8 string.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubscriptionMessage {
    #[prost(enumeration = "MessageType", tag = "1")]
    pub r#type: i32,
    #[prost(enumeration = "Format", tag = "2")]
    pub format: i32,
    #[prost(bytes = "vec", tag = "3")]
    pub topics: Vec<u8>,
}

/// Topic publish, client to relay
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TopicMessage {
    #[prost(enumeration = "MessageType", tag = "1")]
    pub r#type: i32,
    #[prost(string, tag = "2")]
    pub topic: String,
    #[prost(bytes = "vec", tag = "3")]
    pub body: Vec<u8>,
}

/// Topic forward, relay to subscriber, publisher alias stamped
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TopicFwMessage {
    #[prost(enumeration = "MessageType", tag = "1")]
    pub r#type: i32,
    #[prost(uint64, tag = "2")]
    pub from_alias: u64,
    #[prost(string, tag = "3")]
    pub topic: String,
    #[prost(bytes = "vec", tag = "4")]
    pub body: Vec<u8>,
}

/// Topic publish whose forward must carry the publisher's verified
/// identity
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TopicIdentityMessage {
    #[prost(enumeration = "MessageType", tag = "1")]
    pub r#type: i32,
    #[prost(string, tag = "2")]
    pub topic: String,
    #[prost(bytes = "vec", tag = "3")]
    pub body: Vec<u8>,
}

/// Identity topic forward. The identity is stamped by the relay from
/// the publisher's authenticated connection, so subscribers need not
/// trust peers to self-assert it.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TopicIdentityFwMessage {
    #[prost(enumeration = "MessageType", tag = "1")]
    pub r#type: i32,
    #[prost(uint64, tag = "2")]
    pub from_alias: u64,
    #[prost(bytes = "vec", tag = "3")]
    pub identity: Vec<u8>,
    #[prost(string, tag = "4")]
    pub topic: String,
    #[prost(bytes = "vec", tag = "5")]
    pub body: Vec<u8>,
}

/// Latency probe, echoed by the relay with a server-local timestamp
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PingMessage {
    #[prost(enumeration = "MessageType", tag = "1")]
    pub r#type: i32,
    #[prost(double, tag = "2")]
    pub time: f64,
}

/// Client credentials, carried inside the AUTH body
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuthData {
    #[prost(string, tag = "1")]
    pub signature: String,
    #[prost(string, tag = "2")]
    pub identity: String,
    #[prost(string, tag = "3")]
    pub timestamp: String,
    #[prost(string, tag = "4")]
    pub access_token: String,
}

/// Topic body category, first field of every typed payload
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Category {
    Unknown = 0,
    Position = 1,
    Profile = 2,
    Chat = 3,
    SceneMessage = 4,
}

/// Category-only view of a topic body
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DataHeader {
    #[prost(enumeration = "Category", tag = "1")]
    pub category: i32,
}

/// Avatar transform update, published on the unreliable lane
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PositionData {
    #[prost(enumeration = "Category", tag = "1")]
    pub category: i32,
    #[prost(double, tag = "2")]
    pub time: f64,
    #[prost(float, tag = "3")]
    pub position_x: f32,
    #[prost(float, tag = "4")]
    pub position_y: f32,
    #[prost(float, tag = "5")]
    pub position_z: f32,
    #[prost(float, tag = "6")]
    pub rotation_x: f32,
    #[prost(float, tag = "7")]
    pub rotation_y: f32,
    #[prost(float, tag = "8")]
    pub rotation_z: f32,
    #[prost(float, tag = "9")]
    pub rotation_w: f32,
}

/// Avatar profile pointer, published on the reliable lane
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProfileData {
    #[prost(enumeration = "Category", tag = "1")]
    pub category: i32,
    #[prost(double, tag = "2")]
    pub time: f64,
    #[prost(string, tag = "3")]
    pub profile_version: String,
}

/// Chat line, published on the reliable lane
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChatData {
    #[prost(enumeration = "Category", tag = "1")]
    pub category: i32,
    #[prost(double, tag = "2")]
    pub time: f64,
    #[prost(string, tag = "3")]
    pub message_id: String,
    #[prost(string, tag = "4")]
    pub text: String,
}
