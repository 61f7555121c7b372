//! # Worldcomm - Location-Aware Pub/Sub Overlay
//!
//! Worldcomm is the communications cluster of a shared virtual world:
//! avatars and relays connect over WebRTC and each peer's messages are
//! forwarded only to the peers subscribed to overlapping topics.
//! Topics encode spatial parcel coordinates, so traffic fans out to
//! geographic neighbors and is pruned everywhere else.
//!
//! ## Components
//!
//! - **[`Coordinator`](coordinator::Coordinator)**: membership and
//!   discovery. Assigns aliases, verifies credentials at the WebSocket
//!   upgrade, places clients with relays and fans out WebRTC session
//!   negotiation. No data-plane traffic.
//! - **[`CommServer`](server::CommServer)**: the relay. Owns a WebRTC
//!   session per peer with a reliable/unreliable data-channel pair,
//!   tracks per-peer topic subscriptions and forwards topic messages
//!   under per-lane ordering, with at-most-once delivery on the
//!   unreliable lane.
//! - **[`Authenticator`](auth::Authenticator)**: shared by both.
//!   Clients prove possession of an ephemeral key bound into an
//!   identity-service access token; servers present a shared secret.
//!
//! ## Data flow
//!
//! A client opens a signaling session to the coordinator, receives an
//! alias and a relay, and negotiates WebRTC offer/answer through the
//! coordinator. Once data channels open the relay authenticates the
//! client; from then on the client publishes subscription replacements
//! and topic messages on the reliable lane (control, profile, chat) or
//! the unreliable lane (position). Relays interconnect the same way
//! and exchange aggregated subscription sets so a publishing relay
//! knows which remote relays need each topic.

pub mod auth;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod forward;
pub mod peer;
pub mod proto;
pub mod reporter;
pub mod server;
pub mod signaling;
pub mod topics;

pub use codec::{Codec, Envelope};
pub use error::{CommError, CommResult};
pub use topics::Alias;

/// Crate version, reported by the coordinator's `/version` endpoint
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
