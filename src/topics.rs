//! Topic subscription engine
//!
//! Per-peer subscription sets plus the inverse index topic → aliases
//! used by the forwarding hot path. A SUBSCRIPTION message carries a
//! full replacement set; the engine computes the delta against the
//! previous set and applies both directions under one write lock so a
//! concurrent forwarder observes either the pre- or the post-state,
//! never a partial mix.
//!
//! Topics are opaque UTF-8 strings of at most 64 bytes, in practice
//! `category:parcelX:parcelZ`. The plain wire format is one
//! space-separated string, which cannot carry topics containing
//! whitespace; such topics are rejected at the edge rather than
//! corrupted on the wire.

use crate::error::{CommError, CommResult};
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// Peer alias, assigned by the coordinator
pub type Alias = u64;

/// Maximum encoded topic length, bytes
pub const MAX_TOPIC_LEN: usize = 64;

/// The effect of applying one subscription replacement
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubscriptionDelta {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Additions discarded because the per-peer cap was reached
    pub dropped: usize,
}

impl SubscriptionDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// A topic is valid when it is non-empty, within the length cap and
/// free of whitespace (the plain wire format's delimiter).
pub fn validate_topic(topic: &str) -> bool {
    !topic.is_empty()
        && topic.len() <= MAX_TOPIC_LEN
        && !topic.chars().any(|c| c.is_whitespace())
}

/// Parse the plain (space-separated) subscription payload. Entries
/// failing validation are dropped with a warning; the rest survive.
pub fn parse_plain_topics(payload: &[u8]) -> CommResult<Vec<String>> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| CommError::Protocol(format!("subscription payload not UTF-8: {}", e)))?;
    let mut topics = Vec::new();
    let mut seen = HashSet::new();
    for entry in text.split_whitespace() {
        if entry.len() > MAX_TOPIC_LEN {
            warn!(topic_len = entry.len(), "dropping over-length topic");
            continue;
        }
        if seen.insert(entry.to_string()) {
            topics.push(entry.to_string());
        }
    }
    Ok(topics)
}

/// Encode a topic list into the plain wire payload, sorted so equal
/// sets encode identically.
pub fn encode_plain_topics<I, S>(topics: I) -> Vec<u8>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut sorted: Vec<String> = topics.into_iter().map(|t| t.as_ref().to_string()).collect();
    sorted.sort();
    sorted.join(" ").into_bytes()
}

/// Forward and inverse subscription indices
///
/// Mutually consistent at every observable instant: the owner wraps
/// this in a reader-writer lock, forwarding reads take the read lock,
/// subscription changes and peer teardown take the write lock.
pub struct SubscriptionIndex {
    max_per_peer: usize,
    by_peer: HashMap<Alias, HashSet<String>>,
    by_topic: HashMap<String, HashSet<Alias>>,
}

impl SubscriptionIndex {
    pub fn new(max_per_peer: usize) -> Self {
        Self {
            max_per_peer,
            by_peer: HashMap::new(),
            by_topic: HashMap::new(),
        }
    }

    /// Replace a peer's subscription set.
    ///
    /// `new_topics` is the wire-ordered replacement list; when it
    /// exceeds the per-peer cap the latest additions are dropped and
    /// counted in the returned delta. Applying the same replacement
    /// twice is a no-op after the first.
    pub fn apply_replacement(&mut self, alias: Alias, new_topics: &[String]) -> SubscriptionDelta {
        let old = self.by_peer.entry(alias).or_default().clone();

        // Surviving topics are not additions and never count against
        // the cap; only genuinely new topics do, in wire order.
        let mut next: HashSet<String> = new_topics
            .iter()
            .filter(|topic| old.contains(*topic))
            .cloned()
            .collect();
        let mut added = Vec::new();
        let mut dropped = 0usize;
        for topic in new_topics {
            if next.contains(topic) {
                continue;
            }
            if next.len() >= self.max_per_peer {
                dropped += 1;
                continue;
            }
            next.insert(topic.clone());
            added.push(topic.clone());
        }
        if dropped > 0 {
            warn!(
                alias,
                dropped,
                cap = self.max_per_peer,
                "subscription cap exceeded, dropping latest additions"
            );
        }

        let mut removed: Vec<String> = old.difference(&next).cloned().collect();
        removed.sort();

        for topic in &added {
            self.by_topic.entry(topic.clone()).or_default().insert(alias);
        }
        for topic in &removed {
            if let Some(subscribers) = self.by_topic.get_mut(topic) {
                subscribers.remove(&alias);
                if subscribers.is_empty() {
                    self.by_topic.remove(topic);
                }
            }
        }
        self.by_peer.insert(alias, next);

        SubscriptionDelta {
            added,
            removed,
            dropped,
        }
    }

    /// Drop a peer and all of its inverse-index entries. Called during
    /// teardown before the next forwarding pass can observe the peer.
    pub fn remove_peer(&mut self, alias: Alias) -> Vec<String> {
        let Some(topics) = self.by_peer.remove(&alias) else {
            return Vec::new();
        };
        let mut removed: Vec<String> = topics.into_iter().collect();
        removed.sort();
        for topic in &removed {
            if let Some(subscribers) = self.by_topic.get_mut(topic) {
                subscribers.remove(&alias);
                if subscribers.is_empty() {
                    self.by_topic.remove(topic);
                }
            }
        }
        removed
    }

    /// Aliases subscribed to `topic`, the forwarding lookup
    pub fn subscribers(&self, topic: &str) -> Option<&HashSet<Alias>> {
        self.by_topic.get(topic)
    }

    pub fn is_subscribed(&self, alias: Alias, topic: &str) -> bool {
        self.by_peer
            .get(&alias)
            .map(|topics| topics.contains(topic))
            .unwrap_or(false)
    }

    pub fn topics_of(&self, alias: Alias) -> Option<&HashSet<String>> {
        self.by_peer.get(&alias)
    }

    /// Number of distinct topics with at least one subscriber
    pub fn topic_count(&self) -> usize {
        self.by_topic.len()
    }

    pub fn peer_topic_count(&self, alias: Alias) -> usize {
        self.by_peer.get(&alias).map(|t| t.len()).unwrap_or(0)
    }
}

/// Union of local-client subscriptions, exchanged between relays
///
/// Tracks a refcount per topic so the aggregate membership only
/// changes on 0↔1 transitions. Changes set a dirty flag; the owner
/// coalesces flushes within the configured debounce window.
#[derive(Default)]
pub struct AggregateSubscription {
    counts: HashMap<String, usize>,
    dirty: bool,
}

impl AggregateSubscription {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one client delta into the aggregate
    pub fn apply_delta(&mut self, delta: &SubscriptionDelta) {
        for topic in &delta.added {
            let count = self.counts.entry(topic.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                self.dirty = true;
            }
        }
        for topic in &delta.removed {
            if let Some(count) = self.counts.get_mut(topic) {
                *count -= 1;
                if *count == 0 {
                    self.counts.remove(topic);
                    self.dirty = true;
                }
            }
        }
    }

    /// Fold a departing client's whole topic set out of the aggregate
    pub fn remove_topics(&mut self, topics: &[String]) {
        for topic in topics {
            if let Some(count) = self.counts.get_mut(topic) {
                *count -= 1;
                if *count == 0 {
                    self.counts.remove(topic);
                    self.dirty = true;
                }
            }
        }
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.counts.contains_key(topic)
    }

    /// Current aggregate membership, sorted
    pub fn snapshot(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.counts.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Whether a flush is pending, clearing the flag
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}
