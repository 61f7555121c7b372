//! Periodic stats aggregation
//!
//! The relay snapshots per-peer counters every report period and hands
//! the aggregate to an injected sink. Counters on live peers are
//! cumulative; when a peer closes, its final counts fold into the
//! retired totals so cluster totals stay monotone. The reporter also
//! derives per-interval deltas from consecutive snapshots, so rate
//! panels do not need the sink to keep state.

use crate::peer::PeerState;
use crate::proto::Role;
use crate::topics::Alias;

/// Cumulative traffic totals
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Totals {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl Totals {
    pub fn add(&mut self, other: &Totals) {
        self.messages_sent += other.messages_sent;
        self.messages_received += other.messages_received;
        self.bytes_sent += other.bytes_sent;
        self.bytes_received += other.bytes_received;
    }

    pub fn saturating_sub(&self, other: &Totals) -> Totals {
        Totals {
            messages_sent: self.messages_sent.saturating_sub(other.messages_sent),
            messages_received: self
                .messages_received
                .saturating_sub(other.messages_received),
            bytes_sent: self.bytes_sent.saturating_sub(other.bytes_sent),
            bytes_received: self.bytes_received.saturating_sub(other.bytes_received),
        }
    }
}

/// One peer's counters at snapshot time
#[derive(Clone, Debug)]
pub struct PeerStatsSnapshot {
    pub alias: Alias,
    pub role: Role,
    pub state: PeerState,
    pub topic_count: usize,
    pub reliable_messages_sent: u64,
    pub reliable_messages_received: u64,
    pub reliable_bytes_sent: u64,
    pub reliable_bytes_received: u64,
    pub unreliable_messages_sent: u64,
    pub unreliable_messages_received: u64,
    pub unreliable_bytes_sent: u64,
    pub unreliable_bytes_received: u64,
    pub unreliable_dropped: u64,
}

impl PeerStatsSnapshot {
    pub fn totals(&self) -> Totals {
        Totals {
            messages_sent: self.reliable_messages_sent + self.unreliable_messages_sent,
            messages_received: self.reliable_messages_received + self.unreliable_messages_received,
            bytes_sent: self.reliable_bytes_sent + self.unreliable_bytes_sent,
            bytes_received: self.reliable_bytes_received + self.unreliable_bytes_received,
        }
    }
}

/// One report-period snapshot of the whole relay
#[derive(Clone, Debug, Default)]
pub struct ServerStats {
    pub peers: Vec<PeerStatsSnapshot>,
    /// Distinct topics with at least one subscriber
    pub topic_count: usize,
    /// Cluster-lifetime totals, live peers plus retired ones
    pub totals: Totals,
    /// Change since the previous snapshot
    pub interval: Totals,
}

/// Injected stats sink
pub type StatsSink = Box<dyn Fn(&ServerStats) + Send + Sync>;

/// Builds consecutive snapshots into reports for the sink
pub struct Reporter {
    sink: StatsSink,
    last_totals: Totals,
}

impl Reporter {
    pub fn new(sink: StatsSink) -> Self {
        Self {
            sink,
            last_totals: Totals::default(),
        }
    }

    /// Fold retired totals and live peers into a report and emit it.
    pub fn report(&mut self, peers: Vec<PeerStatsSnapshot>, topic_count: usize, retired: Totals) {
        let mut totals = retired;
        for peer in &peers {
            totals.add(&peer.totals());
        }
        let interval = totals.saturating_sub(&self.last_totals);
        self.last_totals = totals;

        let stats = ServerStats {
            peers,
            topic_count,
            totals,
            interval,
        };
        (self.sink)(&stats);
    }
}

/// Default sink: one structured log line per report
pub fn tracing_sink() -> StatsSink {
    Box::new(|stats: &ServerStats| {
        tracing::info!(
            log_type = "report",
            peer_count = stats.peers.len(),
            topic_count = stats.topic_count,
            messages_sent = stats.totals.messages_sent,
            messages_received = stats.totals.messages_received,
            interval_messages_sent = stats.interval.messages_sent,
            interval_messages_received = stats.interval.messages_received,
            "report"
        );
    })
}
