//! Comprehensive tests for stats aggregation
//! Tests totals arithmetic, snapshot aggregation and per-interval
//! deltas across consecutive reports

use parking_lot::Mutex;
use std::sync::Arc;
use worldcomm::peer::PeerState;
use worldcomm::proto::Role;
use worldcomm::reporter::{PeerStatsSnapshot, Reporter, ServerStats, Totals};

fn peer_snapshot(alias: u64, sent: u64, received: u64) -> PeerStatsSnapshot {
    PeerStatsSnapshot {
        alias,
        role: Role::Client,
        state: PeerState::Ready,
        topic_count: 3,
        reliable_messages_sent: sent,
        reliable_messages_received: received,
        reliable_bytes_sent: sent * 10,
        reliable_bytes_received: received * 10,
        unreliable_messages_sent: sent,
        unreliable_messages_received: received,
        unreliable_bytes_sent: sent * 10,
        unreliable_bytes_received: received * 10,
        unreliable_dropped: 0,
    }
}

fn capture() -> (Arc<Mutex<Vec<ServerStats>>>, Reporter) {
    let reports: Arc<Mutex<Vec<ServerStats>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_reports = reports.clone();
    let reporter = Reporter::new(Box::new(move |stats: &ServerStats| {
        sink_reports.lock().push(stats.clone());
    }));
    (reports, reporter)
}

#[test]
fn test_totals_add() {
    let mut totals = Totals::default();
    totals.add(&Totals {
        messages_sent: 1,
        messages_received: 2,
        bytes_sent: 3,
        bytes_received: 4,
    });
    totals.add(&Totals {
        messages_sent: 10,
        messages_received: 20,
        bytes_sent: 30,
        bytes_received: 40,
    });
    assert_eq!(totals.messages_sent, 11);
    assert_eq!(totals.messages_received, 22);
    assert_eq!(totals.bytes_sent, 33);
    assert_eq!(totals.bytes_received, 44);
}

#[test]
fn test_totals_saturating_sub() {
    let a = Totals {
        messages_sent: 5,
        messages_received: 5,
        bytes_sent: 5,
        bytes_received: 5,
    };
    let b = Totals {
        messages_sent: 7,
        messages_received: 2,
        bytes_sent: 7,
        bytes_received: 2,
    };
    let diff = a.saturating_sub(&b);
    assert_eq!(diff.messages_sent, 0);
    assert_eq!(diff.messages_received, 3);
}

#[test]
fn test_peer_snapshot_totals_combine_both_lanes() {
    let snapshot = peer_snapshot(1, 4, 6);
    let totals = snapshot.totals();
    assert_eq!(totals.messages_sent, 8);
    assert_eq!(totals.messages_received, 12);
    assert_eq!(totals.bytes_sent, 80);
    assert_eq!(totals.bytes_received, 120);
}

#[test]
fn test_report_aggregates_peers_and_retired() {
    let (reports, mut reporter) = capture();
    let retired = Totals {
        messages_sent: 100,
        messages_received: 100,
        bytes_sent: 1000,
        bytes_received: 1000,
    };
    reporter.report(
        vec![peer_snapshot(1, 1, 1), peer_snapshot(2, 2, 2)],
        5,
        retired,
    );

    let reports = reports.lock();
    assert_eq!(reports.len(), 1);
    let stats = &reports[0];
    assert_eq!(stats.peers.len(), 2);
    assert_eq!(stats.topic_count, 5);
    assert_eq!(stats.totals.messages_sent, 100 + 2 + 4);
    assert_eq!(stats.totals.bytes_sent, 1000 + 20 + 40);
}

/// Rates come from consecutive snapshots, not cluster-lifetime totals
#[test]
fn test_interval_is_delta_between_reports() {
    let (reports, mut reporter) = capture();

    reporter.report(vec![peer_snapshot(1, 10, 10)], 1, Totals::default());
    reporter.report(vec![peer_snapshot(1, 15, 12)], 1, Totals::default());

    let reports = reports.lock();
    assert_eq!(reports[0].interval.messages_sent, 20);
    assert_eq!(reports[1].interval.messages_sent, 10);
    assert_eq!(reports[1].interval.messages_received, 4);
}

/// A disconnecting peer's counters move into the retired totals; the
/// cluster totals stay monotone and the interval stays non-negative.
#[test]
fn test_peer_disconnect_keeps_totals_monotone() {
    let (reports, mut reporter) = capture();

    reporter.report(vec![peer_snapshot(1, 10, 10)], 1, Totals::default());
    // Peer 1 left; its final counters were folded into retired.
    let retired = peer_snapshot(1, 10, 10).totals();
    reporter.report(Vec::new(), 0, retired);

    let reports = reports.lock();
    assert_eq!(reports[1].totals, reports[0].totals);
    assert_eq!(reports[1].interval, Totals::default());
}

#[test]
fn test_tracing_sink_accepts_reports() {
    let mut reporter = Reporter::new(worldcomm::reporter::tracing_sink());
    reporter.report(vec![peer_snapshot(1, 1, 1)], 1, Totals::default());
}
