//! Comprehensive tests for the coordinator registry and fanout
//! Drives the worker through its command queue: registration, relay
//! placement, holding, signaling fanout and counters

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use worldcomm::auth::Authenticator;
use worldcomm::codec::Envelope;
use worldcomm::config::CoordinatorConfig;
use worldcomm::coordinator::{
    Command, Coordinator, CoordinatorStats, RandomSelector, RelaySelector, SocketOutput,
};
use worldcomm::proto::{MessageType, Role, WebRtcMessage};

/// Scores every relay the same, so placement falls back to the
/// smallest-alias tie-break.
struct ConstantSelector;

impl RelaySelector for ConstantSelector {
    fn score(&mut self, _relay: u64) -> u64 {
        42
    }
}

fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        coordinator_url: "ws://coordinator.local/connect".to_string(),
        identity_url: "http://identity.local".to_string(),
        server_secret: "secret".to_string(),
        auth_ttl: 60,
        max_peers: 64,
        report_period: 3600,
        outbound_queue_size: 16,
        log_level: "warn".to_string(),
    }
}

fn coordinator_with(selector: Box<dyn RelaySelector>) -> Arc<Coordinator> {
    Coordinator::new(
        test_config(),
        Arc::new(Authenticator::Noop),
        selector,
        Box::new(|_: &CoordinatorStats| {}),
    )
}

async fn register(
    coordinator: &Arc<Coordinator>,
    role: Role,
) -> (u64, mpsc::Receiver<SocketOutput>) {
    let (outbound, rx) = mpsc::channel(16);
    let (reply_tx, reply_rx) = oneshot::channel();
    coordinator
        .commands()
        .send(Command::Register {
            role,
            outbound,
            reply: reply_tx,
        })
        .await
        .expect("worker alive");
    let alias = reply_rx
        .await
        .expect("reply")
        .expect("registration accepted");
    (alias, rx)
}

async fn next_output(rx: &mut mpsc::Receiver<SocketOutput>) -> SocketOutput {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("output within deadline")
        .expect("socket queue open")
}

async fn next_envelope(rx: &mut mpsc::Receiver<SocketOutput>) -> Envelope {
    match next_output(rx).await {
        SocketOutput::Envelope(envelope) => envelope,
        SocketOutput::Close { code, reason } => {
            panic!("expected envelope, socket closed {} {}", code, reason)
        }
    }
}

#[tokio::test]
async fn test_server_registration_gets_welcome() {
    let coordinator = coordinator_with(Box::new(RandomSelector::seeded(7)));
    let (alias, mut rx) = register(&coordinator, Role::CommunicationServer).await;
    assert_eq!(alias, 1);

    match next_envelope(&mut rx).await {
        Envelope::Welcome(welcome) => {
            assert_eq!(welcome.alias, alias);
            assert!(welcome.available_servers.is_empty());
        }
        other => panic!("expected welcome, got {:?}", other),
    }
}

#[tokio::test]
async fn test_aliases_are_monotone_and_never_reused() {
    let coordinator = coordinator_with(Box::new(RandomSelector::seeded(7)));
    let (first, _rx1) = register(&coordinator, Role::CommunicationServer).await;
    coordinator
        .commands()
        .send(Command::Deregister { alias: first })
        .await
        .expect("worker alive");
    let (second, _rx2) = register(&coordinator, Role::CommunicationServer).await;
    assert!(second > first);
}

#[tokio::test]
async fn test_new_server_is_dialed_by_existing_servers() {
    let coordinator = coordinator_with(Box::new(RandomSelector::seeded(7)));
    let (first, mut rx1) = register(&coordinator, Role::CommunicationServer).await;
    let _welcome = next_envelope(&mut rx1).await;

    let (second, mut rx2) = register(&coordinator, Role::CommunicationServer).await;
    let _welcome = next_envelope(&mut rx2).await;

    match next_envelope(&mut rx1).await {
        Envelope::Connect(connect) => {
            assert_eq!(connect.from_alias, first);
            assert_eq!(connect.to_alias, second);
        }
        other => panic!("expected connect, got {:?}", other),
    }
}

#[tokio::test]
async fn test_client_is_placed_with_relay() {
    let coordinator = coordinator_with(Box::new(RandomSelector::seeded(7)));
    let (relay, mut relay_rx) = register(&coordinator, Role::CommunicationServer).await;
    let _welcome = next_envelope(&mut relay_rx).await;

    let (client, mut client_rx) = register(&coordinator, Role::Client).await;
    match next_envelope(&mut client_rx).await {
        Envelope::Welcome(welcome) => {
            assert_eq!(welcome.alias, client);
            assert_eq!(welcome.available_servers, vec![relay]);
        }
        other => panic!("expected welcome, got {:?}", other),
    }

    // The relay is told to initiate toward the client.
    match next_envelope(&mut relay_rx).await {
        Envelope::Connect(connect) => {
            assert_eq!(connect.from_alias, relay);
            assert_eq!(connect.to_alias, client);
        }
        other => panic!("expected connect, got {:?}", other),
    }
}

#[tokio::test]
async fn test_equal_scores_break_toward_smallest_alias() {
    let coordinator = coordinator_with(Box::new(ConstantSelector));
    let (first, mut rx1) = register(&coordinator, Role::CommunicationServer).await;
    let (_second, _rx2) = register(&coordinator, Role::CommunicationServer).await;
    let _welcome = next_envelope(&mut rx1).await;

    let (_client, mut client_rx) = register(&coordinator, Role::Client).await;
    match next_envelope(&mut client_rx).await {
        Envelope::Welcome(welcome) => {
            assert_eq!(welcome.available_servers[0], first);
            assert_eq!(welcome.available_servers.len(), 2);
        }
        other => panic!("expected welcome, got {:?}", other),
    }
}

#[tokio::test]
async fn test_client_without_relay_holds_then_reassigns() {
    let coordinator = coordinator_with(Box::new(RandomSelector::seeded(7)));
    let (_client, mut client_rx) = register(&coordinator, Role::Client).await;

    // Zero relays: empty relay list announces the holding state.
    match next_envelope(&mut client_rx).await {
        Envelope::Welcome(welcome) => assert!(welcome.available_servers.is_empty()),
        other => panic!("expected welcome, got {:?}", other),
    }

    // A relay appearing frees the held client immediately.
    let (relay, mut relay_rx) = register(&coordinator, Role::CommunicationServer).await;
    let _welcome = next_envelope(&mut relay_rx).await;
    match next_envelope(&mut client_rx).await {
        Envelope::Welcome(welcome) => {
            assert_eq!(welcome.available_servers, vec![relay]);
        }
        other => panic!("expected welcome, got {:?}", other),
    }
}

#[tokio::test]
async fn test_relay_loss_moves_clients_back_to_holding() {
    let coordinator = coordinator_with(Box::new(RandomSelector::seeded(7)));
    let (relay, mut relay_rx) = register(&coordinator, Role::CommunicationServer).await;
    let _welcome = next_envelope(&mut relay_rx).await;
    let (_client, mut client_rx) = register(&coordinator, Role::Client).await;
    let _welcome = next_envelope(&mut client_rx).await;

    coordinator
        .commands()
        .send(Command::Deregister { alias: relay })
        .await
        .expect("worker alive");

    // Another relay joins; the orphaned client is reassigned to it.
    let (replacement, mut replacement_rx) = register(&coordinator, Role::CommunicationServer).await;
    let _welcome = next_envelope(&mut replacement_rx).await;

    match next_envelope(&mut client_rx).await {
        Envelope::Welcome(welcome) => {
            assert_eq!(welcome.available_servers, vec![replacement]);
        }
        other => panic!("expected welcome, got {:?}", other),
    }
}

#[tokio::test]
async fn test_signaling_fanout_forwards_verbatim() {
    let coordinator = coordinator_with(Box::new(RandomSelector::seeded(7)));
    let (relay, mut relay_rx) = register(&coordinator, Role::CommunicationServer).await;
    let _welcome = next_envelope(&mut relay_rx).await;
    let (client, mut client_rx) = register(&coordinator, Role::Client).await;
    let _welcome = next_envelope(&mut client_rx).await;
    let _connect = next_envelope(&mut relay_rx).await;

    let offer = WebRtcMessage {
        r#type: MessageType::WebrtcOffer as i32,
        from_alias: relay,
        to_alias: client,
        sdp: b"v=0".to_vec(),
    };
    coordinator
        .commands()
        .send(Command::Signal {
            from: relay,
            envelope: Envelope::WebRtc(offer.clone()),
        })
        .await
        .expect("worker alive");

    match next_envelope(&mut client_rx).await {
        Envelope::WebRtc(received) => assert_eq!(received, offer),
        other => panic!("expected webrtc envelope, got {:?}", other),
    }
}

#[tokio::test]
async fn test_forged_source_alias_is_dropped() {
    let coordinator = coordinator_with(Box::new(RandomSelector::seeded(7)));
    let (relay, mut relay_rx) = register(&coordinator, Role::CommunicationServer).await;
    let _welcome = next_envelope(&mut relay_rx).await;
    let (client, mut client_rx) = register(&coordinator, Role::Client).await;
    let _welcome = next_envelope(&mut client_rx).await;

    coordinator
        .commands()
        .send(Command::Signal {
            from: client,
            envelope: Envelope::WebRtc(WebRtcMessage {
                r#type: MessageType::WebrtcOffer as i32,
                from_alias: relay, // claims to be the relay
                to_alias: relay,
                sdp: b"v=0".to_vec(),
            }),
        })
        .await
        .expect("worker alive");

    // Nothing is forwarded; the relay only ever saw its welcome and
    // the placement connect.
    let _connect = next_envelope(&mut relay_rx).await;
    assert!(
        tokio::time::timeout(Duration::from_millis(200), relay_rx.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_unknown_destination_counted_not_leaked() {
    let coordinator = coordinator_with(Box::new(RandomSelector::seeded(7)));
    let (client, mut client_rx) = register(&coordinator, Role::Client).await;
    let _welcome = next_envelope(&mut client_rx).await;

    coordinator
        .commands()
        .send(Command::Signal {
            from: client,
            envelope: Envelope::WebRtc(WebRtcMessage {
                r#type: MessageType::WebrtcIceCandidate as i32,
                from_alias: client,
                to_alias: 9999,
                sdp: b"{}".to_vec(),
            }),
        })
        .await
        .expect("worker alive");

    // Drain until the counter moves; the sender learns nothing.
    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if coordinator
                .counters
                .unknown_destination
                .load(std::sync::atomic::Ordering::Relaxed)
                == 1
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("unknown destination counted");
    assert!(
        tokio::time::timeout(Duration::from_millis(100), client_rx.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_client_connect_request_is_flipped_to_relay() {
    let coordinator = coordinator_with(Box::new(RandomSelector::seeded(7)));
    let (relay, mut relay_rx) = register(&coordinator, Role::CommunicationServer).await;
    let _welcome = next_envelope(&mut relay_rx).await;
    let (client, mut client_rx) = register(&coordinator, Role::Client).await;
    let _welcome = next_envelope(&mut client_rx).await;
    let _placement_connect = next_envelope(&mut relay_rx).await;

    coordinator
        .commands()
        .send(Command::Signal {
            from: client,
            envelope: Envelope::Connect(worldcomm::proto::ConnectMessage {
                r#type: MessageType::Connect as i32,
                from_alias: client,
                to_alias: relay,
            }),
        })
        .await
        .expect("worker alive");

    match next_envelope(&mut relay_rx).await {
        Envelope::Connect(connect) => {
            assert_eq!(connect.from_alias, relay);
            assert_eq!(connect.to_alias, client);
        }
        other => panic!("expected connect, got {:?}", other),
    }
}

#[tokio::test]
async fn test_auth_failure_counter_labels() {
    let coordinator = coordinator_with(Box::new(RandomSelector::seeded(7)));
    coordinator.counters.record_auth_failure("expired");
    assert_eq!(coordinator.counters.auth_failures("expired"), 1);
    assert_eq!(coordinator.counters.auth_failures("missing"), 0);
}

#[tokio::test]
async fn test_coordinator_reports_accepting() {
    let coordinator = coordinator_with(Box::new(RandomSelector::seeded(7)));
    assert!(coordinator.is_accepting());
}
