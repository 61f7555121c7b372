//! Comprehensive tests for the relay and the live coordinator surface
//! Boots the coordinator's HTTP router on a local port and drives the
//! operational endpoints, upgrade auth and a real relay registration

use std::sync::Arc;
use std::time::Duration;
use worldcomm::auth::Authenticator;
use worldcomm::config::{CoordinatorConfig, ServerConfig};
use worldcomm::coordinator::{Coordinator, CoordinatorStats, RandomSelector};
use worldcomm::reporter::tracing_sink;
use worldcomm::server::CommServer;

const SECRET: &str = "test-secret";

fn coordinator_config(port: u16) -> CoordinatorConfig {
    CoordinatorConfig {
        host: "127.0.0.1".to_string(),
        port,
        coordinator_url: format!("ws://127.0.0.1:{}/connect", port),
        identity_url: "http://identity.local".to_string(),
        server_secret: SECRET.to_string(),
        auth_ttl: 60,
        max_peers: 64,
        report_period: 3600,
        outbound_queue_size: 16,
        log_level: "warn".to_string(),
    }
}

fn server_config(port: u16) -> ServerConfig {
    ServerConfig {
        coordinator_url: format!("ws://127.0.0.1:{}/connect", port),
        identity_url: "http://identity.local".to_string(),
        server_secret: SECRET.to_string(),
        auth_ttl: 60,
        ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        max_peers: 64,
        report_period: 3600,
        outbound_queue_size: 16,
        subscription_max_per_peer: 1024,
        subscription_debounce_ms: 100,
        auth_timeout_secs: 10,
        ice_timeout_secs: 20,
        connect_timeout_secs: 30,
        send_timeout_secs: 5,
        max_body_len: 64 * 1024,
        exit_on_coordinator_close: false,
        log_level: "warn".to_string(),
    }
}

/// Serve a coordinator on an ephemeral port, returning it and the port
async fn boot_coordinator() -> (Arc<Coordinator>, u16) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let coordinator = Coordinator::new(
        coordinator_config(port),
        Arc::new(Authenticator::SharedSecret {
            secret: SECRET.to_string(),
        }),
        Box::new(RandomSelector::seeded(7)),
        Box::new(|_: &CoordinatorStats| {}),
    );
    let router = coordinator.router();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    (coordinator, port)
}

#[tokio::test]
async fn test_status_and_version_endpoints() {
    let (_coordinator, port) = boot_coordinator().await;

    let status = reqwest::get(format!("http://127.0.0.1:{}/status", port))
        .await
        .expect("status request");
    assert_eq!(status.status().as_u16(), 200);

    let version: serde_json::Value = reqwest::get(format!("http://127.0.0.1:{}/version", port))
        .await
        .expect("version request")
        .json()
        .await
        .expect("version body");
    assert_eq!(
        version.get("version").and_then(|v| v.as_str()),
        Some(env!("CARGO_PKG_VERSION"))
    );
}

#[tokio::test]
async fn test_upgrade_rejected_with_wrong_secret() {
    let (coordinator, port) = boot_coordinator().await;

    let url = format!("ws://127.0.0.1:{}/connect?secret=wrong", port);
    let result = tokio_tungstenite::connect_async(url).await;
    assert!(result.is_err(), "handshake must be refused");

    assert_eq!(coordinator.counters.auth_failures("invalid_credential"), 1);
}

#[tokio::test]
async fn test_upgrade_rejected_without_credentials() {
    let (coordinator, port) = boot_coordinator().await;

    // No secret and no client tuple: a client-role request with
    // nothing to validate.
    let url = format!("ws://127.0.0.1:{}/connect", port);
    let result = tokio_tungstenite::connect_async(url).await;
    assert!(result.is_err(), "handshake must be refused");

    assert_eq!(coordinator.counters.auth_failures("missing"), 1);
}

#[tokio::test]
async fn test_relay_registers_over_live_signaling() {
    let (_coordinator, port) = boot_coordinator().await;

    let server = CommServer::new(
        server_config(port),
        Arc::new(Authenticator::SharedSecret {
            secret: SECRET.to_string(),
        }),
        tracing_sink(),
    );

    let running = tokio::spawn(server.clone().run());

    // WELCOME assigns the first alias to the relay.
    tokio::time::timeout(Duration::from_secs(5), async {
        while server.alias() == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("welcome within deadline");
    assert_eq!(server.alias(), 1);

    server.shutdown();
    let result = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("run ends")
        .expect("task joins");
    assert!(result.is_ok());
}
