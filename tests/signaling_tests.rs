//! Comprehensive tests for the signaling link
//! Runs a local WebSocket endpoint and exercises framing, decoding
//! and link-loss detection end to end

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use worldcomm::codec::{Codec, Envelope};
use worldcomm::proto::{MessageType, WelcomeMessage};
use worldcomm::signaling::SignalingLink;

fn welcome(alias: u64) -> Envelope {
    Envelope::Welcome(WelcomeMessage {
        r#type: MessageType::Welcome as i32,
        alias,
        available_servers: vec![],
    })
}

/// Accept one socket and echo every binary frame back
async fn echo_endpoint(listener: TcpListener) {
    let (stream, _) = listener.accept().await.expect("accept");
    let mut ws = accept_async(stream).await.expect("upgrade");
    while let Some(Ok(message)) = ws.next().await {
        match message {
            Message::Binary(frame) => {
                if ws.send(Message::Binary(frame)).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

async fn local_endpoint() -> (String, TcpListener) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    (format!("ws://127.0.0.1:{}/connect", port), listener)
}

#[tokio::test]
async fn test_envelope_round_trip_over_link() {
    let (url, listener) = local_endpoint().await;
    tokio::spawn(echo_endpoint(listener));

    let (link, mut inbound) = SignalingLink::connect(&url, Codec::default())
        .await
        .expect("connect");

    let envelope = welcome(7);
    link.send(envelope.clone()).expect("send");

    let received = tokio::time::timeout(Duration::from_secs(2), inbound.recv())
        .await
        .expect("echo within deadline")
        .expect("stream open");
    assert_eq!(received, envelope);
}

#[tokio::test]
async fn test_bad_frames_are_skipped() {
    let (url, listener) = local_endpoint().await;
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = accept_async(stream).await.expect("upgrade");
        // Garbage first, then a well-formed frame.
        ws.send(Message::Binary(vec![1, 2, 3])).await.expect("send");
        let framed = Codec::default()
            .frame(&welcome(9).encode())
            .expect("frame");
        ws.send(Message::Binary(framed)).await.expect("send");
        // Hold the socket open until the test is done reading.
        let _ = ws.next().await;
    });

    let (_link, mut inbound) = SignalingLink::connect(&url, Codec::default())
        .await
        .expect("connect");

    let received = tokio::time::timeout(Duration::from_secs(2), inbound.recv())
        .await
        .expect("frame within deadline")
        .expect("stream open");
    assert_eq!(received, welcome(9));
}

#[tokio::test]
async fn test_link_loss_fires_cancellation() {
    let (url, listener) = local_endpoint().await;
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = accept_async(stream).await.expect("upgrade");
        let _ = ws.close(None).await;
    });

    let (link, _inbound) = SignalingLink::connect(&url, Codec::default())
        .await
        .expect("connect");

    tokio::time::timeout(Duration::from_secs(2), link.closed().cancelled())
        .await
        .expect("closed token fires");
    assert!(link.is_closed());
}

#[tokio::test]
async fn test_connect_refused_after_retries() {
    // Nothing is listening on this port; bind and drop to find a free one.
    let (url, listener) = local_endpoint().await;
    drop(listener);

    let result = SignalingLink::connect_with_retries(&url, Codec::default(), 1).await;
    assert!(result.is_err());
}
