//! Comprehensive tests for envelope encoding and framing
//! Tests round-trip laws, unknown types, body limits and the
//! length-prefixed signaling frame

use worldcomm::codec::{Codec, Envelope, FRAME_HEADER_LEN};
use worldcomm::error::CommError;
use worldcomm::proto::*;

fn sample_envelopes() -> Vec<Envelope> {
    vec![
        Envelope::Auth(AuthMessage {
            r#type: MessageType::Auth as i32,
            role: Role::Client as i32,
            body: vec![1, 2, 3],
        }),
        Envelope::Welcome(WelcomeMessage {
            r#type: MessageType::Welcome as i32,
            alias: 7,
            available_servers: vec![3, 5],
        }),
        Envelope::Connect(ConnectMessage {
            r#type: MessageType::Connect as i32,
            from_alias: 3,
            to_alias: 7,
        }),
        Envelope::WebRtc(WebRtcMessage {
            r#type: MessageType::WebrtcOffer as i32,
            from_alias: 3,
            to_alias: 7,
            sdp: b"v=0".to_vec(),
        }),
        Envelope::WebRtc(WebRtcMessage {
            r#type: MessageType::WebrtcAnswer as i32,
            from_alias: 7,
            to_alias: 3,
            sdp: b"v=0".to_vec(),
        }),
        Envelope::WebRtc(WebRtcMessage {
            r#type: MessageType::WebrtcIceCandidate as i32,
            from_alias: 7,
            to_alias: 3,
            sdp: b"{\"candidate\":\"\"}".to_vec(),
        }),
        Envelope::Subscription(SubscriptionMessage {
            r#type: MessageType::Subscription as i32,
            format: Format::Plain as i32,
            topics: b"position:5:5 chat:0:0".to_vec(),
        }),
        Envelope::Topic(TopicMessage {
            r#type: MessageType::Topic as i32,
            topic: "position:5:5".to_string(),
            body: vec![9; 16],
        }),
        Envelope::TopicFw(TopicFwMessage {
            r#type: MessageType::TopicFw as i32,
            from_alias: 10,
            topic: "position:5:5".to_string(),
            body: vec![9; 16],
        }),
        Envelope::TopicIdentity(TopicIdentityMessage {
            r#type: MessageType::TopicIdentity as i32,
            topic: "chat:0:0".to_string(),
            body: vec![1],
        }),
        Envelope::TopicIdentityFw(TopicIdentityFwMessage {
            r#type: MessageType::TopicIdentityFw as i32,
            from_alias: 10,
            identity: b"user-1".to_vec(),
            topic: "chat:0:0".to_string(),
            body: vec![1],
        }),
        Envelope::Ping(PingMessage {
            r#type: MessageType::Ping as i32,
            time: 1234.5,
        }),
    ]
}

#[test]
fn test_round_trip_all_known_envelopes() {
    let codec = Codec::default();
    for envelope in sample_envelopes() {
        let encoded = envelope.encode();
        let decoded = codec.decode(&encoded).expect("decode should succeed");
        assert_eq!(decoded, envelope);
        // Canonical encoder: encode(decode(x)) == x
        assert_eq!(decoded.encode(), encoded);
    }
}

#[test]
fn test_peek_type_matches_envelope() {
    let codec = Codec::default();
    for envelope in sample_envelopes() {
        let encoded = envelope.encode();
        let peeked = codec.peek_type(&encoded).expect("peek should succeed");
        assert_eq!(peeked, envelope.message_type());
    }
}

#[test]
fn test_unknown_type_retains_raw_bytes() {
    let codec = Codec::default();
    // Field 1 varint 99: not a MessageType this build knows.
    let raw = vec![0x08, 99];
    match codec.peek_type(&raw) {
        Err(CommError::UnknownMessageType { type_tag, raw: kept }) => {
            assert_eq!(type_tag, 99);
            assert_eq!(kept, raw);
        }
        other => panic!("expected UnknownMessageType, got {:?}", other.map(|t| t as i32)),
    }
}

#[test]
fn test_body_length_limit_enforced() {
    let codec = Codec::new(32);
    let envelope = Envelope::Topic(TopicMessage {
        r#type: MessageType::Topic as i32,
        topic: "position:5:5".to_string(),
        body: vec![0; 64],
    });
    let encoded = envelope.encode();
    assert!(encoded.len() > 32);
    assert!(matches!(
        codec.decode(&encoded),
        Err(CommError::Protocol(_))
    ));
    assert!(matches!(codec.frame(&encoded), Err(CommError::Protocol(_))));
}

#[test]
fn test_frame_round_trip() {
    let codec = Codec::default();
    let envelope = Envelope::Ping(PingMessage {
        r#type: MessageType::Ping as i32,
        time: 1.0,
    });
    let encoded = envelope.encode();
    let framed = codec.frame(&encoded).expect("frame should succeed");
    assert_eq!(framed.len(), FRAME_HEADER_LEN + encoded.len());
    assert_eq!(
        &framed[..FRAME_HEADER_LEN],
        (encoded.len() as u32).to_be_bytes()
    );
    let payload = codec.deframe(&framed).expect("deframe should succeed");
    assert_eq!(payload, &encoded[..]);
}

#[test]
fn test_deframe_rejects_short_frame() {
    let codec = Codec::default();
    assert!(matches!(
        codec.deframe(&[0, 0]),
        Err(CommError::Protocol(_))
    ));
}

#[test]
fn test_deframe_rejects_length_mismatch() {
    let codec = Codec::default();
    let mut framed = codec.frame(&[1, 2, 3]).expect("frame should succeed");
    framed.push(4); // one trailing byte the prefix does not cover
    assert!(matches!(
        codec.deframe(&framed),
        Err(CommError::Protocol(_))
    ));
}

#[test]
fn test_deframe_rejects_oversized_declaration() {
    let codec = Codec::new(16);
    let mut framed = Vec::new();
    framed.extend_from_slice(&(1024u32).to_be_bytes());
    framed.extend_from_slice(&[0; 1024]);
    assert!(matches!(
        codec.deframe(&framed),
        Err(CommError::Protocol(_))
    ));
}

#[test]
fn test_unexpected_fields_are_ignored() {
    let codec = Codec::default();
    // A Ping envelope with an extra unknown field (tag 15, varint).
    let mut encoded = Envelope::Ping(PingMessage {
        r#type: MessageType::Ping as i32,
        time: 2.0,
    })
    .encode();
    encoded.extend_from_slice(&[0x78, 0x01]);
    match codec.decode(&encoded).expect("decode should succeed") {
        Envelope::Ping(ping) => assert_eq!(ping.time, 2.0),
        other => panic!("expected ping, got {:?}", other),
    }
}
