//! Coordinator scenarios: lazy session creation, ICE buffering discipline,
//! purge on departure, key announcement and the encrypted chat path.

mod common;

use std::sync::Arc;
use std::time::Duration;

use callmesh::crypto::{chat, KeyExchange};
use callmesh::rtc::{
    IceCandidateInit, PeerId, RejectReason, RoomClient, RoomCommand, RoomConfig, RoomEvent,
    RosterEntry, SignalMessage,
};
use common::MockFactory;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

struct Harness {
    inbound: mpsc::Sender<SignalMessage>,
    commands: mpsc::Sender<RoomCommand>,
    outbound: mpsc::Receiver<SignalMessage>,
    events: mpsc::Receiver<RoomEvent>,
    factory: Arc<MockFactory>,
    active: watch::Receiver<bool>,
    client: JoinHandle<anyhow::Result<()>>,
}

fn start() -> Harness {
    let (outbound_tx, outbound_rx) = mpsc::channel(256);
    let (inbound_tx, inbound_rx) = mpsc::channel(256);
    let (events_tx, events_rx) = mpsc::channel(256);
    let (commands_tx, commands_rx) = mpsc::channel(16);
    let (active_tx, active_rx) = watch::channel(true);

    let factory = MockFactory::new();
    let cfg = RoomConfig {
        stable_wait: Duration::from_millis(2500),
        max_ice_restarts: 2,
        max_chat_len: 500,
        max_name_len: 64,
    };
    let (client, transport_events_rx) = RoomClient::new(
        cfg,
        factory.clone(),
        outbound_tx,
        events_tx,
        active_tx,
    );
    let client = tokio::spawn(client.run(inbound_rx, transport_events_rx, commands_rx));

    Harness {
        inbound: inbound_tx,
        commands: commands_tx,
        outbound: outbound_rx,
        events: events_rx,
        factory,
        active: active_rx,
        client,
    }
}

fn entry(id: &str) -> RosterEntry {
    RosterEntry {
        id: PeerId::from(id),
        name: String::new(),
    }
}

fn cand(s: &str) -> IceCandidateInit {
    IceCandidateInit {
        candidate: s.to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

async fn next_outbound(h: &mut Harness, wanted: &str) -> SignalMessage {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(30), h.outbound.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for outbound {wanted}"))
            .expect("outbound channel closed");
        if msg.msg_type() == wanted {
            return msg;
        }
    }
}

async fn next_event(h: &mut Harness) -> RoomEvent {
    tokio::time::timeout(Duration::from_secs(30), h.events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

#[tokio::test(start_paused = true)]
async fn test_empty_room_creates_no_sessions() {
    let mut h = start();
    h.inbound
        .send(SignalMessage::Hello {
            id: PeerId::from("a1"),
            roster: vec![entry("a1")],
        })
        .await
        .unwrap();

    match next_event(&mut h).await {
        RoomEvent::Welcomed { id, .. } => assert_eq!(id.as_str(), "a1"),
        other => panic!("unexpected event: {other:?}"),
    }
    // Roster membership alone is not a session; creation is lazy
    assert_eq!(h.factory.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_peer_joined_while_joined_issues_offer() {
    let mut h = start();
    h.commands
        .send(RoomCommand::Join {
            name: "Alice".to_string(),
        })
        .await
        .unwrap();
    h.inbound
        .send(SignalMessage::Hello {
            id: PeerId::from("a1"),
            roster: vec![entry("a1")],
        })
        .await
        .unwrap();
    h.inbound
        .send(SignalMessage::PeerJoined {
            id: PeerId::from("b1"),
        })
        .await
        .unwrap();

    // The joiner gets our public key and, since a1 < b1, an offer
    match next_outbound(&mut h, "key").await {
        SignalMessage::Key { to, .. } => assert_eq!(to, Some(PeerId::from("b1"))),
        other => panic!("unexpected message: {other:?}"),
    }
    match next_outbound(&mut h, "offer").await {
        SignalMessage::Offer { to, .. } => assert_eq!(to, Some(PeerId::from("b1"))),
        other => panic!("unexpected message: {other:?}"),
    }

    let transport = h.factory.transport(&PeerId::from("b1")).expect("session exists");
    assert!(transport.audio_attached(), "joined sessions carry outbound audio");
}

#[tokio::test(start_paused = true)]
async fn test_callee_side_does_not_dial() {
    let mut h = start();
    h.commands
        .send(RoomCommand::Join {
            name: "Carol".to_string(),
        })
        .await
        .unwrap();
    // Local id c1 is larger than b1: the other side calls us
    h.inbound
        .send(SignalMessage::Hello {
            id: PeerId::from("c1"),
            roster: vec![entry("c1"), entry("b1")],
        })
        .await
        .unwrap();

    // Key announcement still goes out, but no offer and no session
    next_outbound(&mut h, "key").await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.factory.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_early_candidates_buffer_until_remote_description() {
    let mut h = start();
    let b1 = PeerId::from("b1");
    h.inbound
        .send(SignalMessage::Hello {
            id: PeerId::from("c1"),
            roster: vec![entry("c1"), entry("b1")],
        })
        .await
        .unwrap();

    // Candidates race ahead of the offer: buffered, in order
    for c in [
        cand("candidate:1 1 UDP 1 10.0.0.1 1000 typ host"),
        cand("candidate:2 1 UDP 1 10.0.0.2 1001 typ host"),
    ] {
        h.inbound
            .send(SignalMessage::Ice {
                to: None,
                from: Some(b1.clone()),
                candidate: Some(c),
            })
            .await
            .unwrap();
    }
    // An unresolved mDNS placeholder is noise, not worth buffering
    h.inbound
        .send(SignalMessage::Ice {
            to: None,
            from: Some(b1.clone()),
            candidate: Some(cand("candidate:3 1 UDP 1 ab-cd.local 1002 typ host")),
        })
        .await
        .unwrap();

    h.inbound
        .send(SignalMessage::Offer {
            to: None,
            from: Some(b1.clone()),
            sdp: "remote-offer".to_string(),
            sdp_type: callmesh::rtc::SdpKind::Offer,
        })
        .await
        .unwrap();

    match next_outbound(&mut h, "answer").await {
        SignalMessage::Answer { to, .. } => assert_eq!(to, Some(b1.clone())),
        other => panic!("unexpected message: {other:?}"),
    }

    let transport = h.factory.transport(&b1).expect("lazy session on first offer");
    let applied = transport.applied_candidates();
    assert_eq!(applied.len(), 2, "mdns candidate must be dropped");
    assert!(applied[0].as_ref().unwrap().candidate.contains("10.0.0.1"));
    assert!(applied[1].as_ref().unwrap().candidate.contains("10.0.0.2"));

    // With the remote description in place, candidates apply directly
    h.inbound
        .send(SignalMessage::Ice {
            to: None,
            from: Some(b1.clone()),
            candidate: Some(cand("candidate:4 1 UDP 1 10.0.0.3 1003 typ host")),
        })
        .await
        .unwrap();
    // End-of-candidates passes straight through
    h.inbound
        .send(SignalMessage::Ice {
            to: None,
            from: Some(b1.clone()),
            candidate: None,
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    let applied = transport.applied_candidates();
    assert_eq!(applied.len(), 4);
    assert!(applied[2].as_ref().unwrap().candidate.contains("10.0.0.3"));
    assert!(applied[3].is_none());
}

#[tokio::test(start_paused = true)]
async fn test_peer_left_mid_negotiation_purges_everything() {
    let mut h = start();
    let b1 = PeerId::from("b1");
    h.commands
        .send(RoomCommand::Join {
            name: "Alice".to_string(),
        })
        .await
        .unwrap();
    h.inbound
        .send(SignalMessage::Hello {
            id: PeerId::from("a1"),
            roster: vec![entry("a1")],
        })
        .await
        .unwrap();
    h.inbound
        .send(SignalMessage::PeerJoined { id: b1.clone() })
        .await
        .unwrap();
    next_outbound(&mut h, "offer").await;

    // Departure while our offer is in flight
    h.inbound
        .send(SignalMessage::PeerLeft { id: b1.clone() })
        .await
        .unwrap();
    loop {
        if let RoomEvent::PeerLeft { id } = next_event(&mut h).await {
            assert_eq!(id, b1);
            break;
        }
    }
    let transport = h.factory.transport(&b1).expect("transport was created");
    assert!(transport.is_closed());

    // A late answer from the departed peer lands nowhere, without crashing
    h.inbound
        .send(SignalMessage::Answer {
            to: None,
            from: Some(b1.clone()),
            sdp: "late-answer".to_string(),
            sdp_type: callmesh::rtc::SdpKind::Answer,
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(transport.remote().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_admission_rejection_is_fatal() {
    let mut h = start();
    h.inbound
        .send(SignalMessage::Full { capacity: Some(10) })
        .await
        .unwrap();

    match next_event(&mut h).await {
        RoomEvent::Rejected {
            reason: RejectReason::RoomFull { capacity },
        } => assert_eq!(capacity, Some(10)),
        other => panic!("unexpected event: {other:?}"),
    }
    h.client.await.unwrap().unwrap();
    assert!(!*h.active.borrow(), "link must not keep reconnecting");
}

#[tokio::test(start_paused = true)]
async fn test_browser_only_rejection_is_fatal() {
    let mut h = start();
    h.inbound
        .send(SignalMessage::BrowserOnly {
            reason: Some("Please join from a web browser".to_string()),
        })
        .await
        .unwrap();

    match next_event(&mut h).await {
        RoomEvent::Rejected {
            reason: RejectReason::BrowserOnly,
        } => {}
        other => panic!("unexpected event: {other:?}"),
    }
    h.client.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_chat_round_trip_through_coordinator() {
    let mut h = start();
    let a1 = PeerId::from("a1");
    let b1 = PeerId::from("b1");

    h.inbound
        .send(SignalMessage::Hello {
            id: a1.clone(),
            roster: vec![entry("a1"), entry("b1")],
        })
        .await
        .unwrap();

    // The hello triggers our key announcement towards b1
    let our_pub = match next_outbound(&mut h, "key").await {
        SignalMessage::Key { public_key, .. } => public_key,
        other => panic!("unexpected message: {other:?}"),
    };

    // b1's side of the exchange
    let mut remote = KeyExchange::new();
    remote.bind(b1.clone());
    remote.receive(&a1, &our_pub).unwrap();

    h.inbound
        .send(SignalMessage::Key {
            to: None,
            from: Some(b1.clone()),
            public_key: remote.public_key_b64(),
        })
        .await
        .unwrap();
    loop {
        if let RoomEvent::KeyFingerprint { peer, rotated, .. } = next_event(&mut h).await {
            assert_eq!(peer, b1);
            assert!(!rotated);
            break;
        }
    }

    // Outbound: our plaintext must decrypt under b1's pair key
    h.commands
        .send(RoomCommand::Chat {
            text: "hello mesh".to_string(),
        })
        .await
        .unwrap();
    match next_outbound(&mut h, "chat-e2e").await {
        SignalMessage::ChatE2e { to, iv, ct, .. } => {
            assert_eq!(to, Some(b1.clone()));
            let key = remote.chat_key(&a1).unwrap();
            assert_eq!(chat::open(key, &iv, &ct).unwrap(), "hello mesh");
        }
        other => panic!("unexpected message: {other:?}"),
    }

    // Inbound: b1's ciphertext surfaces as a chat event
    let sealed = chat::seal(remote.chat_key(&a1).unwrap(), "hi back").unwrap();
    h.inbound
        .send(SignalMessage::ChatE2e {
            to: None,
            from: Some(b1.clone()),
            iv: sealed.iv,
            ct: sealed.ct,
            ts: 1_700_000_000_000,
        })
        .await
        .unwrap();
    loop {
        if let RoomEvent::Chat { from, text, .. } = next_event(&mut h).await {
            assert_eq!(from, b1);
            assert_eq!(text, "hi back");
            break;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_undecryptable_chat_reannounces_key() {
    let mut h = start();
    let a1 = PeerId::from("a1");
    let z9 = PeerId::from("z9");

    h.inbound
        .send(SignalMessage::Hello {
            id: a1.clone(),
            roster: vec![entry("a1")],
        })
        .await
        .unwrap();
    next_event(&mut h).await;

    // Chat from a peer whose key we never saw: dropped, key re-announced so
    // the sender can retry
    h.inbound
        .send(SignalMessage::ChatE2e {
            to: None,
            from: Some(z9.clone()),
            iv: "YWJjZGVmZ2hpamts".to_string(),
            ct: "Z2FyYmFnZQ==".to_string(),
            ts: 0,
        })
        .await
        .unwrap();
    match next_outbound(&mut h, "key").await {
        SignalMessage::Key { to, .. } => assert_eq!(to, Some(z9)),
        other => panic!("unexpected message: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_safety_ok_marks_peer_verified() {
    let mut h = start();
    let a1 = PeerId::from("a1");
    let b1 = PeerId::from("b1");

    h.inbound
        .send(SignalMessage::Hello {
            id: a1.clone(),
            roster: vec![entry("a1"), entry("b1")],
        })
        .await
        .unwrap();
    let remote = KeyExchange::new();
    h.inbound
        .send(SignalMessage::Key {
            to: None,
            from: Some(b1.clone()),
            public_key: remote.public_key_b64(),
        })
        .await
        .unwrap();
    h.inbound
        .send(SignalMessage::SafetyOk {
            to: None,
            from: Some(b1.clone()),
        })
        .await
        .unwrap();

    loop {
        if let RoomEvent::PeerVerified { peer } = next_event(&mut h).await {
            assert_eq!(peer, b1);
            break;
        }
    }
}
