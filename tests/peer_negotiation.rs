mod support;

use serde_json::json;
use std::time::Duration;

use support::{build_peer, unseal, wait_until};
use tincan::SessionState;
use tincan::keystore::SessionKeyStore;
use tincan::signaling::{MemoryRelay, OfferPayload, SdpKind, SignalKind, SignalingApi};
use tincan::transport::MockHub;

#[tokio::test]
async fn offer_envelope_carries_sdp_and_session_key() {
    let relay = MemoryRelay::new();
    let hub = MockHub::new();
    let (alice, _recorder) = build_peer("@alice", &relay, &hub, None);

    alice.connect("@bob").await;
    assert_eq!(alice.connection_status("@bob"), SessionState::Connecting);

    let outbound = relay.drain("@bob");
    assert_eq!(outbound.len(), 1);
    let envelope = &outbound[0];
    assert_eq!(envelope.from_user, "@alice");
    assert_eq!(envelope.kind, SignalKind::Offer);

    let payload: OfferPayload = serde_json::from_value(unseal(envelope)).unwrap();
    assert_eq!(payload.kind, SdpKind::Offer);
    assert!(!payload.sdp.is_empty());
    let key = SessionKeyStore::decode_encoded(&payload.aes_key).unwrap();
    assert_eq!(alice.keys().get("@bob"), Some(key));
}

#[tokio::test]
async fn inbound_offer_creates_session_and_answers_once() {
    let relay_a = MemoryRelay::new();
    let relay_b = MemoryRelay::new();
    let hub = MockHub::new();
    let (alice, _ra) = build_peer("@alice", &relay_a, &hub, None);
    let (bob, recorder_b) = build_peer("@bob", &relay_b, &hub, None);

    alice.connect("@bob").await;
    let offer = relay_a.drain("@bob").remove(0);
    bob.handle_incoming_signal(offer).await;

    assert_eq!(bob.connection_status("@alice"), SessionState::Connecting);
    assert!(recorder_b
        .states()
        .contains(&("@alice".to_string(), SessionState::Connecting)));

    let outbound = relay_b.drain("@alice");
    let answers: Vec<_> = outbound
        .iter()
        .filter(|envelope| envelope.kind == SignalKind::Answer)
        .collect();
    assert_eq!(answers.len(), 1);
    let body = unseal(answers[0]);
    assert_eq!(body["type"], "answer");
    assert!(body.get("aesKey").is_none());

    // responder installed the key embedded in the offer
    assert_eq!(bob.keys().get("@alice"), alice.keys().get("@bob"));
}

#[tokio::test]
async fn simultaneous_offers_resolve_to_higher_identifier() {
    collision_run(true).await;
}

#[tokio::test]
async fn simultaneous_offers_resolve_identically_in_reverse_order() {
    collision_run(false).await;
}

async fn collision_run(deliver_to_alice_first: bool) {
    let relay_a = MemoryRelay::new();
    let relay_b = MemoryRelay::new();
    let hub = MockHub::new();
    let (alice, recorder_a) = build_peer("@alice", &relay_a, &hub, None);
    let (bob, recorder_b) = build_peer("@bob", &relay_b, &hub, None);

    alice.connect("@bob").await;
    bob.connect("@alice").await;
    let offer_from_alice = relay_a.drain("@bob").remove(0);
    let offer_from_bob = relay_b.drain("@alice").remove(0);

    if deliver_to_alice_first {
        alice.handle_incoming_signal(offer_from_bob).await;
        bob.handle_incoming_signal(offer_from_alice).await;
    } else {
        bob.handle_incoming_signal(offer_from_alice).await;
        alice.handle_incoming_signal(offer_from_bob).await;
    }

    // "@bob" sorts higher, so bob keeps his offer and never answers
    let from_bob = relay_b.drain("@alice");
    assert!(from_bob.iter().all(|e| e.kind != SignalKind::Answer));

    // alice yielded: her queue now carries exactly one answer for bob
    let from_alice = relay_a.drain("@bob");
    let answers: Vec<_> = from_alice
        .into_iter()
        .filter(|e| e.kind == SignalKind::Answer)
        .collect();
    assert_eq!(answers.len(), 1);
    bob.handle_incoming_signal(answers.into_iter().next().unwrap())
        .await;

    wait_until("both sides connected", || {
        alice.connection_status("@bob") == SessionState::Connected
            && bob.connection_status("@alice") == SessionState::Connected
    })
    .await;

    // surviving key is the one from bob's offer on both sides
    assert_eq!(alice.keys().get("@bob"), bob.keys().get("@alice"));

    let connected = |states: &[(String, SessionState)]| {
        states
            .iter()
            .filter(|(_, state)| *state == SessionState::Connected)
            .count()
    };
    assert_eq!(connected(&recorder_a.states()), 1);
    assert_eq!(connected(&recorder_b.states()), 1);
}

#[tokio::test]
async fn early_candidates_apply_after_answer_in_order() {
    let relay_a = MemoryRelay::new();
    let relay_b = MemoryRelay::new();
    let hub = MockHub::new();
    let (alice, _ra) = build_peer("@alice", &relay_a, &hub, None);
    let (bob, _rb) = build_peer("@bob", &relay_b, &hub, None);

    alice.connect("@bob").await;
    let offer = relay_a.drain("@bob").remove(0);
    bob.handle_incoming_signal(offer).await;

    let bob_transport = hub.transport(1).expect("responder transport");
    bob_transport.emit_local_candidate(json!({"candidate": "cand-1"}));
    wait_until("first candidate relayed", || relay_b.pending("@alice") >= 2).await;
    bob_transport.emit_local_candidate(json!({"candidate": "cand-2"}));
    wait_until("second candidate relayed", || relay_b.pending("@alice") >= 3).await;

    let mut outbound = relay_b.drain("@alice");
    let answer = outbound.remove(0);
    assert_eq!(answer.kind, SignalKind::Answer);

    let alice_transport = hub.transport(0).expect("initiator transport");
    for candidate in outbound {
        assert_eq!(candidate.kind, SignalKind::Ice);
        alice.handle_incoming_signal(candidate).await;
    }
    // queued: nothing applied before the remote description lands
    assert!(alice_transport.applied_candidates().is_empty());

    alice.handle_incoming_signal(answer).await;
    let applied = alice_transport.applied_candidates();
    assert_eq!(applied.len(), 2);
    assert_eq!(applied[0]["candidate"], "cand-1");
    assert_eq!(applied[1]["candidate"], "cand-2");

    // once applied, late candidates skip the queue
    bob_transport.emit_local_candidate(json!({"candidate": "cand-3"}));
    wait_until("late candidate relayed", || relay_b.pending("@alice") >= 1).await;
    for envelope in relay_b.drain("@alice") {
        alice.handle_incoming_signal(envelope).await;
    }
    let applied = alice_transport.applied_candidates();
    assert_eq!(applied.len(), 3);
    assert_eq!(applied[2]["candidate"], "cand-3");
}

#[tokio::test]
async fn duplicate_answer_is_ignored() {
    let relay_a = MemoryRelay::new();
    let relay_b = MemoryRelay::new();
    let hub = MockHub::new();
    let (alice, recorder_a) = build_peer("@alice", &relay_a, &hub, None);
    let (bob, _rb) = build_peer("@bob", &relay_b, &hub, None);

    alice.connect("@bob").await;
    bob.handle_incoming_signal(relay_a.drain("@bob").remove(0)).await;
    let answer = relay_b
        .drain("@alice")
        .into_iter()
        .find(|e| e.kind == SignalKind::Answer)
        .unwrap();

    alice.handle_incoming_signal(answer.clone()).await;
    alice.handle_incoming_signal(answer).await;

    let alice_transport = hub.transport(0).unwrap();
    assert_eq!(alice_transport.remote_description_count(), 1);
    assert!(recorder_a.errors().is_empty());

    wait_until("connected despite duplicate", || {
        alice.connection_status("@bob") == SessionState::Connected
    })
    .await;
}

#[tokio::test]
async fn answer_for_unknown_session_is_dropped() {
    let relay = MemoryRelay::new();
    let hub = MockHub::new();
    let (alice, recorder) = build_peer("@alice", &relay, &hub, None);

    let stray = tincan::signaling::SignalEnvelope {
        from_user: "@zoe".to_string(),
        kind: SignalKind::Answer,
        encrypted_payload: serde_json::to_string(&tincan::signaling::WirePayload::Plain {
            body: json!({"sdp": "mock-sdp:9:answer", "type": "answer"}),
        })
        .unwrap(),
        timestamp: 0,
    };
    alice.handle_incoming_signal(stray).await;

    assert!(recorder.errors().is_empty());
    assert!(recorder.states().is_empty());
    assert_eq!(alice.connection_status("@zoe"), SessionState::Idle);
}

#[tokio::test]
async fn candidate_before_any_session_is_dropped() {
    let relay = MemoryRelay::new();
    let hub = MockHub::new();
    let (alice, recorder) = build_peer("@alice", &relay, &hub, None);

    let bob_endpoint = relay.endpoint("@bob");
    bob_endpoint
        .send(
            "@alice",
            SignalKind::Ice,
            serde_json::to_string(&tincan::signaling::WirePayload::Plain {
                body: json!({"candidate": "orphan"}),
            })
            .unwrap(),
        )
        .await
        .unwrap();

    wait_until("orphan candidate polled", || relay.pending("@alice") == 0).await;
    assert!(recorder.errors().is_empty());
    assert_eq!(alice.connection_status("@bob"), SessionState::Idle);
}

#[tokio::test]
async fn stalled_negotiation_times_out() {
    let relay = MemoryRelay::new();
    let hub = MockHub::new();
    let (alice, recorder) =
        build_peer("@alice", &relay, &hub, Some(Duration::from_millis(100)));

    alice.connect("@bob").await;
    assert_eq!(alice.connection_status("@bob"), SessionState::Connecting);

    wait_until("timeout fired", || {
        recorder
            .states()
            .contains(&("@bob".to_string(), SessionState::Failed))
    })
    .await;
    assert!(recorder
        .errors()
        .iter()
        .any(|(peer, message)| peer == "@bob" && message.contains("timed out")));
    assert_eq!(alice.connection_status("@bob"), SessionState::Idle);
    assert_eq!(alice.keys().get("@bob"), None);
}

#[tokio::test]
async fn transport_setup_failure_reports_failed() {
    use std::sync::Arc;
    use support::{ArmorDouble, FailingFactory, Recorder, known_peers_directory, test_config};
    use tincan::manager::{ManagerDeps, PeerManager};

    let relay = MemoryRelay::new();
    let deps = ManagerDeps {
        signaling: relay.endpoint("@alice"),
        transports: Arc::new(FailingFactory),
        identity: Arc::new(ArmorDouble),
        directory: known_peers_directory(),
    };
    let manager = PeerManager::new("@alice", test_config(None), deps);
    let recorder = Recorder::default();
    manager.init(recorder.callbacks());

    manager.connect("@bob").await;
    assert!(recorder
        .states()
        .contains(&("@bob".to_string(), SessionState::Failed)));
    assert_eq!(recorder.errors().len(), 1);
    assert_eq!(manager.connection_status("@bob"), SessionState::Idle);
    assert_eq!(manager.keys().get("@bob"), None);
    assert_eq!(relay.pending("@bob"), 0);
}

#[tokio::test]
async fn repeated_init_keeps_polling_alive() {
    let relay = MemoryRelay::new();
    let hub = MockHub::new();
    let (alice, recorder) = build_peer("@alice", &relay, &hub, None);

    // second init replaces callbacks without spawning a second poller
    alice.init(recorder.callbacks());

    let bob_endpoint = relay.endpoint("@bob");
    bob_endpoint
        .send(
            "@alice",
            SignalKind::Ice,
            serde_json::to_string(&tincan::signaling::WirePayload::Plain {
                body: json!({"candidate": "probe"}),
            })
            .unwrap(),
        )
        .await
        .unwrap();
    wait_until("poll still active", || relay.pending("@alice") == 0).await;
}
