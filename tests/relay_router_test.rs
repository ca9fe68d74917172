//! Relay router integration tests
//!
//! Drives the router with channel-backed transports and a scripted PBX.

use async_trait::async_trait;
use serde_json::json;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};
use webphone::application::{RelayRouter, RouterSettings};
use webphone::domain::shared::value_objects::{BridgeId, ChannelId, SessionId};
use webphone::domain::signaling::{IceCandidate, Phase, SessionRegistry, SignalingMessage};
use webphone::domain::telephony::TelephonyControl;
use webphone::domain::{Result, SignalingError};
use webphone::infrastructure::InMemoryUserDirectory;

/// Scripted PBX that records every call it receives
#[derive(Default)]
struct FakePbx {
    calls: Mutex<Vec<String>>,
    fail_channel: bool,
    fail_bridge: bool,
    /// When set, channel allocation parks until notified
    gate: Option<Arc<Notify>>,
    entered: Arc<Notify>,
}

impl FakePbx {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl TelephonyControl for FakePbx {
    async fn allocate_channel(&self, endpoint: &str) -> Result<ChannelId> {
        self.record(format!("channel {}", endpoint));
        if let Some(gate) = &self.gate {
            self.entered.notify_one();
            gate.notified().await;
        }
        if self.fail_channel {
            return Err(SignalingError::telephony("Authentication rejected: 401"));
        }
        Ok(ChannelId::new("ch1"))
    }

    async fn allocate_bridge(&self) -> Result<BridgeId> {
        self.record("bridge".to_string());
        if self.fail_bridge {
            return Err(SignalingError::telephony("Unexpected status 500"));
        }
        Ok(BridgeId::new("br1"))
    }

    async fn attach_channel_to_bridge(&self, channel: &ChannelId, bridge: &BridgeId) -> Result<()> {
        self.record(format!("attach {} {}", channel, bridge));
        Ok(())
    }

    async fn release(&self, channel: Option<ChannelId>, bridge: Option<BridgeId>) {
        self.record(format!(
            "release {} {}",
            channel.map(|c| c.to_string()).unwrap_or_default(),
            bridge.map(|b| b.to_string()).unwrap_or_default()
        ));
    }
}

fn relay(pbx: Arc<FakePbx>) -> Arc<RelayRouter> {
    relay_with(pbx, RouterSettings::default())
}

fn relay_with(pbx: Arc<FakePbx>, settings: RouterSettings) -> Arc<RelayRouter> {
    Arc::new(RelayRouter::new(
        Arc::new(SessionRegistry::new()),
        pbx,
        Arc::new(InMemoryUserDirectory::new(4)),
        settings,
    ))
}

async fn connect(relay: &RelayRouter) -> (SessionId, mpsc::UnboundedReceiver<SignalingMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = SessionId::new();
    relay.on_connect(id, Arc::new(tx)).await.unwrap();
    (id, rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<SignalingMessage>) -> Vec<SignalingMessage> {
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(message);
    }
    messages
}

fn offer(sdp: &str) -> SignalingMessage {
    SignalingMessage::Offer { sdp: sdp.to_string() }
}

fn answer(sdp: &str) -> SignalingMessage {
    SignalingMessage::Answer { sdp: sdp.to_string() }
}

fn ice(n: u32) -> SignalingMessage {
    SignalingMessage::IceCandidate {
        candidate: IceCandidate::new(json!({ "candidate": format!("candidate:{}", n), "sdpMid": "0" })),
    }
}

async fn phase(relay: &RelayRouter, id: SessionId) -> Phase {
    relay.registry().get(id).await.unwrap().phase()
}

/// Numbers of the relayed candidates, in delivery order
fn candidate_numbers(messages: &[SignalingMessage]) -> Vec<u32> {
    messages
        .iter()
        .filter_map(|m| match m {
            SignalingMessage::IceCandidate { candidate } => candidate.as_value()["candidate"]
                .as_str()
                .and_then(|c| c.strip_prefix("candidate:"))
                .and_then(|n| n.parse().ok()),
            _ => None,
        })
        .collect()
}

fn error_codes(messages: Vec<SignalingMessage>) -> Vec<String> {
    messages
        .into_iter()
        .map(|m| match m {
            SignalingMessage::CallError { code, .. } => code,
            other => panic!("unexpected message: {:?}", other),
        })
        .collect()
}

#[tokio::test]
async fn test_full_call_with_trickled_candidates() {
    let pbx = Arc::new(FakePbx::default());
    let relay = relay(pbx.clone());

    let (a, mut a_rx) = connect(&relay).await;
    relay.on_inbound_message(a, offer("O1")).await;
    assert_eq!(phase(&relay, a).await, Phase::Offered);
    assert_eq!(pbx.calls(), vec!["channel PJSIP/1001", "bridge", "attach ch1 br1"]);

    // No counterpart yet; candidate is held back
    relay.on_inbound_message(a, ice(1)).await;

    let (b, mut b_rx) = connect(&relay).await;
    assert_eq!(drain(&mut b_rx), vec![offer("O1"), ice(1)]);
    // Still free to place its own call until it answers
    assert_eq!(phase(&relay, b).await, Phase::Idle);
    assert!(relay.registry().get(b).await.unwrap().has_pending_offer());

    // Caller has not seen an answer yet; callee candidates wait
    relay.on_inbound_message(b, ice(2)).await;
    relay.on_inbound_message(b, ice(3)).await;
    assert!(drain(&mut a_rx).is_empty());

    relay.on_inbound_message(b, answer("A1")).await;
    assert_eq!(drain(&mut a_rx), vec![answer("A1"), ice(2), ice(3)]);
    assert_eq!(phase(&relay, a).await, Phase::Connected);
    assert_eq!(phase(&relay, b).await, Phase::Connected);

    relay.on_inbound_message(a, ice(4)).await;
    assert_eq!(drain(&mut b_rx), vec![ice(4)]);

    relay.on_disconnect(b).await;
    assert_eq!(drain(&mut a_rx), vec![SignalingMessage::Hangup]);
    assert_eq!(pbx.count("release ch1 br1"), 1);
    assert!(!relay.registry().contains(b).await);
    assert_eq!(phase(&relay, a).await, Phase::Closed);

    relay.on_disconnect(a).await;
    assert_eq!(pbx.count("release"), 1);
    assert!(relay.registry().is_empty().await);
}

#[tokio::test]
async fn test_waiting_callers_are_served_oldest_first() {
    let pbx = Arc::new(FakePbx::default());
    let relay = relay(pbx);

    let (first, _first_rx) = connect(&relay).await;
    relay.on_inbound_message(first, offer("first")).await;
    let (second, mut second_rx) = connect(&relay).await;
    relay.on_inbound_message(second, offer("second")).await;

    // The first offer was relayed to `second` on connect and handed back
    // when `second` placed its own call
    assert_eq!(drain(&mut second_rx), vec![offer("first")]);
    assert_eq!(phase(&relay, second).await, Phase::Offered);

    let (callee, mut callee_rx) = connect(&relay).await;
    assert_eq!(drain(&mut callee_rx), vec![offer("first")]);
    assert_eq!(relay.registry().get(callee).await.unwrap().peer(), Some(first));
    assert_eq!(relay.registry().get(second).await.unwrap().peer(), None);
}

#[tokio::test]
async fn test_offered_session_can_place_its_own_call() {
    let pbx = Arc::new(FakePbx::default());
    let relay = relay(pbx.clone());

    let (a, mut a_rx) = connect(&relay).await;
    relay.on_inbound_message(a, offer("O1")).await;
    relay.on_inbound_message(a, ice(1)).await;

    let (b, mut b_rx) = connect(&relay).await;
    assert_eq!(drain(&mut b_rx), vec![offer("O1"), ice(1)]);

    relay.on_inbound_message(b, offer("O2")).await;
    relay.on_inbound_message(a, ice(2)).await;

    assert!(drain(&mut b_rx).is_empty());
    assert!(drain(&mut a_rx).is_empty());
    assert_eq!(phase(&relay, b).await, Phase::Offered);
    assert_eq!(pbx.count("channel"), 2);
    assert_eq!(pbx.count("release"), 0);
    let caller = relay.registry().get(a).await.unwrap();
    assert!(caller.is_waiting_for_callee());

    // The next session gets the oldest offer with every candidate so far
    let (c, mut c_rx) = connect(&relay).await;
    assert_eq!(drain(&mut c_rx), vec![offer("O1"), ice(1), ice(2)]);
    relay.on_inbound_message(c, answer("A1")).await;
    assert_eq!(drain(&mut a_rx), vec![answer("A1")]);
    assert_eq!(phase(&relay, a).await, Phase::Connected);
    assert!(relay.registry().get(b).await.unwrap().is_waiting_for_callee());
}

#[tokio::test]
async fn test_caller_leaving_frees_unanswered_callee() {
    let pbx = Arc::new(FakePbx::default());
    let relay = relay(pbx.clone());

    let (a, _a_rx) = connect(&relay).await;
    relay.on_inbound_message(a, offer("O1")).await;
    let (b, mut b_rx) = connect(&relay).await;
    assert_eq!(drain(&mut b_rx), vec![offer("O1")]);

    relay.on_disconnect(a).await;
    assert_eq!(drain(&mut b_rx), vec![SignalingMessage::Hangup]);
    assert_eq!(pbx.count("release ch1 br1"), 1);
    assert!(relay.registry().get(b).await.unwrap().is_available_callee());

    // Free again for the next caller
    let (c, _c_rx) = connect(&relay).await;
    relay.on_inbound_message(c, offer("O3")).await;
    assert_eq!(drain(&mut b_rx), vec![offer("O3")]);
}

#[tokio::test]
async fn test_answer_without_offer_is_rejected() {
    let pbx = Arc::new(FakePbx::default());
    let relay = relay(pbx.clone());

    let (a, mut a_rx) = connect(&relay).await;
    relay.on_inbound_message(a, answer("A1")).await;

    match drain(&mut a_rx).as_slice() {
        [SignalingMessage::CallError { code, .. }] => assert_eq!(code, "PROTOCOL_VIOLATION"),
        other => panic!("unexpected messages: {:?}", other),
    }
    assert_eq!(phase(&relay, a).await, Phase::Idle);
    assert!(pbx.calls().is_empty());
}

#[tokio::test]
async fn test_second_offer_is_rejected() {
    let pbx = Arc::new(FakePbx::default());
    let relay = relay(pbx.clone());

    let (a, mut a_rx) = connect(&relay).await;
    relay.on_inbound_message(a, offer("O1")).await;
    relay.on_inbound_message(a, offer("O2")).await;

    assert!(matches!(
        drain(&mut a_rx).as_slice(),
        [SignalingMessage::CallError { .. }]
    ));
    assert_eq!(pbx.count("channel"), 1);
}

#[tokio::test]
async fn test_ice_before_offer_is_not_reported() {
    let relay = relay(Arc::new(FakePbx::default()));

    let (a, mut a_rx) = connect(&relay).await;
    relay.on_inbound_message(a, ice(1)).await;

    assert!(drain(&mut a_rx).is_empty());
    assert!(relay.registry().get(a).await.unwrap().pending_ice_candidates().is_empty());
}

#[tokio::test]
async fn test_auth_failure_reports_call_error_without_bridge() {
    let pbx = Arc::new(FakePbx {
        fail_channel: true,
        ..FakePbx::default()
    });
    let relay = relay(pbx.clone());

    let (a, mut a_rx) = connect(&relay).await;
    relay.on_inbound_message(a, offer("O1")).await;

    match drain(&mut a_rx).as_slice() {
        [SignalingMessage::CallError { code, .. }] => assert_eq!(code, "TELEPHONY_UNAVAILABLE"),
        other => panic!("unexpected messages: {:?}", other),
    }
    assert_eq!(pbx.calls(), vec!["channel PJSIP/1001"]);
    assert_eq!(phase(&relay, a).await, Phase::Closed);

    // A caller that never got its resources is not offered to anyone
    let (_b, mut b_rx) = connect(&relay).await;
    assert!(drain(&mut b_rx).is_empty());
}

#[tokio::test]
async fn test_bridge_failure_releases_channel() {
    let pbx = Arc::new(FakePbx {
        fail_bridge: true,
        ..FakePbx::default()
    });
    let relay = relay(pbx.clone());

    let (a, mut a_rx) = connect(&relay).await;
    relay.on_inbound_message(a, offer("O1")).await;

    assert_eq!(
        pbx.calls(),
        vec!["channel PJSIP/1001", "bridge", "release ch1 "]
    );
    assert!(matches!(
        drain(&mut a_rx).as_slice(),
        [SignalingMessage::CallError { .. }]
    ));
}

#[tokio::test]
async fn test_disconnect_during_allocation_releases_once_allocated() {
    let gate = Arc::new(Notify::new());
    let pbx = Arc::new(FakePbx {
        gate: Some(gate.clone()),
        ..FakePbx::default()
    });
    let relay = relay(pbx.clone());

    let (a, mut a_rx) = connect(&relay).await;
    let offering = {
        let relay = relay.clone();
        tokio::spawn(async move { relay.on_inbound_message(a, offer("O1")).await })
    };

    pbx.entered.notified().await;
    relay.on_disconnect(a).await;
    assert_eq!(phase(&relay, a).await, Phase::Closing);
    assert_eq!(pbx.count("release"), 0);

    gate.notify_one();
    offering.await.unwrap();

    assert_eq!(pbx.count("release ch1 br1"), 1);
    assert!(!relay.registry().contains(a).await);
    assert!(a_rx.try_recv().is_err());

    relay.on_disconnect(a).await;
    assert_eq!(pbx.count("release"), 1);
}

#[tokio::test]
async fn test_violation_limit_during_allocation_keeps_client_registered() {
    let gate = Arc::new(Notify::new());
    let pbx = Arc::new(FakePbx {
        gate: Some(gate.clone()),
        ..FakePbx::default()
    });
    let relay = relay_with(
        pbx.clone(),
        RouterSettings {
            max_protocol_violations: 1,
            ..RouterSettings::default()
        },
    );

    let (a, mut a_rx) = connect(&relay).await;
    let offering = {
        let relay = relay.clone();
        tokio::spawn(async move { relay.on_inbound_message(a, offer("O1")).await })
    };

    pbx.entered.notified().await;
    relay.on_inbound_message(a, answer("A1")).await;
    assert_eq!(phase(&relay, a).await, Phase::Closing);

    gate.notify_one();
    offering.await.unwrap();

    assert_eq!(pbx.count("release ch1 br1"), 1);
    assert!(relay.registry().contains(a).await);
    assert_eq!(phase(&relay, a).await, Phase::Closed);

    // Still connected, so still told about rejected messages
    relay.on_inbound_message(a, offer("O2")).await;
    assert_eq!(
        error_codes(drain(&mut a_rx)),
        vec!["PROTOCOL_VIOLATION", "PROTOCOL_VIOLATION"]
    );

    relay.on_disconnect(a).await;
    assert!(!relay.registry().contains(a).await);
    assert_eq!(pbx.count("release"), 1);
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let pbx = Arc::new(FakePbx::default());
    let relay = relay(pbx.clone());

    let (a, _a_rx) = connect(&relay).await;
    relay.on_inbound_message(a, offer("O1")).await;

    relay.on_disconnect(a).await;
    relay.on_disconnect(a).await;

    assert_eq!(pbx.count("release"), 1);
    assert!(relay.registry().is_empty().await);
}

#[tokio::test]
async fn test_dead_transport_tears_down_pair() {
    let pbx = Arc::new(FakePbx::default());
    let relay = relay(pbx.clone());

    let (a, mut a_rx) = connect(&relay).await;
    relay.on_inbound_message(a, offer("O1")).await;

    relay.on_inbound_message(a, ice(1)).await;

    // Callee whose socket is already gone
    let (tx, rx) = mpsc::unbounded_channel();
    drop(rx);
    let b = SessionId::new();
    relay.on_connect(b, Arc::new(tx)).await.unwrap();

    // The offer was never answered, so the caller just waits again
    assert!(drain(&mut a_rx).is_empty());
    assert_eq!(pbx.count("release"), 0);
    assert!(!relay.registry().contains(b).await);
    assert!(relay.registry().get(a).await.unwrap().is_waiting_for_callee());

    let (_c, mut c_rx) = connect(&relay).await;
    assert_eq!(drain(&mut c_rx), vec![offer("O1"), ice(1)]);
}

#[tokio::test]
async fn test_dead_transport_after_answer_tears_down_pair() {
    let pbx = Arc::new(FakePbx::default());
    let relay = relay(pbx.clone());

    let (a, mut a_rx) = connect(&relay).await;
    relay.on_inbound_message(a, offer("O1")).await;
    let (b, b_rx) = connect(&relay).await;
    relay.on_inbound_message(b, answer("A1")).await;
    assert_eq!(drain(&mut a_rx), vec![answer("A1")]);

    drop(b_rx);
    relay.on_inbound_message(a, ice(1)).await;

    assert_eq!(drain(&mut a_rx), vec![SignalingMessage::Hangup]);
    assert_eq!(pbx.count("release ch1 br1"), 1);
    assert!(!relay.registry().contains(b).await);
    assert_eq!(phase(&relay, a).await, Phase::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connects_racing_an_allocation_are_all_reachable() {
    let gate = Arc::new(Notify::new());
    let pbx = Arc::new(FakePbx {
        gate: Some(gate.clone()),
        ..FakePbx::default()
    });
    let relay = relay(pbx.clone());

    let (a, mut a_rx) = connect(&relay).await;
    let offering = {
        let relay = relay.clone();
        tokio::spawn(async move { relay.on_inbound_message(a, offer("O1")).await })
    };
    pbx.entered.notified().await;

    let connects: Vec<_> = (0..16)
        .map(|_| {
            let relay = relay.clone();
            tokio::spawn(async move { connect(&relay).await })
        })
        .collect();
    gate.notify_one();
    offering.await.unwrap();

    let mut clients = Vec::new();
    for handle in connects {
        clients.push(handle.await.unwrap());
    }

    assert!(drain(&mut a_rx).is_empty());
    assert_eq!(pbx.count("release"), 0);
    let mut offers = 0;
    for (id, rx) in clients.iter_mut() {
        assert!(relay.registry().contains(*id).await);
        offers += drain(rx)
            .iter()
            .filter(|m| matches!(m, SignalingMessage::Offer { .. }))
            .count();
    }
    assert_eq!(offers, 1);
    assert!(relay.registry().get(a).await.unwrap().peer().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_candidates_and_hangup_keep_arrival_order() {
    let pbx = Arc::new(FakePbx::default());
    let relay = relay(pbx.clone());

    let (a, mut a_rx) = connect(&relay).await;
    relay.on_inbound_message(a, offer("O1")).await;
    let (b, mut b_rx) = connect(&relay).await;
    relay.on_inbound_message(b, answer("A1")).await;
    drain(&mut a_rx);
    drain(&mut b_rx);

    let caller_side = {
        let relay = relay.clone();
        tokio::spawn(async move {
            for n in 0..100 {
                relay.on_inbound_message(a, ice(n)).await;
            }
        })
    };
    let callee_side = {
        let relay = relay.clone();
        tokio::spawn(async move {
            for n in 1000..1100 {
                relay.on_inbound_message(b, ice(n)).await;
            }
            relay.on_disconnect(b).await;
        })
    };
    caller_side.await.unwrap();
    callee_side.await.unwrap();

    // Whatever reached the callee before it left is in order, once each
    let to_b = candidate_numbers(&drain(&mut b_rx));
    assert!(to_b.windows(2).all(|w| w[0] < w[1]));
    assert!(to_b.iter().all(|n| *n < 100));

    let to_a = drain(&mut a_rx);
    assert_eq!(candidate_numbers(&to_a), (1000..1100).collect::<Vec<_>>());
    assert_eq!(to_a.last(), Some(&SignalingMessage::Hangup));
    assert_eq!(
        to_a.iter().filter(|m| **m == SignalingMessage::Hangup).count(),
        1
    );
    assert_eq!(pbx.count("release"), 1);

    relay.on_disconnect(a).await;
    assert_eq!(pbx.count("release"), 1);
    assert!(relay.registry().is_empty().await);
}
