//! Retry, duplicate, loss, and delay behavior. The transport is allowed to
//! drop, duplicate, and reorder across senders; the conversation must stay
//! idempotent and eventually deliver a correct matrix.

mod common;

use std::time::Duration;

use shroud_core::{
    FpRequest, FunctionParty, Mailbox, Matrix, MemoryHub, PeerEngine, PeerGram, PeerReply,
    ProtocolConfig, ReplyBody, ReqKind, Unmasker, WireMsg, FP_ID,
};

use common::{drain, run_protocol, PeerSpec, TestPeerHooks};

fn lossy_config() -> ProtocolConfig {
    ProtocolConfig {
        timeout_secs: 0.05,
        ..Default::default()
    }
}

fn test_peer(
    hub: &MemoryHub,
    id: &str,
    others: &[&str],
    data: Matrix,
) -> PeerEngine<shroud_core::MemoryMailbox, TestPeerHooks> {
    PeerEngine::with_seed(
        id,
        others.iter().map(|s| s.to_string()).collect(),
        data,
        lossy_config(),
        hub.endpoint(id),
        TestPeerHooks { labels: None },
        [id.as_bytes()[0]; 32],
    )
    .expect("peer setup")
}

#[test]
fn duplicate_requests_are_answered_identically_without_advancing() {
    let hub = MemoryHub::new();
    let mut alice = test_peer(&hub, "a", &["b"], Matrix::new(1, 1, vec![3.0]));
    let mut bob = test_peer(&hub, "b", &["a"], Matrix::new(1, 1, vec![4.0]));
    let mut fp_mailbox = hub.endpoint(FP_ID);

    // Deliver bob's exchange so alice holds one ready fragment.
    bob.share_masked_data("a").unwrap();
    alice.step().unwrap();
    assert_eq!(alice.pending_fragments(), 1);

    ask(&hub, &mut alice, FpRequest::new(1, ReqKind::YourGram));
    let first = drain(&mut fp_mailbox);
    assert_eq!(first.len(), 1);

    // Same id again: byte-identical resend, no state movement.
    ask(&hub, &mut alice, FpRequest::new(1, ReqKind::YourGram));
    let second = drain(&mut fp_mailbox);
    assert_eq!(
        serde_json::to_vec(&first[0].1).unwrap(),
        serde_json::to_vec(&second[0].1).unwrap()
    );
    assert_eq!(alice.last_request_id(), 1);
    assert_eq!(alice.pending_fragments(), 1);

    // The fragment pickup is idempotent too: the queue pops once.
    ask(&hub, &mut alice, FpRequest::new(2, ReqKind::NextPeerGram));
    ask(&hub, &mut alice, FpRequest::new(2, ReqKind::NextPeerGram));
    let replies = drain(&mut fp_mailbox);
    assert_eq!(replies.len(), 2);
    assert_eq!(
        serde_json::to_vec(&replies[0].1).unwrap(),
        serde_json::to_vec(&replies[1].1).unwrap()
    );
    assert_eq!(alice.pending_fragments(), 0);

    // A stale id is dropped outright.
    ask(&hub, &mut alice, FpRequest::new(1, ReqKind::YourGram));
    assert!(drain(&mut fp_mailbox).is_empty());
    assert_eq!(alice.last_request_id(), 2);
}

/// Deliver one request to alice as the function party and let her process
/// it.
fn ask(
    hub: &MemoryHub,
    engine: &mut PeerEngine<shroud_core::MemoryMailbox, TestPeerHooks>,
    req: FpRequest,
) {
    hub.endpoint(FP_ID)
        .send("a", WireMsg::Request(req))
        .unwrap();
    engine.step().unwrap();
}

#[test]
fn empty_fragment_queue_does_not_advance_the_conversation() {
    let hub = MemoryHub::new();
    let mut alice = test_peer(&hub, "a", &["b"], Matrix::new(1, 1, vec![5.0]));
    let mut bob = test_peer(&hub, "b", &["a"], Matrix::new(1, 1, vec![6.0]));
    let mut fp_mailbox = hub.endpoint(FP_ID);
    let mut fp_sender = hub.endpoint(FP_ID);

    fp_sender
        .send("a", WireMsg::Request(FpRequest::new(1, ReqKind::YourGram)))
        .unwrap();
    alice.step().unwrap();
    assert_eq!(drain(&mut fp_mailbox).len(), 1);

    // No exchange has arrived yet: the pickup request must go unanswered
    // and must not move the request cursor.
    fp_sender
        .send(
            "a",
            WireMsg::Request(FpRequest::new(2, ReqKind::NextPeerGram)),
        )
        .unwrap();
    alice.step().unwrap();
    assert!(drain(&mut fp_mailbox).is_empty());
    assert_eq!(alice.last_request_id(), 1);

    // Once the exchange lands, the retried request succeeds.
    bob.share_masked_data("a").unwrap();
    alice.step().unwrap();
    fp_sender
        .send(
            "a",
            WireMsg::Request(FpRequest::new(2, ReqKind::NextPeerGram)),
        )
        .unwrap();
    alice.step().unwrap();
    let replies = drain(&mut fp_mailbox);
    assert_eq!(replies.len(), 1);
    assert_eq!(alice.last_request_id(), 2);
    assert!(matches!(
        replies[0].1,
        WireMsg::Reply(PeerReply {
            request_id: 2,
            body: ReplyBody::AliceGram(_)
        })
    ));
}

#[test]
fn stale_replies_leave_the_accumulator_unchanged() {
    let hub = MemoryHub::new();
    let mut fp = FunctionParty::new(
        vec!["a".to_string(), "b".to_string()],
        lossy_config(),
        hub.endpoint(FP_ID),
        (),
    )
    .expect("fp setup");
    fp.start(false);

    let own_gram = Matrix::new(1, 1, vec![9.0]);
    fp.handle_reply(
        "a",
        PeerReply {
            request_id: 0,
            body: ReplyBody::OwnGram(own_gram.clone()),
        },
    )
    .unwrap();
    // StartConv has not run for this hand-driven check, so the cursor is
    // still at zero and the reply counts as current.
    assert_eq!(fp.parts.len(), 1);

    let fragment = PeerGram {
        pairing_id: ("a".to_string(), "b".to_string()),
        component: Matrix::new(1, 1, vec![1.0]),
        unmasker: Unmasker::Scalar(2.0),
    };
    fp.handle_reply(
        "a",
        PeerReply {
            request_id: 1,
            body: ReplyBody::AliceGram(fragment.clone()),
        },
    )
    .unwrap();
    let stored = fp.parts[&("a".to_string(), "b".to_string())].clone();

    // Replay of the same reply id must be recognized as stale: the cursor
    // advanced past it when it was first accumulated.
    fp.handle_reply(
        "a",
        PeerReply {
            request_id: 1,
            body: ReplyBody::AliceGram(fragment),
        },
    )
    .unwrap();
    assert_eq!(fp.parts[&("a".to_string(), "b".to_string())], stored);
}

#[test]
fn duplicate_of_the_final_reply_is_not_reaccumulated() {
    let hub = MemoryHub::new();
    let mut fp = FunctionParty::new(
        vec!["a".to_string(), "b".to_string()],
        lossy_config(),
        hub.endpoint(FP_ID),
        (),
    )
    .expect("fp setup");
    fp.start(false);
    // Schedule for two peers: own gram, then one fragment pickup.

    fp.handle_reply(
        "a",
        PeerReply {
            request_id: 1,
            body: ReplyBody::OwnGram(Matrix::new(1, 1, vec![4.0])),
        },
    )
    .unwrap();
    let last = PeerReply {
        request_id: 2,
        body: ReplyBody::AliceGram(PeerGram {
            pairing_id: ("a".to_string(), "b".to_string()),
            component: Matrix::new(1, 1, vec![1.0]),
            unmasker: Unmasker::Scalar(2.0),
        }),
    };
    fp.handle_reply("a", last.clone()).unwrap();
    let state = fp.conversation_state("a").expect("state").clone();
    assert!(!state.still_active);

    let stored = fp.parts[&("a".to_string(), "b".to_string())].clone();
    fp.handle_reply("a", last).unwrap();
    assert_eq!(
        fp.parts[&("a".to_string(), "b".to_string())],
        stored,
        "duplicated final reply must not double-accumulate"
    );
}

#[test]
fn lost_exchange_recovers_through_resend_requests() {
    let hub = MemoryHub::new();
    // Swallow the initial masked exchange from the Alice side; the Bob
    // side's opportunistic timeout must request a resend.
    hub.drop_next_matching(1, |_, _, msg| {
        matches!(
            msg,
            WireMsg::Peer(shroud_core::PeerMsg::AliceMasked { .. })
        )
    });

    let specs = vec![
        PeerSpec::new("client_1", Matrix::new(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])),
        PeerSpec::new("client_2", Matrix::new(1, 3, vec![0.5, -1.0, 2.0])),
    ];
    let data = Matrix::vcat(&[specs[0].data.clone(), specs[1].data.clone()]);
    let fp = run_protocol(&hub, specs, &lossy_config(), false);

    let gram = fp.gram_matrix().expect("assembly");
    assert!(gram.allclose(&data.matmul_nt(&data), 1e-6, 1e-6));
}

#[test]
fn delayed_exchanges_only_stall_the_run() {
    let hub = MemoryHub::new();
    // Hold every peer-to-peer message back; the aggregator will poll
    // fragment pickups into empty queues until the release.
    hub.hold_matching_for(Duration::from_millis(120), |_, _, msg| {
        matches!(msg, WireMsg::Peer(_))
    });

    let specs = vec![
        PeerSpec::new("client_1", Matrix::new(1, 2, vec![1.0, 2.0])),
        PeerSpec::new("client_2", Matrix::new(2, 2, vec![3.0, 4.0, 5.0, 6.0])),
        PeerSpec::new("client_3", Matrix::new(1, 2, vec![-1.0, 0.5])),
    ];
    let data = Matrix::vcat(&[
        specs[0].data.clone(),
        specs[1].data.clone(),
        specs[2].data.clone(),
    ]);
    let fp = run_protocol(&hub, specs, &lossy_config(), false);

    let gram = fp.gram_matrix().expect("assembly");
    assert!(gram.allclose(&data.matmul_nt(&data), 1e-6, 1e-6));
}
