//! Shared harness: drive a full protocol run over the in-memory hub with
//! one thread per input peer and the function party on the test thread.
#![allow(dead_code)]

use std::thread;

use shroud_core::{
    FpHooks, FunctionParty, Mailbox, MemoryHub, MemoryMailbox, Matrix, PeerEngine, PeerHooks,
    ProtocolConfig, FP_ID,
};

pub struct PeerSpec {
    pub id: String,
    pub data: Matrix,
    pub labels: Option<Vec<f64>>,
}

impl PeerSpec {
    pub fn new(id: &str, data: Matrix) -> Self {
        Self {
            id: id.to_string(),
            data,
            labels: None,
        }
    }
}

pub struct TestPeerHooks {
    pub labels: Option<Vec<f64>>,
}

impl PeerHooks for TestPeerHooks {
    fn labels(&self) -> Option<Vec<f64>> {
        self.labels.clone()
    }

    fn answer_user_request(&mut self, spec: &serde_json::Value) -> serde_json::Value {
        // Mirrors the classic demo extension: shout the request back.
        serde_json::Value::String(spec.as_str().unwrap_or_default().to_uppercase())
    }
}

pub fn run_protocol(
    hub: &MemoryHub,
    specs: Vec<PeerSpec>,
    cfg: &ProtocolConfig,
    want_labels: bool,
) -> FunctionParty<MemoryMailbox, ()> {
    run_protocol_with(hub, specs, cfg, want_labels, ())
}

pub fn run_protocol_with<H: FpHooks>(
    hub: &MemoryHub,
    specs: Vec<PeerSpec>,
    cfg: &ProtocolConfig,
    want_labels: bool,
    fp_hooks: H,
) -> FunctionParty<MemoryMailbox, H> {
    let peer_ids: Vec<String> = specs.iter().map(|s| s.id.clone()).collect();
    let mut handles = Vec::new();
    for (i, spec) in specs.into_iter().enumerate() {
        let others: Vec<String> = peer_ids
            .iter()
            .filter(|p| **p != spec.id)
            .cloned()
            .collect();
        let mailbox = hub.endpoint(&spec.id);
        let cfg = cfg.clone();
        handles.push(thread::spawn(move || {
            let hooks = TestPeerHooks { labels: spec.labels };
            let mut peer = PeerEngine::with_seed(
                spec.id,
                others,
                spec.data,
                cfg,
                mailbox,
                hooks,
                [i as u8 + 1; 32],
            )
            .expect("peer setup");
            peer.run().expect("peer run");
        }));
    }

    let mut fp =
        FunctionParty::new(peer_ids, cfg.clone(), hub.endpoint(FP_ID), fp_hooks).expect("fp setup");
    fp.run(want_labels).expect("fp run");
    for handle in handles {
        handle.join().expect("peer thread panicked");
    }
    fp
}

/// Drain every message currently queued for an endpoint.
pub fn drain(mailbox: &mut MemoryMailbox) -> Vec<(String, shroud_core::WireMsg)> {
    let mut out = Vec::new();
    while let Some(item) = mailbox.recv() {
        out.push(item);
    }
    out
}
