//! Function party (aggregator) state machine.
//!
//! The FP drives an identical, planned request schedule against every peer:
//! own-Gram first, then one fragment pickup per other peer, then the
//! optional label and user-defined requests. Conversations are pipelined
//! per peer and stitched together by a self-message queue; a periodic
//! timeout check resends whatever request a quiet peer still owes an
//! answer to. Once every conversation has finished the FP broadcasts
//! teardown and the accumulated fragments can be assembled into the full
//! Gram matrix.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use log::{debug, info, warn};

use crate::config::ProtocolConfig;
use crate::mailbox::Mailbox;
use crate::matrix::Matrix;
use crate::messages::{
    FpRequest, PairingId, PeerGram, PeerId, PeerReply, ReplyBody, ReqKind, Unmasker, WireMsg,
};
use crate::{ProtocolError, FP_ID};

/// Deployment-supplied extension points of the aggregator.
pub trait FpHooks {
    /// Payloads for user-defined requests appended to the schedule.
    fn user_requests(&self) -> Vec<serde_json::Value> {
        Vec::new()
    }

    /// Consume a user-defined reply.
    fn handle_user_reply(&mut self, _peer: &str, _data: &serde_json::Value) {}
}

/// No-op hook set: plain Gram collection.
impl FpHooks for () {}

/// Messages the FP posts to itself to sequence the run.
#[derive(Debug, Clone)]
enum SelfMsg {
    StartConv(PeerId),
    TimeoutCheck,
    EndOnlinePhase,
}

#[derive(Debug)]
enum Event {
    Internal(SelfMsg),
    Net(PeerId, WireMsg),
}

/// Per-peer conversation progress.
#[derive(Debug, Clone)]
pub struct ConvState {
    /// Id of the request currently outstanding (answers below this are
    /// stale duplicates).
    pub cur_req_id: u64,
    pub last_request: Instant,
    pub still_active: bool,
}

pub struct FunctionParty<M: Mailbox, H: FpHooks> {
    peers: Vec<PeerId>,
    cfg: ProtocolConfig,
    mailbox: M,
    hooks: H,
    schedule: Vec<FpRequest>,
    states: HashMap<PeerId, ConvState>,
    /// Accumulated fragments keyed by ordered pairing id. Components add,
    /// unmaskers multiply; the diagonal stores `(G_pp, 0)`.
    pub parts: HashMap<PairingId, (Matrix, Unmasker)>,
    pub label_parts: HashMap<PeerId, Vec<f64>>,
    queue: VecDeque<Event>,
}

impl<M: Mailbox, H: FpHooks> FunctionParty<M, H> {
    pub fn new(
        peers: Vec<PeerId>,
        cfg: ProtocolConfig,
        mailbox: M,
        hooks: H,
    ) -> Result<Self, ProtocolError> {
        cfg.validate()?;
        let mut seen = std::collections::HashSet::new();
        for peer in &peers {
            if peer == FP_ID || !seen.insert(peer.clone()) {
                return Err(ProtocolError::DuplicatePeerId(peer.clone()));
            }
        }
        Ok(Self {
            peers,
            cfg,
            mailbox,
            hooks,
            schedule: Vec::new(),
            states: HashMap::new(),
            parts: HashMap::new(),
            label_parts: HashMap::new(),
            queue: VecDeque::new(),
        })
    }

    pub fn peers(&self) -> &[PeerId] {
        &self.peers
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn conversation_state(&self, peer: &str) -> Option<&ConvState> {
        self.states.get(peer)
    }

    /// Run the online phase to completion: every peer answers every
    /// scheduled request, then teardown is broadcast.
    pub fn run(&mut self, labels: bool) -> Result<(), ProtocolError> {
        self.start(labels);
        while self.step()? {}
        info!("function party gathered all data from the input peers");
        Ok(())
    }

    /// Plan the schedule and seed the event queue. Split from [`run`] so
    /// custom drivers and tests can pump events themselves.
    pub fn start(&mut self, labels: bool) {
        self.schedule = self.plan_requests(labels);
        debug!("function party schedule: {:?}", self.schedule);
        let now = Instant::now();
        self.states = self
            .peers
            .iter()
            .map(|p| {
                (
                    p.clone(),
                    ConvState {
                        cur_req_id: 0,
                        last_request: now,
                        still_active: true,
                    },
                )
            })
            .collect();
        for peer in &self.peers {
            self.queue
                .push_back(Event::Internal(SelfMsg::StartConv(peer.clone())));
        }
        self.queue.push_back(Event::Internal(SelfMsg::TimeoutCheck));
    }

    /// Process one event. Returns `false` once the queue has drained, which
    /// is the run's termination condition.
    pub fn step(&mut self) -> Result<bool, ProtocolError> {
        if let Some((sender, msg)) = self.mailbox.recv() {
            self.queue.push_back(Event::Net(sender, msg));
        }
        let Some(event) = self.queue.pop_front() else {
            return Ok(false);
        };
        match event {
            Event::Internal(msg) => self.handle_self_msg(msg)?,
            Event::Net(sender, WireMsg::Reply(reply)) => self.handle_reply(&sender, reply)?,
            Event::Net(sender, other) => {
                warn!("function party: unexpected message from {sender}, ignoring: {other:?}");
            }
        }
        Ok(true)
    }

    fn handle_self_msg(&mut self, msg: SelfMsg) -> Result<(), ProtocolError> {
        match msg {
            SelfMsg::StartConv(peer) => {
                info!("function party: starting conversation with {peer}");
                self.send_next(0, &peer)
            }
            SelfMsg::TimeoutCheck => {
                let mut ongoing = false;
                let timeout = self.cfg.timeout();
                let overdue: Vec<PeerId> = self
                    .states
                    .iter()
                    .filter(|(_, st)| st.still_active)
                    .inspect(|_| ongoing = true)
                    .filter(|(_, st)| st.last_request.elapsed() > timeout)
                    .map(|(p, _)| p.clone())
                    .collect();
                for peer in overdue {
                    let st = self.states.get_mut(&peer).expect("state exists");
                    let req = self.schedule[(st.cur_req_id - 1) as usize].clone();
                    info!(
                        "function party: timeout, resending request {} to {peer}",
                        req.request_id
                    );
                    st.last_request = Instant::now();
                    self.mailbox.send(&peer, WireMsg::Request(req))?;
                }
                if ongoing {
                    self.queue.push_back(Event::Internal(SelfMsg::TimeoutCheck));
                } else {
                    self.queue
                        .push_back(Event::Internal(SelfMsg::EndOnlinePhase));
                }
                Ok(())
            }
            SelfMsg::EndOnlinePhase => {
                info!("function party: ending online phase");
                let teardown = FpRequest::new(self.schedule.len() as u64 + 1, ReqKind::Teardown);
                for peer in self.peers.clone() {
                    self.mailbox.send(&peer, WireMsg::Request(teardown.clone()))?;
                }
                Ok(())
            }
        }
    }

    /// Accumulate one data reply and advance that peer's conversation.
    /// Public so custom drivers and tests can inject replies directly.
    pub fn handle_reply(&mut self, peer: &str, reply: PeerReply) -> Result<(), ProtocolError> {
        let Some(state) = self.states.get(peer) else {
            warn!("function party: reply from unknown sender {peer}, ignoring");
            return Ok(());
        };
        if state.cur_req_id > reply.request_id {
            debug!(
                "function party: stale reply {} from {peer}, ignoring",
                reply.request_id
            );
            return Ok(());
        }
        match reply.body {
            ReplyBody::OwnGram(gram) => {
                debug!("function party: own gram from {peer}");
                let zeros = Unmasker::Dense(gram.zeros_like());
                self.parts
                    .insert((peer.to_string(), peer.to_string()), (gram, zeros));
            }
            ReplyBody::AliceGram(pg) | ReplyBody::BobGram(pg) => {
                debug!(
                    "function party: fragment from {peer} for pair {:?}",
                    pg.pairing_id
                );
                self.accumulate(pg);
            }
            ReplyBody::Label(labels) => {
                debug!("function party: labels from {peer}");
                self.label_parts.insert(peer.to_string(), labels);
            }
            ReplyBody::UserDef(data) => {
                self.hooks.handle_user_reply(peer, &data);
            }
        }
        self.send_next(reply.request_id, peer)
    }

    fn accumulate(&mut self, fragment: PeerGram) {
        let PeerGram {
            pairing_id,
            component,
            unmasker,
        } = fragment;
        match self.parts.remove(&pairing_id) {
            Some((c, u)) => {
                self.parts
                    .insert(pairing_id, (c.add(&component), u.product(&unmasker)));
            }
            None => {
                self.parts.insert(pairing_id, (component, unmasker));
            }
        }
    }

    /// Send the request after `answered` to `peer`, or close the
    /// conversation when the schedule is exhausted. The cursor always moves
    /// past the answered id so late duplicates are recognized as stale.
    fn send_next(&mut self, answered: u64, peer: &str) -> Result<(), ProtocolError> {
        let nb_requests = self.schedule.len() as u64;
        let Some(state) = self.states.get_mut(peer) else {
            return Ok(());
        };
        state.cur_req_id = answered + 1;
        if answered >= nb_requests {
            state.still_active = false;
            info!("function party: conversation with {peer} finished");
            return Ok(());
        }
        state.last_request = Instant::now();
        let req = self.schedule[answered as usize].clone();
        self.mailbox.send(peer, WireMsg::Request(req))
    }

    fn plan_requests(&self, labels: bool) -> Vec<FpRequest> {
        let mut kinds: Vec<(ReqKind, Option<serde_json::Value>)> = vec![(ReqKind::YourGram, None)];
        kinds.extend(
            std::iter::repeat((ReqKind::NextPeerGram, None)).take(self.peers.len().saturating_sub(1)),
        );
        if labels {
            kinds.push((ReqKind::Label, None));
        }
        for spec in self.hooks.user_requests() {
            kinds.push((ReqKind::UserDef, Some(spec)));
        }
        kinds
            .into_iter()
            .enumerate()
            .map(|(i, (kind, spec))| FpRequest {
                request_id: i as u64 + 1,
                kind,
                spec,
            })
            .collect()
    }

    /// Assemble the full Gram matrix for the given peer order, defaulting
    /// to the run's own order. Missing orientations fall back to the
    /// transposed key.
    pub fn gram_matrix(&self) -> Result<Matrix, ProtocolError> {
        self.gram_matrix_for(&self.peers)
    }

    pub fn gram_matrix_for(&self, peers: &[PeerId]) -> Result<Matrix, ProtocolError> {
        let mut band_rows = Vec::with_capacity(peers.len());
        for p1 in peers {
            let mut blocks = Vec::with_capacity(peers.len());
            for p2 in peers {
                let key = (p1.clone(), p2.clone());
                let block = if let Some(entry) = self.parts.get(&key) {
                    Self::combine(entry, p1, p2)?
                } else {
                    let mirrored = (p2.clone(), p1.clone());
                    match self.parts.get(&mirrored) {
                        Some(entry) => Self::combine(entry, p2, p1)?.transpose(),
                        None => {
                            return Err(ProtocolError::MissingFragment(p1.clone(), p2.clone()))
                        }
                    }
                };
                blocks.push(block);
            }
            band_rows.push(Matrix::hcat(&blocks));
        }
        Ok(Matrix::vcat(&band_rows))
    }

    /// The stored tuple's two fields simply add: the diagonal pairs carry a
    /// zero correction, and a completed off-diagonal pair has folded the
    /// scalar unmasker into the dense one. A scalar left here means one of
    /// the pair's fragments never arrived.
    fn combine(
        (component, unmasker): &(Matrix, Unmasker),
        p1: &str,
        p2: &str,
    ) -> Result<Matrix, ProtocolError> {
        match unmasker {
            Unmasker::Dense(correction) => Ok(component.add(correction)),
            Unmasker::Scalar(_) => Err(ProtocolError::IncompleteFragment(
                p1.to_string(),
                p2.to_string(),
            )),
        }
    }

    /// Label vectors concatenated in peer order, if every peer delivered
    /// one.
    pub fn labels_concatenated(&self) -> Option<Vec<f64>> {
        let mut out = Vec::new();
        for peer in &self.peers {
            out.extend(self.label_parts.get(peer)?.iter().copied());
        }
        Some(out)
    }
}
