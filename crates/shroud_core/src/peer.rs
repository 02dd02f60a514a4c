//! Input peer state machine.
//!
//! A peer masks its row block once, pushes the role-appropriate exchange to
//! every other peer, then serves the function party's numbered requests
//! until teardown. All request handling is idempotent: the last reply is
//! kept and resent verbatim when the same request id arrives again, so the
//! aggregator may retry freely.

use std::collections::{HashSet, VecDeque};
use std::time::Instant;

use log::{debug, info, warn};
use rand::Rng;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha20Rng;

use crate::config::ProtocolConfig;
use crate::mailbox::Mailbox;
use crate::masking::{MaskedShare, Role};
use crate::matrix::Matrix;
use crate::messages::{FpRequest, PeerGram, PeerId, PeerMsg, PeerReply, ReplyBody, ReqKind, WireMsg};
use crate::{ProtocolError, FP_ID};

/// Deployment-supplied capabilities of a peer beyond its data block.
pub trait PeerHooks {
    /// Label vector for this peer's rows, if labels are part of the run.
    fn labels(&self) -> Option<Vec<f64>> {
        None
    }

    /// Answer a user-defined request. The default echoes null.
    fn answer_user_request(&mut self, _spec: &serde_json::Value) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Called once after the teardown request has been processed.
    fn on_teardown(&mut self) {}
}

/// No-op hook set for peers that only contribute data.
impl PeerHooks for () {}

pub struct PeerEngine<M: Mailbox, H: PeerHooks> {
    id: PeerId,
    peers: Vec<PeerId>,
    cfg: ProtocolConfig,
    mailbox: M,
    hooks: H,
    share: MaskedShare,
    /// Fragments ready for pickup, in the order the exchanges arrived.
    pending: VecDeque<ReplyBody>,
    /// Peers whose masked exchange has not arrived yet.
    awaiting: HashSet<PeerId>,
    last_reply: Option<PeerReply>,
    last_request_id: u64,
    last_timeout_check: Instant,
    teardown: bool,
}

impl<M: Mailbox, H: PeerHooks> PeerEngine<M, H> {
    /// Build a peer with a fresh random mask.
    pub fn new(
        id: impl Into<PeerId>,
        peers: Vec<PeerId>,
        data: Matrix,
        cfg: ProtocolConfig,
        mailbox: M,
        hooks: H,
    ) -> Result<Self, ProtocolError> {
        Self::with_seed(id, peers, data, cfg, mailbox, hooks, rand::thread_rng().gen())
    }

    /// Build a peer with a deterministic mask, for reproducible runs.
    pub fn with_seed(
        id: impl Into<PeerId>,
        peers: Vec<PeerId>,
        data: Matrix,
        cfg: ProtocolConfig,
        mailbox: M,
        hooks: H,
        seed: [u8; 32],
    ) -> Result<Self, ProtocolError> {
        let id = id.into();
        cfg.validate()?;
        let mut seen = HashSet::new();
        for peer in &peers {
            // Also rejects a peer id equal to our own.
            Role::between(&id, peer)?;
            if !seen.insert(peer.clone()) {
                return Err(ProtocolError::DuplicatePeerId(peer.clone()));
            }
        }
        let mut rng = ChaCha20Rng::from_seed(seed);
        let share = MaskedShare::sample(data, cfg.rand_min, cfg.rand_max, &mut rng);
        let awaiting = peers.iter().cloned().collect();
        Ok(Self {
            id,
            peers,
            cfg,
            mailbox,
            hooks,
            share,
            pending: VecDeque::new(),
            awaiting,
            last_reply: None,
            last_request_id: 0,
            last_timeout_check: Instant::now(),
            teardown: false,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn last_request_id(&self) -> u64 {
        self.last_request_id
    }

    pub fn pending_fragments(&self) -> usize {
        self.pending.len()
    }

    pub fn is_torn_down(&self) -> bool {
        self.teardown
    }

    /// Run the full peer lifecycle: share masked data, serve requests,
    /// tear down.
    pub fn run(&mut self) -> Result<(), ProtocolError> {
        for peer in self.peers.clone() {
            self.share_masked_data(&peer)?;
        }
        while !self.teardown {
            self.step()?;
        }
        debug!("peer {}: torn down", self.id);
        self.hooks.on_teardown();
        Ok(())
    }

    /// Handle at most one incoming message. Returns without doing anything
    /// when the mailbox is idle.
    pub fn step(&mut self) -> Result<(), ProtocolError> {
        let Some((sender, msg)) = self.mailbox.recv() else {
            return Ok(());
        };
        match msg {
            WireMsg::Request(req) if sender == FP_ID => self.handle_fp_request(req),
            WireMsg::Peer(pp) if self.peers.contains(&sender) => self.handle_peer_msg(&sender, pp),
            other => {
                warn!(
                    "peer {}: unexpected message from {sender}, ignoring: {other:?}",
                    self.id
                );
                Ok(())
            }
        }
    }

    /// Send the role-appropriate masked exchange to `peer`.
    pub fn share_masked_data(&mut self, peer: &str) -> Result<(), ProtocolError> {
        let msg = match Role::between(&self.id, peer)? {
            Role::Alice => self.share.alice_msg(),
            Role::Bob => self.share.bob_msg(),
        };
        self.mailbox.send(peer, WireMsg::Peer(msg))
    }

    /// Dispatch a request from the function party. Duplicate ids are
    /// answered from the stored reply; stale ids are dropped.
    pub fn handle_fp_request(&mut self, req: FpRequest) -> Result<(), ProtocolError> {
        self.timeout_check()?;
        if req.request_id < self.last_request_id {
            info!(
                "peer {}: request {} already answered, dropping",
                self.id, req.request_id
            );
            return Ok(());
        }
        if req.request_id == self.last_request_id {
            info!(
                "peer {}: request {} asked again, resending stored reply",
                self.id, req.request_id
            );
            if let Some(reply) = self.last_reply.clone() {
                self.mailbox.send(FP_ID, WireMsg::Reply(reply))?;
            }
            return Ok(());
        }
        match req.kind {
            ReqKind::YourGram => {
                debug!("peer {}: own gram requested", self.id);
                let gram = self.share.own_gram.clone();
                self.reply(req.request_id, ReplyBody::OwnGram(gram))
            }
            ReqKind::NextPeerGram => match self.pending.pop_front() {
                Some(body) => self.reply(req.request_id, body),
                None => {
                    // Not an error: the aggregator's timeout will retry once
                    // a fragment is ready. State must not advance.
                    info!(
                        "peer {}: fragment requested but none ready yet",
                        self.id
                    );
                    Ok(())
                }
            },
            ReqKind::Label => {
                let labels = match self.hooks.labels() {
                    Some(labels) => labels,
                    None => {
                        warn!("peer {}: labels requested but none configured", self.id);
                        Vec::new()
                    }
                };
                self.reply(req.request_id, ReplyBody::Label(labels))
            }
            ReqKind::UserDef => {
                let spec = req.spec.unwrap_or(serde_json::Value::Null);
                let answer = self.hooks.answer_user_request(&spec);
                self.reply(req.request_id, ReplyBody::UserDef(answer))
            }
            ReqKind::Teardown => {
                info!("peer {}: teardown requested", self.id);
                self.teardown = true;
                Ok(())
            }
        }
    }

    /// Dispatch a message from another peer.
    pub fn handle_peer_msg(&mut self, sender: &str, msg: PeerMsg) -> Result<(), ProtocolError> {
        match msg {
            PeerMsg::Request => {
                info!("peer {}: resend requested by {sender}", self.id);
                self.share_masked_data(sender)
            }
            _ if !self.awaiting.contains(sender) => {
                info!("peer {}: duplicate exchange from {sender}, dropping", self.id);
                Ok(())
            }
            PeerMsg::AliceMasked {
                masked_data,
                partial_unmasker,
            } => {
                debug!("peer {}: exchange from alice {sender}", self.id);
                let (component, unmasker) =
                    self.share.bob_fragment(&masked_data, &partial_unmasker);
                self.pending.push_back(ReplyBody::BobGram(PeerGram {
                    pairing_id: (sender.to_string(), self.id.clone()),
                    component,
                    unmasker,
                }));
                self.awaiting.remove(sender);
                Ok(())
            }
            PeerMsg::BobMasked { masked_data } => {
                debug!("peer {}: exchange from bob {sender}", self.id);
                let (component, unmasker) = self.share.alice_fragment(&masked_data);
                self.pending.push_back(ReplyBody::AliceGram(PeerGram {
                    pairing_id: (self.id.clone(), sender.to_string()),
                    component,
                    unmasker,
                }));
                self.awaiting.remove(sender);
                Ok(())
            }
        }
    }

    fn reply(&mut self, request_id: u64, body: ReplyBody) -> Result<(), ProtocolError> {
        let reply = PeerReply { request_id, body };
        self.last_reply = Some(reply.clone());
        self.last_request_id = request_id;
        self.mailbox.send(FP_ID, WireMsg::Reply(reply))
    }

    /// Re-request missing exchanges from peers that have gone quiet.
    /// Checked opportunistically whenever the function party talks to us.
    fn timeout_check(&mut self) -> Result<(), ProtocolError> {
        if self.last_timeout_check.elapsed() > self.cfg.timeout() {
            for peer in self.awaiting.clone() {
                info!(
                    "peer {}: still awaiting exchange from {peer}, sending resend request",
                    self.id
                );
                self.mailbox.send(&peer, WireMsg::Peer(PeerMsg::Request))?;
            }
        }
        self.last_timeout_check = Instant::now();
        Ok(())
    }
}
